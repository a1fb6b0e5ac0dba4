use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;

use crate::config::IncomingConfig;

pub const FLOW_TTL: Duration = Duration::from_secs(5);
pub const FLOW_LIMIT: usize = 2048;
pub const CONN_TTL: Duration = Duration::from_secs(120);

/// Client-to-server four-tuple. The return direction is looked up through
/// `reversed()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

impl FlowKey {
    pub fn reversed(&self) -> FlowKey {
        FlowKey {
            src: self.dst,
            sport: self.dport,
            dst: self.src,
            dport: self.sport,
        }
    }
}

#[derive(Debug)]
pub struct FlowEntry {
    /// Set chosen at SNI-match time; never changes afterwards.
    pub set_id: Option<String>,
    pub seen_client_hello: bool,
    /// Partial ClientHello captured across segments, with the record's
    /// declared total length.
    pub pending: Vec<u8>,
    pub pending_total: usize,
    last_seen: Instant,
}

impl FlowEntry {
    fn new() -> Self {
        Self {
            set_id: None,
            seen_client_hello: false,
            pending: Vec::new(),
            pending_total: 0,
            last_seen: Instant::now(),
        }
    }
}

/// Per-worker flow table; single-threaded, bounded, TTL-evicted.
pub struct FlowTable {
    entries: HashMap<FlowKey, FlowEntry>,
    ttl: Duration,
    limit: usize,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::with_limits(FLOW_TTL, FLOW_LIMIT)
    }

    pub fn with_limits(ttl: Duration, limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            limit,
        }
    }

    pub fn entry(&mut self, key: &FlowKey) -> &mut FlowEntry {
        if !self.entries.contains_key(key) && self.entries.len() >= self.limit {
            self.sweep();
            if self.entries.len() >= self.limit {
                // still full of live flows; drop the stalest one
                if let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_seen)
                    .map(|(k, _)| k.clone())
                {
                    self.entries.remove(&oldest);
                }
            }
        }
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(FlowEntry::new);
        entry.last_seen = Instant::now();
        entry
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &FlowKey) {
        self.entries.remove(key);
    }

    pub fn sweep(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.last_seen.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ConnInfo {
    set_id: String,
    bytes_in: u64,
    threshold: u64,
    last_seen: Instant,
}

/// Shared return-direction tracker. Registered by the outbound path at
/// SNI-match time, consumed by the incoming path for byte-count-triggered
/// disruption. One instance per pool, hot-path reads under a short lock.
pub struct ConnTracker {
    conns: RwLock<HashMap<FlowKey, ConnInfo>>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: FlowKey, set_id: &str) {
        self.conns.write().insert(
            key,
            ConnInfo {
                set_id: set_id.to_string(),
                bytes_in: 0,
                threshold: 0,
                last_seen: Instant::now(),
            },
        );
    }

    /// Set chosen for the outbound direction of `out_key`, refreshing the
    /// entry's liveness.
    pub fn set_for_incoming(&self, out_key: &FlowKey) -> Option<String> {
        let mut conns = self.conns.write();
        let info = conns.get_mut(out_key)?;
        info.last_seen = Instant::now();
        Some(info.set_id.clone())
    }

    /// Account `bytes` of server→client payload. Returns true exactly when
    /// this increment crosses the sampled threshold; the counter and the
    /// threshold reset on fire so the next crossing is re-sampled.
    pub fn track(&self, out_key: &FlowKey, bytes: u64, inc: &IncomingConfig) -> bool {
        let mut conns = self.conns.write();
        let Some(info) = conns.get_mut(out_key) else {
            return false;
        };

        if info.threshold == 0 {
            let mut min_kb = inc.min_kb;
            let mut max_kb = inc.max_kb;
            if min_kb == 0 {
                min_kb = 14;
                max_kb = 14;
            }
            if max_kb < min_kb {
                max_kb = min_kb;
            }
            let kb = if min_kb == max_kb {
                min_kb
            } else {
                rand::thread_rng().gen_range(min_kb..=max_kb)
            };
            info.threshold = (kb * 1024) as u64;
        }

        let prev = info.bytes_in;
        info.bytes_in += bytes;
        info.last_seen = Instant::now();

        if prev < info.threshold && info.bytes_in >= info.threshold {
            info.bytes_in = 0;
            info.threshold = 0;
            return true;
        }
        false
    }

    pub fn sweep(&self) {
        self.conns
            .write()
            .retain(|_, info| info.last_seen.elapsed() <= CONN_TTL);
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            sport: port,
            dst: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            dport: 443,
        }
    }

    fn inc(min_kb: usize, max_kb: usize) -> IncomingConfig {
        IncomingConfig {
            min_kb,
            max_kb,
            ..Default::default()
        }
    }

    #[test]
    fn reversed_key_swaps_both_sides() {
        let k = key(40000);
        let r = k.reversed();
        assert_eq!(r.src, k.dst);
        assert_eq!(r.dport, k.sport);
        assert_eq!(r.reversed(), k);
    }

    #[test]
    fn tracker_fires_once_per_threshold_crossing() {
        let t = ConnTracker::new();
        let k = key(40001);
        t.register(k.clone(), "main");

        let cfg = inc(3, 3); // fixed 3072-byte threshold
        assert!(!t.track(&k, 1500, &cfg));
        assert!(!t.track(&k, 1500, &cfg));
        assert!(t.track(&k, 1500, &cfg)); // 4500 crosses 3072
        assert!(!t.track(&k, 500, &cfg)); // counters reset, below fresh threshold
    }

    #[test]
    fn tracker_resamples_threshold_after_fire() {
        let t = ConnTracker::new();
        let k = key(40002);
        t.register(k.clone(), "main");

        let cfg = inc(1, 1);
        assert!(t.track(&k, 2048, &cfg));
        // next window needs a full fresh kilobyte again
        assert!(!t.track(&k, 512, &cfg));
        assert!(t.track(&k, 600, &cfg));
    }

    #[test]
    fn tracker_defaults_zero_window_to_14kb() {
        let t = ConnTracker::new();
        let k = key(40003);
        t.register(k.clone(), "main");

        let cfg = inc(0, 0);
        assert!(!t.track(&k, 14 * 1024 - 1, &cfg));
        assert!(t.track(&k, 1, &cfg));
    }

    #[test]
    fn tracker_ignores_unregistered_flows() {
        let t = ConnTracker::new();
        assert!(!t.track(&key(40004), 10_000, &inc(1, 1)));
    }

    #[test]
    fn sampled_threshold_stays_in_window() {
        let t = ConnTracker::new();
        let cfg = inc(2, 4);
        for port in 41000..41050 {
            let k = key(port);
            t.register(k.clone(), "main");
            // 2 KiB - 1 can never cross; topping up past 4 KiB always does
            assert!(!t.track(&k, 2 * 1024 - 1, &cfg));
            assert!(t.track(&k, 2 * 1024 + 2, &cfg));
        }
    }

    #[test]
    fn flow_table_respects_limit() {
        let mut table = FlowTable::with_limits(Duration::from_secs(600), 8);
        for port in 0..32 {
            table.entry(&key(port));
        }
        assert!(table.len() <= 8);
    }

    #[test]
    fn flow_table_sweep_drops_idle_entries() {
        let mut table = FlowTable::with_limits(Duration::from_millis(0), 8);
        table.entry(&key(1));
        std::thread::sleep(Duration::from_millis(2));
        table.sweep();
        assert!(table.is_empty());
    }

    #[test]
    fn chosen_set_persists_on_entry() {
        let mut table = FlowTable::new();
        table.entry(&key(2)).set_id = Some("main".into());
        assert_eq!(
            table.entry(&key(2)).set_id.as_deref(),
            Some("main"),
            "revisiting a flow must not clear its set"
        );
    }
}
