//! One worker per netfilter queue. The loop reads a verdict request,
//! classifies the frame, and either accepts it untouched or replaces it
//! with a planned flight through the raw sender. Errors on this path are
//! logged and degrade to ACCEPT; only the queue bind is fatal.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nfq::{Queue, Verdict as NfVerdict};
use parking_lot::RwLock;
use rand::RngCore;
use tracing::{debug, error, info, trace, warn};

use super::flow::{ConnTracker, FlowKey, FlowTable};
use crate::capture::CaptureManager;
use crate::config::{Config, IncomingMode};
use crate::desync::{self, OutSegment, PacketView};
use crate::error::Error;
use crate::net::{checksum, ipv4_header_len, RawSender, IPV6_HEADER_LEN, UDP_HEADER_LEN};
use crate::sni::{dns, quic, tls, Matcher};

const HTTPS_PORT: u16 = 443;
const DNS_PORT: u16 = 53;
const SWEEP_INTERVAL: u64 = 512;

/// State shared by every worker of a pool.
pub struct Shared {
    pub config: RwLock<Arc<Config>>,
    pub matcher: RwLock<Arc<Matcher>>,
    pub conns: ConnTracker,
    pub capture: Arc<CaptureManager>,
    pub shutdown: AtomicBool,
}

impl Shared {
    pub fn new(cfg: Config, capture: Arc<CaptureManager>) -> Self {
        let union = cfg.domain_union();
        let matcher = Matcher::build(&cfg, &union);
        Self {
            config: RwLock::new(Arc::new(cfg)),
            matcher: RwLock::new(Arc::new(matcher)),
            conns: ConnTracker::new(),
            capture,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn matcher(&self) -> Arc<Matcher> {
        self.matcher.read().clone()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PacketVerdict {
    Accept,
    Drop,
}

/// What the dispatch decided: the verdict for the original packet plus any
/// frames to emit, each with its destination.
pub struct Action {
    pub verdict: PacketVerdict,
    pub emissions: Vec<(IpAddr, Vec<OutSegment>)>,
}

impl Action {
    fn accept() -> Self {
        Self {
            verdict: PacketVerdict::Accept,
            emissions: Vec::new(),
        }
    }

    fn accept_with(dst: IpAddr, plan: Vec<OutSegment>) -> Self {
        Self {
            verdict: PacketVerdict::Accept,
            emissions: vec![(dst, plan)],
        }
    }

    fn drop_with(dst: IpAddr, plan: Vec<OutSegment>) -> Self {
        Self {
            verdict: PacketVerdict::Drop,
            emissions: vec![(dst, plan)],
        }
    }
}

pub struct Worker {
    qnum: u16,
    shared: Arc<Shared>,
    flows: FlowTable,
    dns_nat: HashMap<(IpAddr, u16), IpAddr>,
    packets: u64,
}

impl Worker {
    pub fn new(qnum: u16, shared: Arc<Shared>) -> Self {
        Self {
            qnum,
            shared,
            flows: FlowTable::new(),
            dns_nat: HashMap::new(),
            packets: 0,
        }
    }

    /// Blocking verdict loop; returns when the shared shutdown flag flips.
    pub fn run(self) -> Result<(), Error> {
        let (sender, queue) = self.setup()?;
        self.run_loop(sender, queue)
    }

    /// Like `run`, but reports the bind outcome through `bind_tx` so the
    /// pool can fail fast when a queue cannot be claimed.
    pub(crate) fn run_with_bind_signal(
        self,
        bind_tx: &std::sync::mpsc::Sender<Result<(), Error>>,
    ) -> Result<(), Error> {
        match self.setup() {
            Ok((sender, queue)) => {
                let _ = bind_tx.send(Ok(()));
                self.run_loop(sender, queue)
            }
            Err(e) => {
                let _ = bind_tx.send(Err(e));
                Ok(())
            }
        }
    }

    fn setup(&self) -> Result<(RawSender, Queue), Error> {
        let sender = RawSender::new().map_err(Error::RawSend)?;
        let mut queue = Queue::open().map_err(|source| Error::QueueBind {
            queue: self.qnum,
            source,
        })?;
        queue.bind(self.qnum).map_err(|source| Error::QueueBind {
            queue: self.qnum,
            source,
        })?;
        info!(queue = self.qnum, "worker bound");
        Ok((sender, queue))
    }

    fn run_loop(mut self, sender: RawSender, mut queue: Queue) -> Result<(), Error> {
        while !self.shared.shutdown.load(Ordering::Relaxed) {
            let mut msg = match queue.recv() {
                Ok(msg) => msg,
                Err(e) => {
                    if !self.shared.shutdown.load(Ordering::Relaxed) {
                        trace!(queue = self.qnum, error = %e, "queue recv");
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            };

            let action = self.handle(msg.get_payload());
            for (dst, plan) in &action.emissions {
                emit_plan(&sender, *dst, plan);
            }
            msg.set_verdict(match action.verdict {
                PacketVerdict::Accept => NfVerdict::Accept,
                PacketVerdict::Drop => NfVerdict::Drop,
            });
            if let Err(e) = queue.verdict(msg) {
                warn!(queue = self.qnum, error = %e, "verdict write failed");
            }
        }

        info!(queue = self.qnum, "worker stopped");
        Ok(())
    }

    /// Classify one raw L3 frame. Pure with respect to sockets, so the
    /// tests drive it directly.
    pub fn handle(&mut self, raw: &[u8]) -> Action {
        self.packets += 1;
        if self.packets % SWEEP_INTERVAL == 0 {
            self.flows.sweep();
            self.shared.conns.sweep();
        }

        let cfg = self.shared.config();
        let version = raw.first().map(|b| b >> 4);
        let (v6, l3, proto) = match version {
            Some(4) => match ipv4_header_len(raw) {
                Some(ihl) => (false, ihl, raw[9]),
                None => return Action::accept(),
            },
            Some(6) => {
                if !cfg.queue.ipv6_enabled || raw.len() < IPV6_HEADER_LEN {
                    return Action::accept();
                }
                (true, IPV6_HEADER_LEN, raw[6])
            }
            _ => return Action::accept(),
        };

        match proto {
            6 => self.handle_tcp(&cfg, raw, v6, l3),
            17 => self.handle_udp(&cfg, raw, v6, l3),
            _ => Action::accept(),
        }
    }

    fn handle_tcp(&mut self, cfg: &Config, raw: &[u8], v6: bool, l3: usize) -> Action {
        let Some(view) = PacketView::parse(raw, v6) else {
            return Action::accept();
        };
        let (src, dst) = addrs(raw, v6);
        let sport = u16::from_be_bytes([raw[l3], raw[l3 + 1]]);
        let dport = u16::from_be_bytes([raw[l3 + 2], raw[l3 + 3]]);

        if sport == HTTPS_PORT {
            return self.handle_tcp_incoming(cfg, raw, &view, src, sport, dst, dport);
        }
        if dport == HTTPS_PORT {
            return self.handle_tcp_outgoing(cfg, raw, &view, src, sport, dst, dport);
        }
        Action::accept()
    }

    fn handle_tcp_outgoing(
        &mut self,
        cfg: &Config,
        raw: &[u8],
        view: &PacketView,
        src: IpAddr,
        sport: u16,
        dst: IpAddr,
        dport: u16,
    ) -> Action {
        let payload = view.payload(raw);
        if payload.is_empty() {
            return Action::accept();
        }

        let key = FlowKey {
            src,
            sport,
            dst,
            dport,
        };
        let entry = self.flows.entry(&key);

        // already classified: flows that matched keep their set for life,
        // flows that did not are plain passthrough
        if entry.seen_client_hello {
            let set_id = match &entry.set_id {
                Some(id) => id.clone(),
                None => return Action::accept(),
            };
            let Some(set) = cfg.set_by_id(&set_id).filter(|s| s.enabled) else {
                return Action::accept();
            };
            return match desync::plan_outgoing(set, raw, view.v6) {
                Some(plan) => Action::drop_with(dst, plan),
                None => Action::accept(),
            };
        }

        // assemble the ClientHello, possibly across segments
        let hello: Vec<u8>;
        if !entry.pending.is_empty() {
            entry.pending.extend_from_slice(payload);
            if entry.pending.len() < entry.pending_total {
                return Action::accept();
            }
            hello = std::mem::take(&mut entry.pending);
            entry.pending_total = 0;
        } else if let Some(total) = tls::pending_record_len(payload) {
            entry.pending = payload.to_vec();
            entry.pending_total = total;
            trace!(have = payload.len(), total, "buffering split hello");
            return Action::accept();
        } else {
            hello = payload.to_vec();
        }

        entry.seen_client_hello = true;

        let Some(span) = tls::locate_sni(&hello) else {
            return Action::accept();
        };
        let Some(host) = tls::sni_str(&hello, span) else {
            return Action::accept();
        };

        let matcher = self.shared.matcher();
        let Some(set_id) = matcher.match_host(host) else {
            trace!(host, "no matching set");
            return Action::accept();
        };
        let Some(set) = cfg.set_by_id(set_id).filter(|s| s.enabled) else {
            return Action::accept();
        };

        debug!(host, set = set_id, "sni matched");
        self.flows.entry(&key).set_id = Some(set_id.to_string());
        self.shared.conns.register(key, set_id);
        self.shared.capture.offer(host, "tls", &hello);

        match desync::plan_outgoing(set, raw, view.v6) {
            Some(plan) => Action::drop_with(dst, plan),
            None => Action::accept(),
        }
    }

    fn handle_tcp_incoming(
        &mut self,
        cfg: &Config,
        raw: &[u8],
        view: &PacketView,
        src: IpAddr,
        sport: u16,
        dst: IpAddr,
        dport: u16,
    ) -> Action {
        let payload_len = raw.len() - view.payload_start;
        if payload_len == 0 {
            return Action::accept();
        }

        let out_key = FlowKey {
            src: dst,
            sport: dport,
            dst: src,
            dport: sport,
        };
        let Some(set_id) = self.shared.conns.set_for_incoming(&out_key) else {
            return Action::accept();
        };
        let Some(set) = cfg.set_by_id(&set_id).filter(|s| s.enabled) else {
            return Action::accept();
        };

        let mode = set.tcp.incoming.mode;
        let fire = match mode {
            IncomingMode::Off => false,
            IncomingMode::Fake => true,
            _ => self
                .shared
                .conns
                .track(&out_key, payload_len as u64, &set.tcp.incoming),
        };
        if !fire {
            return Action::accept();
        }

        debug!(?mode, bytes = payload_len, "incoming disruption fires");
        let plan = desync::incoming::plan_disruption(set, raw, view, mode);
        if plan.is_empty() {
            return Action::accept();
        }
        // decoys go to the server, the original continues to the client
        Action::accept_with(src, plan)
    }

    fn handle_udp(&mut self, cfg: &Config, raw: &[u8], v6: bool, l3: usize) -> Action {
        if raw.len() < l3 + UDP_HEADER_LEN {
            return Action::accept();
        }
        let sport = u16::from_be_bytes([raw[l3], raw[l3 + 1]]);
        let dport = u16::from_be_bytes([raw[l3 + 2], raw[l3 + 3]]);
        let payload = &raw[l3 + UDP_HEADER_LEN..];

        if sport == DNS_PORT || dport == DNS_PORT {
            return self.handle_dns(cfg, raw, v6, l3, sport, dport, payload);
        }

        if dport == HTTPS_PORT {
            return self.handle_quic(cfg, raw, v6, l3, payload);
        }
        Action::accept()
    }

    fn handle_quic(
        &mut self,
        cfg: &Config,
        raw: &[u8],
        v6: bool,
        l3: usize,
        payload: &[u8],
    ) -> Action {
        if !quic::is_initial(payload) {
            return Action::accept();
        }
        let Some(host) = quic::extract_sni(payload) else {
            return Action::accept();
        };
        let matcher = self.shared.matcher();
        let Some(set_id) = matcher.match_host(&host) else {
            return Action::accept();
        };
        let Some(set) = cfg.set_by_id(set_id).filter(|s| s.enabled && s.udp.enabled) else {
            return Action::accept();
        };

        debug!(host = %host, set = set_id, "quic initial matched");
        self.shared.capture.offer(&host, "quic", payload);

        // decoy Initials with garbage payloads and a dying TTL, then the
        // real datagram
        let (_, dst) = addrs(raw, v6);
        let mut plan = Vec::with_capacity(set.udp.fake_count + 1);
        let mut rng = rand::thread_rng();
        for _ in 0..set.udp.fake_count.max(1) {
            let mut fake = raw.to_vec();
            rng.fill_bytes(&mut fake[l3 + UDP_HEADER_LEN..]);
            if v6 {
                fake[7] = set.udp.fake_ttl;
                checksum::fix_udp_v6(&mut fake);
            } else {
                fake[8] = set.udp.fake_ttl;
                checksum::fix_ipv4(&mut fake);
                checksum::fix_udp_v4(&mut fake, l3);
            }
            plan.push(OutSegment::immediate(fake));
        }
        plan.push(OutSegment::immediate(raw.to_vec()));
        Action::drop_with(dst, plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_dns(
        &mut self,
        cfg: &Config,
        raw: &[u8],
        v6: bool,
        l3: usize,
        sport: u16,
        dport: u16,
        payload: &[u8],
    ) -> Action {
        // query direction: reroute matching questions to the set's resolver
        if dport == DNS_PORT {
            let Some(domain) = dns::parse_query_name(payload) else {
                return Action::accept();
            };
            let matcher = self.shared.matcher();
            let Some(set_id) = matcher.match_host(&domain) else {
                return Action::accept();
            };
            let Some(set) = cfg.set_by_id(set_id).filter(|s| s.enabled) else {
                return Action::accept();
            };
            if !set.dns.enabled || set.dns.target.is_empty() {
                return Action::accept();
            }
            let Ok(target) = set.dns.target.parse::<IpAddr>() else {
                return Action::accept();
            };

            let (src, orig_dst) = addrs(raw, v6);
            let mut redirected = raw.to_vec();
            match (target, v6) {
                (IpAddr::V4(ip), false) => {
                    redirected[16..20].copy_from_slice(&ip.octets());
                    checksum::fix_ipv4(&mut redirected);
                    checksum::fix_udp_v4(&mut redirected, l3);
                }
                (IpAddr::V6(ip), true) => {
                    redirected[24..40].copy_from_slice(&ip.octets());
                    checksum::fix_udp_v6(&mut redirected);
                }
                _ => return Action::accept(), // family mismatch
            }

            info!(domain = %domain, target = %target, set = set_id, "dns redirect");
            self.dns_nat.insert((src, sport), orig_dst);
            return Action::drop_with(target, vec![OutSegment::immediate(redirected)]);
        }

        // reply direction: restore the resolver the client actually asked
        if sport == DNS_PORT {
            let (_, client) = addrs(raw, v6);
            if let Some(original) = self.dns_nat.remove(&(client, dport)) {
                let mut restored = raw.to_vec();
                match (original, v6) {
                    (IpAddr::V4(ip), false) => {
                        restored[12..16].copy_from_slice(&ip.octets());
                        checksum::fix_ipv4(&mut restored);
                        checksum::fix_udp_v4(&mut restored, l3);
                    }
                    (IpAddr::V6(ip), true) => {
                        restored[8..24].copy_from_slice(&ip.octets());
                        checksum::fix_udp_v6(&mut restored);
                    }
                    _ => return Action::accept(),
                }
                return Action::drop_with(client, vec![OutSegment::immediate(restored)]);
            }
        }

        Action::accept()
    }
}

fn addrs(raw: &[u8], v6: bool) -> (IpAddr, IpAddr) {
    if v6 {
        let src: [u8; 16] = raw[8..24].try_into().unwrap();
        let dst: [u8; 16] = raw[24..40].try_into().unwrap();
        (
            IpAddr::V6(Ipv6Addr::from(src)),
            IpAddr::V6(Ipv6Addr::from(dst)),
        )
    } else {
        let src: [u8; 4] = raw[12..16].try_into().unwrap();
        let dst: [u8; 4] = raw[16..20].try_into().unwrap();
        (
            IpAddr::V4(Ipv4Addr::from(src)),
            IpAddr::V4(Ipv4Addr::from(dst)),
        )
    }
}

fn emit_plan(sender: &RawSender, dst: IpAddr, plan: &[OutSegment]) {
    for seg in plan {
        if !seg.pause_before.is_zero() {
            std::thread::sleep(seg.pause_before);
        }
        let res = match dst {
            IpAddr::V4(ip) => sender.send_v4(&seg.frame, ip),
            IpAddr::V6(ip) => sender.send_v6(&seg.frame, ip),
        };
        if let Err(e) = res {
            error!(%dst, error = %e, "raw send failed, segment lost");
        }
    }
}
