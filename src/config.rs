use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration. One `SetConfig` per policy unit; a packet is handled
/// by the first enabled set whose target list matches its SNI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub domains: DomainsConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default = "default_sets")]
    pub sets: Vec<SetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First netfilter queue number; workers bind `start_num..start_num+threads`.
    #[serde(default = "default_queue_start")]
    pub start_num: u16,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub ipv6_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainsConfig {
    /// Manually configured SNI patterns, merged into every enabled set's
    /// match universe. Supports suffixes and `regexp:` entries.
    #[serde(default)]
    pub sni_domains: Vec<String>,
    #[serde(default)]
    pub geosite_path: String,
    #[serde(default)]
    pub geosite_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Full per-probe timeout, used for the retry after a quick-fail fetch.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Settle time between a config swap and the probe that exercises it.
    #[serde(default = "default_propagate_ms")]
    pub config_propagate_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub fragmentation: FragmentationConfig,
    #[serde(default)]
    pub faking: FakingConfig,
    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetsConfig {
    #[serde(default)]
    pub sni_domains: Vec<String>,
    #[serde(default)]
    pub domains_to_match: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Pause between the two halves of a split flight, milliseconds.
    #[serde(default)]
    pub seg2_delay_ms: u64,
    /// Emit the post-desync RST burst after the real flight.
    #[serde(default)]
    pub post_desync_rst: bool,
    #[serde(default)]
    pub incoming: IncomingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingConfig {
    #[serde(default)]
    pub mode: IncomingMode,
    #[serde(default = "default_fake_count")]
    pub fake_count: usize,
    #[serde(default = "default_fake_ttl")]
    pub fake_ttl: u8,
    #[serde(default)]
    pub strategy: FakingStrategy,
    /// Byte-count threshold window, KiB. A fresh threshold is drawn
    /// uniformly from `[min_kb, max_kb]` after every fire.
    #[serde(default = "default_inc_kb")]
    pub min_kb: usize,
    #[serde(default = "default_inc_kb")]
    pub max_kb: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Gate for the QUIC Initial inspection path.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fake_count")]
    pub fake_count: usize,
    #[serde(default = "default_fake_ttl")]
    pub fake_ttl: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentationConfig {
    #[serde(default)]
    pub strategy: Strategy,
    /// Absolute split offset into the TCP payload; overridden by
    /// `middle_sni` when the hostname can be located.
    #[serde(default = "default_sni_position")]
    pub sni_position: usize,
    #[serde(default)]
    pub reverse_order: bool,
    #[serde(default)]
    pub middle_sni: bool,
    #[serde(default = "default_sni_position")]
    pub oob_position: usize,
    #[serde(default = "default_oob_char")]
    pub oob_char: u8,
    #[serde(default)]
    pub disorder: DisorderConfig,
    #[serde(default)]
    pub combo: ComboConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisorderConfig {
    #[serde(default)]
    pub shuffle_mode: ShuffleMode,
    #[serde(default = "default_min_jitter_us")]
    pub min_jitter_us: u64,
    #[serde(default = "default_max_jitter_us")]
    pub max_jitter_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboConfig {
    #[serde(default = "default_true")]
    pub first_byte_split: bool,
    #[serde(default = "default_true")]
    pub extension_split: bool,
    #[serde(default)]
    pub shuffle_mode: ShuffleMode,
    #[serde(default = "default_first_delay_ms")]
    pub first_delay_ms: u64,
    #[serde(default = "default_jitter_max_us")]
    pub jitter_max_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakingConfig {
    /// Pre-emit decoy ClientHello segments before the real flight.
    #[serde(default)]
    pub sni: bool,
    #[serde(default = "default_fake_ttl")]
    pub ttl: u8,
    #[serde(default)]
    pub strategy: FakingStrategy,
    #[serde(default)]
    pub payload: FakePayload,
    #[serde(default = "default_fake_count")]
    pub fake_count: usize,
    /// Hex-encoded override for the decoy payload.
    #[serde(default)]
    pub custom_payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Resolver the matching queries are re-routed to.
    #[serde(default)]
    pub target: String,
}

/// Outbound transformation applied to a matched ClientHello flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    None,
    Tcp,
    Disorder,
    Oob,
    Combo,
    Synfake,
    Sack,
    Delay,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FakingStrategy {
    /// Decoy sequence rewound past the window; checksums left valid.
    #[default]
    Pastseq,
    /// No field corruption, the low TTL does the work.
    Tcp4,
    Rand,
    Badsum,
    Badseq,
    Badack,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncomingMode {
    #[default]
    Off,
    Fake,
    Reset,
    Fin,
    Desync,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// Shuffle interior segments, keep first and last in place.
    #[default]
    Middle,
    Full,
    Reverse,
}

/// Built-in decoy payload flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FakePayload {
    #[default]
    Google,
    Duckduckgo,
    Custom,
}

fn default_true() -> bool {
    true
}
fn default_queue_start() -> u16 {
    537
}
fn default_threads() -> usize {
    1
}
fn default_probe_timeout_ms() -> u64 {
    10_000
}
fn default_propagate_ms() -> u64 {
    300
}
fn default_fake_count() -> usize {
    3
}
fn default_fake_ttl() -> u8 {
    8
}
fn default_inc_kb() -> usize {
    14
}
fn default_sni_position() -> usize {
    1
}
fn default_oob_char() -> u8 {
    b'x'
}
fn default_min_jitter_us() -> u64 {
    1000
}
fn default_max_jitter_us() -> u64 {
    3000
}
fn default_first_delay_ms() -> u64 {
    100
}
fn default_jitter_max_us() -> u64 {
    2000
}

fn default_sets() -> Vec<SetConfig> {
    vec![SetConfig::named("main", "Main")]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            domains: DomainsConfig::default(),
            discovery: DiscoveryConfig::default(),
            sets: default_sets(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            start_num: default_queue_start(),
            threads: default_threads(),
            ipv6_enabled: false,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            config_propagate_ms: default_propagate_ms(),
        }
    }
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            mode: IncomingMode::Off,
            fake_count: default_fake_count(),
            fake_ttl: default_fake_ttl(),
            strategy: FakingStrategy::default(),
            min_kb: default_inc_kb(),
            max_kb: default_inc_kb(),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fake_count: default_fake_count(),
            fake_ttl: default_fake_ttl(),
        }
    }
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::None,
            sni_position: default_sni_position(),
            reverse_order: false,
            middle_sni: false,
            oob_position: default_sni_position(),
            oob_char: default_oob_char(),
            disorder: DisorderConfig::default(),
            combo: ComboConfig::default(),
        }
    }
}

impl Default for DisorderConfig {
    fn default() -> Self {
        Self {
            shuffle_mode: ShuffleMode::Middle,
            min_jitter_us: default_min_jitter_us(),
            max_jitter_us: default_max_jitter_us(),
        }
    }
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            first_byte_split: true,
            extension_split: true,
            shuffle_mode: ShuffleMode::Middle,
            first_delay_ms: default_first_delay_ms(),
            jitter_max_us: default_jitter_max_us(),
        }
    }
}

impl Default for FakingConfig {
    fn default() -> Self {
        Self {
            sni: false,
            ttl: default_fake_ttl(),
            strategy: FakingStrategy::default(),
            payload: FakePayload::default(),
            fake_count: default_fake_count(),
            custom_payload: String::new(),
        }
    }
}

impl SetConfig {
    pub fn named(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            targets: TargetsConfig::default(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            fragmentation: FragmentationConfig::default(),
            faking: FakingConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let cfg: Config =
            serde_json::from_str(&raw).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        fs::write(path, raw).map_err(|e| Error::ConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.threads == 0 {
            return Err(Error::ConfigInvalid("queue.threads must be >= 1".into()));
        }
        if self.sets.is_empty() {
            return Err(Error::ConfigInvalid("at least one set is required".into()));
        }
        for set in &self.sets {
            if set.id.is_empty() {
                return Err(Error::ConfigInvalid("set id must not be empty".into()));
            }
            let inc = &set.tcp.incoming;
            if inc.max_kb != 0 && inc.max_kb < inc.min_kb {
                return Err(Error::ConfigInvalid(format!(
                    "set {}: incoming.max_kb < incoming.min_kb",
                    set.id
                )));
            }
            if set.faking.payload == FakePayload::Custom
                && hex::decode(&set.faking.custom_payload).is_err()
            {
                return Err(Error::ConfigInvalid(format!(
                    "set {}: faking.custom_payload is not valid hex",
                    set.id
                )));
            }
        }
        Ok(())
    }

    /// All SNI patterns the workers should match on: the manual domain set
    /// plus every enabled set's targets. Duplicates removed, order kept.
    pub fn domain_union(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut union = Vec::new();
        let all = self
            .domains
            .sni_domains
            .iter()
            .chain(self.sets.iter().filter(|s| s.enabled).flat_map(|s| {
                s.targets
                    .sni_domains
                    .iter()
                    .chain(s.targets.domains_to_match.iter())
            }));
        for d in all {
            if seen.insert(d.clone()) {
                union.push(d.clone());
            }
        }
        union
    }

    pub fn set_by_id(&self, id: &str) -> Option<&SetConfig> {
        self.sets.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn empty_object_gets_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.queue.threads, 1);
        assert_eq!(cfg.sets.len(), 1);
        assert!(cfg.sets[0].enabled);
    }

    #[test]
    fn strategy_names_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&Strategy::Disorder).unwrap(),
            "\"disorder\""
        );
        assert_eq!(
            serde_json::from_str::<FakingStrategy>("\"badseq\"").unwrap(),
            FakingStrategy::Badseq
        );
    }

    #[test]
    fn validate_rejects_zero_threads() {
        let mut cfg = Config::default();
        cfg.queue.threads = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_threshold_window() {
        let mut cfg = Config::default();
        cfg.sets[0].tcp.incoming.min_kb = 20;
        cfg.sets[0].tcp.incoming.max_kb = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn domain_union_dedups_across_sets() {
        let mut cfg = Config::default();
        cfg.domains.sni_domains = vec!["example.com".into()];
        cfg.sets[0].targets.sni_domains = vec!["example.com".into(), "other.org".into()];
        assert_eq!(cfg.domain_union(), vec!["example.com", "other.org"]);
    }

    #[test]
    fn disabled_set_excluded_from_union() {
        let mut cfg = Config::default();
        cfg.sets[0].enabled = false;
        cfg.sets[0].targets.sni_domains = vec!["hidden.example".into()];
        assert!(cfg.domain_union().is_empty());
    }
}
