//! Active DPI fingerprinting: a handful of cheap probes that watch *how*
//! a connection to the host dies, mapped onto the strategy families worth
//! trying first.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use super::presets::Family;
use crate::sni::tls;

const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const OVERALL_BUDGET: Duration = Duration::from_secs(30);
const RST_IMMEDIATE_WINDOW: Duration = Duration::from_millis(100);
/// Innocuous hostname for the control probe.
const BENIGN_SNI: &str = "www.wikipedia.org";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DpiType {
    None,
    RstImmediate,
    Timeout,
    TlsError,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Fingerprint {
    pub dpi: DpiType,
    pub recommended: Vec<Family>,
    pub optimal_ttl: Option<u8>,
}

impl Fingerprint {
    pub fn of(dpi: DpiType) -> Self {
        Self {
            dpi,
            recommended: recommended_families(dpi),
            optimal_ttl: None,
        }
    }
}

/// Families to lead with for a given failure mode. Empty means nothing is
/// known and everything gets tried in declaration order.
pub fn recommended_families(dpi: DpiType) -> Vec<Family> {
    match dpi {
        DpiType::RstImmediate => vec![Family::Desync, Family::FakeSni, Family::SynFake],
        DpiType::Timeout => vec![Family::TcpFrag, Family::TlsRec, Family::Oob],
        _ => Vec::new(),
    }
}

/// What one probe observed, separated from the socket work so the
/// classification is testable.
#[derive(Debug, Clone)]
pub(crate) enum Observation {
    ConnectFailed { error: String, elapsed: Duration },
    HandshakeDied { error: String, elapsed: Duration },
    ReadTimeout,
    Alert,
    ServerHello,
    Garbage,
}

pub(crate) fn classify(obs: &Observation) -> DpiType {
    match obs {
        Observation::ServerHello => DpiType::None,
        Observation::Alert => DpiType::TlsError,
        Observation::ReadTimeout => DpiType::Timeout,
        Observation::ConnectFailed { error, elapsed }
        | Observation::HandshakeDied { error, elapsed } => {
            let err = error.to_lowercase();
            if err.contains("reset") || err.contains("refused") {
                if *elapsed < RST_IMMEDIATE_WINDOW {
                    DpiType::RstImmediate
                } else {
                    DpiType::Unknown
                }
            } else if err.contains("timed out") || err.contains("timeout") {
                DpiType::Timeout
            } else {
                DpiType::Unknown
            }
        }
        Observation::Garbage => DpiType::Unknown,
    }
}

pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, domain: &str) -> Fingerprint;
}

pub struct DpiProber {
    probe_timeout: Duration,
    budget: Duration,
}

impl DpiProber {
    pub fn new() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            budget: OVERALL_BUDGET,
        }
    }

    /// One connect + ClientHello probe against `host:443` announcing
    /// `sni`, watching the first response bytes.
    fn probe(&self, host: &str, sni: &str) -> Observation {
        let start = Instant::now();

        let addr = match (host, 443u16).to_socket_addrs().ok().and_then(|mut a| a.next()) {
            Some(addr) => addr,
            None => {
                return Observation::ConnectFailed {
                    error: "resolution failed".into(),
                    elapsed: start.elapsed(),
                }
            }
        };

        let mut stream = match TcpStream::connect_timeout(&addr, self.probe_timeout) {
            Ok(s) => s,
            Err(e) => {
                return Observation::ConnectFailed {
                    error: e.to_string(),
                    elapsed: start.elapsed(),
                }
            }
        };
        let _ = stream.set_read_timeout(Some(self.probe_timeout));
        let _ = stream.set_write_timeout(Some(self.probe_timeout));

        let hello = tls::build_client_hello(sni);
        if let Err(e) = stream.write_all(&hello) {
            return Observation::HandshakeDied {
                error: e.to_string(),
                elapsed: start.elapsed(),
            };
        }

        let mut first = [0u8; 1];
        match stream.read(&mut first) {
            Ok(0) => Observation::HandshakeDied {
                error: "connection reset".into(),
                elapsed: start.elapsed(),
            },
            Ok(_) => match first[0] {
                0x16 => Observation::ServerHello,
                0x15 => Observation::Alert,
                _ => Observation::Garbage,
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Observation::ReadTimeout
            }
            Err(e) => Observation::HandshakeDied {
                error: e.to_string(),
                elapsed: start.elapsed(),
            },
        }
    }
}

impl Default for DpiProber {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter for DpiProber {
    fn fingerprint(&self, domain: &str) -> Fingerprint {
        let started = Instant::now();

        let real = self.probe(domain, domain);
        let dpi = classify(&real);
        debug!(?real, ?dpi, "real-sni probe");

        if dpi == DpiType::None {
            return Fingerprint::of(DpiType::None);
        }

        // control probe: same endpoint, harmless hostname. if that one
        // dies the same way the path itself is broken, not the hostname
        if started.elapsed() + self.probe_timeout < self.budget {
            let control = self.probe(domain, BENIGN_SNI);
            let control_dpi = classify(&control);
            debug!(?control_dpi, "benign-sni probe");
            if control_dpi == dpi {
                info!(domain, "control probe fails identically; not targeted interference");
                return Fingerprint::of(DpiType::None);
            }
        }

        info!(domain, ?dpi, "dpi fingerprint");
        Fingerprint::of(dpi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_hello_means_no_dpi() {
        assert_eq!(classify(&Observation::ServerHello), DpiType::None);
    }

    #[test]
    fn quick_reset_is_rst_immediate() {
        let obs = Observation::HandshakeDied {
            error: "Connection reset by peer".into(),
            elapsed: Duration::from_millis(12),
        };
        assert_eq!(classify(&obs), DpiType::RstImmediate);
    }

    #[test]
    fn slow_reset_is_not_immediate() {
        let obs = Observation::HandshakeDied {
            error: "connection reset".into(),
            elapsed: Duration::from_millis(900),
        };
        assert_eq!(classify(&obs), DpiType::Unknown);
    }

    #[test]
    fn timeouts_map_to_timeout() {
        assert_eq!(classify(&Observation::ReadTimeout), DpiType::Timeout);
        let obs = Observation::ConnectFailed {
            error: "connection timed out".into(),
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(classify(&obs), DpiType::Timeout);
    }

    #[test]
    fn alert_maps_to_tls_error() {
        assert_eq!(classify(&Observation::Alert), DpiType::TlsError);
    }

    #[test]
    fn family_mapping_follows_failure_mode() {
        assert_eq!(
            recommended_families(DpiType::RstImmediate),
            vec![Family::Desync, Family::FakeSni, Family::SynFake]
        );
        assert_eq!(
            recommended_families(DpiType::Timeout),
            vec![Family::TcpFrag, Family::TlsRec, Family::Oob]
        );
        assert!(recommended_families(DpiType::None).is_empty());
        assert!(recommended_families(DpiType::Unknown).is_empty());
    }
}
