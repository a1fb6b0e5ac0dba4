//! The HTTPS probe behind every preset test: fetch `https://{host}/`,
//! count bytes for a bounded window, accept whatever certificate the host
//! presents (the probe measures reachability, not trust).

use std::io::Read;
use std::time::{Duration, Instant};

use tracing::trace;

/// Read cap per probe; speed is computed over what arrived within it.
pub const MAX_PROBE_BYTES: u64 = 100 * 1024;

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes_read: u64,
    pub duration: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

pub trait ProbeClient: Send + Sync {
    fn fetch(&self, host: &str, timeout: Duration) -> FetchOutcome;
}

pub struct HttpProbeClient;

impl HttpProbeClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeClient for HttpProbeClient {
    fn fetch(&self, host: &str, timeout: Duration) -> FetchOutcome {
        let start = Instant::now();
        let fail = |error: String, start: Instant| FetchOutcome {
            bytes_read: 0,
            duration: start.elapsed(),
            status_code: None,
            error: Some(error),
        };

        let client = match reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(timeout / 2)
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .build()
        {
            Ok(c) => c,
            Err(e) => return fail(e.to_string(), start),
        };

        let url = format!("https://{host}/");
        trace!(url, ?timeout, "probe fetch");
        let response = match client.get(&url).send() {
            Ok(r) => r,
            Err(e) => return fail(e.to_string(), start),
        };
        let status = response.status().as_u16();

        let mut buf = Vec::new();
        let read = response
            .take(MAX_PROBE_BYTES)
            .read_to_end(&mut buf)
            .map(|n| n as u64);

        let duration = start.elapsed();
        match read {
            Ok(n) => FetchOutcome {
                bytes_read: n,
                duration,
                status_code: Some(status),
                error: None,
            },
            // a body error after some bytes still measures throughput
            Err(e) => FetchOutcome {
                bytes_read: buf.len() as u64,
                duration,
                status_code: Some(status),
                error: Some(e.to_string()),
            },
        }
    }
}
