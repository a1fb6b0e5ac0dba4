//! Best-effort payload capture. Workers offer every matched ClientHello;
//! sessions filter by domain and protocol and persist the bytes under the
//! capture directory as `.bin` plus `.hex`/`.txt` siblings.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct CapturedPayload {
    pub protocol: String,
    pub domain: String,
    pub unix_time: u64,
    pub size: usize,
    pub path: PathBuf,
    pub hex: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSession {
    pub id: String,
    /// Target domain, `*` for any.
    pub domain: String,
    /// `tls`, `quic` or `both`.
    pub protocol: String,
    pub max_packets: usize,
    pub count: usize,
    pub active: bool,
    pub captures: Vec<CapturedPayload>,
}

impl CaptureSession {
    fn wants(&self, domain: &str, protocol: &str) -> bool {
        self.active
            && self.count < self.max_packets
            && (self.domain == "*" || self.domain == domain)
            && (self.protocol == "both" || self.protocol == protocol)
    }
}

pub struct CaptureManager {
    sessions: RwLock<Vec<CaptureSession>>,
    output_dir: PathBuf,
    next_id: RwLock<u64>,
}

impl CaptureManager {
    pub fn new(output_dir: PathBuf) -> Self {
        if let Err(e) = fs::create_dir_all(&output_dir) {
            warn!(dir = %output_dir.display(), error = %e, "capture dir unavailable");
        }
        Self {
            sessions: RwLock::new(Vec::new()),
            output_dir,
            next_id: RwLock::new(1),
        }
    }

    pub fn start(&self, domain: &str, protocol: &str, max_packets: usize) -> CaptureSession {
        let mut next = self.next_id.write();
        let id = format!("cap_{}", *next);
        *next += 1;

        let session = CaptureSession {
            id,
            domain: domain.to_string(),
            protocol: protocol.to_string(),
            max_packets: max_packets.max(1),
            count: 0,
            active: true,
            captures: Vec::new(),
        };
        self.sessions.write().push(session.clone());
        session
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::ConfigInvalid(format!("no capture session {id}")))?;
        session.active = false;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<CaptureSession> {
        self.sessions.read().iter().find(|s| s.id == id).cloned()
    }

    pub fn list(&self) -> Vec<CaptureSession> {
        self.sessions.read().clone()
    }

    /// Store `payload` into every matching active session. Returns whether
    /// anything was stored; failures only log, the caller is on the packet
    /// hot path.
    pub fn offer(&self, domain: &str, protocol: &str, payload: &[u8]) -> bool {
        {
            let sessions = self.sessions.read();
            if !sessions.iter().any(|s| s.wants(domain, protocol)) {
                return false;
            }
        }

        let mut stored = false;
        let mut sessions = self.sessions.write();
        for session in sessions.iter_mut() {
            if !session.wants(domain, protocol) {
                continue;
            }
            match self.persist(session, domain, protocol, payload) {
                Ok(capture) => {
                    session.captures.push(capture);
                    session.count += 1;
                    if session.count >= session.max_packets {
                        session.active = false;
                        info!(id = %session.id, "capture session complete");
                    }
                    stored = true;
                }
                Err(e) => warn!(domain, error = %e, "capture write failed"),
            }
        }
        stored
    }

    fn persist(
        &self,
        session: &CaptureSession,
        domain: &str,
        protocol: &str,
        payload: &[u8],
    ) -> Result<CapturedPayload> {
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let file = format!(
            "{}_{}_{}_{}.bin",
            session.id,
            protocol,
            sanitize(domain),
            unix_time
        );
        let path = self.output_dir.join(file);

        fs::write(&path, payload).map_err(Error::CaptureIo)?;

        let hex = hex::encode(payload);
        fs::write(path.with_extension("bin.hex"), &hex).map_err(Error::CaptureIo)?;

        let meta = format!(
            "protocol: {protocol}\ndomain: {domain}\nunix_time: {unix_time}\nlength: {}\n",
            payload.len()
        );
        fs::write(path.with_extension("bin.txt"), meta).map_err(Error::CaptureIo)?;

        Ok(CapturedPayload {
            protocol: protocol.to_string(),
            domain: domain.to_string(),
            unix_time,
            size: payload.len(),
            path,
            hex,
        })
    }
}

fn sanitize(domain: &str) -> String {
    domain
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' => c,
            '.' => '_',
            _ => '-',
        })
        .collect()
}
