//! Discovery: drive the worker pool through preset configurations against
//! one host, measure what actually gets bytes through, and report the
//! fastest working setup.

pub mod engine;
pub mod presets;
pub mod probe;
pub mod prober;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

pub use engine::DiscoveryEngine;
pub use presets::{Family, Preset};
pub use prober::{DpiProber, DpiType, Fingerprint, Fingerprinter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fingerprint,
    Strategy,
    Optimize,
    Combination,
    Done,
}

/// Outcome of one preset test.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub status: CheckStatus,
    pub bytes_read: u64,
    pub duration: Duration,
    /// bytes per second
    pub speed: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Failed,
            bytes_read: 0,
            duration: Duration::ZERO,
            speed: 0.0,
            status_code: None,
            error: Some(error.into()),
        }
    }

    pub fn ok(&self) -> bool {
        self.status == CheckStatus::Complete
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PresetResult {
    pub preset: String,
    pub family: Family,
    pub phase: u8,
    #[serde(flatten)]
    pub result: ProbeResult,
}

/// Mutable job state shared with whoever polls for progress.
#[derive(Debug, Serialize)]
pub struct JobState {
    pub id: String,
    pub domain: String,
    pub status: CheckStatus,
    pub phase: Phase,
    pub total_checks: usize,
    pub completed_checks: usize,
    pub fingerprint: Option<Fingerprint>,
    pub results: HashMap<String, PresetResult>,
    pub best_preset: Option<String>,
    pub best_speed: f64,
    pub best_success: bool,
    pub baseline_speed: f64,
    /// percent over baseline
    pub improvement: f64,
}

impl JobState {
    pub fn new(id: String, domain: String) -> Self {
        Self {
            id,
            domain,
            status: CheckStatus::Pending,
            phase: Phase::Fingerprint,
            total_checks: 0,
            completed_checks: 0,
            fingerprint: None,
            results: HashMap::new(),
            best_preset: None,
            best_speed: 0.0,
            best_success: false,
            baseline_speed: 0.0,
            improvement: 0.0,
        }
    }
}

pub type JobHandle = Arc<RwLock<JobState>>;

/// Submit acknowledgment, mirrored by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySubmission {
    pub id: String,
    pub domain: String,
    pub estimated_tests: usize,
    pub message: String,
}
