//! Three-phase discovery. Phase 1 finds the families that move bytes at
//! all, phase 2 tunes each working family, phase 3 layers the winners.
//! The engine owns a config snapshot and restores it on every exit path,
//! cancellation included.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use super::presets::{self, Family, Preset, ALL_FAMILIES, BASELINE, PAYLOAD_PROBE, PAYLOAD_PROBE_ALT};
use super::probe::{FetchOutcome, ProbeClient};
use super::prober::{recommended_families, DpiType, Fingerprinter};
use super::{
    CheckStatus, DiscoverySubmission, JobHandle, JobState, Phase, PresetResult, ProbeResult,
};
use crate::config::{Config, DiscoveryConfig, FakePayload, SetConfig};
use crate::queue::PoolControl;

const QUICK_FAIL_TIMEOUT: Duration = Duration::from_millis(1500);
/// A preset only counts as working when it is not drastically slower than
/// a working baseline.
const BASELINE_SPEED_FACTOR: f64 = 0.8;
const PHASE2_SUCCESS_CAP: usize = 3;

struct Cancelled;

#[derive(Debug, Clone)]
struct PayloadKnowledge {
    flavor: FakePayload,
    works: bool,
    speed: f64,
}

pub struct DiscoveryEngine {
    domain: String,
    pool: Arc<dyn PoolControl>,
    prober: Arc<dyn Fingerprinter>,
    client: Arc<dyn ProbeClient>,
    settings: DiscoveryConfig,
    job: JobHandle,
    cancel: Arc<AtomicBool>,
    snapshot: Option<Config>,
    payloads: Vec<PayloadKnowledge>,
    best_payload: FakePayload,
}

impl DiscoveryEngine {
    pub fn new(
        domain: String,
        pool: Arc<dyn PoolControl>,
        prober: Arc<dyn Fingerprinter>,
        client: Arc<dyn ProbeClient>,
        settings: DiscoveryConfig,
    ) -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let id = format!("disc_{unix}");
        let job = Arc::new(parking_lot::RwLock::new(JobState::new(id, domain.clone())));
        Self {
            domain,
            pool,
            prober,
            client,
            settings,
            job,
            cancel: Arc::new(AtomicBool::new(false)),
            snapshot: None,
            payloads: Vec::new(),
            best_payload: FakePayload::Google,
        }
    }

    pub fn job(&self) -> JobHandle {
        self.job.clone()
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn submission(&self) -> DiscoverySubmission {
        let job = self.job.read();
        DiscoverySubmission {
            id: job.id.clone(),
            domain: self.domain.clone(),
            estimated_tests: presets::phase1().len(),
            message: format!("discovery started for {}", self.domain),
        }
    }

    /// Execute the full search. Blocking; run it on its own thread.
    pub fn run(mut self) -> JobHandle {
        self.set_status(CheckStatus::Running);
        self.snapshot = Some(self.pool.current_config());

        info!(domain = %self.domain, "discovery starting");
        self.set_phase(Phase::Fingerprint);
        let fingerprint = self.prober.fingerprint(&self.domain);
        self.job.write().fingerprint = Some(fingerprint.clone());

        if fingerprint.dpi == DpiType::None {
            info!(domain = %self.domain, "no dpi detected, recording plain baseline");
            self.job.write().total_checks = 1;
            let phase1 = presets::phase1();
            let baseline = self.test_preset(&phase1[0]);
            let speed = baseline.speed;
            self.store_result(&phase1[0], baseline);
            {
                let mut job = self.job.write();
                job.total_checks = 1;
                job.best_preset = Some(BASELINE.to_string());
                job.best_success = true;
                job.best_speed = speed;
                job.baseline_speed = speed;
                job.improvement = 0.0;
            }
            self.finish();
            return self.job;
        }

        let mut phase1 = presets::phase1();
        if let Some(ttl) = fingerprint.optimal_ttl {
            for preset in phase1.iter_mut().filter(|p| p.set.faking.sni) {
                preset.set.faking.ttl = ttl;
            }
        }
        self.job.write().total_checks = phase1.len();

        self.set_phase(Phase::Strategy);
        let outcome = self.run_phase1(&fingerprint.recommended, &phase1);
        let (mut working, baseline_speed, baseline_ok) = match outcome {
            Ok(r) => r,
            Err(Cancelled) => return self.abort(),
        };
        self.determine_best(baseline_speed);

        if baseline_ok {
            info!(domain = %self.domain, "baseline succeeds, no bypass needed");
            {
                let mut job = self.job.write();
                job.total_checks = 1;
                job.best_preset = Some(BASELINE.to_string());
                job.best_success = true;
                job.best_speed = baseline_speed;
                job.baseline_speed = baseline_speed;
                job.improvement = 0.0;
            }
            self.finish();
            return self.job;
        }

        if working.is_empty() {
            warn!(domain = %self.domain, "phase 1 found nothing, extended search");
            self.set_phase(Phase::Optimize);
            working = match self.extended_search() {
                Ok(w) => w,
                Err(Cancelled) => return self.abort(),
            };
            if working.is_empty() {
                warn!(domain = %self.domain, "no working bypass strategy");
                self.determine_best(baseline_speed);
                self.finish();
                return self.job;
            }
        }

        info!(domain = %self.domain, families = working.len(), "phase 1 complete");

        self.set_phase(Phase::Optimize);
        let best_params = match self.run_phase2(&working) {
            Ok(b) => b,
            Err(Cancelled) => return self.abort(),
        };
        self.determine_best(baseline_speed);

        if working.len() >= 2 {
            self.set_phase(Phase::Combination);
            if self.run_phase3(&best_params).is_err() {
                return self.abort();
            }
        }

        self.determine_best(baseline_speed);
        self.finish();
        self.log_summary();
        self.job
    }

    fn run_phase1(
        &mut self,
        recommended: &[Family],
        phase1: &[Preset],
    ) -> Result<(Vec<Family>, f64, bool), Cancelled> {
        let baseline = self.test_preset(&phase1[0]);
        let baseline_ok = baseline.ok();
        let baseline_speed = baseline.speed;
        self.store_result(&phase1[0], baseline);
        if baseline_ok {
            return Ok((Vec::new(), baseline_speed, true));
        }

        // which decoy payload flavor does this path let through?
        self.detect_payloads(phase1)?;

        let mut strategy_presets: Vec<Preset> = phase1
            .iter()
            .filter(|p| ![BASELINE, PAYLOAD_PROBE, PAYLOAD_PROBE_ALT].contains(&p.name.as_str()))
            .cloned()
            .collect();

        let priority: Vec<Family> = if recommended.is_empty() {
            let mode = analyze_failure(self.job.read().results.get(BASELINE));
            recommended_families(mode)
        } else {
            recommended.to_vec()
        };
        if !priority.is_empty() {
            info!(?priority, "prioritizing families");
            let rank = |f: Family| {
                priority
                    .iter()
                    .position(|&p| p == f)
                    .unwrap_or(priority.len())
            };
            strategy_presets.sort_by_key(|p| rank(p.family));
        }

        let mut working: Vec<Family> = Vec::new();
        for preset in &strategy_presets {
            self.check_cancel()?;
            let result = self.test_with_best_payload(preset);
            let usable = result.ok() && result.speed > baseline_speed * BASELINE_SPEED_FACTOR;
            if usable {
                info!(preset = %preset.name, speed = result.speed, "working");
                if !working.contains(&preset.family) {
                    working.push(preset.family);
                }
            }
            self.store_result(preset, result);
        }
        Ok((working, baseline_speed, false))
    }

    fn detect_payloads(&mut self, phase1: &[Preset]) -> Result<(), Cancelled> {
        for (name, flavor) in [
            (PAYLOAD_PROBE, FakePayload::Google),
            (PAYLOAD_PROBE_ALT, FakePayload::Duckduckgo),
        ] {
            self.check_cancel()?;
            let Some(preset) = phase1.iter().find(|p| p.name == name) else {
                continue;
            };
            if self.job.read().results.contains_key(name) {
                continue;
            }
            let result = self.test_preset(preset);
            self.payloads.push(PayloadKnowledge {
                flavor,
                works: result.ok(),
                speed: result.speed,
            });
            info!(payload = ?flavor, works = result.ok(), "payload variant");
            self.store_result(preset, result);
        }
        self.select_best_payload();
        Ok(())
    }

    fn select_best_payload(&mut self) {
        self.best_payload = FakePayload::Google;
        let mut best_speed = 0.0;
        for p in self.payloads.iter().filter(|p| p.works) {
            if p.speed > best_speed {
                best_speed = p.speed;
                self.best_payload = p.flavor;
            }
        }
    }

    fn update_payload_knowledge(&mut self, flavor: FakePayload, speed: f64) {
        if let Some(known) = self.payloads.iter_mut().find(|p| p.flavor == flavor) {
            if !known.works || speed > known.speed {
                known.works = true;
                known.speed = speed;
            }
        } else {
            self.payloads.push(PayloadKnowledge {
                flavor,
                works: true,
                speed,
            });
        }
        self.select_best_payload();
    }

    fn run_phase2(&mut self, working: &[Family]) -> Result<Vec<(Family, Preset)>, Cancelled> {
        let total: usize = working.iter().map(|f| presets::phase2(*f).len()).sum();
        self.job.write().total_checks += total;
        info!(families = working.len(), presets = total, "phase 2");

        let mut best_params = Vec::new();
        for &family in working {
            self.check_cancel()?;
            let mut successes = 0usize;
            let mut best: Option<(f64, Preset)> = None;

            for preset in presets::phase2(family) {
                self.check_cancel()?;
                if successes >= PHASE2_SUCCESS_CAP {
                    break;
                }
                let result = self.test_with_best_payload(&preset);
                if result.ok() {
                    successes += 1;
                    if best.as_ref().map_or(true, |(speed, _)| result.speed > *speed) {
                        let mut won = preset.clone();
                        won.set.faking.payload = self.best_payload;
                        best = Some((result.speed, won));
                    }
                }
                self.store_result(&preset, result);
            }

            if let Some((speed, preset)) = best {
                info!(?family, preset = %preset.name, speed, "family optimum");
                best_params.push((family, preset));
            }
        }
        Ok(best_params)
    }

    fn run_phase3(&mut self, best_params: &[(Family, Preset)]) -> Result<(), Cancelled> {
        let combos = presets::combinations(best_params);
        if combos.is_empty() {
            return Ok(());
        }
        self.job.write().total_checks += combos.len();
        info!(count = combos.len(), "phase 3 combinations");

        for preset in &combos {
            self.check_cancel()?;
            let result = self.test_with_best_payload(preset);
            self.store_result(preset, result);
        }
        Ok(())
    }

    fn extended_search(&mut self) -> Result<Vec<Family>, Cancelled> {
        let mut working = Vec::new();
        for family in ALL_FAMILIES {
            self.check_cancel()?;
            let presets = presets::phase2(family);
            self.job.write().total_checks += presets.len();

            for preset in &presets {
                self.check_cancel()?;
                let result = self.test_with_best_payload(preset);
                if result.ok() && !working.contains(&family) {
                    working.push(family);
                }
                self.store_result(preset, result);
            }
        }
        Ok(working)
    }

    /// Test with the known-good payload flavor; when none is known yet,
    /// try both and remember whichever got through.
    fn test_with_best_payload(&mut self, preset: &Preset) -> ProbeResult {
        let result = if self.payloads.iter().any(|p| p.works) {
            self.test_internal(preset, Some(self.best_payload))
        } else {
            let first = self.test_internal(preset, Some(FakePayload::Google));
            if first.ok() {
                self.update_payload_knowledge(FakePayload::Google, first.speed);
                first
            } else {
                let second = self.test_internal(preset, Some(FakePayload::Duckduckgo));
                if second.ok() {
                    self.update_payload_knowledge(FakePayload::Duckduckgo, second.speed);
                    second
                } else {
                    first
                }
            }
        };
        self.job.write().completed_checks += 1;
        result
    }

    fn test_preset(&mut self, preset: &Preset) -> ProbeResult {
        let result = self.test_internal(preset, None);
        self.job.write().completed_checks += 1;
        result
    }

    fn test_internal(&mut self, preset: &Preset, payload: Option<FakePayload>) -> ProbeResult {
        let mut set = preset.set.clone();
        set.name = preset.name.clone();
        if let Some(flavor) = payload {
            set.faking.payload = flavor;
        }

        let (cfg, union) = self.build_test_config(set);
        if let Err(e) = self.pool.update_config(cfg, union) {
            warn!(preset = %preset.name, error = %e, "preset apply failed");
            return ProbeResult::failed(e.to_string());
        }
        std::thread::sleep(Duration::from_millis(self.settings.config_propagate_ms));

        let quick = self.fetch(QUICK_FAIL_TIMEOUT);
        if quick.ok() || quick.bytes_read > 0 {
            return quick;
        }
        self.fetch(Duration::from_millis(self.settings.timeout_ms))
    }

    fn fetch(&self, timeout: Duration) -> ProbeResult {
        let FetchOutcome {
            bytes_read,
            duration,
            status_code,
            error,
        } = self.client.fetch(&self.domain, timeout);

        if bytes_read > 0 {
            let secs = duration.as_secs_f64().max(1e-6);
            ProbeResult {
                status: CheckStatus::Complete,
                bytes_read,
                duration,
                speed: bytes_read as f64 / secs,
                status_code,
                error: None,
            }
        } else {
            ProbeResult {
                status: CheckStatus::Failed,
                bytes_read: 0,
                duration,
                speed: 0.0,
                status_code,
                error: Some(error.unwrap_or_else(|| "no data received".into())),
            }
        }
    }

    /// Single-set config targeting only the discovery host, on top of the
    /// snapshot's queue settings.
    fn build_test_config(&self, mut set: SetConfig) -> (Config, Vec<String>) {
        let snapshot = self.snapshot.as_ref().expect("snapshot taken in run()");
        let union = if set.enabled {
            set.targets.sni_domains = vec![self.domain.clone()];
            set.targets.domains_to_match = vec![self.domain.clone()];
            vec![self.domain.clone()]
        } else {
            set.targets.sni_domains.clear();
            set.targets.domains_to_match.clear();
            Vec::new()
        };
        let cfg = Config {
            queue: snapshot.queue.clone(),
            domains: Default::default(),
            discovery: snapshot.discovery.clone(),
            sets: vec![set],
        };
        (cfg, union)
    }

    fn store_result(&self, preset: &Preset, result: ProbeResult) {
        self.job.write().results.insert(
            preset.name.clone(),
            PresetResult {
                preset: preset.name.clone(),
                family: preset.family,
                phase: preset.phase,
                result,
            },
        );
    }

    fn determine_best(&self, baseline_speed: f64) {
        let mut job = self.job.write();
        let mut best: Option<(String, f64)> = None;
        for (name, pr) in &job.results {
            if name == BASELINE || !pr.result.ok() {
                continue;
            }
            if best.as_ref().map_or(true, |(_, s)| pr.result.speed > *s) {
                best = Some((name.clone(), pr.result.speed));
            }
        }

        job.baseline_speed = baseline_speed;
        match best {
            Some((name, speed)) => {
                job.best_preset = Some(name);
                job.best_speed = speed;
                job.best_success = true;
                job.improvement = if baseline_speed > 0.0 && speed > 0.0 {
                    (speed - baseline_speed) / baseline_speed * 100.0
                } else {
                    0.0
                };
            }
            None => {
                job.best_preset = None;
                job.best_speed = 0.0;
                job.best_success = false;
                job.improvement = 0.0;
            }
        }
    }

    fn set_status(&self, status: CheckStatus) {
        self.job.write().status = status;
    }

    fn set_phase(&self, phase: Phase) {
        self.job.write().phase = phase;
    }

    fn check_cancel(&self) -> Result<(), Cancelled> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    fn abort(self) -> JobHandle {
        info!(domain = %self.domain, "discovery cancelled");
        self.restore();
        {
            let mut job = self.job.write();
            job.status = CheckStatus::Cancelled;
            job.phase = Phase::Done;
        }
        self.job
    }

    /// Restore + mark complete. A failed restore outranks the search
    /// outcome: the job ends failed.
    fn finish(&self) {
        let restored = self.restore();
        let mut job = self.job.write();
        job.phase = Phase::Done;
        job.status = if restored {
            CheckStatus::Complete
        } else {
            CheckStatus::Failed
        };
    }

    fn restore(&self) -> bool {
        let Some(snapshot) = self.snapshot.clone() else {
            return true;
        };
        info!("restoring original configuration");
        let union = snapshot.domain_union();
        match self.pool.update_config(snapshot, union) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to restore configuration");
                false
            }
        }
    }

    fn log_summary(&self) {
        let job = self.job.read();
        match (&job.best_preset, job.best_success) {
            (Some(name), true) => info!(
                domain = %job.domain,
                best = %name,
                speed_kbs = job.best_speed / 1024.0,
                improvement = job.improvement,
                "discovery complete"
            ),
            _ => warn!(domain = %job.domain, "no successful configuration found"),
        }
    }
}

fn analyze_failure(baseline: Option<&PresetResult>) -> DpiType {
    let Some(result) = baseline else {
        return DpiType::Unknown;
    };
    let Some(error) = &result.result.error else {
        return DpiType::Unknown;
    };
    let err = error.to_lowercase();
    if (err.contains("reset") || err.contains("rst"))
        && result.result.duration < Duration::from_millis(100)
    {
        return DpiType::RstImmediate;
    }
    if err.contains("timeout") || err.contains("deadline") || err.contains("timed out") {
        return DpiType::Timeout;
    }
    if err.contains("tls") || err.contains("certificate") {
        return DpiType::TlsError;
    }
    DpiType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::prober::Fingerprint;
    use crate::error::Result as BwResult;
    use parking_lot::Mutex;

    struct MockPool {
        current: Mutex<Config>,
        applied: Mutex<Vec<String>>,
    }

    impl MockPool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(Config::default()),
                applied: Mutex::new(Vec::new()),
            })
        }

        fn applied(&self) -> Vec<String> {
            self.applied.lock().clone()
        }

        fn active_set_name(&self) -> String {
            self.current.lock().sets[0].name.clone()
        }
    }

    impl PoolControl for MockPool {
        fn update_config(&self, cfg: Config, _union: Vec<String>) -> BwResult<()> {
            self.applied.lock().push(cfg.sets[0].name.clone());
            *self.current.lock() = cfg;
            Ok(())
        }

        fn current_config(&self) -> Config {
            self.current.lock().clone()
        }
    }

    struct FixedFingerprint(DpiType);
    impl Fingerprinter for FixedFingerprint {
        fn fingerprint(&self, _domain: &str) -> Fingerprint {
            Fingerprint::of(self.0)
        }
    }

    /// Succeeds only for the named presets, keyed off the set name the
    /// pool currently has applied.
    struct SelectiveClient {
        pool: Arc<MockPool>,
        works: Vec<(&'static str, u64)>,
    }

    impl ProbeClient for SelectiveClient {
        fn fetch(&self, _host: &str, _timeout: Duration) -> FetchOutcome {
            let active = self.pool.active_set_name();
            match self.works.iter().find(|(name, _)| *name == active) {
                Some((_, bytes)) => FetchOutcome {
                    bytes_read: *bytes,
                    duration: Duration::from_secs(1),
                    status_code: Some(200),
                    error: None,
                },
                None => FetchOutcome {
                    bytes_read: 0,
                    duration: Duration::from_millis(20),
                    status_code: None,
                    error: Some("connection reset by peer".into()),
                },
            }
        }
    }

    fn quick_settings() -> DiscoveryConfig {
        DiscoveryConfig {
            timeout_ms: 10,
            config_propagate_ms: 0,
        }
    }

    fn engine_with(
        pool: &Arc<MockPool>,
        dpi: DpiType,
        works: Vec<(&'static str, u64)>,
    ) -> DiscoveryEngine {
        DiscoveryEngine::new(
            "target.example".into(),
            pool.clone(),
            Arc::new(FixedFingerprint(dpi)),
            Arc::new(SelectiveClient {
                pool: pool.clone(),
                works,
            }),
            quick_settings(),
        )
    }

    #[test]
    fn rst_dpi_finds_the_single_working_preset() {
        let pool = MockPool::new();
        let engine = engine_with(&pool, DpiType::RstImmediate, vec![("fakesni-ttl8", 51_200)]);
        let job = engine.run();
        let job = job.read();

        assert_eq!(job.status, CheckStatus::Complete);
        assert_eq!(job.best_preset.as_deref(), Some("fakesni-ttl8"));
        assert!((job.best_speed - 51_200.0).abs() < 1.0);
        assert_eq!(job.baseline_speed, 0.0);
        assert_eq!(job.improvement, 0.0);
        assert!(job.best_success);

        // recommended families lead phase 1
        let applied = pool.applied();
        assert_eq!(applied[0], BASELINE);
        let first = |name: &str| applied.iter().position(|n| n == name).unwrap();
        assert!(first("desync-disorder") < first("tcpfrag-pos1"));
        assert!(first("fakesni-ttl8") < first("tcpfrag-pos1"));
        assert!(first("synfake-ttl8") < first("tcpfrag-pos1"));
        assert!(first("desync-disorder") < first("fakesni-ttl8"));

        // config restored at the end
        assert_eq!(pool.current_config(), Config::default());
    }

    #[test]
    fn no_dpi_records_plain_baseline_and_stops() {
        let pool = MockPool::new();
        let engine = engine_with(&pool, DpiType::None, vec![(BASELINE, 80 * 1024)]);
        let job = engine.run();
        let job = job.read();

        assert_eq!(job.status, CheckStatus::Complete);
        assert_eq!(job.best_preset.as_deref(), Some(BASELINE));
        assert!((job.best_speed - 81_920.0).abs() < 1.0);
        assert_eq!(job.baseline_speed, job.best_speed);
        assert_eq!(job.improvement, 0.0);
        assert_eq!(job.total_checks, 1);
        assert_eq!(job.completed_checks, 1);

        // nothing beyond the baseline probe ran
        assert_eq!(pool.applied().iter().filter(|n| *n != "Main").count(), 1);
        assert_eq!(pool.current_config(), Config::default());
    }

    #[test]
    fn working_baseline_short_circuits_optimization() {
        let pool = MockPool::new();
        // every preset works, including no-bypass
        let all: Vec<(&'static str, u64)> = vec![
            (BASELINE, 100_000),
            ("proven-combo", 90_000),
            ("tcpfrag-pos1", 90_000),
        ];
        let engine = engine_with(&pool, DpiType::Unknown, all);
        let job = engine.run();
        let job = job.read();

        assert_eq!(job.status, CheckStatus::Complete);
        assert_eq!(job.best_preset.as_deref(), Some(BASELINE));
        assert_eq!(job.total_checks, 1);
        // only the baseline was ever applied (plus the restore)
        assert_eq!(pool.applied().iter().filter(|n| *n != "Main").count(), 1);
    }

    #[test]
    fn two_working_families_reach_phase3() {
        let pool = MockPool::new();
        let engine = engine_with(
            &pool,
            DpiType::Timeout,
            vec![
                ("tcpfrag-pos1", 40_000),
                ("tcpfrag-pos2", 42_000),
                ("oob-pos1", 30_000),
                ("oob-midsni", 35_000),
                ("combo-tcpfrag-oob", 60_000),
            ],
        );
        let job = engine.run();
        let job = job.read();

        assert_eq!(job.status, CheckStatus::Complete);
        assert_eq!(job.best_preset.as_deref(), Some("combo-tcpfrag-oob"));
        assert!(job.results.contains_key("combo-tcpfrag-oob"));
        assert_eq!(pool.current_config(), Config::default());
    }

    #[test]
    fn cancellation_restores_and_marks_cancelled() {
        let pool = MockPool::new();
        let engine = engine_with(&pool, DpiType::RstImmediate, vec![]);
        engine.cancel_flag().store(true, Ordering::Relaxed);
        let job = engine.run();
        let job = job.read();

        assert_eq!(job.status, CheckStatus::Cancelled);
        assert_eq!(pool.current_config(), Config::default());
    }

    #[test]
    fn submission_reports_estimated_tests() {
        let pool = MockPool::new();
        let engine = engine_with(&pool, DpiType::None, vec![]);
        let sub = engine.submission();
        assert_eq!(sub.estimated_tests, presets::phase1().len());
        assert!(sub.id.starts_with("disc_"));
    }

    #[test]
    fn analyze_failure_reads_error_text() {
        let fast_reset = PresetResult {
            preset: BASELINE.into(),
            family: Family::TcpFrag,
            phase: 1,
            result: ProbeResult {
                status: CheckStatus::Failed,
                bytes_read: 0,
                duration: Duration::from_millis(10),
                speed: 0.0,
                status_code: None,
                error: Some("connection reset by peer".into()),
            },
        };
        assert_eq!(analyze_failure(Some(&fast_reset)), DpiType::RstImmediate);
        assert_eq!(analyze_failure(None), DpiType::Unknown);
    }
}
