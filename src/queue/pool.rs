//! Worker pool: N workers on contiguous queue numbers sharing one
//! published config. `update_config` swaps the config pointer and the
//! matcher together; a verdict in flight finishes under whichever pair it
//! read, every later verdict sees the new one.

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use super::worker::{Shared, Worker};
use crate::capture::CaptureManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::sni::Matcher;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);

/// Control surface consumed by the admin API and the discovery engine.
pub trait PoolControl: Send + Sync {
    fn update_config(&self, cfg: Config, domain_union: Vec<String>) -> Result<()>;
    fn current_config(&self) -> Config;
}

pub struct Pool {
    shared: Arc<Shared>,
    queue_start: u16,
    threads: usize,
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn new(cfg: Config, capture: Arc<CaptureManager>) -> Self {
        let queue_start = cfg.queue.start_num;
        let threads = cfg.queue.threads.max(1);
        Self {
            shared: Arc::new(Shared::new(cfg, capture)),
            queue_start,
            threads,
            handles: Vec::new(),
        }
    }

    /// Bind and run all workers. Fails fast: if any worker cannot bind its
    /// queue the others are stopped and the bind error is returned.
    pub fn start(&mut self) -> Result<()> {
        let (bind_tx, bind_rx) = mpsc::channel::<Result<()>>();

        for i in 0..self.threads {
            let qnum = self.queue_start + i as u16;
            let shared = self.shared.clone();
            let tx = bind_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bw-queue-{qnum}"))
                .spawn(move || {
                    let worker = Worker::new(qnum, shared);
                    match worker.run_with_bind_signal(&tx) {
                        Ok(()) => {}
                        Err(e) => error!(queue = qnum, error = %e, "worker failed"),
                    }
                })
                .expect("spawn worker thread");
            self.handles.push(handle);
        }
        drop(bind_tx);

        for _ in 0..self.threads {
            match bind_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stop();
                    return Err(e);
                }
                Err(_) => {
                    self.stop();
                    return Err(Error::QueueBind {
                        queue: self.queue_start,
                        source: std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "worker exited before binding",
                        ),
                    });
                }
            }
        }

        info!(
            queues = ?(self.queue_start..self.queue_start + self.threads as u16),
            "pool started"
        );
        Ok(())
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Parallel stop with a deadline; a worker stuck in a queue read past
    /// the deadline is reported and left to die with the process.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);

        let deadline = std::time::Instant::now() + SHUTDOWN_DEADLINE;
        for handle in self.handles.drain(..) {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if !join_with_timeout(handle, remaining) {
                warn!("timeout waiting for queue workers to stop");
            }
        }
    }
}

/// `JoinHandle` has no deadline join; poll `is_finished` until the budget
/// runs out.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    handle.join().is_ok()
}

fn publish(shared: &Shared, cfg: Config, domain_union: Vec<String>) -> Result<()> {
    cfg.validate()?;
    let matcher = Matcher::build(&cfg, &domain_union);
    // matcher first: a reader pairing the old config with the new
    // matcher only over-matches for the one in-flight verdict
    *shared.matcher.write() = Arc::new(matcher);
    *shared.config.write() = Arc::new(cfg);
    Ok(())
}

impl PoolControl for Pool {
    fn update_config(&self, cfg: Config, domain_union: Vec<String>) -> Result<()> {
        publish(&self.shared, cfg, domain_union)
    }

    fn current_config(&self) -> Config {
        (*self.shared.config()).clone()
    }
}

/// Detachable control handle; lets the discovery engine and the admin
/// surface drive the pool without owning its threads.
#[derive(Clone)]
pub struct PoolController {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn controller(&self) -> PoolController {
        PoolController {
            shared: self.shared.clone(),
        }
    }
}

impl PoolControl for PoolController {
    fn update_config(&self, cfg: Config, domain_union: Vec<String>) -> Result<()> {
        publish(&self.shared, cfg, domain_union)
    }

    fn current_config(&self) -> Config {
        (*self.shared.config()).clone()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
        }
    }
}
