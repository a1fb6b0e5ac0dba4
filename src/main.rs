use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use breakwater::capture::CaptureManager;
use breakwater::config::Config;
use breakwater::discovery::probe::HttpProbeClient;
use breakwater::discovery::{DiscoveryEngine, DpiProber};
use breakwater::error::Error;
use breakwater::queue::Pool;

const EXIT_CONFIG: u8 = 1;
const EXIT_SOCKET: u8 = 2;
const EXIT_QUEUE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "breakwater", about = "DPI-evasion packet engine on netfilter queues")]
struct Args {
    /// Configuration file (JSON). Defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the first queue number.
    #[arg(short = 'q', long)]
    queue_num: Option<u16>,

    /// Override the worker thread count.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Verbosity: -v debug, -vv trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Capture artifact directory.
    #[arg(long, default_value = "./captures")]
    captures: PathBuf,

    /// Run discovery against a host, print the result and exit.
    #[arg(long, value_name = "DOMAIN")]
    discover: Option<String>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = on_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("breakwater={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(q) = args.queue_num {
        cfg.queue.start_num = q;
    }
    if let Some(t) = args.threads {
        cfg.queue.threads = t;
    }
    cfg.validate().context("validating configuration")?;

    let capture = Arc::new(CaptureManager::new(args.captures.clone()));
    let discovery_settings = cfg.discovery.clone();
    let mut pool = Pool::new(cfg, capture);
    pool.start().context("starting queue workers")?;

    if let Some(domain) = args.discover {
        let engine = DiscoveryEngine::new(
            domain,
            Arc::new(pool.controller()),
            Arc::new(DpiProber::new()),
            Arc::new(HttpProbeClient::new()),
            discovery_settings,
        );
        let submission = engine.submission();
        info!(
            id = %submission.id,
            estimated = submission.estimated_tests,
            "{}",
            submission.message
        );
        let job = engine.run();
        let report = serde_json::to_string_pretty(&*job.read())
            .context("rendering discovery report")?;
        println!("{report}");
        pool.stop();
        return Ok(());
    }

    install_signal_handlers();
    info!("running; ctrl-c to stop");
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    pool.stop();
    Ok(())
}

/// Map the root cause back onto the documented exit codes: 1 config,
/// 2 socket, 3 queue bind.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::QueueBind { .. }) => EXIT_QUEUE,
        Some(Error::RawSend(_)) => EXIT_SOCKET,
        _ => EXIT_CONFIG,
    }
}
