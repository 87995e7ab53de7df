//! The zfsd daemon binary: argument parsing, logging setup, signal
//! handling and the daemon lifecycle.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zlomekfs::config::LocalConfig;
use zlomekfs::daemon::Zfsd;

#[derive(Parser)]
#[command(name = "zfsd", about = "ZlomekFS cluster filesystem daemon")]
struct Args {
    /// Path of the local configuration file.
    #[arg(short, long, default_value = "/etc/zfsd/zfsd.conf")]
    config: PathBuf,

    /// Raise log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signum: libc::c_int) {
    TERMINATE.store(true, Ordering::Release);
}

extern "C" fn on_hup(_signum: libc::c_int) {
    RELOAD.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    let terminate: extern "C" fn(libc::c_int) = on_terminate;
    let hup: extern "C" fn(libc::c_int) = on_hup;
    unsafe {
        libc::signal(libc::SIGINT, terminate as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, terminate as libc::sighandler_t);
        libc::signal(libc::SIGTERM, terminate as libc::sighandler_t);
        libc::signal(libc::SIGHUP, hup as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("zlomekfs={default_level}"))),
        )
        .init();

    let config = match LocalConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %args.config.display(), %err, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    if config.system.mlock {
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc != 0 {
            error!("mlockall failed, continuing unlocked");
        }
    }

    let zfsd = match Zfsd::new(config) {
        Ok(zfsd) => zfsd,
        Err(err) => {
            error!(%err, "daemon initialization failed");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = zfsd.start() {
        error!(%err, "daemon startup failed");
        return ExitCode::FAILURE;
    }
    install_signal_handlers();
    info!(node = zfsd.this_name(), "zfsd running");

    while !TERMINATE.load(Ordering::Acquire) {
        if RELOAD.swap(false, Ordering::AcqRel) {
            info!("SIGHUP: re-reading local volume configuration");
            let _ = zfsd.request_local_reread();
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    zfsd.shutdown();
    ExitCode::SUCCESS
}
