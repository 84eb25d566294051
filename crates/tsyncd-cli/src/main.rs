//! The tsyncd daemon binary.
//!
//! Loads the configuration, initializes logging, and runs the engine on the
//! main thread. Exit code 0 is a clean exit; anything else is the errno of
//! the initialization or runtime failure.

use clap::Parser;

use tsyncd_core::engine::{persist, run_daemon};
use tsyncd_core::Config;

#[derive(Parser)]
#[command(name = "tsyncd")]
#[command(about = "tsyncd — high-precision time synchronization daemon")]
#[command(version = tsyncd_core::VERSION)]
struct Cli {
    /// Configuration file (JSON). Defaults apply when omitted.
    #[arg(short = 'f', long)]
    config: Option<String>,

    /// Increase verbosity; repeat for more (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run supervised in the foreground. Daemonization proper is left to
    /// the init system; this flag only suppresses the reminder.
    #[arg(long)]
    daemon: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_micros()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration: {e}");
            persist::notify_error(e.errno());
            std::process::exit(e.errno());
        }
    };

    if !cli.daemon {
        log::info!("running in the foreground; use an init supervisor for daemon operation");
    }

    match run_daemon(config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("fatal: {e}");
            std::process::exit(e.errno());
        }
    }
}
