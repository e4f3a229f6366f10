use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use check_rpm_last_update::config_generator::print_icinga_command_if_requested;
use check_rpm_last_update::{
    run_check, CheckConfig, CheckError, Runner, ServiceState, DEFAULT_CRITICAL_DAYS,
    DEFAULT_RPM_PATH, DEFAULT_TIMEOUT_SECS, DEFAULT_WARNING_DAYS,
};

/// Check how many days have passed since the last RPM package update.
#[derive(Debug, Parser)]
#[command(name = "check_rpm_last_update", version, about)]
struct Args {
    /// Issue WARNING if the last update was more than this many days ago
    #[arg(short, long, default_value_t = DEFAULT_WARNING_DAYS)]
    warning: u32,

    /// Issue CRITICAL if the last update was more than this many days ago
    #[arg(short, long, default_value_t = DEFAULT_CRITICAL_DAYS)]
    critical: u32,

    /// Give up and exit CRITICAL if the rpm query runs longer than this many seconds
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Verbose mode; repeat for more detail on stderr, -vvv for debugging output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Path to the rpm binary
    #[arg(long, default_value = DEFAULT_RPM_PATH)]
    rpm_path: PathBuf,
}

/// Log level follows the repeatable -v, RUST_LOG overrides. Logs go to stderr
/// so the plugin line on stdout stays clean.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("check_rpm_last_update={level}")));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(err) = print_icinga_command_if_requested("check_rpm_last_update", &Args::command()) {
        println!("{}: {}", ServiceState::Unknown, err);
        std::process::exit(ServiceState::Unknown.exit_code());
    }

    Runner::new()
        .on_error(CheckError::service_state)
        .safe_run(|| {
            let cfg = CheckConfig::new(args.warning, args.critical, args.timeout)?
                .with_rpm_path(args.rpm_path);
            run_check(&cfg)
        })
        .print_and_exit()
}
