use clap::Parser;
use rakerunnerd::{dispatch, CliContext, DEFAULT_DAEMON_NAME};
use std::path::PathBuf;

/// Keep a configured number of instances of each rake task running.
#[derive(Debug, Parser)]
#[command(name = "rakerunner", version)]
struct Cli {
    /// Config file; defaults to $RAKERUNNER_CONF, ./rakerunner.conf, then
    /// /etc/rakerunner.conf.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Daemon name, used for the pid, log and fifo file names.
    #[arg(long, default_value = DEFAULT_DAEMON_NAME)]
    name: String,
    /// Run `start` without detaching from the terminal.
    #[arg(long)]
    foreground: bool,
    /// Echo the daemon log to stderr and keep stderr open after detaching.
    #[arg(long)]
    debug: bool,
    /// start, stop, restart, status, startrake, stoprake, clearignores or hosts.
    command: Option<String>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let ctx = CliContext {
        conf_file: cli.config,
        name: cli.name,
        foreground: cli.foreground,
        debug: cli.debug,
    };
    if let Err(err) = dispatch(&ctx, cli.command.as_deref(), &cli.args) {
        eprintln!("rakerunner: {err}");
        std::process::exit(err.exit_code());
    }
}
