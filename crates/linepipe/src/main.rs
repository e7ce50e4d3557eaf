mod cmd;
mod output;

use clap::Parser;
use linepipe::cli::{exit, logging, support};

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel, LogRole};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "linepipe", version, about = "Parent/child pipe channel CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        global = true,
        env = "LINEPIPE_LOG_LEVEL"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    let _log_span = init_logging(cli.log_format, cli.log_level, LogRole::Host);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
