//! cohorts CLI
//!
//! Lists, summarizes and prunes entries of an on-disk cohort result cache.

// CLI binary needs to write to stderr when tracing is unavailable
#![allow(clippy::print_stderr)]

mod cli;
mod commands;
mod logging;

use std::io::Write;

/// Exit code for failures that never produced command output
const EXIT_FAILURE: i32 = 1;

fn main() {
    let cli = cli::parse();

    if let Err(e) = logging::init_tracing(cli.log_format, cli.level.into()) {
        eprintln!("Error: {e:?}");
        std::process::exit(EXIT_FAILURE);
    }

    let span = logging::invocation_span(cli.command.name());
    let code = span.in_scope(|| {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let code = match commands::execute(cli, &mut out) {
            Ok(code) => code,
            Err(e) => {
                tracing::debug!(error = %e, "command failed");
                eprintln!("{e:?}");
                EXIT_FAILURE
            }
        };
        let _ = out.flush();
        code
    });
    std::process::exit(code);
}
