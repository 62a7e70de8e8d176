//! The `schemalog` command.

use clap::Parser;
use schemalog::CancellationFlag;
use schemalog_cli::{cancel_on_ctrl_c, init_logging, run, CliArgs};

fn main() {
    let args = CliArgs::parse();
    init_logging(args.verbose);

    let cancellation = CancellationFlag::new();
    if let Err(e) = cancel_on_ctrl_c(cancellation.clone()) {
        tracing::warn!("Ctrl-C will not stop runs cleanly: {:#}", e);
    }

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = run(args, cancellation, &mut stdout) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
