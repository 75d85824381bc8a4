use clap::{Parser, ValueEnum};
use sentry_test::*;

#[derive(Parser)]
struct Command {
    /// The signal to raise
    #[clap(long)]
    signal: Option<Signal>,
    /// Raises the signal on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
    /// The number of clients to crash in parallel
    #[clap(long, default_value_t = 1)]
    count: u32,

    #[clap(long)]
    list: bool,
}

fn main() {
    let cli = Command::parse();

    if cli.list {
        for variant in Signal::value_variants() {
            println!("{variant}");
        }
    } else if let Some(signal) = cli.signal {
        if cli.count > 1 {
            run_threaded_test(signal, cli.count);
            println!("{} clients crashed with {signal}", cli.count);
        } else {
            let outcome = run_test(signal, cli.use_thread);
            println!("{:?}", outcome.report);
        }
    } else {
        println!("must pass --signal (see available choices with --list)");
    }
}
