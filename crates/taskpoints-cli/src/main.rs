use clap::Parser;
use taskpoints_cli::{init_logging, run_cli, Cli};

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
