use anyhow::Result;
use blockgraph_core::cli::Args;
use clap::Parser;

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
    blockgraph_core::run_cli(&args)
}
