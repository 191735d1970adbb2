//! Binary entry point: parse flags, load configuration, initialize logging,
//! and hand off to the Supervisor Orchestrator.

use clap::Parser;

fn main() {
    let cli = sketch_supervisor::cli::Cli::parse();

    let config = match sketch_supervisor::config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sketch: {e}");
            std::process::exit(2);
        }
    };

    sketch_supervisor::logging::init(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("sketch: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(sketch_supervisor::orchestrator::run(config));

    match result {
        Ok(()) => {}
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}
