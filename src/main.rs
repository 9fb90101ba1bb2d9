use std::process::ExitCode;

use clap::Parser;

use htdoh_proxy::args::{self, Cli};
use htdoh_proxy::reactor::Reactor;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.into_config();

    // RUST_LOG still wins if the operator set it explicitly; otherwise fall
    // back to the level chosen on the command line (spec.md §6).
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    pretty_env_logger::init();

    let reactor = match Reactor::new(config) {
        Ok(r) => r,
        Err(e) => {
            log::error!("failed to start: {}", e);
            return ExitCode::from(args::EXIT_IO_ERROR as u8);
        }
    };

    if let Err(e) = reactor.run() {
        log::error!("reactor exited: {}", e);
        return ExitCode::from(args::EXIT_IO_ERROR as u8);
    }

    ExitCode::from(args::EXIT_OK as u8)
}
