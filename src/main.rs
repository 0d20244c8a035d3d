mod alignment;
mod compat;
mod config;
mod context;
mod cooked;
mod image_io;
mod lucky;
mod matcher;
mod patch;
mod pipeline;
mod rbf;
mod stacking;
mod state;
mod sumtable;

use clap::Parser;
use std::process::ExitCode;

use config::{Cli, RegistrationParams};

fn main() -> ExitCode {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "luckystacker=info");
    }
    env_logger::init();

    let params = match RegistrationParams::from_cli(Cli::parse()) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    match pipeline::run(&params) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::from(1)
        }
    }
}
