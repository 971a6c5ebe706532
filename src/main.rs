use std::path::PathBuf;

use log::{error, info};
use shellward::askpass;
use shellward::configuration::Args;
use shellward::controller::Controller;

#[tokio::main]
async fn main() {
    // Re-invoked by ssh or sudo as the askpass helper
    if let Some(socket) = std::env::var_os(askpass::SOCKET_ENV) {
        if let Err(e) = askpass::run_helper(&PathBuf::from(socket)) {
            eprintln!("askpass: {}", e);
            std::process::exit(1);
        }
        return;
    }

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .init();

    let args = Args::from_args();
    let config = match args.load() {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded");

    let mut controller = Controller::new(config);
    if let Err(e) = controller.run().await {
        error!("Controller failed: {}, exiting...", e);
        std::process::exit(1);
    }
}
