mod app;
mod config;

use crate::app::BridgeApp;
use crate::config::BridgeConfig;
use clap::{App, Arg};
use txpc::logging;

fn main() {
    let matches = App::new("TinyXPC Bridge")
        .version("0.1.0")
        .about("Relays TinyXPC channels between byte stream endpoints.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the bridge config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config: BridgeConfig =
        serdeconv::from_toml_file(config_path).expect("Error parsing config file");

    let log = logging::from_config(&config.logging).expect("Error building logger");

    logging::info!(log, "starting bridge";
                   "config" => config_path,
                   "endpoints" => config.endpoints.len(),
                   "routes" => config.routes.len());

    let mut bridge = BridgeApp::new(&config, &log).expect("Error setting up endpoints");

    if let Err(err) = bridge.run() {
        logging::error!(log, "bridge terminated"; "error" => %err);
        std::process::exit(1);
    }
}
