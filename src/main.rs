mod app;

use std::process;

use log::LevelFilter;
use tasker::{AppConfig, Catalog, TaskManager};

use app::cli;

fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR]: {}", e);
            process::exit(2);
        }
    };
    let catalog = match Catalog::load(&config.catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("[ERROR]: {}", e);
            process::exit(1);
        }
    };
    let manager = match TaskManager::spawn(config.engine.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("[ERROR]: Failed to start engine: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = cli::run_cli(&manager, catalog, &config) {
        eprintln!("[ERROR]: {}", e);
    }
    manager.shutdown();
}
