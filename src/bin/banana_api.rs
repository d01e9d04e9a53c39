//! banana_api - HTTP service for banana cultivar classification
//!
//! This daemon:
//! 1. Loads `BANANA_CONFIG` and `BANANA_*` overrides
//! 2. Loads the detection models (eager by default)
//! 3. Serves `/health` and `/detect` until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use banana_cascade::{
    api::{ApiConfig, ApiServer},
    detect, BananaConfig, Classifier,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BananaConfig::load()?;
    log::info!(
        "loading models from {} (policy {:?}, {:?})",
        config.models.dir.display(),
        config.models.on_missing,
        config.models.loading
    );
    let classifier = Arc::new(Classifier::from_config(
        &config,
        detect::default_loader(config.models.input_size),
    )?);

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        max_body_bytes: config.max_body_bytes,
    };
    let api_handle = ApiServer::new(api_config, classifier.clone()).spawn()?;
    log::info!("detect api listening on {}", api_handle.addr);
    log::info!(
        "modes: {} (default '{}')",
        classifier.modes().join(", "),
        classifier.default_mode()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("banana_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
