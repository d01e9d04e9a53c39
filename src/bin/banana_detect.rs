//! banana_detect - classify image files from the command line
//!
//! Prints one JSON outcome per image, using the same configuration and
//! cascades as `banana_api`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use banana_cascade::{detect, BananaConfig, Classifier};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Images to classify.
    #[arg(required = true)]
    images: Vec<PathBuf>,
    /// Inference mode (defaults to the configured default mode).
    #[arg(long)]
    mode: Option<String>,
    /// Config file (JSON or TOML).
    #[arg(long, env = "BANANA_CONFIG")]
    config: Option<PathBuf>,
    /// Exit non-zero if any image is not classified.
    #[arg(long, default_value_t = false)]
    strict: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BananaConfig::load_from(path)?,
        None => BananaConfig::load()?,
    };
    let classifier = Classifier::from_config(
        &config,
        detect::default_loader(config.models.input_size),
    )?;

    let mut failures = 0usize;
    for path in &args.images {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let outcome = classifier.classify(&bytes, args.mode.as_deref());
        if !outcome.is_success() {
            failures += 1;
        }
        let mut response = outcome.to_response();
        if let Some(obj) = response.as_object_mut() {
            obj.insert(
                "file".to_string(),
                serde_json::Value::String(path.display().to_string()),
            );
        }
        println!("{}", serde_json::to_string(&response)?);
    }

    if args.strict && failures > 0 {
        return Err(anyhow!(
            "{} of {} image(s) were not classified",
            failures,
            args.images.len()
        ));
    }
    Ok(())
}
