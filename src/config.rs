use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;

use crate::client::CLASSIFY_PATH;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Image to classify
    pub image: PathBuf,

    /// Base URL of the classification server
    #[arg(long, env = "CLASSIFIER_URL", default_value = "http://127.0.0.1:5000")]
    pub server_url: String,

    /// Declared MIME type of the image, instead of detecting it
    #[arg(long, env = "IMAGE_MIME")]
    pub mime: Option<String>,

    /// Show only the N most likely labels
    #[arg(long, env = "TOP_RESULTS")]
    pub top: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn endpoint(&self) -> Result<Url> {
        let base = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server URL {:?}", self.server_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("server URL {:?} cannot carry a path", self.server_url);
        }
        base.join(CLASSIFY_PATH)
            .with_context(|| format!("cannot build endpoint from {:?}", self.server_url))
    }
}
