use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Quizbot configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on updates processed at once; unbounded when unset.
    pub max_concurrency: Option<usize>,
    /// Buffer between stdin and the app.
    pub channel_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            max_concurrency: env::var("QUIZBOT_MAX_CONCURRENCY")
                .ok()
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("QUIZBOT_MAX_CONCURRENCY must be a valid number")?,
            channel_capacity: env::var("QUIZBOT_CHANNEL_CAPACITY")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .context("QUIZBOT_CHANNEL_CAPACITY must be a valid number")?,
        })
    }
}
