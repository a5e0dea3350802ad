//! Server configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8870";
const DEFAULT_DATABASE_URL: &str = "caresync.db";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    /// JSON file with the project definitions served by this deployment.
    pub projects_file: Option<PathBuf>,
    /// FCM `messages:send` endpoint; push delivery is disabled when unset.
    pub fcm_endpoint: Option<String>,
    pub fcm_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_var("CARESYNC_BIND")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()?;
        Ok(Self {
            bind_addr,
            database_url: env_var("CARESYNC_DATABASE")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            projects_file: env_var("CARESYNC_PROJECTS").map(PathBuf::from),
            fcm_endpoint: env_var("CARESYNC_FCM_ENDPOINT"),
            fcm_token: env_var("CARESYNC_FCM_TOKEN"),
        })
    }
}
