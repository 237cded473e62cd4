use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_PARALLEL_CHUNKS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server_url: Option<String>,
    /// Chunks in flight per file
    pub parallel_chunks: Option<usize>,
    pub channel: Option<String>,
}

impl Config {
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "depot", "depot")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn server_url(&self) -> anyhow::Result<&str> {
        self.server_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No server configured. Run: depot setup --server <url>"))
    }

    pub fn parallel_chunks(&self) -> usize {
        self.parallel_chunks.unwrap_or(DEFAULT_PARALLEL_CHUNKS).clamp(1, 64)
    }

    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or("stable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip_and_defaults() {
        let config: Config = toml::from_str("server_url = \"http://depot:8080\"\n").unwrap();
        assert_eq!(config.server_url().unwrap(), "http://depot:8080");
        assert_eq!(config.parallel_chunks(), DEFAULT_PARALLEL_CHUNKS);
        assert_eq!(config.channel(), "stable");

        let empty = Config::default();
        assert!(empty.server_url().is_err());
        let many = Config {
            parallel_chunks: Some(1000),
            ..Default::default()
        };
        assert_eq!(many.parallel_chunks(), 64);
    }
}
