use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::manifest::CdnHosts;
use crate::storage::{FastHashKind, DEFAULT_CHUNK_SIZE};

#[derive(Clone, Debug)]
pub struct Config {
    pub server_name: String,
    pub bind_addr: String,
    pub rest_port: u16,
    pub primary_cdn_url: String,
    pub fallback_cdn_urls: Vec<String>,
    pub chunk_size: u64,
    pub source_root: Option<PathBuf>,
    pub chunk_archive_index: Option<PathBuf>,
    pub game_catalog: Option<PathBuf>,
    pub remote_only: bool,
    pub remote_manifest_url: Option<String>,
    pub remote_manifest_timeout: Duration,
    pub remote_source_url: Option<String>,
    pub remote_source_mirrors: Vec<String>,
    pub remote_source_token: Option<String>,
    pub full_fetch_suffixes: Vec<String>,
    pub fetch_max_attempts: u32,
    pub fetch_backoff: Duration,
    pub fetch_connect_timeout: Duration,
    pub fetch_read_timeout: Duration,
    pub manifest_cache_ttl: Duration,
    pub manifest_cache_dir: Option<PathBuf>,
    pub manifest_cache_max_entries: usize,
    pub stub_manifests: bool,
    pub fast_hash: FastHashKind,
    pub prewarm: bool,
}

struct Env<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn opt(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.or(key, default)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.opt(key).map(|v| v.to_ascii_lowercase()) {
            Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    fn parse<T>(&self, key: &str, default: &str) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.or(key, default);
        raw.parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("depotd").join("manifests"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(lookup);
        let rest_port: u16 = env.parse("REST_PORT", "8080")?;
        let chunk_size: u64 = env.parse("CHUNK_SIZE", &DEFAULT_CHUNK_SIZE.to_string())?;
        if chunk_size == 0 {
            anyhow::bail!("CHUNK_SIZE must be positive");
        }
        let fetch_max_attempts: u32 = env.parse("FETCH_MAX_ATTEMPTS", "3")?;

        let manifest_cache_dir = match env.opt("MANIFEST_CACHE_DIR") {
            Some(v) if v.eq_ignore_ascii_case("off") => None,
            Some(v) => Some(PathBuf::from(v)),
            None => default_cache_dir(),
        };

        Ok(Config {
            server_name: env.or("SERVER_NAME", "Depot"),
            bind_addr: env.or("BIND_ADDR", "0.0.0.0"),
            rest_port,
            primary_cdn_url: env.or("PRIMARY_CDN_URL", &format!("http://localhost:{rest_port}")),
            fallback_cdn_urls: env.list("FALLBACK_CDN_URLS", ""),
            chunk_size,
            source_root: env.opt("SOURCE_ROOT").map(PathBuf::from),
            chunk_archive_index: env.opt("CHUNK_ARCHIVE_INDEX").map(PathBuf::from),
            game_catalog: env.opt("GAME_CATALOG").map(PathBuf::from),
            remote_only: env.flag("REMOTE_ONLY", false),
            remote_manifest_url: env.opt("REMOTE_MANIFEST_URL"),
            remote_manifest_timeout: Duration::from_secs(env.parse("REMOTE_MANIFEST_TIMEOUT_SECS", "15")?),
            remote_source_url: env.opt("REMOTE_SOURCE_URL"),
            remote_source_mirrors: env.list("REMOTE_SOURCE_MIRRORS", ""),
            remote_source_token: env.opt("REMOTE_SOURCE_TOKEN"),
            full_fetch_suffixes: env.list("FULL_FETCH_SUFFIXES", ".json,.txt"),
            fetch_max_attempts: fetch_max_attempts.max(1),
            fetch_backoff: Duration::from_millis(env.parse("FETCH_BACKOFF_MS", "500")?),
            fetch_connect_timeout: Duration::from_secs(env.parse("FETCH_CONNECT_TIMEOUT_SECS", "10")?),
            fetch_read_timeout: Duration::from_secs(env.parse("FETCH_READ_TIMEOUT_SECS", "120")?),
            manifest_cache_ttl: Duration::from_secs(env.parse("MANIFEST_CACHE_TTL_SECS", "86400")?),
            manifest_cache_dir,
            manifest_cache_max_entries: env.parse("MANIFEST_CACHE_MAX_ENTRIES", "1024")?,
            stub_manifests: env.flag("STUB_MANIFESTS", true),
            fast_hash: env.parse("FAST_HASH", "auto")?,
            prewarm: env.flag("PREWARM", true),
        })
    }

    pub fn cdn_hosts(&self) -> CdnHosts {
        CdnHosts::new(self.primary_cdn_url.clone(), self.fallback_cdn_urls.clone())
    }

    pub fn set_server_name(&mut self, name: String) {
        self.server_name = name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_with(&[]).unwrap();
        assert_eq!(config.server_name, "Depot");
        assert_eq!(config.rest_port, 8080);
        assert_eq!(config.primary_cdn_url, "http://localhost:8080");
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.fetch_max_attempts, 3);
        assert_eq!(config.fetch_backoff, Duration::from_millis(500));
        assert_eq!(config.remote_manifest_timeout, Duration::from_secs(15));
        assert_eq!(config.manifest_cache_ttl, Duration::from_secs(86_400));
        assert_eq!(config.manifest_cache_max_entries, 1024);
        assert_eq!(config.full_fetch_suffixes, vec![".json", ".txt"]);
        assert!(config.stub_manifests);
        assert!(!config.remote_only);
        assert_eq!(config.fast_hash, FastHashKind::Auto);
    }

    #[test]
    fn test_overrides_and_lists() {
        let config = config_with(&[
            ("REST_PORT", "9000"),
            ("FALLBACK_CDN_URLS", "http://a, http://b,,"),
            ("REMOTE_ONLY", "yes"),
            ("STUB_MANIFESTS", "false"),
            ("MANIFEST_CACHE_DIR", "off"),
            ("FAST_HASH", "portable"),
        ])
        .unwrap();
        assert_eq!(config.primary_cdn_url, "http://localhost:9000");
        assert_eq!(config.fallback_cdn_urls, vec!["http://a", "http://b"]);
        assert!(config.remote_only);
        assert!(!config.stub_manifests);
        assert!(config.manifest_cache_dir.is_none());
        assert_eq!(config.fast_hash, FastHashKind::Portable);
        assert_eq!(config.cdn_hosts().fallbacks.len(), 2);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config_with(&[("CHUNK_SIZE", "0")]).is_err());
        assert!(config_with(&[("REST_PORT", "http")]).is_err());
        assert!(config_with(&[("FAST_HASH", "md5")]).is_err());
    }
}
