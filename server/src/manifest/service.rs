//! Manifest resolution
//!
//! `resolve` tries, first match wins: the chunk-archive index, a remote
//! manifest (remote-only deployments), a native build from `SOURCE_ROOT`,
//! then a synthetic manifest when no content source is configured at all.
//! Tier failures are logged and fall through; only the last tier's failure
//! reaches the caller.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::archive::{ArchiveIndex, ArchiveIndexError, ArchiveQuery};
use super::builder::{build_from_archive_index, build_from_directory, CdnHosts};
use super::cache::ManifestCache;
use super::catalog::{GameCatalog, GameRef};
use super::model::{Manifest, ManifestIdentity};
use super::stub::build_stub;
use crate::config::Config;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest unavailable for {slug}@{version}")]
    Unavailable { slug: String, version: String },
    #[error("failed to load {what}: {source}")]
    Load {
        what: &'static str,
        #[source]
        source: ArchiveIndexError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestOrigin {
    Archive,
    Remote,
    Native,
    Synthetic,
}

/// A manifest plus where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    pub origin: ManifestOrigin,
    /// Build tree the manifest was hashed from, for native manifests.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub chunk_size: u64,
    pub hosts: CdnHosts,
    pub source_root: Option<PathBuf>,
    pub remote_only: bool,
    pub remote_manifest_url: Option<String>,
    pub remote_timeout: Duration,
    pub stubs_enabled: bool,
}

impl ManifestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            hosts: config.cdn_hosts(),
            source_root: config.source_root.clone(),
            remote_only: config.remote_only,
            remote_manifest_url: config.remote_manifest_url.clone(),
            remote_timeout: config.remote_manifest_timeout,
            stubs_enabled: config.stub_manifests,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ManifestStats {
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub resolutions: u64,
    pub version_overrides: usize,
}

pub struct ManifestService {
    settings: ManifestSettings,
    catalog: GameCatalog,
    archive: Option<ArchiveIndex>,
    cache: ManifestCache,
    overrides: Mutex<HashMap<String, String>>,
    http: reqwest::Client,
    cache_hits: AtomicU64,
    resolutions: AtomicU64,
}

impl ManifestService {
    pub fn new(
        settings: ManifestSettings,
        catalog: GameCatalog,
        archive: Option<ArchiveIndex>,
        cache: ManifestCache,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.remote_timeout)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            catalog,
            archive,
            cache,
            overrides: Mutex::new(HashMap::new()),
            http,
            cache_hits: AtomicU64::new(0),
            resolutions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ManifestError> {
        let catalog = match &config.game_catalog {
            Some(path) => GameCatalog::load(path).map_err(|source| ManifestError::Load {
                what: "game catalog",
                source,
            })?,
            None => GameCatalog::default(),
        };
        let archive = match &config.chunk_archive_index {
            Some(path) => Some(ArchiveIndex::load(path).map_err(|source| ManifestError::Load {
                what: "chunk archive index",
                source,
            })?),
            None => None,
        };
        let cache = ManifestCache::new(config.manifest_cache_ttl, config.manifest_cache_dir.clone())
            .with_max_entries(config.manifest_cache_max_entries);
        tracing::info!(
            catalog_games = catalog.len(),
            archive_games = archive.as_ref().map(|a| a.games.len()).unwrap_or(0),
            "manifest service ready"
        );
        Ok(Self::new(ManifestSettings::from_config(config), catalog, archive, cache))
    }

    pub fn settings(&self) -> &ManifestSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &GameCatalog {
        &self.catalog
    }

    /// Effective default version: override, then catalog default.
    fn default_version(&self, game: &GameRef) -> String {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&game.slug)
            .cloned()
            .unwrap_or_else(|| game.default_version.clone())
    }

    pub async fn resolve(
        &self,
        slug: &str,
        version: Option<&str>,
    ) -> Result<Arc<ResolvedManifest>, ManifestError> {
        let game = self.catalog.lookup(slug);
        let default_version = self.default_version(&game);
        let version = version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&default_version)
            .to_string();
        let is_default = version == default_version;

        let key = format!("{}:{}", game.slug, version);
        if let Some(hit) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let resolved = Arc::new(self.resolve_uncached(&game, &version, !is_default).await?);
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let mut keys = vec![key];
        if is_default {
            keys.push(game.slug.clone());
            if game.game_id != game.slug {
                keys.push(game.game_id.clone());
            }
        }
        self.cache.put(&keys, resolved.clone());
        Ok(resolved)
    }

    /// Resolve the default-version manifest of a game id.
    pub async fn resolve_game(&self, game_id: &str) -> Result<Arc<ResolvedManifest>, ManifestError> {
        if let Some(hit) = self.cache.get(game_id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        let slug = self
            .catalog
            .by_game_id(game_id)
            .map(|g| g.slug)
            .unwrap_or_else(|| game_id.to_string());
        self.resolve(&slug, None).await
    }

    /// Manifest of `game_id` that contains `file_id`.
    ///
    /// With `build_id` only that build matches. Without it the default
    /// version wins, then the newest cached version holding the file.
    pub async fn locate_file(
        &self,
        game_id: &str,
        file_id: &str,
        build_id: Option<&str>,
    ) -> Result<Option<Arc<ResolvedManifest>>, ManifestError> {
        let contains = |r: &ResolvedManifest| {
            r.manifest.game_id == game_id && r.manifest.find_by_file_id(file_id).is_some()
        };
        if let Some(build_id) = build_id {
            let pinned = self
                .cache
                .find(|r| r.manifest.build_id == build_id && contains(r));
            if pinned.is_some() {
                return Ok(pinned);
            }
        }

        let resolved = self.resolve_game(game_id).await?;
        let same_build = build_id.map_or(true, |b| resolved.manifest.build_id == b);
        if same_build && contains(&resolved) {
            return Ok(Some(resolved));
        }
        if build_id.is_some() {
            return Ok(None);
        }
        Ok(self.cache.find(contains))
    }

    /// Synthetic manifests only stand in when no real source exists.
    fn stubs_allowed(&self) -> bool {
        self.settings.stubs_enabled
            && !self.settings.remote_only
            && self.settings.source_root.is_none()
            && self.archive.is_none()
    }

    /// `pinned` is set when the caller asked for `version` explicitly.
    async fn resolve_uncached(
        &self,
        game: &GameRef,
        version: &str,
        pinned: bool,
    ) -> Result<ResolvedManifest, ManifestError> {
        let identity = ManifestIdentity {
            game_id: game.game_id.clone(),
            slug: game.slug.clone(),
            version: version.to_string(),
        };

        if let Some(entry) = self.archive.as_ref().and_then(|index| {
            index.find(ArchiveQuery {
                game_id: &game.game_id,
                slug: &game.slug,
                title: game.title.as_deref(),
                version,
            })
        }) {
            match entry.version.as_deref() {
                Some(own) if pinned && own != version => {
                    tracing::info!(
                        slug = %game.slug,
                        archive = %entry.name,
                        archive_version = own,
                        requested = version,
                        "archive entry is another version, skipped"
                    );
                }
                own => {
                    // label the manifest with the version the archive holds
                    let identity = ManifestIdentity {
                        version: own.unwrap_or(version).to_string(),
                        ..identity.clone()
                    };
                    tracing::info!(slug = %game.slug, archive = %entry.name, version = %identity.version, "manifest from chunk archive");
                    return Ok(ResolvedManifest {
                        manifest: build_from_archive_index(entry, &identity, &self.settings.hosts),
                        origin: ManifestOrigin::Archive,
                        local_root: None,
                    });
                }
            }
        }

        if self.settings.remote_only {
            match self.fetch_remote(&identity).await {
                Ok(manifest) => {
                    return Ok(ResolvedManifest {
                        manifest,
                        origin: ManifestOrigin::Remote,
                        local_root: None,
                    })
                }
                Err(reason) => {
                    tracing::warn!(slug = %game.slug, %reason, "remote manifest failed, trying native build");
                }
            }
            return match self.build_native(&identity).await {
                Some(resolved) => Ok(resolved),
                None => Err(ManifestError::Unavailable {
                    slug: game.slug.clone(),
                    version: version.to_string(),
                }),
            };
        }

        if let Some(resolved) = self.build_native(&identity).await {
            return Ok(resolved);
        }

        if self.stubs_allowed() {
            tracing::debug!(slug = %game.slug, "using synthetic manifest");
            return Ok(ResolvedManifest {
                manifest: build_stub(&identity, self.settings.chunk_size, &self.settings.hosts),
                origin: ManifestOrigin::Synthetic,
                local_root: None,
            });
        }

        Err(ManifestError::Unavailable {
            slug: game.slug.clone(),
            version: version.to_string(),
        })
    }

    /// `{root}/{slug}/{version}`, else `{root}/{slug}`.
    fn native_dir(&self, identity: &ManifestIdentity) -> Option<PathBuf> {
        let root = self.settings.source_root.as_ref()?;
        let base = root.join(&identity.slug);
        let versioned = base.join(&identity.version);
        if versioned.is_dir() {
            Some(versioned)
        } else if base.is_dir() {
            Some(base)
        } else {
            None
        }
    }

    async fn build_native(&self, identity: &ManifestIdentity) -> Option<ResolvedManifest> {
        let dir = self.native_dir(identity)?;
        let identity = identity.clone();
        let hosts = self.settings.hosts.clone();
        let chunk_size = self.settings.chunk_size;
        let root = dir.clone();
        let built = tokio::task::spawn_blocking(move || {
            build_from_directory(&root, &identity, chunk_size, &hosts)
        })
        .await;
        match built {
            Ok(Ok(manifest)) => Some(ResolvedManifest {
                manifest,
                origin: ManifestOrigin::Native,
                local_root: Some(dir),
            }),
            Ok(Err(e)) => {
                tracing::warn!(dir = %dir.display(), error = %e, "native build failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "native build task failed");
                None
            }
        }
    }

    async fn fetch_remote(&self, identity: &ManifestIdentity) -> Result<Manifest, String> {
        let base = self
            .settings
            .remote_manifest_url
            .as_deref()
            .ok_or_else(|| "REMOTE_MANIFEST_URL not configured".to_string())?;
        let url = format!(
            "{}/manifests/v2/{}",
            base.trim_end_matches('/'),
            identity.slug
        );
        let request = self
            .http
            .get(&url)
            .query(&[("version", identity.version.as_str())])
            .send();
        let response = tokio::time::timeout(self.settings.remote_timeout, request)
            .await
            .map_err(|_| format!("timed out after {:?}", self.settings.remote_timeout))?
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("upstream returned {}", response.status()));
        }
        let mut body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        // enveloped or bare
        let manifest_value = match body.get_mut("manifest") {
            Some(inner) => inner.take(),
            None => body,
        };
        let manifest: Manifest = serde_json::from_value(manifest_value).map_err(|e| e.to_string())?;
        if manifest.files.is_empty() {
            return Err("remote manifest has no files".to_string());
        }
        Ok(manifest)
    }

    fn invalidate_game(&self, slug: &str) -> usize {
        let game = self.catalog.lookup(slug);
        let prefix = format!("{}:", game.slug);
        self.cache
            .invalidate(&[game.slug.as_str(), game.game_id.as_str()], &prefix)
    }

    /// Pin the default version of `slug`.
    pub fn set_version_override(&self, slug: &str, version: &str) {
        let game = self.catalog.lookup(slug);
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(game.slug.clone(), version.to_string());
        let removed = self.invalidate_game(slug);
        tracing::info!(slug = %game.slug, version, removed, "version override set");
    }

    pub fn clear_version_override(&self, slug: &str) -> bool {
        let game = self.catalog.lookup(slug);
        let existed = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&game.slug)
            .is_some();
        let removed = self.invalidate_game(slug);
        tracing::info!(slug = %game.slug, existed, removed, "version override cleared");
        existed
    }

    pub fn stats(&self) -> ManifestStats {
        ManifestStats {
            cache_entries: self.cache.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            version_overrides: self.overrides.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Slugs worth resolving ahead of the first request.
    fn prewarm_targets(&self) -> Vec<String> {
        let mut targets: BTreeSet<String> = self.catalog.slugs().into_iter().collect();
        if let Some(index) = &self.archive {
            for name in index.game_names() {
                let slug: String = name
                    .trim()
                    .to_ascii_lowercase()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join("-");
                if !slug.is_empty() {
                    targets.insert(slug);
                }
            }
        }
        targets.into_iter().collect()
    }

    /// Resolve known games in the background until done or `shutdown` fires.
    pub fn spawn_prewarm(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let targets = service.prewarm_targets();
            tracing::info!(games = targets.len(), "manifest prewarm started");
            let mut warmed = 0usize;
            for slug in targets {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::info!(warmed, "manifest prewarm cancelled");
                        return;
                    }
                    result = service.resolve(&slug, None) => match result {
                        Ok(_) => warmed += 1,
                        Err(e) => tracing::debug!(slug = %slug, error = %e, "prewarm skipped"),
                    }
                }
            }
            tracing::info!(warmed, "manifest prewarm finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::catalog::CatalogEntry;
    use std::fs;

    fn settings(source_root: Option<PathBuf>) -> ManifestSettings {
        ManifestSettings {
            chunk_size: 1024,
            hosts: CdnHosts::new("http://cdn", vec!["http://mirror".into()]),
            source_root,
            remote_only: false,
            remote_manifest_url: None,
            remote_timeout: Duration::from_secs(1),
            stubs_enabled: true,
        }
    }

    fn catalog() -> GameCatalog {
        GameCatalog::new(vec![CatalogEntry {
            game_id: "g-1".into(),
            slug: "demo".into(),
            title: Some("Demo".into()),
            default_version: Some("1.0".into()),
        }])
    }

    fn service(settings: ManifestSettings, archive: Option<ArchiveIndex>) -> ManifestService {
        ManifestService::new(
            settings,
            catalog(),
            archive,
            ManifestCache::new(Duration::from_secs(3600), None),
        )
    }

    fn source_tree() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let v1 = temp.path().join("demo/1.0");
        fs::create_dir_all(&v1).unwrap();
        fs::write(v1.join("game.bin"), vec![1u8; 3000]).unwrap();
        let v2 = temp.path().join("demo/2.0");
        fs::create_dir_all(&v2).unwrap();
        fs::write(v2.join("game.bin"), vec![2u8; 10]).unwrap();
        temp
    }

    #[tokio::test]
    async fn test_native_build_and_cache_keys() {
        let tree = source_tree();
        let svc = service(settings(Some(tree.path().to_path_buf())), None);

        let resolved = svc.resolve("demo", None).await.unwrap();
        assert_eq!(resolved.origin, ManifestOrigin::Native);
        assert_eq!(resolved.manifest.version, "1.0");
        assert_eq!(resolved.manifest.files[0].chunks.len(), 3);
        assert_eq!(svc.stats().resolutions, 1);

        // second lookup and game id lookup hit the cache
        svc.resolve("demo", Some("1.0")).await.unwrap();
        let by_id = svc.resolve_game("g-1").await.unwrap();
        assert_eq!(by_id.manifest.build_id, resolved.manifest.build_id);
        assert_eq!(svc.stats().resolutions, 1);
        assert_eq!(svc.stats().cache_hits, 2);
    }

    #[tokio::test]
    async fn test_version_override_invalidates() {
        let tree = source_tree();
        let svc = service(settings(Some(tree.path().to_path_buf())), None);
        assert_eq!(svc.resolve("demo", None).await.unwrap().manifest.version, "1.0");

        svc.set_version_override("demo", "2.0");
        let resolved = svc.resolve("demo", None).await.unwrap();
        assert_eq!(resolved.manifest.version, "2.0");
        assert_eq!(resolved.manifest.total_size, 10);
        assert_eq!(svc.resolve_game("g-1").await.unwrap().manifest.version, "2.0");

        assert!(svc.clear_version_override("demo"));
        assert!(!svc.clear_version_override("demo"));
        assert_eq!(svc.resolve("demo", None).await.unwrap().manifest.version, "1.0");
    }

    #[tokio::test]
    async fn test_archive_takes_priority() {
        let tree = source_tree();
        let archive = ArchiveIndex::from_json(
            r#"{"games": [{"name": "Demo", "version": "1.0", "base_path": "demo",
                "chunks": [{"path": "demo.7z.001", "size": 5, "sha256": "aa"}]}]}"#,
        )
        .unwrap();
        let svc = service(settings(Some(tree.path().to_path_buf())), Some(archive));
        let resolved = svc.resolve("demo", None).await.unwrap();
        assert_eq!(resolved.origin, ManifestOrigin::Archive);
        assert_eq!(resolved.manifest.files.len(), 1);
    }

    #[tokio::test]
    async fn test_stub_fallback_and_unavailable() {
        let svc = service(settings(None), None);
        let stub = svc.resolve("unknown-game", None).await.unwrap();
        assert_eq!(stub.origin, ManifestOrigin::Synthetic);
        assert_eq!(stub.manifest.game_id, "unknown-game");
        assert_eq!(stub.manifest.version, "latest");

        let mut no_stub = settings(None);
        no_stub.stubs_enabled = false;
        let svc = service(no_stub, None);
        assert!(matches!(
            svc.resolve("unknown-game", None).await,
            Err(ManifestError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_only_falls_back_to_native_never_stub() {
        let tree = source_tree();
        let mut remote = settings(Some(tree.path().to_path_buf()));
        remote.remote_only = true;
        remote.remote_manifest_url = Some("http://127.0.0.1:9".into());
        let svc = service(remote.clone(), None);
        let resolved = svc.resolve("demo", None).await.unwrap();
        assert_eq!(resolved.origin, ManifestOrigin::Native);

        remote.source_root = None;
        let svc = service(remote, None);
        assert!(matches!(
            svc.resolve("demo", None).await,
            Err(ManifestError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_prewarm_honours_cancellation() {
        let svc = Arc::new(service(settings(None), None));
        let token = CancellationToken::new();
        token.cancel();
        svc.spawn_prewarm(token).await.unwrap();

        let svc = Arc::new(service(settings(None), None));
        svc.spawn_prewarm(CancellationToken::new()).await.unwrap();
        assert_eq!(svc.stats().resolutions, 1);
    }

    #[tokio::test]
    async fn test_locate_file_prefers_default_then_build() {
        let tree = source_tree();
        for _ in 0..20 {
            let svc = service(settings(Some(tree.path().to_path_buf())), None);
            let default = svc.resolve("demo", None).await.unwrap();
            let other = svc.resolve("demo", Some("2.0")).await.unwrap();
            let file_id = default.manifest.files[0].file_id.clone();

            let hit = svc.locate_file("g-1", &file_id, None).await.unwrap().unwrap();
            assert_eq!(hit.manifest.version, "1.0");
            assert_eq!(hit.manifest.files[0].size, 3000);

            let pinned = svc
                .locate_file("g-1", &file_id, Some(&other.manifest.build_id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pinned.manifest.version, "2.0");
            assert!(svc.locate_file("g-1", &file_id, Some("ffffffffffffffff")).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_locate_file_falls_back_to_cached_version() {
        let tree = source_tree();
        fs::write(tree.path().join("demo/2.0/extra.bin"), b"new in 2.0").unwrap();
        let svc = service(settings(Some(tree.path().to_path_buf())), None);
        svc.resolve("demo", Some("2.0")).await.unwrap();

        let file_id = crate::storage::cas::file_id_for("extra.bin");
        let hit = svc.locate_file("g-1", &file_id, None).await.unwrap().unwrap();
        assert_eq!(hit.manifest.version, "2.0");
        assert!(svc.locate_file("g-1", "000000000000", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_version_labels() {
        let archive = ArchiveIndex::from_json(
            r#"{"games": [{"name": "Demo", "version": "2.0", "base_path": "demo",
                "chunks": [{"path": "demo.7z.001", "size": 5, "sha256": "aa"}]}]}"#,
        )
        .unwrap();
        let svc = service(settings(None), Some(archive));

        // default request takes the archive build under its own version
        let resolved = svc.resolve("demo", None).await.unwrap();
        assert_eq!(resolved.origin, ManifestOrigin::Archive);
        assert_eq!(resolved.manifest.version, "2.0");
        assert_eq!(resolved.manifest.build_id, crate::manifest::model::build_id_for("g-1", "2.0"));

        // an explicit version the archive does not hold is not relabelled
        assert!(matches!(
            svc.resolve("demo", Some("3.0")).await,
            Err(ManifestError::Unavailable { .. })
        ));
        let exact = svc.resolve("demo", Some("2.0")).await.unwrap();
        assert_eq!(exact.origin, ManifestOrigin::Archive);
    }

    #[tokio::test]
    async fn test_no_stub_when_source_configured() {
        let tree = source_tree();
        let svc = service(settings(Some(tree.path().to_path_buf())), None);
        assert!(matches!(
            svc.resolve("unknown-game", None).await,
            Err(ManifestError::Unavailable { .. })
        ));
    }
}
