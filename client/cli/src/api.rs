use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

// --- Manifest types ---

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkEntry {
    pub index: u32,
    #[serde(default)]
    pub hash: String,
    pub size: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
}

impl ChunkEntry {
    /// Primary URL first, then the mirrors.
    pub fn urls(&self) -> Vec<String> {
        std::iter::once(self.url.clone())
            .chain(self.fallback_urls.iter().cloned())
            .filter(|u| !u.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub chunks: Vec<ChunkEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub game_id: String,
    pub slug: String,
    pub version: String,
    pub build_id: String,
    pub chunk_size: u64,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Integrity {
    pub algorithm: String,
    pub canonical_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEnvelope {
    pub schema_version: u32,
    pub slug: String,
    pub channel: String,
    pub version: String,
    pub integrity: Integrity,
    pub manifest: Manifest,
}

// --- Server info ---

#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub fast_hash: String,
}

// --- Sessions ---

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSession {
    pub id: Uuid,
    pub download_id: String,
    pub slug: String,
    pub version: String,
    pub status: String,
    pub stage: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionResponse {
    pub session: DownloadSession,
    pub task: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateSession<'a> {
    pub slug: &'a str,
    pub version: Option<&'a str>,
    pub channel: &'a str,
    pub method: &'a str,
    pub install_path: Option<String>,
}

// --- Self-heal ---

#[derive(Debug, Clone, Deserialize)]
pub struct ScanFile {
    pub path: String,
    pub status: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanSummary {
    pub total: usize,
    pub verified: usize,
    pub missing: usize,
    pub corrupt: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanReport {
    pub report_id: String,
    pub engine: String,
    pub summary: ScanSummary,
    pub files: Vec<ScanFile>,
    pub hot_fix_queue: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairQueueItem {
    pub path: String,
    pub expected_size: u64,
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairPlan {
    pub repair_id: String,
    pub strategy: String,
    pub queue: Vec<RepairQueueItem>,
    pub queue_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairResponse {
    pub report_id: String,
    pub dry_run: bool,
    pub repair_plan: RepairPlan,
    pub applied: bool,
    pub message: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    async fn ensure_ok(resp: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} failed ({}): {}", what, status, body);
        }
        Ok(resp)
    }

    pub async fn get_server_info(&self) -> anyhow::Result<ServerInfo> {
        let url = format!("{}/server/info", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::ensure_ok(resp, "Server info").await?;
        Ok(resp.json().await?)
    }

    pub async fn get_manifest(
        &self,
        slug: &str,
        version: Option<&str>,
        channel: &str,
    ) -> anyhow::Result<ManifestEnvelope> {
        let url = format!("{}/manifests/v2/{}", self.base_url, slug);
        let mut query = vec![("channel", channel)];
        if let Some(version) = version {
            query.push(("version", version));
        }
        let resp = self.client.get(&url).query(&query).send().await?;
        let resp = Self::ensure_ok(resp, "Manifest fetch").await?;
        Ok(resp.json().await?)
    }

    pub async fn create_session(&self, req: &CreateSession<'_>) -> anyhow::Result<SessionResponse> {
        let url = format!("{}/v2/download-sessions", self.base_url);
        let resp = self.client.post(&url).json(req).send().await?;
        let resp = Self::ensure_ok(resp, "Session create").await?;
        Ok(resp.json().await?)
    }

    pub async fn control_session(&self, id: Uuid, action: &str) -> anyhow::Result<SessionResponse> {
        let url = format!("{}/v2/download-sessions/{}/control", self.base_url, id);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "action": action }))
            .send()
            .await?;
        let resp = Self::ensure_ok(resp, "Session control").await?;
        Ok(resp.json().await?)
    }

    pub async fn session_state(&self, id: Uuid) -> anyhow::Result<SessionResponse> {
        let url = format!("{}/v2/download-sessions/{}/state", self.base_url, id);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::ensure_ok(resp, "Session state").await?;
        Ok(resp.json().await?)
    }

    pub async fn scan(
        &self,
        slug: &str,
        version: Option<&str>,
        install_path: &str,
        fast: bool,
    ) -> anyhow::Result<ScanReport> {
        let url = format!("{}/v2/self-heal/scan", self.base_url);
        let body = serde_json::json!({
            "install_path": install_path,
            "slug": slug,
            "version": version,
            "use_usn_delta": fast,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = Self::ensure_ok(resp, "Scan").await?;
        Ok(resp.json().await?)
    }

    pub async fn repair_plan(
        &self,
        slug: &str,
        version: Option<&str>,
        install_path: &str,
        dry_run: bool,
    ) -> anyhow::Result<RepairResponse> {
        let url = format!("{}/v2/self-heal/repair", self.base_url);
        let body = serde_json::json!({
            "slug": slug,
            "version": version,
            "install_path": install_path,
            "dry_run": dry_run,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = Self::ensure_ok(resp, "Repair plan").await?;
        Ok(resp.json().await?)
    }
}
