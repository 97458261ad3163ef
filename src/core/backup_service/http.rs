use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_LENGTH;
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{BackupService, object_key};

const UPLOAD_CHUNK_SIZE: usize = 128 * 1024;

/// Uploads archives with `PUT <endpoint>/<key>`, streamed from disk.
pub struct HttpBackupService {
    endpoint: String,
    token: Option<String>,
    hostname: String,
    client: reqwest::Client,
}

impl HttpBackupService {
    pub fn new(endpoint: String, token: Option<String>, hostname: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("frosty/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            hostname,
            client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl BackupService for HttpBackupService {
    fn name(&self) -> &'static str {
        "http"
    }

    fn display_location(&self) -> String {
        format!("HTTP endpoint: {}", self.endpoint)
    }

    fn artifact_file_base_name(&self, job_name: &str) -> String {
        format!("{}_{}", self.hostname, job_name)
    }

    async fn initialize(&self) -> Result<()> {
        let response = self
            .authorize(self.client.head(&self.endpoint))
            .send()
            .await
            .with_context(|| format!("Endpoint {} is unreachable", self.endpoint))?;

        if response.status().is_server_error() {
            bail!(
                "Endpoint {} responded with {}",
                self.endpoint,
                response.status()
            );
        }

        debug!(endpoint = %self.endpoint, status = %response.status(), "HTTP backup service ready");
        Ok(())
    }

    async fn store_file(&self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("Not a file path: {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        let url = format!(
            "{}/{}",
            self.endpoint,
            object_key(&self.hostname, &file_name, Utc::now())
        );

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let bytes = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE));

        let response = self
            .authorize(self.client.put(&url))
            .header(CONTENT_LENGTH, bytes)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to {}", url))?;

        response
            .error_for_status_ref()
            .with_context(|| format!("Upload to {} was rejected", url))?;

        info!(url = %url, bytes = bytes, "Stored archive");
        Ok(())
    }
}
