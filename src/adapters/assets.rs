//! Remote asset store adapter.
//!
//! Precompiled modules are published under a deterministic identifier,
//! `<base>/<required-version>-<kernel-release>.tar.gz`. Retrieval failures
//! (network, missing asset) surface as errors and are confined by the caller
//! to the fetch-precompiled stage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::run_checked;
use crate::domain::ports::AssetStore;
use crate::error::Result;
use crate::version::ModuleVersion;

/// Asset store reachable over HTTP.
pub struct HttpAssetStore {
    base_url: String,
    scratch_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpAssetStore {
    pub fn new(base_url: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            scratch_dir: scratch_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Deterministic asset identifier for a `(version, kernel)` pair.
    pub fn asset_url(&self, required: &ModuleVersion, kernel_release: &str) -> String {
        format!(
            "{}/{}-{}.tar.gz",
            self.base_url.trim_end_matches('/'),
            required.base(),
            kernel_release
        )
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn fetch_module(
        &self,
        required: &ModuleVersion,
        kernel_release: &str,
        install_root: &Path,
    ) -> Result<()> {
        let url = self.asset_url(required, kernel_release);
        debug!(%url, "fetching precompiled module");

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let tarball = self
            .scratch_dir
            .join(format!("{}-{}.tar.gz", required.base(), kernel_release));
        tokio::fs::write(&tarball, &bytes).await?;

        tokio::fs::create_dir_all(install_root).await?;
        let tarball_str = tarball.display().to_string();
        let root_str = install_root.display().to_string();
        run_checked(
            Path::new("tar"),
            &["xzf", &tarball_str, "-C", &root_str],
            None,
        )
        .await?;

        info!(%url, root = %install_root.display(), "extracted precompiled module");
        Ok(())
    }
}
