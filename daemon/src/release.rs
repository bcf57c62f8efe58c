/// Remote update source: the latest GitHub release of a variant's project.
///
/// Only two operations are needed by the dash subsystem: describing the latest
/// asset (size for update detection, release name as version) and downloading it. Both are async so a
/// download can be abandoned by dropping the future.
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::dash_variant::RemoteSource;
use crate::error::ReleaseError;

const GITHUB_API_BASE: &str = "https://api.github.com/repos";
const USER_AGENT: &str = concat!("PCVR-Nexus/", env!("CARGO_PKG_VERSION"));

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub size: u64,
    pub download_url: String,
    /// Release title, used as the "available version".
    pub release_name: Option<String>,
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Looks up `source.asset` in the latest release of `source.repo/source.project`.
    async fn latest_asset(&self, source: &RemoteSource) -> Result<ReleaseAsset, ReleaseError>;

    /// Streams `asset` to `dest`, returning the number of bytes written.
    async fn download(&self, asset: &ReleaseAsset, dest: &Path) -> Result<u64, ReleaseError>;
}

#[derive(Debug, Deserialize)]
struct GitRelease {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    assets: Vec<GitAsset>,
}

#[derive(Debug, Deserialize)]
struct GitAsset {
    name: String,
    size: u64,
    browser_download_url: String,
}

/// Picks the asset called `source.asset` out of a `releases/latest` response.
fn find_asset(release: GitRelease, source: &RemoteSource) -> Result<ReleaseAsset, ReleaseError> {
    let release_name = release.name;
    release
        .assets
        .into_iter()
        .find(|a| a.name == source.asset)
        .map(|a| ReleaseAsset {
            name: a.name,
            size: a.size,
            download_url: a.browser_download_url,
            release_name,
        })
        .ok_or_else(|| ReleaseError::AssetNotFound {
            repo: source.repo.clone(),
            project: source.project.clone(),
            asset: source.asset.clone(),
        })
}

/// [`ReleaseSource`] backed by the public GitHub REST API.
pub struct GitHubReleases {
    client: reqwest::Client,
    api_base: String,
}

impl GitHubReleases {
    pub fn new() -> Result<Self, ReleaseError> {
        Self::with_base(GITHUB_API_BASE)
    }

    pub fn with_base(api_base: impl Into<String>) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }

    fn latest_url(&self, source: &RemoteSource) -> String {
        format!(
            "{}/{}/{}/releases/latest",
            self.api_base.trim_end_matches('/'),
            source.repo,
            source.project
        )
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleases {
    async fn latest_asset(&self, source: &RemoteSource) -> Result<ReleaseAsset, ReleaseError> {
        let url = self.latest_url(source);
        debug!(%url, "querying latest release");
        let release: GitRelease = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        find_asset(release, source)
    }

    async fn download(&self, asset: &ReleaseAsset, dest: &Path) -> Result<u64, ReleaseError> {
        let response = self
            .client
            .get(&asset.download_url)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(asset = %asset.name, bytes = written, dest = %dest.display(), "download complete");
        Ok(written)
    }
}
