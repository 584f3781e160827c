//! Publish-flow driver.
//!
//! One release request turns into one background worker that downloads the
//! build artifacts for the tagged commit, incorporates them into the package
//! repositories while holding the update gate, uploads them as release
//! assets and records a pass/fail commit status together with the operation
//! log.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lazy_regex::regex_captures;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::download::ArtifactDownloader;
use crate::error::{RepoError, RepoResult};
use crate::exec::CommandRunner;
use crate::fsutil;
use crate::gate::UpdateGate;
use crate::packages::PackageSet;
use crate::repository::RepoSet;

/// Filename of the per-release operation log.
pub const LOG_NAME: &str = "publish-release.txt";
/// Marker file recording a completed publish.
const FINISHED_MARKER: &str = "finished";

/// A parsed release tag of the form `v{A}.{B}.{C}.{D}-{type}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTag {
    /// The full tag string.
    pub tag: String,
    /// The dotted version, e.g. `22.8.2.11`.
    pub version: String,
    /// The release channel, doubling as the primary codename.
    pub version_type: String,
    /// First two version components, used as the builds prefix.
    pub release_branch: String,
}

impl ReleaseTag {
    /// Parse and validate a version tag.
    pub fn parse(tag: &str) -> RepoResult<Self> {
        let (_, version, version_type) = regex_captures!(
            r"^v(\d+\.\d+\.\d+\.\d+)-(lts|prestable|stable|testing)$",
            tag
        )
        .ok_or_else(|| RepoError::InvalidTag(tag.to_string()))?;
        let release_branch = version
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".");
        Ok(Self {
            tag: tag.to_string(),
            version: version.to_string(),
            version_type: version_type.to_string(),
            release_branch,
        })
    }

    /// Extra codenames the release also lands in: an `lts` release is
    /// republished into `stable`.
    pub fn extra_codenames(&self) -> Vec<String> {
        if self.version_type == "lts" {
            vec!["stable".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Release hosting collaborator (tag/release/asset/status operations).
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    /// Resolve a tag to its commit SHA; missing tags are an error.
    async fn resolve_tag(&self, tag: &str) -> RepoResult<String>;
    /// Verify a release object exists for the tag.
    async fn release_exists(&self, tag: &str) -> RepoResult<()>;
    /// Names of assets already attached to the release.
    async fn existing_assets(&self, tag: &str) -> RepoResult<Vec<String>>;
    /// Attach a file as a release asset.
    async fn upload_asset(&self, tag: &str, path: &Path) -> RepoResult<()>;
    /// Record a commit status for the publish outcome.
    async fn create_commit_status(
        &self,
        sha: &str,
        success: bool,
        description: &str,
        target_url: &str,
    ) -> RepoResult<()>;
}

/// Report upload collaborator; returns the public URL of the report.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Upload `path` under `key`, returning where it can be read.
    async fn upload_report(&self, key: &str, path: &Path) -> RepoResult<String>;
}

/// Filesystem-backed [`ReleaseHost`] for deployments where release state is
/// mirrored to disk by another process.
pub struct LocalReleaseHost {
    root: PathBuf,
}

impl LocalReleaseHost {
    /// Create a host rooted at `root`, creating the directory if needed.
    pub fn new(root: &Path) -> RepoResult<Self> {
        fsutil::ensure_dir(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn assets_dir(&self, tag: &str) -> PathBuf {
        self.root.join("releases").join(tag).join("assets")
    }
}

#[async_trait]
impl ReleaseHost for LocalReleaseHost {
    async fn resolve_tag(&self, tag: &str) -> RepoResult<String> {
        let path = self.root.join("tags").join(tag);
        let sha = fs::read_to_string(&path)
            .map_err(|_| RepoError::Release(format!("tag '{}' is not found", tag)))?;
        Ok(sha.trim().to_string())
    }

    async fn release_exists(&self, tag: &str) -> RepoResult<()> {
        if self.root.join("releases").join(tag).is_dir() {
            Ok(())
        } else {
            Err(RepoError::Release(format!(
                "release for tag '{}' is not found",
                tag
            )))
        }
    }

    async fn existing_assets(&self, tag: &str) -> RepoResult<Vec<String>> {
        let dir = self.assets_dir(tag);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        Ok(fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect())
    }

    async fn upload_asset(&self, tag: &str, path: &Path) -> RepoResult<()> {
        let dir = self.assets_dir(tag);
        fsutil::ensure_dir(&dir)?;
        fsutil::copy_if_not_exists(path, &dir)?;
        Ok(())
    }

    async fn create_commit_status(
        &self,
        sha: &str,
        success: bool,
        description: &str,
        target_url: &str,
    ) -> RepoResult<()> {
        let dir = self.root.join("statuses");
        fsutil::ensure_dir(&dir)?;
        let state = if success { "success" } else { "failure" };
        fs::write(
            dir.join(sha),
            format!("{}\n{}\n{}\n", state, description, target_url),
        )?;
        Ok(())
    }
}

/// Filesystem-backed [`ReportStore`].
pub struct LocalReportStore {
    root: PathBuf,
}

impl LocalReportStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: &Path) -> RepoResult<Self> {
        fsutil::ensure_dir(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

#[async_trait]
impl ReportStore for LocalReportStore {
    async fn upload_report(&self, key: &str, path: &Path) -> RepoResult<String> {
        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            fsutil::ensure_dir(parent)?;
        }
        fs::copy(path, &dest)?;
        url::Url::from_file_path(&dest)
            .map(|u| u.to_string())
            .map_err(|_| RepoError::Release(format!("cannot build URL for {}", dest.display())))
    }
}

/// Per-release operation log, uploaded with the status report.
struct ReleaseLog {
    path: PathBuf,
}

impl ReleaseLog {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn append(&self, line: &str) {
        use std::io::Write;
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            warn!("Failed to append to release log {}: {}", self.path.display(), e);
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Drives the publish flow for release requests.
pub struct Publisher {
    config: Arc<ServiceConfig>,
    gate: UpdateGate,
    runner: Arc<dyn CommandRunner>,
    downloader: Arc<dyn ArtifactDownloader>,
    host: Arc<dyn ReleaseHost>,
    reports: Arc<dyn ReportStore>,
}

impl Publisher {
    /// Assemble a publisher from its collaborators.
    pub fn new(
        config: Arc<ServiceConfig>,
        gate: UpdateGate,
        runner: Arc<dyn CommandRunner>,
        downloader: Arc<dyn ArtifactDownloader>,
        host: Arc<dyn ReleaseHost>,
        reports: Arc<dyn ReportStore>,
    ) -> Self {
        Self {
            config,
            gate,
            runner,
            downloader,
            host,
            reports,
        }
    }

    /// Whether this tag has already been published successfully.
    pub fn is_processed(&self, tag: &str) -> bool {
        self.config
            .releases_dir()
            .join(tag)
            .join(FINISHED_MARKER)
            .exists()
    }

    /// Publish one release end to end, recording the outcome as a commit
    /// status either way.
    pub async fn publish(&self, tag: &str, additional_binaries: &[String]) -> RepoResult<()> {
        let tag = ReleaseTag::parse(tag)?;
        let sha = self.host.resolve_tag(&tag.tag).await?;
        self.host.release_exists(&tag.tag).await?;
        info!("The release is created for tag {} and commit {}", tag.tag, sha);

        let release_dir = self.config.releases_dir().join(&tag.tag);
        fsutil::ensure_dir(&release_dir)?;
        let log = ReleaseLog::new(release_dir.join(LOG_NAME));
        log.append(&format!("publishing {} at commit {}", tag.tag, sha));

        let result = self
            .run(&tag, &sha, &release_dir, additional_binaries, &log)
            .await;
        match &result {
            Ok(()) => {
                log.append("release deployed");
                self.mark_finished(&tag, &sha, true, &log).await?;
                info!("The background task for {} is done", tag.tag);
            }
            Err(e) => {
                log.append(&format!("release failed: {}", e));
                // Status reporting must not mask the original failure.
                if let Err(mark_err) = self.mark_finished(&tag, &sha, false, &log).await {
                    warn!("Failed to record failure status: {}", mark_err);
                }
            }
        }
        result
    }

    async fn run(
        &self,
        tag: &ReleaseTag,
        sha: &str,
        release_dir: &Path,
        additional_binaries: &[String],
        log: &ReleaseLog,
    ) -> RepoResult<()> {
        let builds_prefix = self.config.builds_url_prefix(&tag.release_branch, sha);
        let mut packages = PackageSet::new(
            release_dir,
            &tag.version,
            &self.config.builds,
            &self.config.packages,
            &self.config.optional_packages,
        );
        packages
            .download(self.downloader.as_ref(), &builds_prefix, false)
            .await?;
        log.append("packages downloaded");

        if self.gate.is_locked() {
            info!("The repositories are already updating by another worker, waiting");
        }
        {
            let _guard = self.gate.acquire().await;
            let repos = RepoSet::new(
                &packages,
                &self.config.repos_root,
                self.config.deb.clone(),
                &self.config.signing_key,
                Arc::clone(&self.runner),
            )
            .await?;
            repos
                .add_packages(&tag.version_type, &tag.extra_codenames())
                .await?;
        }
        log.append("repositories updated");

        let existing = self.host.existing_assets(&tag.tag).await?;
        for package in packages.all() {
            if existing.iter().any(|name| name == package.file_name()) {
                info!(
                    "Asset {} already exists for release {}",
                    package.file_name(),
                    tag.tag
                );
                continue;
            }
            info!("Uploading {} to the release assets", package.file_name());
            self.host.upload_asset(&tag.tag, &package.path).await?;
        }
        log.append("assets uploaded");

        self.process_additional_binaries(tag, &builds_prefix, release_dir, additional_binaries)
            .await?;
        Ok(())
    }

    /// Download and attach standalone binaries for the requested build
    /// flavors. Older releases may predate some flavors, so a failed
    /// download is tolerated.
    async fn process_additional_binaries(
        &self,
        tag: &ReleaseTag,
        builds_prefix: &str,
        release_dir: &Path,
        names: &[String],
    ) -> RepoResult<()> {
        for name in names {
            let url = format!(
                "{}/{}/{}",
                builds_prefix, name, self.config.binary_artifact_name
            );
            let dest = release_dir.join(format!("{}-{}", self.config.binary_artifact_name, name));
            if dest.exists() {
                info!("Binary for build {} already exists", name);
                continue;
            }
            info!("Downloading {} to {}", url, dest.display());
            match self.downloader.download(&url, &dest).await {
                Ok(()) => {
                    info!("Upload {} to the release assets", dest.display());
                    self.host.upload_asset(&tag.tag, &dest).await?;
                }
                Err(RepoError::Download(e)) => {
                    warn!("Can't download additional binary {}: {}", name, e);
                    let _ = fs::remove_file(&dest);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn mark_finished(
        &self,
        tag: &ReleaseTag,
        sha: &str,
        success: bool,
        log: &ReleaseLog,
    ) -> RepoResult<()> {
        info!(
            "Mark the release as finished with status '{}'",
            if success { "success" } else { "failure" }
        );
        if success {
            fs::write(
                self.config
                    .releases_dir()
                    .join(&tag.tag)
                    .join(FINISHED_MARKER),
                b"",
            )?;
        }
        let key = format!("{}/{}/release/{}", tag.release_branch, sha, LOG_NAME);
        let log_url = self.reports.upload_report(&key, log.path()).await?;
        let description = if success {
            "Release artifacts successfully deployed"
        } else {
            "Failed to deploy release artifacts"
        };
        self.host
            .create_commit_status(sha, success, description, &log_url)
            .await
    }
}
