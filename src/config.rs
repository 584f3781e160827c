//! Service configuration.
//!
//! Configuration is loaded from a JSON file, with `REPO_PUBLISHER_*`
//! environment variables applied on top so a deployment can override single
//! values without editing the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, RepoResult};

/// Debian distribution metadata, rendered into reprepro's
/// `conf/distributions` file.
///
/// See `man 1 reprepro`, section "conf/distributions".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebConfig {
    /// `Origin:` field.
    pub origin: String,
    /// `Label:` field.
    pub label: String,
    /// Architectures indexed per codename.
    pub architectures: Vec<String>,
    /// Codenames (release channels) to declare.
    pub codenames: Vec<String>,
    /// Repository components.
    pub components: Vec<String>,
    /// `SignWith:` key identifier; falls back to the global signing key when
    /// unset.
    pub sign_with: Option<String>,
    /// `Limit:` field; -1 keeps all package versions.
    pub limit: i64,
}

impl Default for DebConfig {
    fn default() -> Self {
        Self {
            origin: "Example".to_string(),
            label: "Example".to_string(),
            architectures: vec!["amd64".to_string(), "arm64".to_string()],
            codenames: vec!["lts".to_string(), "stable".to_string()],
            components: vec!["main".to_string()],
            sign_with: None,
            limit: -1,
        }
    }
}

impl DebConfig {
    /// The signing identity to use, defaulting to `default_key`.
    pub fn sign_with_or<'a>(&'a self, default_key: &'a str) -> &'a str {
        self.sign_with.as_deref().unwrap_or(default_key)
    }

    /// Render the `conf/distributions` file, one stanza per codename.
    ///
    /// The rendering is deterministic: fields appear in a fixed order and
    /// stanzas follow the configured codename order.
    pub fn render_distributions(&self, default_key: &str) -> String {
        let mut stanzas = Vec::with_capacity(self.codenames.len());
        for codename in &self.codenames {
            stanzas.push(format!(
                "Origin: {}\nLabel: {}\nCodename: {}\nArchitectures: {}\nComponents: {}\nSignWith: {}\nLimit: {}\n",
                self.origin,
                self.label,
                codename,
                self.architectures.join(" "),
                self.components.join(" "),
                self.sign_with_or(default_key),
                self.limit,
            ));
        }
        stanzas.join("\n")
    }

    fn validate(&self) -> RepoResult<()> {
        if self.codenames.is_empty() {
            return Err(RepoError::Configuration(
                "at least one Debian codename must be configured".to_string(),
            ));
        }
        if self.architectures.is_empty() {
            return Err(RepoError::Configuration(
                "at least one Debian architecture must be configured".to_string(),
            ));
        }
        if self.components.is_empty() {
            return Err(RepoError::Configuration(
                "at least one Debian component must be configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// One CI build flavor producing artifacts for a (deb, rpm) architecture
/// pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTarget {
    /// CI check name; artifacts live under this prefix in the builds bucket.
    pub check_name: String,
    /// Architecture string used in deb and tgz filenames.
    pub deb_arch: String,
    /// Architecture string used in rpm filenames.
    pub rpm_arch: String,
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// GitHub repository the release tags live in, as `owner/name`.
    pub github_repository: String,
    /// Root of the published package repository trees.
    pub repos_root: PathBuf,
    /// Scratch directory for downloads, per-release logs and state markers.
    pub working_dir: PathBuf,
    /// Base URL of the S3 endpoint artifacts are downloaded from.
    pub s3_url: String,
    /// Bucket holding CI build artifacts.
    pub s3_builds_bucket: String,
    /// Bucket the per-release publish logs are uploaded to.
    pub s3_test_reports_bucket: String,
    /// Default GPG signing key identifier.
    pub signing_key: String,
    /// Address the HTTP front end binds to.
    pub bind_address: String,
    /// Package names published for every release.
    pub packages: Vec<String>,
    /// Package names that may be absent for older releases.
    pub optional_packages: Vec<String>,
    /// Standalone binary artifact name inside each build prefix.
    pub binary_artifact_name: String,
    /// Build flavors to fetch artifacts for.
    pub builds: Vec<BuildTarget>,
    /// Debian repository metadata.
    pub deb: DebConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            github_repository: "example/example".to_string(),
            repos_root: PathBuf::from("/srv/repos"),
            working_dir: PathBuf::from("/var/lib/repo-publisher"),
            s3_url: "https://s3.amazonaws.com".to_string(),
            s3_builds_bucket: "builds".to_string(),
            s3_test_reports_bucket: "test-reports".to_string(),
            signing_key: String::new(),
            bind_address: "127.0.0.1:8080".to_string(),
            packages: Vec::new(),
            optional_packages: Vec::new(),
            binary_artifact_name: "binary".to_string(),
            builds: vec![
                BuildTarget {
                    check_name: "package_release".to_string(),
                    deb_arch: "amd64".to_string(),
                    rpm_arch: "x86_64".to_string(),
                },
                BuildTarget {
                    check_name: "package_aarch64".to_string(),
                    deb_arch: "arm64".to_string(),
                    rpm_arch: "aarch64".to_string(),
                },
            ],
            deb: DebConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file and apply environment overrides.
    pub fn from_file(path: &Path) -> RepoResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RepoError::Configuration(format!("failed to read config file: {}", e))
        })?;
        let mut config: ServiceConfig = serde_json::from_str(&content)
            .map_err(|e| RepoError::Configuration(format!("failed to parse config: {}", e)))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `REPO_PUBLISHER_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("REPO_PUBLISHER_REPOS_ROOT") {
            self.repos_root = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("REPO_PUBLISHER_WORKING_DIR") {
            self.working_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("REPO_PUBLISHER_SIGNING_KEY") {
            self.signing_key = value;
        }
        if let Ok(value) = std::env::var("REPO_PUBLISHER_GITHUB_REPOSITORY") {
            self.github_repository = value;
        }
        if let Ok(value) = std::env::var("REPO_PUBLISHER_S3_URL") {
            self.s3_url = value;
        }
        if let Ok(value) = std::env::var("REPO_PUBLISHER_BIND_ADDRESS") {
            self.bind_address = value;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RepoResult<()> {
        if self.packages.is_empty() {
            return Err(RepoError::Configuration(
                "at least one package name must be configured".to_string(),
            ));
        }
        if self.builds.is_empty() {
            return Err(RepoError::Configuration(
                "at least one build target must be configured".to_string(),
            ));
        }
        self.deb.validate()
    }

    /// Directory per-release state lives in.
    pub fn releases_dir(&self) -> PathBuf {
        self.working_dir.join("releases")
    }

    /// URL prefix the artifacts of one commit are downloaded from.
    pub fn builds_url_prefix(&self, release_branch: &str, sha: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.s3_url.trim_end_matches('/'),
            self.s3_builds_bucket,
            release_branch,
            sha
        )
    }
}
