//! Release artifact enumeration and download.
//!
//! A release consists of a fixed set of package names built for every
//! configured build target. Filenames follow the packaging conventions of
//! each format, so the whole set can be enumerated up front from the version
//! string alone. Optional packages that are missing upstream are tolerated;
//! required ones are fatal.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::BuildTarget;
use crate::download::ArtifactDownloader;
use crate::error::RepoResult;

/// Target bucket of one artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    /// Debian package.
    Deb,
    /// RPM package.
    Rpm,
    /// Plain tarball.
    Tgz,
    /// Checksum sidecar of a tarball.
    TgzSha,
}

impl PackageFormat {
    /// Filename suffix required for this bucket.
    pub fn suffix(&self) -> &'static str {
        match self {
            PackageFormat::Deb => ".deb",
            PackageFormat::Rpm => ".rpm",
            PackageFormat::Tgz => ".tgz",
            PackageFormat::TgzSha => ".tgz.sha512",
        }
    }
}

/// One artifact file of a release.
#[derive(Debug, Clone)]
pub struct Package {
    /// Location on local disk (present after download).
    pub path: PathBuf,
    /// Logical package name, e.g. `app-client`.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Target format bucket.
    pub format: PackageFormat,
    /// Path suffix under the builds URL prefix.
    pub s3_suffix: String,
}

impl Package {
    /// Filename of the artifact.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    /// `name=version` identity, as understood by reprepro's `copy` command.
    pub fn name_version(&self) -> String {
        format!("{}={}", self.name, self.version)
    }

    /// Whether the artifact is present on local disk.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    async fn download(
        &self,
        downloader: &dyn ArtifactDownloader,
        url_prefix: &str,
        overwrite: bool,
    ) -> RepoResult<()> {
        if !overwrite && self.path.exists() {
            info!("File {} already exists, skipping", self.path.display());
            return Ok(());
        }
        // Plain string join: the URL prefix may carry a double slash that
        // path joining would collapse.
        let url = format!("{}/{}", url_prefix.trim_end_matches('/'), self.s3_suffix);
        if let Err(e) = downloader.download(&url, &self.path).await {
            warn!("Failed to download package {}, removing", self.file_name());
            let _ = std::fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(())
    }
}

/// All artifacts of one release, partitioned by format bucket.
#[derive(Debug, Clone, Default)]
pub struct PackageSet {
    /// Required Debian packages.
    pub deb: Vec<Package>,
    /// Required RPM packages.
    pub rpm: Vec<Package>,
    /// Required tarballs.
    pub tgz: Vec<Package>,
    /// Required tarball checksums.
    pub tgz_sha: Vec<Package>,
    optional_deb: Vec<Package>,
    optional_rpm: Vec<Package>,
    optional_tgz: Vec<Package>,
    optional_tgz_sha: Vec<Package>,
}

fn make_package(
    dir: &Path,
    version: &str,
    build: &BuildTarget,
    name: &str,
    format: PackageFormat,
) -> Package {
    let file_name = match format {
        PackageFormat::Deb => format!("{}_{}_{}.deb", name, version, build.deb_arch),
        PackageFormat::Rpm => format!("{}-{}.{}.rpm", name, version, build.rpm_arch),
        PackageFormat::Tgz => format!("{}-{}-{}.tgz", name, version, build.deb_arch),
        PackageFormat::TgzSha => {
            format!("{}-{}-{}.tgz.sha512", name, version, build.deb_arch)
        }
    };
    Package {
        path: dir.join(&file_name),
        name: name.to_string(),
        version: version.to_string(),
        format,
        s3_suffix: format!("{}/{}", build.check_name, file_name),
    }
}

impl PackageSet {
    /// Enumerate the artifact set for `version`, rooted at `dir`.
    pub fn new(
        dir: &Path,
        version: &str,
        builds: &[BuildTarget],
        packages: &[String],
        optional_packages: &[String],
    ) -> Self {
        let mut set = PackageSet::default();
        for build in builds {
            for name in packages {
                for (bucket, format) in [
                    (&mut set.deb, PackageFormat::Deb),
                    (&mut set.rpm, PackageFormat::Rpm),
                    (&mut set.tgz, PackageFormat::Tgz),
                    (&mut set.tgz_sha, PackageFormat::TgzSha),
                ] {
                    bucket.push(make_package(dir, version, build, name, format));
                }
            }
            for name in optional_packages {
                for (bucket, format) in [
                    (&mut set.optional_deb, PackageFormat::Deb),
                    (&mut set.optional_rpm, PackageFormat::Rpm),
                    (&mut set.optional_tgz, PackageFormat::Tgz),
                    (&mut set.optional_tgz_sha, PackageFormat::TgzSha),
                ] {
                    bucket.push(make_package(dir, version, build, name, format));
                }
            }
        }
        set
    }

    /// Download every artifact under `url_prefix`.
    ///
    /// Required artifacts propagate their download failure. Optional ones are
    /// attempted after the required set; a success promotes the package into
    /// the required bucket, a failure is logged and skipped.
    pub async fn download(
        &mut self,
        downloader: &dyn ArtifactDownloader,
        url_prefix: &str,
        overwrite: bool,
    ) -> RepoResult<()> {
        Self::download_bucket("deb", &mut self.deb, &mut self.optional_deb, downloader, url_prefix, overwrite).await?;
        Self::download_bucket("rpm", &mut self.rpm, &mut self.optional_rpm, downloader, url_prefix, overwrite).await?;
        Self::download_bucket("tgz", &mut self.tgz, &mut self.optional_tgz, downloader, url_prefix, overwrite).await?;
        Self::download_bucket("tgz_sha", &mut self.tgz_sha, &mut self.optional_tgz_sha, downloader, url_prefix, overwrite).await?;
        Ok(())
    }

    async fn download_bucket(
        kind: &str,
        required: &mut Vec<Package>,
        optional: &mut Vec<Package>,
        downloader: &dyn ArtifactDownloader,
        url_prefix: &str,
        overwrite: bool,
    ) -> RepoResult<()> {
        info!(
            "Downloading {} packages:\n  {}",
            kind,
            required
                .iter()
                .map(|p| p.file_name().to_string())
                .collect::<Vec<_>>()
                .join("\n  ")
        );
        for package in required.iter() {
            package.download(downloader, url_prefix, overwrite).await?;
        }
        for package in optional.drain(..) {
            match package.download(downloader, url_prefix, overwrite).await {
                Ok(()) => required.push(package),
                Err(_) => {
                    warn!(
                        "Failed to download optional package {}, continue",
                        package.file_name()
                    );
                }
            }
        }
        Ok(())
    }

    /// All downloaded packages across the format buckets.
    pub fn all(&self) -> impl Iterator<Item = &Package> {
        self.deb
            .iter()
            .chain(self.rpm.iter())
            .chain(self.tgz.iter())
            .chain(self.tgz_sha.iter())
    }

    /// Tarballs together with their checksum sidecars, as published by the
    /// tarball repository.
    pub fn tgz_with_sha(&self) -> Vec<Package> {
        self.tgz
            .iter()
            .chain(self.tgz_sha.iter())
            .cloned()
            .collect()
    }
}
