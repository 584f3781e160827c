//! On-disk package repository trees.
//!
//! One [`RepoSet`] composes the three format repositories under a single
//! configured root:
//!
//! ```text
//! {root}/configs/deb/conf/distributions   generated reprepro config
//! {root}/configs/deb/db/...               reprepro index database
//! {root}/configs/archive/*.tar.gz         retained snapshots
//! {root}/deb/...                          published pool/dists tree
//! {root}/rpm/{codename}/...               RPMs + repodata + signature + pubkey
//! {root}/tgz/{codename}/...               tarballs + checksum sidecars
//! ```
//!
//! All mutation must happen while the caller holds the update gate; the
//! repositories do not re-check that themselves.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::DebConfig;
use crate::error::{RepoError, RepoResult};
use crate::exec::CommandRunner;
use crate::fsutil;
use crate::packages::{Package, PackageSet};
use crate::transaction::ConfigTransaction;

const DEB_CONFIG_DIR: &str = "configs/deb";
const ARCHIVE_DIR: &str = "configs/archive";

/// One packaging format's repository tree.
///
/// `add_codename` incorporates the packages into one release channel; the
/// default `add_packages` fans out over the primary codename and the extras
/// in caller-supplied order, each channel completing before the next starts.
#[async_trait]
pub trait PackageRepository: Send + Sync {
    /// Short format label for logs.
    fn format_name(&self) -> &'static str;

    /// Incorporate the packages into `codename`.
    async fn add_codename(&self, codename: &str) -> RepoResult<()>;

    /// Incorporate the packages into the primary codename, then each extra.
    async fn add_packages(&self, primary: &str, extras: &[String]) -> RepoResult<()> {
        self.add_codename(primary).await?;
        for extra in extras {
            self.add_codename(extra).await?;
        }
        Ok(())
    }
}

/// Reject packages whose filename does not carry `expected`.
///
/// Runs before any filesystem mutation so a mismatch never leaves partial
/// state behind.
fn check_suffix(packages: &[Package], expected: &str, extra: Option<&str>) -> RepoResult<()> {
    let offending: Vec<String> = packages
        .iter()
        .map(|p| p.file_name().to_string())
        .filter(|name| {
            !name.ends_with(expected) && !extra.map_or(false, |e| name.ends_with(e))
        })
        .collect();
    if !offending.is_empty() {
        return Err(RepoError::FormatMismatch {
            expected: expected.to_string(),
            files: offending,
        });
    }
    Ok(())
}

/// Debian repository maintained through reprepro.
///
/// The reprepro config/database tree is mutated under a
/// [`ConfigTransaction`]; the published pool under `{root}/deb` is written
/// directly by reprepro with forced metadata export.
pub struct DebRepo {
    packages: Vec<Package>,
    root: PathBuf,
    config: DebConfig,
    sign_key: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for DebRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebRepo")
            .field("packages", &self.packages)
            .field("root", &self.root)
            .field("config", &self.config)
            .field("sign_key", &self.sign_key)
            .finish_non_exhaustive()
    }
}

impl DebRepo {
    /// Validate the package set and prepare the repository directories.
    pub fn new(
        packages: Vec<Package>,
        root: &Path,
        config: DebConfig,
        sign_key: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> RepoResult<Self> {
        check_suffix(&packages, ".deb", None)?;
        let repo = Self {
            packages,
            root: root.to_path_buf(),
            config,
            sign_key: sign_key.to_string(),
            runner,
        };
        fsutil::ensure_dir(&repo.config_dir())?;
        fsutil::ensure_dir(&repo.outdir())?;
        Ok(repo)
    }

    fn config_dir(&self) -> PathBuf {
        self.root.join(DEB_CONFIG_DIR)
    }

    fn outdir(&self) -> PathBuf {
        self.root.join("deb")
    }

    fn reprepro_args(&self, basedir: &Path) -> Vec<String> {
        vec![
            "--basedir".to_string(),
            basedir.to_string_lossy().into_owned(),
            "--verbose".to_string(),
            "--export=force".to_string(),
            "--outdir".to_string(),
            self.outdir().to_string_lossy().into_owned(),
        ]
    }

    /// Run the include/copy sequence against the transaction's working copy.
    async fn include(
        &self,
        basedir: &Path,
        primary: &str,
        extras: &[String],
    ) -> RepoResult<()> {
        let dists = basedir.join("conf").join("distributions");
        if !dists.exists() {
            fsutil::ensure_dir(basedir.join("conf").as_path())?;
            fs::write(&dists, self.config.render_distributions(&self.sign_key))?;
            info!("Generated {} for the first run", dists.display());
        }

        let mut args = self.reprepro_args(basedir);
        args.push("includedeb".to_string());
        args.push(primary.to_string());
        args.extend(
            self.packages
                .iter()
                .map(|p| p.path.to_string_lossy().into_owned()),
        );
        info!("Deploying DEB packages to codename {}", primary);
        let output = self.runner.run("reprepro", &args, None).await?;
        info!("Deployment logs:\n{}", output.combined());

        for extra in extras {
            // reprepro's copy works on already-indexed package identity, so
            // the pairs are name=version, deduplicated across architectures.
            let pairs: BTreeSet<String> =
                self.packages.iter().map(|p| p.name_version()).collect();
            let mut args = self.reprepro_args(basedir);
            args.push("copy".to_string());
            args.push(extra.to_string());
            args.push(primary.to_string());
            args.extend(pairs);
            info!("Deploying DEB packages to additional codename {}", extra);
            let output = self.runner.run("reprepro", &args, None).await?;
            info!("Deployment logs:\n{}", output.combined());
        }
        Ok(())
    }
}

#[async_trait]
impl PackageRepository for DebRepo {
    fn format_name(&self) -> &'static str {
        "deb"
    }

    async fn add_codename(&self, codename: &str) -> RepoResult<()> {
        self.add_packages(codename, &[]).await
    }

    async fn add_packages(&self, primary: &str, extras: &[String]) -> RepoResult<()> {
        let archive_dir = self.root.join(ARCHIVE_DIR);
        let txn = ConfigTransaction::begin(&self.config_dir(), &archive_dir, "deb")?;
        match self.include(txn.work_tree(), primary, extras).await {
            Ok(()) => txn.commit(),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }
}

/// RPM repository maintained through createrepo_c, with a detached GPG
/// signature and an exported public key next to the metadata.
pub struct RpmRepo {
    packages: Vec<Package>,
    root: PathBuf,
    sign_key: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for RpmRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpmRepo")
            .field("packages", &self.packages)
            .field("root", &self.root)
            .field("sign_key", &self.sign_key)
            .finish_non_exhaustive()
    }
}

impl RpmRepo {
    /// Validate the package set and prepare the repository directory.
    pub fn new(
        packages: Vec<Package>,
        root: &Path,
        sign_key: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> RepoResult<Self> {
        check_suffix(&packages, ".rpm", None)?;
        let repo = Self {
            packages,
            root: root.to_path_buf(),
            sign_key: sign_key.to_string(),
            runner,
        };
        fsutil::ensure_dir(&repo.outdir())?;
        Ok(repo)
    }

    fn outdir(&self) -> PathBuf {
        self.root.join("rpm")
    }

    /// Copy, index, sign and export the public key inside `dest`.
    async fn populate(&self, dest: &Path, codename: &str) -> RepoResult<()> {
        info!("Copying RPM packages to {} directory", codename);
        for package in &self.packages {
            fsutil::copy_if_not_exists(&package.path, dest)?;
        }

        info!("Updating index for RPM packages in {}", codename);
        let output = self
            .runner
            .run(
                "createrepo_c",
                &[
                    "--local-sqlite".to_string(),
                    "--workers=2".to_string(),
                    "--update".to_string(),
                    "--verbose".to_string(),
                    dest.to_string_lossy().into_owned(),
                ],
                None,
            )
            .await?;
        debug!("createrepo_c output:\n{}", output.combined());

        let repomd = dest.join("repodata").join("repomd.xml");
        let output = self
            .runner
            .run(
                "gpg",
                &[
                    "--sign-with".to_string(),
                    self.sign_key.clone(),
                    "--detach-sign".to_string(),
                    "--batch".to_string(),
                    "--yes".to_string(),
                    "--armor".to_string(),
                    repomd.to_string_lossy().into_owned(),
                ],
                None,
            )
            .await?;
        debug!("gpg output:\n{}", output.combined());

        info!("Updating repomd.xml.key");
        let output = self
            .runner
            .run(
                "gpg",
                &[
                    "--armor".to_string(),
                    "--export".to_string(),
                    self.sign_key.clone(),
                ],
                None,
            )
            .await?;
        // Public key comes from stdout alone; stderr may carry gpg chatter.
        fs::write(dest.join("repodata").join("repomd.xml.key"), output.stdout)?;
        Ok(())
    }
}

#[async_trait]
impl PackageRepository for RpmRepo {
    fn format_name(&self) -> &'static str {
        "rpm"
    }

    async fn add_codename(&self, codename: &str) -> RepoResult<()> {
        let dest = self.outdir().join(codename);
        fsutil::ensure_dir(&dest)?;
        let archive_dir = self.root.join(ARCHIVE_DIR);
        let txn =
            ConfigTransaction::begin(&dest, &archive_dir, &format!("rpm-{}", codename))?;
        match self.populate(txn.work_tree(), codename).await {
            Ok(()) => txn.commit(),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }
}

/// Tarball repository: a flat per-codename drop of tarballs and their
/// checksum sidecars, no indexing or signing.
#[derive(Debug)]
pub struct TgzRepo {
    packages: Vec<Package>,
    root: PathBuf,
}

impl TgzRepo {
    /// Validate the package set and prepare the repository directory.
    pub fn new(packages: Vec<Package>, root: &Path) -> RepoResult<Self> {
        check_suffix(&packages, ".tgz", Some(".tgz.sha512"))?;
        let repo = Self {
            packages,
            root: root.to_path_buf(),
        };
        fsutil::ensure_dir(&repo.outdir())?;
        Ok(repo)
    }

    fn outdir(&self) -> PathBuf {
        self.root.join("tgz")
    }
}

#[async_trait]
impl PackageRepository for TgzRepo {
    fn format_name(&self) -> &'static str {
        "tgz"
    }

    async fn add_codename(&self, codename: &str) -> RepoResult<()> {
        let dest = self.outdir().join(codename);
        fsutil::ensure_dir(&dest)?;
        let archive_dir = self.root.join(ARCHIVE_DIR);
        let txn =
            ConfigTransaction::begin(&dest, &archive_dir, &format!("tgz-{}", codename))?;
        info!("Deploying TGZ packages to {}", codename);
        let result: RepoResult<()> = self
            .packages
            .iter()
            .try_for_each(|p| fsutil::copy_if_not_exists(&p.path, txn.work_tree()).map(|_| ()));
        match result {
            Ok(()) => txn.commit(),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }
}

/// The three format repositories behind one call.
#[derive(Debug)]
pub struct RepoSet {
    deb: DebRepo,
    rpm: RpmRepo,
    tgz: TgzRepo,
}

impl RepoSet {
    /// Validate the root, remount it if it is a mount point, and construct
    /// the three format repositories.
    ///
    /// Must only be called while the update gate is held: the remount and
    /// the transactions both assume no sibling writer.
    pub async fn new(
        packages: &PackageSet,
        root: &Path,
        deb_config: DebConfig,
        sign_key: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> RepoResult<Self> {
        if !root.is_dir() {
            return Err(RepoError::MissingRoot(root.to_path_buf()));
        }
        remount_if_needed(root, runner.as_ref()).await?;

        let build = || -> RepoResult<Self> {
            Ok(Self {
                deb: DebRepo::new(
                    packages.deb.clone(),
                    root,
                    deb_config,
                    sign_key,
                    Arc::clone(&runner),
                )?,
                rpm: RpmRepo::new(packages.rpm.clone(), root, sign_key, Arc::clone(&runner))?,
                tgz: TgzRepo::new(packages.tgz_with_sha(), root)?,
            })
        };
        build().map_err(|e| {
            error!("Failed to prepare repositories: {}", e);
            e
        })
    }

    /// Publish the packages to the primary codename and the extras, format
    /// by format: deb, then rpm, then tgz.
    pub async fn add_packages(&self, primary: &str, extras: &[String]) -> RepoResult<()> {
        let repos: [&dyn PackageRepository; 3] = [&self.deb, &self.rpm, &self.tgz];
        for repo in repos {
            info!("Updating {} repository", repo.format_name());
            repo.add_packages(primary, extras).await?;
        }
        Ok(())
    }
}

/// Remount the repository root if it is a mount point.
///
/// Network filesystems accumulate consistency anomalies between runs; a
/// fresh mount clears them. A failed probe means "not a mount point" and is
/// skipped silently, but unmount/mount failures after a positive probe are
/// fatal.
async fn remount_if_needed(root: &Path, runner: &dyn CommandRunner) -> RepoResult<()> {
    let root_arg = root.to_string_lossy().into_owned();
    match runner
        .run("mountpoint", &["-q".to_string(), root_arg.clone()], None)
        .await
    {
        Ok(_) => {
            info!("{} is a mount point, remounting", root.display());
            runner.run("umount", &[root_arg.clone()], None).await?;
            runner.run("mount", &[root_arg], None).await?;
            Ok(())
        }
        Err(e) => {
            debug!(
                "{} is not a mount point, skipping remount ({})",
                root.display(),
                e
            );
            Ok(())
        }
    }
}
