//! End-to-end tests for the repository synchronization and publish flow.
//!
//! External tools (reprepro, createrepo_c, gpg, mount) are replaced by a
//! scripted runner that records every invocation and simulates the side
//! effects the repositories rely on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use repo_publisher::config::{BuildTarget, DebConfig, ServiceConfig};
use repo_publisher::download::ArtifactDownloader;
use repo_publisher::error::{RepoError, RepoResult};
use repo_publisher::exec::{render_command, CommandOutput, CommandRunner};
use repo_publisher::gate::UpdateGate;
use repo_publisher::packages::{Package, PackageFormat, PackageSet};
use repo_publisher::release::{LocalReleaseHost, LocalReportStore, Publisher};
use repo_publisher::repository::RepoSet;

const PUBKEY: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----\nmQ==\n-----END PGP PUBLIC KEY BLOCK-----";

/// Scripted [`CommandRunner`] simulating the external indexing tools.
struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    /// Fail any command whose rendered line contains this needle.
    fail_containing: Option<String>,
    /// Concurrency probe across command invocations.
    inside: AtomicUsize,
    max_inside: AtomicUsize,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_containing: None,
            inside: AtomicUsize::new(0),
            max_inside: AtomicUsize::new(0),
        }
    }

    fn failing_on(needle: &str) -> Self {
        Self {
            fail_containing: Some(needle.to_string()),
            ..Self::new()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn arg_after(args: &[String], flag: &str) -> Option<PathBuf> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from)
    }

    fn simulate_reprepro(args: &[String]) -> std::io::Result<()> {
        let outdir = Self::arg_after(args, "--outdir").unwrap();
        let basedir = Self::arg_after(args, "--basedir").unwrap();
        if let Some(idx) = args.iter().position(|a| a == "includedeb") {
            for file in &args[idx + 2..] {
                let src = Path::new(file);
                let name = src.file_name().unwrap().to_string_lossy().into_owned();
                let pkg = name.split('_').next().unwrap_or("unknown").to_string();
                let letter = pkg.chars().next().unwrap_or('a').to_string();
                let pool = outdir.join("pool/main").join(letter).join(pkg);
                fs::create_dir_all(&pool)?;
                fs::copy(src, pool.join(&name))?;
            }
            fs::create_dir_all(basedir.join("db"))?;
            fs::write(basedir.join("db/packages.db"), b"indexed")?;
        }
        Ok(())
    }

    fn simulate_gpg(args: &[String]) -> std::io::Result<CommandOutput> {
        if args.iter().any(|a| a == "--detach-sign") {
            let target = PathBuf::from(args.last().unwrap());
            fs::write(target.with_extension("xml.asc"), b"signature")?;
            Ok(CommandOutput::default())
        } else {
            // --export: the public key arrives on stdout.
            Ok(CommandOutput {
                stdout: PUBKEY.to_string(),
                stderr: "gpg: exporting key".to_string(),
            })
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _cwd: Option<&Path>,
    ) -> RepoResult<CommandOutput> {
        let line = render_command(program, args);
        self.calls.lock().unwrap().push(line.clone());

        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.inside.fetch_sub(1, Ordering::SeqCst);

        if let Some(needle) = &self.fail_containing {
            if line.contains(needle.as_str()) {
                return Err(RepoError::ExternalTool {
                    command: line,
                    output: "simulated failure".to_string(),
                });
            }
        }
        let result = match program {
            "mountpoint" => {
                return Err(RepoError::ExternalTool {
                    command: line,
                    output: String::new(),
                })
            }
            "reprepro" => Self::simulate_reprepro(args).map(|_| CommandOutput::default()),
            "createrepo_c" => {
                let dest = PathBuf::from(args.last().unwrap());
                fs::create_dir_all(dest.join("repodata"))
                    .and_then(|_| fs::write(dest.join("repodata/repomd.xml"), b"<repomd/>"))
                    .map(|_| CommandOutput::default())
            }
            "gpg" => Self::simulate_gpg(args),
            _ => Ok(CommandOutput::default()),
        };
        result.map_err(RepoError::Io)
    }
}

fn write_package(dir: &Path, file_name: &str, name: &str, version: &str, format: PackageFormat) -> Package {
    let path = dir.join(file_name);
    fs::write(&path, file_name.as_bytes()).unwrap();
    Package {
        path,
        name: name.to_string(),
        version: version.to_string(),
        format,
        s3_suffix: format!("package_release/{}", file_name),
    }
}

fn read_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_end_to_end_single_deb_to_stable() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let pkg_dir = tmp.path().join("pkgs");
    fs::create_dir(&pkg_dir).unwrap();

    let mut set = PackageSet::default();
    set.deb.push(write_package(
        &pkg_dir,
        "clickhouse-client_22.8.2.11_amd64.deb",
        "clickhouse-client",
        "22.8.2.11",
        PackageFormat::Deb,
    ));

    let runner = Arc::new(ScriptedRunner::new());
    let repos = RepoSet::new(&set, &root, DebConfig::default(), "KEY", runner.clone())
        .await
        .unwrap();
    repos.add_packages("stable", &[]).await.unwrap();

    // Generated reprepro configuration declares the codename.
    let dists = fs::read_to_string(root.join("configs/deb/conf/distributions")).unwrap();
    assert!(dists.contains("Codename: stable\n"));

    // The pool holds a file derived from the input package.
    let pool_file = root.join("deb/pool/main/c/clickhouse-client/clickhouse-client_22.8.2.11_amd64.deb");
    assert!(pool_file.is_file());

    // Exactly one new Debian config archive.
    let archives = read_names(&root.join("configs/archive"));
    assert_eq!(
        archives.iter().filter(|n| n.starts_with("deb-")).count(),
        1
    );
    // The rpm and tgz trees also committed their (empty) snapshots.
    assert_eq!(
        archives.iter().filter(|n| n.starts_with("rpm-stable-")).count(),
        1
    );
    assert_eq!(
        archives.iter().filter(|n| n.starts_with("tgz-stable-")).count(),
        1
    );
}

#[tokio::test]
async fn test_deb_transaction_atomicity_on_tool_failure() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    // Pre-existing config/db state from an earlier run.
    fs::create_dir_all(root.join("configs/deb/conf")).unwrap();
    fs::write(root.join("configs/deb/conf/distributions"), b"Codename: stable\n").unwrap();
    fs::create_dir_all(root.join("configs/deb/db")).unwrap();
    fs::write(root.join("configs/deb/db/packages.db"), b"pristine").unwrap();

    let pkg_dir = tmp.path().join("pkgs");
    fs::create_dir(&pkg_dir).unwrap();
    let mut set = PackageSet::default();
    set.deb.push(write_package(
        &pkg_dir,
        "app_1.0.0.0_amd64.deb",
        "app",
        "1.0.0.0",
        PackageFormat::Deb,
    ));

    let runner = Arc::new(ScriptedRunner::failing_on("includedeb"));
    let repos = RepoSet::new(&set, &root, DebConfig::default(), "KEY", runner)
        .await
        .unwrap();
    let err = repos
        .add_packages("stable", &[])
        .await
        .expect_err("include failure must propagate");
    assert!(matches!(err, RepoError::ExternalTool { .. }));

    // Byte-for-byte identical to the pre-call state.
    assert_eq!(
        fs::read(root.join("configs/deb/conf/distributions")).unwrap(),
        b"Codename: stable\n"
    );
    assert_eq!(
        fs::read(root.join("configs/deb/db/packages.db")).unwrap(),
        b"pristine"
    );
    assert_eq!(read_names(&root.join("configs/deb")), vec!["conf", "db"]);
    assert!(!root.join("configs/archive").exists());
    // No stray transaction directories left behind.
    assert!(read_names(&root.join("configs"))
        .iter()
        .all(|n| !n.starts_with(".txn-")));
}

#[tokio::test]
async fn test_extra_codename_copy_uses_deduplicated_identity() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let pkg_dir = tmp.path().join("pkgs");
    fs::create_dir(&pkg_dir).unwrap();

    // The same package name across two architectures.
    let mut set = PackageSet::default();
    for file in ["app_1.2.3.4_amd64.deb", "app_1.2.3.4_arm64.deb"] {
        set.deb
            .push(write_package(&pkg_dir, file, "app", "1.2.3.4", PackageFormat::Deb));
    }

    let runner = Arc::new(ScriptedRunner::new());
    let repos = RepoSet::new(&set, &root, DebConfig::default(), "KEY", runner.clone())
        .await
        .unwrap();
    repos
        .add_packages("stable", &["lts".to_string()])
        .await
        .unwrap();

    let copy_call = runner
        .calls()
        .into_iter()
        .find(|line| line.contains(" copy "))
        .expect("a copy invocation must happen for the extra codename");
    // Destination first, source second, then one identity pair despite two
    // input files.
    assert!(copy_call.ends_with("copy lts stable app=1.2.3.4"), "{}", copy_call);
}

#[tokio::test]
async fn test_rpm_flow_signs_and_exports_public_key() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let pkg_dir = tmp.path().join("pkgs");
    fs::create_dir(&pkg_dir).unwrap();

    let mut set = PackageSet::default();
    set.rpm.push(write_package(
        &pkg_dir,
        "app-1.2.3.4.x86_64.rpm",
        "app",
        "1.2.3.4",
        PackageFormat::Rpm,
    ));

    let runner = Arc::new(ScriptedRunner::new());
    let repos = RepoSet::new(&set, &root, DebConfig::default(), "KEY", runner.clone())
        .await
        .unwrap();
    repos.add_packages("stable", &[]).await.unwrap();

    let dest = root.join("rpm/stable");
    assert!(dest.join("app-1.2.3.4.x86_64.rpm").is_file());
    assert!(dest.join("repodata/repomd.xml").is_file());
    assert!(dest.join("repodata/repomd.xml.asc").is_file());
    // The exported key is stdout only, without gpg's stderr chatter.
    assert_eq!(fs::read_to_string(dest.join("repodata/repomd.xml.key")).unwrap(), PUBKEY);

    let calls = runner.calls();
    let order: Vec<&str> = calls
        .iter()
        .filter_map(|line| {
            if line.starts_with("createrepo_c") {
                Some("index")
            } else if line.contains("--detach-sign") {
                Some("sign")
            } else if line.contains("--export") {
                Some("export")
            } else {
                None
            }
        })
        .collect();
    assert_eq!(order, vec!["index", "sign", "export"]);
}

#[tokio::test]
async fn test_gate_serializes_concurrent_repo_updates() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let pkg_dir = tmp.path().join("pkgs");
    fs::create_dir(&pkg_dir).unwrap();

    let mut set = PackageSet::default();
    set.deb.push(write_package(
        &pkg_dir,
        "app_1.0.0.0_amd64.deb",
        "app",
        "1.0.0.0",
        PackageFormat::Deb,
    ));

    let runner = Arc::new(ScriptedRunner::new());
    let gate = UpdateGate::new();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let set = set.clone();
        let root = root.clone();
        let runner = Arc::clone(&runner);
        let gate = gate.clone();
        tasks.push(tokio::spawn(async move {
            let _guard = gate.acquire().await;
            let repos = RepoSet::new(&set, &root, DebConfig::default(), "KEY", runner)
                .await
                .unwrap();
            repos.add_packages("stable", &[]).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    // The probe inside the runner never saw two commands in flight at once.
    assert_eq!(runner.max_inside.load(Ordering::SeqCst), 1);
}

/// Downloader serving artifacts from an in-memory allowlist.
struct ScriptedDownloader {
    missing_suffixes: Vec<String>,
    requests: AtomicUsize,
}

impl ScriptedDownloader {
    fn new(missing_suffixes: Vec<String>) -> Self {
        Self {
            missing_suffixes,
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ArtifactDownloader for ScriptedDownloader {
    async fn download(&self, url: &str, dest: &Path) -> RepoResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .missing_suffixes
            .iter()
            .any(|suffix| url.ends_with(suffix.as_str()))
        {
            return Err(RepoError::Download(format!("404: {}", url)));
        }
        fs::write(dest, url.as_bytes())?;
        Ok(())
    }
}

fn publisher_fixture(tmp: &TempDir, downloader: Arc<ScriptedDownloader>) -> (Arc<Publisher>, PathBuf) {
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    let working = tmp.path().join("working");
    let host_root = tmp.path().join("release-host");

    // Release metadata the host resolves the tag against.
    fs::create_dir_all(host_root.join("tags")).unwrap();
    fs::write(host_root.join("tags/v22.8.2.11-lts"), "deadbeef\n").unwrap();
    fs::create_dir_all(host_root.join("releases/v22.8.2.11-lts")).unwrap();

    let config = ServiceConfig {
        repos_root: root,
        working_dir: working.clone(),
        signing_key: "KEY".to_string(),
        packages: vec!["app".to_string()],
        optional_packages: vec!["app-extra".to_string()],
        builds: vec![BuildTarget {
            check_name: "package_release".to_string(),
            deb_arch: "amd64".to_string(),
            rpm_arch: "x86_64".to_string(),
        }],
        ..Default::default()
    };

    let publisher = Publisher::new(
        Arc::new(config),
        UpdateGate::new(),
        Arc::new(ScriptedRunner::new()),
        downloader,
        Arc::new(LocalReleaseHost::new(&host_root).unwrap()),
        Arc::new(LocalReportStore::new(&tmp.path().join("reports")).unwrap()),
    );
    (Arc::new(publisher), tmp.path().to_path_buf())
}

#[tokio::test]
async fn test_publish_lts_release_end_to_end() {
    let tmp = TempDir::new().unwrap();
    // Optional package missing upstream: tolerated.
    let downloader = Arc::new(ScriptedDownloader::new(vec![
        "app-extra_22.8.2.11_amd64.deb".to_string(),
        "app-extra-22.8.2.11.x86_64.rpm".to_string(),
        "app-extra-22.8.2.11-amd64.tgz".to_string(),
        "app-extra-22.8.2.11-amd64.tgz.sha512".to_string(),
    ]));
    let (publisher, base) = publisher_fixture(&tmp, downloader);

    publisher.publish("v22.8.2.11-lts", &[]).await.unwrap();

    assert!(publisher.is_processed("v22.8.2.11-lts"));
    assert!(base
        .join("working/releases/v22.8.2.11-lts/finished")
        .exists());

    // lts releases fan out into stable as well.
    let root = base.join("root");
    assert!(root.join("rpm/lts/app-22.8.2.11.x86_64.rpm").is_file());
    assert!(root.join("rpm/stable/app-22.8.2.11.x86_64.rpm").is_file());
    assert!(root.join("tgz/lts/app-22.8.2.11-amd64.tgz").is_file());
    assert!(root.join("tgz/lts/app-22.8.2.11-amd64.tgz.sha512").is_file());

    // Assets uploaded for every downloaded package.
    let assets = read_names(&base.join("release-host/releases/v22.8.2.11-lts/assets"));
    assert_eq!(
        assets,
        vec![
            "app-22.8.2.11-amd64.tgz",
            "app-22.8.2.11-amd64.tgz.sha512",
            "app-22.8.2.11.x86_64.rpm",
            "app_22.8.2.11_amd64.deb",
        ]
    );

    // Success status recorded against the commit, pointing at the log.
    let status = fs::read_to_string(base.join("release-host/statuses/deadbeef")).unwrap();
    assert!(status.starts_with("success\n"));
    assert!(tmp
        .path()
        .join("reports/22.8/deadbeef/release/publish-release.txt")
        .is_file());
}

#[tokio::test]
async fn test_publish_failure_records_failure_status() {
    let tmp = TempDir::new().unwrap();
    // A required artifact is missing: the publish must fail.
    let downloader = Arc::new(ScriptedDownloader::new(vec![
        "app_22.8.2.11_amd64.deb".to_string(),
    ]));
    let (publisher, base) = publisher_fixture(&tmp, downloader);

    let err = publisher
        .publish("v22.8.2.11-lts", &[])
        .await
        .expect_err("missing required artifact must fail the publish");
    assert!(matches!(err, RepoError::Download(_)));

    assert!(!publisher.is_processed("v22.8.2.11-lts"));
    let status = fs::read_to_string(base.join("release-host/statuses/deadbeef")).unwrap();
    assert!(status.starts_with("failure\n"));
}

#[tokio::test]
async fn test_republish_requires_force() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let tmp = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new(Vec::new()));
    let (publisher, base) = publisher_fixture(&tmp, Arc::clone(&downloader));
    let app = repo_publisher::web::router(Arc::clone(&publisher));
    let archive_dir = base.join("root/configs/archive");
    let deb_archives = |dir: &Path| {
        read_names(dir)
            .iter()
            .filter(|n| n.starts_with("deb-"))
            .count()
    };

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/release/v22.8.2.11-lts?sync=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(publisher.is_processed("v22.8.2.11-lts"));
    let first_requests = downloader.requests.load(Ordering::SeqCst);
    assert!(first_requests > 0);
    assert_eq!(deb_archives(&archive_dir), 1);

    // The finished marker short-circuits a repeat before any work starts.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/release/v22.8.2.11-lts?sync=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body.as_ref(), b"the release is already published\n");
    assert_eq!(downloader.requests.load(Ordering::SeqCst), first_requests);
    assert_eq!(deb_archives(&archive_dir), 1);

    // force=1 runs the whole flow again, committing a fresh snapshot.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/release/v22.8.2.11-lts?sync=1&force=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(deb_archives(&archive_dir), 2);
}

#[tokio::test]
async fn test_publish_rejects_malformed_tag() {
    let tmp = TempDir::new().unwrap();
    let (publisher, _) =
        publisher_fixture(&tmp, Arc::new(ScriptedDownloader::new(Vec::new())));
    assert!(matches!(
        publisher.publish("not-a-tag", &[]).await,
        Err(RepoError::InvalidTag(_))
    ));
}
