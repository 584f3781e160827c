//! Release publisher service entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use tracing::{info, warn};

use repo_publisher::config::ServiceConfig;
use repo_publisher::download::HttpDownloader;
use repo_publisher::error::RepoResult;
use repo_publisher::exec::SystemRunner;
use repo_publisher::fsutil;
use repo_publisher::gate::UpdateGate;
use repo_publisher::release::{LocalReleaseHost, LocalReportStore, Publisher};
use repo_publisher::web;

#[tokio::main]
async fn main() -> RepoResult<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("repo-publisher")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Release publishing service for Debian/RPM/tarball package repositories")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("repo-publisher.json"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address for the HTTP front end")
                .env("REPO_PUBLISHER_BIND_ADDRESS"),
        )
        .get_matches();

    let config_path = PathBuf::from(matches.get_one::<String>("config").unwrap());
    let mut config = if config_path.exists() {
        info!("Loading configuration from {}", config_path.display());
        ServiceConfig::from_file(&config_path)?
    } else {
        warn!(
            "Configuration file {} not found, using defaults",
            config_path.display()
        );
        let mut config = ServiceConfig::default();
        config.apply_env();
        config.validate()?;
        config
    };
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind_address = bind.clone();
    }

    fsutil::ensure_dir(&config.working_dir)?;
    fsutil::ensure_dir(&config.releases_dir())?;

    let host = LocalReleaseHost::new(&config.working_dir.join("release-host"))?;
    let reports = LocalReportStore::new(&config.working_dir.join("reports"))?;
    let bind_address = config.bind_address.clone();

    let publisher = Arc::new(Publisher::new(
        Arc::new(config),
        UpdateGate::new(),
        Arc::new(SystemRunner::new()),
        Arc::new(HttpDownloader::new()),
        Arc::new(host),
        Arc::new(reports),
    ));

    web::serve(publisher, &bind_address).await
}
