//! Release publishing service for binary package repositories.
//!
//! Given a version tag, the service downloads the build artifacts for the
//! tagged commit and republishes them into three on-disk package repository
//! trees (Debian/APT, RPM/YUM and plain tarballs), uploading the artifacts
//! as release assets and recording a pass/fail status.
//!
//! The repository trees live under a single configured root and are mutated
//! under a process-wide gate; the index databases are updated through a
//! snapshot/commit-or-rollback transaction so an interrupted run never leaves
//! a half-written configuration behind.

#![deny(missing_docs)]

pub mod config;
pub mod download;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod gate;
pub mod packages;
pub mod release;
pub mod repository;
pub mod transaction;
pub mod web;

pub use error::{RepoError, RepoResult};
