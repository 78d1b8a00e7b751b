//! Mirror files and directory trees from remote sources (GitHub, Dropbox,
//! plain HTTP hosts) into a local cache, re-downloading only what changed.
//!
//! Staleness is decided by comparing a locally persisted fingerprint (a
//! sidecar file next to the cached content) with the fingerprint the remote
//! reports, so checking a cached file never transfers its content.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod path;
pub mod remote;
pub mod sidecar;
pub mod transport;

use std::process::ExitCode;

use clap::Parser;

pub use config::{MirrorConfig, SourceConfig};
pub use engine::{ClearReport, EntryOutcome, SyncEngine, SyncReport};
pub use error::{MirrorError, Result};
pub use fingerprint::{Fingerprint, HashAlgorithm};
pub use path::LogicalPath;

/// Library entrypoint for the `remotedata` binary.
pub async fn run() -> anyhow::Result<ExitCode> {
    cli::run(cli::Cli::parse()).await
}
