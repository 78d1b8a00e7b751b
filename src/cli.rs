//! Command-line front end.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{
    DropboxSourceConfig, GitHubSourceConfig, HttpSourceConfig, MirrorConfig, SourceConfig,
    default_cache_dir, default_config_path,
};
use crate::engine::SyncEngine;
use crate::fingerprint::{HashAlgorithm, hash_path};
use crate::sidecar::generate::GenerateStatus;
use crate::sidecar::{GenerateOptions, SidecarFormat, generate_sidecars};

/// Exit code of `cached` when the entry is stale.
pub const EXIT_STALE: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "remotedata",
    version,
    about = "Mirror files from GitHub, Dropbox or HTTP hosts into a local cache, \
             downloading only what changed"
)]
pub struct Cli {
    /// Configuration file (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Base cache directory
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Source type, overriding the configured one
    #[arg(long, global = true, value_enum)]
    pub source: Option<SourceKind>,

    /// GitHub repository as <owner>/<repo>[/<branch>]
    #[arg(long, global = true)]
    pub repos: Option<String>,

    /// HTTP URL template containing {file}
    #[arg(long, global = true)]
    pub url_template: Option<String>,

    /// Access token for the source
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Maximum concurrent downloads
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Make paths current in the cache and print their local paths
    Get {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Check whether a file is current (exit code 2 when stale)
    Cached { path: String },
    /// Drop the sidecar of a path so it is fetched again
    Remove {
        path: String,
        /// Remove the content as well
        #[arg(long)]
        clean: bool,
    },
    /// Remove everything cached for the source
    Clear,
    /// Write sidecars for a local tree so it can be served as a source
    Hash {
        dir: PathBuf,
        #[arg(long, short, default_value = "git-blob")]
        algorithm: HashAlgorithm,
        #[arg(long, short, value_enum, default_value = "meta")]
        format: FormatArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    Github,
    #[value(name = "github.remotedata")]
    GithubRemotedata,
    Dropbox,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Hash,
    Meta,
}

impl From<FormatArg> for SidecarFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Hash => SidecarFormat::Hash,
            FormatArg::Meta => SidecarFormat::Meta,
        }
    }
}

impl Cli {
    fn source_from_flags(&self, kind: SourceKind) -> Result<SourceConfig> {
        let repos = || {
            self.repos
                .clone()
                .context("--repos is required for github sources")
        };
        Ok(match kind {
            SourceKind::Github => SourceConfig::GitHub(GitHubSourceConfig::new(repos()?)),
            SourceKind::GithubRemotedata => {
                SourceConfig::GitHubRemoteData(GitHubSourceConfig::new(repos()?))
            }
            SourceKind::Dropbox => SourceConfig::Dropbox(DropboxSourceConfig::default()),
            SourceKind::Http => SourceConfig::Http(HttpSourceConfig {
                url_template: self
                    .url_template
                    .clone()
                    .context("--url-template is required for http sources")?,
                token: None,
            }),
        })
    }

    /// Config file, then environment, then flags.
    pub fn resolve_config(&self) -> Result<MirrorConfig> {
        let file = match &self.config {
            Some(path) => Some(path.clone()),
            None => default_config_path().filter(|p| p.is_file()),
        };
        let mut config = match &file {
            Some(path) => Some(
                MirrorConfig::load(path)
                    .with_context(|| format!("loading config {}", path.display()))?,
            ),
            None => None,
        };

        let inferred = self.source.or_else(|| {
            if config.is_some() {
                None
            } else if self.repos.is_some() {
                Some(SourceKind::Github)
            } else if self.url_template.is_some() {
                Some(SourceKind::Http)
            } else {
                None
            }
        });
        if let Some(kind) = inferred {
            let source = self.source_from_flags(kind)?;
            config = Some(match config.take() {
                Some(mut existing) => {
                    existing.source = source;
                    existing
                }
                None => MirrorConfig::new(default_cache_dir(), source),
            });
        }
        let Some(mut config) = config else {
            bail!("no source configured; pass --source/--repos/--url-template or a config file");
        };

        if let Some(repos) = &self.repos {
            if let SourceConfig::GitHub(c) | SourceConfig::GitHubRemoteData(c) = &mut config.source {
                c.repos = repos.clone();
            }
        }
        if let Some(template) = &self.url_template {
            if let SourceConfig::Http(c) = &mut config.source {
                c.url_template = template.clone();
            }
        }

        config.apply_env();
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(token) = &self.token {
            config.source.set_token(token.clone());
        }
        if let Some(jobs) = self.jobs {
            config.concurrency = jobs;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_hash(dir: &Path, algorithm: HashAlgorithm, format: FormatArg, json: bool) -> Result<()> {
    let options = GenerateOptions {
        algorithm,
        format: format.into(),
    };
    let report = generate_sidecars(dir, &options)
        .with_context(|| format!("generating sidecars under {}", dir.display()))?;
    let tree_hash = hash_path(dir, algorithm)?;
    if json {
        return print_json(&serde_json::json!({
            "tree_hash": tree_hash,
            "algorithm": algorithm,
            "entries": report.entries,
        }));
    }
    for entry in &report.entries {
        if matches!(entry.status, GenerateStatus::Updated { .. }) {
            println!("updated   {}  {}", entry.token, entry.path);
        }
    }
    println!("tree      {tree_hash}  {}", dir.display());
    eprintln!(
        "{} updated, {} unchanged ({algorithm})",
        report.updated(),
        report.unchanged()
    );
    Ok(())
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    if let Command::Hash {
        dir,
        algorithm,
        format,
    } = &cli.command
    {
        run_hash(dir, *algorithm, *format, cli.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = cli.resolve_config()?;
    let engine = SyncEngine::new(&config).context("initializing sync engine")?;

    match &cli.command {
        Command::Get { paths } => {
            let mut reports = Vec::with_capacity(paths.len());
            for path in paths {
                let report = engine
                    .sync(path)
                    .await
                    .with_context(|| format!("fetching {path}"))?;
                if !cli.json {
                    println!("{}", report.local_path.display());
                }
                reports.push(report);
            }
            if cli.json {
                print_json(&reports)?;
            }
        }
        Command::Cached { path } => {
            let cached = engine
                .is_cached(path)
                .await
                .with_context(|| format!("checking {path}"))?;
            if cli.json {
                print_json(&serde_json::json!({ "path": path, "cached": cached }))?;
            } else {
                println!("{}", if cached { "fresh" } else { "stale" });
            }
            if !cached {
                return Ok(ExitCode::from(EXIT_STALE));
            }
        }
        Command::Remove { path, clean } => {
            engine
                .remove(path, *clean)
                .await
                .with_context(|| format!("removing {path}"))?;
            if cli.json {
                print_json(&serde_json::json!({ "path": path, "clean": clean }))?;
            } else {
                println!("removed {path}");
            }
        }
        Command::Clear => {
            let report = engine.clear().await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "cleared {} ({} removed, {} failed)",
                    engine.cache_root().display(),
                    report.removed.len(),
                    report.failed.len()
                );
            }
        }
        Command::Hash { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}
