// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Command-line surface: a global `Cli` of shared flags plus one
//! subcommand per external interface operation. Grounded on the
//! teacher's `cli::command()`/`cli::process()` split (clap::Command
//! tree built separately from dispatch) and its pattern of aggregating
//! every subcommand's error type into one top-level `Error` via
//! `#[from]`.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use instl::{batch, index, model::Iid, resolve, sync, value, yaml};

mod run;

/// Shared flags available to every subcommand, mirroring the external
/// interfaces' common flag set.
#[derive(Debug, Parser)]
#[command(name = "instl", version, about = "Cross-platform install/update engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Index document to load (YAML).
    #[arg(long = "in", global = true)]
    pub in_file: Option<PathBuf>,

    /// Destination for report-style commands.
    #[arg(long, global = true)]
    pub out: Option<PathBuf>,

    /// Layered config file, see [`instl::settings`].
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    /// `NAME=VALUE` defines file, merged into the value store before
    /// `--define` so individual `--define`s can still override it.
    #[arg(long, global = true)]
    pub props_file: Option<PathBuf>,

    /// Path to a detached SHA-1 manifest checksum; presence implies
    /// signature verification before `sync` trusts the remote file map.
    #[arg(long, global = true)]
    pub sh1_checksum: Option<PathBuf>,

    /// Path to an RSA signature over the manifest checksum, see
    /// `--sh1-checksum`.
    #[arg(long, global = true)]
    pub rsa_signature: Option<PathBuf>,

    /// Cap progress reporting to every Nth item instead of every item.
    #[arg(long, global = true)]
    pub just_with_number: Option<usize>,

    /// Suppress numeric item-count progress output.
    #[arg(long, global = true)]
    pub no_numbers_progress: bool,

    /// `have` file-map path, read and atomically rewritten by `sync`.
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Repository (`remote`) file-map path `sync` diffs against.
    #[arg(long, global = true)]
    pub remote_map_file: Option<PathBuf>,

    /// Repository base URL downloads are rooted under.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// `user:pass` Basic auth credentials for `base_url`.
    #[arg(long, global = true)]
    pub credentials: Option<String>,

    /// Restrict the operation to this subset of iids (repeatable).
    #[arg(long, global = true)]
    pub limit: Vec<String>,

    /// `NAME=VALUE` pairs bound into the value store before expansion.
    #[arg(long, global = true, value_delimiter = ',')]
    pub define: Vec<String>,

    /// Actually perform filesystem mutation instead of a dry run.
    #[arg(long, global = true)]
    pub run: bool,

    /// Run independent work concurrently where the operation allows it.
    #[arg(long, global = true)]
    pub parallel: bool,

    /// Exit code to use on failure instead of 1.
    #[arg(long, global = true)]
    pub fail_exit_code: Option<i32>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan and fetch the files the resolved install set still needs.
    Sync,
    /// Run the copy-phase action schedule for the resolved install set.
    Copy,
    /// `sync` followed by `copy`.
    SyncCopy,
    /// Run the remove-phase action schedule for the resolved install set.
    Uninstall,
    /// Print what the index currently records as installed.
    ReportInstalled,
    /// Print `<iid> <version>` for every item in the resolved install set.
    ReportVersions,
    /// Resolve the install closure and report any dependency cycle found.
    FindCycles,
    /// Verify `state_file` entries' checksums against files on disk.
    CheckChecksum { root: PathBuf },
    /// Pack `src` into a wtar archive.
    Wtar { src: PathBuf, trg: Option<PathBuf> },
    /// Unpack a wtar archive into `trg`.
    Unwtar {
        src: PathBuf,
        trg: Option<PathBuf>,
        #[arg(long)]
        no_artifacts: bool,
    },
    /// Expand `$(NAME)` references in `text` against `--define` bindings.
    Trans { text: String },
    /// Print the resolved install closure for `--limit`.
    Resolve,
    /// Run a batch `ParallelRun` config file directly.
    ParallelRun {
        config_file: String,
        #[arg(long)]
        shell: bool,
    },
}

/// Parse arguments, dispatch the subcommand, and on failure exit with
/// `--fail-exit-code` (default 1) after reporting the error's full
/// source chain, matching the teacher's own `main`/`report_error` split.
pub async fn process() {
    let cli = Cli::parse();
    let fail_exit_code = cli.fail_exit_code;
    if let Err(error) = run::dispatch(cli).await {
        report_error(&error);
        std::process::exit(fail_exit_code.unwrap_or(1));
    }
}

fn report_error(error: &Error) {
    use std::error::Error as _;
    let mut sources = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source.take() {
        sources.push(err.to_string());
        source = err.source();
    }
    eprintln!("Error: {}", sources.join(": "));
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("index")]
    Index(#[from] index::Error),
    #[error("yaml")]
    Yaml(#[from] yaml::Error),
    #[error("resolve")]
    Resolve(#[from] resolve::Error),
    #[error("sync")]
    Sync(#[from] sync::Error),
    #[error("batch")]
    Batch(#[from] batch::Error),
    #[error("file map")]
    FileMap(#[from] instl::filemap::Error),
    #[error("inheritance")]
    Inheritance(#[from] instl::model::InheritanceError),
    #[error("value store")]
    Value(#[from] value::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("missing required flag: {0}")]
    MissingFlag(&'static str),
    #[error("malformed --define entry: {0}")]
    MalformedDefine(String),
}

/// Parse `--define NAME=VALUE` entries into a lookup, erroring on any
/// entry without an `=`.
pub(crate) fn parse_defines(defines: &[String]) -> Result<HashMap<String, String>, Error> {
    defines
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| Error::MalformedDefine(entry.clone()))
        })
        .collect()
}

/// Resolve `--limit` into [`Iid`]s, defaulting to every item the index
/// knows about when none were given.
pub(crate) fn limit_or_all(limit: &[String], snapshot: &index::Snapshot) -> Vec<Iid> {
    if limit.is_empty() {
        snapshot.get_all_iids()
    } else {
        limit.iter().map(Iid::from).collect()
    }
}
