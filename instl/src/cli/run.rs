// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Subcommand dispatch: each branch loads what it needs (index
//! snapshot, value store, have-map) and calls straight into the
//! library modules. Kept as one flat `match` rather than a handler
//! struct per subcommand, matching the teacher's own `cli::process()`.

use std::fs;
use std::io::{BufReader, Write};

use log::info;

use config::Manager as ConfigManager;

use instl::batch::{self, Command as BatchCommand};
use instl::download;
use instl::index::Database;
use instl::installation::Installation;
use instl::model::Iid;
use instl::settings::InstlConfig;
use instl::{action, filemap, resolve, sync, value, yaml};

use super::{limit_or_all, parse_defines, Cli, Command, Error};

pub async fn dispatch(cli: Cli) -> Result<(), Error> {
    match &cli.command {
        Command::Sync => cmd_sync(&cli).await,
        Command::Copy => cmd_copy(&cli).await,
        Command::SyncCopy => {
            cmd_sync(&cli).await?;
            cmd_copy(&cli).await
        }
        Command::Uninstall => cmd_uninstall(&cli).await,
        Command::ReportInstalled => cmd_report_installed(&cli).await,
        Command::ReportVersions => cmd_report_versions(&cli).await,
        Command::FindCycles => cmd_find_cycles(&cli).await,
        Command::CheckChecksum { root } => cmd_check_checksum(&cli, root),
        Command::Wtar { src, trg } => batch::wtar(src, trg.as_deref()).map_err(|e| Error::Batch(batch::Error::from(e))),
        Command::Unwtar { src, trg, no_artifacts } => batch::unwtar(src, trg.as_deref(), *no_artifacts)
            .map_err(|e| Error::Batch(batch::Error::from(e))),
        Command::Trans { text } => cmd_trans(&cli, text),
        Command::Resolve => cmd_resolve(&cli).await,
        Command::ParallelRun { config_file, shell } => batch::execute(&BatchCommand::ParallelRun {
            config_file: config_file.clone(),
            shell: *shell,
        })
        .map_err(Error::Batch),
    }
}

/// Load the index document named by `--in`, insert every item, and
/// return a queryable snapshot.
async fn load_snapshot(cli: &Cli) -> Result<instl::index::Snapshot, Error> {
    let in_file = cli.in_file.as_ref().ok_or(Error::MissingFlag("--in"))?;
    let text = fs::read_to_string(in_file)?;
    let items = yaml::parse_items(&text)?;

    let db = Database::in_memory().await?;
    for item in &items {
        db.insert_item(item).await?;
    }
    Ok(db.load_snapshot().await?)
}

/// Open `--out` for report-style commands, falling back to stdout.
fn report_writer(cli: &Cli) -> Result<Box<dyn Write>, Error> {
    match &cli.out {
        Some(path) => Ok(Box::new(fs::File::create(path)?)),
        None => Ok(Box::new(std::io::stdout())),
    }
}

async fn cmd_resolve(cli: &Cli) -> Result<(), Error> {
    let snapshot = load_snapshot(cli).await?;
    let requested = limit_or_all(&cli.limit, &snapshot);
    let plan = resolve::resolve(&requested, &snapshot)?;

    let mut out = report_writer(cli)?;
    for iid in &plan.full_install_items {
        writeln!(out, "{iid}")?;
    }
    for orphan in &plan.orphan_install_items {
        log::warn!("orphan reference: {orphan}");
    }
    Ok(())
}

async fn cmd_find_cycles(cli: &Cli) -> Result<(), Error> {
    let snapshot = load_snapshot(cli).await?;
    let requested = limit_or_all(&cli.limit, &snapshot);
    match resolve::resolve(&requested, &snapshot) {
        Ok(_) => {
            println!("no dependency cycles found");
            Ok(())
        }
        Err(err) => Err(Error::Resolve(err)),
    }
}

async fn cmd_report_versions(cli: &Cli) -> Result<(), Error> {
    let snapshot = load_snapshot(cli).await?;
    let requested = limit_or_all(&cli.limit, &snapshot);
    let plan = resolve::resolve(&requested, &snapshot)?;

    let mut out = report_writer(cli)?;
    for iid in &plan.full_install_items {
        let item = snapshot.item(iid);
        let version = item.and_then(|i| i.version.as_deref()).unwrap_or("unknown");
        writeln!(out, "{iid} {version}")?;
    }
    Ok(())
}

async fn cmd_report_installed(cli: &Cli) -> Result<(), Error> {
    let installation = Installation::open(Installation::default_root());
    let db = Database::open(installation.db_path()).await?;

    let mut out = report_writer(cli)?;
    for record in db.installed().await? {
        writeln!(
            out,
            "{} {} {} {}",
            record.iid,
            record.version.as_deref().unwrap_or("unknown"),
            record.repo_rev,
            record.installed_at
        )?;
    }
    Ok(())
}

/// `NAME=VALUE`-per-line props file, loaded beneath `--define` so
/// individual defines still take precedence.
fn load_props_file(path: &std::path::Path) -> Result<std::collections::HashMap<String, String>, Error> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::MalformedDefine(line.to_string()))
        })
        .collect()
}

fn cmd_trans(cli: &Cli, text: &str) -> Result<(), Error> {
    let mut store = value::Store::new();
    if let Some(props_file) = &cli.props_file {
        for (name, val) in load_props_file(props_file)? {
            store.set(&name, val)?;
        }
    }
    for (name, val) in parse_defines(&cli.define)? {
        store.set(&name, val)?;
    }
    println!("{}", store.expand(text)?);
    Ok(())
}

/// Load vendor/admin-layered defaults from `--config-file`'s parent
/// directory (or the installation root when unset), falling back to
/// an empty [`InstlConfig`] when nothing is found.
async fn load_settings(cli: &Cli) -> InstlConfig {
    let root = cli
        .config_file
        .as_ref()
        .and_then(|path| path.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(Installation::default_root);

    ConfigManager::system(root, instl::settings::PROGRAM)
        .load::<InstlConfig>()
        .await
        .unwrap_or_default()
}

async fn cmd_sync(cli: &Cli) -> Result<(), Error> {
    let snapshot = load_snapshot(cli).await?;
    let requested = limit_or_all(&cli.limit, &snapshot);
    let install_plan = resolve::resolve(&requested, &snapshot)?;

    let installation = Installation::open(Installation::default_root());
    let have_map_path = cli.state_file.clone().unwrap_or_else(|| installation.have_map_path());

    let (_, have_map) = match fs::File::open(&have_map_path) {
        Ok(file) => filemap::read_text(BufReader::new(file))?,
        Err(_) => (Vec::new(), filemap::Tree::new()),
    };

    let remote_map_path = cli
        .remote_map_file
        .clone()
        .ok_or(Error::MissingFlag("--remote-map-file"))?;
    let (_, mut remote_map) = filemap::read_text(BufReader::new(fs::File::open(&remote_map_path)?))?;

    let settings = load_settings(cli).await;
    let base_url = cli
        .base_url
        .as_deref()
        .or(settings.base_url.as_deref())
        .ok_or(Error::MissingFlag("--base-url"))?;

    let sources_of = |iid: &Iid| snapshot.resolved_bag(iid).map(|b| b.install_sources).unwrap_or_default();
    let plan = sync::plan(
        &mut remote_map,
        &have_map,
        &install_plan.full_install_items,
        &sources_of,
        base_url,
    )?;

    info!(
        "sync plan: {} download(s), {} unwtar(s)",
        plan.downloads.len(),
        plan.unwtars.len()
    );

    if !cli.run {
        return Ok(());
    }

    let staging = installation.staging_path();
    let config = download::Config {
        credentials: cli.credentials.clone(),
        workers: settings.download_workers.unwrap_or(instl::environment::DOWNLOAD_WORKERS),
        max_retries: settings.download_max_retries.unwrap_or(instl::environment::DOWNLOAD_MAX_RETRIES),
        ..download::Config::default()
    };
    let cancel = download::CancelToken::new();
    let outcomes = download::run(plan.downloads, &staging, config, cancel).await;

    let mut failed = Vec::new();
    for outcome in &outcomes {
        if let download::Outcome::Failed { path, cause } = outcome {
            failed.push(format!("{path}: {cause}"));
        }
    }
    if !failed.is_empty() {
        return Err(Error::Io(std::io::Error::other(failed.join("; "))));
    }

    for task in &plan.unwtars {
        let archive = staging.join(&task.archive_path);
        let target = staging.join(&task.target_path);
        batch::unwtar(&archive, Some(&target), false).map_err(|e| Error::Batch(batch::Error::from(e)))?;
    }

    sync::update_have_map(&have_map_path, &remote_map, &[])?;
    Ok(())
}

fn action_items(snapshot: &instl::index::Snapshot, iids: &[Iid]) -> Result<Vec<action::Item>, Error> {
    let mut items = Vec::new();
    for iid in iids {
        let bag = snapshot.resolved_bag(iid)?;
        let actions = bag
            .actions
            .iter()
            .flat_map(|(phase, cmds)| cmds.iter().map(move |c| (*phase, c.clone())))
            .collect();
        items.push(action::Item {
            iid: iid.clone(),
            folders: bag.install_folders,
            sources: bag.install_sources,
            actions,
        });
    }
    Ok(items)
}

async fn cmd_copy(cli: &Cli) -> Result<(), Error> {
    let snapshot = load_snapshot(cli).await?;
    let requested = limit_or_all(&cli.limit, &snapshot);
    let install_plan = resolve::resolve(&requested, &snapshot)?;
    let items = action_items(&snapshot, &install_plan.full_install_items)?;

    let commands = action::schedule_copy(&items);
    info!("copy schedule: {} command(s)", commands.len());

    if !cli.run {
        for command in &commands {
            println!("{command:?}");
        }
        return Ok(());
    }

    for command in &commands {
        batch::execute(command)?;
    }
    Ok(())
}

async fn cmd_uninstall(cli: &Cli) -> Result<(), Error> {
    let snapshot = load_snapshot(cli).await?;
    let requested = limit_or_all(&cli.limit, &snapshot);
    let install_plan = resolve::resolve(&requested, &snapshot)?;
    let items = action_items(&snapshot, &install_plan.full_install_items)?;

    let commands = action::schedule_remove(&items, true);
    info!("remove schedule: {} command(s)", commands.len());

    if !cli.run {
        for command in &commands {
            println!("{command:?}");
        }
        return Ok(());
    }

    for command in &commands {
        batch::execute(command)?;
    }
    Ok(())
}

fn cmd_check_checksum(cli: &Cli, root: &std::path::Path) -> Result<(), Error> {
    let state_file = cli.state_file.clone().ok_or(Error::MissingFlag("--state-file"))?;
    let (_, tree) = filemap::read_text(BufReader::new(fs::File::open(&state_file)?))?;

    let mut mismatches = 0;
    for (path, node) in tree.walk(filemap::Filter::File) {
        let Some(expected) = &node.checksum else { continue };
        let full = root.join(&path);
        let bytes = fs::read(&full)?;
        let actual = {
            use sha1::{Digest, Sha1};
            hex::encode(Sha1::digest(&bytes))
        };
        if &actual != expected {
            println!("MISMATCH {path}: expected {expected}, got {actual}");
            mismatches += 1;
        }
    }

    if mismatches == 0 {
        println!("all checksums match");
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::other(format!("{mismatches} checksum mismatch(es)"))))
    }
}
