// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Persistent relational store for parsed IIDs, grounded on the
//! `Decoder<T>`/`Encoding` pattern and `sqlx::migrate!` usage of the
//! teacher's own index databases. Read-only to the planner: load the
//! YAML front-end's output once via [`Database::load_items`], then
//! query the resulting [`Snapshot`] synchronously (the resolver and
//! action scheduler are pure functions over in-memory data, matching
//! the spec's synchronous pseudocode).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::model::{ActionPhase, Bag, Guid, Iid, InstallItem, OsTag, Reference, Source, SourceKind};
use crate::resolve;

/// A handle to the index database. Owns the connection pool; all
/// queries go through here.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        Self::connect(options).await
    }

    pub async fn in_memory() -> Result<Self, Error> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, Error> {
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::migrate!("src/index/migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert one fully-parsed [`InstallItem`] (append-only within a
    /// load: entries get a monotonic `position`).
    pub async fn insert_item(&self, item: &InstallItem) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO items (iid, name, remark, description, version) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(iid) DO UPDATE SET name=excluded.name, remark=excluded.remark,
                description=excluded.description, version=excluded.version",
        )
        .bind(item.iid.as_ref())
        .bind(&item.name)
        .bind(&item.remark)
        .bind(&item.description)
        .bind(&item.version)
        .execute(&mut *tx)
        .await?;

        for guid in &item.guids {
            sqlx::query("INSERT OR IGNORE INTO guids (iid, guid) VALUES (?, ?)")
                .bind(item.iid.as_ref())
                .bind(guid.as_ref())
                .execute(&mut *tx)
                .await?;
        }

        for (position, parent) in item.inherit_from.iter().enumerate() {
            sqlx::query("INSERT INTO inherits (iid, parent_iid, position) VALUES (?, ?, ?)")
                .bind(item.iid.as_ref())
                .bind(parent.as_ref())
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
        }

        for (os, bag) in &item.per_os {
            for (position, source) in bag.install_sources.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO sources (iid, os, position, path, kind) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(item.iid.as_ref())
                .bind(os.as_str())
                .bind(position as i64)
                .bind(&source.path)
                .bind(source_kind_tag(source.kind))
                .execute(&mut *tx)
                .await?;
            }

            for (position, folder) in bag.install_folders.iter().enumerate() {
                sqlx::query("INSERT INTO folders (iid, os, position, path) VALUES (?, ?, ?, ?)")
                    .bind(item.iid.as_ref())
                    .bind(os.as_str())
                    .bind(position as i64)
                    .bind(folder)
                    .execute(&mut *tx)
                    .await?;
            }

            for (position, reference) in bag.depends.iter().enumerate() {
                sqlx::query("INSERT INTO depends (iid, os, position, ref) VALUES (?, ?, ?, ?)")
                    .bind(item.iid.as_ref())
                    .bind(os.as_str())
                    .bind(position as i64)
                    .bind(reference_tag(reference))
                    .execute(&mut *tx)
                    .await?;
            }

            for (phase, commands) in &bag.actions {
                for (position, command) in commands.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO actions (iid, os, phase, position, command) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(item.iid.as_ref())
                    .bind(os.as_str())
                    .bind(phase.as_str())
                    .bind(position as i64)
                    .bind(command)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn activate_oses(&self, oses: &[OsTag]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE active_os SET active = 0").execute(&mut *tx).await?;
        for os in oses {
            sqlx::query(
                "INSERT INTO active_os (os_name, active) VALUES (?, 1)
                 ON CONFLICT(os_name) DO UPDATE SET active = 1",
            )
            .bind(os.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn reset_active_oses(&self) -> Result<(), Error> {
        sqlx::query("UPDATE active_os SET active = 0").execute(&self.pool).await?;
        Ok(())
    }

    /// Record that `iid` is now installed at `version`/`repo_rev`
    /// (the supplemented `require` state tracking).
    pub async fn record_installed(&self, iid: &Iid, version: Option<&str>, repo_rev: i64) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO installed (iid, version, repo_rev) VALUES (?, ?, ?)
             ON CONFLICT(iid) DO UPDATE SET version=excluded.version, repo_rev=excluded.repo_rev,
                installed_at=datetime('now')",
        )
        .bind(iid.as_ref())
        .bind(version)
        .bind(repo_rev)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn installed(&self) -> Result<Vec<InstalledRecord>, Error> {
        let rows = sqlx::query("SELECT iid, version, repo_rev, installed_at FROM installed")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InstalledRecord {
                iid: Iid::from(row.get::<String, _>("iid")),
                version: row.get("version"),
                repo_rev: row.get("repo_rev"),
                installed_at: row.get("installed_at"),
            })
            .collect())
    }

    /// Load the full index into an in-memory [`Snapshot`] for the
    /// planner to query synchronously.
    pub async fn load_snapshot(&self) -> Result<Snapshot, Error> {
        let mut conn = self.pool.acquire().await?;

        let active_oses: Vec<String> = sqlx::query("SELECT os_name FROM active_os WHERE active = 1")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| row.get(0))
            .collect();
        let active_oses: Vec<OsTag> = active_oses.iter().filter_map(|s| OsTag::parse(s)).collect();

        let item_rows = sqlx::query("SELECT iid, name, remark, description, version FROM items")
            .fetch_all(&mut *conn)
            .await?;

        let mut items: HashMap<Iid, InstallItem> = HashMap::new();
        for row in &item_rows {
            let iid = Iid::from(row.get::<String, _>("iid"));
            items.insert(
                iid.clone(),
                InstallItem {
                    iid,
                    name: row.get("name"),
                    remark: row.get("remark"),
                    description: row.get("description"),
                    guids: Vec::new(),
                    inherit_from: Vec::new(),
                    version: row.get("version"),
                    per_os: HashMap::new(),
                },
            );
        }

        let mut guids_by_iid: HashMap<Iid, Vec<Guid>> = HashMap::new();
        let mut guid_to_iids: HashMap<Guid, Vec<Iid>> = HashMap::new();
        for row in sqlx::query("SELECT iid, guid FROM guids").fetch_all(&mut *conn).await? {
            let iid = Iid::from(row.get::<String, _>("iid"));
            let guid = Guid::from(row.get::<String, _>("guid"));
            guids_by_iid.entry(iid.clone()).or_default().push(guid.clone());
            guid_to_iids.entry(guid).or_default().push(iid);
        }

        let mut inherits: HashMap<Iid, Vec<(i64, Iid)>> = HashMap::new();
        for row in sqlx::query("SELECT iid, parent_iid, position FROM inherits")
            .fetch_all(&mut *conn)
            .await?
        {
            let iid = Iid::from(row.get::<String, _>("iid"));
            let parent = Iid::from(row.get::<String, _>("parent_iid"));
            let position: i64 = row.get("position");
            inherits.entry(iid).or_default().push((position, parent));
        }

        let mut depends: HashMap<(Iid, String), Vec<(i64, Reference)>> = HashMap::new();
        for row in sqlx::query("SELECT iid, os, position, ref FROM depends")
            .fetch_all(&mut *conn)
            .await?
        {
            let iid = Iid::from(row.get::<String, _>("iid"));
            let os: String = row.get("os");
            let position: i64 = row.get("position");
            let reference = Reference::classify(row.get::<String, _>("ref"));
            depends.entry((iid, os)).or_default().push((position, reference));
        }

        let mut sources: HashMap<(Iid, String), Vec<(i64, Source)>> = HashMap::new();
        for row in sqlx::query("SELECT iid, os, position, path, kind FROM sources")
            .fetch_all(&mut *conn)
            .await?
        {
            let iid = Iid::from(row.get::<String, _>("iid"));
            let os: String = row.get("os");
            let position: i64 = row.get("position");
            let kind = SourceKind::parse(&row.get::<String, _>("kind")).unwrap_or(SourceKind::File);
            let path: String = row.get("path");
            sources.entry((iid, os)).or_default().push((position, Source { path, kind }));
        }

        let mut folders: HashMap<(Iid, String), Vec<(i64, String)>> = HashMap::new();
        for row in sqlx::query("SELECT iid, os, position, path FROM folders")
            .fetch_all(&mut *conn)
            .await?
        {
            let iid = Iid::from(row.get::<String, _>("iid"));
            let os: String = row.get("os");
            let position: i64 = row.get("position");
            let path: String = row.get("path");
            folders.entry((iid, os)).or_default().push((position, path));
        }

        let mut actions: HashMap<(Iid, String), Vec<(i64, ActionPhase, String)>> = HashMap::new();
        for row in sqlx::query("SELECT iid, os, phase, position, command FROM actions")
            .fetch_all(&mut *conn)
            .await?
        {
            let iid = Iid::from(row.get::<String, _>("iid"));
            let os: String = row.get("os");
            let position: i64 = row.get("position");
            let phase = ActionPhase::parse(&row.get::<String, _>("phase"));
            let command: String = row.get("command");
            if let Some(phase) = phase {
                actions.entry((iid, os)).or_default().push((position, phase, command));
            }
        }

        // Assemble per-OS bags, sorted by position within each (iid, os).
        for item in items.values_mut() {
            item.guids = guids_by_iid.remove(&item.iid).unwrap_or_default();

            let mut parents = inherits.remove(&item.iid).unwrap_or_default();
            parents.sort_by_key(|(position, _)| *position);
            item.inherit_from = parents.into_iter().map(|(_, p)| p).collect();

            let oses: Vec<String> = OS_TAGS.iter().map(|t| t.as_str().to_string()).collect();
            for os_str in oses {
                let key = (item.iid.clone(), os_str.clone());
                let Some(os) = OsTag::parse(&os_str) else { continue };

                let mut bag_sources = sources.remove(&key).unwrap_or_default();
                bag_sources.sort_by_key(|(p, _)| *p);
                let mut bag_folders = folders.remove(&key).unwrap_or_default();
                bag_folders.sort_by_key(|(p, _)| *p);
                let mut bag_depends = depends.remove(&key).unwrap_or_default();
                bag_depends.sort_by_key(|(p, _)| *p);
                let mut bag_actions_raw = actions.remove(&key).unwrap_or_default();
                bag_actions_raw.sort_by_key(|(p, _, _)| *p);

                if bag_sources.is_empty() && bag_folders.is_empty() && bag_depends.is_empty() && bag_actions_raw.is_empty() {
                    continue;
                }

                let mut bag_actions: HashMap<ActionPhase, Vec<String>> = HashMap::new();
                for (_, phase, command) in bag_actions_raw {
                    bag_actions.entry(phase).or_default().push(command);
                }

                item.per_os.insert(
                    os,
                    Bag {
                        install_sources: bag_sources.into_iter().map(|(_, s)| s).collect(),
                        install_folders: bag_folders.into_iter().map(|(_, f)| f).collect(),
                        depends: bag_depends.into_iter().map(|(_, d)| d).collect(),
                        actions: bag_actions,
                    },
                );
            }
        }

        Ok(Snapshot {
            items,
            guid_to_iids,
            active_oses,
        })
    }
}

const OS_TAGS: [OsTag; 7] = [
    OsTag::Common,
    OsTag::Mac,
    OsTag::Mac32,
    OsTag::Mac64,
    OsTag::Win,
    OsTag::Win32,
    OsTag::Win64,
];

fn source_kind_tag(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::File => "!file",
        SourceKind::Files => "!files",
        SourceKind::Dir => "!dir",
        SourceKind::DirCont => "!dir_cont",
    }
}

fn reference_tag(reference: &Reference) -> &str {
    match reference {
        Reference::Iid(iid) => iid.as_ref(),
        Reference::Guid(guid) => guid.as_ref(),
    }
}

#[derive(Debug, Clone)]
pub struct InstalledRecord {
    pub iid: Iid,
    pub version: Option<String>,
    pub repo_rev: i64,
    pub installed_at: DateTime<Utc>,
}

/// An in-memory, read-only view of the whole index, loaded once per
/// planning run. Implements [`resolve::Index`] directly.
#[derive(Debug, Clone)]
pub struct Snapshot {
    items: HashMap<Iid, InstallItem>,
    guid_to_iids: HashMap<Guid, Vec<Iid>>,
    pub active_oses: Vec<OsTag>,
}

impl Snapshot {
    pub fn get_all_iids(&self) -> Vec<Iid> {
        let mut iids: Vec<Iid> = self.items.keys().cloned().collect();
        iids.sort();
        iids
    }

    pub fn item(&self, iid: &Iid) -> Option<&InstallItem> {
        self.items.get(iid)
    }

    pub fn lookup_fn(&self) -> impl Fn(&Iid) -> Option<InstallItem> + '_ {
        move |iid| self.items.get(iid).cloned()
    }

    /// `effective()` bag for `iid`, folding inheritance with this
    /// snapshot's active OS selection.
    pub fn resolved_bag(&self, iid: &Iid) -> Result<Bag, crate::model::InheritanceError> {
        let item = self
            .items
            .get(iid)
            .expect("resolved_bag called with an iid not present in the snapshot");
        item.effective(&self.active_oses, &self.lookup_fn())
    }
}

impl resolve::Index for Snapshot {
    fn iids_for_guid(&self, guid: &Guid) -> Vec<Iid> {
        self.guid_to_iids.get(guid).cloned().unwrap_or_default()
    }

    fn depends(&self, iid: &Iid) -> Vec<Reference> {
        self.resolved_bag(iid).map(|bag| bag.depends).unwrap_or_default()
    }

    fn exists(&self, iid: &Iid) -> bool {
        self.items.contains_key(iid)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("sqlx")]
    Sqlx(#[from] sqlx::Error),
    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bag, Source, SourceKind};

    fn item_with_depends(iid: &str, deps: Vec<&str>) -> InstallItem {
        let mut per_os = HashMap::new();
        per_os.insert(
            OsTag::Common,
            Bag {
                install_sources: vec![Source {
                    path: format!("{iid}/src"),
                    kind: SourceKind::File,
                }],
                install_folders: vec![format!("/opt/{iid}")],
                depends: deps.into_iter().map(Reference::classify).collect(),
                actions: HashMap::new(),
            },
        );
        InstallItem {
            iid: Iid::from(iid),
            name: iid.to_string(),
            remark: String::new(),
            description: String::new(),
            guids: Vec::new(),
            inherit_from: Vec::new(),
            version: None,
            per_os,
        }
    }

    #[tokio::test]
    async fn insert_and_load_snapshot_round_trips() {
        let db = Database::in_memory().await.unwrap();
        db.insert_item(&item_with_depends("A", vec!["B"])).await.unwrap();
        db.insert_item(&item_with_depends("B", vec![])).await.unwrap();

        let snapshot = db.load_snapshot().await.unwrap();
        assert_eq!(snapshot.get_all_iids(), vec![Iid::from("A"), Iid::from("B")]);

        let bag = snapshot.resolved_bag(&Iid::from("A")).unwrap();
        assert_eq!(bag.install_folders, vec!["/opt/A".to_string()]);
        assert_eq!(bag.depends, vec![Reference::Iid(Iid::from("B"))]);
    }

    #[tokio::test]
    async fn record_and_read_back_installed() {
        let db = Database::in_memory().await.unwrap();
        db.insert_item(&item_with_depends("A", vec![])).await.unwrap();
        db.record_installed(&Iid::from("A"), Some("1.0"), 42).await.unwrap();

        let installed = db.installed().await.unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].version.as_deref(), Some("1.0"));
        assert_eq!(installed[0].repo_rev, 42);
    }
}
