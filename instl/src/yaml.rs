// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The YAML front-end: deserializes install-item documents with
//! `serde_yaml` into [`InstallItem`]s ready for [`crate::index::Database::insert_item`].
//! Grounded on the teacher's own `config` crate use of `serde_yaml` for
//! layered document loading, adapted here to a single document tree
//! rather than `Scope`-merged config files.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{ActionPhase, Bag, Guid, Iid, InstallItem, OsTag, Reference, Source, SourceKind};

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    index: HashMap<String, RawItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RawItem {
    #[serde(default)]
    name: String,
    #[serde(default)]
    remark: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    guid: Vec<String>,
    #[serde(default)]
    inherit: Vec<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    install_sources: Vec<RawSource>,
    #[serde(default)]
    install_folders: Vec<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default, flatten)]
    actions: HashMap<String, Vec<String>>,
    #[serde(default)]
    os: HashMap<String, RawOsBag>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOsBag {
    #[serde(default)]
    install_sources: Vec<RawSource>,
    #[serde(default)]
    install_folders: Vec<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default, flatten)]
    actions: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    path: String,
    #[serde(default = "default_source_kind")]
    kind: String,
}

fn default_source_kind() -> String {
    "!file".to_string()
}

/// Parse a full index document into the items it declares.
pub fn parse_items(text: &str) -> Result<Vec<InstallItem>, Error> {
    let doc: RawDocument = serde_yaml::from_str(text)?;

    doc.index
        .into_iter()
        .map(|(iid, raw)| build_item(iid, raw))
        .collect()
}

fn build_item(iid: String, raw: RawItem) -> Result<InstallItem, Error> {
    let mut per_os = HashMap::new();
    per_os.insert(
        OsTag::Common,
        build_bag(raw.install_sources, raw.install_folders, raw.depends, raw.actions)?,
    );

    for (os_name, bag) in raw.os {
        let os = OsTag::parse(&os_name).ok_or_else(|| Error::UnknownOs(os_name.clone()))?;
        per_os.insert(os, build_bag(bag.install_sources, bag.install_folders, bag.depends, bag.actions)?);
    }

    Ok(InstallItem {
        iid: Iid::from(iid),
        name: raw.name,
        remark: raw.remark,
        description: raw.description,
        guids: raw.guid.into_iter().map(Guid::from).collect(),
        inherit_from: raw.inherit.into_iter().map(Iid::from).collect(),
        version: raw.version,
        per_os,
    })
}

fn build_bag(
    sources: Vec<RawSource>,
    folders: Vec<String>,
    depends: Vec<String>,
    actions: HashMap<String, Vec<String>>,
) -> Result<Bag, Error> {
    let install_sources = sources
        .into_iter()
        .map(|s| {
            Ok(Source {
                kind: SourceKind::parse(&s.kind).ok_or_else(|| Error::UnknownSourceKind(s.kind.clone()))?,
                path: s.path,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut bag_actions: HashMap<ActionPhase, Vec<String>> = HashMap::new();
    for (key, commands) in actions {
        if let Some(phase) = ActionPhase::parse(&key) {
            bag_actions.insert(phase, commands);
        }
    }

    Ok(Bag {
        install_sources,
        install_folders: folders,
        depends: depends.into_iter().map(Reference::classify).collect(),
        actions: bag_actions,
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("yaml")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown os tag: {0}")]
    UnknownOs(String),
    #[error("unknown source kind: {0}")]
    UnknownSourceKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_item_with_common_bag() {
        let yaml = r#"
index:
  App:
    name: App
    install_sources:
      - path: bin/app
        kind: "!file"
    install_folders:
      - /opt/app
    depends:
      - Lib
"#;
        let items = parse_items(yaml).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.iid, Iid::from("App"));
        let common = item.per_os.get(&OsTag::Common).unwrap();
        assert_eq!(common.install_folders, vec!["/opt/app".to_string()]);
        assert_eq!(common.depends, vec![Reference::Iid(Iid::from("Lib"))]);
    }

    #[test]
    fn parses_per_os_bags_separately_from_common() {
        let yaml = r#"
index:
  App:
    name: App
    os:
      Mac:
        install_folders:
          - /Applications/App
      Win:
        install_folders:
          - C:/Program Files/App
"#;
        let items = parse_items(yaml).unwrap();
        let item = &items[0];
        assert_eq!(
            item.per_os.get(&OsTag::Mac).unwrap().install_folders,
            vec!["/Applications/App".to_string()]
        );
        assert_eq!(
            item.per_os.get(&OsTag::Win).unwrap().install_folders,
            vec!["C:/Program Files/App".to_string()]
        );
    }

    #[test]
    fn unknown_os_tag_is_an_error() {
        let yaml = r#"
index:
  App:
    os:
      BeOS:
        install_folders: []
"#;
        assert!(matches!(parse_items(yaml), Err(Error::UnknownOs(_))));
    }
}
