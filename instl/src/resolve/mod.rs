// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The dependency resolver: transitive closure of a requested IID set,
//! cycle detection (with the full path reported), guid expansion, and
//! orphan reporting. Grounded on the registry transaction's `update`
//! loop (an explicit worklist rather than recursion) and on `dag::Dag`
//! for the `needed_by` reverse-graph query once the closure is known.

use std::collections::HashSet;

use dag::Dag;
use thiserror::Error;

use crate::model::{Guid, Iid, Reference};

/// Anything the resolver needs to know about the index to do its work.
/// Implemented by the index store; kept as a trait here so the resolver
/// is testable without a database.
pub trait Index {
    /// All iids carrying the given guid, in insertion order.
    fn iids_for_guid(&self, guid: &Guid) -> Vec<Iid>;
    /// Direct dependency references of `iid`, filtered by active OS,
    /// in declared order.
    fn depends(&self, iid: &Iid) -> Vec<Reference>;
    /// Whether `iid` is a known item in the index.
    fn exists(&self, iid: &Iid) -> bool;
}

/// The resolver's output: the full install closure, plus any orphaned
/// references (referenced but undefined) collected along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub full_install_items: Vec<Iid>,
    pub orphan_install_items: Vec<Iid>,
    graph: Option<Dag<Iid>>,
}

impl InstallPlan {
    /// Build the reverse ("who needs X") graph on demand.
    pub fn needed_by(&self, iid: &Iid) -> Vec<Iid> {
        let Some(graph) = &self.graph else {
            return Vec::new();
        };
        let transposed = graph.transpose();
        let Some(index) = transposed.get_index(iid) else {
            return Vec::new();
        };
        transposed.dfs(index).filter(|n| *n != iid).cloned().collect()
    }
}

/// Resolve the transitive closure of `requested`, in insertion order,
/// per the algorithm in the component design: a `visiting` set detects
/// cycles (reporting the full path), and an `out` list both memoizes
/// completed visits and preserves first-visit order.
pub fn resolve(requested: &[Iid], index: &dyn Index) -> Result<InstallPlan, Error> {
    let mut out: Vec<Iid> = Vec::new();
    let mut out_set: HashSet<Iid> = HashSet::new();
    let mut orphans: Vec<Iid> = Vec::new();
    let mut visiting: Vec<Iid> = Vec::new();
    let mut graph: Dag<Iid> = Dag::new();

    for requested_ref in requested {
        let expansions = if looks_like_guid(requested_ref) {
            let hits = index.iids_for_guid(&Guid::from(requested_ref.as_ref().to_string()));
            if hits.is_empty() {
                orphans.push(requested_ref.clone());
                continue;
            }
            hits
        } else {
            vec![requested_ref.clone()]
        };

        for iid in expansions {
            visit(&iid, index, &mut out, &mut out_set, &mut orphans, &mut visiting, &mut graph)?;
        }
    }

    Ok(InstallPlan {
        full_install_items: out,
        orphan_install_items: orphans,
        graph: Some(graph),
    })
}

fn looks_like_guid(iid: &Iid) -> bool {
    let s = iid.as_ref();
    s.len() == 36
        && s.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

#[allow(clippy::too_many_arguments)]
fn visit(
    iid: &Iid,
    index: &dyn Index,
    out: &mut Vec<Iid>,
    out_set: &mut HashSet<Iid>,
    orphans: &mut Vec<Iid>,
    visiting: &mut Vec<Iid>,
    graph: &mut Dag<Iid>,
) -> Result<(), Error> {
    if !index.exists(iid) {
        orphans.push(iid.clone());
        return Ok(());
    }

    if let Some(start) = visiting.iter().position(|v| v == iid) {
        let mut path: Vec<Iid> = visiting[start..].to_vec();
        path.push(iid.clone());
        return Err(Error::DependencyCycle(path));
    }

    if out_set.contains(iid) {
        return Ok(());
    }

    visiting.push(iid.clone());
    out.push(iid.clone());
    out_set.insert(iid.clone());
    let node = graph.add_node_or_get_index(iid.clone());

    for dependency in index.depends(iid) {
        let dep_iid = match dependency {
            Reference::Iid(iid) => iid,
            Reference::Guid(guid) => {
                let hits = index.iids_for_guid(&guid);
                if hits.is_empty() {
                    orphans.push(Iid::from(guid.as_ref().to_string()));
                    continue;
                }
                // A guid dependency can expand to more than one iid;
                // every match is visited and gets its own edge.
                for hit in &hits {
                    visit(hit, index, out, out_set, orphans, visiting, graph)?;
                    let hit_node = graph.add_node_or_get_index(hit.clone());
                    graph.add_edge(node, hit_node);
                }
                continue;
            }
        };
        visit(&dep_iid, index, out, out_set, orphans, visiting, graph)?;
        let dep_node = graph.add_node_or_get_index(dep_iid);
        graph.add_edge(node, dep_node);
    }

    visiting.pop();
    Ok(())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<Iid>),
}

fn format_cycle(path: &[Iid]) -> String {
    path.iter()
        .map(|iid| iid.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("→")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeIndex {
        depends: HashMap<String, Vec<Reference>>,
        guids: HashMap<String, Vec<Iid>>,
    }

    impl Index for FakeIndex {
        fn iids_for_guid(&self, guid: &Guid) -> Vec<Iid> {
            self.guids.get(guid.as_ref()).cloned().unwrap_or_default()
        }

        fn depends(&self, iid: &Iid) -> Vec<Reference> {
            self.depends.get(iid.as_ref()).cloned().unwrap_or_default()
        }

        fn exists(&self, iid: &Iid) -> bool {
            self.depends.contains_key(iid.as_ref())
        }
    }

    #[test]
    fn closure_is_superset_of_request_s2_cycle() {
        let mut depends = HashMap::new();
        depends.insert("A".to_string(), vec![Reference::Iid(Iid::from("B"))]);
        depends.insert("B".to_string(), vec![Reference::Iid(Iid::from("C"))]);
        depends.insert("C".to_string(), vec![Reference::Iid(Iid::from("A"))]);
        let index = FakeIndex {
            depends,
            guids: HashMap::new(),
        };

        let err = resolve(&[Iid::from("A")], &index).unwrap_err();
        match err {
            Error::DependencyCycle(path) => {
                assert_eq!(
                    path,
                    vec![Iid::from("A"), Iid::from("B"), Iid::from("C"), Iid::from("A")]
                );
            }
        }
    }

    #[test]
    fn guid_expansion_s3_returns_both_in_insertion_order() {
        let mut depends = HashMap::new();
        depends.insert("X".to_string(), vec![]);
        depends.insert("Y".to_string(), vec![]);
        let mut guids = HashMap::new();
        guids.insert(
            "374b9459-c86f-4f5e-8b1e-1a160a4d6d02".to_string(),
            vec![Iid::from("X"), Iid::from("Y")],
        );
        let index = FakeIndex { depends, guids };

        let plan = resolve(&[Iid::from("374b9459-c86f-4f5e-8b1e-1a160a4d6d02")], &index).unwrap();
        assert_eq!(plan.full_install_items, vec![Iid::from("X"), Iid::from("Y")]);
    }

    #[test]
    fn unresolvable_reference_is_an_orphan_not_a_failure() {
        let depends = HashMap::new();
        let index = FakeIndex {
            depends,
            guids: HashMap::new(),
        };

        let plan = resolve(&[Iid::from("ghost")], &index).unwrap();
        assert!(plan.full_install_items.is_empty());
        assert_eq!(plan.orphan_install_items, vec![Iid::from("ghost")]);
    }

    #[test]
    fn closure_includes_transitive_dependencies() {
        let mut depends = HashMap::new();
        depends.insert("A".to_string(), vec![Reference::Iid(Iid::from("B"))]);
        depends.insert("B".to_string(), vec![Reference::Iid(Iid::from("C"))]);
        depends.insert("C".to_string(), vec![]);
        let index = FakeIndex {
            depends,
            guids: HashMap::new(),
        };

        let plan = resolve(&[Iid::from("A")], &index).unwrap();
        assert_eq!(
            plan.full_install_items,
            vec![Iid::from("A"), Iid::from("B"), Iid::from("C")]
        );
    }
}
