// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A scoped, hierarchical key -> list-of-strings store with `$(NAME)`
//! interpolation. Cycle detection during expansion uses an explicit
//! in-progress set threaded through `expand_with`, rather than any
//! ambient or thread-local state.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

mod parse;

pub use parse::Value;

/// A single binding: an ordered list of string values, and whether
/// rebinding is permitted.
#[derive(Debug, Clone)]
struct Binding {
    values: Vec<String>,
    constant: bool,
}

/// One level of the scope stack.
#[derive(Debug, Clone, Default)]
struct Scope {
    vars: HashMap<String, Binding>,
}

/// A stack of [`Scope`]s. Lookups walk top-to-bottom (most recently
/// pushed scope wins); `push`/`pop` bracket a lexical region such as a
/// per-OS or per-IID read.
#[derive(Debug, Clone)]
pub struct Store {
    scopes: Vec<Scope>,
    frozen: bool,
    allow_internal: bool,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            frozen: false,
            allow_internal: false,
        }
    }

    /// Allow user-supplied YAML to rebind `__NAME__`-style internal variables.
    pub fn set_allow_internal(&mut self, allow: bool) {
        self.allow_internal = allow;
    }

    /// Push a fresh scope; values set after this shadow, but do not
    /// clobber, the enclosing scope's bindings.
    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Pop the most recently pushed scope. A no-op below the root scope.
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Snapshot the store so that later mutation (if any slips through)
    /// cannot affect resolution already in flight. Subsequent `set`/
    /// `add_const` calls fail with [`Error::Frozen`].
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn check_internal(&self, name: &str) -> Result<(), Error> {
        let is_dunder = name.starts_with("__") && name.ends_with("__") && name.len() > 4;
        if is_dunder && !self.allow_internal {
            return Err(Error::InternalVar(name.to_string()));
        }
        Ok(())
    }

    /// Bind `name` to a single value, replacing any prior non-constant
    /// binding in the current (top) scope.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), Error> {
        self.set_list(name, vec![value.into()])
    }

    /// Bind `name` to an ordered list of values in the current scope.
    pub fn set_list(&mut self, name: &str, values: Vec<String>) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen);
        }
        self.check_internal(name)?;

        if let Some(existing) = self.find(name) {
            if existing.constant {
                return Err(Error::ImmutableVar(name.to_string()));
            }
        }

        let scope = self.scopes.last_mut().expect("root scope always present");
        scope.vars.insert(
            name.to_string(),
            Binding {
                values,
                constant: false,
            },
        );
        Ok(())
    }

    /// Bind a constant which may never be rebound afterward.
    pub fn add_const(&mut self, name: &str, value: impl Into<String>) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen);
        }
        if self.find(name).is_some() {
            return Err(Error::ImmutableVar(name.to_string()));
        }
        let scope = self.scopes.last_mut().expect("root scope always present");
        scope.vars.insert(
            name.to_string(),
            Binding {
                values: vec![value.into()],
                constant: true,
            },
        );
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.vars.get(name))
    }

    /// Raw, unexpanded values bound to `name`.
    pub fn raw(&self, name: &str) -> Option<&[String]> {
        self.find(name).map(|binding| binding.values.as_slice())
    }

    /// Resolve `name` to its single expanded value, joining a multi-value
    /// binding with a single space (the default list separator).
    pub fn get(&self, name: &str) -> Result<String, Error> {
        self.get_joined(name, " ")
    }

    /// Resolve `name`, joining multiple values with `sep` (backs the
    /// `$(NAME:list_sep=" ")` form).
    pub fn get_joined(&self, name: &str, sep: &str) -> Result<String, Error> {
        let mut visiting = HashSet::new();
        let values = self.resolve_name(name, &mut visiting)?;
        Ok(values.join(sep))
    }

    /// Expand all `$(...)` references inside an arbitrary string.
    pub fn expand(&self, text: &str) -> Result<String, Error> {
        let mut visiting = HashSet::new();
        self.expand_with(text, &mut visiting)
    }

    fn resolve_name(&self, name: &str, visiting: &mut HashSet<String>) -> Result<Vec<String>, Error> {
        let binding = self
            .find(name)
            .ok_or_else(|| Error::UnknownVar(name.to_string()))?;

        if !visiting.insert(name.to_string()) {
            return Err(Error::CyclicReference(name.to_string()));
        }

        let mut out = Vec::with_capacity(binding.values.len());
        for raw in &binding.values {
            out.push(self.expand_with(raw, visiting)?);
        }

        visiting.remove(name);
        Ok(out)
    }

    fn expand_with(&self, text: &str, visiting: &mut HashSet<String>) -> Result<String, Error> {
        let parsed = parse::parse(text);
        self.render(&parsed, visiting)
    }

    fn render(&self, value: &Value, visiting: &mut HashSet<String>) -> Result<String, Error> {
        match value {
            Value::Atom(s) => Ok(s.clone()),
            Value::Ref { name, list_sep } => {
                let sep = list_sep.as_deref().unwrap_or(" ");
                let binding = self
                    .find(name)
                    .ok_or_else(|| Error::UnknownVar(name.clone()))?;

                if !visiting.insert(name.clone()) {
                    return Err(Error::CyclicReference(name.clone()));
                }

                let mut parts = Vec::with_capacity(binding.values.len());
                for raw in &binding.values {
                    parts.push(self.expand_with(raw, visiting)?);
                }

                visiting.remove(name);
                Ok(parts.join(sep))
            }
            Value::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&self.render(part, visiting)?);
                }
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown variable: {0}")]
    UnknownVar(String),
    #[error("cyclic variable reference: {0}")]
    CyclicReference(String),
    #[error("constant variable may not be rebound: {0}")]
    ImmutableVar(String),
    #[error("internal variable {0} may not be set without --allow-internal")]
    InternalVar(String),
    #[error("store is frozen")]
    Frozen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_simple_reference() {
        let mut store = Store::new();
        store.set("NAME", "moss").unwrap();
        store.set("GREETING", "hello $(NAME)").unwrap();
        assert_eq!(store.get("GREETING").unwrap(), "hello moss");
    }

    #[test]
    fn detects_cycles() {
        let mut store = Store::new();
        store.set("A", "$(B)").unwrap();
        store.set("B", "$(A)").unwrap();
        assert_eq!(store.get("A"), Err(Error::CyclicReference("A".to_string())));
    }

    #[test]
    fn constants_cannot_be_rebound() {
        let mut store = Store::new();
        store.add_const("ARCH", "x86_64").unwrap();
        assert_eq!(
            store.set("ARCH", "arm64"),
            Err(Error::ImmutableVar("ARCH".to_string()))
        );
    }

    #[test]
    fn list_sep_joins_multi_value_binding() {
        let mut store = Store::new();
        store.set_list("ITEMS", vec!["a".into(), "b".into(), "c".into()]).unwrap();
        store.set("JOINED", "$(ITEMS:list_sep=\",\")").unwrap();
        assert_eq!(store.get("JOINED").unwrap(), "a,b,c");
    }

    #[test]
    fn scopes_shadow_without_clobbering() {
        let mut store = Store::new();
        store.set("X", "outer").unwrap();
        store.push_scope();
        store.set("X", "inner").unwrap();
        assert_eq!(store.get("X").unwrap(), "inner");
        store.pop_scope();
        assert_eq!(store.get("X").unwrap(), "outer");
    }

    #[test]
    fn internal_vars_are_protected_by_default() {
        let mut store = Store::new();
        assert_eq!(
            store.set("__SOURCE_PREFIX__", "/x"),
            Err(Error::InternalVar("__SOURCE_PREFIX__".to_string()))
        );
        store.set_allow_internal(true);
        store.set("__SOURCE_PREFIX__", "/x").unwrap();
    }

    #[test]
    fn frozen_store_rejects_writes() {
        let mut store = Store::new();
        store.set("X", "1").unwrap();
        store.freeze();
        assert_eq!(store.set("X", "2"), Err(Error::Frozen));
    }
}
