#![forbid(unsafe_code)]

//! The flow-sensitive typing environment.
//!
//! A persistent map from variable name to (nominal, raw) type pair. `put`
//! and `remove` return new environments; `clone` is O(1) structural sharing
//! and mutation after a clone is never visible through the other handle.
//! [`Env::Bottom`] marks an unreachable program point (after return, throw
//! or an unconditional break) and is absorbed by every join.

use im::OrdMap;
use sable_ir::types::{self, TypePair};

#[derive(Clone, Debug, PartialEq)]
pub enum Env {
    Bottom,
    Live(OrdMap<String, TypePair>),
}

impl Env {
    pub fn new() -> Env {
        Env::Live(OrdMap::new())
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Env::Bottom)
    }

    pub fn get(&self, name: &str) -> Option<&TypePair> {
        match self {
            Env::Bottom => None,
            Env::Live(map) => map.get(name),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn put(&self, name: impl Into<String>, pair: TypePair) -> Env {
        match self {
            // Binding at an unreachable point stays unreachable.
            Env::Bottom => Env::Bottom,
            Env::Live(map) => Env::Live(map.update(name.into(), pair)),
        }
    }

    pub fn remove(&self, name: &str) -> Env {
        match self {
            Env::Bottom => Env::Bottom,
            Env::Live(map) => Env::Live(map.without(name)),
        }
    }

    /// Joins the environments of two merging control-flow paths: common
    /// variables are bound to the least upper bound of their two types and
    /// one-sided bindings are dropped. Bottom absorbs into the other side.
    pub fn join(&self, other: &Env) -> Env {
        match (self, other) {
            (Env::Bottom, e) => e.clone(),
            (e, Env::Bottom) => e.clone(),
            (Env::Live(a), Env::Live(b)) => {
                let mut out = OrdMap::new();
                for (name, pa) in a {
                    if let Some(pb) = b.get(name) {
                        out.insert(
                            name.clone(),
                            TypePair::new(
                                types::union(&pa.nominal, &pb.nominal),
                                types::union(&pa.raw, &pb.raw),
                            ),
                        );
                    }
                }
                Env::Live(out)
            }
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}
