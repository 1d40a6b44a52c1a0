use crate::*;
use anyhow::Result;
use std::path::Path;

pub const NAME: u64 = 1;
pub const SIZE: u64 = 2;
pub const BLOB: u64 = 3;

/// Config for a store at `path` without fsync, which keeps tests fast.
pub fn config_at(path: &Path) -> UniverseConfig {
    UniverseConfig {
        sync: false,
        ..UniverseConfig::with_path(path)
    }
}

pub fn memory_store() -> Universe {
    Universe::in_memory(UniverseConfig::default())
}

/// Commits one atom per `(name, size)` pair in a single expansion.
pub fn commit_named(store: &Universe, items: &[(&str, i64)]) -> Result<Committed> {
    let mut tx = store.begin();
    for (name, size) in items {
        let h = tx.create_atom();
        tx.add_junction(h, NAME, *name)?;
        tx.add_junction(h, SIZE, *size)?;
    }
    Ok(tx.commit()?)
}

pub fn names(atoms: &[std::sync::Arc<atom::Atom>]) -> Vec<String> {
    atoms
        .iter()
        .map(|a| a.value(NAME).and_then(|p| p.as_str()).unwrap_or("").to_string())
        .collect()
}
