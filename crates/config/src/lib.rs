//! # Config - store settings
//!
//! [`UniverseConfig`] collects every knob the store reads at open time. Values
//! come from [`Default`] and can be overridden from the environment with
//! [`UniverseConfig::from_env`]:
//!
//! ```text
//! UNIVERSE_PATH              data file path                 (default: "universe.db")
//! UNIVERSE_SYNC              fsync after every commit       (default: "true")
//! UNIVERSE_HOSTED_THRESHOLD  file-hosted bytes threshold    (default: 65536, 0 = inline)
//! UNIVERSE_GLOBAL_ORDER      global index UCN order         (default: "desc")
//! UNIVERSE_REPAIR_TORN_TAIL  cut a torn last record on open (default: "false")
//! UNIVERSE_READ_ONLY         refuse commits                 (default: "false")
//! UNIVERSE_DEFAULT_INDEXING  update indices on commit       (default: "false")
//! ```
//!
//! A value that does not parse falls back to its default.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_PATH: &str = "UNIVERSE_PATH";
pub const ENV_SYNC: &str = "UNIVERSE_SYNC";
pub const ENV_HOSTED_THRESHOLD: &str = "UNIVERSE_HOSTED_THRESHOLD";
pub const ENV_GLOBAL_ORDER: &str = "UNIVERSE_GLOBAL_ORDER";
pub const ENV_REPAIR_TORN_TAIL: &str = "UNIVERSE_REPAIR_TORN_TAIL";
pub const ENV_READ_ONLY: &str = "UNIVERSE_READ_ONLY";
pub const ENV_DEFAULT_INDEXING: &str = "UNIVERSE_DEFAULT_INDEXING";

/// Byte values longer than this are stored as file-hosted payloads.
pub const DEFAULT_HOSTED_THRESHOLD: u64 = 64 * 1024;

/// Direction in which an index orders atoms that tie on every sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UcnOrder {
    /// Oldest commit first.
    Ascending,
    /// Newest commit first.
    #[default]
    Descending,
}

impl FromStr for UcnOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(UcnOrder::Ascending),
            "desc" | "descending" => Ok(UcnOrder::Descending),
            other => Err(format!("unknown UCN order: {}", other)),
        }
    }
}

impl fmt::Display for UcnOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UcnOrder::Ascending => "asc",
            UcnOrder::Descending => "desc",
        })
    }
}

/// Settings used when opening or creating a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseConfig {
    /// Path of the atom data file.
    pub path: PathBuf,
    /// If `true`, every commit is followed by `fsync`.
    pub sync: bool,
    /// Bytes junctions longer than this are written as file-hosted payloads.
    /// `0` keeps every payload inline.
    pub file_hosted_threshold: u64,
    /// UCN order of the global index.
    pub global_order: UcnOrder,
    /// Cut a truncated last record instead of refusing to open.
    pub repair_torn_tail: bool,
    pub read_only: bool,
    /// Bring every index up to date right after each commit.
    pub default_indexing: bool,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("universe.db"),
            sync: true,
            file_hosted_threshold: DEFAULT_HOSTED_THRESHOLD,
            global_order: UcnOrder::Descending,
            repair_torn_tail: false,
            read_only: false,
            default_indexing: false,
        }
    }
}

impl UniverseConfig {
    /// Defaults with the data file at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            path: lookup(ENV_PATH).map(PathBuf::from).unwrap_or(d.path),
            sync: parse_or(&lookup, ENV_SYNC, d.sync),
            file_hosted_threshold: parse_or(&lookup, ENV_HOSTED_THRESHOLD, d.file_hosted_threshold),
            global_order: parse_or(&lookup, ENV_GLOBAL_ORDER, d.global_order),
            repair_torn_tail: parse_or(&lookup, ENV_REPAIR_TORN_TAIL, d.repair_torn_tail),
            read_only: parse_or(&lookup, ENV_READ_ONLY, d.read_only),
            default_indexing: parse_or(&lookup, ENV_DEFAULT_INDEXING, d.default_indexing),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests;
