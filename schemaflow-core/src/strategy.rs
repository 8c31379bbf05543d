use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sync path a client chooses when it joins a workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Mergeable replica: binary updates, merged in any order.
    #[default]
    Merge,
    /// JSON patches under optimistic concurrency.
    Patch,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Merge => "merge",
            SyncStrategy::Patch => "patch",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" | "crdt" => Ok(SyncStrategy::Merge),
            "patch" | "ot" => Ok(SyncStrategy::Patch),
            other => Err(format!("unknown sync strategy: {other}")),
        }
    }
}
