use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::preferences::{GroupSettings, UserPreferences};

/// Everything that survives a restart, written as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSnapshot {
    pub chat_histories: BTreeMap<String, Vec<String>>,
    pub user_preferences: BTreeMap<String, UserPreferences>,
    pub group_settings: BTreeMap<String, GroupSettings>,
    /// Keyed by user id, or by group id for group personalities.
    pub custom_instructions: BTreeMap<String, String>,
    pub blocklist: BTreeMap<String, BTreeSet<String>>,
    /// Channels where every message gets a reply.
    pub respond_all_channels: BTreeSet<String>,
    /// Channel id to the users who asked for replies without a mention.
    pub always_respond_users: BTreeMap<String, BTreeSet<String>>,
}

pub(crate) fn read_snapshot(path: &Path) -> anyhow::Result<Option<StateSnapshot>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(snapshot))
}

/// Writes through a sibling temp file and renames it over `path`.
pub(crate) fn write_snapshot(path: &Path, snapshot: &StateSnapshot) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())?;
    temp.flush()?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
