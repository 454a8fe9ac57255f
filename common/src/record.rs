use std::collections::BTreeMap;
use std::path::PathBuf;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[default]
    Unknown,
    Available,
    AvailableLocal,
    Installed,
    Installing,
    Removing,
    Updatable,
    Unavailable,
    QueuedForInstall,
    PendingInstall,
    PendingRemove,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    #[default]
    Generic,
    Desktop,
    Addon,
    OsUpgrade,
    /// A software repository rather than an installable item.
    Source,
    WebApp,
}

/// A size that is either known, not known yet, or known to be unknowable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Size {
    #[default]
    Unknown,
    Unknowable,
    Valid(u64),
}

impl Size {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Size::Unknown)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallDate {
    /// Never looked up.
    #[default]
    Unset,
    /// Looked up, but the daemon could not tell.
    Unknown,
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrgencyKind {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Quirks: u32 {
        /// Placeholder matching any record with the same id prefix.
        const IS_WILDCARD = 1;
        const NOT_LAUNCHABLE = 1 << 1;
        /// The simulated system upgrade already ran for this record.
        const UPGRADE_SIMULATED = 1 << 2;
    }
}

impl Default for Quirks {
    fn default() -> Self {
        Quirks::empty()
    }
}

/// An installable or updatable item being refined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub kind: RecordKind,
    /// Name of the backend that owns this record, if any has claimed it.
    pub management_plugin: Option<String>,
    /// Declared source package names.
    pub sources: Vec<String>,
    /// Fully-qualified package ids, see [`crate::PackageId`].
    pub source_ids: Vec<String>,
    pub state: State,
    pub version: Option<String>,
    pub update_version: Option<String>,
    pub size_installed: Size,
    pub size_download: Size,
    pub origin: Option<String>,
    pub license: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub update_details: Option<String>,
    pub update_urgency: UrgencyKind,
    pub install_date: InstallDate,
    pub history: Vec<Record>,
    pub related: Vec<Record>,
    pub quirks: Quirks,
    pub metadata: BTreeMap<String, String>,
    /// Set when the record was created from a local package file.
    pub local_file: Option<PathBuf>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, name: impl Into<String>) -> Self {
        self.add_source(name);
        self
    }

    pub fn with_source_id(mut self, package_id: impl Into<String>) -> Self {
        self.add_source_id(package_id);
        self
    }

    pub fn add_source(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.sources.contains(&name) {
            self.sources.push(name);
        }
    }

    pub fn add_source_id(&mut self, package_id: impl Into<String>) {
        let package_id = package_id.into();
        if !self.source_ids.contains(&package_id) {
            self.source_ids.push(package_id);
        }
    }

    pub fn default_source(&self) -> Option<&str> {
        self.sources.first().map(String::as_str)
    }

    pub fn default_source_id(&self) -> Option<&str> {
        self.source_ids.first().map(String::as_str)
    }

    pub fn has_quirk(&self, quirk: Quirks) -> bool {
        self.quirks.contains(quirk)
    }

    pub fn add_quirk(&mut self, quirk: Quirks) {
        self.quirks.insert(quirk);
    }

    pub fn is_installed(&self) -> bool {
        matches!(
            self.state,
            State::Installed | State::Updatable | State::Removing
        )
    }

    /// Whether `namespace` may manage this record: either it already claims
    /// it, or nobody does yet.
    pub fn is_managed_by(&self, namespace: &str) -> bool {
        match &self.management_plugin {
            Some(owner) => owner == namespace,
            None => true,
        }
    }

    pub fn metadata_item(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn add_related(&mut self, related: Record) {
        if !self.related.iter().any(|r| r.id == related.id) {
            self.related.push(related);
        }
    }

    pub fn add_history(&mut self, entry: Record) {
        self.history.push(entry);
    }

    /// Multi-line dump used in diagnostics.
    pub fn to_debug_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
