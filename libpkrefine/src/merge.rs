//! Folding daemon results back onto records.
//!
//! Every function here mutates records in place and only ever fills fields
//! that are still empty, apart from `state` which follows the decision
//! rules in [`decide_state`].

use std::collections::{HashMap, HashSet};

use common::{
    InstallDate, PackageId, Record, RecordKind, Size, State, UrgencyKind, WeakPackageId,
};
use log::{debug, warn};

use crate::daemon::{Details, HistoryEntry, Info, Package, UpdateDetail};

/// Lookup over daemon results by exact id and by weak identity.
pub(crate) struct PackageIndex<'a, T> {
    exact: HashMap<&'a str, &'a T>,
    weak: HashMap<WeakPackageId, &'a T>,
}

impl<'a, T> PackageIndex<'a, T> {
    pub(crate) fn new(items: &'a [T], id_of: impl Fn(&'a T) -> &'a str) -> Self {
        let mut exact = HashMap::with_capacity(items.len());
        let mut weak = HashMap::with_capacity(items.len());
        for item in items {
            let id = id_of(item);
            exact.insert(id, item);
            match id.parse::<PackageId>() {
                Ok(parsed) => {
                    weak.entry(parsed.weak()).or_insert(item);
                }
                Err(e) => debug!("not indexing malformed package id {id}: {e}"),
            }
        }
        Self { exact, weak }
    }

    pub(crate) fn exact(&self, id: &str) -> Option<&'a T> {
        self.exact.get(id).copied()
    }

    /// Matches on name, version and arch only.
    pub(crate) fn weak(&self, id: &str) -> Option<&'a T> {
        let parsed = id.parse::<PackageId>().ok()?;
        self.weak.get(&parsed.weak()).copied()
    }
}

/// A daemon package with its id already split.
pub(crate) struct ParsedPackage<'a> {
    pub id: PackageId,
    pub package: &'a Package,
}

pub(crate) fn parse_packages(packages: &[Package]) -> Vec<ParsedPackage<'_>> {
    packages
        .iter()
        .filter_map(|package| match package.id.parse::<PackageId>() {
            Ok(id) => Some(ParsedPackage { id, package }),
            Err(e) => {
                warn!("ignoring package with malformed id {}: {e}", package.id);
                None
            }
        })
        .collect()
}

pub(crate) fn set_metadata_from_package(
    record: &mut Record,
    parsed: &ParsedPackage<'_>,
    namespace: &str,
) {
    let package = parsed.package;
    record.management_plugin = Some(namespace.to_string());
    record.add_source(parsed.id.name());
    record.add_source_id(parsed.id.as_str());

    if record.origin.is_none() && !parsed.id.origin().is_empty() {
        record.origin = Some(parsed.id.origin().to_string());
    }

    if package.info == Info::Unavailable {
        record.state = State::Unavailable;
        if record.size_installed.is_unknown() {
            record.size_installed = Size::Unknowable;
        }
        if record.size_download.is_unknown() {
            record.size_download = Size::Unknowable;
        }
    }

    if record.version.is_none() {
        record.version = Some(parsed.id.version().to_string());
    }
    if record.name.is_none() {
        record.name = Some(parsed.id.name().to_string());
    }
    if record.summary.is_none() && !package.summary.is_empty() {
        record.summary = Some(package.summary.clone());
    }
}

/// Applies the installed/available tally of a resolve to `record.state`.
pub fn decide_state(record: &mut Record, installed: usize, available: usize) {
    let total = record.sources.len();
    let found = installed + available;

    if installed == total && available == 0 {
        if record.state == State::Unknown {
            record.state = State::Installed;
        }
    } else if found == total {
        // an earlier, weaker signal may have claimed installed
        if record.state == State::Installed {
            record.state = State::Unknown;
        }
        if record.state == State::Unknown {
            record.state = State::Available;
        }
    } else if found > total {
        // more matches than declared sources; treat as an update
        record.state = State::Updatable;
    } else {
        debug!(
            "failed to find all packages for {} (sources: {}):\n{}",
            record.id,
            record.sources.join(", "),
            record.to_debug_string()
        );
        record.state = State::Unknown;
    }
}

/// Folds resolve results onto one record and decides its state.
pub(crate) fn apply_resolve(record: &mut Record, packages: &[ParsedPackage<'_>], namespace: &str) {
    if record.local_file.is_some() {
        return;
    }
    let mut installed = 0;
    let mut available = 0;
    let sources = record.sources.clone();
    for source in &sources {
        for parsed in packages.iter().filter(|p| p.id.name() == source) {
            set_metadata_from_package(record, parsed, namespace);
            match parsed.package.info {
                Info::Installed => installed += 1,
                Info::Available | Info::Unavailable => available += 1,
                _ => {}
            }
        }
    }
    decide_state(record, installed, available);
}

/// Takes the single owning package of a file search; anything else is
/// logged and ignored.
pub(crate) fn apply_file_search(
    record: &mut Record,
    path: &str,
    packages: &[ParsedPackage<'_>],
    namespace: &str,
) -> bool {
    match packages {
        [only] => {
            set_metadata_from_package(record, only, namespace);
            true
        }
        _ => {
            warn!(
                "failed to find one package for {}, {path}, [{}]",
                record.id,
                packages.len()
            );
            false
        }
    }
}

pub(crate) fn apply_repo_package(record: &mut Record, packages: &[Package]) -> bool {
    match packages {
        [only] => {
            record.add_source_id(only.id.clone());
            true
        }
        _ => {
            debug!(
                "repo {} is provided by {} packages",
                record.id,
                packages.len()
            );
            false
        }
    }
}

pub(crate) fn apply_details(record: &mut Record, index: &PackageIndex<'_, Details>) {
    let mut size = 0u64;
    let source_ids = record.source_ids.clone();
    for package_id in &source_ids {
        let Some(details) = index.weak(package_id) else {
            continue;
        };
        if record.license.is_none() {
            record.license = details.license.clone().filter(|l| !l.is_empty());
        }
        if record.url.is_none() {
            record.url = details.url.clone().filter(|u| !u.is_empty());
        }
        if record.description.is_none() {
            record.description = details.description.clone().filter(|d| !d.is_empty());
        }
        size += details.size;
    }

    // the size is the size of all sources
    if record.state == State::Updatable {
        if size > 0 && record.size_installed.is_unknown() {
            record.size_installed = Size::Valid(size);
        }
        if size > 0 && record.size_download.is_unknown() {
            record.size_download = Size::Valid(size);
        }
    } else if record.is_installed() {
        if record.size_download.is_unknown() {
            record.size_download = Size::Unknowable;
        }
        if size > 0 && record.size_installed.is_unknown() {
            record.size_installed = Size::Valid(size);
        }
    } else {
        if record.size_installed.is_unknown() {
            record.size_installed = Size::Unknowable;
        }
        if size > 0 && record.size_download.is_unknown() {
            record.size_download = Size::Valid(size);
        }
    }
}

pub(crate) fn apply_update_detail(record: &mut Record, index: &PackageIndex<'_, UpdateDetail>) {
    if record.update_details.is_some() {
        return;
    }
    let Some(detail) = record.default_source_id().and_then(|id| index.exact(id)) else {
        return;
    };
    if !detail.update_text.is_empty() {
        record.update_details = Some(detail.update_text.clone());
    }
}

pub fn urgency_for(info: Info) -> UrgencyKind {
    match info {
        Info::Available | Info::Normal | Info::Low | Info::Enhancement => UrgencyKind::Low,
        Info::Bugfix => UrgencyKind::Medium,
        Info::Important => UrgencyKind::High,
        Info::Security => UrgencyKind::Critical,
        other => {
            warn!("unhandled info state {other:?}");
            UrgencyKind::Unknown
        }
    }
}

pub(crate) fn apply_urgency(
    record: &mut Record,
    index: &PackageIndex<'_, ParsedPackage<'_>>,
    updates: &[ParsedPackage<'_>],
) {
    let Some(package_id) = record.default_source_id() else {
        return;
    };
    // the record may still carry the installed id rather than the update
    let matched = index.exact(package_id).or_else(|| {
        let wanted = package_id.parse::<PackageId>().ok()?;
        updates
            .iter()
            .find(|p| p.id.name() == wanted.name() && p.id.arch() == wanted.arch())
    });
    let Some(update) = matched else {
        return;
    };
    record.update_urgency = urgency_for(update.package.info);
    if record.update_version.is_none() {
        record.update_version = Some(update.id.version().to_string());
    }
}

fn history_state(info: Info) -> Option<State> {
    match info {
        Info::Installing => Some(State::Installed),
        Info::Removing => Some(State::Available),
        Info::Updating => Some(State::Updatable),
        _ => None,
    }
}

/// Adds per-package history to `record`; `None` means the daemon had no
/// entries for its default source.
pub(crate) fn apply_history(record: &mut Record, entries: Option<&[HistoryEntry]>) {
    let entries = match entries {
        Some(entries) if !entries.is_empty() => entries,
        _ => {
            // it was installed at some point, we just do not know when
            if record.state == State::Installed {
                let mut dummy = Record::new(record.id.clone());
                dummy.install_date = InstallDate::Unknown;
                dummy.state = State::Installed;
                dummy.version = record.version.clone();
                dummy.management_plugin = record.management_plugin.clone();
                record.add_history(dummy);
            }
            record.install_date = InstallDate::Unknown;
            return;
        }
    };

    let mut newest = None;
    for entry in entries {
        let Some(state) = history_state(entry.info) else {
            debug!("ignoring history kind {:?} for {}", entry.info, record.id);
            continue;
        };
        let mut item = Record::new(record.id.clone());
        item.name = record.name.clone();
        item.state = state;
        item.version = Some(entry.version.clone());
        item.install_date = InstallDate::At(entry.timestamp);
        record.add_history(item);
        if newest.is_none_or(|t| entry.timestamp > t) {
            newest = Some(entry.timestamp);
        }
    }
    record.install_date = match newest {
        Some(at) => InstallDate::At(at),
        None => InstallDate::Unknown,
    };
}

/// Turns a package listing into records, keeping only the installed package
/// when a name is reported both installed and otherwise.
pub(crate) fn records_from_packages(packages: &[Package], namespace: &str) -> Vec<Record> {
    let parsed = parse_packages(packages);
    let installed: HashSet<&str> = parsed
        .iter()
        .filter(|p| p.package.info == Info::Installed)
        .map(|p| p.id.name())
        .collect();

    let mut records = Vec::new();
    for p in &parsed {
        if p.package.info != Info::Installed && installed.contains(p.id.name()) {
            debug!(
                "ignoring {} as an installed {} is also reported",
                p.id,
                p.id.name()
            );
            continue;
        }
        let mut record = Record::new(p.id.as_str())
            .with_source(p.id.name())
            .with_source_id(p.id.as_str());
        record.kind = RecordKind::Generic;
        record.management_plugin = Some(namespace.to_string());
        record.name = Some(p.id.name().to_string());
        if !p.package.summary.is_empty() {
            record.summary = Some(p.package.summary.clone());
        }
        record.version = Some(p.id.version().to_string());
        record.state = match p.package.info {
            Info::Installed => State::Installed,
            Info::Available => State::Available,
            Info::Installing
            | Info::Updating
            | Info::Downgrading
            | Info::Obsoleting
            | Info::Untrusted => State::Unknown,
            Info::Unavailable | Info::Removing => State::Unavailable,
            other => {
                warn!("unknown info state of {}: {other:?}", p.id);
                State::Unknown
            }
        };
        records.push(record);
    }
    records
}
