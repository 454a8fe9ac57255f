//! Scatter/gather refine of records against the package daemon.
//!
//! One call to [`PackageRefiner`]'s `refine` scans the records once, issues
//! one batch per missing field, and merges each batch's results back onto
//! the records as it completes. Batches run concurrently and in no
//! particular order; merging happens in the calling task only, so records
//! have a single writer. Batches that depend on package ids (details,
//! update details, urgency, history) are held back until every id
//! resolution of the call has settled, then issued once for all records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::{FieldRequirement, InstallDate, Quirks, Record, RecordKind, State, UrgencyKind};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{HistoryLookup, QueryClient};
use crate::config::RefineConfig;
use crate::daemon::{Details, Filter, Package, ProgressSink, UpdateDetail};
use crate::error::RefineError;
use crate::job::{JobResult, RefineJob};
use crate::merge::{self, PackageIndex};
use crate::pipeline::Refiner;
use crate::progress::{ProgressCallback, batch_sink};

pub const REPO_FILENAME_KEY: &str = "repos::repo-filename";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvePhase {
    /// Native arch, newest only.
    Arch,
    /// Retry for whatever the first pass left unknown.
    AnyArch,
}

impl ResolvePhase {
    fn filter(self) -> Filter {
        match self {
            ResolvePhase::Arch => Filter::NEWEST | Filter::ARCH,
            ResolvePhase::AnyArch => Filter::NEWEST | Filter::NOT_ARCH | Filter::NOT_SOURCE,
        }
    }
}

#[derive(Debug, Clone)]
enum Stage {
    Resolve(ResolvePhase),
    FileToId,
    RepoToId(String),
    UpdateDetails,
    Details,
    Urgency,
    History,
    UpgradeRemoved,
}

impl Stage {
    /// Whether the stage can still give a record its package id.
    fn resolves_ids(&self) -> bool {
        matches!(
            self,
            Stage::Resolve(_) | Stage::FileToId | Stage::RepoToId(_)
        )
    }
}

enum Payload {
    Packages(Vec<Package>),
    /// None of the setup files is on disk.
    NoFile,
    FileOwner {
        path: String,
        packages: Vec<Package>,
    },
    Details(Vec<Details>),
    UpdateDetails(Vec<UpdateDetail>),
    History(HistoryLookup),
}

struct Finished {
    stage: Stage,
    indices: Vec<usize>,
    result: Result<Payload, RefineError>,
}

fn valid_package_name(source: &str) -> bool {
    !source.is_empty() && !source.contains('/')
}

fn needs_package_id(record: &Record, req: FieldRequirement) -> bool {
    record.default_source_id().is_none() && req.requires_package_id()
}

fn needs_origin(record: &Record, req: FieldRequirement) -> bool {
    record.origin.is_none() && req.contains(FieldRequirement::ORIGIN)
}

fn needs_version(record: &Record, req: FieldRequirement) -> bool {
    record.version.is_none() && req.contains(FieldRequirement::VERSION)
}

fn needs_resolve(record: &Record, req: FieldRequirement) -> bool {
    if record.local_file.is_some() {
        return false;
    }
    match record.default_source() {
        Some(source) if valid_package_name(source) => {}
        _ => return false,
    }
    record.state == State::Unknown
        || needs_package_id(record, req)
        || needs_origin(record, req)
        || needs_version(record, req)
}

fn needs_details(record: &Record, req: FieldRequirement) -> bool {
    if record.default_source_id().is_none() {
        return false;
    }
    (req.contains(FieldRequirement::LICENSE) && record.license.is_none())
        || (req.contains(FieldRequirement::URL) && record.url.is_none())
        || (req.contains(FieldRequirement::DESCRIPTION) && record.description.is_none())
        || (req.contains(FieldRequirement::SIZE)
            && (record.size_installed.is_unknown() || record.size_download.is_unknown()))
}

fn needs_update_details(record: &Record, req: FieldRequirement) -> bool {
    req.contains(FieldRequirement::UPDATE_DETAILS)
        && record.state == State::Updatable
        && record.default_source_id().is_some()
        && record.update_details.is_none()
}

fn needs_urgency(record: &Record, req: FieldRequirement) -> bool {
    req.contains(FieldRequirement::UPDATE_SEVERITY)
        && record.state == State::Updatable
        && record.default_source_id().is_some()
        && record.update_urgency == UrgencyKind::Unknown
}

fn needs_history(record: &Record, req: FieldRequirement) -> bool {
    req.contains(FieldRequirement::HISTORY)
        && !record.sources.is_empty()
        && record.install_date == InstallDate::Unset
}

fn needs_upgrade_removed(record: &Record, req: FieldRequirement) -> bool {
    req.contains(FieldRequirement::UPGRADE_REMOVED)
        && record.kind == RecordKind::OsUpgrade
        && !record.has_quirk(Quirks::UPGRADE_SIMULATED)
}

fn needs_repo_package(record: &Record) -> Option<&str> {
    if record.kind != RecordKind::Source || record.default_source_id().is_some() {
        return None;
    }
    record.metadata_item(REPO_FILENAME_KEY)
}

/// Files installed by the package that owns `record`, in order of
/// preference.
fn setup_candidates(
    record: &Record,
    req: FieldRequirement,
    data_dir: &Path,
) -> Option<Vec<PathBuf>> {
    if !req.contains(FieldRequirement::SETUP_ACTION) || record.default_source_id().is_some() {
        return None;
    }
    let metainfo = format!("{}.metainfo.xml", record.id);
    match record.kind {
        RecordKind::Desktop => Some(vec![data_dir.join("applications").join(&record.id)]),
        RecordKind::Addon => Some(vec![
            data_dir.join("appdata").join(&metainfo),
            data_dir.join("metainfo").join(&metainfo),
        ]),
        _ => None,
    }
}

async fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    for path in candidates {
        match tokio::fs::try_exists(path).await {
            Ok(true) => return Some(path.clone()),
            Ok(false) => debug!("ignoring {} as it does not exist", path.display()),
            Err(e) => debug!("cannot check {}: {e}", path.display()),
        }
    }
    None
}

/// Refines records owned by the package daemon's namespace.
pub struct PackageRefiner {
    client: QueryClient,
    namespace: String,
    data_dir: PathBuf,
}

impl PackageRefiner {
    pub const NAME: &'static str = "packagekit";

    pub fn new(client: QueryClient, config: &RefineConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            data_dir: config.data_dir.clone(),
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    fn owns(&self, record: &Record) -> bool {
        record.is_managed_by(&self.namespace)
            && !record.has_quirk(Quirks::IS_WILDCARD)
            && record.kind != RecordKind::WebApp
    }
}

#[async_trait]
impl Refiner for PackageRefiner {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn refine(
        &self,
        records: &mut [Record],
        req: FieldRequirement,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        let (job, done) = RefineJob::new(cancel.clone());
        let mut run = Run {
            refiner: self,
            req: req.implied(),
            progress,
            cancel,
            job,
            in_flight: FuturesUnordered::new(),
            upgrade_dispatched: false,
            settled: Vec::new(),
            id_pending: 0,
            flushed: false,
        };
        debug!(
            "[job {}] refining {} records for {:?}",
            run.job.id(),
            records.len(),
            run.req
        );

        run.dispatch_initial(records);

        while let Some(finished) = run.in_flight.next().await {
            let outcome = run.merge(records, finished);
            run.flush_if_settled(records);
            run.job.release(outcome);
        }

        match done.await {
            Ok(result) => result,
            Err(_) => Err(RefineError::Failed(format!(
                "refine job {} ended without completing",
                run.job.id()
            ))),
        }
    }
}

/// State of one refine call.
struct Run<'a> {
    refiner: &'a PackageRefiner,
    req: FieldRequirement,
    progress: Option<ProgressCallback>,
    cancel: &'a CancellationToken,
    job: RefineJob,
    in_flight: FuturesUnordered<BoxFuture<'a, Finished>>,
    /// Only one upgrade target is supported per job.
    upgrade_dispatched: bool,
    /// Records whose id resolution is done, waiting for dependent batches.
    settled: Vec<usize>,
    /// Id-resolving batches still in flight.
    id_pending: usize,
    /// Dependent batches issued and the dispatch slot returned.
    flushed: bool,
}

impl<'a> Run<'a> {
    fn job_id(&self) -> Uuid {
        self.job.id()
    }

    fn client(&self) -> &'a QueryClient {
        &self.refiner.client
    }

    fn sink(&self, records: &[Record], indices: &[usize]) -> ProgressSink {
        let mut ids = HashMap::new();
        for &i in indices {
            for package_id in &records[i].source_ids {
                ids.insert(package_id.clone(), records[i].id.clone());
            }
        }
        batch_sink(self.progress.clone(), ids)
    }

    /// Reserves a slot and queues `fut`. Nothing is issued once cancelled.
    fn issue(
        &mut self,
        stage: Stage,
        indices: Vec<usize>,
        fut: BoxFuture<'a, Result<Payload, RefineError>>,
    ) {
        if self.cancel.is_cancelled() {
            debug!("[job {}] cancelled, not issuing {stage:?}", self.job_id());
            return;
        }
        self.job.reserve();
        if stage.resolves_ids() {
            self.id_pending += 1;
        }
        self.in_flight.push(
            async move {
                let result = fut.await;
                Finished {
                    stage,
                    indices,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn dispatch_initial(&mut self, records: &[Record]) {
        let mut resolve = Vec::new();
        for (i, record) in records.iter().enumerate() {
            if !self.refiner.owns(record) {
                continue;
            }
            if !self.upgrade_dispatched && needs_upgrade_removed(record, self.req) {
                self.dispatch_upgrade(records, i);
            }
            if needs_resolve(record, self.req) {
                resolve.push(i);
            } else if !self.dispatch_id_lookup(records, i) {
                self.settled.push(i);
            }
        }
        self.dispatch_resolve(records, resolve, ResolvePhase::Arch);
        self.flush_if_settled(records);
    }

    /// Once no id-resolving batch is left, issues the dependent batches for
    /// every settled record and returns the dispatch slot. The slot is held
    /// until then so the job cannot complete early.
    fn flush_if_settled(&mut self, records: &[Record]) {
        if self.flushed || self.id_pending > 0 {
            return;
        }
        self.flushed = true;
        let settled = std::mem::take(&mut self.settled);
        self.dispatch_dependent(records, &settled);
        self.job.release_dispatch();
    }

    fn dispatch_resolve(&mut self, records: &[Record], indices: Vec<usize>, phase: ResolvePhase) {
        if indices.is_empty() {
            return;
        }
        let mut names = Vec::new();
        for &i in &indices {
            for source in &records[i].sources {
                if valid_package_name(source) {
                    names.push(source.clone());
                } else {
                    warn!("invalid package name '{source}' for {}", records[i].id);
                }
            }
        }
        let sink = self.sink(records, &indices);
        let client = self.client();
        let cancel = self.cancel;
        self.issue(
            Stage::Resolve(phase),
            indices,
            async move {
                client
                    .resolve(phase.filter(), &names, sink, cancel)
                    .await
                    .map(Payload::Packages)
            }
            .boxed(),
        );
    }

    /// Issues a file or repo search for a record without a package id.
    /// Returns whether one was issued.
    fn dispatch_id_lookup(&mut self, records: &[Record], i: usize) -> bool {
        let record = &records[i];
        let sink = self.sink(records, &[i]);
        let client = self.client();
        let cancel = self.cancel;
        if let Some(candidates) = setup_candidates(record, self.req, &self.refiner.data_dir) {
            self.issue(
                Stage::FileToId,
                vec![i],
                async move {
                    let Some(path) = first_existing(&candidates).await else {
                        return Ok(Payload::NoFile);
                    };
                    let path = path.to_string_lossy().into_owned();
                    let paths = std::slice::from_ref(&path);
                    let packages = client
                        .search_files(Filter::INSTALLED, paths, sink, cancel)
                        .await?;
                    Ok::<_, RefineError>(Payload::FileOwner { path, packages })
                }
                .boxed(),
            );
        } else if let Some(repo_file) = needs_repo_package(record) {
            let repo_file = repo_file.to_string();
            self.issue(
                Stage::RepoToId(repo_file.clone()),
                vec![i],
                async move {
                    client
                        .search_files(Filter::INSTALLED, &[repo_file], sink, cancel)
                        .await
                        .map(Payload::Packages)
                }
                .boxed(),
            );
        } else {
            return false;
        }
        true
    }

    fn dispatch_upgrade(&mut self, records: &[Record], i: usize) {
        self.upgrade_dispatched = true;
        let version = records[i].version.clone().unwrap_or_default();
        let sink = self.sink(records, &[i]);
        let client = self.client();
        let cancel = self.cancel;
        self.issue(
            Stage::UpgradeRemoved,
            vec![i],
            async move {
                client
                    .simulate_upgrade(&version, sink, cancel)
                    .await
                    .map(Payload::Packages)
            }
            .boxed(),
        );
    }

    /// Issues the batches that need settled package ids.
    fn dispatch_dependent(&mut self, records: &[Record], indices: &[usize]) {
        let req = self.req;
        let pick = |pred: fn(&Record, FieldRequirement) -> bool| -> Vec<usize> {
            indices
                .iter()
                .copied()
                .filter(|&i| pred(&records[i], req))
                .collect()
        };
        let update_details = pick(needs_update_details);
        let details = pick(needs_details);
        let urgency = pick(needs_urgency);
        let history = pick(needs_history);

        let client = self.client();
        let cancel = self.cancel;

        if !update_details.is_empty() {
            let ids: Vec<String> = update_details
                .iter()
                .filter_map(|&i| records[i].default_source_id().map(str::to_string))
                .collect();
            let sink = self.sink(records, &update_details);
            self.issue(
                Stage::UpdateDetails,
                update_details,
                async move {
                    client
                        .get_update_detail(&ids, sink, cancel)
                        .await
                        .map(Payload::UpdateDetails)
                }
                .boxed(),
            );
        }

        if !details.is_empty() {
            let ids: Vec<String> = details
                .iter()
                .flat_map(|&i| records[i].source_ids.iter().cloned())
                .collect();
            let sink = self.sink(records, &details);
            self.issue(
                Stage::Details,
                details,
                async move {
                    client
                        .get_details(&ids, sink, cancel)
                        .await
                        .map(Payload::Details)
                }
                .boxed(),
            );
        }

        if !urgency.is_empty() {
            let sink = self.sink(records, &urgency);
            self.issue(
                Stage::Urgency,
                urgency,
                async move {
                    client
                        .get_updates(Filter::NONE, sink, cancel)
                        .await
                        .map(Payload::Packages)
                }
                .boxed(),
            );
        }

        if !history.is_empty() {
            let names: Vec<String> = history
                .iter()
                .filter_map(|&i| records[i].default_source().map(str::to_string))
                .collect();
            self.issue(
                Stage::History,
                history,
                async move {
                    client
                        .get_history(&names, cancel)
                        .await
                        .map(Payload::History)
                }
                .boxed(),
            );
        }
    }

    /// Resolve is done for `indices`; look up ids by file for those still
    /// missing one and hold the rest for the dependent batches.
    fn settle(&mut self, records: &[Record], indices: &[usize]) {
        for &i in indices {
            if !self.dispatch_id_lookup(records, i) {
                self.settled.push(i);
            }
        }
    }

    fn merge(&mut self, records: &mut [Record], finished: Finished) -> JobResult {
        let Finished {
            stage,
            indices,
            result,
        } = finished;
        let refiner = self.refiner;
        let namespace = refiner.namespace.as_str();
        if stage.resolves_ids() {
            self.id_pending -= 1;
        }

        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                debug!("[job {}] {stage:?} failed: {e}", self.job_id());
                match stage {
                    Stage::Resolve(_) => self.settle(records, &indices),
                    Stage::FileToId | Stage::RepoToId(_) => self.settled.extend(indices),
                    _ => {}
                }
                return Err(e);
            }
        };

        match (stage, payload) {
            (Stage::Resolve(phase), Payload::Packages(packages)) => {
                let parsed = merge::parse_packages(&packages);
                for &i in &indices {
                    merge::apply_resolve(&mut records[i], &parsed, namespace);
                }
                let (unknown, known): (Vec<usize>, Vec<usize>) = indices
                    .into_iter()
                    .partition(|&i| records[i].state == State::Unknown);
                if phase == ResolvePhase::Arch && !unknown.is_empty() {
                    self.settle(records, &known);
                    self.dispatch_resolve(records, unknown, ResolvePhase::AnyArch);
                } else {
                    self.settle(records, &known);
                    self.settle(records, &unknown);
                }
            }
            (Stage::FileToId, Payload::NoFile) => self.settled.extend(indices),
            (Stage::FileToId, Payload::FileOwner { path, packages }) => {
                let parsed = merge::parse_packages(&packages);
                for &i in &indices {
                    merge::apply_file_search(&mut records[i], &path, &parsed, namespace);
                }
                self.settled.extend(indices);
            }
            (Stage::RepoToId(_), Payload::Packages(packages)) => {
                for &i in &indices {
                    merge::apply_repo_package(&mut records[i], &packages);
                }
                self.settled.extend(indices);
            }
            (Stage::UpdateDetails, Payload::UpdateDetails(details)) => {
                let index = PackageIndex::new(&details, |d| d.package_id.as_str());
                for &i in &indices {
                    merge::apply_update_detail(&mut records[i], &index);
                }
            }
            (Stage::Details, Payload::Details(details)) => {
                let index = PackageIndex::new(&details, |d| d.package_id.as_str());
                for &i in &indices {
                    merge::apply_details(&mut records[i], &index);
                }
            }
            (Stage::Urgency, Payload::Packages(updates)) => {
                let parsed = merge::parse_packages(&updates);
                let index = PackageIndex::new(&parsed, |p| p.id.as_str());
                for &i in &indices {
                    merge::apply_urgency(&mut records[i], &index, &parsed);
                }
            }
            (Stage::History, Payload::History(lookup)) => match lookup {
                HistoryLookup::Entries(entries) => {
                    for &i in &indices {
                        let found = records[i]
                            .default_source()
                            .and_then(|name| entries.get(name))
                            .map(Vec::as_slice);
                        merge::apply_history(&mut records[i], found);
                    }
                }
                HistoryLookup::Unavailable => {
                    for &i in &indices {
                        records[i].install_date = InstallDate::Unknown;
                    }
                }
            },
            (Stage::UpgradeRemoved, Payload::Packages(packages)) => {
                let removed: Vec<Record> = merge::records_from_packages(&packages, namespace)
                    .into_iter()
                    .filter(|r| r.state == State::Unavailable)
                    .collect();
                for &i in &indices {
                    info!(
                        "[job {}] upgrade of {} would remove {} packages",
                        self.job_id(),
                        records[i].id,
                        removed.len()
                    );
                    for related in &removed {
                        records[i].add_related(related.clone());
                    }
                    records[i].add_quirk(Quirks::UPGRADE_SIMULATED);
                }
            }
            (stage, _) => {
                return Err(RefineError::Failed(format!(
                    "unexpected result for {stage:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(id: &str) -> Record {
        let mut record = Record::new(id).with_source(id);
        record.management_plugin = Some("packagekit".to_string());
        record
    }

    #[test]
    fn test_needs_resolve() {
        let req = FieldRequirement::VERSION.implied();
        let mut record = owned("gedit");
        assert!(needs_resolve(&record, req));

        record.state = State::Installed;
        record.version = Some("3.0".to_string());
        record.add_source_id("gedit;3.0;x86_64;fedora");
        assert!(!needs_resolve(&record, req));

        let mut bad = owned("x");
        bad.sources = vec!["/usr/bin/x".to_string()];
        assert!(!needs_resolve(&bad, req));
    }

    #[test]
    fn test_needs_details_only_for_missing_fields() {
        let req = FieldRequirement::LICENSE | FieldRequirement::SIZE;
        let mut record = owned("a").with_source_id("a;1;x86_64;fedora");
        assert!(needs_details(&record, req));

        record.license = Some("MIT".to_string());
        record.size_installed = common::Size::Valid(1);
        record.size_download = common::Size::Unknowable;
        assert!(!needs_details(&record, req));
    }

    #[tokio::test]
    async fn test_setup_file_prefers_appdata() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = owned("addon");
        record.kind = RecordKind::Addon;
        let req = FieldRequirement::SETUP_ACTION;
        let candidates = setup_candidates(&record, req, dir.path()).unwrap();
        assert_eq!(first_existing(&candidates).await, None);

        std::fs::create_dir_all(dir.path().join("metainfo")).unwrap();
        std::fs::write(dir.path().join("metainfo/addon.metainfo.xml"), "").unwrap();
        assert_eq!(
            first_existing(&candidates).await,
            Some(dir.path().join("metainfo/addon.metainfo.xml"))
        );

        std::fs::create_dir_all(dir.path().join("appdata")).unwrap();
        std::fs::write(dir.path().join("appdata/addon.metainfo.xml"), "").unwrap();
        assert_eq!(
            first_existing(&candidates).await,
            Some(dir.path().join("appdata/addon.metainfo.xml"))
        );

        record.kind = RecordKind::Generic;
        assert_eq!(setup_candidates(&record, req, dir.path()), None);
        record.kind = RecordKind::Desktop;
        record.add_source_id("addon;1;noarch;fedora");
        assert_eq!(setup_candidates(&record, req, dir.path()), None);
    }

    #[test]
    fn test_only_resolving_stages_hold_dependent_batches() {
        assert!(Stage::Resolve(ResolvePhase::AnyArch).resolves_ids());
        assert!(Stage::FileToId.resolves_ids());
        assert!(!Stage::Details.resolves_ids());
        assert!(!Stage::UpgradeRemoved.resolves_ids());
    }

    #[test]
    fn test_resolve_filters() {
        assert_eq!(ResolvePhase::Arch.filter(), Filter::NEWEST | Filter::ARCH);
        assert!(ResolvePhase::AnyArch.filter().contains(Filter::NOT_SOURCE));
    }
}
