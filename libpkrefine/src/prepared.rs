use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use common::{FieldRequirement, Record, Size};
use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use crate::error::RefineError;
use crate::pipeline::{Refiner, Rule};
use crate::progress::ProgressCallback;

const UPDATE_GROUP: &str = "update";
const PREPARED_IDS_KEY: &str = "prepared_ids";

/// Cached id set. Every clear bumps the generation so a read that raced
/// with a clear is not published.
#[derive(Default)]
struct IdCache {
    ids: ArcSwapOption<HashSet<String>>,
    generation: AtomicU64,
}

impl IdCache {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn load(&self) -> Option<Arc<HashSet<String>>> {
        self.ids.load_full()
    }

    fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.ids.store(None);
    }

    /// Stores `ids` read during generation `seen`, unless a clear happened
    /// since.
    fn publish(&self, seen: u64, ids: Arc<HashSet<String>>) {
        let ours = Some(ids);
        self.ids.store(ours.clone());
        if self.generation() != seen {
            debug!("prepared updates changed while reading, not caching");
            self.ids.compare_and_swap(&ours, None);
        }
    }
}

/// Package ids the offline updater has already downloaded.
///
/// The set is read on demand and cached until a file watcher reports a
/// change to the file. Without a watcher every lookup re-reads the file.
pub struct PreparedUpdates {
    path: PathBuf,
    cache: Arc<IdCache>,
    watcher: Option<RecommendedWatcher>,
}

impl PreparedUpdates {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = Arc::new(IdCache::default());
        let watcher = match setup_watcher(&path, cache.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("not watching {}: {e}", path.display());
                None
            }
        };
        Self {
            path,
            cache,
            watcher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn prepared_ids(&self) -> Result<Arc<HashSet<String>>, RefineError> {
        if self.watcher.is_some() {
            if let Some(ids) = self.cache.load() {
                return Ok(ids);
            }
        }
        let seen = self.cache.generation();
        let ids = Arc::new(read_prepared_ids(&self.path).await?);
        self.cache.publish(seen, ids.clone());
        Ok(ids)
    }

    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

fn setup_watcher(path: &Path, cache: Arc<IdCache>) -> notify::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours {
                    debug!("prepared updates changed: {:?}", event.kind);
                    cache.clear();
                }
            }
            Err(e) => {
                warn!("prepared update watch error: {e:?}");
                cache.clear();
            }
        })?;
    // the file itself may not exist yet
    let dir = path.parent().unwrap_or(path);
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

async fn read_prepared_ids(path: &Path) -> Result<HashSet<String>, RefineError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => {
            return Err(RefineError::Failed(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    parse_prepared_ids(&content).ok_or_else(|| {
        RefineError::InvalidFormat(format!(
            "failed to get prepared IDs: no {PREPARED_IDS_KEY} in [{UPDATE_GROUP}] of {}",
            path.display()
        ))
    })
}

/// Reads `prepared_ids` from the `[update]` group of a keyfile.
fn parse_prepared_ids(content: &str) -> Option<HashSet<String>> {
    let mut in_group = false;
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(group) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_group = group == UPDATE_GROUP;
            continue;
        }
        if !in_group {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == PREPARED_IDS_KEY {
            return Some(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
    }
    None
}

/// Zeroes the download size of records whose package is already prepared.
pub struct PreparedUpdateRefiner {
    prepared: PreparedUpdates,
    namespace: String,
}

impl PreparedUpdateRefiner {
    pub const NAME: &'static str = "systemd-updates";

    pub fn new(prepared: PreparedUpdates, namespace: impl Into<String>) -> Self {
        Self {
            prepared,
            namespace: namespace.into(),
        }
    }

    fn refine_one(&self, record: &mut Record, ids: &HashSet<String>) {
        if record.management_plugin.as_deref() != Some(self.namespace.as_str()) {
            return;
        }
        let prepared = record
            .default_source_id()
            .is_some_and(|id| ids.contains(id));
        if prepared {
            record.size_download = Size::Valid(0);
        }
    }
}

#[async_trait]
impl Refiner for PreparedUpdateRefiner {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn rules(&self) -> Vec<Rule> {
        vec![Rule::RunAfter(crate::refine::PackageRefiner::NAME.to_string())]
    }

    async fn refine(
        &self,
        records: &mut [Record],
        req: FieldRequirement,
        _progress: Option<ProgressCallback>,
        _cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        if !req.contains(FieldRequirement::SIZE) {
            return Ok(());
        }
        let ids = self.prepared.prepared_ids().await?;
        if ids.is_empty() {
            return Ok(());
        }
        for record in records.iter_mut() {
            self.refine_one(record, &ids);
            for related in record.related.iter_mut() {
                self.refine_one(related, &ids);
            }
        }
        Ok(())
    }
}
