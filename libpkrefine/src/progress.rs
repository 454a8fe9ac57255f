use std::collections::HashMap;
use std::sync::Arc;

use crate::daemon::{DaemonProgress, DaemonStatus, ProgressSink};

/// Caller-facing activity reported while a refine is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginStatus {
    Unknown,
    Waiting,
    Setup,
    Downloading,
    Installing,
    Removing,
    Querying,
}

impl From<DaemonStatus> for PluginStatus {
    fn from(status: DaemonStatus) -> Self {
        use DaemonStatus::*;
        match status {
            Wait | WaitingForLock | WaitingForAuth => PluginStatus::Waiting,
            LoadingCache | TestCommit | Running | SigCheck | RefreshCache => PluginStatus::Setup,
            Download | DownloadRepository | DownloadPackagelist | DownloadFilelist
            | DownloadChangelog | DownloadGroup | DownloadUpdateinfo => PluginStatus::Downloading,
            Install | Update => PluginStatus::Installing,
            Cleanup | Remove => PluginStatus::Removing,
            Request | Query | Info | DepResolve => PluginStatus::Querying,
            Setup | Cancel | Finished | Unknown => PluginStatus::Unknown,
            other => {
                log::debug!("no status mapping for {other:?}");
                PluginStatus::Unknown
            }
        }
    }
}

/// One progress notification delivered to the refine caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Record the daemon was working on, when it said so.
    pub record_id: Option<String>,
    pub status: Option<PluginStatus>,
    pub percentage: Option<u32>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Builds the daemon-side sink for one batch.
///
/// `ids` maps package ids of the batch back to record ids. Unknown statuses
/// are suppressed; percentages outside 0..=100 are dropped.
pub(crate) fn batch_sink(
    callback: Option<ProgressCallback>,
    ids: HashMap<String, String>,
) -> ProgressSink {
    Arc::new(move |progress: DaemonProgress| {
        let Some(callback) = callback.as_ref() else {
            return;
        };
        let status = match PluginStatus::from(progress.status) {
            PluginStatus::Unknown => None,
            status => Some(status),
        };
        let percentage = u32::try_from(progress.percentage)
            .ok()
            .filter(|p| *p <= 100);
        if status.is_none() && percentage.is_none() {
            return;
        }
        let record_id = progress
            .package_id
            .as_ref()
            .and_then(|id| ids.get(id))
            .cloned();
        callback(ProgressUpdate {
            record_id,
            status,
            percentage,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            PluginStatus::from(DaemonStatus::WaitingForLock),
            PluginStatus::Waiting
        );
        assert_eq!(
            PluginStatus::from(DaemonStatus::DownloadUpdateinfo),
            PluginStatus::Downloading
        );
        assert_eq!(
            PluginStatus::from(DaemonStatus::Update),
            PluginStatus::Installing
        );
        assert_eq!(
            PluginStatus::from(DaemonStatus::DepResolve),
            PluginStatus::Querying
        );
        assert_eq!(PluginStatus::from(DaemonStatus::Setup), PluginStatus::Unknown);
        assert_eq!(
            PluginStatus::from(DaemonStatus::Repackaging),
            PluginStatus::Unknown
        );
    }

    #[test]
    fn test_sink_maps_package_to_record_and_filters_percent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: ProgressCallback = Arc::new(move |u| seen_cb.lock().unwrap().push(u));
        let ids = HashMap::from([("foo;1;x86_64;fedora".to_string(), "app-foo".to_string())]);
        let sink = batch_sink(Some(callback), ids);

        sink(DaemonProgress {
            percentage: 42,
            status: DaemonStatus::Query,
            package_id: Some("foo;1;x86_64;fedora".to_string()),
        });
        sink(DaemonProgress {
            percentage: 101,
            status: DaemonStatus::Finished,
            package_id: None,
        });
        sink(DaemonProgress {
            percentage: -1,
            status: DaemonStatus::Download,
            package_id: Some("bar;1;x86_64;fedora".to_string()),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].record_id.as_deref(), Some("app-foo"));
        assert_eq!(seen[0].percentage, Some(42));
        assert_eq!(seen[0].status, Some(PluginStatus::Querying));
        assert_eq!(seen[1].record_id, None);
        assert_eq!(seen[1].percentage, None);
        assert_eq!(seen[1].status, Some(PluginStatus::Downloading));
    }
}
