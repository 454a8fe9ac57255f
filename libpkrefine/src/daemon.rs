//! Transport boundary to the privileged package daemon.
//!
//! The wire encoding is opaque here: implementors adapt whatever RPC
//! mechanism they use to these traits. Handles are created as a cluster by
//! [`crate::session::SessionManager`] and shared behind `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::DaemonError;

pub type DaemonResult<T> = Result<T, DaemonError>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Filter: u32 {
        const NONE = 0;
        const INSTALLED = 1;
        const NEWEST = 1 << 1;
        const ARCH = 1 << 2;
        const NOT_ARCH = 1 << 3;
        const NOT_SOURCE = 1 << 4;
    }
}

/// Per-package classification reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Info {
    Installed,
    Available,
    Unavailable,
    Installing,
    Updating,
    Removing,
    Downgrading,
    Obsoleting,
    Untrusted,
    // update severities
    Normal,
    Low,
    Enhancement,
    Bugfix,
    Important,
    Security,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub info: Info,
    pub summary: String,
}

impl Package {
    pub fn new(id: impl Into<String>, info: Info) -> Self {
        Self {
            id: id.into(),
            info,
            summary: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    pub package_id: String,
    pub license: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDetail {
    pub package_id: String,
    pub update_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub info: Info,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Properties the daemon reports once a client has registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonProperties {
    pub version: String,
    pub backend_name: String,
    pub distro_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonStatus {
    Unknown,
    Setup,
    Cancel,
    Finished,
    Wait,
    WaitingForLock,
    WaitingForAuth,
    LoadingCache,
    TestCommit,
    Running,
    SigCheck,
    RefreshCache,
    Download,
    DownloadRepository,
    DownloadPackagelist,
    DownloadFilelist,
    DownloadChangelog,
    DownloadGroup,
    DownloadUpdateinfo,
    Install,
    Update,
    Cleanup,
    Remove,
    Request,
    Query,
    Info,
    DepResolve,
    Commit,
    Obsolete,
    Repackaging,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonProgress {
    /// Out-of-range values mean the daemon does not know.
    pub percentage: i32,
    pub status: DaemonStatus,
    pub package_id: Option<String>,
}

pub type ProgressSink = Arc<dyn Fn(DaemonProgress) + Send + Sync>;

#[derive(Debug)]
pub enum TransactionEvent {
    Progress {
        percentage: i32,
        status: DaemonStatus,
        package_id: Option<String>,
    },
    Finished(DaemonResult<()>),
}

/// A running exclusive transaction; events end with exactly one `Finished`.
pub struct Transaction {
    pub events: mpsc::Receiver<TransactionEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Slow handshake producing the root handle.
    async fn connect(&self) -> DaemonResult<Arc<dyn RootHandle>>;
}

#[async_trait]
pub trait RootHandle: Send + Sync {
    /// Keeps the daemon from exiting while this client is around.
    async fn register(&self) -> DaemonResult<DaemonProperties>;

    async fn unregister(&self) -> DaemonResult<()>;

    async fn open_query(&self, props: &DaemonProperties) -> DaemonResult<Arc<dyn QueryHandle>>;

    async fn open_control(&self, props: &DaemonProperties)
    -> DaemonResult<Arc<dyn ControlHandle>>;
}

#[async_trait]
pub trait QueryHandle: Send + Sync {
    async fn resolve(
        &self,
        filter: Filter,
        names: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>>;

    async fn search_files(
        &self,
        filter: Filter,
        paths: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>>;

    async fn get_details(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Details>>;

    async fn get_update_detail(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<UpdateDetail>>;

    async fn get_updates(&self, filter: Filter, progress: ProgressSink)
    -> DaemonResult<Vec<Package>>;

    async fn get_repo_list(&self, filter: Filter, progress: ProgressSink)
    -> DaemonResult<Vec<Repo>>;

    async fn simulate_upgrade(
        &self,
        version: &str,
        cache_age: Duration,
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>>;

    async fn install_packages(&self, package_ids: &[String]) -> DaemonResult<Transaction>;

    async fn remove_packages(
        &self,
        package_ids: &[String],
        autoremove: bool,
    ) -> DaemonResult<Transaction>;

    async fn upgrade_system(&self, version: &str) -> DaemonResult<Transaction>;

    async fn enable_repo(&self, repo_id: &str, enabled: bool) -> DaemonResult<Transaction>;
}

pub trait ControlHandle: Send + Sync {
    /// Number of exclusive transactions currently running.
    fn active_transactions(&self) -> watch::Receiver<usize>;

    /// Blocking; the daemon offers no async form of this call.
    fn package_history(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> DaemonResult<HashMap<String, Vec<HistoryEntry>>>;
}
