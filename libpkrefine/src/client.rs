use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::config::RefineConfig;
use crate::daemon::{
    DaemonProgress, DaemonResult, Details, Filter, HistoryEntry, Package, ProgressSink,
    QueryHandle, Repo, Transaction, TransactionEvent, UpdateDetail,
};
use crate::error::{DaemonError, DaemonErrorCode, RefineError, translate};
use crate::pool::WorkerPool;
use crate::session::{Session, SessionManager};
use crate::transaction::run_exclusive;

/// Outcome of a history lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryLookup {
    Entries(HashMap<String, Vec<HistoryEntry>>),
    /// The daemon timed out or is too old to keep history.
    Unavailable,
}

/// Typed async adapter over the daemon.
///
/// Every daemon error is translated here, once, into a [`RefineError`]
/// prefixed with the operation that failed.
pub struct QueryClient {
    sessions: Arc<SessionManager>,
    pool: WorkerPool,
    history_timeout: Duration,
    upgrade_cache_age: Duration,
}

impl QueryClient {
    pub fn new(sessions: Arc<SessionManager>, config: &RefineConfig) -> Self {
        Self {
            sessions,
            pool: WorkerPool::new(config.worker_threads),
            history_timeout: config.history_timeout(),
            upgrade_cache_age: config.upgrade_cache_age(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    async fn session(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>, RefineError> {
        if cancel.is_cancelled() {
            return Err(RefineError::cancelled().prefixed(context));
        }
        if let Some(session) = self.sessions.try_current() {
            return Ok(session);
        }
        // the build carries on for later callers if this one is cancelled
        let sessions = self.sessions.clone();
        let build = tokio::spawn(async move { sessions.acquire().await });
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancelled while connecting: {context}");
                Err(RefineError::cancelled().prefixed(context))
            }
            joined = build => match joined {
                Ok(acquired) => acquired.map_err(|e| translate(e, context)),
                Err(e) => Err(RefineError::Failed(format!("{context}: {e}"))),
            },
        }
    }

    async fn call<T, F, Fut>(
        &self,
        context: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RefineError>
    where
        F: FnOnce(Arc<dyn QueryHandle>) -> Fut,
        Fut: Future<Output = DaemonResult<T>>,
    {
        let session = self.session(context, cancel).await?;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RefineError::cancelled().prefixed(context));
            }
            result = op(session.query.clone()) => result,
        };
        self.sessions.touch();
        result.map_err(|e| translate(e, context))
    }

    pub async fn resolve(
        &self,
        filter: Filter,
        names: &[String],
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Package>, RefineError> {
        debug!("resolving {} names with {filter:?}", names.len());
        self.call("failed to resolve package_ids", cancel, |q| async move {
            q.resolve(filter, names, progress).await
        })
        .await
    }

    pub async fn search_files(
        &self,
        filter: Filter,
        paths: &[String],
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Package>, RefineError> {
        let context = format!("failed to search files {}", paths.join(","));
        self.call(&context, cancel, |q| async move {
            q.search_files(filter, paths, progress).await
        })
        .await
    }

    pub async fn get_details(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Details>, RefineError> {
        let context = format!("failed to get details for {}", package_ids.join(","));
        self.call(&context, cancel, |q| async move {
            q.get_details(package_ids, progress).await
        })
        .await
    }

    pub async fn get_update_detail(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<UpdateDetail>, RefineError> {
        let first = package_ids.first().map(String::as_str).unwrap_or_default();
        let context = format!("failed to get update details for {first}");
        self.call(&context, cancel, |q| async move {
            q.get_update_detail(package_ids, progress).await
        })
        .await
    }

    pub async fn get_updates(
        &self,
        filter: Filter,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Package>, RefineError> {
        self.call("failed to get updates for urgency", cancel, |q| async move {
            q.get_updates(filter, progress).await
        })
        .await
    }

    pub async fn get_repo_list(
        &self,
        filter: Filter,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Repo>, RefineError> {
        self.call("failed to get repo list", cancel, |q| async move {
            q.get_repo_list(filter, progress).await
        })
        .await
    }

    /// Simulates a full system upgrade to `version`.
    pub async fn simulate_upgrade(
        &self,
        version: &str,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Package>, RefineError> {
        let cache_age = self.upgrade_cache_age;
        self.call("failed to refine distro upgrade", cancel, |q| async move {
            q.simulate_upgrade(version, cache_age, progress).await
        })
        .await
    }

    /// Looks up install history on the worker pool, bounded by the history
    /// timeout. A timeout or a daemon without history support degrades to
    /// [`HistoryLookup::Unavailable`].
    pub async fn get_history(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<HistoryLookup, RefineError> {
        let context = "failed to get history";
        let session = self.session(context, cancel).await?;
        let control = session.control.clone();
        let owned = names.to_vec();
        let timeout = self.history_timeout;
        debug!("getting history for {} packages", names.len());

        let job = self
            .pool
            .run(move || control.package_history(&owned, timeout));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RefineError::cancelled().prefixed(context));
            }
            outcome = tokio::time::timeout(timeout, job) => outcome,
        };
        self.sessions.touch();

        match outcome {
            Err(_) => {
                warn!("no history as the daemon took longer than {timeout:?}");
                Ok(HistoryLookup::Unavailable)
            }
            Ok(Err(e)) => Err(e.prefixed(context)),
            Ok(Ok(Ok(entries))) => Ok(HistoryLookup::Entries(entries)),
            Ok(Ok(Err(e)))
                if matches!(
                    e.code,
                    DaemonErrorCode::TimedOut | DaemonErrorCode::UnknownMethod
                ) =>
            {
                warn!("no history available: {e}");
                Ok(HistoryLookup::Unavailable)
            }
            Ok(Ok(Err(e))) => Err(translate(e, context)),
        }
    }

    pub async fn install_packages(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        self.transact("failed to install packages", progress, cancel, |q| async move {
            q.install_packages(package_ids).await
        })
        .await
    }

    pub async fn remove_packages(
        &self,
        package_ids: &[String],
        autoremove: bool,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        self.transact("failed to remove packages", progress, cancel, |q| async move {
            q.remove_packages(package_ids, autoremove).await
        })
        .await
    }

    pub async fn upgrade_system(
        &self,
        version: &str,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        self.transact("failed to upgrade system", progress, cancel, |q| async move {
            q.upgrade_system(version).await
        })
        .await
    }

    pub async fn enable_repo(
        &self,
        repo_id: &str,
        enabled: bool,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        let context = if enabled {
            "failed to enable repo"
        } else {
            "failed to disable repo"
        };
        self.transact(context, progress, cancel, |q| async move {
            q.enable_repo(repo_id, enabled).await
        })
        .await
    }

    /// Runs a transactional call through the exclusive-slot retry loop.
    async fn transact<F, Fut>(
        &self,
        context: &str,
        progress: ProgressSink,
        cancel: &CancellationToken,
        start: F,
    ) -> Result<(), RefineError>
    where
        F: Fn(Arc<dyn QueryHandle>) -> Fut,
        Fut: Future<Output = DaemonResult<Transaction>>,
    {
        let session = self.session(context, cancel).await?;
        let result = run_exclusive(session.control.as_ref(), cancel, || {
            let started = start(session.query.clone());
            let progress = progress.clone();
            async move {
                let transaction = started.await?;
                follow(transaction, &progress).await
            }
        })
        .await;
        self.sessions.touch();
        result.map_err(|e| translate(e, context))
    }
}

/// Forwards progress until the transaction reports its outcome.
async fn follow(mut transaction: Transaction, progress: &ProgressSink) -> DaemonResult<()> {
    while let Some(event) = transaction.events.recv().await {
        match event {
            TransactionEvent::Progress {
                percentage,
                status,
                package_id,
            } => progress(DaemonProgress {
                percentage,
                status,
                package_id,
            }),
            TransactionEvent::Finished(result) => return result,
        }
    }
    Err(DaemonError::new(
        DaemonErrorCode::Failed,
        "transaction ended without a result",
    ))
}
