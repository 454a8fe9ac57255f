#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use libpkrefine::daemon::{
    ControlHandle, Connector, DaemonProgress, DaemonProperties, DaemonResult, Details, Filter,
    HistoryEntry, Info, Package, ProgressSink, QueryHandle, Repo, RootHandle, Transaction,
    TransactionEvent, UpdateDetail,
};
use libpkrefine::{
    DaemonError, DaemonErrorCode, PackageRefiner, QueryClient, RefineConfig, SessionManager,
};
use tokio::sync::{mpsc, watch};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn pkg(id: &str, info: Info) -> Package {
    Package::new(id, info)
}

/// How the fake answers a history lookup.
#[derive(Debug, Clone)]
pub enum History {
    Entries(HashMap<String, Vec<HistoryEntry>>),
    /// Blocks the calling thread this long, then answers with nothing.
    Hang(Duration),
    Fail(DaemonErrorCode),
}

impl Default for History {
    fn default() -> Self {
        History::Entries(HashMap::new())
    }
}

/// Canned answers, keyed by method where that matters.
#[derive(Default)]
pub struct Script {
    pub resolve_arch: HashMap<String, Vec<Package>>,
    pub resolve_any: HashMap<String, Vec<Package>>,
    pub files: HashMap<String, Vec<Package>>,
    pub details: Vec<Details>,
    pub update_details: Vec<UpdateDetail>,
    pub updates: Vec<Package>,
    pub upgrade: Vec<Package>,
    pub repos: Vec<Repo>,
    pub history: History,
    pub failures: HashMap<&'static str, DaemonError>,
    pub delays: HashMap<&'static str, Duration>,
    /// Emitted through the progress sink of every query.
    pub progress: Vec<DaemonProgress>,
    /// Transactions answered with `Busy` before one is accepted.
    pub busy_replies: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: &'static str,
    pub filter: Option<Filter>,
    pub args: Vec<String>,
}

pub struct FakeDaemon {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    active: watch::Sender<usize>,
    me: Weak<FakeDaemon>,
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        let (active, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            active,
            me: me.clone(),
        })
    }

    pub fn script(&self, edit: impl FnOnce(&mut Script)) {
        edit(&mut self.script.lock().unwrap());
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(Handle(self.arc()))
    }

    pub fn calls(&self, method: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls(method).len()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_active(&self, n: usize) {
        self.active.send_replace(n);
    }

    fn arc(&self) -> Arc<FakeDaemon> {
        self.me.upgrade().unwrap()
    }

    fn record(&self, method: &'static str, filter: Option<Filter>, args: &[String]) {
        self.calls.lock().unwrap().push(Call {
            method,
            filter,
            args: args.to_vec(),
        });
    }

    /// Logs the call, reports progress, sleeps and fails as scripted.
    async fn step(
        &self,
        method: &'static str,
        filter: Option<Filter>,
        args: &[String],
        progress: Option<&ProgressSink>,
    ) -> DaemonResult<()> {
        self.record(method, filter, args);
        let (delay, failure, reports) = {
            let script = self.script.lock().unwrap();
            (
                script.delays.get(method).copied(),
                script.failures.get(method).cloned(),
                script.progress.clone(),
            )
        };
        if let Some(sink) = progress {
            for report in reports {
                sink(report);
            }
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn transaction(&self, method: &'static str, args: &[String]) -> DaemonResult<Transaction> {
        self.step(method, None, args, None).await?;
        let busy = {
            let mut script = self.script.lock().unwrap();
            if script.busy_replies > 0 {
                script.busy_replies -= 1;
                true
            } else {
                false
            }
        };
        if busy {
            // someone else holds the slot for a moment
            self.active.send_replace(1);
            let daemon = self.arc();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                daemon.active.send_replace(0);
            });
            return Err(DaemonError::busy());
        }

        let (tx, rx) = mpsc::channel(4);
        tx.send(TransactionEvent::Progress {
            percentage: 50,
            status: libpkrefine::daemon::DaemonStatus::Install,
            package_id: args.first().cloned(),
        })
        .await
        .unwrap();
        tx.send(TransactionEvent::Finished(Ok(()))).await.unwrap();
        Ok(Transaction { events: rx })
    }
}

struct Handle(Arc<FakeDaemon>);

#[async_trait]
impl Connector for Handle {
    async fn connect(&self) -> DaemonResult<Arc<dyn RootHandle>> {
        self.0.step("connect", None, &[], None).await?;
        Ok(Arc::new(Handle(self.0.clone())))
    }
}

#[async_trait]
impl RootHandle for Handle {
    async fn register(&self) -> DaemonResult<DaemonProperties> {
        self.0.step("register", None, &[], None).await?;
        Ok(DaemonProperties {
            version: "1.2.8".to_string(),
            backend_name: "fake".to_string(),
            distro_id: "fedora;40;x86_64".to_string(),
        })
    }

    async fn unregister(&self) -> DaemonResult<()> {
        self.0.step("unregister", None, &[], None).await
    }

    async fn open_query(&self, _props: &DaemonProperties) -> DaemonResult<Arc<dyn QueryHandle>> {
        self.0.step("open_query", None, &[], None).await?;
        Ok(Arc::new(Handle(self.0.clone())))
    }

    async fn open_control(
        &self,
        _props: &DaemonProperties,
    ) -> DaemonResult<Arc<dyn ControlHandle>> {
        self.0.step("open_control", None, &[], None).await?;
        Ok(Arc::new(Handle(self.0.clone())))
    }
}

#[async_trait]
impl QueryHandle for Handle {
    async fn resolve(
        &self,
        filter: Filter,
        names: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>> {
        self.0
            .step("resolve", Some(filter), names, Some(&progress))
            .await?;
        let script = self.0.script.lock().unwrap();
        let table = if filter.contains(Filter::ARCH) {
            &script.resolve_arch
        } else {
            &script.resolve_any
        };
        Ok(names
            .iter()
            .filter_map(|n| table.get(n))
            .flatten()
            .cloned()
            .collect())
    }

    async fn search_files(
        &self,
        filter: Filter,
        paths: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>> {
        self.0
            .step("search_files", Some(filter), paths, Some(&progress))
            .await?;
        let script = self.0.script.lock().unwrap();
        Ok(paths
            .iter()
            .filter_map(|p| script.files.get(p))
            .flatten()
            .cloned()
            .collect())
    }

    async fn get_details(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Details>> {
        self.0
            .step("get_details", None, package_ids, Some(&progress))
            .await?;
        Ok(self.0.script.lock().unwrap().details.clone())
    }

    async fn get_update_detail(
        &self,
        package_ids: &[String],
        progress: ProgressSink,
    ) -> DaemonResult<Vec<UpdateDetail>> {
        self.0
            .step("get_update_detail", None, package_ids, Some(&progress))
            .await?;
        Ok(self.0.script.lock().unwrap().update_details.clone())
    }

    async fn get_updates(
        &self,
        filter: Filter,
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>> {
        self.0
            .step("get_updates", Some(filter), &[], Some(&progress))
            .await?;
        Ok(self.0.script.lock().unwrap().updates.clone())
    }

    async fn get_repo_list(&self, filter: Filter, progress: ProgressSink) -> DaemonResult<Vec<Repo>> {
        self.0
            .step("get_repo_list", Some(filter), &[], Some(&progress))
            .await?;
        Ok(self.0.script.lock().unwrap().repos.clone())
    }

    async fn simulate_upgrade(
        &self,
        version: &str,
        _cache_age: Duration,
        progress: ProgressSink,
    ) -> DaemonResult<Vec<Package>> {
        self.0
            .step(
                "simulate_upgrade",
                None,
                &[version.to_string()],
                Some(&progress),
            )
            .await?;
        Ok(self.0.script.lock().unwrap().upgrade.clone())
    }

    async fn install_packages(&self, package_ids: &[String]) -> DaemonResult<Transaction> {
        self.0.transaction("install_packages", package_ids).await
    }

    async fn remove_packages(
        &self,
        package_ids: &[String],
        _autoremove: bool,
    ) -> DaemonResult<Transaction> {
        self.0.transaction("remove_packages", package_ids).await
    }

    async fn upgrade_system(&self, version: &str) -> DaemonResult<Transaction> {
        self.0
            .transaction("upgrade_system", &[version.to_string()])
            .await
    }

    async fn enable_repo(&self, repo_id: &str, _enabled: bool) -> DaemonResult<Transaction> {
        self.0.transaction("enable_repo", &[repo_id.to_string()]).await
    }
}

impl ControlHandle for Handle {
    fn active_transactions(&self) -> watch::Receiver<usize> {
        self.0.active.subscribe()
    }

    fn package_history(
        &self,
        names: &[String],
        _timeout: Duration,
    ) -> DaemonResult<HashMap<String, Vec<HistoryEntry>>> {
        self.0.record("package_history", None, names);
        let history = self.0.script.lock().unwrap().history.clone();
        match history {
            History::Entries(entries) => Ok(entries),
            History::Hang(delay) => {
                std::thread::sleep(delay);
                Ok(HashMap::new())
            }
            History::Fail(code) => Err(DaemonError::new(code, "history lookup failed")),
        }
    }
}

pub fn config() -> RefineConfig {
    RefineConfig {
        history_timeout_secs: 1,
        ..Default::default()
    }
}

pub fn refiner(daemon: &FakeDaemon, config: &RefineConfig) -> PackageRefiner {
    let sessions = SessionManager::new(daemon.connector(), config.idle_timeout());
    PackageRefiner::new(QueryClient::new(sessions, config), config)
}
