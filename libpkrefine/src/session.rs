use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::daemon::{
    ControlHandle, Connector, DaemonProperties, DaemonResult, QueryHandle, RootHandle,
};

/// Handles that are created together and invalidated together.
pub struct Session {
    pub root: Arc<dyn RootHandle>,
    pub query: Arc<dyn QueryHandle>,
    pub control: Arc<dyn ControlHandle>,
    pub properties: DaemonProperties,
}

/// Owns the lazily built [`Session`] cluster.
///
/// Steady-state [`acquire`](Self::acquire) calls are lock-free; the
/// `lifecycle` lock is only taken to build or tear the cluster down. An idle
/// timer task, holding only a weak reference, tears the cluster down once no
/// activity has been seen for `idle_timeout`.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    current: ArcSwapOption<Session>,
    lifecycle: Mutex<()>,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last use.
    last_activity: AtomicU64,
    /// Bumped on every publish and teardown so stale timers exit.
    generation: AtomicU64,
    me: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            connector,
            idle_timeout,
            current: ArcSwapOption::empty(),
            lifecycle: Mutex::new(()),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.current.load().is_some()
    }

    /// Returns the live cluster without building one.
    pub fn try_current(&self) -> Option<Arc<Session>> {
        let session = self.current.load_full()?;
        self.touch();
        Some(session)
    }

    /// Returns the live cluster, building it first if there is none.
    pub async fn acquire(&self) -> DaemonResult<Arc<Session>> {
        if let Some(session) = self.try_current() {
            return Ok(session);
        }

        let _guard = self.lifecycle.lock().await;
        // another caller may have finished building while we waited
        if let Some(session) = self.current.load_full() {
            self.touch();
            return Ok(session);
        }

        let session = Arc::new(self.build().await?);
        self.touch();
        self.current.store(Some(session.clone()));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_idle_timer(generation);
        info!(
            "connected to package daemon {} (backend {})",
            session.properties.version, session.properties.backend_name
        );
        Ok(session)
    }

    /// Marks the cluster as in use, pushing back idle teardown.
    pub fn touch(&self) {
        let nanos = self.epoch.elapsed().as_nanos() as u64;
        self.last_activity.fetch_max(nanos, Ordering::SeqCst);
    }

    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.invalidate();
    }

    async fn build(&self) -> DaemonResult<Session> {
        let root = self.connector.connect().await?;
        let properties = root.register().await?;

        let dependents = async {
            let query = root.open_query(&properties).await?;
            let control = root.open_control(&properties).await?;
            Ok::<_, crate::error::DaemonError>((query, control))
        }
        .await;

        match dependents {
            Ok((query, control)) => Ok(Session {
                root,
                query,
                control,
                properties,
            }),
            Err(e) => {
                warn!("failed to open dependent daemon handles: {e}");
                Self::send_unregister(root);
                Err(e)
            }
        }
    }

    /// Drops the cluster. Caller holds the lifecycle lock.
    fn invalidate(&self) {
        if let Some(session) = self.current.swap(None) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            debug!("invalidating daemon session");
            Self::send_unregister(session.root.clone());
        }
    }

    fn send_unregister(root: Arc<dyn RootHandle>) {
        tokio::spawn(async move {
            if let Err(e) = root.unregister().await {
                warn!("failed to unregister from package daemon: {e}");
            }
        });
    }

    fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_activity.load(Ordering::SeqCst))
    }

    fn spawn_idle_timer(&self, generation: u64) {
        let weak = self.me.clone();
        let timeout = self.idle_timeout;
        tokio::spawn(async move {
            loop {
                let deadline = match weak.upgrade() {
                    Some(manager) => manager.last_activity() + timeout,
                    None => return,
                };
                tokio::time::sleep_until(deadline).await;

                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let _guard = manager.lifecycle.lock().await;
                if manager.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if manager.last_activity().elapsed() >= timeout {
                    info!("daemon session idle for {timeout:?}, tearing down");
                    manager.invalidate();
                    return;
                }
            }
        });
    }
}

/// Hands out one shared [`SessionManager`] while any caller holds it, and
/// builds a fresh one otherwise.
pub struct SessionFactory {
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    live: Mutex<Weak<SessionManager>>,
}

impl SessionFactory {
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Self {
        Self {
            connector,
            idle_timeout,
            live: Mutex::new(Weak::new()),
        }
    }

    pub async fn get(&self) -> Arc<SessionManager> {
        let mut live = self.live.lock().await;
        if let Some(manager) = live.upgrade() {
            return manager;
        }
        let manager = SessionManager::new(self.connector.clone(), self.idle_timeout);
        *live = Arc::downgrade(&manager);
        manager
    }
}
