//! Worker lifecycle: state machine, registration slots, and the host that
//! drives install before activate and routes fetches through the active
//! version.
//!
//! A failed install marks the new version redundant and leaves the
//! previously active version serving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kidaily_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::cache::CacheStorage;
use crate::proxy::{CacheProxy, FetchServed, ProxyConfig};
use crate::SwError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Initial state.
    Parsed,
    /// Installing (precache in progress).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (purging stale generations).
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Replaced or install failed.
    Redundant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

/// One versioned worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: WorkerId,

    /// Version tag (equals the cache generation name).
    pub version: String,

    /// Current state.
    pub state: WorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new worker for a version tag.
    pub fn new(version: &str) -> Self {
        Self {
            id: WorkerId::new(),
            version: version.to_string(),
            state: WorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == WorkerState::Redundant
    }
}

/// Registration slots: installing / waiting / active.
#[derive(Debug, Default)]
pub struct Registration {
    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl Registration {
    /// Create an empty registration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a new worker in the installing slot.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) {
        worker.set_state(WorkerState::Installing);
        self.installing = Some(worker);
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(WorkerState::Installed);
            self.waiting = Some(worker);
        }
    }

    /// Install failed: the new version becomes redundant, the active worker
    /// is untouched.
    pub fn install_failed(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(WorkerState::Redundant);
        }
    }

    /// Mark the waiting worker as activating.
    pub fn begin_activate(&mut self) -> bool {
        match self.waiting.as_mut() {
            Some(worker) => {
                worker.set_state(WorkerState::Activating);
                true
            }
            None => false,
        }
    }

    /// Promote waiting to active; the old active worker becomes redundant.
    pub fn activate(&mut self) {
        if let Some(mut worker) = self.waiting.take() {
            if let Some(mut old) = self.active.take() {
                old.set_state(WorkerState::Redundant);
            }

            worker.set_state(WorkerState::Activated);
            self.active = Some(worker);
        }
    }

    /// Mark every worker redundant.
    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(WorkerState::Redundant);
            }
        }
    }
}

/// Lifecycle events.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A new version began installing.
    UpdateFound { version: String },
    /// A worker changed state.
    StateChange { version: String, state: WorkerState },
}

struct HostState {
    registration: Registration,
    waiting_proxy: Option<CacheProxy>,
    active_proxy: Option<CacheProxy>,
}

/// Drives worker versions through install and activate, and routes fetches
/// through the active version's proxy.
pub struct WorkerHost {
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<HostState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHost {
    /// Create a host over a shared cache store and fetcher.
    pub fn new(
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                caches,
                fetcher,
                state: RwLock::new(HostState {
                    registration: Registration::new(),
                    waiting_proxy: None,
                    active_proxy: None,
                }),
                event_tx,
            },
            event_rx,
        )
    }

    /// Install a new version: precache its manifest, then park it in the
    /// waiting slot. On failure the version is redundant and the previously
    /// active version keeps serving.
    pub async fn install_version(&self, config: ProxyConfig) -> Result<(), SwError> {
        let version = config.cache_name.clone();
        let proxy = CacheProxy::new(config, Arc::clone(&self.caches), Arc::clone(&self.fetcher))?;

        {
            let mut state = self.state.write().await;
            state.registration.begin_install(ServiceWorker::new(&version));
            state.waiting_proxy = None;
        }
        let _ = self.event_tx.send(WorkerEvent::UpdateFound {
            version: version.clone(),
        });
        self.send_state(&version, WorkerState::Installing);

        match proxy.install().await {
            Ok(()) => {
                let mut state = self.state.write().await;
                state.registration.install_complete();
                state.waiting_proxy = Some(proxy);
                drop(state);

                self.send_state(&version, WorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                warn!(version = %version, error = %e, "Install failed, version is redundant");
                let mut state = self.state.write().await;
                state.registration.install_failed();
                drop(state);

                self.send_state(&version, WorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Activate the waiting version: purge stale generations, promote it,
    /// and retire the previous active version.
    ///
    /// Returns the purged generation names.
    pub async fn activate_waiting(&self) -> Result<Vec<String>, SwError> {
        let (proxy, version) = {
            let mut state = self.state.write().await;
            let proxy = state
                .waiting_proxy
                .take()
                .ok_or_else(|| SwError::State("no waiting worker to activate".to_string()))?;
            let version = proxy.config().cache_name.clone();
            state.registration.begin_activate();
            (proxy, version)
        };
        self.send_state(&version, WorkerState::Activating);

        let purged = proxy.activate().await?;

        {
            let mut state = self.state.write().await;
            state.registration.activate();
            state.active_proxy = Some(proxy);
        }
        self.send_state(&version, WorkerState::Activated);

        info!(version = %version, purged = purged.len(), "Worker activated");
        Ok(purged)
    }

    /// Route a fetch through the active version, or straight to the network
    /// when no version controls the page yet.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchServed, SwError> {
        let proxy = self.state.read().await.active_proxy.clone();

        match proxy {
            Some(proxy) => proxy.handle_fetch(request).await,
            None => {
                let response = self.fetcher.fetch(request).await?;
                Ok(FetchServed::from_network(&response))
            }
        }
    }

    /// Version tag of the active worker, if any.
    pub async fn active_version(&self) -> Option<String> {
        let state = self.state.read().await;
        state
            .registration
            .active
            .as_ref()
            .map(|w| w.version.clone())
    }

    /// Version tag of the waiting worker, if any.
    pub async fn waiting_version(&self) -> Option<String> {
        let state = self.state.read().await;
        state
            .registration
            .waiting
            .as_ref()
            .map(|w| w.version.clone())
    }

    /// Retire every version. Subsequent fetches go straight to the network.
    pub async fn unregister(&self) {
        let mut state = self.state.write().await;
        state.registration.unregister();
        state.waiting_proxy = None;
        state.active_proxy = None;
    }

    fn send_state(&self, version: &str, state: WorkerState) {
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            version: version.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::PrecacheManifest;
    use crate::testutil::MockFetcher;

    const ORIGIN: &str = "https://app.kidaily.example";

    fn shell_fetcher() -> MockFetcher {
        MockFetcher::new()
            .respond(&format!("{ORIGIN}/"), 200, b"<!doctype html>")
            .respond(&format!("{ORIGIN}/static/js/bundle.js"), 200, b"bundle")
            .respond(&format!("{ORIGIN}/static/css/main.css"), 200, b"main css")
            .respond(&format!("{ORIGIN}/manifest.json"), 200, b"{}")
            .respond(&format!("{ORIGIN}/favicon.ico"), 200, b"icon")
    }

    fn host_with(
        fetcher: MockFetcher,
    ) -> (
        WorkerHost,
        mpsc::UnboundedReceiver<WorkerEvent>,
        Arc<RwLock<CacheStorage>>,
    ) {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let (host, rx) = WorkerHost::new(Arc::clone(&caches), Arc::new(fetcher));
        (host, rx, caches)
    }

    fn config_for(version: &str) -> ProxyConfig {
        ProxyConfig {
            cache_name: version.to_string(),
            ..ProxyConfig::default()
        }
    }

    fn get(url: &str) -> Request {
        Request::get(url::Url::parse(url).unwrap())
    }

    #[test]
    fn test_worker_state_transitions() {
        let mut worker = ServiceWorker::new("kidaily-v1");
        assert_eq!(worker.state, WorkerState::Parsed);

        worker.set_state(WorkerState::Installing);
        assert_eq!(worker.state, WorkerState::Installing);

        worker.set_state(WorkerState::Activated);
        assert!(worker.is_active());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = Registration::new();
        registration.begin_install(ServiceWorker::new("kidaily-v1"));
        assert!(registration.installing.is_some());

        registration.install_complete();
        assert!(registration.installing.is_none());
        assert_eq!(
            registration.waiting.as_ref().map(|w| w.state),
            Some(WorkerState::Installed)
        );

        registration.activate();
        assert!(registration.waiting.is_none());
        assert!(registration.active.as_ref().unwrap().is_active());
    }

    #[test]
    fn test_registration_install_failed_keeps_active() {
        let mut registration = Registration::new();
        registration.begin_install(ServiceWorker::new("kidaily-v1"));
        registration.install_complete();
        registration.activate();

        registration.begin_install(ServiceWorker::new("kidaily-v2"));
        registration.install_failed();

        assert!(registration.installing.is_none());
        assert_eq!(
            registration.active.as_ref().map(|w| w.version.as_str()),
            Some("kidaily-v1")
        );
    }

    #[tokio::test]
    async fn test_host_install_then_activate() {
        let (host, mut rx, _) = host_with(shell_fetcher());

        host.install_version(config_for("kidaily-v1")).await.unwrap();
        assert_eq!(host.waiting_version().await.as_deref(), Some("kidaily-v1"));
        assert_eq!(host.active_version().await, None);

        host.activate_waiting().await.unwrap();
        assert_eq!(host.active_version().await.as_deref(), Some("kidaily-v1"));
        assert_eq!(host.waiting_version().await, None);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::StateChange { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                WorkerState::Installing,
                WorkerState::Installed,
                WorkerState::Activating,
                WorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_host_fetch_before_activation_goes_to_network() {
        let (host, _rx, _) = host_with(shell_fetcher());
        host.install_version(config_for("kidaily-v1")).await.unwrap();

        // Installed but not yet controlling: straight to the network.
        let served = host.handle_fetch(get(&format!("{ORIGIN}/"))).await.unwrap();
        assert!(!served.from_cache);
    }

    #[tokio::test]
    async fn test_host_fetch_after_activation_served_from_cache() {
        let (host, _rx, _) = host_with(shell_fetcher());
        host.install_version(config_for("kidaily-v1")).await.unwrap();
        host.activate_waiting().await.unwrap();

        let served = host.handle_fetch(get(&format!("{ORIGIN}/"))).await.unwrap();
        assert!(served.from_cache);
        assert_eq!(served.body.as_ref(), b"<!doctype html>");
    }

    #[tokio::test]
    async fn test_host_activate_without_waiting_errors() {
        let (host, _rx, _) = host_with(shell_fetcher());
        assert!(matches!(
            host.activate_waiting().await,
            Err(SwError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_host_failed_install_keeps_previous_version() {
        let (host, _rx, _) = host_with(shell_fetcher());
        host.install_version(config_for("kidaily-v1")).await.unwrap();
        host.activate_waiting().await.unwrap();

        // v2 adds an asset the deploy doesn't actually serve.
        let mut config = config_for("kidaily-v2");
        let mut paths: Vec<String> = config.manifest.paths().to_vec();
        paths.push("/static/js/2.js".to_string());
        config.manifest = PrecacheManifest::new(paths);

        assert!(host.install_version(config).await.is_err());
        assert_eq!(host.active_version().await.as_deref(), Some("kidaily-v1"));
        assert_eq!(host.waiting_version().await, None);

        // The previous version still serves from its generation.
        let served = host.handle_fetch(get(&format!("{ORIGIN}/"))).await.unwrap();
        assert!(served.from_cache);
    }

    #[tokio::test]
    async fn test_host_upgrade_purges_previous_generation() {
        let (host, _rx, caches) = host_with(shell_fetcher());

        host.install_version(config_for("kidaily-v1")).await.unwrap();
        host.activate_waiting().await.unwrap();

        host.install_version(config_for("kidaily-v2")).await.unwrap();
        let purged = host.activate_waiting().await.unwrap();

        assert_eq!(purged, vec!["kidaily-v1"]);
        assert_eq!(caches.read().await.keys(), vec!["kidaily-v2"]);
        assert_eq!(host.active_version().await.as_deref(), Some("kidaily-v2"));
    }

    #[tokio::test]
    async fn test_host_unregister() {
        let (host, _rx, _) = host_with(shell_fetcher());
        host.install_version(config_for("kidaily-v1")).await.unwrap();
        host.activate_waiting().await.unwrap();

        host.unregister().await;
        assert_eq!(host.active_version().await, None);

        let served = host.handle_fetch(get(&format!("{ORIGIN}/"))).await.unwrap();
        assert!(!served.from_cache);
    }
}
