use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::http::SharedHttp;
use crate::models::DeviceSnapshot;
use crate::store::Store;
use crate::supervisor::SupervisorControl;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Factory the reconciler uses to bring up a supervisor. Reads its own fresh
/// config snapshot; the reconciler never caches one for it.
pub type StartFn<C> =
    Box<dyn Fn(DeviceSnapshot) -> BoxFuture<'static, Result<C>> + Send + Sync>;

struct ListenerHandle<C> {
    snapshot: DeviceSnapshot,
    control: C,
}

/// Keeps the set of live supervisors equal to the persisted device set.
///
/// Each tick reads the store fresh, starts supervisors for new devices,
/// restarts ones whose identity-bearing fields changed, and retires removed
/// ones. A retirement is awaited before any replacement starts, so two
/// sessions for one screen never coexist.
pub struct Reconciler<C: SupervisorControl> {
    store: Store,
    http: SharedHttp,
    start: StartFn<C>,
    handles: HashMap<String, ListenerHandle<C>>,
}

impl<C: SupervisorControl> Reconciler<C> {
    pub fn new(store: Store, http: SharedHttp, start: StartFn<C>) -> Self {
        Reconciler {
            store,
            http,
            start,
            handles: HashMap::new(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.handles.len()
    }

    pub fn live_screen_ids(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    /// One tick: converge the live set onto `desired`. Start/stop failures
    /// are logged; the next tick retries.
    pub async fn reconcile(&mut self, desired: HashMap<String, DeviceSnapshot>) {
        for (screen_id, snapshot) in &desired {
            match self.handles.get(screen_id) {
                None => self.start_device(snapshot.clone()).await,
                Some(handle) if handle.snapshot.identity_differs(snapshot) => {
                    tracing::info!(screen_id, "device changed, restarting supervisor");
                    if let Some(handle) = self.handles.remove(screen_id) {
                        handle.control.stop().await;
                    }
                    self.start_device(snapshot.clone()).await;
                }
                Some(_) => {}
            }
        }

        let stale: Vec<String> = self
            .handles
            .keys()
            .filter(|screen_id| !desired.contains_key(*screen_id))
            .cloned()
            .collect();
        for screen_id in stale {
            if let Some(handle) = self.handles.remove(&screen_id) {
                tracing::info!(screen_id, "device removed, stopping supervisor");
                handle.control.stop().await;
            }
        }
    }

    async fn start_device(&mut self, snapshot: DeviceSnapshot) {
        if self.handles.contains_key(&snapshot.screen_id) {
            tracing::error!(
                screen_id = %snapshot.screen_id,
                "supervisor already live, refusing to start another"
            );
            return;
        }
        match (self.start)(snapshot.clone()).await {
            Ok(control) => {
                tracing::info!(screen_id = %snapshot.screen_id, name = %snapshot.name, "supervisor started");
                self.handles.insert(
                    snapshot.screen_id.clone(),
                    ListenerHandle { snapshot, control },
                );
            }
            Err(err) => {
                tracing::warn!(
                    screen_id = %snapshot.screen_id,
                    error = %err,
                    "failed to start supervisor, will retry next tick"
                );
            }
        }
    }

    /// The periodic loop. On shutdown every live supervisor is retired
    /// before this returns.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(RECONCILE_INTERVAL) => {}
            }

            match self.store.load_config().await {
                Ok(config) => {
                    if let Err(err) = self.http.set_proxy(config.use_proxy) {
                        tracing::warn!(error = %err, "failed to apply proxy change");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to load config");
                }
            }

            match self.store.load_device_snapshots().await {
                Ok(desired) => self.reconcile(desired).await,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to load device set");
                }
            }
        }

        let handles = std::mem::take(&mut self.handles);
        for (screen_id, handle) in handles {
            tracing::debug!(screen_id, "stopping supervisor for shutdown");
            handle.control.stop().await;
        }
    }
}
