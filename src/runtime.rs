use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::http::SharedHttp;
use crate::overrides::resolve_preferences;
use crate::reconciler::{Reconciler, StartFn};
use crate::settings::Settings;
use crate::stats::StatsRecorder;
use crate::store::Store;
use crate::supervisor::DeviceSupervisor;

/// Brings the control plane up and runs it until a shutdown signal.
///
/// Owns the shared resources every supervisor borrows: the store, the stats
/// recorder, and the outbound client pair. They outlive the reconciler,
/// which in turn joins every supervisor before returning.
pub async fn run(settings: Settings) -> Result<()> {
    let store = Store::open(&settings.data_dir).await?;
    let config = store.load_config().await?;
    let http = SharedHttp::new(config.use_proxy, settings.http_tracing)?;
    let stats = StatsRecorder::new(&store);
    let shutdown = CancellationToken::new();

    let start = supervisor_factory(store.clone(), http.clone(), stats.clone());
    let reconciler = Reconciler::new(store.clone(), http.clone(), start);
    let reconciler_task = tokio::spawn(reconciler.run(shutdown.child_token()));

    wait_for_signal().await?;
    tracing::info!("shutdown signal received, stopping supervisors");
    tokio::spawn(async {
        if wait_for_signal().await.is_ok() {
            tracing::warn!("second signal, exiting immediately");
            std::process::exit(1);
        }
    });

    shutdown.cancel();
    let _ = reconciler_task.await;
    tracing::info!("exited");
    Ok(())
}

/// Builds the per-device start function the reconciler drives. Preferences
/// are resolved from a config snapshot read at start time, never a cached
/// one.
fn supervisor_factory(
    store: Store,
    http: SharedHttp,
    stats: StatsRecorder,
) -> StartFn<DeviceSupervisor> {
    Box::new(move |snapshot| {
        let store = store.clone();
        let http = http.clone();
        let stats = stats.clone();
        Box::pin(async move {
            let config = store.load_config().await?;
            let prefs = resolve_preferences(&config, &snapshot);
            Ok(DeviceSupervisor::start(&snapshot, prefs, http, stats))
        })
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
