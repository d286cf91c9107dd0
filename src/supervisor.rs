use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::commands::PlaybackCommand;
use crate::controller::PlaybackController;
use crate::events::EventSink;
use crate::http::SharedHttp;
use crate::lounge::LoungeSession;
use crate::models::DeviceSnapshot;
use crate::overrides::DevicePreferences;
use crate::segments::{SegmentApi, SegmentProvider};
use crate::stats::StatsRecorder;

const LINK_RETRY_DELAY: Duration = Duration::from_secs(10);
const AVAILABILITY_POLL_DELAY: Duration = Duration::from_secs(10);
const RESTART_DELAY: Duration = Duration::from_secs(5);
const AUTH_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);

/// What the reconciler needs from a running supervisor: orderly retirement.
/// Split out so the reconcile loop can be driven with a test double.
#[async_trait]
pub trait SupervisorControl: Send + 'static {
    async fn stop(self);
}

/// Task group for one device: the lounge session, its playback controller,
/// the subscription loop and the daily auth refresh.
pub struct DeviceSupervisor {
    session: LoungeSession,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceSupervisor {
    pub fn start(
        snapshot: &DeviceSnapshot,
        prefs: DevicePreferences,
        http: SharedHttp,
        stats: StatsRecorder,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let session = LoungeSession::new(&snapshot.screen_id, &prefs.join_name, http.clone());
        let segments: Arc<dyn SegmentProvider> = Arc::new(SegmentApi::new(http, prefs.clone()));
        let controller = PlaybackController::new(
            &snapshot.screen_id,
            prefs.clone(),
            Arc::new(session.clone()),
            segments,
            stats,
            shutdown.clone(),
        );

        let mut tasks = controller.spawn();
        tasks.push({
            let session = session.clone();
            let sink = controller.sink();
            let shutdown = shutdown.clone();
            let device_name = snapshot.name.clone();
            let auto_play = prefs.auto_play;
            tokio::spawn(async move {
                run_loop(session, sink, auto_play, shutdown, device_name).await;
            })
        });
        tasks.push({
            let session = session.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                refresh_auth_loop(session, shutdown).await;
            })
        });

        DeviceSupervisor {
            session,
            shutdown,
            tasks,
        }
    }
}

#[async_trait]
impl SupervisorControl for DeviceSupervisor {
    /// Signals every task, tears down the session, and joins. The controller
    /// flushes its watch session and drops any scheduled skip on the way out;
    /// task failures are swallowed, retirement always completes.
    async fn stop(self) {
        self.shutdown.cancel();
        self.session.disconnect().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// The connection loop: link, wait for availability, connect, subscribe,
/// and start over when the subscription ends. Every failure path comes back
/// to the top after a delay.
async fn run_loop(
    session: LoungeSession,
    sink: Arc<dyn EventSink>,
    auto_play: bool,
    shutdown: CancellationToken,
    device_name: String,
) {
    while !shutdown.is_cancelled() {
        while !session.linked() {
            if shutdown.is_cancelled() {
                return;
            }
            if let Err(err) = session.refresh_auth().await {
                tracing::debug!(device = %device_name, error = %err, "auth refresh failed");
                if !pause(&shutdown, LINK_RETRY_DELAY).await {
                    return;
                }
            }
        }

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if !session.linked() {
                break;
            }
            match session.is_available().await {
                Ok(true) => break,
                Ok(false) => {
                    tracing::debug!(device = %device_name, "waiting for device to be available")
                }
                Err(err) => {
                    tracing::debug!(device = %device_name, error = %err, "availability check failed")
                }
            }
            if !pause(&shutdown, AVAILABILITY_POLL_DELAY).await {
                return;
            }
        }
        if !session.linked() {
            // auth lapsed while waiting; back to the refresh loop
            continue;
        }

        if let Err(err) = session.connect().await {
            tracing::debug!(device = %device_name, error = %err, "connect failed");
            if !pause(&shutdown, RESTART_DELAY).await {
                return;
            }
            continue;
        }
        tracing::info!(device = %device_name, screen_id = %session.screen_id(), "connected to device");

        if !auto_play {
            if let Err(err) = session
                .send_command(PlaybackCommand::SetAutoplayMode { enabled: false })
                .await
            {
                tracing::debug!(device = %device_name, error = %err, "failed to disable autoplay");
            }
        }

        match session.subscribe(sink.clone()) {
            Ok(subscription) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = subscription => {
                        tracing::debug!(device = %device_name, "subscription ended");
                    }
                }
            }
            Err(err) => {
                tracing::debug!(device = %device_name, error = %err, "subscribe failed");
                if !pause(&shutdown, RESTART_DELAY).await {
                    return;
                }
            }
        }
    }
}

/// Unconditional daily token rotation, on top of the on-demand refresh the
/// connection loop performs.
async fn refresh_auth_loop(session: LoungeSession, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(AUTH_REFRESH_INTERVAL) => {}
        }
        if let Err(err) = session.refresh_auth().await {
            tracing::debug!(screen_id = %session.screen_id(), error = %err, "daily auth refresh failed");
        }
    }
}

/// Sleeps unless shut down first; false means stop.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
