use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::commands::PlaybackCommand;
use crate::error::Result;
use crate::events::EventSink;
use crate::lounge::LoungeSession;
use crate::mailbox::Mailbox;
use crate::models::{AdStatePayload, PlaybackStatus, PlaybackUpdate};
use crate::overrides::DevicePreferences;
use crate::segments::{SegmentProvider, SkipSegment};
use crate::stats::StatsRecorder;

// a plan whose target is effectively the current position is not worth scheduling
const SKIP_EPSILON: f64 = 0.25;
// plans this close to the installed one are the same plan
const PLAN_DEDUPE_TOLERANCE: f64 = 0.05;
const WATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// The slice of the lounge session the controller drives. Split out so the
/// state machine can be exercised against a recording fake.
#[async_trait]
pub trait PlayerControl: Send + Sync + 'static {
    async fn seek_to(&self, position: f64) -> Result<()>;
    async fn send_command(&self, command: PlaybackCommand) -> Result<()>;
}

#[async_trait]
impl PlayerControl for LoungeSession {
    async fn seek_to(&self, position: f64) -> Result<()> {
        LoungeSession::seek_to(self, position).await
    }

    async fn send_command(&self, command: PlaybackCommand) -> Result<()> {
        LoungeSession::send_command(self, command).await
    }
}

/// Per-device consumer of playback updates.
///
/// Turns the update stream into watch-time accounting, at most one scheduled
/// seek, and skip statistics. Ingress goes through a single-slot coalescing
/// mailbox: only the most recent state is causally relevant for scheduling.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    device_id: String,
    prefs: DevicePreferences,
    player: Arc<dyn PlayerControl>,
    segments: Arc<dyn SegmentProvider>,
    stats: StatsRecorder,
    mailbox: Mailbox<ReceivedUpdate>,
    state: Mutex<PlayState>,
    plan_ids: AtomicU64,
    shutdown: CancellationToken,
}

struct ReceivedUpdate {
    update: PlaybackUpdate,
    // monotonic receipt time; scheduling arithmetic subtracts the
    // processing delay measured against it
    received_at: Instant,
}

#[derive(Default)]
struct PlayState {
    video_id: Option<String>,
    cpn: Option<String>,
    segments: Vec<SkipSegment>,
    completed_uuids: HashSet<String>,
    scheduled: Option<ScheduledSkip>,
    watch: Option<WatchSession>,
    ad_muted: bool,
}

struct ScheduledSkip {
    id: u64,
    video_id: String,
    plan_start: f64,
    plan_end: f64,
    uuids: Vec<String>,
    categories: Vec<String>,
    cancel: CancellationToken,
}

struct WatchSession {
    started_at: Instant,
    last_flush: Instant,
}

impl PlaybackController {
    pub fn new(
        device_id: &str,
        prefs: DevicePreferences,
        player: Arc<dyn PlayerControl>,
        segments: Arc<dyn SegmentProvider>,
        stats: StatsRecorder,
        shutdown: CancellationToken,
    ) -> Self {
        PlaybackController {
            inner: Arc::new(ControllerInner {
                device_id: device_id.to_string(),
                prefs,
                player,
                segments,
                stats,
                mailbox: Mailbox::new(),
                state: Mutex::new(PlayState::default()),
                plan_ids: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    /// Currently installed plan as (plan start, plan end), if any.
    /// Diagnostic read; the plan may fire or be replaced at any moment.
    pub fn current_plan(&self) -> Option<(f64, f64)> {
        let state = self.inner.state.lock().unwrap();
        state
            .scheduled
            .as_ref()
            .map(|plan| (plan.plan_start, plan.plan_end))
    }

    /// The callback handle to register with `LoungeSession::subscribe`.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::new(ControllerSink {
            controller: self.clone(),
        })
    }

    /// Starts the update processor and the heartbeat. Both stop on the
    /// shutdown token, after a final watch-session flush.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let processor = {
            let controller = self.clone();
            tokio::spawn(async move { controller.process_loop().await })
        };
        let heartbeat = {
            let controller = self.clone();
            tokio::spawn(async move { controller.heartbeat_loop().await })
        };
        vec![processor, heartbeat]
    }

    async fn process_loop(&self) {
        loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                received = self.inner.mailbox.recv() => received,
            };
            match received {
                Some(received) => self.process_playstatus(received).await,
                None => break,
            }
        }
        self.finish().await;
    }

    async fn heartbeat_loop(&self) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = sleep(HEARTBEAT_INTERVAL) => {}
            }
            let delta = {
                let mut state = self.inner.state.lock().unwrap();
                match &mut state.watch {
                    Some(watch) => {
                        let now = Instant::now();
                        let delta = now.duration_since(watch.last_flush).as_secs_f64();
                        watch.last_flush = now;
                        Some(delta)
                    }
                    None => None,
                }
            };
            if let Some(delta) = delta {
                self.flush_watch_time(delta).await;
                if let Err(err) = self.inner.stats.mark_device_seen(&self.inner.device_id).await {
                    tracing::debug!(device = %self.inner.device_id, error = %err, "device_seen write failed");
                }
            }
        }
    }

    /// One update through the state machine. Collaborator failures are
    /// logged and swallowed; they never reach the supervisor loop.
    async fn process_playstatus(&self, received: ReceivedUpdate) {
        let ReceivedUpdate {
            update,
            received_at,
        } = received;

        if let Err(err) = self.inner.stats.mark_device_seen(&self.inner.device_id).await {
            tracing::debug!(device = %self.inner.device_id, error = %err, "device_seen write failed");
        }

        // identity transitions: flush and reset before adopting the new playback
        let (flush_delta, new_video) = {
            let mut state = self.inner.state.lock().unwrap();
            let cpn_changed = update.cpn != state.cpn;
            let video_changed = update
                .video_id
                .as_deref()
                .is_some_and(|v| state.video_id.as_deref() != Some(v));

            let mut flush_delta = 0.0;
            if cpn_changed || video_changed {
                flush_delta += close_watch(&mut state, received_at);
                cancel_scheduled(&mut state);
            }
            if cpn_changed {
                state.completed_uuids.clear();
                state.cpn = update.cpn.clone();
            }

            let mut new_video = None;
            if video_changed {
                let video_id = update.video_id.clone().unwrap_or_default();
                state.video_id = Some(video_id.clone());
                state.segments.clear();
                new_video = Some(video_id);
            }
            (flush_delta, new_video)
        };
        self.flush_watch_time(flush_delta).await;

        if let Some(video_id) = new_video {
            if let Err(err) = self.inner.stats.record_video_started(&self.inner.device_id).await {
                tracing::debug!(device = %self.inner.device_id, error = %err, "videos_watched write failed");
            }
            match self.inner.segments.get_segments(&video_id).await {
                Ok(segments) => {
                    tracing::info!(
                        device = %self.inner.device_id,
                        video_id,
                        segments = segments.len(),
                        "resolved segments"
                    );
                    let mut state = self.inner.state.lock().unwrap();
                    if state.video_id.as_deref() == Some(video_id.as_str()) {
                        state.segments = segments;
                    }
                }
                Err(err) => {
                    tracing::warn!(device = %self.inner.device_id, video_id, error = %err, "segment fetch failed");
                }
            }
        }

        // watch-time accounting
        let flush_delta = {
            let mut state = self.inner.state.lock().unwrap();
            if update.status.is_playing() {
                match &mut state.watch {
                    None => {
                        state.watch = Some(WatchSession {
                            started_at: received_at,
                            last_flush: received_at,
                        });
                        0.0
                    }
                    Some(watch) => {
                        let since = received_at.duration_since(watch.last_flush).as_secs_f64();
                        if since >= WATCH_FLUSH_INTERVAL.as_secs_f64() {
                            watch.last_flush = received_at;
                            since
                        } else {
                            0.0
                        }
                    }
                }
            } else {
                close_watch(&mut state, received_at)
            }
        };
        self.flush_watch_time(flush_delta).await;

        // a muted ad is over once a non-advert state arrives
        if update.status != PlaybackStatus::Advert {
            let unmute = {
                let mut state = self.inner.state.lock().unwrap();
                std::mem::take(&mut state.ad_muted)
            };
            if unmute {
                self.spawn_command(PlaybackCommand::Unmute);
            }
        }

        // skip scheduling
        let plan = {
            let mut state = self.inner.state.lock().unwrap();
            if update.status.is_playing() && !state.segments.is_empty() {
                self.plan_next_skip(&mut state, &update, received_at)
            } else {
                cancel_scheduled(&mut state);
                None
            }
        };
        if let Some((id, fires_at)) = plan {
            self.spawn_skip_task(id, fires_at);
        }
    }

    /// Selects the next range and installs a plan for it, unless the
    /// installed plan already covers it. Returns the plan id and its
    /// deadline for the caller to arm.
    fn plan_next_skip(
        &self,
        state: &mut PlayState,
        update: &PlaybackUpdate,
        received_at: Instant,
    ) -> Option<(u64, Instant)> {
        let position = update.current_time;
        let Some((plan_start, segment)) =
            select_skip(&state.segments, &state.completed_uuids, position)
        else {
            cancel_scheduled(state);
            return None;
        };
        let video_id = state.video_id.clone()?;

        if let Some(existing) = &state.scheduled {
            if existing.video_id == video_id
                && (existing.plan_start - plan_start).abs() < PLAN_DEDUPE_TOLERANCE
            {
                return None;
            }
        }
        let plan_end = segment.end;
        let uuids = segment.uuids.clone();
        let categories = segment.categories.clone();
        cancel_scheduled(state);

        let now = Instant::now();
        let elapsed = now.duration_since(received_at).as_secs_f64();
        let wait = compute_wait(
            plan_start,
            position,
            elapsed,
            update.playback_speed,
            self.inner.prefs.offset_seconds,
        );
        let fires_at = now + Duration::from_secs_f64(wait);

        let id = self.inner.plan_ids.fetch_add(1, Ordering::Relaxed);
        state.scheduled = Some(ScheduledSkip {
            id,
            video_id,
            plan_start,
            plan_end,
            uuids,
            categories,
            cancel: self.inner.shutdown.child_token(),
        });
        Some((id, fires_at))
    }

    fn spawn_skip_task(&self, id: u64, fires_at: Instant) {
        let cancel = {
            let state = self.inner.state.lock().unwrap();
            match &state.scheduled {
                Some(plan) if plan.id == id => plan.cancel.clone(),
                _ => return,
            }
        };
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep_until(fires_at) => controller.fire_skip(id).await,
            }
        });
    }

    async fn fire_skip(&self, id: u64) {
        let plan = {
            let state = self.inner.state.lock().unwrap();
            match &state.scheduled {
                Some(plan) if plan.id == id => Some((
                    plan.plan_start,
                    plan.plan_end,
                    plan.uuids.clone(),
                    plan.categories.clone(),
                )),
                _ => None,
            }
        };
        let Some((plan_start, plan_end, uuids, categories)) = plan else {
            return;
        };

        tracing::info!(
            device = %self.inner.device_id,
            position = plan_end,
            "skipping segment"
        );

        // seek and acknowledgement run concurrently; the skip counts regardless
        {
            let player = Arc::clone(&self.inner.player);
            tokio::spawn(async move {
                if let Err(err) = player.seek_to(plan_end).await {
                    tracing::warn!(error = %err, "seek failed");
                }
            });
        }
        {
            let segments = Arc::clone(&self.inner.segments);
            let uuids = uuids.clone();
            tokio::spawn(async move {
                if let Err(err) = segments.mark_viewed(&uuids).await {
                    tracing::debug!(error = %err, "mark viewed failed");
                }
            });
        }

        let saved = (plan_end - plan_start).max(0.0);
        if let Err(err) = self
            .inner
            .stats
            .record_segment_skip(&self.inner.device_id, uuids.len(), saved, &categories)
            .await
        {
            tracing::warn!(device = %self.inner.device_id, error = %err, "skip stats write failed");
        }

        let mut state = self.inner.state.lock().unwrap();
        state.completed_uuids.extend(uuids);
        if state.scheduled.as_ref().map(|plan| plan.id) == Some(id) {
            state.scheduled = None;
        }
    }

    fn handle_ad_state(&self, ad: AdStatePayload) {
        if self.inner.prefs.skip_ads && ad.is_skippable() {
            self.spawn_command(PlaybackCommand::SkipAd);
        }
        if self.inner.prefs.mute_ads {
            let mute = {
                let mut state = self.inner.state.lock().unwrap();
                !std::mem::replace(&mut state.ad_muted, true)
            };
            if mute {
                self.spawn_command(PlaybackCommand::Mute);
            }
        }
    }

    fn spawn_command(&self, command: PlaybackCommand) {
        let player = Arc::clone(&self.inner.player);
        tokio::spawn(async move {
            let name = command.name();
            if let Err(err) = player.send_command(command).await {
                tracing::debug!(command = name, error = %err, "command failed");
            }
        });
    }

    async fn flush_watch_time(&self, delta: f64) {
        if delta <= 0.0 {
            return;
        }
        if let Err(err) = self
            .inner
            .stats
            .record_watch_time(&self.inner.device_id, delta)
            .await
        {
            tracing::warn!(device = %self.inner.device_id, error = %err, "watch time write failed");
        }
    }

    /// Final flush on shutdown.
    async fn finish(&self) {
        let delta = {
            let mut state = self.inner.state.lock().unwrap();
            cancel_scheduled(&mut state);
            close_watch(&mut state, Instant::now())
        };
        self.flush_watch_time(delta).await;
    }
}

/// Sink half handed to the lounge session. Delivery must not block: state
/// updates go through the coalescing mailbox, ad transitions spawn their
/// command and return.
struct ControllerSink {
    controller: PlaybackController,
}

impl EventSink for ControllerSink {
    fn on_playback(&self, update: PlaybackUpdate) {
        let displaced = self.controller.inner.mailbox.send(ReceivedUpdate {
            update,
            received_at: Instant::now(),
        });
        if displaced {
            tracing::trace!(
                device = %self.controller.inner.device_id,
                "coalesced a stale playback update"
            );
        }
    }

    fn on_ad_state(&self, ad: AdStatePayload) {
        self.controller.handle_ad_state(ad);
    }
}

/// Wall-clock seconds until the plan should fire: the remaining video time
/// at the current playback rate, compensated for the processing delay since
/// the update was received, minus the device's configured lead offset.
fn compute_wait(
    plan_start: f64,
    position: f64,
    elapsed: f64,
    playback_speed: f64,
    offset_seconds: f64,
) -> f64 {
    ((plan_start - position - elapsed) / playback_speed - offset_seconds).max(0.0)
}

/// First eligible range for the current position.
///
/// Malformed ranges and ranges whose every uuid is already completed are
/// ignored. A range covering the position wins with an immediate plan unless
/// its remainder is within [`SKIP_EPSILON`]; otherwise the first range ahead
/// of the position wins with a deferred plan.
fn select_skip<'a>(
    segments: &'a [SkipSegment],
    completed: &HashSet<String>,
    position: f64,
) -> Option<(f64, &'a SkipSegment)> {
    for segment in segments {
        if segment.start > segment.end {
            continue;
        }
        if !segment.uuids.is_empty() && segment.uuids.iter().all(|uuid| completed.contains(uuid)) {
            continue;
        }
        if segment.start <= position && position < segment.end - SKIP_EPSILON {
            return Some((position, segment));
        }
        if segment.start > position {
            return Some((segment.start, segment));
        }
    }
    None
}

fn cancel_scheduled(state: &mut PlayState) {
    if let Some(plan) = state.scheduled.take() {
        plan.cancel.cancel();
    }
}

/// Closes the watch session and returns the outstanding delta to flush.
fn close_watch(state: &mut PlayState, at: Instant) -> f64 {
    match state.watch.take() {
        Some(watch) => {
            tracing::debug!(
                watched = at.duration_since(watch.started_at).as_secs_f64(),
                "watch session closed"
            );
            at.duration_since(watch.last_flush).as_secs_f64()
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, uuid: &str) -> SkipSegment {
        SkipSegment {
            start,
            end,
            uuids: vec![uuid.to_string()],
            categories: vec!["sponsor".to_string()],
        }
    }

    #[test]
    fn selects_upcoming_range() {
        let segments = vec![seg(5.0, 10.0, "u1")];
        let (plan_start, segment) = select_skip(&segments, &HashSet::new(), 0.0).unwrap();
        assert_eq!(plan_start, 5.0);
        assert_eq!(segment.uuids, vec!["u1"]);
    }

    #[test]
    fn selects_immediate_plan_inside_range() {
        let segments = vec![seg(5.0, 10.0, "u1")];
        let (plan_start, _) = select_skip(&segments, &HashSet::new(), 6.0).unwrap();
        assert_eq!(plan_start, 6.0);
    }

    #[test]
    fn epsilon_guards_the_range_tail() {
        let segments = vec![seg(5.0, 10.0, "u1")];
        // within epsilon of the end: not an immediate candidate, not upcoming
        assert!(select_skip(&segments, &HashSet::new(), 9.9).is_none());
    }

    #[test]
    fn completed_ranges_are_not_rescheduled() {
        let segments = vec![seg(5.0, 10.0, "u1"), seg(20.0, 25.0, "u2")];
        let completed: HashSet<String> = ["u1".to_string()].into();
        let (plan_start, segment) = select_skip(&segments, &completed, 0.0).unwrap();
        assert_eq!(plan_start, 20.0);
        assert_eq!(segment.uuids, vec!["u2"]);
    }

    #[test]
    fn partially_completed_merged_range_still_schedules() {
        let merged = SkipSegment {
            start: 5.0,
            end: 12.0,
            uuids: vec!["u1".to_string(), "u2".to_string()],
            categories: vec!["sponsor".to_string()],
        };
        let completed: HashSet<String> = ["u1".to_string()].into();
        assert!(select_skip(&[merged], &completed, 0.0).is_some());
    }

    #[test]
    fn malformed_ranges_are_dropped() {
        let segments = vec![seg(10.0, 5.0, "bad"), seg(20.0, 25.0, "u1")];
        let (plan_start, _) = select_skip(&segments, &HashSet::new(), 0.0).unwrap();
        assert_eq!(plan_start, 20.0);
    }

    #[test]
    fn overlapping_ranges_pick_the_earliest() {
        let segments = vec![seg(5.0, 15.0, "u1"), seg(8.0, 20.0, "u2")];
        let (plan_start, segment) = select_skip(&segments, &HashSet::new(), 0.0).unwrap();
        assert_eq!(plan_start, 5.0);
        assert_eq!(segment.uuids, vec!["u1"]);
    }

    #[test]
    fn wait_from_video_start() {
        assert!((compute_wait(5.0, 0.0, 0.0, 1.0, 0.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn wait_inside_a_range_is_zero() {
        assert_eq!(compute_wait(6.0, 6.0, 0.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn wait_subtracts_the_device_offset() {
        assert!((compute_wait(5.0, 0.0, 0.0, 1.0, 0.3) - 4.7).abs() < 1e-9);
    }

    #[test]
    fn wait_compensates_processing_delay() {
        assert!((compute_wait(5.0, 0.0, 0.25, 1.0, 0.0) - 4.75).abs() < 1e-9);
    }

    #[test]
    fn wait_scales_with_playback_speed() {
        assert!((compute_wait(5.0, 0.0, 0.0, 2.0, 0.0) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn wait_never_goes_negative() {
        assert_eq!(compute_wait(5.0, 9.0, 0.0, 1.0, 0.5), 0.0);
    }
}
