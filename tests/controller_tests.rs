use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use mockall::predicate::eq;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use sbtv::commands::PlaybackCommand;
use sbtv::controller::{PlaybackController, PlayerControl};
use sbtv::models::{AdStatePayload, PlaybackStatus, PlaybackUpdate};
use sbtv::overrides::DevicePreferences;
use sbtv::segments::{SegmentProvider, SkipSegment};
use sbtv::stats::StatsRecorder;
use sbtv::store::Store;
use sbtv::{EventSink as _, Result};

mock! {
    Segments {}

    #[async_trait]
    impl SegmentProvider for Segments {
        async fn get_segments(&self, video_id: &str) -> Result<Vec<SkipSegment>>;
        async fn mark_viewed(&self, uuids: &[String]) -> Result<()>;
    }
}

/// Records every seek and command with its receipt instant.
#[derive(Default)]
struct RecordingPlayer {
    seeks: Mutex<Vec<(f64, Instant)>>,
    commands: Mutex<Vec<&'static str>>,
}

impl RecordingPlayer {
    fn seek_positions(&self) -> Vec<f64> {
        self.seeks.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }

    fn command_names(&self) -> Vec<&'static str> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlayerControl for RecordingPlayer {
    async fn seek_to(&self, position: f64) -> Result<()> {
        self.seeks.lock().unwrap().push((position, Instant::now()));
        Ok(())
    }

    async fn send_command(&self, command: PlaybackCommand) -> Result<()> {
        self.commands.lock().unwrap().push(command.name());
        Ok(())
    }
}

/// Segment provider with one canned answer per video, recording fetch order.
#[derive(Default)]
struct FakeSegments {
    per_video: HashMap<String, Vec<SkipSegment>>,
    fetches: Mutex<Vec<String>>,
    viewed: Mutex<Vec<String>>,
}

#[async_trait]
impl SegmentProvider for FakeSegments {
    async fn get_segments(&self, video_id: &str) -> Result<Vec<SkipSegment>> {
        self.fetches.lock().unwrap().push(video_id.to_string());
        Ok(self.per_video.get(video_id).cloned().unwrap_or_default())
    }

    async fn mark_viewed(&self, uuids: &[String]) -> Result<()> {
        self.viewed.lock().unwrap().extend(uuids.iter().cloned());
        Ok(())
    }
}

fn prefs() -> DevicePreferences {
    DevicePreferences {
        join_name: "sbtv".to_string(),
        api_key: String::new(),
        skip_categories: vec!["sponsor".to_string()],
        channel_whitelist: Vec::new(),
        skip_count_tracking: true,
        mute_ads: false,
        skip_ads: false,
        auto_play: true,
        minimum_skip_length: 1,
        offset_seconds: 0.0,
    }
}

fn seg(start: f64, end: f64, uuid: &str, category: &str) -> SkipSegment {
    SkipSegment {
        start,
        end,
        uuids: vec![uuid.to_string()],
        categories: vec![category.to_string()],
    }
}

fn playing(video: &str, cpn: &str, current_time: f64) -> PlaybackUpdate {
    PlaybackUpdate {
        video_id: Some(video.to_string()),
        cpn: Some(cpn.to_string()),
        status: PlaybackStatus::Playing,
        current_time,
        playback_speed: 1.0,
    }
}

fn paused(video: &str, cpn: &str, current_time: f64) -> PlaybackUpdate {
    PlaybackUpdate {
        status: PlaybackStatus::Paused,
        ..playing(video, cpn, current_time)
    }
}

struct Harness {
    controller: PlaybackController,
    player: Arc<RecordingPlayer>,
    stats: StatsRecorder,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    async fn new(prefs: DevicePreferences, segments: Arc<dyn SegmentProvider>) -> Self {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let stats = StatsRecorder::new(&store);
        let player = Arc::new(RecordingPlayer::default());
        let shutdown = CancellationToken::new();
        let controller = PlaybackController::new(
            "d1",
            prefs,
            player.clone(),
            segments,
            stats.clone(),
            shutdown.clone(),
        );
        let tasks = controller.spawn();
        Harness {
            controller,
            player,
            stats,
            shutdown,
            tasks,
        }
    }

    async fn metric(&self, metric: &str) -> f64 {
        self.stats
            .snapshot()
            .await
            .unwrap()
            .get("d1")
            .and_then(|metrics| metrics.get(metric))
            .copied()
            .unwrap_or(0.0)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn settle() {
    sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn skip_inside_range_fires_immediately() {
    let mut segments = MockSegments::new();
    segments
        .expect_get_segments()
        .with(eq("v1"))
        .returning(|_| Ok(vec![seg(5.0, 10.0, "u1", "sponsor")]));
    let viewed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let viewed_log = viewed.clone();
    segments.expect_mark_viewed().returning(move |uuids| {
        viewed_log.lock().unwrap().extend(uuids.iter().cloned());
        Ok(())
    });

    let harness = Harness::new(prefs(), Arc::new(segments)).await;
    harness.controller.sink().on_playback(playing("v1", "c1", 6.0));
    settle().await;

    assert_eq!(harness.player.seek_positions(), vec![10.0]);
    assert_eq!(harness.metric("segments_skipped").await, 1.0);
    assert!((harness.metric("time_saved_seconds").await - 4.0).abs() < 1e-9);
    assert_eq!(harness.metric("skip_category_sponsor").await, 1.0);
    assert!((harness.metric("time_saved_category_sponsor").await - 4.0).abs() < 1e-9);
    assert_eq!(viewed.lock().unwrap().as_slice(), ["u1".to_string()]);

    // the aggregate row moved in step
    let snapshot = harness.stats.snapshot().await.unwrap();
    assert_eq!(snapshot["__global__"]["segments_skipped"], 1.0);

    harness.stop().await;
}

#[tokio::test]
async fn upcoming_range_fires_on_schedule() {
    let mut segments = MockSegments::new();
    segments
        .expect_get_segments()
        .returning(|_| Ok(vec![seg(0.8, 4.0, "u1", "sponsor")]));
    segments.expect_mark_viewed().returning(|_| Ok(()));

    let harness = Harness::new(prefs(), Arc::new(segments)).await;
    let t0 = Instant::now();
    harness.controller.sink().on_playback(playing("v1", "c1", 0.0));

    sleep(Duration::from_millis(150)).await;
    assert!(
        harness.player.seek_positions().is_empty(),
        "skip fired before the range started"
    );

    sleep(Duration::from_millis(1850)).await;
    let seeks = harness.player.seeks.lock().unwrap().clone();
    assert_eq!(seeks.len(), 1);
    assert_eq!(seeks[0].0, 4.0);
    let fired_after = seeks[0].1.duration_since(t0).as_secs_f64();
    assert!(
        (0.6..2.0).contains(&fired_after),
        "fired after {fired_after}s"
    );
    assert!((harness.metric("time_saved_seconds").await - 3.2).abs() < 1e-9);

    harness.stop().await;
}

#[tokio::test]
async fn matching_plan_is_left_in_place_and_never_refires() {
    let mut segments = MockSegments::new();
    segments
        .expect_get_segments()
        .returning(|_| Ok(vec![seg(0.8, 2.0, "u1", "sponsor")]));
    segments.expect_mark_viewed().returning(|_| Ok(()));

    let harness = Harness::new(prefs(), Arc::new(segments)).await;
    harness.controller.sink().on_playback(playing("v1", "c1", 0.0));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.controller.current_plan(), Some((0.8, 2.0)));

    // same plan start within tolerance: the installed plan survives
    harness.controller.sink().on_playback(playing("v1", "c1", 0.1));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.controller.current_plan(), Some((0.8, 2.0)));

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(harness.player.seek_positions(), vec![2.0]);
    assert_eq!(harness.controller.current_plan(), None);

    // same cpn after the fire: the completed uuid is never rescheduled
    harness.controller.sink().on_playback(playing("v1", "c1", 2.5));
    settle().await;
    assert_eq!(harness.player.seek_positions(), vec![2.0]);
    assert_eq!(harness.controller.current_plan(), None);
    assert_eq!(harness.metric("segments_skipped").await, 1.0);

    harness.stop().await;
}

#[tokio::test]
async fn leaving_the_playing_state_cancels_the_plan() {
    let mut segments = MockSegments::new();
    segments
        .expect_get_segments()
        .returning(|_| Ok(vec![seg(60.0, 70.0, "u1", "sponsor")]));

    let harness = Harness::new(prefs(), Arc::new(segments)).await;
    harness.controller.sink().on_playback(playing("v1", "c1", 0.0));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.controller.current_plan(), Some((60.0, 70.0)));

    harness.controller.sink().on_playback(paused("v1", "c1", 0.2));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.controller.current_plan(), None);
    assert!(harness.player.seek_positions().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn video_changes_flush_and_count() {
    let segments = Arc::new(FakeSegments::default());
    let harness = Harness::new(prefs(), segments.clone()).await;
    let sink = harness.controller.sink();

    sink.on_playback(playing("v1", "c1", 0.0));
    sleep(Duration::from_millis(120)).await;
    sink.on_playback(playing("v2", "c2", 0.0));
    sleep(Duration::from_millis(120)).await;
    sink.on_playback(playing("v1", "c3", 0.0));
    sleep(Duration::from_millis(120)).await;
    sink.on_playback(paused("v1", "c3", 0.5));
    settle().await;

    assert_eq!(harness.metric("videos_watched").await, 3.0);
    assert_eq!(
        segments.fetches.lock().unwrap().as_slice(),
        ["v1".to_string(), "v2".to_string(), "v1".to_string()]
    );
    // each transition closed the watch session and flushed it
    assert!(harness.metric("watch_time_seconds").await > 0.0);
    assert!(harness.metric("last_seen").await > 0.0);

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_flushes_the_watch_session() {
    let harness = Harness::new(prefs(), Arc::new(FakeSegments::default())).await;
    harness.controller.sink().on_playback(playing("v1", "c1", 0.0));
    sleep(Duration::from_millis(250)).await;

    let stats = harness.stats.clone();
    harness.stop().await;

    let snapshot = stats.snapshot().await.unwrap();
    let watched = snapshot
        .get("d1")
        .and_then(|metrics| metrics.get("watch_time_seconds"))
        .copied()
        .unwrap_or(0.0);
    assert!(watched > 0.0, "watch session was not flushed on shutdown");
}

#[tokio::test]
async fn ad_automation_mutes_skips_and_unmutes() {
    let mut test_prefs = prefs();
    test_prefs.mute_ads = true;
    test_prefs.skip_ads = true;

    let harness = Harness::new(test_prefs, Arc::new(FakeSegments::default())).await;
    let sink = harness.controller.sink();

    sink.on_ad_state(AdStatePayload {
        ad_state: "playing".to_string(),
        content_video_id: Some("v1".to_string()),
        current_time: "0".to_string(),
        is_skip_enabled: "true".to_string(),
    });
    settle().await;
    let commands = harness.player.command_names();
    assert!(commands.contains(&"mute"));
    assert!(commands.contains(&"skipAd"));

    // a repeated ad notification does not mute twice
    sink.on_ad_state(AdStatePayload {
        ad_state: "playing".to_string(),
        content_video_id: Some("v1".to_string()),
        current_time: "1".to_string(),
        is_skip_enabled: "false".to_string(),
    });
    settle().await;
    let mutes = harness
        .player
        .command_names()
        .iter()
        .filter(|name| **name == "mute")
        .count();
    assert_eq!(mutes, 1);

    sink.on_playback(playing("v1", "c1", 5.0));
    settle().await;
    assert!(harness.player.command_names().contains(&"unMute"));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_flushes_while_playing() {
    let harness = Harness::new(prefs(), Arc::new(FakeSegments::default())).await;
    harness.controller.sink().on_playback(playing("v1", "c1", 0.0));

    // sixteen virtual seconds of continuous playback
    sleep(Duration::from_secs(16)).await;
    // let database completions drain in real time
    tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(200)))
        .await
        .unwrap();

    let watched = harness.metric("watch_time_seconds").await;
    assert!(watched >= 4.9, "heartbeat flushed only {watched}s");
    assert!(harness.metric("last_seen").await > 0.0);

    harness.stop().await;
}
