use serde::{Deserialize, Serialize};

use crate::overrides::DeviceOverrides;
use crate::utils::lounge_parse;

/// One configured device, as persisted in the `devices` table.
///
/// `screen_id` is the identity; everything else may change between reconciler
/// ticks. `offset` is stored in milliseconds and converted to seconds only
/// when scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub screen_id: String,
    pub name: String,
    pub offset_ms: i64,
    pub overrides: DeviceOverrides,
}

impl DeviceSnapshot {
    pub fn offset_seconds(&self) -> f64 {
        self.offset_ms as f64 / 1000.0
    }

    /// True when a running supervisor built from `self` no longer matches
    /// `other` and must be restarted. Discrete fields compare exactly;
    /// the offset tolerates a single millisecond of drift.
    pub fn identity_differs(&self, other: &DeviceSnapshot) -> bool {
        if self.name != other.name {
            return true;
        }
        if (self.offset_ms - other.offset_ms).abs() > 1 {
            return true;
        }
        self.overrides != other.overrides
    }
}

/// A paired screen as returned by the lounge pairing endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Screen {
    pub name: Option<String>,
    #[serde(rename = "screenId")]
    pub screen_id: String,
    #[serde(rename = "loungeToken")]
    pub lounge_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreensResponse {
    pub screens: Vec<Screen>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenAvailability {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenAvailabilityResponse {
    pub screens: Vec<ScreenAvailability>,
}

/// Playback status reported by the device.
///
/// The wire value is a small integer; anything outside the four known states
/// is an advert (YouTube uses 1081 for those).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
    Buffering,
    Advert,
}

impl PlaybackStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PlaybackStatus::Idle,
            1 => PlaybackStatus::Playing,
            2 => PlaybackStatus::Paused,
            3 => PlaybackStatus::Buffering,
            _ => PlaybackStatus::Advert,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "IDLE",
            PlaybackStatus::Playing => "PLAYING",
            PlaybackStatus::Paused => "PAUSED",
            PlaybackStatus::Buffering => "BUFFERING",
            PlaybackStatus::Advert => "ADVERT",
        }
    }

    pub fn is_playing(self) -> bool {
        self == PlaybackStatus::Playing
    }
}

/// A parsed playback-state update, as handed to the playback controller.
///
/// `cpn` (content-playback nonce) identifies one playback of one video and is
/// the authoritative "still the same playback" key. `video_id` is absent on
/// raw state changes until a nowPlaying event has named the video.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUpdate {
    pub video_id: Option<String>,
    pub cpn: Option<String>,
    pub status: PlaybackStatus,
    pub current_time: f64,
    pub playback_speed: f64,
}

/// Wire payload of an `onStateChange` event. All numerics arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct StateChangePayload {
    #[serde(rename = "currentTime", default)]
    pub current_time: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub cpn: Option<String>,
    #[serde(rename = "loadedTime", default)]
    pub loaded_time: String,
    #[serde(rename = "playbackRate", default)]
    pub playback_rate: String,
}

impl StateChangePayload {
    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus::from_code(lounge_parse::parse_int(&self.state))
    }

    pub fn current_time(&self) -> f64 {
        lounge_parse::parse_float(&self.current_time)
    }

    /// Playback rate if the payload carries a usable one.
    pub fn playback_rate(&self) -> Option<f64> {
        let rate = lounge_parse::parse_float(&self.playback_rate);
        (rate > 0.0).then_some(rate)
    }
}

/// Wire payload of a `nowPlaying` event.
#[derive(Debug, Clone, Deserialize)]
pub struct NowPlayingPayload {
    #[serde(rename = "videoId", default)]
    pub video_id: String,
    #[serde(rename = "currentTime", default)]
    pub current_time: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub cpn: Option<String>,
    #[serde(default)]
    pub duration: String,
    #[serde(rename = "listId", default)]
    pub list_id: Option<String>,
}

impl NowPlayingPayload {
    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus::from_code(lounge_parse::parse_int(&self.state))
    }

    pub fn current_time(&self) -> f64 {
        lounge_parse::parse_float(&self.current_time)
    }
}

/// Wire payload of an `onAdStateChange` event.
#[derive(Debug, Clone, Deserialize)]
pub struct AdStatePayload {
    #[serde(rename = "adState", alias = "AdState", default)]
    pub ad_state: String,
    #[serde(rename = "contentVideoId", default)]
    pub content_video_id: Option<String>,
    #[serde(rename = "currentTime", default)]
    pub current_time: String,
    #[serde(rename = "isSkipEnabled", default)]
    pub is_skip_enabled: String,
}

impl AdStatePayload {
    pub fn is_skippable(&self) -> bool {
        lounge_parse::parse_bool(&self.is_skip_enabled)
    }
}

// YouTube omits the state field on some events; "-1" means stopped.
fn default_state() -> String {
    "-1".to_string()
}
