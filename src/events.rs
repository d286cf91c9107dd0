use serde_json::Value;

use crate::models::{AdStatePayload, NowPlayingPayload, PlaybackUpdate, StateChangePayload};

/// Events decoded from one long-poll frame, already narrowed to the ones the
/// control plane reacts to.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    StateChange(StateChangePayload),
    NowPlaying(NowPlayingPayload),
    AdStateChange(AdStatePayload),
    ScreenDisconnected,
    NoOp,
    Unknown(String),
}

/// Callback surface a subscriber hands to `LoungeSession::subscribe`.
///
/// The session holds this behind an `Arc` and no strong reference back, so
/// the controller can own the session without a cycle. Implementations must
/// not block: `on_playback` feeds a coalescing mailbox.
pub trait EventSink: Send + Sync + 'static {
    /// A playback-state transition, at most one call per received update.
    fn on_playback(&self, update: PlaybackUpdate);

    /// The device entered or left an advert.
    fn on_ad_state(&self, ad: AdStatePayload) {
        let _ = ad;
    }

    /// The screen dropped the conversation.
    fn on_disconnected(&self) {}
}

/// Result of parsing one frame: the highest event id seen (to acknowledge on
/// the next bind) and the decoded events in arrival order.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    pub last_event_id: Option<i64>,
    pub events: Vec<ServerEvent>,
}

/// Parses a frame of the form `[[id, ["name", payload?]], ...]`.
///
/// Entries that do not match that shape are skipped; unknown event names are
/// preserved for debug logging.
pub fn parse_frame(frame: &str) -> ParsedFrame {
    let mut parsed = ParsedFrame::default();
    if frame.trim().is_empty() {
        return parsed;
    }

    let entries: Vec<Value> = match serde_json::from_str(frame) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => {
            tracing::debug!(frame, "event frame is not an array");
            return parsed;
        }
        Err(err) => {
            tracing::debug!(error = %err, frame, "failed to parse event frame");
            return parsed;
        }
    };

    for entry in &entries {
        let Some(entry) = entry.as_array() else {
            continue;
        };
        if let Some(id) = entry.first().and_then(Value::as_i64) {
            parsed.last_event_id = Some(parsed.last_event_id.map_or(id, |prev| prev.max(id)));
        }
        let Some(body) = entry.get(1).and_then(Value::as_array) else {
            continue;
        };
        let Some(name) = body.first().and_then(Value::as_str) else {
            continue;
        };
        let payload = body.get(1).cloned().unwrap_or(Value::Null);
        parsed.events.push(decode_event(name, payload));
    }
    parsed
}

fn decode_event(name: &str, payload: Value) -> ServerEvent {
    match name {
        "onStateChange" => match serde_json::from_value(payload) {
            Ok(state) => ServerEvent::StateChange(state),
            Err(err) => {
                tracing::debug!(error = %err, "undecodable onStateChange payload");
                ServerEvent::Unknown(name.to_string())
            }
        },
        "nowPlaying" => match serde_json::from_value(payload) {
            Ok(now_playing) => ServerEvent::NowPlaying(now_playing),
            Err(err) => {
                tracing::debug!(error = %err, "undecodable nowPlaying payload");
                ServerEvent::Unknown(name.to_string())
            }
        },
        "onAdStateChange" => match serde_json::from_value(payload) {
            Ok(ad) => ServerEvent::AdStateChange(ad),
            Err(err) => {
                tracing::debug!(error = %err, "undecodable onAdStateChange payload");
                ServerEvent::Unknown(name.to_string())
            }
        },
        "loungeScreenDisconnected" => ServerEvent::ScreenDisconnected,
        "noop" => ServerEvent::NoOp,
        other => ServerEvent::Unknown(other.to_string()),
    }
}
