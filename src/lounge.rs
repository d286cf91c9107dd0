use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::commands::PlaybackCommand;
use crate::error::{Error, Result};
use crate::events::{parse_frame, EventSink, ServerEvent};
use crate::http::SharedHttp;
use crate::models::{PlaybackUpdate, ScreenAvailabilityResponse, ScreensResponse};
use crate::utils::{extract_session_ids, request_nonce};

const PAIRING_BASE_URL: &str = "https://www.youtube.com/api/lounge/pairing";
const BIND_URL: &str = "https://www.youtube.com/api/lounge/bc/bind";

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(5);
const REBIND_PAUSE: Duration = Duration::from_secs(1);

/// Where one session stands with its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No usable lounge token.
    Unlinked,
    /// Holds a lounge token, no live conversation.
    Linked,
    /// Bind established, SID/gsessionid in hand.
    Connected,
    /// Long-poll subscription running.
    Subscribed,
    /// Terminal, via `disconnect()`.
    Closed,
}

/// One conversation with one device over the lounge protocol.
///
/// Cheap to clone; all clones share the underlying state. The session pushes
/// events into an [`EventSink`] and holds no reference to its consumer beyond
/// that, so the playback controller can own the session without a cycle.
#[derive(Clone)]
pub struct LoungeSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    screen_id: String,
    device_name: String,
    device_id: String,
    http: SharedHttp,
    state: Mutex<SessionState>,
    rid: AtomicU32,
    ofs: AtomicU32,
    closed: CancellationToken,
}

struct SessionState {
    link: LinkState,
    lounge_token: Option<String>,
    sid: Option<String>,
    gsessionid: Option<String>,
    aid: Option<i64>,
    // nowPlaying names the video; onStateChange events inherit it
    video_id: Option<String>,
    playback_speed: f64,
}

impl LoungeSession {
    pub fn new(screen_id: &str, device_name: &str, http: SharedHttp) -> Self {
        LoungeSession {
            inner: Arc::new(SessionInner {
                screen_id: screen_id.to_string(),
                device_name: device_name.to_string(),
                device_id: Uuid::new_v4().to_string(),
                http,
                state: Mutex::new(SessionState {
                    link: LinkState::Unlinked,
                    lounge_token: None,
                    sid: None,
                    gsessionid: None,
                    aid: None,
                    video_id: None,
                    playback_speed: 1.0,
                }),
                rid: AtomicU32::new(1),
                ofs: AtomicU32::new(0),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn screen_id(&self) -> &str {
        &self.inner.screen_id
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.state.lock().unwrap().link
    }

    pub fn linked(&self) -> bool {
        matches!(
            self.link_state(),
            LinkState::Linked | LinkState::Connected | LinkState::Subscribed
        )
    }

    pub fn connected(&self) -> bool {
        matches!(self.link_state(), LinkState::Connected | LinkState::Subscribed)
    }

    /// Fetches a fresh lounge token for the screen. Safe to call while a
    /// subscription is running; the new token applies from the next request.
    pub async fn refresh_auth(&self) -> Result<()> {
        let url = format!("{PAIRING_BASE_URL}/get_lounge_token_batch");
        self.inner.http.trace("POST", &url, None);
        let response = self
            .inner
            .http
            .standard()
            .post(&url)
            .form(&[("screen_ids", self.inner.screen_id.as_str())])
            .send()
            .await?;
        let status = response.status();
        self.inner.http.trace("POST", &url, Some(status.as_u16()));
        if !status.is_success() {
            self.downgrade();
            return Err(Error::InvalidResponse(format!(
                "token refresh failed: {status}"
            )));
        }

        let screens: ScreensResponse = response.json().await?;
        let Some(screen) = screens.screens.into_iter().next() else {
            self.downgrade();
            return Err(Error::InvalidResponse("no screens returned".to_string()));
        };

        let mut state = self.inner.state.lock().unwrap();
        state.lounge_token = Some(screen.lounge_token);
        if state.link == LinkState::Unlinked {
            state.link = LinkState::Linked;
        }
        Ok(())
    }

    /// Asks the pairing service whether the screen is reachable.
    pub async fn is_available(&self) -> Result<bool> {
        let token = self.token()?;
        let url = format!("{PAIRING_BASE_URL}/get_screen_availability");
        self.inner.http.trace("POST", &url, None);
        let response = self
            .inner
            .http
            .standard()
            .post(&url)
            .form(&[("lounge_token", token.as_str())])
            .send()
            .await?;
        let status = response.status();
        self.inner.http.trace("POST", &url, Some(status.as_u16()));
        if status.as_u16() == 401 {
            self.downgrade();
            return Err(Error::TokenExpired);
        }
        if !status.is_success() {
            return Err(Error::InvalidResponse(format!(
                "availability check failed: {status}"
            )));
        }

        // A malformed body still means the endpoint answered; report reachable.
        let text = response.text().await?;
        match serde_json::from_str::<ScreenAvailabilityResponse>(&text) {
            Ok(parsed) => Ok(parsed
                .screens
                .first()
                .is_some_and(|screen| screen.status == "online")),
            Err(_) => Ok(true),
        }
    }

    /// Establishes the bind conversation. Idempotent while connected; gives
    /// up with `Unavailable` after bounded retries.
    pub async fn connect(&self) -> Result<()> {
        if self.connected() {
            return Ok(());
        }
        let token = self.token()?;

        for attempt in 1..=CONNECT_ATTEMPTS {
            if attempt > 1 {
                tokio::select! {
                    _ = self.inner.closed.cancelled() => return Err(Error::ConnectionClosed),
                    _ = sleep(CONNECT_RETRY_DELAY) => {}
                }
            }
            match self.try_connect(&token).await {
                Ok(()) => return Ok(()),
                Err(Error::TokenExpired) => {
                    self.downgrade();
                    return Err(Error::TokenExpired);
                }
                Err(err) => {
                    tracing::debug!(
                        screen_id = %self.inner.screen_id,
                        attempt,
                        error = %err,
                        "connect attempt failed"
                    );
                }
            }
        }
        Err(Error::Unavailable)
    }

    async fn try_connect(&self, token: &str) -> Result<()> {
        self.inner.rid.store(1, Ordering::SeqCst);
        self.inner.ofs.store(0, Ordering::SeqCst);

        let nonce = request_nonce();
        let query = [
            ("RID", "1"),
            ("VER", "8"),
            ("CVER", "1"),
            ("zx", nonce.as_str()),
            ("auth_failure_option", "send_error"),
        ];
        let body = serde_urlencoded::to_string([
            ("app", "web"),
            ("mdx-version", "3"),
            ("name", self.inner.device_name.as_str()),
            ("id", self.inner.device_id.as_str()),
            ("device", "REMOTE_CONTROL"),
            ("capabilities", "que,dsdtr,atp"),
            ("method", "setPlaylist"),
            ("magnaKey", "cloudPairedDevice"),
            ("ui", "false"),
            ("theme", "cl"),
            ("loungeIdToken", token),
        ])
        .unwrap_or_default();

        self.inner.http.trace("POST", BIND_URL, None);
        let response = self
            .inner
            .http
            .standard()
            .post(BIND_URL)
            .query(&query)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        self.inner.http.trace("POST", BIND_URL, Some(status.as_u16()));
        match status.as_u16() {
            401 => return Err(Error::TokenExpired),
            s if s >= 400 => {
                return Err(Error::InvalidResponse(format!("connect failed: {status}")))
            }
            _ => {}
        }

        let body = response.bytes().await?;
        let (sid, gsessionid) = extract_session_ids(&body)?;

        let mut state = self.inner.state.lock().unwrap();
        if state.link == LinkState::Closed {
            return Err(Error::ConnectionClosed);
        }
        state.sid = Some(sid);
        state.gsessionid = Some(gsessionid);
        state.aid = None;
        state.link = LinkState::Connected;
        Ok(())
    }

    /// Starts the long-poll subscription, delivering events to `sink` in
    /// arrival order. The returned handle completes when the subscription
    /// terminates, locally or because the device closed it.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> Result<JoinHandle<()>> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.link != LinkState::Connected {
                return Err(Error::NotConnected);
            }
            state.link = LinkState::Subscribed;
        }
        let session = self.clone();
        Ok(tokio::spawn(async move {
            session.subscription_loop(sink).await;
        }))
    }

    async fn subscription_loop(&self, sink: Arc<dyn EventSink>) {
        loop {
            if self.inner.closed.is_cancelled() {
                break;
            }

            let Some((token, sid, gsessionid, aid)) = self.poll_params() else {
                break;
            };

            let nonce = request_nonce();
            let mut query: Vec<(&str, String)> = vec![
                ("name", self.inner.device_name.clone()),
                ("loungeIdToken", token),
                ("SID", sid),
                ("gsessionid", gsessionid),
                ("device", "REMOTE_CONTROL".to_string()),
                ("app", "youtube-desktop".to_string()),
                ("VER", "8".to_string()),
                ("v", "2".to_string()),
                ("RID", "rpc".to_string()),
                ("CI", "0".to_string()),
                ("TYPE", "xmlhttp".to_string()),
                ("zx", nonce),
            ];
            if let Some(aid) = aid {
                query.push(("AID", aid.to_string()));
            }

            self.inner.http.trace("GET", BIND_URL, None);
            let request = self.inner.http.long_poll().get(BIND_URL).query(&query).send();
            let response = tokio::select! {
                _ = self.inner.closed.cancelled() => break,
                response = request => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    tracing::debug!(
                        screen_id = %self.inner.screen_id,
                        error = %err,
                        "long poll request failed"
                    );
                    if self.pause(SUBSCRIBE_RETRY_DELAY).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let status = response.status();
            self.inner.http.trace("GET", BIND_URL, Some(status.as_u16()));
            match status.as_u16() {
                401 => {
                    self.downgrade();
                    break;
                }
                400 | 410 => {
                    self.drop_conversation();
                    break;
                }
                s if s >= 400 => {
                    if self.pause(SUBSCRIBE_RETRY_DELAY).await.is_err() {
                        break;
                    }
                    continue;
                }
                _ => {}
            }

            let stream = response.bytes_stream().map_err(std::io::Error::other);
            let mut frames = FramedRead::new(StreamReader::new(stream), FrameCodec::new());
            loop {
                let frame = tokio::select! {
                    _ = self.inner.closed.cancelled() => None,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(frame)) => self.handle_frame(&frame, &sink),
                    Some(Err(err)) => {
                        tracing::debug!(
                            screen_id = %self.inner.screen_id,
                            error = %err,
                            "long poll stream error"
                        );
                        break;
                    }
                    // poll exhausted (or cancelled); re-bind
                    None => break,
                }
            }

            if self.pause(REBIND_PAUSE).await.is_err() {
                break;
            }
        }

        let mut state = self.inner.state.lock().unwrap();
        if state.link == LinkState::Subscribed {
            state.link = if state.lounge_token.is_some() {
                LinkState::Linked
            } else {
                LinkState::Unlinked
            };
            state.sid = None;
            state.gsessionid = None;
        }
    }

    fn handle_frame(&self, frame: &str, sink: &Arc<dyn EventSink>) {
        let parsed = parse_frame(frame);
        if let Some(id) = parsed.last_event_id {
            self.inner.state.lock().unwrap().aid = Some(id);
        }
        for event in parsed.events {
            match event {
                ServerEvent::StateChange(payload) => {
                    let update = {
                        let mut state = self.inner.state.lock().unwrap();
                        if let Some(rate) = payload.playback_rate() {
                            state.playback_speed = rate;
                        }
                        PlaybackUpdate {
                            video_id: state.video_id.clone(),
                            cpn: payload.cpn.clone(),
                            status: payload.status(),
                            current_time: payload.current_time(),
                            playback_speed: state.playback_speed,
                        }
                    };
                    sink.on_playback(update);
                }
                ServerEvent::NowPlaying(payload) => {
                    let update = {
                        let mut state = self.inner.state.lock().unwrap();
                        if payload.video_id.is_empty() {
                            state.video_id = None;
                        } else {
                            state.video_id = Some(payload.video_id.clone());
                        }
                        PlaybackUpdate {
                            video_id: state.video_id.clone(),
                            cpn: payload.cpn.clone(),
                            status: payload.status(),
                            current_time: payload.current_time(),
                            playback_speed: state.playback_speed,
                        }
                    };
                    sink.on_playback(update);
                }
                ServerEvent::AdStateChange(payload) => sink.on_ad_state(payload),
                ServerEvent::ScreenDisconnected => {
                    tracing::info!(screen_id = %self.inner.screen_id, "screen disconnected");
                    self.drop_conversation();
                    sink.on_disconnected();
                }
                ServerEvent::NoOp => {}
                ServerEvent::Unknown(name) => {
                    tracing::trace!(screen_id = %self.inner.screen_id, event = %name, "ignoring event");
                }
            }
        }
    }

    /// Sends one command over the bind channel.
    pub async fn send_command(&self, command: PlaybackCommand) -> Result<()> {
        let (token, sid, gsessionid) = self.command_params()?;
        let rid = self.inner.rid.fetch_add(1, Ordering::SeqCst) + 1;
        let ofs = self.inner.ofs.fetch_add(1, Ordering::SeqCst);

        let nonce = request_nonce();
        let query: Vec<(&str, String)> = vec![
            ("name", self.inner.device_name.clone()),
            ("loungeIdToken", token),
            ("SID", sid),
            ("gsessionid", gsessionid),
            ("VER", "8".to_string()),
            ("v", "2".to_string()),
            ("RID", rid.to_string()),
            ("zx", nonce),
        ];

        self.inner.http.trace("POST", BIND_URL, None);
        let response = self
            .inner
            .http
            .standard()
            .post(BIND_URL)
            .query(&query)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(command.form_body(ofs))
            .send()
            .await?;
        let status = response.status();
        self.inner.http.trace("POST", BIND_URL, Some(status.as_u16()));
        match status.as_u16() {
            401 => {
                self.downgrade();
                Err(Error::TokenExpired)
            }
            400 => {
                self.drop_conversation();
                Err(Error::SessionExpired)
            }
            410 => {
                self.drop_conversation();
                Err(Error::ConnectionClosed)
            }
            s if s >= 400 => Err(Error::InvalidResponse(format!(
                "command {} failed: {status}",
                command.name()
            ))),
            _ => Ok(()),
        }
    }

    pub async fn seek_to(&self, position: f64) -> Result<()> {
        self.send_command(PlaybackCommand::SeekTo { new_time: position })
            .await
    }

    /// Terminates the conversation and releases network state. The session
    /// cannot be reused afterwards.
    pub async fn disconnect(&self) {
        self.inner.closed.cancel();

        let params = {
            let state = self.inner.state.lock().unwrap();
            match (&state.lounge_token, &state.sid, &state.gsessionid) {
                (Some(token), Some(sid), Some(gsessionid)) => {
                    Some((token.clone(), sid.clone(), gsessionid.clone()))
                }
                _ => None,
            }
        };
        if let Some((token, sid, gsessionid)) = params {
            let rid = self.inner.rid.fetch_add(1, Ordering::SeqCst) + 1;
            let query: Vec<(&str, String)> = vec![
                ("name", self.inner.device_name.clone()),
                ("loungeIdToken", token),
                ("SID", sid),
                ("gsessionid", gsessionid),
                ("VER", "8".to_string()),
                ("v", "2".to_string()),
                ("RID", rid.to_string()),
            ];
            // best effort; we are tearing down either way
            let _ = self
                .inner
                .http
                .standard()
                .post(BIND_URL)
                .query(&query)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body("ui=&TYPE=terminate&clientDisconnectReason=MDX_SESSION_DISCONNECT_REASON_DISCONNECTED_BY_USER")
                .send()
                .await;
        }

        let mut state = self.inner.state.lock().unwrap();
        state.link = LinkState::Closed;
        state.sid = None;
        state.gsessionid = None;
    }

    fn token(&self) -> Result<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .lounge_token
            .clone()
            .ok_or(Error::TokenExpired)
    }

    fn command_params(&self) -> Result<(String, String, String)> {
        let state = self.inner.state.lock().unwrap();
        if !matches!(state.link, LinkState::Connected | LinkState::Subscribed) {
            return Err(Error::NotConnected);
        }
        match (&state.lounge_token, &state.sid, &state.gsessionid) {
            (Some(token), Some(sid), Some(gsessionid)) => {
                Ok((token.clone(), sid.clone(), gsessionid.clone()))
            }
            _ => Err(Error::NotConnected),
        }
    }

    fn poll_params(&self) -> Option<(String, String, String, Option<i64>)> {
        let state = self.inner.state.lock().unwrap();
        match (&state.lounge_token, &state.sid, &state.gsessionid) {
            (Some(token), Some(sid), Some(gsessionid)) => Some((
                token.clone(),
                sid.clone(),
                gsessionid.clone(),
                state.aid,
            )),
            _ => None,
        }
    }

    /// Auth lapse: forget the token, back to unlinked.
    fn downgrade(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.lounge_token = None;
        state.sid = None;
        state.gsessionid = None;
        if state.link != LinkState::Closed {
            state.link = LinkState::Unlinked;
        }
    }

    /// Conversation lost but the token may still be good.
    fn drop_conversation(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.sid = None;
        state.gsessionid = None;
        if matches!(state.link, LinkState::Connected | LinkState::Subscribed) {
            state.link = LinkState::Linked;
        }
    }

    /// Cancellable sleep; Err means the session closed while waiting.
    async fn pause(&self, duration: Duration) -> std::result::Result<(), ()> {
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(()),
            _ = sleep(duration) => Ok(()),
        }
    }
}
