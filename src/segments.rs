use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::http::SharedHttp;
use crate::overrides::DevicePreferences;

const SEGMENTS_BASE_URL: &str = "https://sponsor.ajay.app/api";
const DATA_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const CACHE_TTL: Duration = Duration::from_secs(300);
// ranges this close together are skipped as one
const MERGE_GAP_SECONDS: f64 = 1.0;

/// A time range to seek past, `[start, end)` in video seconds.
///
/// Adjacent database entries get merged, so one range can carry several
/// segment uuids; all of them are acknowledged when the range is skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipSegment {
    pub start: f64,
    pub end: f64,
    pub uuids: Vec<String>,
    pub categories: Vec<String>,
}

impl SkipSegment {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Resolves a video to its skip ranges and acknowledges skipped ones.
#[async_trait]
pub trait SegmentProvider: Send + Sync {
    /// Ranges for the video, ascending by start. Empty when the video has
    /// none or its channel is whitelisted.
    async fn get_segments(&self, video_id: &str) -> Result<Vec<SkipSegment>>;

    /// Fire-and-forget view acknowledgement; delivery order is not
    /// guaranteed.
    async fn mark_viewed(&self, uuids: &[String]) -> Result<()>;
}

/// Production provider backed by the public segment database, with a
/// per-session TTL cache and optional channel-whitelist resolution through
/// the data API.
pub struct SegmentApi {
    http: SharedHttp,
    prefs: DevicePreferences,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    fetched_at: Instant,
    segments: Vec<SkipSegment>,
}

impl SegmentApi {
    pub fn new(http: SharedHttp, prefs: DevicePreferences) -> Self {
        SegmentApi {
            http,
            prefs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, video_id: &str) -> Option<Vec<SkipSegment>> {
        let cache = self.cache.lock().unwrap();
        cache
            .get(video_id)
            .filter(|entry| entry.fetched_at.elapsed() < CACHE_TTL)
            .map(|entry| entry.segments.clone())
    }

    fn store(&self, video_id: &str, segments: &[SkipSegment]) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            video_id.to_string(),
            CacheEntry {
                fetched_at: Instant::now(),
                segments: segments.to_vec(),
            },
        );
    }

    /// Channel id of a video through the data API; None when it cannot be
    /// determined.
    async fn video_channel(&self, video_id: &str) -> Result<Option<String>> {
        let url = format!("{DATA_API_BASE_URL}/videos");
        self.http.trace("GET", &url, None);
        let response = self
            .http
            .standard()
            .get(&url)
            .query(&[
                ("part", "snippet"),
                ("id", video_id),
                ("key", self.prefs.api_key.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        self.http.trace("GET", &url, Some(status.as_u16()));
        if !status.is_success() {
            return Err(Error::InvalidResponse(format!(
                "video lookup failed: {status}"
            )));
        }
        let listing: VideoListResponse = response.json().await?;
        Ok(listing
            .items
            .into_iter()
            .next()
            .map(|item| item.snippet.channel_id))
    }

    async fn fetch_segments(&self, video_id: &str) -> Result<Vec<SkipSegment>> {
        let prefix = hash_prefix(video_id);
        let url = format!("{SEGMENTS_BASE_URL}/skipSegments/{prefix}");
        let categories = serde_json::to_string(&self.prefs.skip_categories)?;

        self.http.trace("GET", &url, None);
        let response = self
            .http
            .standard()
            .get(&url)
            .query(&[("categories", categories.as_str())])
            .send()
            .await?;
        let status = response.status();
        self.http.trace("GET", &url, Some(status.as_u16()));
        // 404 means no entry under this prefix
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Error::InvalidResponse(format!(
                "segment lookup failed: {status}"
            )));
        }

        let videos: Vec<HashedVideoSegments> = response.json().await?;
        let raw = videos
            .into_iter()
            .filter(|video| video.video_id == video_id)
            .flat_map(|video| video.segments)
            .filter_map(|segment| {
                let (&start, &end) = (segment.segment.first()?, segment.segment.get(1)?);
                Some(SkipSegment {
                    start,
                    end,
                    uuids: vec![segment.uuid],
                    categories: if segment.category.is_empty() {
                        Vec::new()
                    } else {
                        vec![segment.category]
                    },
                })
            })
            .collect();

        Ok(normalize_segments(
            raw,
            self.prefs.minimum_skip_length as f64,
        ))
    }
}

#[async_trait]
impl SegmentProvider for SegmentApi {
    async fn get_segments(&self, video_id: &str) -> Result<Vec<SkipSegment>> {
        if video_id.is_empty() {
            return Ok(Vec::new());
        }

        // Whitelisted channels keep their segments; resolution failures fail
        // open into a normal lookup.
        if !self.prefs.channel_whitelist.is_empty() && !self.prefs.api_key.is_empty() {
            match self.video_channel(video_id).await {
                Ok(Some(channel_id)) if self.prefs.is_whitelisted(&channel_id) => {
                    tracing::debug!(video_id, channel_id, "channel whitelisted, no segments");
                    return Ok(Vec::new());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(video_id, error = %err, "channel lookup failed");
                }
            }
        }

        if let Some(segments) = self.cached(video_id) {
            return Ok(segments);
        }

        let segments = self.fetch_segments(video_id).await?;
        self.store(video_id, &segments);
        Ok(segments)
    }

    async fn mark_viewed(&self, uuids: &[String]) -> Result<()> {
        if !self.prefs.skip_count_tracking {
            return Ok(());
        }
        let url = format!("{SEGMENTS_BASE_URL}/viewedVideoSponsorTime");
        for uuid in uuids {
            self.http.trace("POST", &url, None);
            let result = self
                .http
                .standard()
                .post(&url)
                .query(&[("UUID", uuid.as_str())])
                .send()
                .await;
            if let Err(err) = result {
                tracing::debug!(uuid, error = %err, "failed to mark segment viewed");
            }
        }
        Ok(())
    }
}

/// First four hex chars of sha256(video id); the database is queried by
/// prefix so the exact id never leaves the process.
fn hash_prefix(video_id: &str) -> String {
    let digest = Sha256::digest(video_id.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..4].to_string()
}

/// Drops malformed and too-short ranges, orders by start, and merges ranges
/// closer than [`MERGE_GAP_SECONDS`].
fn normalize_segments(mut segments: Vec<SkipSegment>, minimum_len: f64) -> Vec<SkipSegment> {
    segments.retain(|s| s.end >= s.start && s.duration() >= minimum_len);
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<SkipSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match merged.last_mut() {
            Some(last) if segment.start - last.end <= MERGE_GAP_SECONDS => {
                last.end = last.end.max(segment.end);
                last.uuids.extend(segment.uuids);
                for category in segment.categories {
                    if !last.categories.contains(&category) {
                        last.categories.push(category);
                    }
                }
            }
            _ => merged.push(segment),
        }
    }
    merged
}

#[derive(Debug, Deserialize)]
struct HashedVideoSegments {
    #[serde(rename = "videoID")]
    video_id: String,
    #[serde(default)]
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(default)]
    segment: Vec<f64>,
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(default)]
    category: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    snippet: VideoSnippet,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    #[serde(rename = "channelId")]
    channel_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, uuid: &str, category: &str) -> SkipSegment {
        SkipSegment {
            start,
            end,
            uuids: vec![uuid.to_string()],
            categories: vec![category.to_string()],
        }
    }

    #[test]
    fn hash_prefix_shape() {
        let prefix = hash_prefix("dQw4w9WgXcQ");
        assert_eq!(prefix.len(), 4);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(prefix, hash_prefix("dQw4w9WgXcQ"));
        assert_ne!(prefix, hash_prefix("anothervid"));
    }

    #[test]
    fn normalize_sorts_and_drops_malformed() {
        let out = normalize_segments(
            vec![
                seg(30.0, 40.0, "u2", "sponsor"),
                seg(5.0, 10.0, "u1", "sponsor"),
                seg(50.0, 45.0, "bad", "sponsor"),
            ],
            0.0,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].uuids, vec!["u1"]);
        assert_eq!(out[1].uuids, vec!["u2"]);
    }

    #[test]
    fn normalize_merges_adjacent_ranges() {
        let out = normalize_segments(
            vec![
                seg(5.0, 10.0, "u1", "sponsor"),
                seg(10.5, 15.0, "u2", "intro"),
                seg(30.0, 35.0, "u3", "sponsor"),
            ],
            0.0,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].start, 5.0);
        assert_eq!(out[0].end, 15.0);
        assert_eq!(out[0].uuids, vec!["u1", "u2"]);
        assert_eq!(out[0].categories, vec!["sponsor", "intro"]);
        assert_eq!(out[1].uuids, vec!["u3"]);
    }

    #[test]
    fn normalize_enforces_minimum_length() {
        let out = normalize_segments(
            vec![seg(5.0, 5.5, "tiny", "sponsor"), seg(20.0, 30.0, "u1", "sponsor")],
            1.0,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].uuids, vec!["u1"]);
    }

    #[test]
    fn merged_range_keeps_duplicate_category_once() {
        let out = normalize_segments(
            vec![seg(5.0, 10.0, "u1", "sponsor"), seg(10.2, 12.0, "u2", "sponsor")],
            0.0,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].categories, vec!["sponsor"]);
    }
}
