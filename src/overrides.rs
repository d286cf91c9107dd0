use serde::{Deserialize, Serialize};

use crate::models::DeviceSnapshot;
use crate::store::AppConfig;

/// A whitelisted channel. Only the id participates in matching; the name is
/// for operators reading the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Per-device masks over the global preferences.
///
/// A missing key defers to the global value; `null` clears the override.
/// Unknown keys in stored payloads are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation: Option<AutomationOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_categories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_whitelist: Option<Vec<ChannelEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_ads: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_ads: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_count_tracking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_play: Option<bool>,
}

impl DeviceOverrides {
    /// Lenient parse of the stored JSON column; malformed payloads resolve to
    /// no overrides rather than poisoning the snapshot.
    pub fn from_stored(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|err| {
            tracing::debug!(error = %err, "dropping malformed device overrides");
            Self::default()
        })
    }
}

/// Effective preferences for one session: the global configuration projected
/// through a device's overrides. Immutable once built; a supervisor restart
/// rebuilds it.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePreferences {
    pub join_name: String,
    pub api_key: String,
    pub skip_categories: Vec<String>,
    pub channel_whitelist: Vec<ChannelEntry>,
    pub skip_count_tracking: bool,
    pub mute_ads: bool,
    pub skip_ads: bool,
    pub auto_play: bool,
    pub minimum_skip_length: u32,
    pub offset_seconds: f64,
}

impl DevicePreferences {
    pub fn is_whitelisted(&self, channel_id: &str) -> bool {
        self.channel_whitelist.iter().any(|c| c.id == channel_id)
    }
}

/// Pure projection of (global config, device overrides) onto the preference
/// fields one session runs with.
pub fn resolve_preferences(config: &AppConfig, device: &DeviceSnapshot) -> DevicePreferences {
    let overrides = &device.overrides;
    let automation = overrides.automation.clone().unwrap_or_default();

    DevicePreferences {
        join_name: config.join_name.clone(),
        api_key: config.api_key.clone(),
        skip_categories: overrides
            .skip_categories
            .clone()
            .unwrap_or_else(|| config.skip_categories.clone()),
        channel_whitelist: overrides
            .channel_whitelist
            .clone()
            .unwrap_or_else(|| config.channel_whitelist.clone()),
        skip_count_tracking: automation
            .skip_count_tracking
            .unwrap_or(config.skip_count_tracking),
        mute_ads: automation.mute_ads.unwrap_or(config.mute_ads),
        skip_ads: automation.skip_ads.unwrap_or(config.skip_ads),
        auto_play: automation.auto_play.unwrap_or(config.auto_play),
        minimum_skip_length: config.minimum_skip_length,
        offset_seconds: device.offset_seconds(),
    }
}
