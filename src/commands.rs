/// Commands the control plane sends to a device.
///
/// Only the ones the playback controller actually issues are modeled; the
/// lounge protocol has many more.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    Play,
    Pause,
    SeekTo { new_time: f64 },
    SkipAd,
    Mute,
    Unmute,
    SetAutoplayMode { enabled: bool },
}

impl PlaybackCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::SeekTo { .. } => "seekTo",
            Self::SkipAd => "skipAd",
            Self::Mute => "mute",
            Self::Unmute => "unMute",
            Self::SetAutoplayMode { .. } => "setAutoplayMode",
        }
    }

    /// Command-specific form fields, `req0_`-prefixed per the bind protocol.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        match self {
            Self::SeekTo { new_time } => {
                vec![("req0_newTime".to_string(), new_time.to_string())]
            }
            Self::SetAutoplayMode { enabled } => {
                let mode = if *enabled { "ENABLED" } else { "DISABLED" };
                vec![("req0_autoplayMode".to_string(), mode.to_string())]
            }
            _ => Vec::new(),
        }
    }

    /// Full form body for one command post: the command name, the running
    /// offset counter, then the command fields.
    pub fn form_body(&self, ofs: u32) -> String {
        let mut fields = vec![
            ("count".to_string(), "1".to_string()),
            ("ofs".to_string(), ofs.to_string()),
            ("req0__sc".to_string(), self.name().to_string()),
        ];
        fields.extend(self.form_fields());
        // pairs of plain strings always encode
        serde_urlencoded::to_string(&fields).unwrap_or_default()
    }
}
