// Device control plane: one lounge session and one playback controller per
// configured device, reconciled against the persistent device set.
pub mod codec;
pub mod commands;
pub mod controller;
pub mod error;
pub mod events;
pub mod http;
pub mod lounge;
pub mod mailbox;
pub mod models;
pub mod overrides;
pub mod reconciler;
pub mod runtime;
pub mod segments;
pub mod settings;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod utils;

// Re-export common items for easier use
pub use commands::PlaybackCommand;
pub use controller::{PlaybackController, PlayerControl};
pub use error::{Error, Result};
pub use events::EventSink;
pub use http::SharedHttp;
pub use lounge::{LinkState, LoungeSession};
pub use models::{DeviceSnapshot, PlaybackStatus, PlaybackUpdate, Screen};
pub use overrides::{resolve_preferences, DeviceOverrides, DevicePreferences};
pub use reconciler::Reconciler;
pub use segments::{SegmentProvider, SkipSegment};
pub use stats::{StatsRecorder, GLOBAL_DEVICE_ID};
pub use store::{AppConfig, Store};
pub use supervisor::{DeviceSupervisor, SupervisorControl};
