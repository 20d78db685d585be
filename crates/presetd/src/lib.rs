//! Preset-button restoration for networked smart speakers.
//!
//! The daemon discovers speakers on the local network, remembers what they are and what
//! their preset buttons should play, and answers the descriptor requests the speakers make
//! when a button is pressed.

pub mod api;
pub mod app;
pub mod capabilities;
pub mod config;
pub mod device;
pub mod discovery;
pub mod presets;
pub mod store;
pub mod sync;

pub use app::App;
pub use app::AppError;
pub use app::ControlError;
pub use config::Config;
pub use config::Diagnostic;
pub use config::format_diagnostics;
pub use presets::PresetSlot;
pub use sync::SyncResult;
