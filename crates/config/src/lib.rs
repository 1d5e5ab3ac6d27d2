//! Configuration for the voxloop pipeline
//!
//! Every recognized option is an explicit field with a default; settings
//! layer a `voxloop.toml` file and `VOXLOOP_*` environment variables over
//! those defaults.

mod settings;

pub use settings::{
    AudioSettings, BusSettings, ConfigError, ResponseSettings, Settings, VadSettings,
};
