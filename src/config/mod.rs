// Configuration module for Steerlink
// Handles loading connection and control settings from a TOML file

pub mod loader;
pub mod types;

pub use loader::{create_default_config, get_config_path, load_config, SIGNALING_SERVER_ENV};
pub use types::{ChannelSettings, Config, ControlsConfig, KeyBindings, NetworkConfig};
