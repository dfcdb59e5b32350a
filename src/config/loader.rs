// Configuration file loading and creation

use super::types::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable that replaces `network.signaling_server`
pub const SIGNALING_SERVER_ENV: &str = "STEERLINK_SIGNALING_SERVER";

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("steerlink");

    // Create config directory if it doesn't exist
    fs::create_dir_all(&path).ok();

    path.push("config.toml");
    path
}

/// Load configuration from file, or create default if it doesn't exist.
/// The environment override is applied on top either way.
pub fn load_config() -> Result<Config, io::Error> {
    let config_path = get_config_path();

    let mut config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        parse_config(&contents)
    } else {
        create_default_config(&config_path)?;
        Config::default()
    };

    apply_env_override(&mut config, std::env::var(SIGNALING_SERVER_ENV).ok());
    Ok(config)
}

/// Parse config text; falls back to defaults on error
pub fn parse_config(contents: &str) -> Config {
    match toml::from_str(contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to parse config file, using default configuration: {}", e);
            Config::default()
        }
    }
}

/// Replace the signaling server URL when the override is set and non-empty
pub fn apply_env_override(config: &mut Config, server: Option<String>) {
    if let Some(server) = server.filter(|s| !s.trim().is_empty()) {
        config.network.signaling_server = server.trim().to_string();
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<(), io::Error> {
    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let commented_toml = format!(
        "# Steerlink Configuration File\n\
         # Edit this file to customize connection and control behavior\n\
         #\n\
         # {} overrides network.signaling_server\n\
         #\n\
         # controls.send_policy: \"on_change\" or \"retransmit\"\n\
         # controls.wire_format: \"plain\" or \"envelope\"\n\
         #\n\
         # Key binding format: Use \"Up\", \"Down\", \"Left\", \"Right\", \"Space\", \"Esc\"\n\
         #                     or single characters like \"A\", \"D\", \"Q\", etc.\n\n\
         {}",
        SIGNALING_SERVER_ENV, toml_string
    );

    fs::write(path, commented_toml)?;
    println!("Created default config file at: {}", path.display());
    Ok(())
}
