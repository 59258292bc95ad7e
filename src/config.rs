//! Receiver configuration
//!
//! Loaded from a TOML file. Every field has a default, so a missing file or a
//! partial file is valid; only values outside the supported ranges are
//! rejected.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::{MacAddress, MAX_DESCRIPTOR_STRING_BYTES};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Longest network name a link layer accepts
pub const MAX_SSID_BYTES: usize = 32;

/// Longest pre-shared key a link layer accepts
pub const MAX_PSK_BYTES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub network: NetworkConfig,
    pub connectivity: ConnectivityConfig,
    pub playback: PlaybackConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name of the network to associate with
    pub ssid: String,
    /// Pre-shared key; never logged
    pub psk: String,
    pub bind_address: String,
    pub discovery_port: u16,
    pub audio_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            psk: String::new(),
            bind_address: "0.0.0.0".to_string(),
            discovery_port: DISCOVERY_PORT,
            audio_port: AUDIO_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Immediate reassociation attempts before entering cooldown
    pub max_retry_attempts: u32,
    pub cooldown_ms: u64,
    /// Scan results considered when picking an access point
    pub max_scan_results: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: MAX_CONNECT_RETRY_ATTEMPTS,
            cooldown_ms: RECONNECT_COOLDOWN_MS,
            max_scan_results: MAX_SCAN_RESULTS,
        }
    }
}

impl ConnectivityConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub queue_capacity: usize,
    /// Output device name; the host default when absent
    pub output_device: Option<String>,
    /// Audio the output device buffers per service period
    pub output_buffer_ms: u64,
    /// Drop frames the codec rejects instead of faulting
    pub skip_undecodable_frames: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: FRAME_QUEUE_CAPACITY,
            output_device: None,
            output_buffer_ms: DEFAULT_OUTPUT_BUFFER_MS,
            skip_undecodable_frames: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// Overrides the address reported by the link layer
    pub mac_address: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: DEVICE_NAME.to_string(),
            mac_address: None,
        }
    }
}

impl ReceiverConfig {
    /// Default location: `config.toml` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-audio-receiver")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reads and validates a config file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.ssid.len() > MAX_SSID_BYTES {
            return Err(Error::Config(format!(
                "ssid is {} bytes, at most {} allowed",
                self.network.ssid.len(),
                MAX_SSID_BYTES
            )));
        }
        if self.network.psk.len() > MAX_PSK_BYTES {
            return Err(Error::Config(format!("psk exceeds {} bytes", MAX_PSK_BYTES)));
        }
        if self.network.discovery_port == self.network.audio_port && self.network.audio_port != 0 {
            return Err(Error::Config("discovery and audio ports must differ".to_string()));
        }
        if self.playback.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.playback.output_buffer_ms == 0 {
            return Err(Error::Config("output_buffer_ms must be at least 1".to_string()));
        }
        if self.connectivity.max_scan_results == 0 {
            return Err(Error::Config("max_scan_results must be at least 1".to_string()));
        }
        if self.device.name.is_empty() || self.device.name.len() > MAX_DESCRIPTOR_STRING_BYTES {
            return Err(Error::Config(format!(
                "device name must be 1..={} bytes",
                MAX_DESCRIPTOR_STRING_BYTES
            )));
        }
        self.mac_override()?;
        Ok(())
    }

    /// Parsed `device.mac_address`, if set
    pub fn mac_override(&self) -> Result<Option<MacAddress>> {
        self.device
            .mac_address
            .as_deref()
            .map(|s| s.parse::<MacAddress>().map_err(Error::Config))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReceiverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.audio_port, 58764);
        assert_eq!(config.network.discovery_port, 58765);
        assert_eq!(config.playback.queue_capacity, 40);
        assert_eq!(config.connectivity.max_retry_attempts, 10);
        assert_eq!(config.connectivity.cooldown(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ReceiverConfig::from_toml(
            r#"
            [network]
            ssid = "living-room"
            psk = "hunter22"

            [playback]
            skip_undecodable_frames = true
            "#,
        )
        .unwrap();
        assert_eq!(config.network.ssid, "living-room");
        assert_eq!(config.network.audio_port, AUDIO_PORT);
        assert!(config.playback.skip_undecodable_frames);
        assert_eq!(config.device.name, DEVICE_NAME);
    }

    #[test]
    fn test_overlong_credentials_rejected() {
        let text = format!("[network]\nssid = \"{}\"\n", "s".repeat(33));
        assert!(matches!(ReceiverConfig::from_toml(&text), Err(Error::Config(_))));

        let text = format!("[network]\npsk = \"{}\"\n", "p".repeat(65));
        assert!(matches!(ReceiverConfig::from_toml(&text), Err(Error::Config(_))));
    }

    #[test]
    fn test_mac_override() {
        let config = ReceiverConfig::from_toml("[device]\nmac_address = \"02:00:00:AA:BB:CC\"\n").unwrap();
        assert_eq!(
            config.mac_override().unwrap(),
            Some(MacAddress([0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC]))
        );
        assert!(ReceiverConfig::from_toml("[device]\nmac_address = \"nope\"\n").is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("lan-audio-receiver-does-not-exist.toml");
        assert_eq!(ReceiverConfig::load(&path).unwrap(), ReceiverConfig::default());
    }
}
