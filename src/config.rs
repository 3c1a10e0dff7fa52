use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub tracking: TrackingConfig,
    pub map: MapConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String, // Address the /api/ip proxy listens on
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServicesConfig {
    pub ip_echo_url: String,
    pub ip_echo_timeout_secs: u64,
    pub geolocation_url: String, // The IP is appended as a path segment
    pub geolocation_timeout_secs: u64,
    pub geolocation_fields: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackingConfig {
    pub gpsd_addr: Option<String>, // No address means no device location
    pub high_accuracy: bool,
    pub timeout_secs: u64,
    pub maximum_age_secs: u64,
    pub history_len: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MapConfig {
    pub zoom: f64,
    pub fly_duration_ms: u64,
    pub marker_glyph: String,
    pub marker_retina_glyph: String,
    pub marker_shadow_glyph: String,
    pub marker_anchor: (u16, u16), // Glyph cell over the point: (col, row)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind: "127.0.0.1:3000".to_string(),
            },
            services: ServicesConfig {
                ip_echo_url: "https://api.ipify.org?format=json".to_string(),
                ip_echo_timeout_secs: 5,
                geolocation_url: "http://ip-api.com/json".to_string(),
                geolocation_timeout_secs: 10,
                geolocation_fields:
                    "status,message,country,regionName,city,zip,lat,lon,query,isp,org".to_string(),
            },
            tracking: TrackingConfig {
                gpsd_addr: Some("127.0.0.1:2947".to_string()),
                high_accuracy: true,
                timeout_secs: 30,
                maximum_age_secs: 0,
                history_len: 20,
            },
            map: MapConfig {
                zoom: 15.0,
                fly_duration_ms: 2000,
                marker_glyph: "📍".to_string(),
                marker_retina_glyph: "⌖".to_string(),
                marker_shadow_glyph: "·".to_string(),
                marker_anchor: (0, 1),
            },
        }
    }
}

impl ServicesConfig {
    pub fn ip_echo_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_echo_timeout_secs)
    }

    pub fn geolocation_timeout(&self) -> Duration {
        Duration::from_secs(self.geolocation_timeout_secs)
    }
}

impl Config {
    /// Loads the TOML config at `config_path`.
    /// If it doesn't exist, creates a default one.
    pub fn load_from(config_path: impl AsRef<Path>) -> Self {
        let config_path = config_path.as_ref();

        if let Ok(content) = fs::read_to_string(config_path) {
            match toml::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    // Keep the user's broken file around instead of overwriting it
                    warn!(
                        "Failed to parse {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    return Config::default();
                }
            }
        }

        let default_config = Config::default();

        // Save default config to disk for the user to edit later
        match toml::to_string_pretty(&default_config) {
            Ok(toml_string) => {
                if fs::write(config_path, toml_string).is_err() {
                    warn!("Could not write default {} to disk.", config_path.display());
                }
            }
            Err(e) => warn!("Could not serialize default config: {}", e),
        }

        info!("Loaded default configuration.");
        default_config
    }
}
