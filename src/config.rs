//! Process configuration. Layered TOML + environment loading via the
//! `config` crate (`config = { features = ["toml"] }`). Field names mirror
//! the external interface settings so they read the same in code and on
//! disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// (De)serializes a `Duration` as plain milliseconds rather than serde's
/// native `{secs, nanos}` struct form, so every millisecond field reads as a
/// single integer both on disk and through the defaults layer `Settings::load`
/// round-trips through the `config` crate.
mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// listen address -> frequency plan ID.
    pub listeners: HashMap<String, String>,
    pub packet_handlers: usize,
    pub packet_buffer: usize,
    #[serde(with = "millis")]
    pub downlink_path_expires_ms: Duration,
    #[serde(with = "millis")]
    pub connection_expires_ms: Duration,
    #[serde(with = "millis")]
    pub schedule_late_time_ms: Duration,
    #[serde(with = "millis")]
    pub addr_change_block_ms: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        let mut listeners = HashMap::new();
        listeners.insert("0.0.0.0:1700".to_string(), gs_core::frequency_plan::EU_863_870.to_string());
        Self {
            listeners,
            packet_handlers: 4,
            packet_buffer: 64,
            downlink_path_expires_ms: Duration::from_secs(60),
            connection_expires_ms: Duration::from_secs(300),
            schedule_late_time_ms: Duration::from_millis(200),
            addr_change_block_ms: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicStationConfig {
    pub listen: String,
    #[serde(with = "millis")]
    pub ws_ping_interval_ms: Duration,
}

impl Default for BasicStationConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0:1887".to_string(), ws_ping_interval_ms: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub listen: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0:1882".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcConfig {
    pub listen: String,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0:9187".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub require_registered_gateways: bool,
    #[serde(with = "millis")]
    pub update_gateway_location_debounce_ms: Duration,
    #[serde(with = "millis")]
    pub update_connection_stats_debounce_ms: Duration,
    pub udp: UdpConfig,
    pub basic_station: BasicStationConfig,
    pub mqtt: MqttConfig,
    pub grpc: GrpcConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            require_registered_gateways: false,
            update_gateway_location_debounce_ms: Duration::from_secs(60),
            update_connection_stats_debounce_ms: Duration::from_secs(30),
            udp: UdpConfig::default(),
            basic_station: BasicStationConfig::default(),
            mqtt: MqttConfig::default(),
            grpc: GrpcConfig::default(),
        }
    }
}

impl Settings {
    /// Loads layered configuration: built-in defaults, then an optional
    /// TOML file, then `GS_`-prefixed environment overrides — the same
    /// three-layer order the `config` crate's typical `ConfigBuilder` chain
    /// expresses.
    pub fn load(path: Option<&str>) -> crate::error::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("GS").separator("__"));
        let config = builder.build().map_err(|e| crate::error::Error::InvalidArgument(e.to_string()))?;
        config.try_deserialize().map_err(|e| crate::error::Error::InvalidArgument(e.to_string()))
    }

    pub fn udp_listener_addrs(&self) -> Vec<(SocketAddr, String)> {
        self.udp
            .listeners
            .iter()
            .filter_map(|(addr, plan)| addr.parse().ok().map(|a| (a, plan.clone())))
            .collect()
    }
}

impl From<config::ConfigError> for crate::error::Error {
    fn from(e: config::ConfigError) -> Self {
        crate::error::Error::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let settings = Settings::load(None).unwrap();
        assert!(!settings.require_registered_gateways);
        assert_eq!(settings.grpc.listen, "0.0.0.0:9187");
    }
}
