use std::time::Duration;

use serde::Deserialize;

use crate::error::{NodeError, Result};

/// A node's full configuration surface, TOML-sourced. Every field has a
/// sane default so a node can start with an empty/partial file during
/// local development.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server_id: String,
    pub service_id: ServiceKind,
    pub bind_endpoint: String,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutsConfig,
    pub pools: PoolsConfig,
    pub game_loop: GameLoopConfig,
    pub registry: Vec<NodeEntry>,
    pub authenticate_message_id: String,
    /// `stageType` to join when a client authenticates, since the client
    /// wire format carries only `stageId`. Falls back to the sole
    /// registered `StageHandler` when left empty and exactly one is
    /// registered (see DESIGN.md).
    pub default_stage_type: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "play-1".to_string(),
            service_id: ServiceKind::Play,
            bind_endpoint: "0.0.0.0:9000".to_string(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            pools: PoolsConfig::default(),
            game_loop: GameLoopConfig::default(),
            registry: Vec::new(),
            authenticate_message_id: "Authenticate".to_string(),
            default_stage_type: String::new(),
        }
    }
}

/// Mirrors `protocol::ServiceId` but is its own type so config files don't
/// need to spell out the wire-level numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Play,
    Api,
}

impl From<ServiceKind> for protocol::ServiceId {
    fn from(value: ServiceKind) -> Self {
        match value {
            ServiceKind::Play => protocol::ServiceId::Play,
            ServiceKind::Api => protocol::ServiceId::Api,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub tcp_port: Option<u16>,
    pub tcp_tls_port: Option<u16>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub websocket_path: String,
    pub mesh_port: u16,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_port: Some(9100),
            tcp_tls_port: None,
            http_port: None,
            https_port: None,
            websocket_path: "/ws".to_string(),
            mesh_port: 9000,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_packet_size: usize,
    pub max_pending_requests_per_session: usize,
    pub send_queue_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: protocol::MAX_FRAME_BODY_BYTES,
            max_pending_requests_per_session: 1024,
            send_queue_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub actor_paused_window_ms: u64,
    pub session_close_grace_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            actor_paused_window_ms: 300_000,
            session_close_grace_ms: 200,
        }
    }
}

impl TimeoutsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn actor_paused_window(&self) -> Duration {
        Duration::from_millis(self.actor_paused_window_ms)
    }

    pub fn session_close_grace(&self) -> Duration {
        Duration::from_millis(self.session_close_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub io_pool_concurrency: usize,
    /// `0` means "use the host's available parallelism".
    pub compute_pool_concurrency: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            io_pool_concurrency: 100,
            compute_pool_concurrency: 0,
        }
    }
}

impl PoolsConfig {
    pub fn resolved_compute_concurrency(&self) -> usize {
        if self.compute_pool_concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.compute_pool_concurrency
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GameLoopConfig {
    pub max_accumulator_cap_ms: u64,
    pub timestep_min_ms: u64,
    pub timestep_max_ms: u64,
}

impl Default for GameLoopConfig {
    fn default() -> Self {
        Self {
            max_accumulator_cap_ms: 200,
            timestep_min_ms: 1,
            timestep_max_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub service_id: ServiceKind,
    pub server_id: String,
    pub endpoint: String,
}

impl NodeConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(NodeError::Io)?;
        toml::from_str(&raw).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn node_id(&self) -> protocol::NodeId {
        protocol::NodeId::new(self.service_id.into(), self.server_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = NodeConfig::default();
        assert_eq!(config.limits.max_packet_size, protocol::MAX_FRAME_BODY_BYTES);
        assert_eq!(config.pools.resolved_compute_concurrency() > 0, true);
    }

    #[test]
    fn parse_toml_node_config() {
        let toml_src = r#"
            server_id = "play-7"
            service_id = "play"
            bind_endpoint = "0.0.0.0:9000"
            authenticate_message_id = "Authenticate"

            [transport]
            tcp_port = 9100
            websocket_path = "/ws"
            mesh_port = 9000

            [[registry]]
            service_id = "api"
            server_id = "api-1"
            endpoint = "127.0.0.1:9200"
        "#;
        let config: NodeConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server_id, "play-7");
        assert_eq!(config.registry.len(), 1);
        assert_eq!(config.registry[0].server_id, "api-1");
    }
}
