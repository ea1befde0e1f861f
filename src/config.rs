//! Configuration for the pieces of this crate that have more than a
//! couple of knobs: the HTTP gateway's request limits, mirroring the
//! shape of the teacher's `TransportConfig` (`src/ipc/mod.rs`) — buffer
//! sizes and timeouts — loaded via `serde` rather than the teacher's
//! `clap`-driven `Args` (a CLI front-end is out of scope). Binding a
//! listener to a host/port is itself out of scope (spec.md's "event
//! loop" is an excluded collaborator); every field here is consulted by
//! [`crate::gateway::Trigger`] regardless.
//! [`crate::ic::ChannelConfig`] covers the IC channel side and lives
//! next to the channel it configures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Gateway-wide settings (spec.md §4.7): how large a query it accepts,
/// how long a request may run, and whether it accepts compressed
/// request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Upper bound on a request body's size, independent of any
    /// per-trigger `max_query_size` (spec.md §4.7 "max query size").
    pub max_body_size: usize,
    /// How long a single request may take end to end, including any
    /// proxied/deferred dispatch it waits on.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Whether to accept `Content-Encoding: gzip|deflate` request
    /// bodies in addition to negotiating compressed responses.
    pub accept_compressed_requests: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_body_size: 4 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            accept_compressed_requests: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_config_is_sane() {
        let cfg = GatewayConfig::default();
        assert!(cfg.max_body_size > 0);
        assert!(cfg.accept_compressed_requests);
    }

    #[test]
    fn gateway_config_roundtrips_through_json() {
        let cfg = GatewayConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_body_size, cfg.max_body_size);
        assert_eq!(back.request_timeout, cfg.request_timeout);
    }
}
