// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Controller configuration.

use crate::api::PacketMatch;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {err}")]
    Read { path: String, err: std::io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How much of a packet's match goes into a flow installed for it.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FlowGranularity {
    /// Every field of the packet's match.
    #[default]
    Exact,

    /// Only the ingress port, Ethernet type, IP endpoints and tunnel
    /// id. One flow then covers every transport conversation between
    /// two hosts.
    Wildcarded,
}

impl FlowGranularity {
    /// The match a flow of this granularity is installed under for a
    /// packet that matched `m`.
    pub fn apply(self, m: &PacketMatch) -> PacketMatch {
        match self {
            Self::Exact => m.clone(),
            Self::Wildcarded => m.l3_only(),
        }
    }
}

/// The [`FlowGranularity`] for each class of flow the controller
/// installs on behalf of a routing decision.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct GranularityCfg {
    /// Drop flows for packets routing decided to discard without
    /// an ICMP error.
    pub blackhole: FlowGranularity,

    /// Flows forwarding to a local port once the next hop resolved.
    pub forward: FlowGranularity,

    /// Flows sending traffic toward a tunnel peer, and flows
    /// delivering traffic that arrived over a tunnel.
    pub tunnel: FlowGranularity,
}

/// The configuration of a single controller instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// The datapath this controller manages.
    pub datapath_id: u64,

    /// The address other controllers use to reach this one over a
    /// tunnel. Port-set fan out never sends to it.
    pub local_tunnel_addr: Option<Ipv4Addr>,

    /// Idle timeout for forwarding flows.
    pub idle_flow_expire_secs: u16,

    /// Hard timeout for the short-lived drop flows installed when a
    /// packet cannot be delivered.
    pub icmp_expiry_secs: u16,

    /// The lease time handed out by DHCP.
    pub dhcp_lease_secs: u32,

    pub flow_priority: u16,

    pub service_flow_priority: u16,

    /// Depth of the request channel feeding the controller task.
    pub channel_depth: usize,

    /// A slog level name: "trace", "debug", "info", "warn", "error"
    /// or "critical".
    pub log_level: String,

    pub granularity: GranularityCfg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datapath_id: 0,
            local_tunnel_addr: None,
            idle_flow_expire_secs: 60,
            icmp_expiry_secs: 5,
            dhcp_lease_secs: 86400,
            flow_priority: 0,
            service_flow_priority: 1,
            channel_depth: 1024,
            log_level: "info".to_string(),
            granularity: GranularityCfg::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Read { path: path.display().to_string(), err }
        })?;
        Self::from_toml_str(&s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_depth == 0 {
            return Err(ConfigError::Invalid(
                "channel_depth must be non-zero".to_string(),
            ));
        }

        if self.log_level.parse::<slog::Level>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level: {}",
                self.log_level
            )));
        }

        Ok(())
    }
}
