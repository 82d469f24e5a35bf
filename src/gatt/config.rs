use std::time::Duration;

use crate::att::{MAX_MTU, MIN_MTU};

/// Engine configuration. Missing fields take their default values when
/// deserialized.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of registered applications (at most 63).
    pub max_apps: usize,
    /// Maximum number of concurrent links (at most 255).
    pub max_links: usize,
    /// Maximum number of outstanding client operations across all links.
    pub max_client_ops: usize,
    /// Maximum number of peers in the background connection directory.
    pub max_bg_conns: usize,
    /// Capacity of the per-link client request queue.
    pub max_queued_cmds: usize,
    /// Fixed start handle of the GATT service.
    pub gatt_start: u16,
    /// Fixed start handle of the GAP service.
    pub gap_start: u16,
    /// Lowest start handle assigned to application services.
    pub app_start: u16,
    /// ATT transaction timeout ([Vol 3] Part F, Section 3.3.3).
    pub rsp_timeout: Duration,
    /// Time to wait for the peer to confirm an indication.
    pub conf_timeout: Duration,
    /// Time applications have to confirm a received indication.
    pub ind_ack_timeout: Duration,
    /// Number of times primary service discovery is retried on timeout.
    pub disc_retry_limit: u8,
    /// `ATT_MTU` of a new link.
    pub default_mtu: u16,
    /// Largest `ATT_MTU` offered or accepted during MTU exchange.
    pub max_mtu: u16,
    /// Whether the engine defines the GATT service with the Service Changed
    /// characteristic.
    pub builtin_gatt_service: bool,
}

impl Config {
    /// Largest number of applications supported by the link holder bitset.
    pub const MAX_APPS: usize = 63;
    /// Largest number of links addressable by a connection identifier.
    pub const MAX_LINKS: usize = 255;

    /// Returns a copy of the configuration with all limits clamped to the
    /// supported ranges.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.max_apps = self.max_apps.clamp(1, Self::MAX_APPS);
        self.max_links = self.max_links.clamp(1, Self::MAX_LINKS);
        self.max_client_ops = self.max_client_ops.max(1);
        self.max_queued_cmds = self.max_queued_cmds.max(1);
        self.default_mtu = self.default_mtu.clamp(MIN_MTU, MAX_MTU);
        self.max_mtu = self.max_mtu.clamp(self.default_mtu, MAX_MTU);
        self.app_start = self.app_start.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_apps: 32,
            max_links: 16,
            max_client_ops: 32,
            max_bg_conns: 16,
            max_queued_cmds: 30,
            gatt_start: 0x0001,
            gap_start: 0x0014,
            app_start: 0x0028,
            rsp_timeout: Duration::from_secs(30),
            conf_timeout: Duration::from_secs(30),
            ind_ack_timeout: Duration::from_secs(5),
            disc_retry_limit: 2,
            default_mtu: MIN_MTU,
            max_mtu: MAX_MTU,
            builtin_gatt_service: true,
        }
    }
}
