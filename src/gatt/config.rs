use std::time::Duration;

use crate::att::{DEFAULT_MTU, MAX_MTU};

/// GATT engine configuration.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Largest ATT_MTU accepted in an MTU exchange.
    pub max_mtu: u16,
    /// Maximum number of registered applications.
    pub max_apps: usize,
    /// Maximum number of services in the database.
    pub max_services: usize,
    /// Maximum number of queued prepare write entries per link.
    pub max_prep_entries: usize,
    /// Maximum number of handles in a Read Multiple request.
    pub max_read_multi_handles: usize,
    /// Maximum length of a value assembled by a client long read.
    pub max_attr_len: usize,
    /// Timeout for a peer response to a client request, and for the peer
    /// confirmation of a server indication.
    pub rsp_timeout: Duration,
    /// Client response timeout for discovery procedures.
    pub disc_rsp_timeout: Duration,
    /// Time allowed for applications to confirm a received indication.
    pub ind_ack_timeout: Duration,
    /// Number of times discover-all-services is retried after a timeout.
    pub retry_limit: u8,
    /// Whether the built-in GATT service is registered.
    pub gatt_service: bool,
}

impl Config {
    /// Clamps a requested MTU into the supported range.
    #[inline]
    #[must_use]
    pub fn clamp_mtu(&self, mtu: u16) -> u16 {
        mtu.clamp(DEFAULT_MTU, self.max_mtu.max(DEFAULT_MTU))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_mtu: MAX_MTU,
            max_apps: 8,
            max_services: 64,
            max_prep_entries: 64,
            max_read_multi_handles: 10,
            max_attr_len: 600,
            rsp_timeout: Duration::from_secs(30),
            disc_rsp_timeout: Duration::from_secs(15),
            ind_ack_timeout: Duration::from_secs(5),
            retry_limit: 2,
            gatt_service: true,
        }
    }
}
