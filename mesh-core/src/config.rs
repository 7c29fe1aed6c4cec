//! Engine tunables. Hosts embed this in their own config (e.g. a `[mesh]` table).

use std::ops::Range;
use std::time::Duration;

use serde::Deserialize;

/// Default service id advertised and discovered on.
pub const DEFAULT_SERVICE_ID: &str = "me.danlowe.meshcommunicator";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Service id shared by all peers of this application.
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// How long a send waits for the transport's transfer result.
    #[serde(default = "default_delivery_wait_ms")]
    pub delivery_wait_ms: u64,
    /// Overall budget for one outbound connect procedure.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Inbound payloads buffered before the oldest are dropped.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

fn default_service_id() -> String {
    DEFAULT_SERVICE_ID.to_owned()
}
fn default_delivery_wait_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_backoff_min_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    1_000
}
fn default_inbound_buffer() -> usize {
    100
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            delivery_wait_ms: default_delivery_wait_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl MeshConfig {
    pub fn delivery_wait(&self) -> Duration {
        Duration::from_millis(self.delivery_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff range in ms, never empty.
    pub fn backoff_range(&self) -> Range<u64> {
        let low = self.backoff_min_ms.min(u64::MAX - 1);
        let high = self.backoff_max_ms.max(low.saturating_add(1));
        low..high
    }
}
