//! Stream layer configuration.
//!
//! Tunables for buffering, receive windows, and the reordering guard. The
//! per-stream credits and stream-count limits themselves come from transport
//! parameters; these settings control how the local endpoint uses them.

use serde::{Deserialize, Serialize};

/// Order in which ready streams are drained into packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyPolicy {
    /// Serve each ready stream in turn. Spreads bandwidth across many
    /// short-lived streams.
    RoundRobin,

    /// Always serve the lowest ready stream id first, so older streams
    /// finish before newer ones make progress.
    LowestIdFirst,
}

impl std::fmt::Display for ReadyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyPolicy::RoundRobin => write!(f, "round_robin"),
            ReadyPolicy::LowestIdFirst => write!(f, "lowest_id_first"),
        }
    }
}

/// Per-connection stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Bytes a writer may buffer on one stream before it is told to wait.
    ///
    /// Default: 64 KiB
    pub send_buffer_size: u64,

    /// Receive window granted to the peer on each stream, used when
    /// extending MAX_STREAM_DATA as the reader consumes data.
    ///
    /// Default: 1 MiB
    pub receive_window: u64,

    /// Out-of-order fragment count above which the fragmentation guard
    /// starts checking the average fragment size.
    ///
    /// Default: 1024
    pub max_out_of_order_fragments: usize,

    /// Average buffered fragment size below which a peer is considered to
    /// be fragmenting on purpose.
    ///
    /// Default: 64 bytes
    pub min_average_fragment_size: u64,

    /// Ready-set policy. `None` picks by role: round robin for clients,
    /// lowest id first for servers.
    pub ready_policy: Option<ReadyPolicy>,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 64 * 1024,
            receive_window: 1024 * 1024,
            max_out_of_order_fragments: 1024,
            min_average_fragment_size: 64,
            ready_policy: None,
        }
    }
}

impl StreamsConfig {
    /// Validate stream configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.send_buffer_size == 0 {
            errors.push("send_buffer_size must be > 0".to_string());
        }

        if self.receive_window == 0 {
            errors.push("receive_window must be > 0".to_string());
        }
        if self.receive_window > crate::types::VARINT_MAX {
            errors.push(format!(
                "receive_window must fit in a varint, got {}",
                self.receive_window
            ));
        }

        if self.max_out_of_order_fragments == 0 {
            errors.push("max_out_of_order_fragments must be > 0".to_string());
        }

        if self.send_buffer_size > 64 * 1024 * 1024 {
            tracing::warn!(
                size = self.send_buffer_size,
                "send_buffer_size is very large, may use excessive memory"
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The ready-set policy for an endpoint of the given role.
    pub fn ready_policy_for(&self, is_client: bool) -> ReadyPolicy {
        self.ready_policy.unwrap_or(if is_client {
            ReadyPolicy::RoundRobin
        } else {
            ReadyPolicy::LowestIdFirst
        })
    }
}
