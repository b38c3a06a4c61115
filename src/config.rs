//! Connection configuration.
//!
//! # Example
//!
//! ```
//! use muxwire::MuxConfig;
//! use std::time::Duration;
//!
//! let config = MuxConfig::default()
//!     .packet_capacity(1024)
//!     .read_timeout(Duration::from_secs(10));
//!
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};
use crate::protocol::{DEFAULT_PACKET_CAPACITY, MAX_PACKET_CAPACITY, MAX_REQUEST_IDS};

/// Default packet pool capacity.
pub const DEFAULT_MAX_PACKETS: usize = 1000;

/// Default request-processor pool capacity (one per request ID).
pub const DEFAULT_MAX_REQUESTS: usize = MAX_REQUEST_IDS;

/// Default bound of the shared outbound queue.
pub const DEFAULT_WRITER_QUEUE_CAPACITY: usize = 500;

/// Default reader-queue get timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Default writer-queue put timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time a timed-out call keeps its request ID waiting for the reply.
pub const DEFAULT_LATE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound for one reassembled message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Tunables shared by client and server connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Payload capacity of one packet.
    pub packet_capacity: usize,
    /// Packets that may exist at once (in queues, in flight, being filled).
    pub max_packets: usize,
    /// Calls that may be in flight at once.
    pub max_requests: usize,
    /// Bound of the outbound queue feeding the writer task.
    pub writer_queue_capacity: usize,
    /// How long a read waits for the next inbound packet.
    pub read_timeout: Duration,
    /// How long a write waits for queue space or a free packet.
    pub write_timeout: Duration,
    /// Deadline for a whole client call, if any.
    pub call_timeout: Option<Duration>,
    /// How long a call that timed out keeps its request ID reserved for the
    /// late response before the ID is reused.
    pub late_response_timeout: Duration,
    /// Largest logical message `read_to_end` will assemble.
    pub max_message_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            packet_capacity: DEFAULT_PACKET_CAPACITY,
            max_packets: DEFAULT_MAX_PACKETS,
            max_requests: DEFAULT_MAX_REQUESTS,
            writer_queue_capacity: DEFAULT_WRITER_QUEUE_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            call_timeout: None,
            late_response_timeout: DEFAULT_LATE_RESPONSE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl MuxConfig {
    pub fn packet_capacity(mut self, capacity: usize) -> Self {
        self.packet_capacity = capacity;
        self
    }

    pub fn max_packets(mut self, max: usize) -> Self {
        self.max_packets = max;
        self
    }

    pub fn max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    pub fn writer_queue_capacity(mut self, capacity: usize) -> Self {
        self.writer_queue_capacity = capacity;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn late_response_timeout(mut self, timeout: Duration) -> Self {
        self.late_response_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Reject values the transport cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.packet_capacity == 0 || self.packet_capacity > MAX_PACKET_CAPACITY {
            return Err(MuxError::InvalidConfig(format!(
                "packet_capacity must be in 1..={}, got {}",
                MAX_PACKET_CAPACITY, self.packet_capacity
            )));
        }
        if self.max_requests == 0 || self.max_requests > MAX_REQUEST_IDS {
            return Err(MuxError::InvalidConfig(format!(
                "max_requests must be in 1..={}, got {}",
                MAX_REQUEST_IDS, self.max_requests
            )));
        }
        // The reader loop holds one packet while a writer needs another.
        if self.max_packets < 2 {
            return Err(MuxError::InvalidConfig(format!(
                "max_packets must be at least 2, got {}",
                self.max_packets
            )));
        }
        if self.writer_queue_capacity == 0 {
            return Err(MuxError::InvalidConfig(
                "writer_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
