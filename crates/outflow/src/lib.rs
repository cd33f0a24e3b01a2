//! # outflow
//!
//! Live network output stage for an encoded audio/video pipeline.
//!
//! Accepts a continuous stream of encoded packets and delivers them over one
//! persistent outbound connection. The backlog is bounded by a priority-aware
//! drop policy that never touches audio or keyframes, and the encoder bitrate
//! follows the observed capacity of the link.
//!
//! ## Crate structure
//!
//! - [`packet`]: Outbound packets, drop priorities, framing header
//! - [`buffer`]: Ordered store of pending packets
//! - [`drop_policy`]: Bounded-delay admission and drop passes
//! - [`estimator`]: Rolling strain / throughput windows
//! - [`bitrate`]: Closed-loop encoder bitrate control
//! - [`session`]: Connection state machine and worker threads
//! - [`socket_writer`]: Optional buffered, non-blocking socket writer
//! - [`transport`], [`serializer`], [`encoder`]: External collaborator seams
//! - [`config`]: TOML configuration
//! - [`stats`], [`metrics`]: Stats snapshot and Prometheus export

pub mod bitrate;
pub mod buffer;
pub mod config;
pub mod drop_policy;
pub mod encoder;
pub mod error;
pub mod estimator;
pub mod metrics;
pub mod packet;
pub mod serializer;
pub mod session;
pub mod shutdown;
pub mod socket_writer;
pub mod stats;
pub mod transport;

pub use config::OutputConfig;
pub use error::OutputError;
pub use packet::{DropPriority, MediaKind, OutboundPacket};
pub use session::{ConnectionState, OutputEvent, OutputSession, SendOutcome};
