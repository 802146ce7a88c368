//! Core types shared across the link layers.
//!
//! - [`Frame`] is the decoded unit of wire traffic, tagged with a [`TopicId`]
//!   and a [`FrameKind`]
//! - [`Telemetry`] is what subscribers receive
//! - [`QueueState`] / [`QueueStatus`] describe the robot's command queue
//! - [`LinkState`] tracks the connection lifecycle

mod frame;
mod link_state;
mod queue;

pub use frame::{Frame, FrameKind, Telemetry, TopicId};
pub use link_state::LinkState;
pub use queue::{QueueState, QueueStatus, ROBOT_STATUS_MIN_LEN};
