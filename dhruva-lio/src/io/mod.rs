//! Output infrastructure: messages and on-disk persistence.

pub mod messages;
pub mod pcd;
pub mod trajectory;

pub use messages::{FrameOutput, FrameTransform, OdometryMessage, PoseStamped};
