//! # ccm-proto
//!
//! Protocol types, constants, and data structures for the consensus
//! cluster membership (CCM) service.
//!
//! This crate defines the wire messages, the node directory, the
//! membership bitmap codec, error types, and the tunable defaults shared
//! by all CCM components.

pub mod bitmap;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod message;
pub mod node;

// Re-export commonly used types at the crate root
pub use bitmap::NodeBitmap;
pub use error::{CcmError, CcmResult};
pub use message::{CcmMessage, CcmPayload};
pub use node::{DirNode, NodeDirectory, NodeStatus};
