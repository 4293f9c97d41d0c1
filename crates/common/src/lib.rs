//! Common types, identity format, and envelope codec shared by the gateway and
//! its clients.

pub mod envelope;
pub mod error;
pub mod identity;
pub mod protocol;

pub use error::GatewayError;
pub use identity::{IdentityKey, IdentityKeypair};
