//! Blackrock Bluetooth LE ATT/GATT protocol engine.
//!
//! A transport-agnostic implementation of the Attribute Protocol and Generic
//! Attribute Profile server and client procedures. The link layer, security
//! manager, and timer service are provided by the host through the traits in
//! [`gatt`].

pub mod att;
pub mod gatt;
#[cfg(feature = "tokio")]
pub mod rt;

mod util;
