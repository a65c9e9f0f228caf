//! Generic Attribute Profile ([Vol 3] Part G).
//!
//! [`Gatt`] owns the attribute database, the registered applications, and the
//! server and client state of every connected link. All entry points process
//! their input and any work it generates to completion before returning.

pub use {client::*, config::*, consts::*, db::*, engine::*, host::*, sec::*};

use crate::att::{ErrorCode, ErrorRsp};

mod builtin;
mod client;
mod config;
mod consts;
mod db;
mod engine;
mod host;
mod rsp;
mod sec;
mod server;
mod tcb;
#[cfg(test)]
mod testing;

/// Error type returned by the GATT API.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("insufficient resources")]
    NoResources,
    #[error("another operation is in progress")]
    Busy,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("link is not connected")]
    NotConnected,
    #[error("unknown application")]
    UnknownApp,
    #[error("response timeout")]
    Timeout,
    #[error("link disconnected")]
    Disconnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Att(#[from] ErrorRsp),
    #[error("operation failed with {0}")]
    Status(ErrorCode),
    #[error("transport error")]
    Transport,
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Link identifier assigned by the transport.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnId(pub u16);

/// Registered application identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct AppId(pub(crate) u8);

/// Server transaction identifier. Requests that expect an answer from the
/// application carry a non-zero id, which must be passed back to
/// [`Gatt::submit_response`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TransId(pub(crate) u32);

impl TransId {
    /// Id used for requests that are not answered, such as an MTU update.
    pub const NONE: Self = Self(0);

    /// Largest id before wrapping.
    const MAX: u32 = 0x0FFF_FFFF;

    /// Returns the id following `self`. Ids are never zero.
    #[inline]
    #[must_use]
    pub(crate) const fn next(self) -> Self {
        Self(self.0 % Self::MAX + 1)
    }
}

crate::impl_display_via_debug! { ConnId, AppId, TransId }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trans_id_wrap() {
        assert_eq!(TransId::NONE.next(), TransId(1));
        assert_eq!(TransId(TransId::MAX - 1).next(), TransId(TransId::MAX));
        assert_eq!(TransId(TransId::MAX).next(), TransId(1));
    }

    #[test]
    fn error_display() {
        let e = Error::from(ErrorRsp::new(0x0A, None, ErrorCode::ReadNotPermitted));
        assert!(matches!(e, Error::Att(_)));
        assert_eq!(
            Error::Status(ErrorCode::InvalidOffset).to_string(),
            "operation failed with InvalidOffset"
        );
    }
}
