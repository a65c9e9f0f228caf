use bitflags::bitflags;

use crate::att::Uuid;

/// Generic Attribute Profile service.
pub const GATT_SERVICE: Uuid = Uuid::Uuid16(0x1801);
/// Service Changed characteristic ([Vol 3] Part G, Section 7.1).
pub const SERVICE_CHANGED: Uuid = Uuid::Uuid16(0x2A05);

/// Characteristic descriptor types ([Vol 3] Part G, Section 3.3.3).
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u16)]
pub enum Descriptor {
    ExtendedProperties = 0x2900,
    UserDescription = 0x2901,
    ClientConfiguration = 0x2902,
    ServerConfiguration = 0x2903,
    PresentationFormat = 0x2904,
    AggregateFormat = 0x2905,
    ValidRange = 0x2906,
}

impl Descriptor {
    /// Returns the descriptor type of `u` or [`None`] if `u` is not one of the
    /// descriptors handled by the server.
    #[inline]
    #[must_use]
    pub fn of(u: Uuid) -> Option<Self> {
        u.as_u16().and_then(|v| Self::try_from(v).ok())
    }

    /// Returns the descriptor UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        Uuid::Uuid16(self as u16)
    }

    /// Returns whether the descriptor value is defined by the server and can
    /// never be written by a client.
    #[inline]
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::ExtendedProperties
                | Self::PresentationFormat
                | Self::AggregateFormat
                | Self::ValidRange
        )
    }

    /// Returns whether the descriptor holds a 2-byte configuration value.
    #[inline]
    #[must_use]
    pub const fn is_config(self) -> bool {
        matches!(self, Self::ClientConfiguration | Self::ServerConfiguration)
    }
}

crate::impl_display_via_debug! { Descriptor }

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(
        Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    pub struct CharProps: u8 {
        /// Permits broadcasts of the Characteristic Value using Server
        /// Characteristic Configuration Descriptor.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permit writes of the Characteristic Value without response.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Additional characteristic properties are defined in the
        /// Characteristic Extended Properties Descriptor.
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified.
        const NOTIFY = 1 << 0;
        /// The Characteristic Value shall be indicated.
        const INDICATE = 1 << 1;
    }
}

/// Security requirement of a client operation.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
)]
pub enum AuthReq {
    /// No security requirement.
    #[default]
    None,
    /// Encryption with an unauthenticated key.
    NoMitm,
    /// Encryption with an authenticated key.
    Mitm,
    /// Data signing with an unauthenticated key.
    SignedNoMitm,
    /// Data signing with an authenticated key.
    SignedMitm,
}

impl AuthReq {
    /// Returns whether the requirement calls for an authenticated key.
    #[inline]
    #[must_use]
    pub const fn is_mitm(self) -> bool {
        matches!(self, Self::Mitm | Self::SignedMitm)
    }

    /// Returns whether the requirement allows data signing.
    #[inline]
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::SignedNoMitm | Self::SignedMitm)
    }
}
