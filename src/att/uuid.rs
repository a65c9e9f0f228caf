use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use structbuf::Unpacker;

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_32: u128 = !((u32::MAX as u128) << SHIFT);

/// 16-, 32-, or 128-bit UUID ([Vol 3] Part B, Section 2.5.1).
///
/// Values are compared after expansion to 128 bits, so `Uuid16(0x2800)` equals
/// the 128-bit form of the same SIG UUID.
#[derive(Clone, Copy, serde::Deserialize, serde::Serialize)]
pub enum Uuid {
    Uuid16(u16),
    Uuid32(u32),
    Uuid128(u128),
}

impl Uuid {
    /// Primary Service declaration type.
    pub const PRIMARY_SERVICE: Self = Self::Uuid16(0x2800);
    /// Secondary Service declaration type.
    pub const SECONDARY_SERVICE: Self = Self::Uuid16(0x2801);
    /// Include declaration type.
    pub const INCLUDE: Self = Self::Uuid16(0x2802);
    /// Characteristic declaration type.
    pub const CHARACTERISTIC: Self = Self::Uuid16(0x2803);

    /// Returns the UUID in its shortest form. 128-bit values built on the SIG
    /// base are reduced to 16 or 32 bits.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn shorten(self) -> Self {
        let v = self.as_u128();
        if v & MASK_32 == BASE {
            let short = (v >> SHIFT) as u32;
            if short <= u16::MAX as u32 {
                Self::Uuid16(short as u16)
            } else {
                Self::Uuid32(short)
            }
        } else {
            Self::Uuid128(v)
        }
    }

    /// Returns the 128-bit representation.
    #[inline]
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        match self {
            Self::Uuid16(v) => (v as u128) << SHIFT | BASE,
            Self::Uuid32(v) => (v as u128) << SHIFT | BASE,
            Self::Uuid128(v) => v,
        }
    }

    /// Returns the 16-bit value if this is an assigned 16-bit SIG UUID.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> Option<u16> {
        match self.shorten() {
            Self::Uuid16(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the number of bytes used to encode the UUID in a PDU. 32-bit
    /// UUIDs are always sent as 128-bit values ([Vol 3] Part F, Section 3.2.1).
    #[inline]
    #[must_use]
    pub const fn wire_len(self) -> usize {
        if self.as_u16().is_some() {
            2
        } else {
            16
        }
    }

    /// Returns whether this is a 16-bit UUID on the wire.
    #[inline]
    #[must_use]
    pub const fn is_16(self) -> bool {
        self.wire_len() == 2
    }

    /// Returns the little-endian wire encoding (2 or 16 bytes).
    #[must_use]
    pub fn to_bytes(self) -> smallvec::SmallVec<[u8; 16]> {
        match self.as_u16() {
            Some(v) => smallvec::SmallVec::from_slice(&v.to_le_bytes()),
            None => smallvec::SmallVec::from_slice(&self.as_u128().to_le_bytes()),
        }
    }

    /// Decodes a 2-, 4- or 16-byte little-endian UUID. Returns `None` for other
    /// lengths.
    #[must_use]
    pub fn from_le_bytes(v: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(v);
        match v.len() {
            2 => Some(Self::Uuid16(p.u16())),
            4 => Some(Self::Uuid32(p.u32())),
            16 => Some(Self::Uuid128(p.u128()).shorten()),
            _ => None,
        }
    }
}

impl PartialEq for Uuid {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_u128() == other.as_u128()
    }
}

impl Eq for Uuid {}

impl PartialOrd for Uuid {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uuid {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_u128().cmp(&other.as_u128())
    }
}

impl Hash for Uuid {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_u128().hash(state);
    }
}

impl From<u16> for Uuid {
    #[inline]
    fn from(v: u16) -> Self {
        Self::Uuid16(v)
    }
}

impl From<u32> for Uuid {
    #[inline]
    fn from(v: u32) -> Self {
        Self::Uuid32(v)
    }
}

impl From<u128> for Uuid {
    #[inline]
    fn from(v: u128) -> Self {
        Self::Uuid128(v)
    }
}

impl Debug for Uuid {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.shorten() {
            Self::Uuid16(v) => write!(f, "{v:#06X}"),
            Self::Uuid32(v) => write!(f, "{v:#010X}"),
            Self::Uuid128(v) => write!(
                f,
                "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                (v & ((1 << 48) - 1)) as u64
            ),
        }
    }
}

impl Display for Uuid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
