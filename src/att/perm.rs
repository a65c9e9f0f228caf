use super::*;

type Result<T> = std::result::Result<T, ErrorCode>;

bitflags::bitflags! {
    /// Attribute permissions ([Vol 3] Part F, Section 3.2.5). The upper four
    /// bits encode the minimum encryption key size.
    #[derive(
        Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    pub struct Perm: u16 {
        /// Read access.
        const READ = 1 << 0;
        /// Read access on an encrypted link.
        const READ_ENCRYPTED = 1 << 1;
        /// Read access on a link encrypted with an authenticated (MITM) key.
        const READ_ENC_MITM = 1 << 2;
        /// Write access.
        const WRITE = 1 << 4;
        /// Write access on an encrypted link.
        const WRITE_ENCRYPTED = 1 << 5;
        /// Write access on a link encrypted with an authenticated key.
        const WRITE_ENC_MITM = 1 << 6;
        /// Signed write access ([Vol 3] Part C, Section 10.2.2).
        const WRITE_SIGNED = 1 << 7;
        /// Signed write access with an authenticated signing key.
        const WRITE_SIGNED_MITM = 1 << 8;
        /// Read access requires authorization.
        const READ_AUTHORIZATION = 1 << 9;
        /// Write access requires authorization.
        const WRITE_AUTHORIZATION = 1 << 10;
        /// Minimum encryption key size mask.
        const KEY_SIZE = 0xF << 12;

        const READ_ALLOWED = Self::READ.bits()
            | Self::READ_ENCRYPTED.bits()
            | Self::READ_ENC_MITM.bits()
            | Self::READ_AUTHORIZATION.bits();
        const READ_ENC_REQUIRED = Self::READ_ENCRYPTED.bits() | Self::READ_ENC_MITM.bits();
        const WRITE_ALLOWED = Self::WRITE.bits()
            | Self::WRITE_ENCRYPTED.bits()
            | Self::WRITE_ENC_MITM.bits()
            | Self::WRITE_SIGNED.bits()
            | Self::WRITE_SIGNED_MITM.bits()
            | Self::WRITE_AUTHORIZATION.bits();
        const WRITE_AUTH_REQUIRED = Self::WRITE_ENCRYPTED.bits() | Self::WRITE_SIGNED.bits();
        const WRITE_MITM_REQUIRED = Self::WRITE_ENC_MITM.bits() | Self::WRITE_SIGNED_MITM.bits();
        const WRITE_ENC_REQUIRED = Self::WRITE_ENCRYPTED.bits() | Self::WRITE_ENC_MITM.bits();
        const WRITE_SIGNED_ANY = Self::WRITE_SIGNED.bits() | Self::WRITE_SIGNED_MITM.bits();
    }
}

bitflags::bitflags! {
    /// Current link security state as reported by the security manager.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct SecFlags: u8 {
        /// A link key (LTK) exists for the peer, authenticated or not.
        const KEY_KNOWN = 1 << 0;
        /// The link key was generated with MITM protection.
        const KEY_MITM = 1 << 1;
        /// The link is currently encrypted.
        const ENCRYPTED = 1 << 2;
        /// The peer has been authorized by the application.
        const AUTHORIZED = 1 << 3;
        /// A signing key (CSRK) exists for the peer.
        const SIGNING_KEY = 1 << 4;
    }
}

/// Link security snapshot used for permission checks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LinkSec {
    pub flags: SecFlags,
    /// Encryption key size in bytes (7-16) or 0 if not encrypted.
    pub key_size: u8,
}

impl LinkSec {
    /// Creates a new security snapshot.
    #[inline]
    #[must_use]
    pub const fn new(flags: SecFlags, key_size: u8) -> Self {
        Self { flags, key_size }
    }
}

impl Perm {
    /// Sets the minimum encryption key size in bytes (7-16). A size of 0
    /// clears the requirement.
    ///
    /// # Panics
    ///
    /// Panics if the key size is outside of the valid range.
    #[inline]
    #[must_use]
    pub const fn key_size(self, n: u8) -> Self {
        assert!(n == 0 || 7 <= n && n <= 16, "invalid encryption key size");
        let v = if n == 0 { 0 } else { (n as u16 - 6) << 12 };
        Self::from_bits_retain(self.difference(Self::KEY_SIZE).bits() | v)
    }

    /// Returns the minimum key size in bytes or 0 if not specified.
    #[inline]
    #[must_use]
    pub const fn min_key_size(self) -> u8 {
        match (self.bits() >> 12) & 0xF {
            0 => 0,
            #[allow(clippy::cast_possible_truncation)]
            n => n as u8 + 6,
        }
    }

    /// Tests whether a read is allowed under the current link security
    /// ([Vol 3] Part F, Section 4).
    pub fn check_read(self, sec: LinkSec) -> Result<()> {
        use ErrorCode::*;
        let f = sec.flags;
        if !self.intersects(Self::READ_ALLOWED) {
            return Err(ReadNotPermitted);
        }
        if self.contains(Self::READ_ENCRYPTED)
            && !f.intersects(SecFlags::KEY_KNOWN.union(SecFlags::ENCRYPTED))
        {
            return Err(InsufficientAuthentication);
        }
        if self.contains(Self::READ_ENC_MITM) && !f.contains(SecFlags::KEY_MITM) {
            return Err(InsufficientAuthentication);
        }
        if self.intersects(Self::READ_ENC_REQUIRED) {
            if !f.contains(SecFlags::ENCRYPTED) {
                return Err(InsufficientEncryption);
            }
            if sec.key_size < self.min_key_size() {
                return Err(EncryptionKeySizeTooShort);
            }
        }
        if self.contains(Self::READ_AUTHORIZATION)
            && !f.contains(SecFlags::KEY_MITM.union(SecFlags::AUTHORIZED))
        {
            return Err(InsufficientAuthorization);
        }
        Ok(())
    }

    /// Tests whether a write is allowed under the current link security.
    /// Attribute type and length rules are checked by the database.
    pub fn check_write(self, op: Opcode, sec: LinkSec) -> Result<()> {
        use ErrorCode::*;
        let f = sec.flags;
        let mut perm = self;
        // Mixed security mode rules ([Vol 3] Part C, Section 10.2.3)
        if matches!(op, Opcode::WriteCmd | Opcode::WriteReq)
            && perm.intersects(Self::WRITE_SIGNED_ANY)
        {
            if perm.contains(Self::WRITE_SIGNED) && perm.contains(Self::WRITE_ENCRYPTED) {
                perm = Self::WRITE_ENCRYPTED;
            } else if perm.contains(Self::WRITE_SIGNED_MITM.union(Self::WRITE_ENCRYPTED))
                || perm.contains(Self::WRITE_ENC_MITM)
            {
                perm = Self::WRITE_ENC_MITM;
            }
            perm = perm.union(self.intersection(Self::KEY_SIZE));
        }
        if op == Opcode::SignedWriteCmd {
            if f.contains(SecFlags::ENCRYPTED) {
                return Err(InvalidPdu);
            }
            if !perm.intersects(Self::WRITE_SIGNED_ANY) {
                return Err(WriteNotPermitted);
            }
            // The signature replaces link encryption
            perm = perm.intersection(Self::WRITE_SIGNED_ANY.union(Self::WRITE_AUTHORIZATION));
        }
        if !perm.intersects(Self::WRITE_ALLOWED) {
            Err(WriteNotPermitted)
        } else if perm.intersects(Self::WRITE_AUTH_REQUIRED) && !f.contains(SecFlags::KEY_KNOWN) {
            Err(InsufficientAuthentication)
        } else if perm.intersects(Self::WRITE_MITM_REQUIRED) && !f.contains(SecFlags::KEY_MITM) {
            Err(InsufficientAuthentication)
        } else if perm.intersects(Self::WRITE_ENC_REQUIRED) && !f.contains(SecFlags::ENCRYPTED) {
            Err(InsufficientEncryption)
        } else if perm.intersects(Self::WRITE_ENC_REQUIRED) && sec.key_size < perm.min_key_size() {
            Err(EncryptionKeySizeTooShort)
        } else if perm.contains(Self::WRITE_AUTHORIZATION)
            && !f.contains(SecFlags::KEY_MITM.union(SecFlags::AUTHORIZED))
        {
            Err(InsufficientAuthorization)
        } else if perm.intersects(Self::WRITE_SIGNED_ANY)
            && op != Opcode::SignedWriteCmd
            && !f.contains(SecFlags::ENCRYPTED)
            && !perm.intersects(Self::WRITE.union(Self::WRITE_ENC_REQUIRED))
        {
            // Signed-only attribute written without a signature
            Err(InsufficientAuthentication)
        } else {
            Ok(())
        }
    }
}
