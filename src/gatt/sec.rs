use std::collections::VecDeque;

use crate::att::{ErrorCode, LinkSec, SecFlags};

use super::*;

/// Security action required before a client operation can proceed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SecAction {
    /// Link security is sufficient.
    Ok,
    /// Encryption with any key is required, but no key exists.
    EncryptNoMitm,
    /// Encryption with an authenticated key is required.
    EncryptMitm,
    /// A key exists, but the link is not encrypted.
    Encrypt,
    /// The write can be signed instead of encrypting the link.
    SignData,
    /// An encryption upgrade is already in progress.
    EncryptionPending,
}

impl SecAction {
    /// Returns whether the action requires a request to the security manager.
    #[inline]
    #[must_use]
    pub const fn is_encrypt(self) -> bool {
        matches!(self, Self::EncryptNoMitm | Self::EncryptMitm | Self::Encrypt)
    }
}

crate::impl_display_via_debug! { SecAction }

/// Determines the security action required for an operation with requirement
/// `auth` on a link with the current security state `sec`. `write_cmd`
/// specifies whether the operation is a write without response, which may be
/// signed instead of encrypting the link.
#[must_use]
pub fn determine_required_action(
    sec: LinkSec,
    upgrading: bool,
    auth: AuthReq,
    write_cmd: bool,
) -> SecAction {
    let f = sec.flags;
    if upgrading {
        return SecAction::EncryptionPending;
    }
    if auth == AuthReq::None {
        return SecAction::Ok;
    }
    if auth.is_mitm() && !f.contains(SecFlags::KEY_MITM) {
        return SecAction::EncryptMitm;
    }
    if !auth.is_mitm() && !f.contains(SecFlags::KEY_KNOWN) {
        return SecAction::EncryptNoMitm;
    }
    if f.contains(SecFlags::ENCRYPTED) {
        return SecAction::Ok;
    }
    if write_cmd && auth.is_signed() && f.contains(SecFlags::SIGNING_KEY) {
        SecAction::SignData
    } else {
        SecAction::Encrypt
    }
}

/// Re-derives the status of an operation resumed after an encryption upgrade
/// completed with `ok`. Authentication is checked against the current key
/// rather than the completion event.
pub fn resume_status(auth: AuthReq, ok: bool, sec: LinkSec) -> std::result::Result<(), ErrorCode> {
    if !ok {
        Err(ErrorCode::InsufficientEncryption)
    } else if auth.is_mitm() && !sec.flags.contains(SecFlags::KEY_MITM) {
        Err(ErrorCode::InsufficientAuthentication)
    } else {
        Ok(())
    }
}

/// Per-link encryption upgrade state. At most one upgrade is in flight, and
/// operations waiting on it are resumed in FIFO order.
#[derive(Debug)]
pub(super) struct SecGate<T> {
    act: Option<SecAction>,
    pending: VecDeque<T>,
}

impl<T> Default for SecGate<T> {
    #[inline]
    fn default() -> Self {
        Self {
            act: None,
            pending: VecDeque::new(),
        }
    }
}

impl<T> SecGate<T> {
    /// Returns whether an upgrade is in flight.
    #[inline]
    pub fn is_upgrading(&self) -> bool {
        self.act.is_some()
    }

    /// Queues an operation waiting on an upgrade. Returns whether the upgrade
    /// must be requested from the security manager.
    pub fn enqueue(&mut self, act: SecAction, op: T) -> bool {
        self.pending.push_back(op);
        if self.act.is_some() || !act.is_encrypt() {
            return false;
        }
        self.act = Some(act);
        true
    }

    /// Ends the current upgrade and returns all waiting operations in the
    /// order they were queued.
    pub fn complete(&mut self) -> VecDeque<T> {
        self.act = None;
        std::mem::take(&mut self.pending)
    }

    /// Removes waiting operations that match `f`.
    pub fn remove(&mut self, f: impl Fn(&T) -> bool) {
        self.pending.retain(|op| !f(op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_action() {
        use {AuthReq::*, SecAction::*};
        let sec = |f: SecFlags| LinkSec::new(f, 16);
        let none = sec(SecFlags::empty());
        let key = sec(SecFlags::KEY_KNOWN);
        let signing = sec(SecFlags::KEY_KNOWN | SecFlags::SIGNING_KEY);
        let enc = sec(SecFlags::KEY_KNOWN | SecFlags::ENCRYPTED);
        let mitm = sec(SecFlags::KEY_KNOWN | SecFlags::KEY_MITM | SecFlags::ENCRYPTED);

        let t = |s, auth, cmd| determine_required_action(s, false, auth, cmd);
        assert_eq!(t(none, None, false), Ok);
        assert_eq!(determine_required_action(none, true, None, false), EncryptionPending);
        assert_eq!(t(none, NoMitm, false), EncryptNoMitm);
        assert_eq!(t(none, Mitm, false), EncryptMitm);
        assert_eq!(t(key, NoMitm, false), Encrypt);
        assert_eq!(t(enc, NoMitm, false), Ok);
        assert_eq!(t(enc, Mitm, false), EncryptMitm);
        assert_eq!(t(mitm, Mitm, false), Ok);
        assert_eq!(t(signing, SignedNoMitm, true), SignData);
        assert_eq!(t(signing, SignedNoMitm, false), Encrypt);
        assert_eq!(t(signing, NoMitm, true), Encrypt);
        assert_eq!(t(key, SignedNoMitm, true), Encrypt);
        assert_eq!(t(signing, SignedMitm, true), EncryptMitm);
    }

    #[test]
    fn resume() {
        let enc = LinkSec::new(SecFlags::KEY_KNOWN | SecFlags::ENCRYPTED, 16);
        let mitm = LinkSec::new(enc.flags | SecFlags::KEY_MITM, 16);
        assert_eq!(resume_status(AuthReq::Mitm, true, mitm), Ok(()));
        assert_eq!(
            resume_status(AuthReq::Mitm, true, enc),
            Err(ErrorCode::InsufficientAuthentication)
        );
        assert_eq!(resume_status(AuthReq::NoMitm, true, enc), Ok(()));
        assert_eq!(
            resume_status(AuthReq::NoMitm, false, enc),
            Err(ErrorCode::InsufficientEncryption)
        );
    }

    #[test]
    fn gate_fifo() {
        let mut g = SecGate::default();
        assert!(g.enqueue(SecAction::EncryptMitm, 1));
        assert!(g.is_upgrading());
        assert!(!g.enqueue(SecAction::EncryptionPending, 2));
        assert!(!g.enqueue(SecAction::Encrypt, 3));
        g.remove(|&op| op == 2);
        assert_eq!(g.complete(), [1, 3]);
        assert!(!g.is_upgrading());
        assert!(g.complete().is_empty());
    }
}
