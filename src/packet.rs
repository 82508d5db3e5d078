// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The keyshare packet: per-user state sealed at rest.
//!
//! A plaintext packet holds the user's PIN salt and server-side PIN hash,
//! the server share of the user's master secret, a creation timestamp, and
//! a user id used only for log binding. The layout is fixed-width so that
//! decryption needs no metadata and ciphertext length reveals nothing about
//! the share.
//!
//! ```text
//! plaintext (144 bytes)            encrypted (212 bytes)
//!   0..8    pin salt                 0..4    AES key id (big-endian)
//!   8..40   pin hash                 4..20   CBC IV
//!   40..64  reserved (zero)          20..180 ciphertext
//!   64..128 server share (BE)        180..212 HMAC-SHA256 tag
//!   128..136 unix timestamp (BE)
//!   136..144 user id (BE)
//! ```

use crate::errors::{KeyshareError, Result};
use libpaillier::unknown_order::BigNumber;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use subtle::ConstantTimeEq;
use tracing::{error, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const PIN_SALT_BYTES: usize = 8;
pub(crate) const PIN_HASH_BYTES: usize = 32;
pub(crate) const SHARE_BYTES: usize = 64;

const SALT_RANGE: std::ops::Range<usize> = 0..8;
const HASH_RANGE: std::ops::Range<usize> = 8..40;
const SHARE_RANGE: std::ops::Range<usize> = 64..128;
const TIMESTAMP_RANGE: std::ops::Range<usize> = 128..136;
const USER_ID_RANGE: std::ops::Range<usize> = 136..144;

/// Size of a plaintext packet.
pub(crate) const PLAINTEXT_BYTES: usize = 144;

/// Size of the CBC ciphertext: PKCS#7 always appends one full block to a
/// block-aligned plaintext.
pub(crate) const CIPHERTEXT_BYTES: usize = PLAINTEXT_BYTES + 16;

pub(crate) const KEY_ID_BYTES: usize = 4;
pub(crate) const IV_BYTES: usize = 16;
pub(crate) const TAG_BYTES: usize = 32;

/// Size of an encrypted packet.
pub const ENCRYPTED_PACKET_BYTES: usize =
    KEY_ID_BYTES + IV_BYTES + CIPHERTEXT_BYTES + TAG_BYTES;

/// Derive the server-side PIN hash from a salt and the opaque client PIN
/// bytes. The per-user salt keeps identical client PINs from producing
/// identical stored hashes.
pub(crate) fn pin_digest(salt: &[u8; PIN_SALT_BYTES], pin: &[u8]) -> [u8; PIN_HASH_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin);
    hasher.finalize().into()
}

/// A decrypted keyshare packet.
///
/// This type never leaves the crate: the share inside it only crosses the
/// public API boundary through a commitment session handle. The buffer is
/// erased when the packet goes out of scope.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Packet([u8; PLAINTEXT_BYTES]);

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Packet([redacted])")
    }
}

impl Packet {
    pub(crate) fn new() -> Self {
        Packet([0u8; PLAINTEXT_BYTES])
    }

    /// Reassemble a packet from decrypted bytes. The input is erased
    /// regardless of the outcome.
    pub(crate) fn from_bytes(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != PLAINTEXT_BYTES {
            bytes.zeroize();
            warn!("decrypted packet has the wrong width");
            return Err(KeyshareError::BadPadding);
        }
        let mut buf = [0u8; PLAINTEXT_BYTES];
        buf.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Packet(buf))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; PLAINTEXT_BYTES] {
        &self.0
    }

    pub(crate) fn pin_salt(&self) -> [u8; PIN_SALT_BYTES] {
        self.0[SALT_RANGE].try_into().expect("range width is fixed")
    }

    /// Write a fresh salt and the hash of `pin` under that salt.
    pub(crate) fn set_pin(&mut self, salt: [u8; PIN_SALT_BYTES], pin: &[u8]) {
        let digest = pin_digest(&salt, pin);
        self.0[SALT_RANGE].copy_from_slice(&salt);
        self.0[HASH_RANGE].copy_from_slice(&digest);
    }

    /// Compare `pin` against the sealed hash in constant time.
    pub(crate) fn pin_matches(&self, pin: &[u8]) -> bool {
        let mut digest = pin_digest(&self.pin_salt(), pin);
        let matches = bool::from(digest.ct_eq(&self.0[HASH_RANGE]));
        digest.zeroize();
        matches
    }

    pub(crate) fn secret(&self) -> BigNumber {
        BigNumber::from_slice(&self.0[SHARE_RANGE])
    }

    /// Store the server share, fixed-width big-endian. Shares wider than
    /// the field indicate a bug in the caller.
    pub(crate) fn set_secret(&mut self, secret: &BigNumber) -> Result<()> {
        let mut bytes = secret.to_bytes();
        if bytes.len() > SHARE_BYTES {
            bytes.zeroize();
            error!("server share does not fit the fixed packet field");
            return Err(KeyshareError::Internal);
        }
        let start = SHARE_RANGE.start + (SHARE_BYTES - bytes.len());
        self.0[SHARE_RANGE].fill(0);
        self.0[start..SHARE_RANGE.end].copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(())
    }

    pub(crate) fn timestamp(&self) -> u64 {
        u64::from_be_bytes(self.0[TIMESTAMP_RANGE].try_into().expect("range width is fixed"))
    }

    pub(crate) fn set_timestamp(&mut self, unix_seconds: u64) {
        self.0[TIMESTAMP_RANGE].copy_from_slice(&unix_seconds.to_be_bytes());
    }

    pub(crate) fn user_id(&self) -> u64 {
        u64::from_be_bytes(self.0[USER_ID_RANGE].try_into().expect("range width is fixed"))
    }

    pub(crate) fn set_user_id(&mut self, id: u64) {
        self.0[USER_ID_RANGE].copy_from_slice(&id.to_be_bytes());
    }
}

/// An encrypted keyshare packet, as stored by the database and passed in by
/// the HTTP layer. Opaque outside this crate.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedPacket([u8; ENCRYPTED_PACKET_BYTES]);

impl Debug for EncryptedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedPacket(key id {})", self.key_id())
    }
}

impl EncryptedPacket {
    /// Parse an encrypted packet from raw bytes. A wrong-sized input is
    /// reported as an authentication failure; callers cannot distinguish
    /// malformed from forged.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; ENCRYPTED_PACKET_BYTES] = bytes.try_into().map_err(|_| {
            warn!("encrypted packet has the wrong length");
            KeyshareError::BadMac
        })?;
        Ok(EncryptedPacket(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Id of the AES key this packet was sealed under.
    pub fn key_id(&self) -> u32 {
        u32::from_be_bytes(self.0[..KEY_ID_BYTES].try_into().expect("range width is fixed"))
    }

    pub(crate) fn iv(&self) -> &[u8] {
        &self.0[KEY_ID_BYTES..KEY_ID_BYTES + IV_BYTES]
    }

    pub(crate) fn ciphertext(&self) -> &[u8] {
        &self.0[KEY_ID_BYTES + IV_BYTES..ENCRYPTED_PACKET_BYTES - TAG_BYTES]
    }

    pub(crate) fn tag(&self) -> &[u8] {
        &self.0[ENCRYPTED_PACKET_BYTES - TAG_BYTES..]
    }

    /// The region covered by the authentication tag: key id ‖ IV ‖
    /// ciphertext.
    pub(crate) fn authenticated_region(&self) -> &[u8] {
        &self.0[..ENCRYPTED_PACKET_BYTES - TAG_BYTES]
    }

    pub(crate) fn assemble(
        key_id: u32,
        iv: [u8; IV_BYTES],
        ciphertext: &[u8],
        tag: [u8; TAG_BYTES],
    ) -> Result<Self> {
        if ciphertext.len() != CIPHERTEXT_BYTES {
            error!("sealed ciphertext has unexpected width {}", ciphertext.len());
            return Err(KeyshareError::Internal);
        }
        let mut buf = [0u8; ENCRYPTED_PACKET_BYTES];
        buf[..KEY_ID_BYTES].copy_from_slice(&key_id.to_be_bytes());
        buf[KEY_ID_BYTES..KEY_ID_BYTES + IV_BYTES].copy_from_slice(&iv);
        buf[KEY_ID_BYTES + IV_BYTES..ENCRYPTED_PACKET_BYTES - TAG_BYTES]
            .copy_from_slice(ciphertext);
        buf[ENCRYPTED_PACKET_BYTES - TAG_BYTES..].copy_from_slice(&tag);
        Ok(EncryptedPacket(buf))
    }

    /// Flip one bit, for tamper tests.
    #[cfg(test)]
    pub(crate) fn corrupt_bit(&mut self, byte: usize, bit: u8) {
        self.0[byte] ^= 1 << bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;
    use rand::RngCore;

    fn sample_packet(rng: &mut impl RngCore) -> Packet {
        let mut salt = [0u8; PIN_SALT_BYTES];
        rng.fill_bytes(&mut salt);
        let mut packet = Packet::new();
        packet.set_pin(salt, b"some device-derived pin");
        packet
            .set_secret(&BigNumber::from_slice([0x42u8; 32]))
            .unwrap();
        packet.set_timestamp(1_700_000_000);
        packet.set_user_id(7);
        packet
    }

    #[test]
    fn accessors_round_trip() {
        let mut rng = init_testing();
        let packet = sample_packet(&mut rng);

        assert_eq!(packet.secret(), BigNumber::from_slice([0x42u8; 32]));
        assert_eq!(packet.timestamp(), 1_700_000_000);
        assert_eq!(packet.user_id(), 7);
        assert!(packet.pin_matches(b"some device-derived pin"));
        assert!(!packet.pin_matches(b"some device-derived pin "));
        assert!(!packet.pin_matches(b""));
    }

    #[test]
    fn share_width_is_fixed() {
        let mut packet = Packet::new();

        // A one-byte share occupies the same field as a full-width one.
        packet.set_secret(&BigNumber::from_slice([5u8])).unwrap();
        assert_eq!(packet.secret(), BigNumber::from_slice([5u8]));
        assert_eq!(packet.as_bytes().len(), PLAINTEXT_BYTES);

        packet
            .set_secret(&BigNumber::from_slice([0xffu8; SHARE_BYTES]))
            .unwrap();
        assert_eq!(
            packet.secret(),
            BigNumber::from_slice([0xffu8; SHARE_BYTES])
        );

        // Overwriting a wide share with a narrow one leaves no residue.
        packet.set_secret(&BigNumber::from_slice([9u8])).unwrap();
        assert_eq!(packet.secret(), BigNumber::from_slice([9u8]));
    }

    #[test]
    fn oversized_share_is_rejected() {
        let mut packet = Packet::new();
        let too_wide = BigNumber::from_slice([1u8; SHARE_BYTES + 1]);
        assert_eq!(
            packet.set_secret(&too_wide),
            Err(KeyshareError::Internal)
        );
    }

    #[test]
    fn fresh_salt_changes_the_hash() {
        let mut rng = init_testing();
        let pin = b"puZGbaLDmFywGhFDi4vW2G87ZhXpaUsvymZwNJfB/SU=\n";

        let mut first = Packet::new();
        let mut second = Packet::new();
        let mut salt = [0u8; PIN_SALT_BYTES];
        rng.fill_bytes(&mut salt);
        first.set_pin(salt, pin);
        rng.fill_bytes(&mut salt);
        second.set_pin(salt, pin);

        // Same PIN, different users, distinct stored state.
        assert_ne!(first.as_bytes(), second.as_bytes());
        assert!(first.pin_matches(pin));
        assert!(second.pin_matches(pin));
    }

    #[test]
    fn wrong_width_plaintext_is_rejected() {
        assert_eq!(
            Packet::from_bytes(vec![0u8; PLAINTEXT_BYTES - 1]),
            Err(KeyshareError::BadPadding)
        );
        assert_eq!(
            Packet::from_bytes(vec![0u8; PLAINTEXT_BYTES + 16]),
            Err(KeyshareError::BadPadding)
        );
        assert!(Packet::from_bytes(vec![0u8; PLAINTEXT_BYTES]).is_ok());
    }

    #[test]
    fn debug_output_is_redacted() {
        let mut rng = init_testing();
        let packet = sample_packet(&mut rng);
        assert_eq!(format!("{packet:?}"), "Packet([redacted])");
    }

    #[test]
    fn encrypted_packet_parsing_checks_length() {
        assert_eq!(
            EncryptedPacket::from_slice(&[0u8; ENCRYPTED_PACKET_BYTES - 1]),
            Err(KeyshareError::BadMac)
        );
        let packet = EncryptedPacket::from_slice(&[0u8; ENCRYPTED_PACKET_BYTES]).unwrap();
        assert_eq!(packet.key_id(), 0);
        assert_eq!(packet.ciphertext().len(), CIPHERTEXT_BYTES);
        assert_eq!(packet.tag().len(), TAG_BYTES);
        assert_eq!(
            packet.authenticated_region().len(),
            ENCRYPTED_PACKET_BYTES - TAG_BYTES
        );
    }
}
