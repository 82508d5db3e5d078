// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The key ring: every key the core holds.
//!
//! The ring maps AES key ids to keys for opening packets sealed at any
//! point in the ring's history, designates exactly one of them for sealing,
//! and carries the RS256 keypair for tokens plus the trusted issuer key
//! registry. All of it is immutable after construction; key rotation means
//! constructing a core with an extended table and a new designated id. Old
//! packets remain openable under their original key id and are re-sealed
//! lazily, on the next PIN change.

use crate::{
    errors::{KeyshareError, Result},
    packet::{EncryptedPacket, Packet, IV_BYTES},
    prove::{IssuerPublicKey, PublicKeyIdentifier},
};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rand::{CryptoRng, RngCore};
use serde::Serialize;
use sha2::Sha256;
use std::{collections::HashMap, fmt::Debug};
use tracing::{error, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// A 256-bit packet sealing key. Doubles as the MAC key for the envelope
/// it seals.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; 32]);

impl AesKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        AesKey(bytes)
    }

    fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey([redacted])")
    }
}

/// Immutable key material held by a [`crate::KeyshareCore`].
pub(crate) struct KeyRing {
    decryption_keys: HashMap<u32, AesKey>,
    encryption_key_id: u32,
    jwt_encoding_key: EncodingKey,
    jwt_decoding_key: DecodingKey,
    jwt_key_id: u32,
    trusted_keys: HashMap<PublicKeyIdentifier, IssuerPublicKey>,
}

impl KeyRing {
    pub(crate) fn new(
        aes_keys: Vec<(u32, AesKey)>,
        encryption_key_id: u32,
        jwt_private_key_pem: &[u8],
        jwt_public_key_pem: &[u8],
        jwt_key_id: u32,
        trusted_keys: Vec<(PublicKeyIdentifier, IssuerPublicKey)>,
    ) -> Result<Self> {
        if aes_keys.is_empty() {
            return Err(KeyshareError::ConfigError(
                "at least one AES key is required".into(),
            ));
        }
        let decryption_keys: HashMap<_, _> = aes_keys.into_iter().collect();
        if !decryption_keys.contains_key(&encryption_key_id) {
            return Err(KeyshareError::ConfigError(format!(
                "designated encryption key id {encryption_key_id} is not in the key table"
            )));
        }
        let jwt_encoding_key = EncodingKey::from_rsa_pem(jwt_private_key_pem).map_err(|e| {
            KeyshareError::ConfigError(format!("cannot parse JWT private key: {e}"))
        })?;
        let jwt_decoding_key = DecodingKey::from_rsa_pem(jwt_public_key_pem).map_err(|e| {
            KeyshareError::ConfigError(format!("cannot parse JWT public key: {e}"))
        })?;
        Ok(KeyRing {
            decryption_keys,
            encryption_key_id,
            jwt_encoding_key,
            jwt_decoding_key,
            jwt_key_id,
            trusted_keys: trusted_keys.into_iter().collect(),
        })
    }

    /// Seal a plaintext packet under the designated encryption key.
    pub(crate) fn seal<R: RngCore + CryptoRng>(
        &self,
        packet: &Packet,
        rng: &mut R,
    ) -> Result<EncryptedPacket> {
        let key = self
            .decryption_keys
            .get(&self.encryption_key_id)
            .ok_or(KeyshareError::Internal)?;

        let mut iv = [0u8; IV_BYTES];
        rng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(key.bytes().into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(packet.as_bytes());

        let mut mac = HmacSha256::new_from_slice(key.bytes()).map_err(|_| {
            error!("HMAC construction rejected a 32-byte key");
            KeyshareError::Internal
        })?;
        mac.update(&self.encryption_key_id.to_be_bytes());
        mac.update(&iv);
        mac.update(&ciphertext);
        let tag: [u8; 32] = mac.finalize().into_bytes().into();

        EncryptedPacket::assemble(self.encryption_key_id, iv, &ciphertext, tag)
    }

    /// Authenticate and decrypt a packet.
    ///
    /// The tag is verified (in constant time) before a single byte of
    /// ciphertext is interpreted.
    pub(crate) fn open(&self, encrypted: &EncryptedPacket) -> Result<Packet> {
        let key = self.decryption_keys.get(&encrypted.key_id()).ok_or_else(|| {
            warn!("packet sealed under unknown AES key id {}", encrypted.key_id());
            KeyshareError::UnknownKey
        })?;

        let mut mac = HmacSha256::new_from_slice(key.bytes()).map_err(|_| {
            error!("HMAC construction rejected a 32-byte key");
            KeyshareError::Internal
        })?;
        mac.update(encrypted.authenticated_region());
        mac.verify_slice(encrypted.tag()).map_err(|_| {
            warn!("packet failed authentication");
            KeyshareError::BadMac
        })?;

        let iv: [u8; IV_BYTES] = encrypted.iv().try_into().map_err(|_| KeyshareError::Internal)?;
        let plaintext = Aes256CbcDec::new(key.bytes().into(), (&iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(encrypted.ciphertext())
            .map_err(|_| {
                warn!("packet failed CBC unpadding");
                KeyshareError::BadPadding
            })?;

        Packet::from_bytes(plaintext)
    }

    /// Sign a claim set as an RS256 JWT, tagged with the signing key id.
    pub(crate) fn sign_claims<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.jwt_key_id.to_string());
        jsonwebtoken::encode(&header, claims, &self.jwt_encoding_key).map_err(|e| {
            error!("JWT signing failed: {e}");
            KeyshareError::Internal
        })
    }

    pub(crate) fn jwt_decoding_key(&self) -> &DecodingKey {
        &self.jwt_decoding_key
    }

    pub(crate) fn jwt_key_id(&self) -> u32 {
        self.jwt_key_id
    }

    /// Look up a trusted issuer public key.
    pub(crate) fn issuer_key(&self, id: &PublicKeyIdentifier) -> Result<&IssuerPublicKey> {
        self.trusted_keys.get(id).ok_or_else(|| {
            warn!("issuer public key {id} is not trusted");
            KeyshareError::UnknownKey
        })
    }
}
