// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The [`KeyshareCore`] aggregate and its startup configuration.

use crate::{
    errors::Result,
    gmp_zeroize::enable_zeroize,
    keys::{AesKey, KeyRing},
    packet::{EncryptedPacket, Packet, PIN_SALT_BYTES},
    prove::{IssuerPublicKey, PublicKeyIdentifier, Session, SECRET_BITS},
    utils::{random_below_pow2, unix_now},
};
use rand::{CryptoRng, RngCore};
use std::{
    collections::HashMap,
    sync::Mutex,
};
use tracing::info;

/// Typed startup configuration for a [`KeyshareCore`].
///
/// The surrounding server loads these from files; the core only sees the
/// parsed values. Construction is the single validation point: a core that
/// exists has a usable key ring.
pub struct CoreConfig {
    /// The AES key table: every key packets may have been sealed under.
    pub aes_keys: Vec<(u32, AesKey)>,
    /// Which table entry seals new packets.
    pub encryption_key_id: u32,
    /// RS256 private key, PEM.
    pub jwt_private_key_pem: Vec<u8>,
    /// Public counterpart of the signing key, PEM.
    pub jwt_public_key_pem: Vec<u8>,
    /// Id advertised in the `kid` header of every signed token.
    pub jwt_key_id: u32,
    /// The trusted issuer public keys. Registering dishonestly generated
    /// material here compromises every user share.
    pub trusted_keys: Vec<(PublicKeyIdentifier, IssuerPublicKey)>,
}

/// The keyshare server's cryptographic core.
///
/// Holds the server's share of each user's master secret in sealed form,
/// gates it behind PIN checks, and produces the server half of credential
/// proofs. All state other than the pending commitment table is immutable
/// after construction; per-user state between calls exists only as sealed
/// packets owned by the caller.
pub struct KeyshareCore {
    pub(crate) ring: KeyRing,
    pub(crate) sessions: Mutex<HashMap<u64, Session>>,
}

impl KeyshareCore {
    /// Build a core from validated configuration.
    ///
    /// Also installs the big-integer erasure hooks; this must therefore run
    /// before any other use of big integers in the process.
    pub fn new(config: CoreConfig) -> Result<Self> {
        enable_zeroize();
        let ring = KeyRing::new(
            config.aes_keys,
            config.encryption_key_id,
            &config.jwt_private_key_pem,
            &config.jwt_public_key_pem,
            config.jwt_key_id,
            config.trusted_keys,
        )?;
        info!("keyshare core initialized");
        Ok(KeyshareCore {
            ring,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Id of the token signing key, for the HTTP layer to advertise.
    pub fn jwt_key_id(&self) -> u32 {
        self.ring.jwt_key_id()
    }

    /// Register a user: draw a fresh server share and seal it together
    /// with the hash of `pin` into a new packet.
    ///
    /// `user_id` is bound into the packet for log correlation only; zero
    /// is fine.
    pub fn generate_packet<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        pin: &[u8],
        user_id: u64,
    ) -> Result<EncryptedPacket> {
        let secret = random_below_pow2(rng, SECRET_BITS);
        let mut salt = [0u8; PIN_SALT_BYTES];
        rng.fill_bytes(&mut salt);

        let mut packet = Packet::new();
        packet.set_pin(salt, pin);
        packet.set_secret(&secret)?;
        packet.set_timestamp(unix_now()?);
        packet.set_user_id(user_id);
        self.ring.seal(&packet, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::KeyshareError,
        utils::testing::{init_testing, test_config, test_core, test_key_id, TestLimiter},
    };
    use libpaillier::unknown_order::BigNumber;

    const PIN: &[u8] = b"puZGbaLDmFywGhFDi4vW2G87ZhXpaUsvymZwNJfB/SU=\n";

    #[test]
    fn construction_rejects_bad_pems() {
        let mut rng = init_testing();
        let mut config = test_config(&mut rng);
        config.jwt_private_key_pem = b"junk".to_vec();
        assert!(matches!(
            KeyshareCore::new(config),
            Err(KeyshareError::ConfigError(_))
        ));

        let mut config = test_config(&mut rng);
        config.jwt_public_key_pem = b"junk".to_vec();
        assert!(matches!(
            KeyshareCore::new(config),
            Err(KeyshareError::ConfigError(_))
        ));
    }

    #[test]
    fn fresh_packets_are_distinct() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);

        let first = core.generate_packet(&mut rng, PIN, 1).unwrap();
        let second = core.generate_packet(&mut rng, PIN, 2).unwrap();
        assert_ne!(first, second);
        assert_ne!(
            core.ring.open(&first).unwrap().secret(),
            core.ring.open(&second).unwrap().secret()
        );
    }

    /// The whole user lifecycle: register, log in, prove, lose the
    /// session, change the PIN, log in again.
    #[test]
    fn full_user_lifecycle() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let limiter = TestLimiter::permissive();

        // Register.
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        // Log in.
        let token = core
            .verify_pin(&limiter, "testusername", &packet, PIN)
            .unwrap();
        let subject = core.validate_token(&token).unwrap();
        assert_eq!(subject, "testusername");

        // Prove.
        let (id, _) = core
            .generate_commitments(&packet, &subject, &[test_key_id()], &mut rng)
            .unwrap();
        let challenge = BigNumber::from_slice(123_456_789u64.to_be_bytes());
        assert!(core.generate_response(id, &subject, &challenge).is_ok());
        assert_eq!(
            core.generate_response(id, &subject, &challenge),
            Err(KeyshareError::NoSession)
        );

        // Change the PIN and use the new one.
        let new_pin = b"freshpin";
        let packet = core
            .change_pin(&limiter, &subject, &packet, PIN, new_pin, &mut rng)
            .unwrap();
        assert!(core.verify_pin(&limiter, &subject, &packet, new_pin).is_ok());
        assert_eq!(
            core.verify_pin(&limiter, &subject, &packet, PIN),
            Err(KeyshareError::PinMismatch { tries_remaining: 3 })
        );
    }
}
