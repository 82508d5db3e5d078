// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! PIN verification and authorization tokens.
//!
//! The client PIN arrives as opaque bytes (it is already derived on the
//! device); the packet stores a salted second hash of it. Attempt counting
//! is persistent state and lives in the database; the core only speaks the
//! reserve/check/clear protocol through [`AttemptLimiter`]:
//!
//! 1. `reserve_pincheck` runs before anything is decrypted. A refused
//!    reservation (or one with no tries left) ends the call.
//! 2. The hash comparison runs in constant time.
//! 3. `clear_pincheck` runs only after a successful comparison. A mismatch
//!    leaves the reservation spent.

use crate::{
    core::KeyshareCore,
    errors::{KeyshareError, Result},
    messages::AuthClaims,
    packet::{EncryptedPacket, PIN_SALT_BYTES},
    utils::unix_now,
};
use jsonwebtoken::{errors::ErrorKind, Algorithm, Validation};
use rand::{CryptoRng, RngCore};
use tracing::{debug, instrument, warn};

/// Lifetime of an authorization token.
pub(crate) const AUTH_TOKEN_VALIDITY_SECONDS: u64 = 900;

/// Value of the `token-type` claim in authorization tokens.
pub(crate) const TOKEN_TYPE_AUTH: &str = "auth";

/// Outcome of reserving a PIN check with the attempt limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinReservation {
    /// Whether a check may proceed at all.
    pub allowed: bool,
    /// Attempts left, including the one just reserved.
    pub tries_remaining: u32,
    /// Seconds until the next attempt is admitted, when blocked.
    pub wait_seconds: u64,
}

/// The persistent attempt counter, implemented by the database layer.
///
/// The core defines the protocol; implementations define the policy
/// (backoff curve, counter persistence).
pub trait AttemptLimiter {
    /// Reserve one PIN check for `user`. Called before the packet is
    /// opened; the returned count is already decremented.
    fn reserve_pincheck(&self, user: &str) -> Result<PinReservation>;

    /// Reset the counter for `user` after a successful check.
    fn clear_pincheck(&self, user: &str) -> Result<()>;
}

impl KeyshareCore {
    /// Check a PIN against a sealed packet and mint an authorization token.
    ///
    /// Returns the signed token on success. A wrong PIN is reported as
    /// [`KeyshareError::PinMismatch`] carrying the limiter's remaining-try
    /// count; a refused reservation as [`KeyshareError::PinLocked`],
    /// without the packet ever being decrypted.
    #[instrument(skip_all, err(Debug))]
    pub fn verify_pin(
        &self,
        limiter: &impl AttemptLimiter,
        user: &str,
        packet: &EncryptedPacket,
        pin: &[u8],
    ) -> Result<String> {
        let reservation = limiter.reserve_pincheck(user)?;
        if !reservation.allowed || reservation.tries_remaining == 0 {
            debug!("pin check refused by the attempt limiter");
            return Err(KeyshareError::PinLocked {
                wait_seconds: reservation.wait_seconds,
            });
        }

        let plaintext = self.ring.open(packet)?;
        if !plaintext.pin_matches(pin) {
            debug!(user_id = plaintext.user_id(), "pin mismatch");
            return Err(KeyshareError::PinMismatch {
                tries_remaining: reservation.tries_remaining,
            });
        }

        limiter.clear_pincheck(user)?;
        self.mint_auth_token(user)
    }

    /// Re-seal a packet under a new PIN.
    ///
    /// The old PIN is verified under the same reservation protocol as
    /// [`KeyshareCore::verify_pin`]. On success the packet gets a fresh
    /// salt, hash, and timestamp, sealed under the designated encryption
    /// key (this is where lazy re-sealing after key rotation happens). The
    /// caller's packet is never modified; on any failure it remains the
    /// authoritative state.
    #[instrument(skip_all, err(Debug))]
    pub fn change_pin<R: RngCore + CryptoRng>(
        &self,
        limiter: &impl AttemptLimiter,
        user: &str,
        packet: &EncryptedPacket,
        old_pin: &[u8],
        new_pin: &[u8],
        rng: &mut R,
    ) -> Result<EncryptedPacket> {
        let reservation = limiter.reserve_pincheck(user)?;
        if !reservation.allowed || reservation.tries_remaining == 0 {
            debug!("pin change refused by the attempt limiter");
            return Err(KeyshareError::PinLocked {
                wait_seconds: reservation.wait_seconds,
            });
        }

        let mut plaintext = self.ring.open(packet)?;
        if !plaintext.pin_matches(old_pin) {
            debug!(user_id = plaintext.user_id(), "pin mismatch on change");
            return Err(KeyshareError::PinMismatch {
                tries_remaining: reservation.tries_remaining,
            });
        }
        limiter.clear_pincheck(user)?;

        let mut salt = [0u8; PIN_SALT_BYTES];
        rng.fill_bytes(&mut salt);
        plaintext.set_pin(salt, new_pin);
        plaintext.set_timestamp(unix_now()?);
        self.ring.seal(&plaintext, rng)
    }

    /// Validate an authorization token and return its subject.
    ///
    /// Expiry is reported separately from every other defect because
    /// clients handle the two differently (re-login versus reject).
    pub fn validate_token(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = jsonwebtoken::decode::<AuthClaims>(
            token,
            self.ring.jwt_decoding_key(),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => KeyshareError::TokenExpired,
            _ => {
                debug!("token rejected: {e}");
                KeyshareError::TokenInvalid
            }
        })?;

        if data.claims.token_type != TOKEN_TYPE_AUTH {
            warn!("token has wrong type claim");
            return Err(KeyshareError::TokenInvalid);
        }
        Ok(data.claims.sub)
    }

    fn mint_auth_token(&self, subject: &str) -> Result<String> {
        let iat = unix_now()?;
        let claims = AuthClaims {
            sub: subject.to_string(),
            iat,
            exp: iat + AUTH_TOKEN_VALIDITY_SECONDS,
            token_type: TOKEN_TYPE_AUTH.to_string(),
        };
        self.ring.sign_claims(&claims)
    }
}
