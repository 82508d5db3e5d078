// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The proof session engine: the server's half of a Schnorr-style proof of
//! knowledge of the user's master secret, run over the RSA group of each
//! requested issuer key.
//!
//! # High-level protocol description
//! The engine plays second prover. For an authorized user and issuer keys
//! `(n_i, S_i, R0_i)` it:
//! - opens the packet and extracts the server share `m`,
//! - draws one session randomizer `ρ` and one nonce `r_i` per key, all
//!   uniform in `[0, 2^(ℓ_m + ℓ_stat))`,
//! - publishes per key the blinded contribution `P_i = R0^m · S^ρ (mod n_i)`
//!   and the commitment `W_i = R0^ρ · S^{r_i} (mod n_i)`,
//! - on challenge `c`, answers with `s_m = ρ + c·m` and `s_i = r_i + c·ρ`,
//!   computed over the integers.
//!
//! A verifier accepts when `R0^{s_m} · S^{s_i} ≡ W_i · P_i^c (mod n_i)`
//! for every key.
//!
//! Commitment state lives only in an in-memory table keyed by a random
//! 64-bit id. An id is consumed by exactly one response call, whether the
//! response is produced or the call fails, and a process restart discards
//! every pending session. The
//! table is the sole shared mutable structure in the crate; its mutex
//! guards nothing but the map operations themselves.

use crate::{
    core::KeyshareCore,
    errors::{KeyshareError, Result},
    messages::{ProofResponse, ResponseClaims},
    packet::EncryptedPacket,
    utils::{random_below_pow2, unix_now, CRYPTOGRAPHIC_RETRY_MAX},
};
use libpaillier::unknown_order::BigNumber;
use rand::{CryptoRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use tracing::{debug, error, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Width of the master secret (`ℓ_m`).
pub(crate) const SECRET_BITS: usize = 256;

/// Statistical hiding margin for the commitment nonces (`ℓ_stat`).
const STATISTICAL_BITS: usize = 128;

/// Width of `ρ` and every `r_i`.
const NONCE_BITS: usize = SECRET_BITS + STATISTICAL_BITS;

/// Lifetime of a signed proof response.
const RESPONSE_VALIDITY_SECONDS: u64 = 120;

/// Identifies one issuer public key: scheme, issuer, and key counter, with
/// the string form `scheme.issuer-counter` (e.g. `test.test-3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyIdentifier {
    issuer: String,
    counter: u32,
}

impl PublicKeyIdentifier {
    pub fn new(issuer: impl Into<String>, counter: u32) -> Self {
        PublicKeyIdentifier {
            issuer: issuer.into(),
            counter,
        }
    }

    /// The scheme-qualified issuer, e.g. `test.test`.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl fmt::Display for PublicKeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.issuer, self.counter)
    }
}

impl FromStr for PublicKeyIdentifier {
    type Err = KeyshareError;

    fn from_str(s: &str) -> Result<Self> {
        let (issuer, counter) = s.rsplit_once('-').ok_or_else(|| {
            warn!("malformed public key identifier");
            KeyshareError::UnknownKey
        })?;
        if !issuer.contains('.') || issuer.is_empty() {
            warn!("public key identifier lacks a scheme-qualified issuer");
            return Err(KeyshareError::UnknownKey);
        }
        let counter = counter.parse().map_err(|_| {
            warn!("public key identifier has a non-numeric counter");
            KeyshareError::UnknownKey
        })?;
        Ok(PublicKeyIdentifier {
            issuer: issuer.to_string(),
            counter,
        })
    }
}

impl Serialize for PublicKeyIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKeyIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| de::Error::custom("malformed public key identifier"))
    }
}

/// An issuer's public key, restricted to what the second prover needs: the
/// RSA-group modulus and the two bases.
///
/// Registering a key that was not honestly generated compromises the
/// shares of every user who runs the protocol under it. The registry is a
/// trust root; provenance checking happens before configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerPublicKey {
    n: BigNumber,
    s: BigNumber,
    r0: BigNumber,
}

impl IssuerPublicKey {
    pub fn new(n: BigNumber, s: BigNumber, r0: BigNumber) -> Self {
        IssuerPublicKey { n, s, r0 }
    }

    pub fn n(&self) -> &BigNumber {
        &self.n
    }

    pub fn s(&self) -> &BigNumber {
        &self.s
    }

    pub fn r0(&self) -> &BigNumber {
        &self.r0
    }
}

/// The server's published values for one issuer key: the blinded
/// contribution `P` and the commitment `W`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofCommitment {
    pub p: BigNumber,
    pub w: BigNumber,
}

/// One pending commitment, between `generate_commitments` and
/// `generate_response`.
///
/// # 🔒 Lifetime requirements
/// A session must be consumed exactly once; the table enforces this by
/// removing it before any use. Its secret fields are erased on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct Session {
    subject: String,
    #[zeroize(skip)]
    key_ids: Vec<PublicKeyIdentifier>,
    secret: BigNumber,
    randomizer: BigNumber,
    nonces: Vec<BigNumber>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("subject", &self.subject)
            .field("key_ids", &self.key_ids)
            .field("secret", &"[redacted]")
            .field("randomizer", &"[redacted]")
            .field("nonces", &"[redacted]")
            .finish()
    }
}

impl KeyshareCore {
    /// Open a packet and produce commitments for every requested issuer
    /// key, registering a single-use session under a fresh random id.
    ///
    /// The key list must be non-empty and fully resolvable; an unknown id
    /// fails the whole call and no session is created. `subject` is the
    /// token subject the HTTP layer authorized; the eventual response call
    /// must present the same one.
    #[instrument(skip_all, err(Debug))]
    pub fn generate_commitments<R: RngCore + CryptoRng>(
        &self,
        packet: &EncryptedPacket,
        subject: &str,
        key_ids: &[PublicKeyIdentifier],
        rng: &mut R,
    ) -> Result<(u64, Vec<ProofCommitment>)> {
        if key_ids.is_empty() {
            warn!("commitment request without any key ids");
            return Err(KeyshareError::UnknownKey);
        }
        let keys = key_ids
            .iter()
            .map(|id| self.ring.issuer_key(id))
            .collect::<Result<Vec<_>>>()?;

        let plaintext = self.ring.open(packet)?;
        let secret = plaintext.secret();

        let randomizer = random_below_pow2(rng, NONCE_BITS);
        let mut nonces = Vec::with_capacity(keys.len());
        let mut commitments = Vec::with_capacity(keys.len());
        for pk in &keys {
            let nonce = random_below_pow2(rng, NONCE_BITS);

            let base_m = pk.r0().modpow(&secret, pk.n());
            let blind = pk.s().modpow(&randomizer, pk.n());
            let p = (&base_m * &blind).nmod(pk.n());

            let commit_m = pk.r0().modpow(&randomizer, pk.n());
            let commit_nonce = pk.s().modpow(&nonce, pk.n());
            let w = (&commit_m * &commit_nonce).nmod(pk.n());

            commitments.push(ProofCommitment { p, w });
            nonces.push(nonce);
        }

        let session = Session {
            subject: subject.to_string(),
            key_ids: key_ids.to_vec(),
            secret,
            randomizer,
            nonces,
        };
        let id = self.store_session(session, rng)?;
        debug!(keys = key_ids.len(), "commitments generated");
        Ok((id, commitments))
    }

    /// Consume the session under `commit_id` and sign the responses to
    /// `challenge`.
    ///
    /// The session is removed before anything else happens: a second call
    /// with the same id reports [`KeyshareError::NoSession`], and a
    /// subject mismatch discards the session as well.
    #[instrument(skip_all, err(Debug))]
    pub fn generate_response(
        &self,
        commit_id: u64,
        subject: &str,
        challenge: &BigNumber,
    ) -> Result<String> {
        let session = {
            let mut sessions = self.sessions.lock().map_err(|_| {
                error!("commitment table mutex poisoned");
                KeyshareError::Internal
            })?;
            sessions.remove(&commit_id)
        }
        .ok_or_else(|| {
            debug!("commitment id unknown or already consumed");
            KeyshareError::NoSession
        })?;

        if session.subject != subject {
            warn!("commitment session bound to a different subject");
            return Err(KeyshareError::SessionMismatch);
        }

        // Responses are taken over the integers; the verifier works in ℤ.
        let secret_term = challenge * &session.secret;
        let s_m = &session.randomizer + &secret_term;
        let randomizer_term = challenge * &session.randomizer;
        let s = session
            .nonces
            .iter()
            .map(|nonce| nonce + &randomizer_term)
            .collect();

        let iat = unix_now()?;
        let claims = ResponseClaims {
            sub: subject.to_string(),
            responses: ProofResponse { s_m, s },
            iat,
            exp: iat + RESPONSE_VALIDITY_SECONDS,
        };
        self.ring.sign_claims(&claims)
    }

    /// Insert a session under a fresh uniformly random id, retrying on
    /// collision while the lock is held.
    fn store_session<R: RngCore + CryptoRng>(
        &self,
        session: Session,
        rng: &mut R,
    ) -> Result<u64> {
        let mut sessions = self.sessions.lock().map_err(|_| {
            error!("commitment table mutex poisoned");
            KeyshareError::Internal
        })?;
        let mut session = Some(session);
        for _ in 0..CRYPTOGRAPHIC_RETRY_MAX {
            let id = rng.next_u64();
            if !sessions.contains_key(&id) {
                sessions.insert(id, session.take().ok_or(KeyshareError::Internal)?);
                return Ok(id);
            }
        }
        error!("could not allocate a commitment id");
        Err(KeyshareError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::KeyshareCore,
        keys::AesKey,
        utils::testing::{
            init_testing, test_config, test_core, test_issuer_key, test_key_id,
            TEST_JWT_PRIVATE_PEM, TEST_JWT_PUBLIC_PEM,
        },
    };
    use jsonwebtoken::{Algorithm, DecodingKey, Validation};
    use rand::{rngs::StdRng, SeedableRng};

    const PIN: &[u8] = b"puZGbaLDmFywGhFDi4vW2G87ZhXpaUsvymZwNJfB/SU=\n";

    fn decode_response_claims(token: &str) -> ResponseClaims {
        let key = DecodingKey::from_rsa_pem(TEST_JWT_PUBLIC_PEM.as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp"]);
        jsonwebtoken::decode::<ResponseClaims>(token, &key, &validation)
            .unwrap()
            .claims
    }

    /// The verifier side of the protocol.
    fn verifies(
        pk: &IssuerPublicKey,
        commitment: &ProofCommitment,
        challenge: &BigNumber,
        s_m: &BigNumber,
        s_i: &BigNumber,
    ) -> bool {
        let lhs = (&pk.r0().modpow(s_m, pk.n()) * &pk.s().modpow(s_i, pk.n())).nmod(pk.n());
        let rhs = (&commitment.w * &commitment.p.modpow(challenge, pk.n())).nmod(pk.n());
        lhs == rhs
    }

    #[test]
    fn key_identifier_string_form_round_trips() {
        let id: PublicKeyIdentifier = "test.test-3".parse().unwrap();
        assert_eq!(id.issuer(), "test.test");
        assert_eq!(id.counter(), 3);
        assert_eq!(id.to_string(), "test.test-3");

        let json: Vec<PublicKeyIdentifier> = serde_json::from_str(r#"["test.test-3"]"#).unwrap();
        assert_eq!(json, vec![id]);

        assert!("test.test".parse::<PublicKeyIdentifier>().is_err());
        assert!("noscheme-3".parse::<PublicKeyIdentifier>().is_err());
        assert!("test.test-three".parse::<PublicKeyIdentifier>().is_err());
    }

    #[test]
    fn commitment_and_response_satisfy_the_verifier() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let (id, commitments) = core
            .generate_commitments(&packet, "testusername", &[test_key_id()], &mut rng)
            .unwrap();
        assert_eq!(commitments.len(), 1);

        let challenge = BigNumber::from_slice(123_456_789u64.to_be_bytes());
        let jwt = core
            .generate_response(id, "testusername", &challenge)
            .unwrap();

        let claims = decode_response_claims(&jwt);
        assert_eq!(claims.sub, "testusername");
        assert_eq!(claims.exp - claims.iat, 120);
        assert_eq!(claims.responses.s.len(), 1);

        let pk = core.ring.issuer_key(&test_key_id()).unwrap();
        assert!(verifies(
            pk,
            &commitments[0],
            &challenge,
            &claims.responses.s_m,
            &claims.responses.s[0],
        ));

        // The session is gone: replaying the id fails.
        assert_eq!(
            core.generate_response(id, "testusername", &challenge),
            Err(KeyshareError::NoSession)
        );
    }

    #[test]
    fn responses_cover_every_requested_key() {
        let mut rng = init_testing();
        let second_id = PublicKeyIdentifier::new("test.test2", 1);
        let mut config = test_config(&mut rng);
        config
            .trusted_keys
            .push((second_id.clone(), test_issuer_key(&mut rng)));
        let core = KeyshareCore::new(config).unwrap();
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let key_ids = [test_key_id(), second_id];
        let (id, commitments) = core
            .generate_commitments(&packet, "testusername", &key_ids, &mut rng)
            .unwrap();
        assert_eq!(commitments.len(), 2);

        let challenge = BigNumber::from_slice(0xdead_beefu64.to_be_bytes());
        let claims = decode_response_claims(
            &core.generate_response(id, "testusername", &challenge).unwrap(),
        );
        assert_eq!(claims.responses.s.len(), 2);

        for (i, key_id) in key_ids.iter().enumerate() {
            let pk = core.ring.issuer_key(key_id).unwrap();
            assert!(verifies(
                pk,
                &commitments[i],
                &challenge,
                &claims.responses.s_m,
                &claims.responses.s[i],
            ));
        }
    }

    #[test]
    fn subject_mismatch_discards_the_session() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let (id, _) = core
            .generate_commitments(&packet, "testusername", &[test_key_id()], &mut rng)
            .unwrap();

        let challenge = BigNumber::from_slice(1u64.to_be_bytes());
        assert_eq!(
            core.generate_response(id, "someoneelse", &challenge),
            Err(KeyshareError::SessionMismatch)
        );
        // Consumed either way; the rightful subject cannot resume it.
        assert_eq!(
            core.generate_response(id, "testusername", &challenge),
            Err(KeyshareError::NoSession)
        );
    }

    #[test]
    fn unknown_key_fails_the_whole_call() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let unknown = PublicKeyIdentifier::new("test.other", 1);
        assert_eq!(
            core.generate_commitments(
                &packet,
                "testusername",
                &[test_key_id(), unknown],
                &mut rng
            )
            .unwrap_err(),
            KeyshareError::UnknownKey
        );
        // No partial session was left behind.
        assert_eq!(core.sessions.lock().unwrap().len(), 0);
    }

    #[test]
    fn empty_key_list_is_rejected() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        assert_eq!(
            core.generate_commitments(&packet, "testusername", &[], &mut rng)
                .unwrap_err(),
            KeyshareError::UnknownKey
        );
        assert_eq!(core.sessions.lock().unwrap().len(), 0);
    }

    #[test]
    fn one_token_may_open_many_sessions() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let (first, _) = core
            .generate_commitments(&packet, "testusername", &[test_key_id()], &mut rng)
            .unwrap();
        let (second, _) = core
            .generate_commitments(&packet, "testusername", &[test_key_id()], &mut rng)
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(core.sessions.lock().unwrap().len(), 2);
    }

    #[test]
    fn commitments_are_deterministic_in_the_seed() {
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let seed = [7u8; 32];
        let (id_a, commitments_a) = core
            .generate_commitments(
                &packet,
                "testusername",
                &[test_key_id()],
                &mut StdRng::from_seed(seed),
            )
            .unwrap();
        let (id_b, commitments_b) = core
            .generate_commitments(
                &packet,
                "testusername",
                &[test_key_id()],
                &mut StdRng::from_seed(seed),
            )
            .unwrap();

        // Same share, same key, same randomness: identical commitments.
        assert_eq!(commitments_a, commitments_b);
        // The second id draw collided with the stored first session and
        // was re-drawn under the lock.
        assert_ne!(id_a, id_b);
        assert_eq!(core.sessions.lock().unwrap().len(), 2);
    }

    #[test]
    fn session_debug_redacts_secrets() {
        let session = Session {
            subject: "testusername".into(),
            key_ids: vec![test_key_id()],
            secret: BigNumber::from_slice([3u8; 32]),
            randomizer: BigNumber::from_slice([4u8; 32]),
            nonces: vec![BigNumber::from_slice([5u8; 32])],
        };
        let rendered = format!("{session:?}");
        assert!(rendered.contains("secret: \"[redacted]\""));
        assert!(rendered.contains("randomizer: \"[redacted]\""));
        assert!(rendered.contains("nonces: \"[redacted]\""));
    }

    #[test]
    fn sealed_share_stays_inside_the_core() {
        // A second core with a different AES key cannot serve commitments
        // for packets it did not seal.
        let mut rng = init_testing();
        let core = test_core(&mut rng);
        let packet = core.generate_packet(&mut rng, PIN, 0).unwrap();

        let mut foreign_config = test_config(&mut rng);
        foreign_config.aes_keys = vec![(1, AesKey::new([0x99; 32]))];
        let foreign = KeyshareCore::new(foreign_config).unwrap();

        assert_eq!(
            foreign
                .generate_commitments(&packet, "testusername", &[test_key_id()], &mut rng)
                .unwrap_err(),
            KeyshareError::BadMac
        );
    }
}
