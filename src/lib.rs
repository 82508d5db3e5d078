// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The cryptographic core of an attribute-based credential keyshare
//! server.
//!
//! A keyshare server splits each user's master secret between the user's
//! device and the server, so that using a credential requires both halves
//! and the server half is gated behind a PIN. This crate is the part that
//! touches secrets; HTTP routing, persistence, and account management live
//! in the surrounding server and interact with it through typed calls.
//!
//! It provides:
//! - sealing of per-user state into authenticated, encrypted packets with
//!   key-id-based rotation ([`EncryptedPacket`]),
//! - PIN verification against a database-backed attempt limiter, minting
//!   short-lived RS256 authorization tokens ([`KeyshareCore::verify_pin`]),
//! - the server half of Gabi-style Schnorr proofs: single-use commitment
//!   sessions and signed integer responses
//!   ([`KeyshareCore::generate_commitments`],
//!   [`KeyshareCore::generate_response`]).
//!
//! Decrypted shares exist only on the stack of a single call or inside the
//! pending-commitment table, and every secret buffer (including the GMP
//! limbs backing big integers) is erased when released.
//!
//! ```
//! use keyshare_core::{CoreConfig, KeyshareCore, PinReservation, AttemptLimiter};
//! # use keyshare_core::Result;
//! # struct NoLimit;
//! # impl AttemptLimiter for NoLimit {
//! #     fn reserve_pincheck(&self, _user: &str) -> Result<PinReservation> {
//! #         Ok(PinReservation { allowed: true, tries_remaining: 3, wait_seconds: 0 })
//! #     }
//! #     fn clear_pincheck(&self, _user: &str) -> Result<()> { Ok(()) }
//! # }
//! # fn demo(config: CoreConfig) -> Result<()> {
//! let core = KeyshareCore::new(config)?;
//! let mut rng = rand::rngs::OsRng;
//!
//! let packet = core.generate_packet(&mut rng, b"device-derived pin", 0)?;
//! let token = core.verify_pin(&NoLimit, "alice", &packet, b"device-derived pin")?;
//! assert_eq!(core.validate_token(&token)?, "alice");
//! # Ok(())
//! # }
//! ```

mod auth;
mod core;
mod errors;
mod gmp_zeroize;
mod keys;
pub mod messages;
mod packet;
mod prove;
mod utils;

pub use crate::core::{CoreConfig, KeyshareCore};
pub use auth::{AttemptLimiter, PinReservation};
pub use errors::{KeyshareError, Result};
pub use keys::AesKey;
pub use packet::{EncryptedPacket, ENCRYPTED_PACKET_BYTES};
pub use prove::{IssuerPublicKey, ProofCommitment, PublicKeyIdentifier};
