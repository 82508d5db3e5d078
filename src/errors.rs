// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Error types for the keyshare core.
//!
//! Every public operation returns a value or a [`KeyshareError`]; nothing is
//! retried inside the core and no panics cross the crate boundary. The
//! variants deliberately collapse some distinctions: callers cannot tell a
//! forged packet from a malformed one, and the HTTP layer reports both
//! [`KeyshareError::BadMac`] and [`KeyshareError::BadPadding`] as a generic
//! invalid-packet condition.

use thiserror::Error;

/// The return type for all public operations in this crate.
pub type Result<T> = std::result::Result<T, KeyshareError>;

/// Errors produced by the keyshare core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyshareError {
    /// An AES key id or issuer public key id is not present in the key ring.
    #[error("key id not present in key ring")]
    UnknownKey,

    /// Packet authentication failed.
    #[error("packet authentication failed")]
    BadMac,

    /// Packet decryption produced invalid padding or an invalid plaintext.
    #[error("packet padding invalid")]
    BadPadding,

    /// The presented PIN did not match the one sealed into the packet.
    #[error("pin mismatch, {tries_remaining} tries remaining")]
    PinMismatch {
        /// Attempts left before the account locks, as reported by the
        /// attempt limiter.
        tries_remaining: u32,
    },

    /// PIN checking is currently not allowed for this user.
    #[error("pin checking blocked for {wait_seconds} seconds")]
    PinLocked {
        /// Seconds until the attempt limiter will admit another check.
        wait_seconds: u64,
    },

    /// The authorization token failed signature or claim validation.
    #[error("authorization token invalid")]
    TokenInvalid,

    /// The authorization token is past its expiry.
    #[error("authorization token expired")]
    TokenExpired,

    /// No commitment session exists under the presented id, or it was
    /// already consumed.
    #[error("no session under the presented commitment id")]
    NoSession,

    /// The commitment session belongs to a different subject.
    #[error("commitment session bound to a different subject")]
    SessionMismatch,

    /// Construction-time configuration was rejected.
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// The attempt limiter (database-backed) failed.
    #[error("attempt limiter failure: {0}")]
    Storage(String),

    /// An internal invariant was violated. This indicates a bug.
    #[error("internal invariant violated")]
    Internal,
}
