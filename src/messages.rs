// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Wire shapes shared with the HTTP layer.
//!
//! The core itself operates on typed values; these are the serde forms the
//! surrounding server sends and receives, kept here so the HTTP layer and
//! the tests agree on the exact JSON.

use crate::errors::KeyshareError;
use libpaillier::unknown_order::BigNumber;
use serde::{Deserialize, Serialize};

/// Claims of an authorization token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    /// The authorized user.
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(rename = "token-type")]
    pub token_type: String,
}

/// Claims of a signed proof response.
#[derive(Serialize, Deserialize)]
pub struct ResponseClaims {
    pub sub: String,
    pub responses: ProofResponse,
    pub iat: u64,
    pub exp: u64,
}

/// The integer responses of the server's half of the proof.
#[derive(Serialize, Deserialize)]
pub struct ProofResponse {
    /// Response binding the server share: `ρ + c·m`.
    pub s_m: BigNumber,
    /// Per-key responses binding the commitments: `r_i + c·ρ`.
    pub s: Vec<BigNumber>,
}

/// Body of `POST /users/verify/pin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPinRequest {
    pub id: String,
    pub pin: String,
}

/// Body of `POST /users/change/pin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePinRequest {
    pub id: String,
    pub oldpin: String,
    pub newpin: String,
}

/// Status reply for the PIN endpoints: `success` carries a token (or is
/// empty, for a PIN change), `failure` carries the remaining tries, `error`
/// carries the seconds to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinStatus {
    pub status: String,
    pub message: String,
}

impl PinStatus {
    pub fn success(message: impl Into<String>) -> Self {
        PinStatus {
            status: "success".into(),
            message: message.into(),
        }
    }

    pub fn failure(tries_remaining: u32) -> Self {
        PinStatus {
            status: "failure".into(),
            message: tries_remaining.to_string(),
        }
    }

    pub fn error(wait_seconds: u64) -> Self {
        PinStatus {
            status: "error".into(),
            message: wait_seconds.to_string(),
        }
    }

    /// Map the PIN-protocol error kinds onto their wire status. Other
    /// errors have no PIN status; the HTTP layer reports those as plain
    /// server errors.
    pub fn from_pin_error(err: &KeyshareError) -> Option<Self> {
        match err {
            KeyshareError::PinMismatch { tries_remaining } => {
                Some(PinStatus::failure(*tries_remaining))
            }
            KeyshareError::PinLocked { wait_seconds } => Some(PinStatus::error(*wait_seconds)),
            _ => None,
        }
    }
}
