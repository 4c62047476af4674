// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error types for the webhook rate proxy.
//!
//! Admission outcomes (queued, overflow, banned) are not errors; they are
//! reported through [`crate::limiter::Admission`]. The types here cover
//! setup and the external collaborators.

use std::path::PathBuf;
use thiserror::Error;

/// Upstream client construction errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Invalid upstream base URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Upstream base URL cannot carry path segments: {0}")]
    CannotBeABase(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Ban list persistence errors.
#[derive(Debug, Error)]
pub enum BanStoreError {
    #[error("Ban list I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ban list at {} is not a JSON array of ids: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration parsing errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown drain order {0:?}, expected \"fifo\" or \"lifo\"")]
    UnknownDrainOrder(String),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}
