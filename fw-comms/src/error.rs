// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use camino::Utf8PathBuf;
use slog_error_chain::SlogInlineError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors from the remote shell transport.
#[derive(Debug, Error, SlogInlineError)]
pub enum SessionError {
    /// The control channel died underneath an in-flight command.
    ///
    /// Controllers give no notice before they reboot; losing the channel is
    /// the only signal we get, so callers treat this variant as "the device
    /// has started rebooting" rather than as a generic I/O failure.
    #[error("session lost: {reason}")]
    SessionLost { reason: String },
    #[error("session is not connected")]
    NotConnected,
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        err: russh::Error,
    },
    #[error("timed out after {after:?} connecting to {addr}")]
    ConnectTimeout { addr: String, after: Duration },
    #[error("authentication rejected for user {user}")]
    Auth { user: String },
    #[error("timed out after {after:?} waiting for pattern {pattern:?}")]
    PatternTimeout { pattern: String, after: Duration },
    #[error("invalid expect pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        err: regex::Error,
    },
}

impl SessionError {
    pub fn is_session_lost(&self) -> bool {
        matches!(self, SessionError::SessionLost { .. })
    }

    pub fn lost(reason: impl Into<String>) -> Self {
        SessionError::SessionLost { reason: reason.into() }
    }
}

/// Errors from the management-protocol (HTTPS + JSON) transport.
#[derive(Debug, Error, SlogInlineError)]
pub enum ProtocolError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
    /// A 2xx response whose body carries an `error` object. Some controllers
    /// report a rejected image this way instead of with an error status.
    #[error("{url} reported an error: {message}")]
    Application { url: String, message: String },
    #[error("failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        err: serde_json::Error,
    },
    #[error("failed to read firmware file {path}")]
    FirmwareFile {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("request to {url} failed (gave up after {attempts} attempts)")]
    ExhaustedRetries {
        url: String,
        attempts: usize,
        #[source]
        last: Box<ProtocolError>,
    },
}

impl ProtocolError {
    /// Whether this error is worth retrying with the fixed-delay policy.
    ///
    /// Only transport-level failures and 5xx responses qualify; an
    /// application-level rejection will be rejected again.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Request { .. } => true,
            ProtocolError::Status { status, .. } => *status >= 500,
            ProtocolError::Application { .. }
            | ProtocolError::Decode { .. }
            | ProtocolError::FirmwareFile { .. }
            | ProtocolError::ExhaustedRetries { .. } => false,
        }
    }
}
