// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use crate::error::VerificationError;
use serde::Serialize;
use slog::info;
use slog::warn;
use slog::Logger;

/// How a version mismatch is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPolicy {
    /// After an update run: a mismatch is reported, never raised.
    Observational,
    /// Audit runs: a mismatch is an error.
    Strict,
}

/// Strip annotations such as a boot-bank suffix (`"3.24.00 (Primary)"`)
/// and surrounding whitespace, leaving the bare version.
pub fn normalize_version(raw: &str) -> &str {
    raw.split_whitespace().next().unwrap_or("")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    /// As read from the device, annotations included.
    pub current: String,
    pub expected: String,
    pub matched: bool,
}

impl VersionCheck {
    pub fn new(
        current: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        let current = current.into();
        let expected = expected.into();
        let matched =
            normalize_version(&current) == normalize_version(&expected);
        Self { current, expected, matched }
    }
}

pub fn check_version(
    component: &str,
    current: &str,
    expected: &str,
    policy: VersionPolicy,
    log: &Logger,
) -> Result<VersionCheck, VerificationError> {
    let check = VersionCheck::new(current, expected);
    if check.matched {
        info!(
            log, "version matches";
            "component" => component,
            "version" => current,
        );
        return Ok(check);
    }
    match policy {
        VersionPolicy::Observational => {
            warn!(
                log, "version mismatch";
                "component" => component,
                "expected" => expected,
                "found" => current,
            );
            Ok(check)
        }
        VersionPolicy::Strict => Err(VerificationError {
            component: component.to_string(),
            expected: expected.to_string(),
            found: current.to_string(),
        }),
    }
}
