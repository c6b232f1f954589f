// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use crate::engine::Stage;
use crate::machine::MachineReport;
use camino::Utf8PathBuf;
use fw_comms::error::ProtocolError;
use fw_comms::error::SessionError;
use slog_error_chain::SlogInlineError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// A bounded wait ran out of time.
#[derive(Debug, Clone, Error, SlogInlineError)]
#[error("timed out after {after:?} waiting for {what}")]
pub struct TimeoutError {
    pub what: String,
    pub after: Duration,
}

impl TimeoutError {
    pub fn new(what: impl Into<String>, after: Duration) -> Self {
        Self { what: what.into(), after }
    }
}

/// Soft stop: the component can no longer be reached with the configured
/// credentials, so verification was not attempted.
///
/// This is not a failure. It ends the run and asks the operator to follow up.
#[derive(Debug, Clone, Error, SlogInlineError)]
#[error("verification of {component} skipped: {reason}")]
pub struct VerificationSkipped {
    pub component: String,
    pub reason: String,
}

/// A version mismatch under the strict (audit) policy.
#[derive(Debug, Clone, Error, SlogInlineError)]
#[error("{component}: expected version {expected}, found {found}")]
pub struct VerificationError {
    pub component: String,
    pub expected: String,
    pub found: String,
}

/// Errors raised by a single firmware component's stages.
#[derive(Debug, Error, SlogInlineError)]
pub enum ComponentError {
    #[error("control channel failure")]
    Session(#[from] SessionError),
    #[error("management protocol failure")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// The device itself reported that flashing failed.
    #[error("device reported update failure: {marker}")]
    ApplyFailed { marker: String },
    #[error(transparent)]
    Skipped(#[from] VerificationSkipped),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("no firmware file configured for {component}")]
    MissingFirmwareFile { component: String },
    #[error("failed to read firmware file {path}")]
    FirmwareFile {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// Outcome of driving one component through the update pipeline.
#[derive(Debug, Error, SlogInlineError)]
pub enum PipelineError {
    #[error("update of {component} failed during {stage}")]
    Failed {
        component: String,
        stage: Stage,
        #[source]
        source: ComponentError,
    },
    #[error(transparent)]
    Skipped(#[from] VerificationSkipped),
}

/// Aggregate verdict of a machine-level run.
#[derive(Debug, Error, SlogInlineError)]
pub enum MachineError {
    #[error("components failed to update: {}", failed_list(.report))]
    ComponentsFailed { report: MachineReport },
    #[error(
        "PFR security violation: {reason}{}",
        failed_suffix(.report)
    )]
    PfrViolation { reason: String, report: MachineReport },
    #[error("manual action required")]
    ManualActionRequired {
        #[source]
        skipped: VerificationSkipped,
        report: MachineReport,
    },
}

impl MachineError {
    /// Per-component results gathered before the run ended.
    pub fn report(&self) -> &MachineReport {
        match self {
            MachineError::ComponentsFailed { report }
            | MachineError::PfrViolation { report, .. }
            | MachineError::ManualActionRequired { report, .. } => report,
        }
    }
}

fn failed_list(report: &MachineReport) -> String {
    report.failed().join(", ")
}

fn failed_suffix(report: &MachineReport) -> String {
    let failed = report.failed();
    if failed.is_empty() {
        String::new()
    } else {
        format!("; components failed to update: {}", failed.join(", "))
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("failed to load payload template {path}")]
    PayloadFile {
        path: Utf8PathBuf,
        #[source]
        err: PayloadFileError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, SlogInlineError)]
pub enum PayloadFileError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
