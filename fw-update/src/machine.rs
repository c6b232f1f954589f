// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Machine-level runs: every configured component, then the verdict.

use crate::component::AuditResult;
use crate::component::Auditor;
use crate::component::FirmwareComponent;
use crate::device::Device;
use crate::engine::UpdateEngine;
use crate::error::MachineError;
use crate::error::PipelineError;
use crate::resilience::wait_until_ready;
use crate::resilience::Verbosity;
use crate::version::VersionCheck;
use serde::Serialize;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    /// Flashed, but left for the operator to verify.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentResult {
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-component outcomes of a run, plus the audit if one ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineReport {
    pub components: Vec<ComponentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditResult>,
}

impl MachineReport {
    /// Names of the components that failed, in run order.
    pub fn failed(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| c.status == Status::Fail)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn passed(&self) -> bool {
        self.failed().is_empty()
            && self.audit.as_ref().map_or(true, |audit| audit.healthy)
    }
}

/// What has to hold, beyond the components themselves, for a run to pass.
pub enum Gate {
    Standard,
    /// The security audit runs once after every component has been attempted.
    Pfr(Auditor),
}

/// Runs the update pipeline for each component in order.
///
/// Component failures are collected so that the remaining components still
/// run. A soft stop from any component ends the run immediately.
pub struct MachineVerifier {
    components: Vec<Box<dyn FirmwareComponent>>,
    gate: Gate,
    log: Logger,
}

impl MachineVerifier {
    pub fn new(
        components: Vec<Box<dyn FirmwareComponent>>,
        gate: Gate,
        log: &Logger,
    ) -> Self {
        let kind = match gate {
            Gate::Standard => "standard",
            Gate::Pfr(_) => "pfr",
        };
        let log = log.new(slog::o!("verifier" => kind));
        Self { components, gate, log }
    }

    pub async fn verify_system(
        &mut self,
        dev: &mut Device,
    ) -> Result<MachineReport, MachineError> {
        info!(
            self.log, "starting machine update";
            "components" => self.components.len(),
        );
        if let Gate::Standard = self.gate {
            let readiness = wait_until_ready(dev, Verbosity::Verbose).await;
            if !readiness.is_ready() {
                warn!(self.log, "starting updates on a controller not ready");
            }
        }

        let mut report = MachineReport::default();
        for component in &mut self.components {
            let name = component.name().to_string();
            let mut engine = UpdateEngine::new(component.as_mut(), &self.log);
            let result = match engine.execute(dev).await {
                Ok(check) => ComponentResult {
                    name,
                    status: Status::Pass,
                    version: Some(check),
                    error: None,
                },
                Err(PipelineError::Skipped(skipped)) => {
                    warn!(
                        self.log, "ending run: manual action required";
                        &skipped,
                    );
                    report.components.push(ComponentResult {
                        name,
                        status: Status::Skipped,
                        version: None,
                        error: Some(skipped.reason.clone()),
                    });
                    return Err(MachineError::ManualActionRequired {
                        skipped,
                        report,
                    });
                }
                Err(err @ PipelineError::Failed { .. }) => ComponentResult {
                    name,
                    status: Status::Fail,
                    version: None,
                    error: Some(InlineErrorChain::new(&err).to_string()),
                },
            };
            report.components.push(result);
        }

        if let Gate::Pfr(auditor) = &self.gate {
            let audit = auditor.check_health(dev).await;
            let healthy = audit.healthy;
            let reason = audit.reason.clone();
            report.audit = Some(audit);
            if !healthy {
                error!(
                    self.log, "machine update failed security audit";
                    "reason" => &reason,
                    "failed" => ?report.failed(),
                );
                return Err(MachineError::PfrViolation { reason, report });
            }
        }

        if !report.failed().is_empty() {
            error!(
                self.log, "machine update failed";
                "failed" => ?report.failed(),
            );
            return Err(MachineError::ComponentsFailed { report });
        }
        info!(self.log, "machine update succeeded");
        Ok(report)
    }
}
