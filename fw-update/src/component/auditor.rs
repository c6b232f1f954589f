// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use crate::config::PfrConfig;
use crate::device::Device;
use serde::Serialize;
use slog::error;
use slog::info;
use slog::Logger;
use slog_error_chain::InlineErrorChain;

/// Outcome of a security audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditResult {
    pub healthy: bool,
    pub reason: String,
}

/// Read-only check of the platform-firmware-resilience recovery counter.
///
/// A recovery means the platform rolled itself back from an image it did not
/// trust, which is a security event regardless of what the updates reported.
pub struct Auditor {
    name: String,
    pfr: PfrConfig,
    log: Logger,
}

impl Auditor {
    pub fn new(name: impl Into<String>, pfr: PfrConfig, log: &Logger) -> Self {
        let name = name.into();
        let log = log.new(slog::o!("auditor" => name.clone()));
        Self { name, pfr, log }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn query(&self) -> String {
        let PfrConfig { service, object_path, interface, property } =
            &self.pfr;
        format!(
            "busctl get-property {service} {object_path} {interface} \
             {property}"
        )
    }

    pub async fn check_health(&self, dev: &mut Device) -> AuditResult {
        info!(self.log, "checking security state");
        let result = match dev.run(&self.query()).await {
            Ok(output) => match parse_recovery_count(&output) {
                Some(0) => AuditResult {
                    healthy: true,
                    reason: "System Secure".to_string(),
                },
                Some(count) => AuditResult {
                    healthy: false,
                    reason: format!(
                        "{} is {count}: the platform recovered from an \
                         untrusted image",
                        self.pfr.property
                    ),
                },
                None => AuditResult {
                    healthy: false,
                    reason: format!(
                        "unexpected {} output: {:?}",
                        self.pfr.property,
                        output.trim()
                    ),
                },
            },
            Err(err) => AuditResult {
                healthy: false,
                reason: format!(
                    "failed to query {}: {}",
                    self.pfr.property,
                    InlineErrorChain::new(&err)
                ),
            },
        };
        if result.healthy {
            info!(self.log, "security audit passed");
        } else {
            error!(
                self.log, "security audit failed";
                "reason" => &result.reason,
            );
        }
        result
    }
}

/// `busctl` renders an integer property as `<signature> <value>`.
fn parse_recovery_count(output: &str) -> Option<u64> {
    output.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::discard;
    use crate::test_utils::SimBmc;
    use crate::test_utils::SimRedfish;

    #[test]
    fn recovery_count_parsing() {
        assert_eq!(parse_recovery_count("u 0"), Some(0));
        assert_eq!(parse_recovery_count("y 3\n"), Some(3));
        assert_eq!(parse_recovery_count("u"), None);
        assert_eq!(parse_recovery_count("Failed to get property"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn audit_outcomes() {
        let sim = SimBmc::new();
        let mut dev = sim.device(SimRedfish::new(&sim));
        let auditor = Auditor::new("pfr", PfrConfig::default(), &discard());

        let result = auditor.check_health(&mut dev).await;
        assert_eq!(
            result,
            AuditResult { healthy: true, reason: "System Secure".to_string() }
        );
        assert_eq!(
            sim.state().commands.last().map(String::as_str),
            Some(
                "busctl get-property xyz.openbmc_project.PFR.Manager \
                 /xyz/openbmc_project/pfr xyz.openbmc_project.PFR.Attributes \
                 RecoveryCount"
            )
        );

        sim.state().recovery_output = "u 2".to_string();
        let result = auditor.check_health(&mut dev).await;
        assert!(!result.healthy);
        assert!(result.reason.contains("RecoveryCount is 2"));

        sim.state().recovery_output = "garbage".to_string();
        assert!(!auditor.check_health(&mut dev).await.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_controller_is_unhealthy() {
        let sim = SimBmc::new();
        let mut dev = sim.device(SimRedfish::new(&sim));
        sim.state().connected = false;
        let auditor = Auditor::new("pfr", PfrConfig::default(), &discard());

        let result = auditor.check_health(&mut dev).await;
        assert!(!result.healthy);
        assert!(result.reason.starts_with("failed to query RecoveryCount"));
    }
}
