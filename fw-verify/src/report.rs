// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Rendering of verify-only and update results.

use fw_update::component::AuditResult;
use fw_update::error::ComponentError;
use fw_update::machine::Status;
use fw_update::version::check_version;
use fw_update::MachineReport;
use fw_update::VersionPolicy;
use serde::Serialize;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use strum_macros::Display;
use tabled::Tabled;

const AUDIT_EXPECTED: &str = "System Secure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RowStatus {
    Pass,
    Mismatch,
    Error,
    Fail,
}

/// One line of the verify-only report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub component: String,
    pub current: String,
    pub expected: String,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReportRow {
    /// A version read under the strict policy: anything but an exact match
    /// fails the report.
    pub fn version(
        component: &str,
        expected: &str,
        current: Result<String, ComponentError>,
        log: &Logger,
    ) -> Self {
        let current = match current {
            Ok(current) => current,
            Err(err) => {
                return Self {
                    component: component.to_string(),
                    current: "-".to_string(),
                    expected: expected.to_string(),
                    status: RowStatus::Error,
                    message: Some(InlineErrorChain::new(&err).to_string()),
                };
            }
        };
        let status = match check_version(
            component,
            &current,
            expected,
            VersionPolicy::Strict,
            log,
        ) {
            Ok(_) => RowStatus::Pass,
            Err(_) => RowStatus::Mismatch,
        };
        Self {
            component: component.to_string(),
            current,
            expected: expected.to_string(),
            status,
            message: None,
        }
    }

    pub fn audit(component: &str, audit: &AuditResult) -> Self {
        Self {
            component: component.to_string(),
            current: audit.reason.clone(),
            expected: AUDIT_EXPECTED.to_string(),
            status: if audit.healthy {
                RowStatus::Pass
            } else {
                RowStatus::Fail
            },
            message: None,
        }
    }
}

pub fn all_pass(rows: &[ReportRow]) -> bool {
    rows.iter().all(|row| row.status == RowStatus::Pass)
}

pub fn verify_table(rows: &[ReportRow]) -> String {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct Row<'a> {
        component: &'a str,
        current: &'a str,
        expected: &'a str,
        status: String,
    }

    let table_rows = rows.iter().map(|row| Row {
        component: &row.component,
        current: &row.current,
        expected: &row.expected,
        status: match &row.message {
            Some(message) => format!("{} ({message})", row.status),
            None => row.status.to_string(),
        },
    });
    tabled::Table::new(table_rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string()
}

pub fn update_table(report: &MachineReport) -> String {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct Row<'a> {
        component: &'a str,
        status: String,
        version: String,
        detail: String,
    }

    let mut table_rows: Vec<Row<'_>> = report
        .components
        .iter()
        .map(|c| Row {
            component: &c.name,
            status: c.status.to_string(),
            version: c
                .version
                .as_ref()
                .map_or_else(|| "-".to_string(), |v| v.current.clone()),
            detail: match (&c.version, &c.error) {
                (_, Some(err)) => err.clone(),
                (Some(v), None) if !v.matched => {
                    format!("expected {}", v.expected)
                }
                _ => String::new(),
            },
        })
        .collect();
    if let Some(audit) = &report.audit {
        table_rows.push(Row {
            component: "security audit",
            status: if audit.healthy { Status::Pass } else { Status::Fail }
                .to_string(),
            version: "-".to_string(),
            detail: audit.reason.clone(),
        });
    }
    tabled::Table::new(table_rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string()
}
