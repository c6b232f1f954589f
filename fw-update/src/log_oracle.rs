// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Progress detection by diffing append-only logs against a baseline.
//!
//! Controllers do not announce that a flash finished. They do append status
//! lines to the Redfish operation log and entries to the SEL, so we record how
//! long each log is right before uploading and afterwards only look at what
//! was appended since.

use crate::device::Device;
use async_trait::async_trait;
use fw_comms::error::SessionError;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;

pub const OPERATION_LOG: &str = "/var/log/redfish";

/// How many lines to read when an exact delta is impossible.
pub const TAIL_FALLBACK_LINES: usize = 50;

const SEL_COUNT_CMD: &str = "ipmitool sel list | wc -l";

/// Status lines the controller writes to the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The image is staged and waits for a reset to activate.
    Staged,
    Successful,
    /// Activation failed; always a hard failure.
    ApplyFailed,
}

impl Marker {
    fn patterns(self) -> &'static [&'static str] {
        match self {
            Marker::Staged => &["AwaitToActivate", "UpdateStaged"],
            Marker::Successful => &["UpdateSuccessful"],
            Marker::ApplyFailed => &["ApplyFailed"],
        }
    }

    pub fn matches(self, line: &str) -> bool {
        self.patterns().iter().any(|p| line.contains(p))
    }

    /// The earliest line in `logs` that carries any of `wanted`, and which
    /// marker it carries.
    ///
    /// A line carrying several markers resolves to the first in `wanted`.
    pub fn first_in<'a>(
        logs: &'a str,
        wanted: &[Marker],
    ) -> Option<(Marker, &'a str)> {
        logs.lines().find_map(|line| {
            wanted
                .iter()
                .copied()
                .find(|m| m.matches(line))
                .map(|m| (m, line.trim()))
        })
    }
}

/// Which part of a log counts as new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWindow {
    /// Every line after the first `n`.
    After(usize),
    /// The last `n` lines.
    Tail(usize),
}

impl LogWindow {
    /// An exact delta needs a baseline and a log that has not shrunk since
    /// (rotation); anything else degrades to a fixed tail.
    pub fn select(baseline: usize, current: usize) -> LogWindow {
        if baseline > 0 && current >= baseline {
            LogWindow::After(baseline)
        } else {
            LogWindow::Tail(TAIL_FALLBACK_LINES)
        }
    }

    pub fn command(self, path: &str) -> String {
        match self {
            LogWindow::After(n) => format!("tail -n +{} {path}", n + 1),
            LogWindow::Tail(n) => format!("tail -n {n} {path}"),
        }
    }
}

/// Line counts captured immediately before an upload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogBaseline {
    pub operation_log: usize,
    pub sel: usize,
}

/// What the post-flash SEL check found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelReport {
    pub new_entries: Vec<String>,
    pub version_changes: Vec<String>,
    pub critical: Vec<String>,
}

/// Baseline-relative log access.
#[async_trait]
pub trait BaselineLogger: Send + Sync {
    /// Capture line counts for every monitored log. Never fails; a count that
    /// cannot be read is recorded as zero.
    async fn record_baseline(&mut self, dev: &mut Device);

    fn baseline(&self) -> LogBaseline;

    /// Operation-log lines appended since the baseline.
    async fn fetch_new_logs(
        &self,
        dev: &mut Device,
    ) -> Result<String, SessionError>;

    /// Report SEL entries appended since the baseline. Advisory only: critical
    /// entries are logged, never raised.
    async fn check_system_logs(&self, dev: &mut Device) -> Option<SelReport>;
}

pub struct LogOracle {
    baseline: LogBaseline,
    log: Logger,
}

impl LogOracle {
    pub fn new(log: &Logger) -> Self {
        Self { baseline: LogBaseline::default(), log: log.clone() }
    }

    async fn count(
        &self,
        dev: &mut Device,
        cmd: &str,
    ) -> Result<usize, SessionError> {
        let output = dev.run(cmd).await?;
        Ok(parse_count(&output).unwrap_or_else(|| {
            warn!(
                self.log, "unexpected line count output";
                "cmd" => cmd,
                "output" => &output,
            );
            0
        }))
    }
}

fn operation_log_count_cmd() -> String {
    format!("wc -l {OPERATION_LOG} | awk '{{print $1}}'")
}

fn parse_count(output: &str) -> Option<usize> {
    output.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl BaselineLogger for LogOracle {
    async fn record_baseline(&mut self, dev: &mut Device) {
        let operation_log =
            match self.count(dev, &operation_log_count_cmd()).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(
                        self.log, "failed to record operation log baseline";
                        &err,
                    );
                    0
                }
            };
        let sel = match self.count(dev, SEL_COUNT_CMD).await {
            Ok(n) => n,
            Err(err) => {
                warn!(self.log, "failed to record SEL baseline"; &err);
                0
            }
        };
        self.baseline = LogBaseline { operation_log, sel };
        info!(
            self.log, "recorded log baseline";
            "operation_log" => operation_log,
            "sel" => sel,
        );
    }

    fn baseline(&self) -> LogBaseline {
        self.baseline
    }

    async fn fetch_new_logs(
        &self,
        dev: &mut Device,
    ) -> Result<String, SessionError> {
        let current = self.count(dev, &operation_log_count_cmd()).await?;
        let window = LogWindow::select(self.baseline.operation_log, current);
        dev.run(&window.command(OPERATION_LOG)).await
    }

    async fn check_system_logs(&self, dev: &mut Device) -> Option<SelReport> {
        info!(self.log, "checking SEL for new events");
        let current = match self.count(dev, SEL_COUNT_CMD).await {
            Ok(n) => n,
            Err(err) => {
                warn!(self.log, "SEL check failed"; &err);
                return None;
            }
        };
        let new = current.saturating_sub(self.baseline.sel);
        if new == 0 {
            info!(self.log, "no new SEL entries");
            return Some(SelReport::default());
        }

        let cmd = format!("ipmitool sel list | tail -n {new}");
        let output = match dev.run(&cmd).await {
            Ok(output) => output,
            Err(err) => {
                warn!(self.log, "SEL check failed"; &err);
                return None;
            }
        };
        let report = classify_sel(&output);

        if report.version_changes.is_empty() {
            warn!(
                self.log, "no version change event in new SEL entries";
                "new_entries" => report.new_entries.len(),
            );
        }
        for entry in &report.version_changes {
            info!(self.log, "SEL version event"; "entry" => entry);
        }
        for entry in &report.critical {
            error!(
                self.log, "critical SEL event after update";
                "entry" => entry,
            );
        }
        Some(report)
    }
}

fn classify_sel(output: &str) -> SelReport {
    let new_entries: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let version_changes = new_entries
        .iter()
        .filter(|e| e.contains("Version"))
        .cloned()
        .collect();
    let critical = new_entries
        .iter()
        .filter(|e| e.contains("Critical") || e.contains("Non-Recoverable"))
        .cloned()
        .collect();
    SelReport { new_entries, version_changes, critical }
}
