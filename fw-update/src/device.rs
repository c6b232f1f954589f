// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use fw_comms::error::SessionError;
use fw_comms::ProtocolClient;
use fw_comms::RemoteSession;
use slog::Logger;
use std::time::Duration;

/// Intervals and bounds for every wait in the pipeline.
///
/// Defaults match what controllers in the field need; the inventory's
/// `[timing]` table can override any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Log and heartbeat polling cadence while monitoring an update.
    pub poll_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub command_timeout: Duration,
    /// Pause between closing a dead session and the first reconnect attempt.
    pub reconnect_settle: Duration,
    pub reconnect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub readiness_timeout: Duration,
    /// Time given to the controller after it comes back before the
    /// post-update log check.
    pub post_reboot_settle: Duration,
    pub power_settle: Duration,
    pub boot_code_poll: Duration,
    pub host_boot_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            reconnect_settle: Duration::from_secs(15),
            reconnect_timeout: Duration::from_secs(900),
            reconnect_backoff: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(600),
            post_reboot_settle: Duration::from_secs(20),
            power_settle: Duration::from_secs(10),
            boot_code_poll: Duration::from_secs(2),
            host_boot_timeout: Duration::from_secs(900),
        }
    }
}

/// The controller being updated: both control channels plus the timing
/// that governs waits on it.
///
/// There is exactly one of these per run and it is handed to each stage as
/// `&mut`, so the session is never shared between in-flight operations.
pub struct Device {
    pub(crate) session: Box<dyn RemoteSession>,
    pub(crate) protocol: Box<dyn ProtocolClient>,
    pub(crate) timing: Timing,
    pub(crate) log: Logger,
}

impl Device {
    pub fn new(
        session: Box<dyn RemoteSession>,
        protocol: Box<dyn ProtocolClient>,
        timing: Timing,
        log: Logger,
    ) -> Self {
        Self { session, protocol, timing, log }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.session.connect().await
    }

    pub async fn close(&mut self) {
        self.session.close().await
    }

    /// Run a command, waiting up to the configured command timeout for the
    /// prompt.
    pub(crate) async fn run(
        &mut self,
        cmd: &str,
    ) -> Result<String, SessionError> {
        self.session
            .send(cmd, fw_comms::DEFAULT_PROMPT, self.timing.command_timeout)
            .await
    }
}
