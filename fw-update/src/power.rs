// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use crate::device::Device;
use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use slog::info;
use slog::warn;
use tokio::time::sleep;

const MANAGER: &str = "/redfish/v1/Managers/bmc";
const DEFAULT_RESET_TARGET: &str =
    "/redfish/v1/Managers/bmc/Actions/Manager.Reset";

/// Power and reset control of the host and its controller.
///
/// All operations are best-effort: failures are logged and the caller moves
/// on, since the next stage will notice if the machine is not in the expected
/// state.
#[async_trait]
pub trait Rebootable: Send {
    /// Power the host off and confirm it reports off.
    async fn host_power_off(&mut self);

    async fn host_power_on(&mut self);

    /// Ask the controller to restart. The command channel is expected to drop
    /// shortly afterwards.
    async fn reboot_controller(&mut self);
}

#[async_trait]
impl Rebootable for Device {
    async fn host_power_off(&mut self) {
        info!(self.log, "powering off host");
        if let Err(err) = self.run("ipmitool chassis power off").await {
            warn!(self.log, "host power off failed"; &err);
            return;
        }
        sleep(self.timing.power_settle).await;
        match self.run("ipmitool chassis power status").await {
            Ok(status) if status.to_lowercase().contains("off") => {
                info!(self.log, "host is powered off");
            }
            Ok(status) => {
                warn!(
                    self.log, "host did not report power off";
                    "status" => status,
                );
            }
            Err(err) => warn!(self.log, "host power status failed"; &err),
        }
    }

    async fn host_power_on(&mut self) {
        info!(self.log, "powering on host");
        if let Err(err) = self.run("ipmitool chassis power on").await {
            warn!(self.log, "host power on failed"; &err);
        }
    }

    async fn reboot_controller(&mut self) {
        let target = reset_target(self.protocol.get(MANAGER).await.ok());
        info!(self.log, "requesting controller reset"; "target" => &target);
        let body = json!({ "ResetType": "GracefulRestart" });
        match self.protocol.post_action(&target, &body).await {
            Ok(_) => return,
            Err(err) => {
                warn!(
                    self.log, "reset action failed; falling back to reboot";
                    &err,
                );
            }
        }
        match self.run("reboot").await {
            Ok(_) => {}
            // The controller going away under us is the point.
            Err(err) if err.is_session_lost() => {}
            Err(err) => warn!(self.log, "reboot command failed"; &err),
        }
    }
}

fn reset_target(manager: Option<Value>) -> String {
    manager
        .as_ref()
        .and_then(|m| m.pointer("/Actions/#Manager.Reset/target"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_RESET_TARGET)
        .to_string()
}
