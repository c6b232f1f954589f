// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A simulated controller for exercising the pipeline on a paused clock.

use crate::device::Device;
use crate::device::Timing;
use async_trait::async_trait;
use camino::Utf8Path;
use fw_comms::error::ProtocolError;
use fw_comms::error::SessionError;
use fw_comms::ProtocolClient;
use fw_comms::RemoteSession;
use serde_json::json;
use serde_json::Value;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) const BMC_PRIMARY: &str = "/xyz/openbmc_project/software/BMCPrimary";
pub(crate) const BMC_SECONDARY: &str =
    "/xyz/openbmc_project/software/BMCSecondary";
pub(crate) const BIOS_PATH: &str = "/xyz/openbmc_project/software/BIOS";

pub(crate) fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

type BootHook = Box<dyn FnOnce(&mut SimState) + Send>;

struct Outage {
    starts: Instant,
    ends: Instant,
    on_boot: Option<BootHook>,
}

pub(crate) struct SimState {
    pub connected: bool,
    outage: Option<Outage>,
    /// Readiness indicators stay "not ready" until these instants.
    pub ready_at: Option<Instant>,
    pub jobs_done_at: Option<Instant>,
    pub versions: BTreeMap<String, String>,
    pub boot_info: String,
    pub redfish_log: Vec<String>,
    scheduled_log: Vec<(Instant, String)>,
    pub sel: Vec<String>,
    /// Successive boot-progress outputs; the last one repeats.
    pub post_codes: VecDeque<String>,
    pub host_on: bool,
    pub recovery_output: String,
    pub commands: Vec<String>,
    pub connects: usize,
    pub reboot_duration: Duration,
    /// Runs when the controller comes back from a requested reset.
    pub on_reset: Option<BootHook>,
}

impl SimState {
    /// The controller drops off the network `after` from now for
    /// `self.reboot_duration`; `on_boot` runs when it comes back.
    pub fn reboot_in(
        &mut self,
        after: Duration,
        on_boot: impl FnOnce(&mut SimState) + Send + 'static,
    ) {
        let starts = Instant::now() + after;
        self.outage = Some(Outage {
            starts,
            ends: starts + self.reboot_duration,
            on_boot: Some(Box::new(on_boot)),
        });
    }

    fn reset_in(&mut self, after: Duration) {
        let on_boot = self.on_reset.take();
        self.reboot_in(after, move |state| {
            if let Some(hook) = on_boot {
                hook(state);
            }
        });
    }

    /// Append an operation-log line `after` from now.
    pub fn log_in(&mut self, after: Duration, line: impl Into<String>) {
        self.scheduled_log.push((Instant::now() + after, line.into()));
    }

    pub fn count_commands(&self, needle: &str) -> usize {
        self.commands.iter().filter(|c| c.contains(needle)).count()
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = self
            .scheduled_log
            .drain(..)
            .partition(|(at, _)| *at <= now);
        self.scheduled_log = pending;
        self.redfish_log.extend(due.into_iter().map(|(_, line)| line));
    }

    fn is_down(&self, now: Instant) -> bool {
        self.outage.as_ref().is_some_and(|o| now >= o.starts)
    }

    fn respond(&mut self, cmd: &str) -> Result<String, SessionError> {
        let now = Instant::now();
        let not_before = |at: Option<Instant>| at.map_or(true, |t| now >= t);

        if cmd == "echo check" || cmd.starts_with("rm -rf") {
            return Ok(String::new());
        }
        if cmd == "reboot" {
            self.reset_in(Duration::ZERO);
            self.connected = false;
            return Err(SessionError::lost("connection reset by peer"));
        }
        if cmd.contains("CurrentBMCState") {
            let state =
                if not_before(self.ready_at) { "Ready" } else { "NotReady" };
            return Ok(format!(
                "s \"xyz.openbmc_project.State.BMC.BMCState.{state}\""
            ));
        }
        if cmd == "systemctl list-jobs" {
            return Ok(if not_before(self.jobs_done_at) {
                "No jobs running.".to_string()
            } else {
                "JOB UNIT TYPE STATE\n1 jobs listed.".to_string()
            });
        }
        if cmd.contains("processBootInfo") {
            return Ok(self.boot_info.clone());
        }
        if cmd.contains("Software.BMC.Updater") {
            let path = cmd.split_whitespace().nth(3).unwrap_or_default();
            return Ok(match self.versions.get(path) {
                Some(version) => format!("s \"{version}\""),
                None => "Failed to get property Version".to_string(),
            });
        }
        if cmd.starts_with("wc -l /var/log/redfish") {
            return Ok(self.redfish_log.len().to_string());
        }
        if let Some(rest) = cmd.strip_prefix("tail -n ") {
            let arg = rest.split_whitespace().next().unwrap_or_default();
            return Ok(tail(&self.redfish_log, arg));
        }
        if cmd == "ipmitool sel list | wc -l" {
            return Ok(self.sel.len().to_string());
        }
        if let Some(n) = cmd.strip_prefix("ipmitool sel list | tail -n ") {
            return Ok(tail(&self.sel, n));
        }
        if let Some(op) = cmd.strip_prefix("ipmitool chassis power ") {
            return Ok(match op {
                "off" => {
                    self.host_on = false;
                    "Chassis Power Control: Down/Off".to_string()
                }
                "on" => {
                    self.host_on = true;
                    "Chassis Power Control: Up/On".to_string()
                }
                _ => format!(
                    "Chassis Power is {}",
                    if self.host_on { "on" } else { "off" }
                ),
            });
        }
        if cmd.contains("State.Boot.Raw") {
            let code = if self.post_codes.len() > 1 {
                self.post_codes.pop_front()
            } else {
                self.post_codes.front().cloned()
            };
            return Ok(code.unwrap_or_default());
        }
        if cmd.contains("RecoveryCount") {
            return Ok(self.recovery_output.clone());
        }
        Ok(String::new())
    }
}

fn tail(lines: &[String], arg: &str) -> String {
    let selected = if let Some(from) = arg.strip_prefix('+') {
        let from: usize = from.parse().unwrap_or(1);
        lines.iter().skip(from.saturating_sub(1)).collect::<Vec<_>>()
    } else {
        let n: usize = arg.parse().unwrap_or(10);
        lines.iter().skip(lines.len().saturating_sub(n)).collect()
    };
    selected.into_iter().cloned().collect::<Vec<_>>().join("\n")
}

/// A simulated controller reachable over the command channel.
#[derive(Clone)]
pub(crate) struct SimBmc {
    state: Arc<Mutex<SimState>>,
}

impl SimBmc {
    pub fn new() -> Self {
        let state = SimState {
            connected: true,
            outage: None,
            ready_at: None,
            jobs_done_at: None,
            versions: [
                (BMC_PRIMARY.to_string(), "3.23.00".to_string()),
                (BMC_SECONDARY.to_string(), "3.22.00".to_string()),
                (BIOS_PATH.to_string(), "1.0.0".to_string()),
            ]
            .into(),
            boot_info: "Boot Source: Primary".to_string(),
            redfish_log: vec!["boot".to_string(); 3],
            scheduled_log: Vec::new(),
            sel: vec!["1 | Power on".to_string()],
            post_codes: ["t 170".to_string()].into(),
            host_on: true,
            recovery_output: "u 0".to_string(),
            commands: Vec::new(),
            connects: 0,
            reboot_duration: Duration::from_secs(120),
            on_reset: None,
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn device(&self, redfish: SimRedfish) -> Device {
        Device::new(
            Box::new(self.clone()),
            Box::new(redfish),
            Timing::default(),
            discard(),
        )
    }
}

#[async_trait]
impl RemoteSession for SimBmc {
    async fn connect(&mut self) -> Result<(), SessionError> {
        let mut state = self.state();
        let now = Instant::now();
        if let Some(outage) = &state.outage {
            if now < outage.ends && now >= outage.starts {
                return Err(SessionError::ConnectTimeout {
                    addr: "sim:22".to_string(),
                    after: Duration::from_secs(10),
                });
            }
        }
        if state.outage.as_ref().is_some_and(|o| now >= o.ends) {
            let outage = state.outage.take();
            if let Some(hook) = outage.and_then(|o| o.on_boot) {
                hook(&mut *state);
            }
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.state().connected = false;
    }

    async fn send(
        &mut self,
        cmd: &str,
        _expect: &str,
        _timeout: Duration,
    ) -> Result<String, SessionError> {
        let mut state = self.state();
        state.tick();
        if state.is_down(Instant::now()) && state.connected {
            state.connected = false;
            return Err(SessionError::lost("connection reset by peer"));
        }
        if !state.connected {
            return Err(SessionError::NotConnected);
        }
        state.commands.push(cmd.to_string());
        state.respond(cmd)
    }
}

type UploadHook = Box<dyn FnOnce(&mut SimState) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Request {
    Get(String),
    Upload { endpoint: String, payload: Value },
    Action { endpoint: String, payload: Value },
}

/// Redfish side of a [`SimBmc`].
///
/// Each upload consumes the next queued hook, which is how tests describe what
/// the controller does after receiving an image.
#[derive(Clone)]
pub(crate) struct SimRedfish {
    bmc: SimBmc,
    upload_hooks: Arc<Mutex<VecDeque<UploadHook>>>,
    pub requests: Arc<Mutex<Vec<Request>>>,
    pub reject_uploads: bool,
    pub reject_actions: bool,
}

impl SimRedfish {
    pub fn new(bmc: &SimBmc) -> Self {
        Self {
            bmc: bmc.clone(),
            upload_hooks: Arc::default(),
            requests: Arc::default(),
            reject_uploads: false,
            reject_actions: false,
        }
    }

    pub fn on_upload(
        &self,
        hook: impl FnOnce(&mut SimState) + Send + 'static,
    ) -> &Self {
        self.upload_hooks.lock().unwrap().push_back(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolClient for SimRedfish {
    async fn get(&self, path: &str) -> Result<Value, ProtocolError> {
        self.requests.lock().unwrap().push(Request::Get(path.to_string()));
        Ok(match path {
            "/redfish/v1/UpdateService" => json!({
                "MultipartHttpPushUri": "/redfish/v1/UpdateService/update-multipart"
            }),
            "/redfish/v1/Managers/bmc" => json!({
                "Actions": {
                    "#Manager.Reset": {
                        "target": "/redfish/v1/Managers/bmc/Actions/Manager.Reset"
                    }
                }
            }),
            _ => Value::Null,
        })
    }

    async fn post_file(
        &self,
        endpoint: &str,
        _file: &Utf8Path,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        self.requests.lock().unwrap().push(Request::Upload {
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
        });
        if self.reject_uploads {
            return Err(ProtocolError::Application {
                url: endpoint.to_string(),
                message: "The image signature is invalid.".to_string(),
            });
        }
        let hook = self.upload_hooks.lock().unwrap().pop_front();
        if let Some(hook) = hook {
            hook(&mut *self.bmc.state());
        }
        Ok(json!({ "Id": "0", "TaskState": "Running" }))
    }

    async fn post_action(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        self.requests.lock().unwrap().push(Request::Action {
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
        });
        if self.reject_actions {
            return Err(ProtocolError::Application {
                url: endpoint.to_string(),
                message: "The action is not supported.".to_string(),
            });
        }
        if endpoint.ends_with("Manager.Reset") {
            self.bmc.state().reset_in(Duration::from_secs(1));
        }
        Ok(Value::Null)
    }
}
