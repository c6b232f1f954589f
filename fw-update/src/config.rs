// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Inventory and strategy-profile files.

use crate::device::Timing;
use crate::error::ConfigError;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;
use strum_macros::Display;
use strum_macros::EnumString;

/// The machine being updated and the ordered list of components to update.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Inventory {
    pub system: SystemConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub updates: Vec<UpdateConfig>,
}

impl Inventory {
    /// Load an `Inventory` from the given TOML file.
    pub fn from_file(path: &Utf8Path) -> Result<Inventory, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let inventory: Inventory = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(inventory)
    }

    /// Check that every flashable component has an image to flash.
    pub fn validate_for_update(&self) -> Result<(), ConfigError> {
        let missing: Vec<&str> = self
            .updates
            .iter()
            .filter(|u| u.kind.is_flashable() && u.file.is_none())
            .map(|u| u.name.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "no firmware file configured for: {}",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SystemConfig {
    pub profile: String,
    #[serde(rename = "type", default)]
    pub kind: SystemType,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub pfr: PfrConfig,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Display,
)]
pub enum SystemType {
    #[default]
    Standard,
    #[serde(rename = "PFR")]
    #[strum(serialize = "PFR")]
    Pfr,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub ip: String,
    pub user: String,
    #[serde(rename = "pass")]
    pub password: String,
    /// If present, the session escalates to root with `su -` after login.
    #[serde(default)]
    pub root_pass: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_https_port() -> u16 {
    443
}

/// Where the platform-firmware-resilience manager publishes its recovery
/// counter.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PfrConfig {
    pub service: String,
    pub object_path: String,
    pub interface: String,
    pub property: String,
}

impl Default for PfrConfig {
    fn default() -> Self {
        Self {
            service: "xyz.openbmc_project.PFR.Manager".to_string(),
            object_path: "/xyz/openbmc_project/pfr".to_string(),
            interface: "xyz.openbmc_project.PFR.Attributes".to_string(),
            property: "RecoveryCount".to_string(),
        }
    }
}

/// `[timing]` overrides, all in seconds.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    pub poll_interval: Option<u64>,
    pub heartbeat_timeout: Option<u64>,
    pub command_timeout: Option<u64>,
    pub reconnect_settle: Option<u64>,
    pub reconnect_timeout: Option<u64>,
    pub reconnect_backoff: Option<u64>,
    pub readiness_timeout: Option<u64>,
    pub post_reboot_settle: Option<u64>,
    pub power_settle: Option<u64>,
    pub boot_code_poll: Option<u64>,
    pub host_boot_timeout: Option<u64>,
}

impl TimingConfig {
    pub fn to_timing(&self) -> Timing {
        let d = Timing::default();
        let pick = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        Timing {
            poll_interval: pick(self.poll_interval, d.poll_interval),
            heartbeat_timeout: pick(
                self.heartbeat_timeout,
                d.heartbeat_timeout,
            ),
            command_timeout: pick(self.command_timeout, d.command_timeout),
            reconnect_settle: pick(self.reconnect_settle, d.reconnect_settle),
            reconnect_timeout: pick(
                self.reconnect_timeout,
                d.reconnect_timeout,
            ),
            reconnect_backoff: pick(
                self.reconnect_backoff,
                d.reconnect_backoff,
            ),
            readiness_timeout: pick(
                self.readiness_timeout,
                d.readiness_timeout,
            ),
            post_reboot_settle: pick(
                self.post_reboot_settle,
                d.post_reboot_settle,
            ),
            power_settle: pick(self.power_settle, d.power_settle),
            boot_code_poll: pick(self.boot_code_poll, d.boot_code_poll),
            host_boot_timeout: pick(
                self.host_boot_timeout,
                d.host_boot_timeout,
            ),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
)]
pub enum ComponentKind {
    #[serde(rename = "BIOS")]
    #[strum(serialize = "BIOS")]
    Bios,
    #[serde(rename = "BMC")]
    #[strum(serialize = "BMC")]
    Bmc,
    #[serde(rename = "CPLD")]
    #[strum(serialize = "CPLD")]
    Cpld,
    /// The security auditor; never flashed.
    #[serde(rename = "PFR")]
    #[strum(serialize = "PFR")]
    Pfr,
}

impl ComponentKind {
    pub fn is_flashable(self) -> bool {
        !matches!(self, ComponentKind::Pfr)
    }
}

/// When the controller activates a staged image.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    Display,
    EnumString,
)]
pub enum ApplyTime {
    /// Activate right away; the controller reboots on its own.
    #[default]
    Immediate,
    /// Stage only; activation waits for an explicit reset.
    OnReset,
}

/// One hardware target.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    #[serde(default)]
    pub subtype: Option<String>,
    pub version: String,
    #[serde(default)]
    pub file: Option<Utf8PathBuf>,
    /// Named strategy profile; defaults to the system profile.
    #[serde(default)]
    pub profile: Option<String>,

    // Explicit overrides; these win over anything a profile says.
    #[serde(default)]
    pub apply_time: Option<ApplyTime>,
    #[serde(default)]
    pub preserve: Option<bool>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub primary_path: Option<String>,
    #[serde(default)]
    pub secondary_path: Option<String>,
    #[serde(default)]
    pub update_endpoint: Option<String>,
    #[serde(default)]
    pub payload_file: Option<Utf8PathBuf>,
}

/// Named strategy bundles, keyed by profile name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StrategyFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, StrategyProfile>,
}

impl StrategyFile {
    /// Load strategy profiles from `path`.
    ///
    /// A missing file is not an error: every component then falls back to its
    /// type defaults.
    pub fn load_optional(
        path: &Utf8Path,
        log: &Logger,
    ) -> Result<StrategyFile, ConfigError> {
        if !path.exists() {
            info!(
                log, "no strategy file; using built-in defaults";
                "path" => %path,
            );
            return Ok(StrategyFile::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let mut file: StrategyFile = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;

        // Payload files are named relative to the strategy file.
        let base = path.parent().unwrap_or(Utf8Path::new("."));
        for profile in file.profiles.values_mut() {
            if let Some(payload_file) = profile.payload_file.as_mut() {
                if payload_file.is_relative() {
                    *payload_file = base.join(&*payload_file);
                }
            }
        }
        Ok(file)
    }

    pub fn profile(&self, name: &str) -> Option<&StrategyProfile> {
        self.profiles.get(name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StrategyProfile {
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default, alias = "verify_path")]
    pub primary_path: Option<String>,
    #[serde(default)]
    pub secondary_path: Option<String>,
    #[serde(default)]
    pub update_endpoint: Option<String>,
    /// Inline payload template; `payload_file` wins if both are given.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub payload_file: Option<Utf8PathBuf>,
}
