// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Per-component update strategy.
//!
//! A [`Strategy`] is resolved once per component from, in order of
//! precedence: the explicit values on the `[[updates]]` entry, the named
//! profile in the strategy file, the defaults for the component's type, and
//! finally the hard-coded fallbacks (600 s timeout, immediate activation,
//! configuration preserved).

use crate::config::ApplyTime;
use crate::config::ComponentKind;
use crate::config::StrategyFile;
use crate::config::UpdateConfig;
use crate::error::ConfigError;
use crate::error::PayloadFileError;
use camino::Utf8Path;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

const APPLY_TIME_KEYS: &[&str] = &["@Redfish.OperationApplyTime", "ApplyTime"];
const PRESERVE_KEYS: &[&str] = &["Preserve", "PreserveConfiguration"];

/// The JSON object sent alongside a firmware image.
///
/// Controllers disagree about where the activation and preservation flags
/// live, so the accessors look in a fixed list of sections, in order: the top
/// level, `UpdateParameters`, `Oem` and each vendor object under it, then
/// `UpdateParameters.Oem` and each vendor object under that. Vendor objects
/// are visited in name order. The first section carrying a flag wins.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadTemplate(Value);

impl PayloadTemplate {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let load = || -> Result<Value, PayloadFileError> {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        };
        load()
            .map(Self)
            .map_err(|err| ConfigError::PayloadFile { path: path.into(), err })
    }

    /// The template a component type uses when nothing else is configured.
    pub fn type_default(kind: ComponentKind, subtype: Option<&str>) -> Self {
        let target = match kind {
            ComponentKind::Bios => {
                "/redfish/v1/UpdateService/FirmwareInventory/bios_active"
                    .to_string()
            }
            ComponentKind::Bmc => "/redfish/v1/Managers/bmc".to_string(),
            ComponentKind::Cpld => match subtype {
                Some(subtype) => format!(
                    "/redfish/v1/UpdateService/FirmwareInventory/cpld_{}",
                    subtype.to_lowercase()
                ),
                None => {
                    "/redfish/v1/UpdateService/FirmwareInventory/cpld"
                        .to_string()
                }
            },
            ComponentKind::Pfr => return Self(Value::Object(Map::new())),
        };
        Self(json!({
            "UpdateParameters": {
                "Targets": [target],
                "@Redfish.OperationApplyTime": "Immediate",
            }
        }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// The activation policy named in the template, if any.
    pub fn apply_time(&self) -> Option<&str> {
        self.flag(APPLY_TIME_KEYS).and_then(Value::as_str)
    }

    /// Whether the template asks the controller to keep its configuration.
    pub fn preserve(&self) -> Option<bool> {
        self.flag(PRESERVE_KEYS).and_then(Value::as_bool)
    }

    /// Rewrite the activation policy where the template carries it, or add
    /// it under `UpdateParameters` if it carries none.
    pub fn set_apply_time(&mut self, apply_time: ApplyTime) {
        self.set_flag(APPLY_TIME_KEYS, Value::String(apply_time.to_string()));
    }

    /// Rewrite the preservation flag where the template carries it, or add
    /// it under `UpdateParameters` if it carries none.
    pub fn set_preserve(&mut self, preserve: bool) {
        self.set_flag(PRESERVE_KEYS, Value::Bool(preserve));
    }

    fn flag(&self, keys: &[&str]) -> Option<&Value> {
        self.0.pointer(&self.flag_pointer(keys)?)
    }

    fn set_flag(&mut self, keys: &[&str], value: Value) {
        if let Some(pointer) = self.flag_pointer(keys) {
            if let Some(slot) = self.0.pointer_mut(&pointer) {
                *slot = value;
            }
            return;
        }
        let Value::Object(root) = &mut self.0 else {
            return;
        };
        let params = root
            .entry("UpdateParameters")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(params) = params {
            params.insert(keys[0].to_string(), value);
        }
    }

    /// JSON pointer to the first of `keys` found in a flag section.
    fn flag_pointer(&self, keys: &[&str]) -> Option<String> {
        flag_sections(&self.0).into_iter().find_map(|section| {
            let map = self.0.pointer(&section)?.as_object()?;
            let key = keys.iter().find(|key| map.contains_key(**key))?;
            Some(format!("{section}/{}", escape_pointer(key)))
        })
    }
}

fn flag_sections(root: &Value) -> Vec<String> {
    let mut sections = vec![String::new(), "/UpdateParameters".to_string()];
    for parent in ["", "/UpdateParameters"] {
        let oem = format!("{parent}/Oem");
        let Some(Value::Object(vendors)) = root.pointer(&oem) else {
            continue;
        };
        let vendors: Vec<String> = vendors
            .iter()
            .filter(|(_, section)| section.is_object())
            .map(|(vendor, _)| format!("{oem}/{}", escape_pointer(vendor)))
            .collect();
        sections.push(oem);
        sections.extend(vendors);
    }
    sections
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Everything a component needs to know about how to update itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Strategy {
    pub timeout: Duration,
    pub primary_path: Option<String>,
    pub secondary_path: Option<String>,
    /// If unset, the endpoint is discovered from the controller.
    pub update_endpoint: Option<String>,
    pub payload: PayloadTemplate,
    pub apply_time: ApplyTime,
    /// If false, the update may reset credentials and network identity, and
    /// nothing after the upload can assume the controller is reachable.
    pub preserve: bool,
}

struct TypeDefaults {
    primary_path: Option<&'static str>,
    secondary_path: Option<&'static str>,
}

fn type_defaults(kind: ComponentKind) -> TypeDefaults {
    match kind {
        ComponentKind::Bios => TypeDefaults {
            primary_path: Some("/xyz/openbmc_project/software/BIOS"),
            secondary_path: None,
        },
        ComponentKind::Bmc => TypeDefaults {
            primary_path: Some("/xyz/openbmc_project/software/BMCPrimary"),
            secondary_path: Some("/xyz/openbmc_project/software/BMCSecondary"),
        },
        ComponentKind::Cpld | ComponentKind::Pfr => {
            TypeDefaults { primary_path: None, secondary_path: None }
        }
    }
}

/// Resolve the strategy for one `[[updates]]` entry.
///
/// `system_profile` is used when the entry does not name its own profile. An
/// unknown profile is not fatal: it is logged and the type defaults apply.
pub fn resolve_strategy(
    update: &UpdateConfig,
    system_profile: &str,
    profiles: &StrategyFile,
    log: &Logger,
) -> Result<Strategy, ConfigError> {
    let profile_name = update.profile.as_deref().unwrap_or(system_profile);
    let profile = profiles.profile(profile_name);
    if profile.is_none() {
        warn!(
            log, "strategy profile not found; using type defaults";
            "component" => &update.name,
            "profile" => profile_name,
        );
    }
    let defaults = type_defaults(update.kind);

    let timeout = update
        .timeout
        .or_else(|| profile.and_then(|p| p.timeout))
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    let primary_path = update
        .primary_path
        .clone()
        .or_else(|| profile.and_then(|p| p.primary_path.clone()))
        .or_else(|| defaults.primary_path.map(str::to_string));
    let secondary_path = update
        .secondary_path
        .clone()
        .or_else(|| profile.and_then(|p| p.secondary_path.clone()))
        .or_else(|| defaults.secondary_path.map(str::to_string));
    let update_endpoint = update
        .update_endpoint
        .clone()
        .or_else(|| profile.and_then(|p| p.update_endpoint.clone()));

    let mut payload = if let Some(path) = &update.payload_file {
        PayloadTemplate::from_file(path)?
    } else if let Some(path) = profile.and_then(|p| p.payload_file.as_ref())
    {
        PayloadTemplate::from_file(path)?
    } else if let Some(value) = profile.and_then(|p| p.payload.clone()) {
        PayloadTemplate::new(value)
    } else {
        PayloadTemplate::type_default(update.kind, update.subtype.as_deref())
    };

    let apply_time = match update.apply_time {
        Some(apply_time) => {
            // Keep what we send consistent with how we monitor.
            payload.set_apply_time(apply_time);
            apply_time
        }
        None => match payload.apply_time() {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "{}: unsupported apply time {raw:?}",
                    update.name
                ))
            })?,
            None => ApplyTime::default(),
        },
    };
    let preserve = match update.preserve {
        Some(preserve) => {
            payload.set_preserve(preserve);
            preserve
        }
        None => payload.preserve().unwrap_or(true),
    };

    let strategy = Strategy {
        timeout,
        primary_path,
        secondary_path,
        update_endpoint,
        payload,
        apply_time,
        preserve,
    };
    debug!(
        log, "resolved strategy";
        "component" => &update.name,
        "profile" => profile_name,
        "timeout" => ?strategy.timeout,
        "apply_time" => %strategy.apply_time,
        "preserve" => strategy.preserve,
    );
    Ok(strategy)
}
