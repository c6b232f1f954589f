// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Updatable firmware components.

mod auditor;
mod bios;
mod bmc;
mod cpld;

pub use auditor::AuditResult;
pub use auditor::Auditor;
pub use bios::Bios;
pub use bmc::BootBank;
pub use bmc::Bmc;
pub use cpld::Cpld;

use crate::config::ComponentKind;
use crate::config::UpdateConfig;
use crate::device::Device;
use crate::error::ComponentError;
use crate::error::ConfigError;
use crate::error::VerificationSkipped;
use crate::error::TimeoutError;
use crate::log_oracle::BaselineLogger;
use crate::log_oracle::LogOracle;
use crate::log_oracle::Marker;
use crate::power::Rebootable;
use crate::resilience::reconnect;
use crate::resilience::wait_for_host_boot;
use crate::resilience::wait_until_ready;
use crate::resilience::Verbosity;
use crate::strategy::Strategy;
use crate::version::check_version;
use crate::version::VersionCheck;
use crate::version::VersionPolicy;
use async_trait::async_trait;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use tokio::time::sleep;
use tokio::time::Instant;

const UPDATE_SERVICE: &str = "/redfish/v1/UpdateService";
const FALLBACK_UPDATE_ENDPOINT: &str = "/redfish/v1/UpdateService/update";
const UPDATER_SERVICE: &str = "xyz.openbmc_project.Software.BMC.Updater";
const STAGING_CLEANUP_CMD: &str = "rm -rf /tmp/images/*";

/// Version string reported when a property cannot be read or parsed.
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Version string for a component with nowhere to read a version from.
pub const NO_VERSION_PATH: &str = "Unknown (No verify_path configured)";

/// One piece of firmware that can be read, flashed and verified.
#[async_trait]
pub trait FirmwareComponent: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ComponentKind;

    /// The version this run should end up with.
    fn target_version(&self) -> &str;

    fn strategy(&self) -> &Strategy;

    fn log(&self) -> &Logger;

    /// Read the running version. Waits for controller readiness first.
    async fn get_current_version(
        &self,
        dev: &mut Device,
        verbosity: Verbosity,
    ) -> Result<String, ComponentError>;

    /// Stage the image on the controller and start the flash.
    async fn upload_firmware(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError>;

    /// Wait for the flash to finish, handling any reboots along the way.
    async fn monitor_update(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError>;

    /// Compare the running version against the target.
    ///
    /// If the update may have reset credentials, no version read is attempted
    /// and [`VerificationSkipped`] is returned instead.
    async fn verify_update(
        &self,
        dev: &mut Device,
    ) -> Result<VersionCheck, ComponentError> {
        if !self.strategy().preserve {
            return Err(VerificationSkipped {
                component: self.name().to_string(),
                reason: "configuration was not preserved; credentials may \
                         have changed"
                    .to_string(),
            }
            .into());
        }
        let current =
            self.get_current_version(dev, Verbosity::Verbose).await?;
        let check = check_version(
            self.name(),
            &current,
            self.target_version(),
            VersionPolicy::Observational,
            self.log(),
        )?;
        Ok(check)
    }
}

/// Build the component for one `[[updates]]` entry.
///
/// PFR entries name the auditor and are never flashed, so they are rejected
/// here.
pub fn build_component(
    update: &UpdateConfig,
    strategy: Strategy,
    log: &Logger,
) -> Result<Box<dyn FirmwareComponent>, ConfigError> {
    let log = log.new(slog::o!(
        "component" => update.name.clone(),
        "type" => update.kind.to_string(),
    ));
    let oracle: Box<dyn BaselineLogger> = Box::new(LogOracle::new(&log));
    let parts = Parts { update: update.clone(), strategy, oracle, log };
    Ok(match update.kind {
        ComponentKind::Bios => Box::new(Bios::new(parts)),
        ComponentKind::Bmc => Box::new(Bmc::new(parts)),
        ComponentKind::Cpld => Box::new(Cpld::new(parts)),
        ComponentKind::Pfr => {
            return Err(ConfigError::Invalid(format!(
                "{}: PFR entries configure the auditor and cannot be updated",
                update.name
            )));
        }
    })
}

/// What every flashable component is built from.
pub(crate) struct Parts {
    pub update: UpdateConfig,
    pub strategy: Strategy,
    pub oracle: Box<dyn BaselineLogger>,
    pub log: Logger,
}

pub(crate) fn version_query(path: &str) -> String {
    format!(
        "busctl get-property {UPDATER_SERVICE} {path} \
         xyz.openbmc_project.Software.Version Version"
    )
}

/// The first double-quoted string in a D-Bus property dump (`s "1.2.3"`).
pub(crate) fn extract_quoted(output: &str) -> Option<&str> {
    let start = output.find('"')? + 1;
    let len = output[start..].find('"')?;
    Some(&output[start..start + len])
}

/// Read the version published at `path`, or [`UNKNOWN_VERSION`] if the
/// property is missing.
pub(crate) async fn read_version(
    dev: &mut Device,
    path: &str,
) -> Result<String, ComponentError> {
    let output = dev.run(&version_query(path)).await?;
    Ok(extract_quoted(&output).unwrap_or(UNKNOWN_VERSION).to_string())
}

/// Version of a single-image component once the controller is ready.
pub(crate) async fn single_image_version(
    dev: &mut Device,
    strategy: &Strategy,
    verbosity: Verbosity,
) -> Result<String, ComponentError> {
    wait_until_ready(dev, verbosity).await;
    match strategy.primary_path.as_deref() {
        Some(path) => read_version(dev, path).await,
        None => Ok(NO_VERSION_PATH.to_string()),
    }
}

pub(crate) async fn clean_staging_area(dev: &mut Device, log: &Logger) {
    if let Err(err) = dev.run(STAGING_CLEANUP_CMD).await {
        warn!(log, "failed to clean staging area"; &err);
    }
}

/// Upload the image for `update` using `strategy`, logging what was sent and
/// what came back.
pub(crate) async fn upload_image(
    update: &UpdateConfig,
    strategy: &Strategy,
    dev: &mut Device,
    log: &Logger,
) -> Result<Value, ComponentError> {
    let file = update.file.as_ref().ok_or_else(|| {
        ComponentError::MissingFirmwareFile { component: update.name.clone() }
    })?;
    let image = tokio::fs::read(file).await.map_err(|err| {
        ComponentError::FirmwareFile { path: file.clone(), err }
    })?;
    let digest = hex::encode(Sha256::digest(&image));

    let endpoint = match &strategy.update_endpoint {
        Some(endpoint) => endpoint.clone(),
        None => discover_update_endpoint(dev, log).await,
    };
    info!(
        log, "uploading firmware";
        "file" => %file,
        "sha256" => &digest,
        "endpoint" => &endpoint,
        "apply_time" => %strategy.apply_time,
        "preserve" => strategy.preserve,
    );
    let response = dev
        .protocol
        .post_file(&endpoint, file, strategy.payload.as_value())
        .await?;
    match response.get("Id").and_then(Value::as_str) {
        Some(task) => info!(log, "update task created"; "task" => task),
        None => info!(log, "upload accepted"; "response" => %response),
    }
    Ok(response)
}

/// Poll the operation log until one of `wanted` shows up, returning the line
/// that carried it.
///
/// An apply-failed marker is a hard failure whenever it is in `wanted`. If the
/// command channel drops, the controller is waited for and polling resumes,
/// unless the update does not preserve configuration: then the controller
/// may not let us back in, and monitoring ends in a soft stop.
pub(crate) async fn await_marker(
    component: &str,
    oracle: &dyn BaselineLogger,
    dev: &mut Device,
    strategy: &Strategy,
    wanted: &[Marker],
    what: &str,
    log: &Logger,
) -> Result<String, ComponentError> {
    let deadline = Instant::now() + strategy.timeout;
    while Instant::now() < deadline {
        match oracle.fetch_new_logs(dev).await {
            Ok(logs) => match Marker::first_in(&logs, wanted) {
                Some((Marker::ApplyFailed, line)) => {
                    return Err(ComponentError::ApplyFailed {
                        marker: line.to_string(),
                    });
                }
                Some((_, line)) => return Ok(line.to_string()),
                None => {}
            },
            Err(err) if err.is_session_lost() => {
                warn!(log, "control channel lost while monitoring"; &err);
                if !strategy.preserve {
                    return Err(VerificationSkipped {
                        component: component.to_string(),
                        reason: format!(
                            "control channel lost while waiting for {what} \
                             and configuration was not preserved"
                        ),
                    }
                    .into());
                }
                reconnect(dev).await?;
            }
            Err(err) => debug!(log, "failed to read operation log"; &err),
        }
        sleep(dev.timing.poll_interval).await;
    }
    Err(TimeoutError::new(what, strategy.timeout).into())
}

/// After a host firmware flash: check the SEL, power the host back on and
/// watch it boot. All best-effort.
pub(crate) async fn bring_up_host(
    oracle: &dyn BaselineLogger,
    dev: &mut Device,
) {
    oracle.check_system_logs(dev).await;
    dev.host_power_on().await;
    wait_for_host_boot(dev).await;
}

async fn discover_update_endpoint(dev: &mut Device, log: &Logger) -> String {
    match dev.protocol.get(UPDATE_SERVICE).await {
        Ok(service) => {
            if let Some(uri) =
                service.get("MultipartHttpPushUri").and_then(Value::as_str)
            {
                return uri.to_string();
            }
        }
        Err(err) => {
            warn!(log, "failed to read update service"; &err);
        }
    }
    FALLBACK_UPDATE_ENDPOINT.to_string()
}
