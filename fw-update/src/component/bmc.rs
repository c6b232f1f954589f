// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use super::clean_staging_area;
use super::read_version;
use super::upload_image;
use super::FirmwareComponent;
use super::Parts;
use super::NO_VERSION_PATH;
use crate::config::ApplyTime;
use crate::config::ComponentKind;
use crate::config::UpdateConfig;
use crate::device::Device;
use crate::error::ComponentError;
use crate::error::TimeoutError;
use crate::log_oracle::BaselineLogger;
use crate::log_oracle::Marker;
use crate::power::Rebootable;
use crate::resilience::heartbeat;
use crate::resilience::reconnect;
use crate::resilience::wait_until_ready;
use crate::resilience::Heartbeat;
use crate::resilience::Verbosity;
use crate::strategy::Strategy;
use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use strum_macros::Display;
use tokio::time::sleep;
use tokio::time::Instant;

const BOOT_INFO_CMD: &str = "/usr/bin/processBootInfo -i";

/// Which flash bank the controller booted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BootBank {
    Primary,
    Secondary,
    Unknown,
}

impl BootBank {
    pub fn from_boot_info(output: &str) -> BootBank {
        if output.contains("Alternate") || output.contains("Secondary") {
            BootBank::Secondary
        } else {
            BootBank::Primary
        }
    }
}

/// How the activation watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    /// The command channel dropped: the controller is rebooting.
    Rebooted,
    /// The image is staged and waiting for a reset.
    Staged,
    TimedOut,
}

/// The management controller itself, with dual flash banks.
///
/// Activating controller firmware always costs us the command channel, so
/// monitoring is mostly about telling an expected reboot from a failure and
/// getting back in afterwards.
pub struct Bmc {
    update: UpdateConfig,
    strategy: Strategy,
    oracle: Box<dyn BaselineLogger>,
    log: Logger,
}

impl Bmc {
    pub(crate) fn new(parts: Parts) -> Self {
        let Parts { update, strategy, oracle, log } = parts;
        Self { update, strategy, oracle, log }
    }

    async fn boot_bank(&self, dev: &mut Device) -> BootBank {
        match dev.run(BOOT_INFO_CMD).await {
            Ok(output) => BootBank::from_boot_info(&output),
            Err(err) => {
                warn!(self.log, "failed to read boot bank"; &err);
                BootBank::Unknown
            }
        }
    }

    async fn watch(&self, dev: &mut Device) -> Result<Watch, ComponentError> {
        let deadline = Instant::now() + self.strategy.timeout;
        let wanted: &[Marker] = match self.strategy.apply_time {
            ApplyTime::Immediate => &[Marker::ApplyFailed],
            ApplyTime::OnReset => &[Marker::ApplyFailed, Marker::Staged],
        };
        while Instant::now() < deadline {
            if let Heartbeat::Lost(err) = heartbeat(dev).await {
                info!(self.log, "control channel lost"; &err);
                return Ok(Watch::Rebooted);
            }
            match self.oracle.fetch_new_logs(dev).await {
                Ok(logs) => match Marker::first_in(&logs, wanted) {
                    Some((Marker::ApplyFailed, line)) => {
                        return Err(ComponentError::ApplyFailed {
                            marker: line.to_string(),
                        });
                    }
                    Some((_, line)) => {
                        info!(self.log, "image staged"; "log" => line);
                        return Ok(Watch::Staged);
                    }
                    None => {}
                },
                Err(err) if err.is_session_lost() => {
                    info!(self.log, "control channel lost"; &err);
                    return Ok(Watch::Rebooted);
                }
                Err(err) => {
                    debug!(self.log, "failed to read operation log"; &err);
                }
            }
            sleep(dev.timing.poll_interval).await;
        }
        Ok(Watch::TimedOut)
    }

    async fn come_back(&self, dev: &mut Device) -> Result<(), ComponentError> {
        if !self.strategy.preserve {
            warn!(
                self.log,
                "configuration not preserved; not reconnecting \
                 (manual follow-up required)"
            );
            return Ok(());
        }
        reconnect(dev).await?;
        Ok(())
    }

    async fn post_reboot_check(&self, dev: &mut Device) {
        sleep(dev.timing.post_reboot_settle).await;
        match self.oracle.fetch_new_logs(dev).await {
            Ok(logs) => match Marker::first_in(&logs, &[Marker::Successful]) {
                Some((_, line)) => {
                    info!(
                        self.log, "controller reported success";
                        "log" => line,
                    );
                }
                None => {
                    warn!(self.log, "no success marker in operation log");
                }
            },
            Err(err) => warn!(self.log, "failed to read operation log"; &err),
        }
        self.oracle.check_system_logs(dev).await;
    }
}

#[async_trait]
impl FirmwareComponent for Bmc {
    fn name(&self) -> &str {
        &self.update.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Bmc
    }

    fn target_version(&self) -> &str {
        &self.update.version
    }

    fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    fn log(&self) -> &Logger {
        &self.log
    }

    /// The version of the bank the controller booted from, annotated with
    /// the bank (`"3.24.00 (Primary)"`).
    async fn get_current_version(
        &self,
        dev: &mut Device,
        verbosity: Verbosity,
    ) -> Result<String, ComponentError> {
        wait_until_ready(dev, verbosity).await;
        let Some(primary_path) = self.strategy.primary_path.as_deref() else {
            return Ok(NO_VERSION_PATH.to_string());
        };

        let bank = self.boot_bank(dev).await;
        let primary = read_version(dev, primary_path).await?;
        let secondary = match self.strategy.secondary_path.as_deref() {
            Some(path) => Some(read_version(dev, path).await?),
            None => None,
        };
        if verbosity == Verbosity::Verbose {
            info!(
                self.log, "controller firmware versions";
                "primary" => &primary,
                "secondary" => ?secondary,
                "active_bank" => %bank,
            );
        }

        let active = match (bank, secondary) {
            (BootBank::Secondary, Some(secondary)) => secondary,
            _ => primary,
        };
        Ok(format!("{active} ({bank})"))
    }

    async fn upload_firmware(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError> {
        clean_staging_area(dev, &self.log).await;
        self.oracle.record_baseline(dev).await;
        upload_image(&self.update, &self.strategy, dev, &self.log).await?;
        Ok(())
    }

    async fn monitor_update(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError> {
        let apply_time = self.strategy.apply_time;
        info!(
            self.log, "monitoring controller update";
            "apply_time" => %apply_time,
            "timeout" => ?self.strategy.timeout,
        );

        match (apply_time, self.watch(dev).await?) {
            (ApplyTime::Immediate, Watch::Rebooted) => {
                info!(self.log, "controller is rebooting to activate");
                self.come_back(dev).await?;
            }
            (_, Watch::Staged) => {
                dev.reboot_controller().await;
                self.come_back(dev).await?;
            }
            (ApplyTime::OnReset, Watch::Rebooted) => {
                // Not what we asked for, but the reboot may still activate
                // the image; the verify stage will tell.
                warn!(self.log, "controller rebooted before image was staged");
                self.come_back(dev).await?;
            }
            (_, Watch::TimedOut) => {
                let what = match apply_time {
                    ApplyTime::Immediate => "controller to reboot",
                    ApplyTime::OnReset => "image to be staged",
                };
                return Err(
                    TimeoutError::new(what, self.strategy.timeout).into()
                );
            }
        }

        if self.strategy.preserve {
            self.post_reboot_check(dev).await;
        }
        Ok(())
    }
}
