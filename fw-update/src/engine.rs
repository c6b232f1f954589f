// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Drives one component through precheck, upload, monitor and verify.

use crate::component::FirmwareComponent;
use crate::device::Device;
use crate::error::ComponentError;
use crate::error::PipelineError;
use crate::resilience::Verbosity;
use crate::version::VersionCheck;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Precheck,
    Upload,
    Monitor,
    Verify,
    Done,
    Failed,
}

/// Single-component update state machine.
///
/// Stages run strictly in order and each runs at most once. Failure of any
/// stage ends the pipeline; a soft stop at any stage is passed through
/// untouched so the caller can end the run.
pub struct UpdateEngine<'a> {
    component: &'a mut dyn FirmwareComponent,
    stage: Stage,
    log: Logger,
}

impl<'a> UpdateEngine<'a> {
    pub fn new(component: &'a mut dyn FirmwareComponent, log: &Logger) -> Self {
        let log = log.new(o!("component" => component.name().to_string()));
        Self { component, stage: Stage::Precheck, log }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn execute(
        &mut self,
        dev: &mut Device,
    ) -> Result<VersionCheck, PipelineError> {
        info!(
            self.log, "starting update";
            "target_version" => self.component.target_version(),
        );

        self.enter(Stage::Precheck);
        let result =
            self.component.get_current_version(dev, Verbosity::Verbose).await;
        let current = self.check(result)?;
        info!(self.log, "current firmware"; "version" => &current);

        self.enter(Stage::Upload);
        let result = self.component.upload_firmware(dev).await;
        self.check(result)?;

        self.enter(Stage::Monitor);
        let result = self.component.monitor_update(dev).await;
        self.check(result)?;

        self.enter(Stage::Verify);
        let result = self.component.verify_update(dev).await;
        let check = self.check(result)?;

        self.stage = Stage::Done;
        info!(
            self.log, "update complete";
            "version" => &check.current,
            "matched" => check.matched,
        );
        Ok(check)
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        info!(self.log, "entering stage"; "stage" => %stage);
    }

    fn check<T>(
        &mut self,
        result: Result<T, ComponentError>,
    ) -> Result<T, PipelineError> {
        let stage = self.stage;
        match result {
            Ok(value) => Ok(value),
            Err(ComponentError::Skipped(skipped)) => {
                warn!(
                    self.log, "verification skipped";
                    "stage" => %stage,
                    &skipped,
                );
                Err(skipped.into())
            }
            Err(source) => {
                self.stage = Stage::Failed;
                error!(
                    self.log, "update failed";
                    "stage" => %stage,
                    &source,
                );
                Err(PipelineError::Failed {
                    component: self.component.name().to_string(),
                    stage,
                    source,
                })
            }
        }
    }
}
