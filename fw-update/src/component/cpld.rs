// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use super::await_marker;
use super::bring_up_host;
use super::clean_staging_area;
use super::single_image_version;
use super::upload_image;
use super::FirmwareComponent;
use super::Parts;
use crate::config::ComponentKind;
use crate::config::UpdateConfig;
use crate::device::Device;
use crate::error::ComponentError;
use crate::log_oracle::BaselineLogger;
use crate::log_oracle::Marker;
use crate::power::Rebootable;
use crate::resilience::Verbosity;
use crate::strategy::Strategy;
use async_trait::async_trait;
use slog::info;
use slog::Logger;

/// Board logic. Unlike host firmware there is no staged state to accept:
/// the controller either reports success or failure.
pub struct Cpld {
    update: UpdateConfig,
    strategy: Strategy,
    oracle: Box<dyn BaselineLogger>,
    log: Logger,
}

impl Cpld {
    pub(crate) fn new(parts: Parts) -> Self {
        let Parts { update, strategy, oracle, log } = parts;
        Self { update, strategy, oracle, log }
    }
}

#[async_trait]
impl FirmwareComponent for Cpld {
    fn name(&self) -> &str {
        &self.update.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Cpld
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

    async fn get_current_version(
        &self,
        dev: &mut Device,
        verbosity: Verbosity,
    ) -> Result<String, ComponentError> {
        single_image_version(dev, &self.strategy, verbosity).await
    }

    async fn upload_firmware(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError> {
        clean_staging_area(dev, &self.log).await;
        self.oracle.record_baseline(dev).await;
        dev.host_power_off().await;
        upload_image(&self.update, &self.strategy, dev, &self.log).await?;
        Ok(())
    }

    async fn monitor_update(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError> {
        let line = await_marker(
            &self.update.name,
            self.oracle.as_ref(),
            dev,
            &self.strategy,
            &[Marker::ApplyFailed, Marker::Successful],
            "CPLD update to complete",
            &self.log,
        )
        .await?;
        info!(self.log, "CPLD update finished"; "log" => line);
        bring_up_host(self.oracle.as_ref(), dev).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::build_component;
    use crate::component::NO_VERSION_PATH;
    use crate::config::StrategyFile;
    use crate::strategy::resolve_strategy;
    use crate::test_utils::discard;
    use crate::test_utils::Request;
    use crate::test_utils::SimBmc;
    use crate::test_utils::SimRedfish;
    use camino_tempfile::Utf8TempDir;
    use serde_json::json;
    use std::time::Duration;

    fn component(
        dir: &Utf8TempDir,
        extra: &str,
    ) -> Box<dyn FirmwareComponent> {
        let file = dir.path().join("cpld.jed");
        std::fs::write(&file, b"image").unwrap();
        let update: UpdateConfig = toml::from_str(&format!(
            r#"
            name = "cpld"
            type = "CPLD"
            subtype = "MB"
            version = "0x0d"
            file = "{file}"
            {extra}
            "#
        ))
        .unwrap();
        let strategy = resolve_strategy(
            &update,
            "default",
            &StrategyFile::default(),
            &discard(),
        )
        .unwrap();
        build_component(&update, strategy, &discard()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn version_needs_a_path() {
        let dir = Utf8TempDir::new().unwrap();
        let cpld = component(&dir, "");
        let sim = SimBmc::new();
        let mut dev = sim.device(SimRedfish::new(&sim));
        assert_eq!(
            cpld.get_current_version(&mut dev, Verbosity::Quiet)
                .await
                .unwrap(),
            NO_VERSION_PATH
        );

        let cpld = component(&dir, r#"primary_path = "/cpld/mb""#);
        sim.state()
            .versions
            .insert("/cpld/mb".to_string(), "0x0d".to_string());
        assert_eq!(
            cpld.get_current_version(&mut dev, Verbosity::Quiet)
                .await
                .unwrap(),
            "0x0d"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn apply_failure_fails_the_flash() {
        let dir = Utf8TempDir::new().unwrap();
        let mut cpld = component(&dir, "");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.log_in(Duration::from_secs(20), "CPLD ApplyFailed");
        });
        let mut dev = sim.device(redfish.clone());

        cpld.upload_firmware(&mut dev).await.unwrap();
        match cpld.monitor_update(&mut dev).await {
            Err(ComponentError::ApplyFailed { marker }) => {
                assert_eq!(marker, "CPLD ApplyFailed");
            }
            other => panic!("unexpected result {other:?}"),
        }

        // The payload targets the subtype's inventory entry.
        let Some(Request::Upload { payload, .. }) =
            redfish.requests().into_iter().last()
        else {
            panic!("no upload recorded");
        };
        assert_eq!(
            payload["UpdateParameters"]["Targets"],
            json!(["/redfish/v1/UpdateService/FirmwareInventory/cpld_mb"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn staged_marker_is_not_completion() {
        let dir = Utf8TempDir::new().unwrap();
        let mut cpld = component(&dir, "timeout = 60");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.log_in(Duration::from_secs(10), "CPLD UpdateStaged");
        });
        let mut dev = sim.device(redfish);

        cpld.upload_firmware(&mut dev).await.unwrap();
        assert!(matches!(
            cpld.monitor_update(&mut dev).await,
            Err(ComponentError::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn success_restores_host_power() {
        let dir = Utf8TempDir::new().unwrap();
        let mut cpld = component(&dir, "");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.log_in(Duration::from_secs(20), "CPLD UpdateSuccessful");
        });
        let mut dev = sim.device(redfish);

        cpld.upload_firmware(&mut dev).await.unwrap();
        assert!(!sim.state().host_on);
        cpld.monitor_update(&mut dev).await.unwrap();
        assert!(sim.state().host_on);
    }

    #[tokio::test(start_paused = true)]
    async fn unpreserved_update_reads_no_version() {
        let dir = Utf8TempDir::new().unwrap();
        let cpld = component(
            &dir,
            "preserve = false\nprimary_path = \"/cpld/mb\"",
        );
        let sim = SimBmc::new();
        let mut dev = sim.device(SimRedfish::new(&sim));

        assert!(matches!(
            cpld.verify_update(&mut dev).await,
            Err(ComponentError::Skipped(_))
        ));
        assert_eq!(sim.state().count_commands("/cpld/mb"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_resumes_after_a_controller_reboot() {
        let dir = Utf8TempDir::new().unwrap();
        let mut cpld = component(&dir, "");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.reboot_in(Duration::from_secs(30), |state| {
                state.redfish_log.push("CPLD UpdateSuccessful".to_string());
            });
        });
        let mut dev = sim.device(redfish);

        cpld.upload_firmware(&mut dev).await.unwrap();
        cpld.monitor_update(&mut dev).await.unwrap();
        assert_eq!(sim.state().connects, 1);
        assert!(sim.state().host_on);
    }

    #[tokio::test(start_paused = true)]
    async fn unpreserved_flash_stops_softly_when_the_controller_drops() {
        let dir = Utf8TempDir::new().unwrap();
        let mut cpld = component(&dir, "preserve = false");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.reboot_in(Duration::from_secs(30), |_| {});
        });
        let mut dev = sim.device(redfish);

        cpld.upload_firmware(&mut dev).await.unwrap();
        assert!(matches!(
            cpld.monitor_update(&mut dev).await,
            Err(ComponentError::Skipped(_))
        ));
        assert_eq!(sim.state().connects, 0);
        // Nobody is left to power the host back on.
        assert!(!sim.state().host_on);
    }
}
