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

/// Host firmware. The host must be off while its flash is rewritten.
pub struct Bios {
    update: UpdateConfig,
    strategy: Strategy,
    oracle: Box<dyn BaselineLogger>,
    log: Logger,
}

impl Bios {
    pub(crate) fn new(parts: Parts) -> Self {
        let Parts { update, strategy, oracle, log } = parts;
        Self { update, strategy, oracle, log }
    }
}

#[async_trait]
impl FirmwareComponent for Bios {
    fn name(&self) -> &str {
        &self.update.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Bios
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

    /// A staged marker counts as completion: the image goes live on the
    /// next host boot, which happens right after.
    async fn monitor_update(
        &mut self,
        dev: &mut Device,
    ) -> Result<(), ComponentError> {
        let line = await_marker(
            &self.update.name,
            self.oracle.as_ref(),
            dev,
            &self.strategy,
            &[Marker::ApplyFailed, Marker::Successful, Marker::Staged],
            "host firmware update to complete",
            &self.log,
        )
        .await?;
        info!(self.log, "host firmware update finished"; "log" => line);
        bring_up_host(self.oracle.as_ref(), dev).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::build_component;
    use crate::config::StrategyFile;
    use crate::strategy::resolve_strategy;
    use crate::test_utils::discard;
    use crate::test_utils::SimBmc;
    use crate::test_utils::SimRedfish;
    use crate::test_utils::BIOS_PATH;
    use camino_tempfile::Utf8TempDir;
    use std::time::Duration;

    fn component(
        dir: &Utf8TempDir,
        extra: &str,
    ) -> Box<dyn FirmwareComponent> {
        let file = dir.path().join("bios.bin");
        std::fs::write(&file, b"image").unwrap();
        let update: UpdateConfig = toml::from_str(&format!(
            r#"
            name = "bios"
            type = "BIOS"
            version = "1.1.0"
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
    async fn flash_powers_the_host_down_and_back_up() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, "");
        let sim = SimBmc::new();
        sim.state().post_codes =
            ["t 170", "t 1", "t 170"].map(String::from).into();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            assert!(!state.host_on, "host must be off before upload");
            state.versions.insert(BIOS_PATH.to_string(), "1.1.0".to_string());
            state.log_in(Duration::from_secs(90), "BIOS UpdateSuccessful");
        });
        let mut dev = sim.device(redfish);

        assert_eq!(
            bios.get_current_version(&mut dev, Verbosity::Quiet)
                .await
                .unwrap(),
            "1.0.0"
        );
        bios.upload_firmware(&mut dev).await.unwrap();
        bios.monitor_update(&mut dev).await.unwrap();
        assert!(sim.state().host_on);
        assert_eq!(sim.state().count_commands("State.Boot.Raw"), 3);

        let check = bios.verify_update(&mut dev).await.unwrap();
        assert!(check.matched);
    }

    #[tokio::test(start_paused = true)]
    async fn staged_marker_completes_the_flash() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, r#"apply_time = "OnReset""#);
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.log_in(Duration::from_secs(30), "BIOS UpdateStaged");
        });
        let mut dev = sim.device(redfish);

        bios.upload_firmware(&mut dev).await.unwrap();
        bios.monitor_update(&mut dev).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_times_out() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, "timeout = 120");
        let sim = SimBmc::new();
        let mut dev = sim.device(SimRedfish::new(&sim));

        bios.upload_firmware(&mut dev).await.unwrap();
        match bios.monitor_update(&mut dev).await {
            Err(ComponentError::Timeout(err)) => {
                assert_eq!(err.after, Duration::from_secs(120));
            }
            other => panic!("unexpected result {other:?}"),
        }
        // The host stays off after a failed flash.
        assert!(!sim.state().host_on);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_upload_is_an_error() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, "");
        let sim = SimBmc::new();
        let mut redfish = SimRedfish::new(&sim);
        redfish.reject_uploads = true;
        let mut dev = sim.device(redfish);

        assert!(matches!(
            bios.upload_firmware(&mut dev).await,
            Err(ComponentError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_precedes_host_power_off() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, "");
        let sim = SimBmc::new();
        let mut dev = sim.device(SimRedfish::new(&sim));

        bios.upload_firmware(&mut dev).await.unwrap();
        let commands = sim.state().commands.clone();
        let position = |needle: &str| {
            commands.iter().position(|c| c.contains(needle)).unwrap()
        };
        assert!(position("rm -rf /tmp/images") < position("wc -l"));
        assert!(position("wc -l") < position("chassis power off"));
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_resumes_after_a_controller_reboot() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, "");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.reboot_in(Duration::from_secs(30), |state| {
                state.redfish_log.push("BIOS UpdateSuccessful".to_string());
            });
        });
        let mut dev = sim.device(redfish);

        bios.upload_firmware(&mut dev).await.unwrap();
        bios.monitor_update(&mut dev).await.unwrap();
        assert_eq!(sim.state().connects, 1);
        assert!(sim.state().host_on);
    }

    #[tokio::test(start_paused = true)]
    async fn unpreserved_flash_stops_softly_when_the_controller_drops() {
        let dir = Utf8TempDir::new().unwrap();
        let mut bios = component(&dir, "preserve = false");
        let sim = SimBmc::new();
        let redfish = SimRedfish::new(&sim);
        redfish.on_upload(|state| {
            state.reboot_in(Duration::from_secs(30), |_| {});
        });
        let mut dev = sim.device(redfish);

        bios.upload_firmware(&mut dev).await.unwrap();
        match bios.monitor_update(&mut dev).await {
            Err(ComponentError::Skipped(skipped)) => {
                assert_eq!(skipped.component, "bios");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(sim.state().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn verification_waits_for_readiness_once() {
        let dir = Utf8TempDir::new().unwrap();
        let bios = component(&dir, "");
        let sim = SimBmc::new();
        let start = tokio::time::Instant::now();
        sim.state().jobs_done_at = Some(start + Duration::from_secs(86_400));
        let mut dev = sim.device(SimRedfish::new(&sim));

        let check = bios.verify_update(&mut dev).await.unwrap();
        assert!(!check.matched);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(600));
        assert!(elapsed < Duration::from_secs(700), "{elapsed:?}");
    }
}
