// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Firmware update orchestration for a management controller and the
//! components behind it.
//!
//! A [`MachineVerifier`] runs every configured [`FirmwareComponent`] through
//! an [`UpdateEngine`] over a single [`Device`], surviving the reboots that
//! activating firmware causes, and reduces the outcomes to one verdict.

pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod log_oracle;
pub mod machine;
pub mod power;
pub mod resilience;
pub mod strategy;
pub mod version;

mod device;

#[cfg(test)]
mod test_utils;

pub use component::build_component;
pub use component::Auditor;
pub use component::FirmwareComponent;
pub use device::Device;
pub use device::Timing;
pub use engine::Stage;
pub use engine::UpdateEngine;
pub use machine::Gate;
pub use machine::MachineReport;
pub use machine::MachineVerifier;
pub use strategy::resolve_strategy;
pub use strategy::Strategy;
pub use version::VersionCheck;
pub use version::VersionPolicy;
