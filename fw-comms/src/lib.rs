// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! This crate provides the two control channels to a management controller:
//! an interactive remote shell and a Redfish client.
//!
//! The primary entry points are [`RemoteSession`] and [`ProtocolClient`].

mod redfish;
mod session;

pub mod error;

pub use redfish::form_fields;
pub use redfish::parse_body;
pub use redfish::ProtocolClient;
pub use redfish::RedfishClient;
pub use redfish::RetryConfig;
pub use redfish::UPDATE_FILE_FIELD;
pub use session::strip_echo_and_prompt;
pub use session::RemoteSession;
pub use session::SshConfig;
pub use session::SshSession;
pub use session::DEFAULT_COMMAND_TIMEOUT;
pub use session::DEFAULT_PROMPT;
