// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Surviving controller reboots.
//!
//! A controller that is activating new firmware reboots without notice. The
//! heartbeat turns the resulting loss of the command channel into an explicit
//! event, [`reconnect`] waits out the reboot, and [`wait_until_ready`] holds
//! off further work until the controller reports that it is fully up. All of
//! these are bounded polling loops.

use crate::device::Device;
use crate::error::TimeoutError;
use backoff::backoff::Backoff;
use backoff::backoff::Constant;
use fw_comms::error::SessionError;
use slog::debug;
use slog::info;
use slog::warn;
use tokio::time::sleep;
use tokio::time::Instant;

const BMC_STATE_CMD: &str = "busctl get-property \
    xyz.openbmc_project.State.BMC /xyz/openbmc_project/state/bmc0 \
    xyz.openbmc_project.State.BMC CurrentBMCState";
const BMC_READY: &str = "xyz.openbmc_project.State.BMC.BMCState.Ready";
const JOBS_CMD: &str = "systemctl list-jobs";
const NO_JOBS: &str = "No jobs running";

const POST_CODE_CMD: &str = "busctl get-property \
    xyz.openbmc_project.State.Boot.Raw /xyz/openbmc_project/state/boot/raw0 \
    xyz.openbmc_project.State.Boot.Raw Value";

/// POST code the host firmware emits when it hands off to the OS.
pub const OS_HANDOFF_CODE: &str = "0xaa";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Only speak up if we actually end up waiting.
    Quiet,
    Verbose,
}

#[derive(Debug)]
pub enum Heartbeat {
    Alive,
    /// The command channel is gone; the controller is (most likely)
    /// rebooting.
    Lost(SessionError),
}

/// Issue a trivial command to find out whether the controller is still there.
///
/// A heartbeat that gets no prompt back within its short timeout counts as
/// lost, the same as a reset connection: a controller going down for reboot
/// often stops answering before the TCP connection dies.
pub async fn heartbeat(dev: &mut Device) -> Heartbeat {
    let timeout = dev.timing.heartbeat_timeout;
    match dev
        .session
        .send("echo check", fw_comms::DEFAULT_PROMPT, timeout)
        .await
    {
        Ok(_) => Heartbeat::Alive,
        Err(err) => {
            debug!(dev.log, "heartbeat failed"; &err);
            Heartbeat::Lost(err)
        }
    }
}

/// Wait for the controller to come back after a reboot and become ready.
///
/// Connection failures inside the reconnect bound are expected while the
/// controller boots; only running out of time is an error.
pub async fn reconnect(dev: &mut Device) -> Result<(), TimeoutError> {
    let timing = dev.timing;
    let deadline = Instant::now() + timing.reconnect_timeout;
    info!(
        dev.log, "waiting for controller to come back online";
        "timeout" => ?timing.reconnect_timeout,
    );

    dev.session.close().await;
    sleep(timing.reconnect_settle).await;

    let mut backoff = Constant::new(timing.reconnect_backoff);
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match dev.session.connect().await {
            Ok(()) => {
                info!(
                    dev.log, "controller is back online";
                    "attempts" => attempts,
                );
                break;
            }
            Err(err) => {
                debug!(
                    dev.log, "controller not reachable yet";
                    "attempt" => attempts,
                    &err,
                );
            }
        }
        let wait =
            backoff.next_backoff().unwrap_or(timing.reconnect_backoff);
        if Instant::now() + wait >= deadline {
            return Err(TimeoutError::new(
                "controller to come back online",
                timing.reconnect_timeout,
            ));
        }
        sleep(wait).await;
    }

    wait_until_ready(dev, Verbosity::Verbose).await;
    Ok(())
}

/// Result of a readiness wait. Both stages are best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub state_ready: bool,
    pub jobs_idle: bool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.state_ready && self.jobs_idle
    }
}

/// Block until the controller state reads `Ready` and systemd has no pending
/// jobs, or until the shared readiness deadline passes.
///
/// Timing out is logged and otherwise ignored: callers proceed and let the
/// next real command fail if the controller truly is not usable.
pub async fn wait_until_ready(
    dev: &mut Device,
    verbosity: Verbosity,
) -> Readiness {
    let timing = dev.timing;
    let deadline = Instant::now() + timing.readiness_timeout;
    let quiet = verbosity == Verbosity::Quiet;
    let mut announced = false;
    if !quiet {
        info!(dev.log, "checking controller readiness");
    }

    let state_ready =
        poll_until(dev, deadline, &STATE_PROBE, quiet, &mut announced).await;
    if !state_ready {
        warn!(
            dev.log, "timed out waiting for controller state Ready";
            "timeout" => ?timing.readiness_timeout,
        );
    }

    let jobs_idle =
        poll_until(dev, deadline, &JOBS_PROBE, quiet, &mut announced).await;

    let readiness = Readiness { state_ready, jobs_idle };
    if !jobs_idle {
        warn!(
            dev.log, "timed out waiting for systemd jobs";
            "timeout" => ?timing.readiness_timeout,
        );
    } else if readiness.is_ready() && (!quiet || announced) {
        info!(dev.log, "controller is ready");
    }
    readiness
}

struct Probe {
    cmd: &'static str,
    expect: &'static str,
    /// Logged once, in quiet mode, if we end up waiting.
    waiting: &'static str,
}

const STATE_PROBE: Probe = Probe {
    cmd: BMC_STATE_CMD,
    expect: BMC_READY,
    waiting: "controller not ready yet, waiting",
};

const JOBS_PROBE: Probe = Probe {
    cmd: JOBS_CMD,
    expect: NO_JOBS,
    waiting: "waiting for systemd jobs",
};

// Command errors count as "not yet".
async fn poll_until(
    dev: &mut Device,
    deadline: Instant,
    probe: &Probe,
    quiet: bool,
    announced: &mut bool,
) -> bool {
    let poll = dev.timing.poll_interval;
    while Instant::now() < deadline {
        match dev.run(probe.cmd).await {
            Ok(output) if output.contains(probe.expect) => return true,
            Ok(_) => {
                if quiet && !*announced {
                    info!(dev.log, "{}", probe.waiting);
                    *announced = true;
                }
            }
            Err(err) => debug!(dev.log, "readiness probe failed"; &err),
        }
        sleep(poll).await;
    }
    false
}

/// Parse the boot-progress property into a hex code (`0xaa`).
///
/// The property renders either as `(ayay) <primary> <code> ...` or as
/// `t <code>`, with decimal values.
pub fn parse_post_code(output: &str) -> Option<String> {
    for line in output.lines().map(str::trim) {
        let value = if let Some(rest) = line.strip_prefix("(ayay)") {
            rest.split_whitespace().nth(1)
        } else if let Some(rest) = line.strip_prefix("t ") {
            rest.split_whitespace().next()
        } else {
            continue;
        };
        if let Some(code) = value.and_then(|v| v.parse::<u64>().ok()) {
            return Some(format!("{code:#x}"));
        }
    }
    None
}

async fn read_post_code(dev: &mut Device) -> Option<String> {
    match dev.run(POST_CODE_CMD).await {
        Ok(output) => parse_post_code(&output),
        Err(err) => {
            debug!(dev.log, "failed to read POST code"; &err);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBoot {
    Reached,
    TimedOut,
}

/// After host power-on, wait for the host to reach OS handoff.
///
/// The code read first is left over from before power-on, so the handoff code
/// only counts once the code has changed at least once. Best-effort: a
/// timeout is a warning.
pub async fn wait_for_host_boot(dev: &mut Device) -> HostBoot {
    let timing = dev.timing;
    let deadline = Instant::now() + timing.host_boot_timeout;
    info!(dev.log, "waiting for host to boot (monitoring POST codes)");

    let stale = read_post_code(dev).await;
    if let Some(code) = &stale {
        info!(dev.log, "initial (stale) POST code"; "code" => code);
    }
    let mut last = stale;
    let mut booting = false;
    while Instant::now() < deadline {
        let code = read_post_code(dev).await;
        if code.is_some() && code != last {
            debug!(dev.log, "POST code"; "code" => ?code);
            last = code.clone();
            booting = true;
        }
        if booting && code.as_deref() == Some(OS_HANDOFF_CODE) {
            info!(
                dev.log, "host reached OS handoff";
                "code" => OS_HANDOFF_CODE,
            );
            return HostBoot::Reached;
        }
        sleep(timing.boot_code_poll).await;
    }
    warn!(
        dev.log, "timed out waiting for host boot";
        "timeout" => ?timing.host_boot_timeout,
    );
    HostBoot::TimedOut
}
