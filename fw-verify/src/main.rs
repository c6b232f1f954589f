// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Parser;
use fw_comms::RedfishClient;
use fw_comms::RetryConfig;
use fw_comms::SshConfig;
use fw_comms::SshSession;
use fw_update::build_component;
use fw_update::config::ComponentKind;
use fw_update::config::Inventory;
use fw_update::config::StrategyFile;
use fw_update::config::SystemType;
use fw_update::error::MachineError;
use fw_update::resilience::Verbosity;
use fw_update::resolve_strategy;
use fw_update::Auditor;
use fw_update::Device;
use fw_update::Gate;
use fw_update::MachineReport;
use fw_update::MachineVerifier;
use report::ReportRow;
use slog::info;
use slog::o;
use slog::warn;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use slog_error_chain::InlineErrorChain;
use std::fs::File;
use std::io;
use std::process::ExitCode;
use std::time::Duration;
use uuid::Uuid;

mod report;

const DEFAULT_AUDITOR_NAME: &str = "PFR";

/// Update and verify management controller, BIOS and CPLD firmware on one
/// machine.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<Utf8PathBuf>,

    /// Machine inventory.
    #[clap(short, long, default_value = "config/inventory.toml")]
    config: Utf8PathBuf,

    /// Strategy profiles. Built-in defaults apply if the file is missing.
    #[clap(long, default_value = "config/strategies.toml")]
    strategies: Utf8PathBuf,

    /// Only report installed versions against the inventory; flash nothing.
    #[clap(short, long)]
    verify: bool,

    /// Emit the report as JSON on stdout.
    #[clap(long)]
    json: bool,

    /// Timeout for establishing the SSH session.
    #[clap(
        long,
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    connect_timeout: Duration,
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

fn build_logger(
    level: Level,
    path: Option<&Utf8Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path)
            .with_context(|| format!("failed to create logfile {path}"))?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "fw-verify")), guard))
}

fn build_device(
    inventory: &Inventory,
    connect_timeout: Duration,
    log: &Logger,
) -> Result<Device> {
    let conn = &inventory.system.connection;
    let session = SshSession::new(
        SshConfig {
            host: conn.ip.clone(),
            port: conn.ssh_port,
            user: conn.user.clone(),
            password: conn.password.clone(),
            root_password: conn.root_pass.clone(),
            connect_timeout,
        },
        log.new(o!("channel" => "ssh")),
    );
    let redfish = RedfishClient::new(
        &conn.ip,
        conn.https_port,
        &conn.user,
        &conn.password,
        RetryConfig::default(),
        log.new(o!("channel" => "redfish")),
    )
    .context("failed to build redfish client")?;
    Ok(Device::new(
        Box::new(session),
        Box::new(redfish),
        inventory.timing.to_timing(),
        log.clone(),
    ))
}

fn auditor_name(inventory: &Inventory) -> &str {
    inventory
        .updates
        .iter()
        .find(|u| u.kind == ComponentKind::Pfr)
        .map_or(DEFAULT_AUDITOR_NAME, |u| u.name.as_str())
}

/// Read every configured version and run any configured audit.
async fn verify_only(
    inventory: &Inventory,
    strategies: &StrategyFile,
    dev: &mut Device,
    log: &Logger,
) -> Result<Vec<ReportRow>> {
    let mut rows = Vec::with_capacity(inventory.updates.len());
    for update in &inventory.updates {
        if !update.kind.is_flashable() {
            let auditor = Auditor::new(
                update.name.clone(),
                inventory.system.pfr.clone(),
                log,
            );
            let audit = auditor.check_health(dev).await;
            rows.push(ReportRow::audit(&update.name, &audit));
            continue;
        }
        let profile = &inventory.system.profile;
        let strategy = resolve_strategy(update, profile, strategies, log)?;
        let component = build_component(update, strategy, log)?;
        let current =
            component.get_current_version(dev, Verbosity::Quiet).await;
        rows.push(ReportRow::version(
            &update.name,
            &update.version,
            current,
            component.log(),
        ));
    }
    Ok(rows)
}

async fn update(
    inventory: &Inventory,
    strategies: &StrategyFile,
    dev: &mut Device,
    log: &Logger,
) -> Result<Result<MachineReport, MachineError>> {
    inventory.validate_for_update()?;
    let mut components = Vec::new();
    for update in inventory.updates.iter().filter(|u| u.kind.is_flashable()) {
        let profile = &inventory.system.profile;
        let strategy = resolve_strategy(update, profile, strategies, log)?;
        components.push(build_component(update, strategy, log)?);
    }
    let gate = match inventory.system.kind {
        SystemType::Standard => Gate::Standard,
        SystemType::Pfr => Gate::Pfr(Auditor::new(
            auditor_name(inventory),
            inventory.system.pfr.clone(),
            log,
        )),
    };
    let mut verifier = MachineVerifier::new(components, gate, log);
    Ok(verifier.verify_system(dev).await)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), value)
        .context("failed to write to stdout")?;
    println!();
    Ok(())
}

/// Print the outcome of an update run and decide whether it succeeded.
///
/// A soft stop is not a failure: the run did what it could and the operator
/// has to take it from here.
fn finish_update(
    outcome: Result<MachineReport, MachineError>,
    json: bool,
) -> Result<bool> {
    let report = match &outcome {
        Ok(report) => report,
        Err(err) => err.report(),
    };
    if json {
        print_json(report)?;
    } else {
        println!("{}", report::update_table(report));
    }
    match outcome {
        Ok(_) => {
            println!("firmware update succeeded");
            Ok(true)
        }
        Err(MachineError::ManualActionRequired { skipped, .. }) => {
            println!(
                "manual action required: {}",
                InlineErrorChain::new(&skipped)
            );
            Ok(true)
        }
        Err(err) => {
            println!(
                "firmware update failed: {}",
                InlineErrorChain::new(&err)
            );
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;
    let log = log.new(o!("run_id" => Uuid::new_v4().to_string()));

    let inventory = Inventory::from_file(&args.config)
        .with_context(|| format!("failed to load inventory {}", args.config))?;
    let strategies = StrategyFile::load_optional(&args.strategies, &log)
        .with_context(|| {
            format!("failed to load strategies {}", args.strategies)
        })?;

    let mut dev = build_device(&inventory, args.connect_timeout, &log)?;
    info!(
        log, "connecting";
        "host" => &inventory.system.connection.ip,
        "mode" => if args.verify { "verify" } else { "update" },
    );
    dev.connect().await.with_context(|| {
        format!("failed to connect to {}", inventory.system.connection.ip)
    })?;

    let success = if args.verify {
        let rows =
            verify_only(&inventory, &strategies, &mut dev, &log).await?;
        if args.json {
            print_json(&rows)?;
        } else {
            println!("{}", report::verify_table(&rows));
        }
        let pass = report::all_pass(&rows);
        if !pass {
            warn!(log, "installed firmware does not match the inventory");
        }
        pass
    } else {
        let outcome = update(&inventory, &strategies, &mut dev, &log).await?;
        finish_update(outcome, args.json)?
    };

    dev.close().await;
    drop(log_guard);
    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use fw_update::error::VerificationSkipped;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
        let args =
            Args::try_parse_from(["fw-verify", "-v", "--json"]).unwrap();
        assert!(args.verify);
        assert!(args.json);
        assert_eq!(args.config, "config/inventory.toml");
        assert_eq!(args.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn log_levels() {
        assert_eq!(level_from_str("debug").unwrap(), Level::Debug);
        assert!(level_from_str("loud").is_err());
    }

    #[test]
    fn update_outcomes() {
        assert!(finish_update(Ok(MachineReport::default()), true).unwrap());

        let skipped = MachineError::ManualActionRequired {
            skipped: VerificationSkipped {
                component: "bmc".to_string(),
                reason: "configuration was not preserved".to_string(),
            },
            report: MachineReport::default(),
        };
        assert!(finish_update(Err(skipped), true).unwrap());

        let failed = MachineError::ComponentsFailed {
            report: MachineReport::default(),
        };
        assert!(!finish_update(Err(failed), true).unwrap());
    }

    #[test]
    fn auditor_takes_the_pfr_entry_name() {
        let inventory: Inventory = toml::from_str(
            r#"
            [system]
            profile = "default"
            type = "PFR"
            [system.connection]
            ip = "10.0.0.2"
            user = "admin"
            pass = "secret"

            [[updates]]
            name = "bmc"
            type = "BMC"
            version = "3.24.00"

            [[updates]]
            name = "pfr-audit"
            type = "PFR"
            version = "-"
            "#,
        )
        .unwrap();
        assert_eq!(auditor_name(&inventory), "pfr-audit");
    }

    #[test]
    fn shipped_configs_parse() {
        let inventory: Inventory =
            toml::from_str(include_str!("../../config/inventory.toml"))
                .unwrap();
        inventory.validate_for_update().unwrap();
        assert_eq!(inventory.system.kind, SystemType::Pfr);
        assert_eq!(auditor_name(&inventory), "PFR");

        let strategies: StrategyFile =
            toml::from_str(include_str!("../../config/strategies.toml"))
                .unwrap();
        let factory = strategies.profile("bmc-factory-reset").unwrap();
        assert!(factory.payload.is_some());
    }
}
