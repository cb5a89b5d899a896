//! Main entry point for fanctl

use anyhow::Context;
use clap::Parser;
use fg_fan_control::{
    args::{Args, Commands, ConfigAction},
    commands::{self, Controller},
    logging, FanBank, FanBankConfig, FanModel, SimulatedRig, SystemClock,
};
use log::{info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Physics step of the simulated rig
const RIG_TICK: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Print version and build metadata for binary identity verification
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let git_desc = option_env!("GIT_DESC").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    eprintln!(
        "fanctl v{} (git {} / {}) built {}",
        pkg_version, git_hash, git_desc, build_time
    );

    let args = Args::parse();
    logging::setup(args.verbose).context("failed to set up logging")?;

    // Needs no bank
    if let Commands::InitConfig { path } = &args.command {
        let path = path.clone().unwrap_or_else(FanBankConfig::config_path);
        commands::init_config(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        return Ok(ExitCode::SUCCESS);
    }

    let config_path = args.config.clone().unwrap_or_else(FanBankConfig::config_path);
    if let Commands::Config { action } = args.command {
        let passed = match action {
            ConfigAction::Show => {
                commands::show_config(&config_path, args.json)
                    .with_context(|| format!("failed to load {}", config_path.display()))?;
                true
            }
            ConfigAction::Check => commands::check_config(&config_path),
        };
        return Ok(if passed {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let config = FanBankConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    info!("Using configuration {}", config_path.display());

    let rig = SimulatedRig::new(&config, FanModel::for_config(&config).with_jitter(0.01));
    let physics = rig.spawn_realtime(RIG_TICK);

    let clock = Arc::new(SystemClock::new());
    let bank = FanBank::new(config, rig.clone(), &mut rig.clone(), clock)
        .context("failed to initialize fan bank")?;
    let defaults = bank.apply_default_speed();
    if !defaults.all_ok() {
        warn!(
            "Default speed applied to {}/{} fans",
            defaults.succeeded(),
            bank.fan_count()
        );
    }

    let controller = Controller::new(bank, args.json);
    let passed = controller.handle(args.command).await;
    physics.abort();

    Ok(if passed? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
