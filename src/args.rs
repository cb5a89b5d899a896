//! Command line argument parsing for fanctl

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// FG fan controller
///
/// Drives PWM fans and reads their FG tachometer outputs. Fan numbers on
/// the command line start at 1.
#[derive(Parser, Debug)]
#[command(name = "fanctl")]
#[command(about = "PWM fan control with FG tachometer feedback")]
#[command(version)]
pub struct Args {
    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (defaults to ~/.fg_fan_control/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Show duty and stop state of every fan
    Status {
        /// Include a fresh RPM/FG reading and health per fan
        #[arg(short, long)]
        detailed: bool,
    },
    /// Set one fan's duty cycle
    Set {
        #[arg(value_parser = fan_number())]
        fan: u16,
        /// Duty cycle in percent
        percent: u8,
    },
    /// Set every fan to the same duty cycle
    SetAll { percent: u8 },
    /// Stop one fan, or all of them
    Stop {
        #[arg(value_parser = fan_number())]
        fan: Option<u16>,
    },
    /// Force every fan to 0% immediately
    EmergencyStop,
    /// Read fan speed in RPM
    Rpm {
        #[arg(value_parser = fan_number())]
        fan: Option<u16>,
    },
    /// Read the raw FG edge frequency of a fan
    Fg {
        #[arg(value_parser = fan_number())]
        fan: u16,
    },
    /// Check every fan against a speed threshold
    Health {
        /// Minimum healthy speed (defaults to the configured threshold)
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Set a fan's duty and wait for its speed to settle
    Wait {
        #[arg(value_parser = fan_number())]
        fan: u16,
        percent: u8,
        /// Expected speed in RPM
        #[arg(long)]
        target: f64,
        /// Accepted deviation from the target in RPM
        #[arg(long, default_value_t = 100.0)]
        tolerance: f64,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Print a detailed status report periodically
    Monitor {
        /// Stop after this many seconds (runs until Ctrl-C when omitted)
        #[arg(short, long)]
        duration: Option<u64>,
        /// Seconds between reports
        #[arg(short, long, default_value_t = 1)]
        interval: u64,
    },
    /// Step every fan through a few duties and verify the tachometer
    SelfTest {
        /// Settle time per step in seconds
        #[arg(long, default_value_t = 3)]
        settle: u64,
    },
    /// Write the default configuration to a file
    InitConfig { path: Option<PathBuf> },
    /// Inspect the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the configuration and report the first problem
    Check,
}

/// Fan numbers are 1-based
fn fan_number() -> clap::builder::RangedI64ValueParser<u16> {
    clap::value_parser!(u16).range(1..)
}
