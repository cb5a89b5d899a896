//! Command handlers for fanctl

use crate::args::{Commands, ConfigAction};
use crate::bank::{BatchOutcome, FanBank};
use crate::clock::Clock;
use crate::config::FanBankConfig;
use crate::errors::Result;
use crate::fan_monitor::FanMonitor;
use crate::hardware::PwmDriver;
use crate::self_test::{self, SelfTestOptions};
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Time given to the fans to spin up before a one-shot reading
const SPIN_UP: Duration = Duration::from_secs(2);

/// One per-fan line of a reading command
#[derive(Debug, Clone, Serialize)]
struct FanValue<T> {
    fan: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> FanValue<T> {
    fn new(id: usize, result: Result<T>) -> Self {
        match result {
            Ok(value) => Self {
                fan: id + 1,
                value: Some(value),
                error: None,
            },
            Err(e) => Self {
                fan: id + 1,
                value: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Executes CLI commands against a fan bank
pub struct Controller<P, C> {
    bank: FanBank<P, C>,
    json: bool,
}

impl<P: PwmDriver, C: Clock> Controller<P, C> {
    pub fn new(bank: FanBank<P, C>, json: bool) -> Self {
        Self { bank, json }
    }

    pub fn bank(&self) -> &FanBank<P, C> {
        &self.bank
    }

    /// Run one command. `Ok(false)` means the command ran but a check it
    /// performs did not pass.
    pub async fn handle(&self, command: Commands) -> Result<bool> {
        debug!("Handling {:?}", command);
        match command {
            Commands::Status { detailed } => self.status(detailed).await,
            Commands::Set { fan, percent } => {
                self.bank.set_speed(index(fan), percent)?;
                println!("Fan {} set to {}%", fan, percent);
                Ok(true)
            }
            Commands::SetAll { percent } => Ok(self.report_batch(
                &format!("Set all fans to {}%", percent),
                self.bank.set_all_speeds(percent),
            )),
            Commands::Stop { fan: Some(fan) } => {
                self.bank.stop(index(fan))?;
                println!("Fan {} stopped", fan);
                Ok(true)
            }
            Commands::Stop { fan: None } => {
                Ok(self.report_batch("Stopped all fans", self.bank.stop_all()))
            }
            Commands::EmergencyStop => {
                self.bank.emergency_stop();
                println!("Emergency stop: all fans commanded to 0%");
                Ok(true)
            }
            Commands::Rpm { fan } => self.rpm(fan.map(index)).await,
            Commands::Fg { fan } => self.fg(index(fan)).await,
            Commands::Health { threshold } => self.health(threshold).await,
            Commands::Wait {
                fan,
                percent,
                target,
                tolerance,
                timeout,
            } => {
                self.wait(index(fan), percent, target, tolerance, timeout)
                    .await
            }
            Commands::Monitor { duration, interval } => self.monitor(duration, interval).await,
            Commands::SelfTest { settle } => self.self_test(settle).await,
            Commands::InitConfig { path } => {
                let path = path.unwrap_or_else(FanBankConfig::config_path);
                init_config(&path)?;
                Ok(true)
            }
            Commands::Config {
                action: ConfigAction::Show,
            } => {
                print_config(self.bank.config(), self.json)?;
                Ok(true)
            }
            Commands::Config {
                action: ConfigAction::Check,
            } => Ok(report_validation(
                "active configuration",
                self.bank.config().validate(),
            )),
        }
    }

    /// Let the fans reach speed, then drop the window covering the ramp
    async fn fresh_readings(&self) {
        let clock = self.bank.clock();
        info!("Waiting {:?} for fans to spin up", SPIN_UP);
        clock.sleep(SPIN_UP).await;
        self.bank.restart_windows();
        clock.sleep(self.bank.config().measurement_window()).await;
    }

    /// Run `task`, or emergency stop the bank on Ctrl-C
    async fn interruptible<F: Future>(&self, task: F) -> Option<F::Output> {
        tokio::select! {
            output = task => Some(output),
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping all fans");
                self.bank.emergency_stop();
                None
            }
        }
    }

    fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn report_batch(&self, what: &str, outcome: BatchOutcome) -> bool {
        for (id, e) in outcome.failures() {
            eprintln!("Fan {}: {}", id + 1, e);
        }
        println!(
            "{}: {}/{} succeeded",
            what,
            outcome.succeeded(),
            self.bank.fan_count()
        );
        outcome.all_ok()
    }

    async fn status(&self, detailed: bool) -> Result<bool> {
        if detailed {
            self.fresh_readings().await;
        }
        let report = self.bank.status_report(detailed);
        if self.json {
            self.print_json(&report)?;
        } else {
            print!("{}", report);
        }
        Ok(true)
    }

    async fn rpm(&self, id: Option<usize>) -> Result<bool> {
        if let Some(id) = id {
            self.bank.channel(id)?;
        }
        self.fresh_readings().await;

        let values: Vec<FanValue<f64>> = match id {
            Some(id) => vec![FanValue::new(id, self.bank.read_rpm(id))],
            None => self
                .bank
                .read_all_rpm()
                .into_iter()
                .enumerate()
                .map(|(id, result)| FanValue::new(id, result))
                .collect(),
        };

        if self.json {
            self.print_json(&values)?;
        } else {
            for v in &values {
                match (&v.value, &v.error) {
                    (Some(rpm), _) => println!("Fan {}: {:.0} RPM", v.fan, rpm),
                    (None, Some(e)) => println!("Fan {}: {}", v.fan, e),
                    (None, None) => {}
                }
            }
        }
        Ok(values.iter().all(|v| v.error.is_none()))
    }

    async fn fg(&self, id: usize) -> Result<bool> {
        self.bank.channel(id)?;
        self.fresh_readings().await;
        let frequency_hz = self.bank.read_frequency(id)?;
        if self.json {
            self.print_json(&FanValue::new(id, Ok(frequency_hz)))?;
        } else {
            println!("Fan {}: FG {:.2} Hz", id + 1, frequency_hz);
        }
        Ok(true)
    }

    async fn health(&self, threshold: Option<f64>) -> Result<bool> {
        let threshold = threshold.unwrap_or(self.bank.config().health_threshold_rpm);
        self.fresh_readings().await;

        let rpms = self.bank.read_all_rpm();
        let health = self.bank.read_all_health(threshold);
        let values: Vec<FanValue<bool>> = health
            .into_iter()
            .enumerate()
            .map(|(id, result)| FanValue::new(id, result))
            .collect();

        if self.json {
            self.print_json(&values)?;
        } else {
            println!("Health threshold: {:.0} RPM", threshold);
            for (v, rpm) in values.iter().zip(&rpms) {
                let speed = match rpm {
                    Ok(rpm) => format!("{:.0} RPM", rpm),
                    Err(_) => "-".to_string(),
                };
                match (&v.value, &v.error) {
                    (Some(true), _) => println!("Fan {}: OK ({})", v.fan, speed),
                    (Some(false), _) => println!("Fan {}: LOW ({})", v.fan, speed),
                    (None, Some(e)) => println!("Fan {}: {}", v.fan, e),
                    (None, None) => {}
                }
            }
        }
        Ok(values.iter().all(|v| v.value == Some(true)))
    }

    async fn wait(
        &self,
        id: usize,
        percent: u8,
        target: f64,
        tolerance: f64,
        timeout: u64,
    ) -> Result<bool> {
        self.bank.set_speed(id, percent)?;
        let wait = self.bank.wait_for_stabilization(
            id,
            target,
            tolerance,
            Duration::from_secs(timeout),
        );
        let Some(outcome) = self.interruptible(wait).await else {
            return Ok(false);
        };
        let outcome = outcome?;

        if self.json {
            self.print_json(&outcome)?;
        } else if outcome.converged() {
            println!(
                "Fan {} stable at {:.0} RPM after {:.1}s",
                id + 1,
                outcome.last_rpm.unwrap_or_default(),
                outcome.elapsed.as_secs_f64()
            );
        } else {
            let last = outcome
                .last_rpm
                .map_or_else(|| "no reading".to_string(), |rpm| format!("{:.0} RPM", rpm));
            println!(
                "Fan {} did not reach {:.0}±{:.0} RPM within {}s (last: {})",
                id + 1,
                target,
                tolerance,
                timeout,
                last
            );
        }
        Ok(outcome.converged())
    }

    async fn monitor(&self, duration: Option<u64>, interval: u64) -> Result<bool> {
        let monitor = FanMonitor::new(&self.bank, Duration::from_secs(interval)).with_json(self.json);
        let mut stdout = io::stdout();
        let run = monitor.run(&mut stdout, duration.map(Duration::from_secs));
        match self.interruptible(run).await {
            Some(result) => {
                result?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn self_test(&self, settle: u64) -> Result<bool> {
        let options = SelfTestOptions::new(self.bank.config().health_threshold_rpm)
            .with_settle(Duration::from_secs(settle));
        let Some(report) = self
            .interruptible(self_test::run_self_test(&self.bank, options))
            .await
        else {
            return Ok(false);
        };

        if self.json {
            self.print_json(&report)?;
        } else {
            print!("{}", report);
        }
        Ok(report.all_passed())
    }
}

fn index(fan: u16) -> usize {
    usize::from(fan).saturating_sub(1)
}

/// Write the default configuration to `path`
pub fn init_config(path: &Path) -> Result<()> {
    FanBankConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Print the configuration loaded from `path`, or the defaults if it is missing
pub fn show_config(path: &Path, json: bool) -> Result<()> {
    let config = FanBankConfig::load_or_default(path)?;
    if !path.exists() {
        println!("{} not found, showing defaults", path.display());
    }
    print_config(&config, json)
}

/// Load and validate `path`. Returns false if it cannot be used.
pub fn check_config(path: &Path) -> bool {
    let what = path.display().to_string();
    report_validation(&what, FanBankConfig::load_or_default(path).map(drop))
}

fn report_validation(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => {
            println!("{}: OK", what);
            true
        }
        Err(e) => {
            eprintln!("{}: {}", what, e);
            false
        }
    }
}

fn print_config(config: &FanBankConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", ConfigSummary(config));
    }
    Ok(())
}

/// Human readable summary of a configuration
pub struct ConfigSummary<'a>(pub &'a FanBankConfig);

impl fmt::Display for ConfigSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;
        writeln!(f, "Fans: {}", config.fan_count)?;
        for (id, (control, feedback)) in config
            .control_pins
            .iter()
            .zip(&config.feedback_pins)
            .enumerate()
        {
            writeln!(f, "  Fan {}: PWM {}, FG {}", id + 1, control, feedback)?;
        }
        writeln!(
            f,
            "PWM: {} Hz, {} counts full scale",
            config.pwm_frequency_hz, config.pwm_resolution
        )?;
        writeln!(
            f,
            "Speed: {}-{}% (default {}%)",
            config.min_speed, config.max_speed, config.default_speed
        )?;
        writeln!(
            f,
            "FG: {} edges/rev on {:?} edges, {} ms window",
            config.pulses_per_revolution, config.edge_mode, config.measurement_window_ms
        )?;
        writeln!(
            f,
            "Stabilization: poll {} ms, {} stable sample(s)",
            config.poll_interval().as_millis(),
            config.stable_samples
        )?;
        writeln!(f, "Health threshold: {:.0} RPM", config.health_threshold_rpm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FanModel, SimClock, SimulatedRig};
    use std::sync::Arc;

    fn controller(fans: usize) -> Controller<SimulatedRig, SimClock> {
        let config = FanBankConfig::with_fan_count(fans);
        let rig = SimulatedRig::new(&config, FanModel::for_config(&config));
        let clock = Arc::new(SimClock::new(rig.clone()));
        let bank = FanBank::new(config, rig.clone(), &mut rig.clone(), clock).unwrap();
        Controller::new(bank, false)
    }

    #[tokio::test]
    async fn test_set_and_stop() {
        let controller = controller(2);
        assert!(controller
            .handle(Commands::Set { fan: 2, percent: 40 })
            .await
            .unwrap());
        assert_eq!(controller.bank().duty_percent(1).unwrap(), 40);

        assert!(controller
            .handle(Commands::Stop { fan: None })
            .await
            .unwrap());
        assert!(controller.bank().status_report(false).all_stopped());
    }

    #[tokio::test]
    async fn test_fan_number_out_of_range() {
        let controller = controller(2);
        let err = controller
            .handle(Commands::Set { fan: 3, percent: 40 })
            .await
            .unwrap_err();
        assert!(err.is_out_of_range());
    }

    #[tokio::test]
    async fn test_health_reflects_speed() {
        let controller = controller(2);
        controller.bank().set_speed(0, 60).unwrap();

        assert!(!controller
            .handle(Commands::Health { threshold: None })
            .await
            .unwrap());

        controller.bank().set_speed(1, 60).unwrap();
        assert!(controller
            .handle(Commands::Health { threshold: None })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_wait_converges() {
        let controller = controller(1);
        let converged = controller
            .handle(Commands::Wait {
                fan: 1,
                percent: 60,
                target: 1800.0,
                tolerance: 100.0,
                timeout: 10,
            })
            .await
            .unwrap();
        assert!(converged);
    }

    #[test]
    fn test_check_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(check_config(&path));

        FanBankConfig::default().save_to_file(&path).unwrap();
        assert!(check_config(&path));

        let inverted = FanBankConfig {
            min_speed: 80,
            max_speed: 20,
            ..FanBankConfig::default()
        };
        std::fs::write(&path, serde_json::to_string(&inverted).unwrap()).unwrap();
        assert!(!check_config(&path));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(!check_config(&path));
        assert!(show_config(&path, false).is_err());
    }

    #[test]
    fn test_config_summary() {
        let config = FanBankConfig::with_fan_count(2);
        let text = ConfigSummary(&config).to_string();
        assert!(text.starts_with("Fans: 2\n"));
        assert!(text.contains(&format!(
            "Fan 2: PWM {}, FG {}",
            config.control_pins[1], config.feedback_pins[1]
        )));
        assert!(text.contains(&format!("{} ms window", config.measurement_window_ms)));
    }

    #[tokio::test]
    async fn test_config_check_uses_active_config() {
        let controller = controller(1);
        assert!(controller
            .handle(Commands::Config {
                action: ConfigAction::Check
            })
            .await
            .unwrap());
    }

    #[test]
    fn test_init_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        init_config(&path).unwrap();
        assert_eq!(
            FanBankConfig::load_from_file(&path).unwrap(),
            FanBankConfig::default()
        );
    }
}
