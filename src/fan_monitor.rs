//! Live fan monitoring

use crate::bank::FanBank;
use crate::clock::Clock;
use crate::errors::Result;
use crate::hardware::PwmDriver;
use crate::status::StatusReport;
use log::info;
use serde::Serialize;
use std::io::Write;
use std::time::Duration;

/// One monitor tick as emitted in JSON mode
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSample {
    pub timestamp: String,
    #[serde(flatten)]
    pub report: StatusReport,
}

/// Periodically prints a detailed status report of the whole bank
pub struct FanMonitor<'a, P, C> {
    bank: &'a FanBank<P, C>,
    interval: Duration,
    json: bool,
}

impl<'a, P: PwmDriver, C: Clock> FanMonitor<'a, P, C> {
    pub fn new(bank: &'a FanBank<P, C>, interval: Duration) -> Self {
        Self {
            bank,
            interval: interval.max(bank.config().measurement_window()),
            json: false,
        }
    }

    /// Emit one JSON object per line instead of text tables
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sample(&self) -> MonitorSample {
        MonitorSample {
            timestamp: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
            report: self.bank.status_report(true),
        }
    }

    fn write_sample<W: Write>(&self, out: &mut W) -> Result<()> {
        let sample = self.sample();
        if self.json {
            serde_json::to_writer(&mut *out, &sample)?;
            writeln!(out)?;
        } else {
            writeln!(out, "[{}]", sample.timestamp)?;
            write!(out, "{}", sample.report)?;
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Report every interval until `duration` has passed, or forever when
    /// `None`. Returns the number of reports written.
    pub async fn run<W: Write>(&self, out: &mut W, duration: Option<Duration>) -> Result<u32> {
        let clock = self.bank.clock();
        let started = clock.now();
        let mut reports = 0;
        info!(
            "Monitoring {} fans every {:?}",
            self.bank.fan_count(),
            self.interval
        );

        loop {
            self.write_sample(out)?;
            reports += 1;

            let delay = match duration {
                Some(limit) => {
                    let elapsed = clock.now().saturating_sub(started);
                    if elapsed >= limit {
                        break;
                    }
                    self.interval.min(limit - elapsed)
                }
                None => self.interval,
            };
            clock.sleep(delay).await;
        }

        info!("Monitoring finished after {} reports", reports);
        Ok(reports)
    }
}
