//! Bank-wide status report

use crate::hardware::PinId;
use serde::Serialize;
use std::fmt;

/// Measurement part of a detailed channel status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reading {
    Ready {
        frequency_hz: f64,
        rpm: f64,
        healthy: bool,
    },
    NotReady,
    Fault {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub id: usize,
    pub control_pin: PinId,
    pub feedback_pin: PinId,
    pub duty_percent: u8,
    pub is_stopped: bool,
    /// Present only in detailed reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading: Option<Reading>,
}

impl ChannelStatus {
    pub fn rpm(&self) -> Option<f64> {
        match self.reading {
            Some(Reading::Ready { rpm, .. }) => Some(rpm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub detailed: bool,
    pub health_threshold_rpm: f64,
    pub channels: Vec<ChannelStatus>,
}

impl StatusReport {
    /// Fans with a non-zero speed reading
    pub fn active_fans(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.rpm().is_some_and(|rpm| rpm > 0.0))
            .count()
    }

    /// Mean speed over active fans
    pub fn average_active_rpm(&self) -> Option<f64> {
        let active: Vec<f64> = self
            .channels
            .iter()
            .filter_map(ChannelStatus::rpm)
            .filter(|rpm| *rpm > 0.0)
            .collect();
        if active.is_empty() {
            None
        } else {
            Some(active.iter().sum::<f64>() / active.len() as f64)
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.channels.iter().all(|c| c.is_stopped)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Fan status ===")?;
        for channel in &self.channels {
            write!(f, "Fan {:>2}: {:>3}%", channel.id + 1, channel.duty_percent)?;
            match &channel.reading {
                None => {}
                Some(Reading::Ready {
                    frequency_hz,
                    rpm,
                    healthy,
                }) => {
                    let verdict = match (*healthy, channel.is_stopped) {
                        (true, _) => "OK",
                        (false, true) => "stopped",
                        (false, false) => "STALLED",
                    };
                    write!(
                        f,
                        " | {:>6.0} RPM | FG {:>6.1} Hz | {}",
                        rpm, frequency_hz, verdict
                    )?;
                }
                Some(Reading::NotReady) => write!(f, " | measuring...")?,
                Some(Reading::Fault { message }) => write!(f, " | fault: {}", message)?,
            }
            if channel.reading.is_none() && channel.is_stopped {
                write!(f, " (stopped)")?;
            }
            writeln!(f)?;
        }

        if self.detailed {
            write!(
                f,
                "Active fans: {}/{}",
                self.active_fans(),
                self.channels.len()
            )?;
            if let Some(avg) = self.average_active_rpm() {
                write!(f, " | average {:.0} RPM", avg)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: usize, duty: u8, reading: Option<Reading>) -> ChannelStatus {
        ChannelStatus {
            id,
            control_pin: PinId(id as u16),
            feedback_pin: PinId(100 + id as u16),
            duty_percent: duty,
            is_stopped: duty == 0,
            reading,
        }
    }

    fn ready(rpm: f64) -> Option<Reading> {
        Some(Reading::Ready {
            frequency_hz: rpm / 30.0,
            rpm,
            healthy: rpm >= 500.0,
        })
    }

    #[test]
    fn test_summary() {
        let report = StatusReport {
            detailed: true,
            health_threshold_rpm: 500.0,
            channels: vec![
                status(0, 50, ready(1500.0)),
                status(1, 80, ready(2500.0)),
                status(2, 0, ready(0.0)),
                status(3, 40, Some(Reading::NotReady)),
            ],
        };
        assert_eq!(report.active_fans(), 2);
        assert_eq!(report.average_active_rpm(), Some(2000.0));
        assert!(!report.all_stopped());
    }

    #[test]
    fn test_rendering() {
        let report = StatusReport {
            detailed: true,
            health_threshold_rpm: 500.0,
            channels: vec![
                status(0, 50, ready(1500.0)),
                status(1, 0, ready(0.0)),
                status(
                    2,
                    30,
                    Some(Reading::Fault {
                        message: "feedback input unavailable".to_string(),
                    }),
                ),
            ],
        };
        let text = report.to_string();
        assert!(text.contains("Fan  1:  50% |   1500 RPM"));
        assert!(text.contains("Fan  2:   0% |      0 RPM | FG    0.0 Hz | stopped"));
        assert!(text.contains("Fan  3:  30% | fault: feedback input unavailable"));
        assert!(text.contains("Active fans: 1/3 | average 1500 RPM"));
    }

    #[test]
    fn test_json_shape() {
        let report = StatusReport {
            detailed: false,
            health_threshold_rpm: 500.0,
            channels: vec![status(0, 0, None)],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["channels"][0]["duty_percent"], 0);
        assert_eq!(json["channels"][0]["is_stopped"], true);
        assert_eq!(json["channels"][0]["control_pin"], 0);
        assert!(json["channels"][0].get("reading").is_none());

        let reading = serde_json::to_value(Reading::NotReady).unwrap();
        assert_eq!(reading["status"], "not_ready");
    }
}
