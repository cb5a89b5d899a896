//! FG Fan Control
//!
//! PWM speed control for a bank of fans with FG tachometer feedback:
//! interrupt-safe edge counting, windowed frequency measurement, RPM
//! conversion, health checks and waiting for a commanded speed to settle.

pub mod args;
pub mod bank;
pub mod channel;
pub mod clock;
pub mod commands;
pub mod config;
pub mod conversion;
pub mod edge_counter;
pub mod errors;
pub mod fan_monitor;
pub mod frequency;
pub mod hardware;
pub mod logging;
pub mod sim;
pub mod stabilization;
pub mod status;

// Re-export commonly used types
pub use bank::{BatchOutcome, FanBank};
pub use channel::{DutyLimits, SpeedChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FanBankConfig;
pub use edge_counter::EdgeCounter;
pub use errors::{FanError, Result};
pub use hardware::{EdgeDriver, EdgeMode, PinId, PwmDriver};
pub use sim::{FanModel, SimClock, SimulatedRig};
pub use stabilization::{StabilizationTarget, WaitOutcome, WaitState};
pub use status::{Reading, StatusReport};
