//! Automation engine for Lite Assistant
//!
//! Event-driven rules over MQTT messages, device state and wall-clock
//! time, plus recurring switch schedules and auto-off timers.

pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod log;
pub mod model;
pub mod persistence;
pub mod scheduler;
pub mod timer;

#[cfg(test)]
mod testing;

pub use engine::{AutomationEngine, AutomationEvent};
pub use error::AutomationError;
pub use executor::ActionExecutor;
pub use log::ExecutionLog;
pub use model::*;
pub use scheduler::{Scheduler, SchedulerEvent};
pub use timer::TimerService;
