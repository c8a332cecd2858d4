use std::fmt;
use std::fmt::Formatter;
use std::sync::{PoisonError, RwLockReadGuard, RwLockWriteGuard};
use chrono::RoundingError;

use crate::device_worker::errors::WorkerError;
use crate::manager_pricing::errors::PricingError;
use crate::notify::errors::MailError;
use crate::output::errors::OutputError;
use crate::scheduler::errors::SchedulerError;

/// Error depicting errors that occur during initialization of the program.
///
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ConfigError: {}", self.0)
    }
}
impl std::error::Error for ConfigError {}
impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self { ConfigError(e.to_string()) }
}
impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self { ConfigError(e.to_string()) }
}
impl From<log4rs::config::runtime::ConfigErrors> for ConfigError {
    fn from(e: log4rs::config::runtime::ConfigErrors) -> Self { ConfigError(e.to_string()) }
}
impl From<log::SetLoggerError> for ConfigError {
    fn from(e: log::SetLoggerError) -> Self { ConfigError(e.to_string()) }
}
impl From<&str> for ConfigError {
    fn from(e: &str) -> Self { ConfigError(e.to_string()) }
}
impl From<MailError> for ConfigError {
    fn from(e: MailError) -> Self { ConfigError(e.to_string()) }
}

/// Error depicting errors that occur while running the control loop.
///
#[derive(Debug)]
pub struct ControllerError(pub String);

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ControllerError: {}", self.0)
    }
}
impl std::error::Error for ControllerError {}
impl From<WorkerError> for ControllerError {
    fn from(e: WorkerError) -> Self { ControllerError(e.to_string()) }
}
impl From<OutputError> for ControllerError {
    fn from(e: OutputError) -> Self { ControllerError(e.to_string()) }
}
impl From<PricingError> for ControllerError {
    fn from(e: PricingError) -> Self { ControllerError(e.to_string()) }
}
impl From<SchedulerError> for ControllerError {
    fn from(e: SchedulerError) -> Self { ControllerError(e.to_string()) }
}
impl From<StateError> for ControllerError {
    fn from(e: StateError) -> Self { ControllerError(e.to_string()) }
}
impl From<MailError> for ControllerError {
    fn from(e: MailError) -> Self { ControllerError(e.to_string()) }
}
impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self { ControllerError(e.to_string()) }
}
impl From<PoisonError<RwLockReadGuard<'_, bool>>> for ControllerError {
    fn from(e: PoisonError<RwLockReadGuard<'_, bool>>) -> Self { ControllerError(e.to_string()) }
}
impl From<PoisonError<RwLockWriteGuard<'_, bool>>> for ControllerError {
    fn from(e: PoisonError<RwLockWriteGuard<'_, bool>>) -> Self { ControllerError(e.to_string()) }
}
impl From<&str> for ControllerError {
    fn from(e: &str) -> Self { ControllerError(e.to_string()) }
}

/// Error depicting errors that occur during run-plan calculation.
///
#[derive(Debug)]
pub struct SchedulingError(pub String);

impl fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "SchedulingError: {}", self.0)
    }
}
impl std::error::Error for SchedulingError {}
impl From<&str> for SchedulingError {
    fn from(e: &str) -> Self { SchedulingError(e.to_string()) }
}
impl From<RoundingError> for SchedulingError {
    fn from(e: RoundingError) -> Self { SchedulingError(e.to_string()) }
}

/// Error depicting errors that occur while persisting or loading saved state.
///
#[derive(Debug)]
pub struct StateError(pub String);

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "StateError: {}", self.0)
    }
}
impl std::error::Error for StateError {}
impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self { StateError(e.to_string()) }
}
impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self { StateError(e.to_string()) }
}
impl From<glob::PatternError> for StateError {
    fn from(e: glob::PatternError) -> Self { StateError(e.to_string()) }
}
impl From<glob::GlobError> for StateError {
    fn from(e: glob::GlobError) -> Self { StateError(e.to_string()) }
}
impl From<chrono::ParseError> for StateError {
    fn from(e: chrono::ParseError) -> Self { StateError(e.to_string()) }
}
