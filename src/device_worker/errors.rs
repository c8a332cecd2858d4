use std::fmt;

/// Error raised while executing a single step of a device sequence, or while
/// refreshing device status.
#[derive(Debug)]
pub enum WorkerError {
    Step(String),
    Device(String),
    Timeout,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkerError::Step(m) => write!(f, "WorkerError: step failed: {}", m),
            WorkerError::Device(m) => write!(f, "WorkerError: device error: {}", m),
            WorkerError::Timeout => write!(f, "sequence timeout"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<anyhow::Error> for WorkerError {
    fn from(e: anyhow::Error) -> Self {
        WorkerError::Device(e.to_string())
    }
}

impl From<&str> for WorkerError {
    fn from(e: &str) -> Self {
        WorkerError::Device(e.to_string())
    }
}
