use std::fmt;

/// Error raised while reviewing or regenerating an output's run plan.
#[derive(Debug)]
pub enum OutputError {
    Planning(String),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputError::Planning(m) => write!(f, "OutputError: {}", m),
        }
    }
}

impl std::error::Error for OutputError {}
