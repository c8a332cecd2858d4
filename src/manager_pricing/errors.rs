use std::fmt;
use std::fmt::Formatter;

#[derive(Debug)]
pub enum PricingError {
    Fetch(String),
    Document(String),
    Io(String),
    Fatal(String),
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            PricingError::Fetch(e) => write!(f, "PricingError::Fetch: {}", e),
            PricingError::Document(e) => write!(f, "PricingError::Document: {}", e),
            PricingError::Io(e) => write!(f, "PricingError::Io: {}", e),
            PricingError::Fatal(e) => write!(f, "PricingError::Fatal: {}", e),
        }
    }
}
impl std::error::Error for PricingError {}
impl From<&str> for PricingError {
    fn from(e: &str) -> Self {
        PricingError::Fetch(e.to_string())
    }
}
impl From<anyhow::Error> for PricingError {
    fn from(e: anyhow::Error) -> Self {
        PricingError::Fetch(e.to_string())
    }
}
impl From<serde_json::Error> for PricingError {
    fn from(e: serde_json::Error) -> Self {
        PricingError::Document(e.to_string())
    }
}
impl From<std::io::Error> for PricingError {
    fn from(e: std::io::Error) -> Self {
        PricingError::Io(e.to_string())
    }
}
