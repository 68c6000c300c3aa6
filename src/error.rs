use core::fmt;
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

/// Process-boundary error: wraps any leaf error so `main` has a single
/// thing to print and exit on. Leaf errors (`RequestError`, `ConfigError`,
/// `CacheError`, ...) stay typed with `thiserror` at their own layer.
pub struct CleanError(pub Box<dyn Error>);

impl Debug for CleanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "\r\x1b[K{}", self)
    }
}

impl Display for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1b[31mERROR\x1b[0m: {}", self.0)
    }
}

impl Error for CleanError {}

impl From<std::io::Error> for CleanError {
    fn from(e: std::io::Error) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<std::net::AddrParseError> for CleanError {
    fn from(e: std::net::AddrParseError) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<serde_yaml::Error> for CleanError {
    fn from(e: serde_yaml::Error) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<crate::config::ConfigError> for CleanError {
    fn from(e: crate::config::ConfigError) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<String> for CleanError {
    fn from(s: String) -> Self {
        CleanError(Box::new(GenericError(s)))
    }
}

impl From<&str> for CleanError {
    fn from(s: &str) -> Self {
        CleanError(Box::new(GenericError(s.to_string())))
    }
}

#[derive(Debug)]
struct GenericError(String);

impl Display for GenericError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for GenericError {}

pub type Result<T> = std::result::Result<T, CleanError>;
