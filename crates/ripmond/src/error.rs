//! Error types for ripmond
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use crate::address::ParseError;
use crate::rip::RipError;
use thiserror::Error;

/// Errors raised by the classification query surface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The requested prefix covers more addresses than one buffer may hold
    #[error("Region /{prefix_len} too large to classify (at most {max_bits} host bits)")]
    RegionTooLarge { prefix_len: u32, max_bits: u32 },
}

/// Errors that can occur in ripmond
///
/// # NIST Controls
/// - SI-11(a): Generate error messages providing information necessary for corrective actions
/// - SI-11(b): Reveal only information necessary for error handling
#[derive(Debug, Error)]
pub enum RipmonError {
    /// A datagram could not be decoded
    /// NIST: SI-10 (Information Input Validation) - Wire format validation
    #[error("RIP decode error: {0}")]
    Rip(#[from] RipError),

    /// Multicast socket failure (fatal to the receiver task only)
    /// NIST: SC-7 (Boundary Protection) - Network interface errors
    #[error("Socket error: {0}")]
    Socket(std::io::Error),

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address or prefix text could not be parsed
    #[error("Address error: {0}")]
    Address(#[from] ParseError),

    /// Classification query rejected
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Metrics registry error
    /// NIST: SI-4 (System Monitoring) - Metrics setup
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    /// NIST: SI-11 (Error Handling) - System-level errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ripmond operations
pub type Result<T> = std::result::Result<T, RipmonError>;
