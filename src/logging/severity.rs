// SPDX-License-Identifier: Apache-2.0 OR MIT
// Severity levels for logging (RFC 5424 syslog-style)

use serde::{Deserialize, Serialize};

/// Log severity levels (0-7, lower is more severe)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// System unusable (instance loop cannot run)
    Emergency = 0,
    /// Immediate action required (raw socket lost, MRT init failure)
    Alert = 1,
    /// Critical conditions (instance construction failure)
    Critical = 2,
    /// Error conditions (kernel table mutation failure, packet drop)
    Error = 3,
    /// Warning conditions (timer backlog, repeated gateway retries)
    Warning = 4,
    /// Significant normal condition (interface added, querier elected)
    Notice = 5,
    /// Informational (group joined, forwarding entry installed)
    Info = 6,
    /// Debug-level messages (per-packet traces, timer scheduling)
    Debug = 7,
}

impl Severity {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Emergency => "EMERGENCY",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    /// Create from u8 value (returns None if invalid)
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Severity::Emergency),
            1 => Some(Severity::Alert),
            2 => Some(Severity::Critical),
            3 => Some(Severity::Error),
            4 => Some(Severity::Warning),
            5 => Some(Severity::Notice),
            6 => Some(Severity::Info),
            7 => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Emergency < Severity::Alert);
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Info < Severity::Debug);
    }

    #[test]
    fn test_severity_from_u8() {
        assert_eq!(Severity::from_u8(0), Some(Severity::Emergency));
        assert_eq!(Severity::from_u8(7), Some(Severity::Debug));
        assert_eq!(Severity::from_u8(8), None);
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(format!("{}", Severity::Alert), "ALERT");
        assert_eq!(format!("{}", Severity::Info), "INFO");
    }
}
