// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Orchestration: instance table, signals, status printing
    Orchestrator = 0,
    /// Proxy instance message loop
    Instance = 1,
    /// Downstream querier state machine
    Querier = 2,
    /// Upstream host-role advertisement
    Upstream = 3,
    /// Membership table and forwarding computation
    Membership = 4,
    /// Kernel multicast routing gateway
    Kernel = 5,
    /// Timer scheduling
    Timing = 6,
    /// Configuration loading and validation
    Config = 7,
    /// Socket operations, interface queries
    Network = 8,
    /// Test harness and fixtures
    Test = 9,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Orchestrator => "Orchestrator",
            Facility::Instance => "Instance",
            Facility::Querier => "Querier",
            Facility::Upstream => "Upstream",
            Facility::Membership => "Membership",
            Facility::Kernel => "Kernel",
            Facility::Timing => "Timing",
            Facility::Config => "Config",
            Facility::Network => "Network",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid)
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Orchestrator,
            1 => Facility::Instance,
            2 => Facility::Querier,
            3 => Facility::Upstream,
            4 => Facility::Membership,
            5 => Facility::Kernel,
            6 => Facility::Timing,
            7 => Facility::Config,
            8 => Facility::Network,
            9 => Facility::Test,
            _ => Facility::Unknown,
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facility_roundtrip() {
        assert_eq!(Facility::from_u8(0), Facility::Orchestrator);
        assert_eq!(Facility::from_u8(5), Facility::Kernel);
        assert_eq!(Facility::from_u8(99), Facility::Unknown);
    }

    #[test]
    fn test_facility_display() {
        assert_eq!(format!("{}", Facility::Querier), "Querier");
        assert_eq!(format!("{}", Facility::Kernel), "Kernel");
    }
}
