//! Alert priority order shared by the runtime scanners
//!
//! Syslog-style total order: `Emergency(0)` is most severe, `Debug(7)`
//! least. A finding meets a threshold when its numeric level is at or below
//! the threshold's.

use aegis_common::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertPriority {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl AlertPriority {
    pub const ALL: [AlertPriority; 8] = [
        AlertPriority::Emergency,
        AlertPriority::Alert,
        AlertPriority::Critical,
        AlertPriority::Error,
        AlertPriority::Warning,
        AlertPriority::Notice,
        AlertPriority::Info,
        AlertPriority::Debug,
    ];

    pub fn level(self) -> u8 {
        match self {
            AlertPriority::Emergency => 0,
            AlertPriority::Alert => 1,
            AlertPriority::Critical => 2,
            AlertPriority::Error => 3,
            AlertPriority::Warning => 4,
            AlertPriority::Notice => 5,
            AlertPriority::Info => 6,
            AlertPriority::Debug => 7,
        }
    }

    /// Whether this priority is at least as severe as `threshold`.
    pub fn meets_threshold(self, threshold: AlertPriority) -> bool {
        self.level() <= threshold.level()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertPriority::Emergency => "EMERGENCY",
            AlertPriority::Alert => "ALERT",
            AlertPriority::Critical => "CRITICAL",
            AlertPriority::Error => "ERROR",
            AlertPriority::Warning => "WARNING",
            AlertPriority::Notice => "NOTICE",
            AlertPriority::Info => "INFO",
            AlertPriority::Debug => "DEBUG",
        }
    }

    /// Finding severity equivalent used in reports.
    pub fn as_severity(self) -> Severity {
        match self {
            AlertPriority::Emergency | AlertPriority::Alert | AlertPriority::Critical => {
                Severity::Critical
            }
            AlertPriority::Error => Severity::High,
            AlertPriority::Warning => Severity::Medium,
            AlertPriority::Notice => Severity::Low,
            AlertPriority::Info | AlertPriority::Debug => Severity::Info,
        }
    }
}

impl FromStr for AlertPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMERGENCY" | "EMERG" => Ok(AlertPriority::Emergency),
            "ALERT" => Ok(AlertPriority::Alert),
            "CRITICAL" | "CRIT" => Ok(AlertPriority::Critical),
            "ERROR" | "ERR" => Ok(AlertPriority::Error),
            "WARNING" | "WARN" => Ok(AlertPriority::Warning),
            "NOTICE" => Ok(AlertPriority::Notice),
            "INFO" | "INFORMATIONAL" => Ok(AlertPriority::Info),
            "DEBUG" => Ok(AlertPriority::Debug),
            other => Err(format!("unknown alert priority '{}'", other)),
        }
    }
}

impl fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!("warning".parse::<AlertPriority>().unwrap(), AlertPriority::Warning);
        assert_eq!("CRIT".parse::<AlertPriority>().unwrap(), AlertPriority::Critical);
        assert!("loud".parse::<AlertPriority>().is_err());
    }

    #[test]
    fn threshold_examples() {
        assert!(AlertPriority::Critical.meets_threshold(AlertPriority::Warning));
        assert!(AlertPriority::Warning.meets_threshold(AlertPriority::Warning));
        assert!(!AlertPriority::Notice.meets_threshold(AlertPriority::Warning));
    }

    proptest! {
        #[test]
        fn threshold_matches_level_order(a in 0usize..8, b in 0usize..8) {
            let pa = AlertPriority::ALL[a];
            let pb = AlertPriority::ALL[b];
            prop_assert_eq!(pa.meets_threshold(pb), pa.level() <= pb.level());
        }
    }
}
