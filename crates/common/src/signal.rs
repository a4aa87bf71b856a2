//! Process signal names
//!
//! Jobs are cancelled with a configurable signal. The name is validated at
//! startup so that a typo is a configuration error rather than a surprise
//! at cancellation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// A signal that can be delivered to a job's process group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    Hup,
    Int,
    Quit,
    Kill,
    Usr1,
    Usr2,
    Term,
}

impl ProcessSignal {
    /// Canonical name, e.g. `SIGTERM`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Kill => "SIGKILL",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
            Self::Term => "SIGTERM",
        }
    }

    /// Look up a signal by its conventional number
    pub fn from_number(number: i32) -> Option<Self> {
        match number {
            1 => Some(Self::Hup),
            2 => Some(Self::Int),
            3 => Some(Self::Quit),
            9 => Some(Self::Kill),
            10 => Some(Self::Usr1),
            12 => Some(Self::Usr2),
            15 => Some(Self::Term),
            _ => None,
        }
    }
}

impl Default for ProcessSignal {
    fn default() -> Self {
        Self::Term
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessSignal {
    type Err = ConfigError;

    /// Accepts `SIGTERM`, `TERM` or `term`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" => Ok(Self::Hup),
            "INT" => Ok(Self::Int),
            "QUIT" => Ok(Self::Quit),
            "KILL" => Ok(Self::Kill),
            "USR1" => Ok(Self::Usr1),
            "USR2" => Ok(Self::Usr2),
            "TERM" => Ok(Self::Term),
            _ => Err(ConfigError::UnknownSignal(s.to_string())),
        }
    }
}

impl Serialize for ProcessSignal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProcessSignal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}
