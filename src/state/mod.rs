//! State Management Module
//!
//! Topology mode, late-supplied runtime settings and the readiness gate.

mod gate;
mod settings;

pub use gate::{GateState, ReadinessGate, ReadinessSequence};
pub use settings::{ResolvedSettings, RuntimeSettings};

use serde::{Deserialize, Serialize};

use crate::bus::ListenMethod;

/// Deployment topology of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    /// Sole writer, serves dumps
    Master,
    /// Bootstraps from a master, then follows the command stream
    Slave,
    /// Single process, no replication
    NoSync,
    /// Replica that also serves dumps to further replicas
    Both,
}

impl Mode {
    /// How the command processor attaches to the command exchange
    pub fn listen_method(&self) -> ListenMethod {
        match self {
            Mode::Master => ListenMethod::Consume,
            Mode::Slave | Mode::NoSync | Mode::Both => ListenMethod::Subscribe,
        }
    }

    /// Whether a dump server runs once ready
    pub fn serves_dumps(&self) -> bool {
        matches!(self, Mode::Master | Mode::Both)
    }

    /// Whether the readiness sequence fetches a dump first
    pub fn bootstraps(&self) -> bool {
        matches!(self, Mode::Slave | Mode::Both)
    }

    /// Whether the mode only makes sense with a bus shared between processes
    pub fn needs_shared_bus(&self) -> bool {
        !matches!(self, Mode::NoSync)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Master => "master",
            Mode::Slave => "slave",
            Mode::NoSync => "noSync",
            Mode::Both => "both",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Mode::Master),
            "slave" => Ok(Mode::Slave),
            "noSync" | "nosync" | "no-sync" => Ok(Mode::NoSync),
            "both" => Ok(Mode::Both),
            other => Err(format!(
                "unknown mode {:?}, expected master, slave, noSync or both",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_topology() {
        assert_eq!(Mode::Master.listen_method(), ListenMethod::Consume);
        assert_eq!(Mode::Slave.listen_method(), ListenMethod::Subscribe);
        assert_eq!(Mode::NoSync.listen_method(), ListenMethod::Subscribe);
        assert_eq!(Mode::Both.listen_method(), ListenMethod::Subscribe);

        assert!(Mode::Master.serves_dumps() && !Mode::Master.bootstraps());
        assert!(Mode::Both.serves_dumps() && Mode::Both.bootstraps());
        assert!(!Mode::NoSync.serves_dumps() && !Mode::NoSync.bootstraps());

        assert!(!Mode::NoSync.needs_shared_bus());
        assert!(Mode::Master.needs_shared_bus());
        assert!(Mode::Slave.needs_shared_bus());
        assert!(Mode::Both.needs_shared_bus());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(serde_json::to_string(&Mode::NoSync).unwrap(), "\"noSync\"");
        assert_eq!("noSync".parse::<Mode>().unwrap(), Mode::NoSync);
        assert_eq!(Mode::Both.to_string(), "both");
        assert!("leader".parse::<Mode>().is_err());
    }
}
