use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Lifecycle operation a cluster is undergoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operation {
    Create,
    Delete,
    Update,
    Upgrade,
    #[default]
    Unknown,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
            Self::Update => "UPDATE",
            Self::Upgrade => "UPGRADE",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "DELETE" => Some(Self::Delete),
            "UPDATE" => Some(Self::Update),
            "UPGRADE" => Some(Self::Upgrade),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite `OPERATION:STATUS` describing what is being done to a cluster.
///
/// Serialized as a single string, e.g. `"CREATE:IN_PROGRESS"`. Unknown tokens
/// on either side of the separator decode to [`Operation::Unknown`] /
/// [`OperationStatus::Unknown`] rather than failing, so records written by a
/// newer engine remain readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Phase {
    pub operation: Operation,
    pub status: OperationStatus,
}

impl Phase {
    pub const fn new(operation: Operation, status: OperationStatus) -> Self {
        Self { operation, status }
    }

    pub const fn in_progress(operation: Operation) -> Self {
        Self::new(operation, OperationStatus::InProgress)
    }

    pub const fn succeeded(operation: Operation) -> Self {
        Self::new(operation, OperationStatus::Succeeded)
    }

    pub const fn failed(operation: Operation) -> Self {
        Self::new(operation, OperationStatus::Failed)
    }

    /// A cluster is busy while its current operation has not finished.
    pub fn is_busy(&self) -> bool {
        self.status == OperationStatus::InProgress
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (operation, status) = s.split_once(':')?;
        Some(Self {
            operation: Operation::parse(operation.trim()).unwrap_or_default(),
            status: OperationStatus::parse(status.trim()).unwrap_or_default(),
        })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.operation, self.status)
    }
}

impl FromStr for Phase {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::InvalidPhase(s.to_string()))
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(
            Phase::in_progress(Operation::Create).to_string(),
            "CREATE:IN_PROGRESS"
        );
        assert_eq!(
            Phase::failed(Operation::Upgrade).to_string(),
            "UPGRADE:FAILED"
        );
    }

    #[test]
    fn test_phase_parsing() {
        let phase: Phase = "UPDATE:SUCCEEDED".parse().unwrap();
        assert_eq!(phase.operation, Operation::Update);
        assert_eq!(phase.status, OperationStatus::Succeeded);

        let phase = Phase::parse("RESTORE:DONE").unwrap();
        assert_eq!(phase.operation, Operation::Unknown);
        assert_eq!(phase.status, OperationStatus::Unknown);

        assert!("CREATE".parse::<Phase>().is_err());
    }

    #[test]
    fn test_busy_and_terminal() {
        assert!(Phase::in_progress(Operation::Delete).is_busy());
        assert!(!Phase::in_progress(Operation::Delete).is_terminal());
        assert!(Phase::succeeded(Operation::Create).is_terminal());
        assert!(Phase::failed(Operation::Update).is_terminal());
        assert!(!Phase::default().is_busy());
        assert!(!Phase::default().is_terminal());
    }

    #[test]
    fn test_phase_serde() {
        let phase = Phase::in_progress(Operation::Upgrade);
        let json = serde_json::to_string(&phase).unwrap();
        assert_eq!(json, "\"UPGRADE:IN_PROGRESS\"");

        let decoded: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, phase);
    }
}
