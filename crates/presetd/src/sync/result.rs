use std::net::IpAddr;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::device::DeviceError;

/// Why one device could not be synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    Protocol,
    Timeout,
    Persistence,
}

impl From<&DeviceError> for FailureKind {
    fn from(error: &DeviceError) -> Self {
        match error {
            DeviceError::Unreachable { .. } => FailureKind::Unreachable,
            DeviceError::Protocol { .. }
            | DeviceError::PresetsUnsupported { .. }
            | DeviceError::Rejected { .. } => FailureKind::Protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub address: IpAddr,
    /// Known only if the device got as far as identifying itself
    pub device_id: Option<String>,
    pub kind: FailureKind,
    pub error: String,
}

/// Outcome of one sync run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    discovered: usize,
    synced: usize,
    failed: usize,
    failures: Vec<SyncFailure>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub(crate) fn new(
        discovered: usize,
        synced: usize,
        failures: Vec<SyncFailure>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            discovered,
            synced,
            failed: failures.len(),
            failures,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Devices returned by discovery, after removing duplicate addresses.
    pub fn discovered(&self) -> usize {
        self.discovered
    }

    pub fn synced(&self) -> usize {
        self.synced
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn failures(&self) -> &[SyncFailure] {
        &self.failures
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_counts_failures() {
        let failure = SyncFailure {
            address: "192.0.2.12".parse().unwrap(),
            device_id: None,
            kind: FailureKind::Unreachable,
            error: "connection refused".to_string(),
        };
        let result = SyncResult::new(3, 2, vec![failure], Utc::now());
        assert_eq!(result.failed(), 1);
        assert!(result.finished_at() >= result.started_at());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["failures"][0]["kind"], "unreachable");
        assert_eq!(json["synced"], 2);
    }

    #[test]
    fn test_failure_kind_from_device_error() {
        let err = DeviceError::Protocol {
            url: "http://a/info".to_string(),
            reason: "missing deviceID".to_string(),
        };
        assert_eq!(FailureKind::from(&err), FailureKind::Protocol);
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
