use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::roles::Role;
use crate::Severity;

/// A persisted violation, as returned by the REST API and pushed over the socket.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(from = "ViolationRecord")]
pub struct Violation {
    pub id: String,
    pub violation_type: Option<String>,
    pub camera_id: Option<String>,
    pub camera_name: Option<String>,
    pub domain_id: Option<String>,
    pub severity: Severity,
    pub status: Option<String>,
    pub missing_ppe: Vec<String>,
    pub confidence: Option<f32>,
    /// First of `timestamp`, `created_at`, `detected_at` the record carries.
    pub timestamp: Option<String>,
    pub message: Option<String>,
}

/// Wire form. Records may carry any combination of the three time keys.
#[derive(Deserialize)]
struct ViolationRecord {
    #[serde(deserialize_with = "crate::deserialize_id")]
    id: String,
    #[serde(default)]
    violation_type: Option<String>,
    #[serde(default, deserialize_with = "crate::deserialize_opt_id")]
    camera_id: Option<String>,
    #[serde(default)]
    camera_name: Option<String>,
    #[serde(default, deserialize_with = "crate::deserialize_opt_id")]
    domain_id: Option<String>,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    missing_ppe: Vec<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    detected_at: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<ViolationRecord> for Violation {
    fn from(record: ViolationRecord) -> Self {
        Self {
            id: record.id,
            violation_type: record.violation_type,
            camera_id: record.camera_id,
            camera_name: record.camera_name,
            domain_id: record.domain_id,
            severity: record.severity,
            status: record.status,
            missing_ppe: record.missing_ppe,
            confidence: record.confidence,
            timestamp: record
                .timestamp
                .or(record.created_at)
                .or(record.detected_at),
            message: record.message,
        }
    }
}

impl Violation {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(crate::parse_timestamp)
    }

    pub fn camera_label(&self) -> String {
        self.camera_name
            .clone()
            .or_else(|| self.camera_id.as_ref().map(|id| format!("camera {}", id)))
            .unwrap_or_else(|| "unknown camera".to_string())
    }

    pub fn type_label(&self) -> String {
        if let Some(kind) = &self.violation_type {
            return kind.replace('_', " ");
        }
        if !self.missing_ppe.is_empty() {
            return format!("missing {}", self.missing_ppe.join(", "));
        }
        "PPE violation".to_string()
    }
}

/// Filters for `GET /api/v1/violations`.
#[derive(Clone, Debug, Default)]
pub struct ViolationQuery {
    pub skip: u32,
    pub limit: u32,
    pub domain_id: Option<String>,
    pub camera_id: Option<String>,
    pub status: Option<String>,
    pub severity: Option<Severity>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl ViolationQuery {
    pub fn recent(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("skip", self.skip.to_string())];
        if self.limit > 0 {
            pairs.push(("limit", self.limit.to_string()));
        }
        if let Some(domain) = &self.domain_id {
            pairs.push(("domain_id", domain.clone()));
        }
        if let Some(camera) = &self.camera_id {
            pairs.push(("camera_id", camera.clone()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(severity) = self.severity {
            pairs.push(("severity", severity.as_str().to_string()));
        }
        if let Some(start) = self.start_date {
            pairs.push(("start_date", start.to_rfc3339()));
        }
        if let Some(end) = self.end_date {
            pairs.push(("end_date", end.to_rfc3339()));
        }
        pairs
    }
}

/// One page of violations. The API returns either a bare array or an envelope.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ViolationPage {
    Bare(Vec<Violation>),
    Envelope {
        #[serde(alias = "violations", alias = "data")]
        items: Vec<Violation>,
        #[serde(default)]
        total: Option<u64>,
    },
}

impl ViolationPage {
    pub fn into_items(self) -> Vec<Violation> {
        match self {
            ViolationPage::Envelope { items, .. } => items,
            ViolationPage::Bare(items) => items,
        }
    }

    pub fn total(&self) -> Option<u64> {
        match self {
            ViolationPage::Envelope { total, items } => total.or(Some(items.len() as u64)),
            ViolationPage::Bare(items) => Some(items.len() as u64),
        }
    }
}

/// The signed-in user as reported by `GET /api/v1/auth/me`.
#[derive(Clone, Debug, Deserialize)]
pub struct UserProfile {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub domain_ids: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_envelope_pages() {
        let bare = r#"[{"id": 1, "severity": "low"}]"#;
        let page: ViolationPage = serde_json::from_str(bare).unwrap();
        assert_eq!(page.total(), Some(1));
        assert_eq!(page.into_items()[0].id, "1");

        let envelope = r#"{"violations": [{"id": "a"}, {"id": "b"}], "total": 40}"#;
        let page: ViolationPage = serde_json::from_str(envelope).unwrap();
        assert_eq!(page.total(), Some(40));
        assert_eq!(page.into_items().len(), 2);
    }

    #[test]
    fn labels_fall_back_sensibly() {
        let v: Violation = serde_json::from_str(
            r#"{"id": 5, "camera_id": 2, "missing_ppe": ["hardhat", "vest"], "created_at": "2024-03-01T10:00:00"}"#,
        )
        .unwrap();
        assert_eq!(v.camera_label(), "camera 2");
        assert_eq!(v.type_label(), "missing hardhat, vest");
        assert!(v.occurred_at().is_some());
        assert_eq!(v.severity, Severity::Medium);
    }

    #[test]
    fn records_with_several_time_keys_still_decode() {
        let v: Violation = serde_json::from_str(
            r#"{"id": 1, "violation_type": "no_vest",
                "timestamp": "2024-06-01T12:00:00Z", "created_at": "2024-06-01T11:59:58Z",
                "detected_at": "2024-06-01T11:59:57Z"}"#,
        )
        .unwrap();
        assert_eq!(v.timestamp.as_deref(), Some("2024-06-01T12:00:00Z"));

        let v: Violation = serde_json::from_str(
            r#"{"id": 2, "created_at": "2024-06-01T11:59:58Z", "detected_at": "2024-06-01T11:59:57Z"}"#,
        )
        .unwrap();
        assert_eq!(v.timestamp.as_deref(), Some("2024-06-01T11:59:58Z"));

        let page: ViolationPage = serde_json::from_str(
            r#"{"items": [{"id": 3, "timestamp": "2024-06-01T12:00:00Z", "created_at": "2024-06-01T12:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(page.into_items()[0].id, "3");
    }

    #[test]
    fn query_pairs_skip_unset_filters() {
        let query = ViolationQuery {
            limit: 20,
            severity: Some(Severity::Critical),
            domain_id: Some("3".into()),
            ..ViolationQuery::default()
        };
        let pairs = query.pairs();
        assert!(pairs.contains(&("limit", "20".to_string())));
        assert!(pairs.contains(&("severity", "critical".to_string())));
        assert!(pairs.contains(&("domain_id", "3".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "camera_id"));
    }
}
