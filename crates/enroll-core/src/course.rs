//! Course records and portal operation results.

use serde::{Deserialize, Serialize};

/// One row from the portal's course list.
///
/// Field names follow the portal's wire names; unknown fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRecord {
    /// Teaching class identifier, used as `clazzId` on submit.
    #[serde(rename = "JXBID", default)]
    pub class_id: String,
    /// Course name.
    #[serde(rename = "KCM", default)]
    pub name: String,
    /// Instructor name.
    #[serde(rename = "JSXM", default)]
    pub teacher: String,
    /// Capability token embedded in the row, if the portal included one.
    #[serde(rename = "secretVal", default, skip_serializing)]
    pub secret_val: Option<String>,
}

/// Result of a course search.
#[derive(Clone, Debug, Default)]
pub struct SearchResult {
    /// Parsed rows, in portal order.
    pub records: Vec<CourseRecord>,
    /// Raw response body, kept as a side channel for passive token capture.
    pub raw_body: String,
}

impl SearchResult {
    /// Whether the search produced at least one row.
    pub fn has_results(&self) -> bool {
        !self.records.is_empty()
    }
}

/// Outcome of a single submit (add-course) request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The portal accepted the request.
    Accepted(String),
    /// The portal answered and refused the request.
    Rejected(String),
    /// The request did not reach a definitive answer (network, 5xx, rate limit).
    Transient(String),
}

impl SubmitOutcome {
    /// Whether the outcome is an acceptance.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// The portal or transport message attached to the outcome.
    pub fn message(&self) -> &str {
        match self {
            Self::Accepted(m) | Self::Rejected(m) | Self::Transient(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_parses_portal_row() {
        let row = serde_json::json!({
            "JXBID": "202520261001",
            "KCM": "Compilers",
            "JSXM": "Zhang",
            "secretVal": "abc",
            "KXH": "01"
        });
        let record: CourseRecord = serde_json::from_value(row).unwrap();
        assert_eq!(record.class_id, "202520261001");
        assert_eq!(record.name, "Compilers");
        assert_eq!(record.teacher, "Zhang");
        assert_eq!(record.secret_val.as_deref(), Some("abc"));
    }

    #[test]
    fn record_tolerates_missing_fields() {
        let record: CourseRecord = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(record.class_id.is_empty());
        assert!(record.secret_val.is_none());
    }

    #[test]
    fn record_serialization_hides_secret() {
        let record = CourseRecord {
            class_id: "1".into(),
            secret_val: Some("hidden".into()),
            ..CourseRecord::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("hidden"));
    }

    #[test]
    fn submit_outcome_message() {
        assert!(SubmitOutcome::Accepted("ok".into()).is_accepted());
        assert_eq!(SubmitOutcome::Transient("HTTP 503".into()).message(), "HTTP 503");
    }

    #[test]
    fn submit_outcome_wire_shape() {
        let json = serde_json::to_value(SubmitOutcome::Rejected("full".into())).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["message"], "full");
    }
}
