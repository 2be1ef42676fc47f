//! Payload schema validation for the upstream affiliate API.
//!
//! Runs against the raw JSON value before typed deserialization so every
//! offending field can be reported as `{field_path, code, error_reason}`.
//! Unknown fields are always allowed through (forward-compatible); only
//! required keys, enum domains and datetime formats are enforced.

use chrono::DateTime;
use serde_json::Value;

/// Upstream status vocabulary accepted at the boundary. Wider than the
/// stored domain; synonyms are folded later by `RaceStatus::from_upstream`.
const STATUS_DOMAIN: [&str; 9] = [
    "open",
    "closed",
    "interim",
    "final",
    "finalized",
    "official",
    "abandoned",
    "cancelled",
    "running",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field_path: String,
    pub code: &'static str,
    pub error_reason: String,
}

#[derive(Debug, thiserror::Error)]
#[error("Payload failed schema validation with {} field error(s)", errors.len())]
pub struct ValidationFailure {
    pub errors: Vec<FieldError>,
}

struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn push(&mut self, field_path: &str, code: &'static str, error_reason: impl Into<String>) {
        self.errors.push(FieldError {
            field_path: field_path.to_string(),
            code,
            error_reason: error_reason.into(),
        });
    }

    fn require_string(&mut self, value: &Value, path: &str) -> Option<String> {
        match value.pointer(path) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::String(_)) => {
                self.push(path, "required", "must not be empty");
                None
            }
            Some(other) => {
                self.push(
                    path,
                    "invalid_type",
                    format!("expected string, got {}", type_name(other)),
                );
                None
            }
            None => {
                self.push(path, "required", "missing required key");
                None
            }
        }
    }

    fn require_datetime(&mut self, value: &Value, path: &str) {
        if let Some(raw) = self.require_string(value, path) {
            if DateTime::parse_from_rfc3339(&raw).is_err() {
                self.push(
                    path,
                    "invalid_datetime",
                    format!("not an ISO-8601 datetime: {}", raw),
                );
            }
        }
    }

    fn require_status(&mut self, value: &Value, path: &str) {
        if let Some(raw) = self.require_string(value, path) {
            let lowered = raw.to_ascii_lowercase();
            if !STATUS_DOMAIN.contains(&lowered.as_str()) {
                self.push(
                    path,
                    "invalid_enum",
                    format!("status '{}' outside known domain", raw),
                );
            }
        }
    }

    fn finish(self, context: &str) -> Result<(), ValidationFailure> {
        if self.errors.is_empty() {
            return Ok(());
        }
        for error in &self.errors {
            log::error!(
                "❌ Schema validation [{}]: field_path={} code={} error_reason={}",
                context,
                error.field_path,
                error.code,
                error.error_reason
            );
        }
        Err(ValidationFailure {
            errors: self.errors,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate an event payload (`GET /racing/event/{race_id}`).
pub fn validate_race_event(raw: &Value) -> Result<(), ValidationFailure> {
    let mut v = Validator::new();

    v.require_string(raw, "/race/id");
    v.require_string(raw, "/race/name");
    v.require_datetime(raw, "/race/start_time");
    v.require_status(raw, "/race/status");

    // meeting historically arrives as a bare id string or an expanded object
    match raw.pointer("/meeting") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(Value::Object(_)) => {
            v.require_string(raw, "/meeting/id");
            v.require_string(raw, "/meeting/name");
            v.require_string(raw, "/meeting/country");
            v.require_string(raw, "/meeting/category_name");
            v.require_string(raw, "/meeting/date");
        }
        Some(other) => {
            v.push(
                "/meeting",
                "invalid_type",
                format!("expected string or object, got {}", type_name(other)),
            );
        }
    }

    if let Some(Value::Array(entrants)) = raw.pointer("/entrants") {
        for (i, _) in entrants.iter().enumerate() {
            let base = format!("/entrants/{}", i);
            v.require_string(raw, &format!("{}/id", base));
            v.require_string(raw, &format!("{}/name", base));
            match raw.pointer(&format!("{}/runner_number", base)) {
                Some(Value::Number(n)) => {
                    if n.as_i64().map_or(true, |value| value < 0) {
                        v.push(
                            &format!("{}/runner_number", base),
                            "out_of_range",
                            "runner_number must be >= 0",
                        );
                    }
                }
                Some(other) => v.push(
                    &format!("{}/runner_number", base),
                    "invalid_type",
                    format!("expected number, got {}", type_name(other)),
                ),
                None => v.push(
                    &format!("{}/runner_number", base),
                    "required",
                    "missing required key",
                ),
            }
        }
    }

    v.finish("race_event")
}

/// Validate a race-list payload (`GET /racing/list`).
pub fn validate_race_list(raw: &Value) -> Result<(), ValidationFailure> {
    let mut v = Validator::new();

    match raw.pointer("/data/meetings") {
        Some(Value::Array(meetings)) => {
            for (i, _) in meetings.iter().enumerate() {
                let base = format!("/data/meetings/{}", i);
                v.require_string(raw, &format!("{}/meeting", base));
                v.require_string(raw, &format!("{}/name", base));
                v.require_string(raw, &format!("{}/country", base));
                v.require_string(raw, &format!("{}/category_name", base));
                v.require_string(raw, &format!("{}/date", base));
                if let Some(Value::Array(races)) = raw.pointer(&format!("{}/races", base)) {
                    for (j, _) in races.iter().enumerate() {
                        let race = format!("{}/races/{}", base, j);
                        v.require_string(raw, &format!("{}/id", race));
                        v.require_datetime(raw, &format!("{}/start_time", race));
                        v.require_status(raw, &format!("{}/status", race));
                    }
                }
            }
        }
        Some(other) => v.push(
            "/data/meetings",
            "invalid_type",
            format!("expected array, got {}", type_name(other)),
        ),
        None => v.push("/data/meetings", "required", "missing required key"),
    }

    v.finish("race_list")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_event() -> Value {
        json!({
            "race": {
                "id": "R1",
                "name": "Premier Sprint",
                "start_time": "2025-10-12T14:30:00+13:00",
                "status": "open"
            },
            "meeting": "M1",
            "entrants": [
                {"id": "E1", "name": "Fast Horse", "runner_number": 1}
            ]
        })
    }

    #[test]
    fn valid_payload_passes() {
        assert!(validate_race_event(&valid_event()).is_ok());
    }

    #[test]
    fn missing_required_key_is_reported_with_path() {
        let mut payload = valid_event();
        payload["race"].as_object_mut().unwrap().remove("start_time");
        let failure = validate_race_event(&payload).unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| e.field_path == "/race/start_time" && e.code == "required"));
    }

    #[test]
    fn status_outside_domain_is_an_enum_error() {
        let mut payload = valid_event();
        payload["race"]["status"] = json!("jogging");
        let failure = validate_race_event(&payload).unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| e.field_path == "/race/status" && e.code == "invalid_enum"));
    }

    #[test]
    fn non_iso_datetime_is_rejected() {
        let mut payload = valid_event();
        payload["race"]["start_time"] = json!("12/10/2025 2:30pm");
        let failure = validate_race_event(&payload).unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| e.code == "invalid_datetime"));
    }

    #[test]
    fn meeting_accepts_string_and_object_rejects_array() {
        let mut payload = valid_event();
        payload["meeting"] = json!(["not", "valid"]);
        let failure = validate_race_event(&payload).unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| e.field_path == "/meeting" && e.code == "invalid_type"));
    }

    #[test]
    fn negative_runner_number_is_out_of_range() {
        let mut payload = valid_event();
        payload["entrants"][0]["runner_number"] = json!(-2);
        let failure = validate_race_event(&payload).unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| e.code == "out_of_range"));
    }

    #[test]
    fn unknown_fields_are_not_errors() {
        let mut payload = valid_event();
        payload["race"]["brand_new"] = json!({"whatever": 1});
        assert!(validate_race_event(&payload).is_ok());
    }
}
