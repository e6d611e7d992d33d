//! GoHighLevel payload adapter: field-alias normalization + status classification.

use appt_core::{
    InboundEvent, NormalizeWarning, OutcomeStatus, DEFAULT_BOOKING_SOURCE,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "appt-adapters";

/// Path of object keys from the payload root to a value.
pub type JsonPath = &'static [&'static str];

/// One way of producing a display name from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    Field(JsonPath),
    /// `first + " " + last`; only applies when both parts are present.
    FullName { first: JsonPath, last: JsonPath },
}

// Alias tables, highest precedence first. A new vendor spelling is one more entry.
pub const APPOINTMENT_ID_FIELDS: &[JsonPath] = &[&["id"], &["appointmentId"]];
pub const LOCATION_ID_FIELDS: &[JsonPath] = &[&["locationId"], &["location_id"]];
pub const CONTACT_ID_FIELDS: &[JsonPath] = &[&["contactId"], &["contact_id"], &["contact", "id"]];
pub const CALENDAR_ID_FIELDS: &[JsonPath] = &[&["calendarId"]];
pub const STATUS_FIELDS: &[JsonPath] = &[&["status"], &["appointmentStatus"]];
pub const APPOINTMENT_STATUS_FIELDS: &[JsonPath] = &[&["appointmentStatus"]];
pub const START_TIME_FIELDS: &[JsonPath] = &[&["startTime"], &["start_time"]];
pub const ASSIGNED_REP_ID_FIELDS: &[JsonPath] = &[&["assignedUserId"]];
pub const CREATED_BY_ID_FIELDS: &[JsonPath] =
    &[&["createdBy"], &["userId"], &["createdByUser", "id"]];
pub const TITLE_FIELDS: &[JsonPath] = &[&["title"]];
pub const APPOINTMENT_TYPE_FIELDS: &[JsonPath] = &[&["appointmentType"]];
pub const WORKFLOW_ID_FIELDS: &[JsonPath] = &[&["workflowId"]];
pub const BOOKING_SOURCE_FIELDS: &[JsonPath] = &[&["source"]];

const CREATOR_FULL_NAME: NameSource = NameSource::FullName {
    first: &["createdByUser", "firstName"],
    last: &["createdByUser", "lastName"],
};

pub const ASSIGNED_REP_NAME_SOURCES: &[NameSource] = &[
    NameSource::Field(&["assignedUserName"]),
    CREATOR_FULL_NAME,
    NameSource::Field(&["createdByUser", "name"]),
];

pub const CREATED_BY_NAME_SOURCES: &[NameSource] = &[
    NameSource::Field(&["userName"]),
    NameSource::Field(&["createdByUser", "name"]),
    CREATOR_FULL_NAME,
];

/// Vendor status spellings and the outcome each one records.
///
/// A reschedule closes out the current appointment id; the new slot arrives
/// as its own event with its own id.
pub const STATUS_OUTCOMES: &[(&str, OutcomeStatus)] = &[
    ("showed", OutcomeStatus::Showed),
    ("completed", OutcomeStatus::Showed),
    ("no_show", OutcomeStatus::NoShow),
    ("no-show", OutcomeStatus::NoShow),
    ("noshow", OutcomeStatus::NoShow),
    ("cancelled", OutcomeStatus::Cancelled),
    ("canceled", OutcomeStatus::Cancelled),
    ("rescheduled", OutcomeStatus::Cancelled),
];

const NAIVE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Missing appointment ID")]
    MissingIdentifier,
    #[error("Missing locationId or contactId for new booking")]
    MissingRequiredAttribution {
        location_id: Option<String>,
        contact_id: Option<String>,
    },
}

/// Vendor-specific payload handling behind the reconciliation engine.
pub trait PayloadAdapter: Send + Sync {
    fn vendor_id(&self) -> &'static str;
    fn normalize(&self, payload: &JsonValue) -> Result<InboundEvent, NormalizeError>;
    fn classify_status(&self, status: &str) -> Option<OutcomeStatus>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GhlAdapter;

impl PayloadAdapter for GhlAdapter {
    fn vendor_id(&self) -> &'static str {
        "ghl"
    }

    fn normalize(&self, payload: &JsonValue) -> Result<InboundEvent, NormalizeError> {
        normalize_payload(payload)
    }

    fn classify_status(&self, status: &str) -> Option<OutcomeStatus> {
        classify_status(status)
    }
}

pub fn ghl_adapter() -> impl PayloadAdapter {
    GhlAdapter
}

/// Map a raw vendor status to an outcome. `None` means "no outcome change applies".
pub fn classify_status(status: &str) -> Option<OutcomeStatus> {
    let needle = status.trim().to_ascii_lowercase();
    STATUS_OUTCOMES
        .iter()
        .find(|(spelling, _)| *spelling == needle)
        .map(|(_, outcome)| *outcome)
}

/// Extract the canonical event from a loosely-shaped GHL payload.
pub fn normalize_payload(payload: &JsonValue) -> Result<InboundEvent, NormalizeError> {
    if !payload.is_object() {
        return Err(NormalizeError::MissingIdentifier);
    }
    let ghl_appointment_id =
        first_text(payload, APPOINTMENT_ID_FIELDS).ok_or(NormalizeError::MissingIdentifier)?;

    let mut warnings = Vec::new();
    let start_time = match first_value(payload, START_TIME_FIELDS) {
        Some(raw) => match parse_start_time(raw) {
            Some(ts) => Some(ts),
            None => {
                let raw = raw_display(raw);
                warn!(%ghl_appointment_id, raw_start_time = %raw, "could not parse startTime");
                warnings.push(NormalizeWarning::UnparsableStartTime { raw });
                None
            }
        },
        None => None,
    };

    Ok(InboundEvent {
        location_id: first_text(payload, LOCATION_ID_FIELDS),
        contact_id: first_text(payload, CONTACT_ID_FIELDS),
        calendar_id: first_text(payload, CALENDAR_ID_FIELDS),
        status: first_text(payload, STATUS_FIELDS)
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default(),
        appointment_status: first_text(payload, APPOINTMENT_STATUS_FIELDS),
        start_time,
        assigned_rep_id: first_text(payload, ASSIGNED_REP_ID_FIELDS),
        assigned_rep_name: first_name(payload, ASSIGNED_REP_NAME_SOURCES),
        created_by_id: first_text(payload, CREATED_BY_ID_FIELDS),
        created_by_name: first_name(payload, CREATED_BY_NAME_SOURCES),
        title: first_text(payload, TITLE_FIELDS),
        appointment_type: first_text(payload, APPOINTMENT_TYPE_FIELDS),
        workflow_id: first_text(payload, WORKFLOW_ID_FIELDS),
        booking_source: first_text(payload, BOOKING_SOURCE_FIELDS)
            .unwrap_or_else(|| DEFAULT_BOOKING_SOURCE.to_string()),
        warnings,
        raw_payload: payload.clone(),
        ghl_appointment_id,
    })
}

/// Location and contact ids, both required before a row can be inserted.
pub fn require_attribution(event: &InboundEvent) -> Result<(String, String), NormalizeError> {
    match (&event.location_id, &event.contact_id) {
        (Some(location_id), Some(contact_id)) => Ok((location_id.clone(), contact_id.clone())),
        (location_id, contact_id) => Err(NormalizeError::MissingRequiredAttribution {
            location_id: location_id.clone(),
            contact_id: contact_id.clone(),
        }),
    }
}

/// Accepts RFC 3339, naive ISO-ish timestamps (read as UTC) and epoch milliseconds.
pub fn parse_start_time(raw: &JsonValue) -> Option<DateTime<Utc>> {
    match raw {
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        JsonValue::String(s) => parse_time_str(s.trim()),
        _ => None,
    }
}

fn parse_time_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in NAIVE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
    }
    None
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_value<'a>(payload: &'a JsonValue, aliases: &[JsonPath]) -> Option<&'a JsonValue> {
    aliases.iter().find_map(|path| {
        json_at(payload, path).filter(|v| !matches!(v, JsonValue::String(s) if s.trim().is_empty()))
    })
}

fn first_text(payload: &JsonValue, aliases: &[JsonPath]) -> Option<String> {
    aliases.iter().find_map(|path| json_text(payload, path))
}

fn first_name(payload: &JsonValue, sources: &[NameSource]) -> Option<String> {
    sources.iter().find_map(|source| match source {
        NameSource::Field(path) => json_text(payload, path),
        NameSource::FullName { first, last } => {
            let first = json_text(payload, first)?;
            let last = json_text(payload, last)?;
            Some(format!("{first} {last}"))
        }
    })
}

fn raw_display(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
