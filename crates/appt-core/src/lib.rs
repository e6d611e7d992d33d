//! Core domain model for GHL appointment webhook reconciliation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "appt-core";

/// Booking status that marks a brand-new appointment on the lifecycle webhook.
pub const BOOKING_STATUS_CONFIRMED: &str = "confirmed";

/// Booking source recorded when the vendor payload does not carry one.
pub const DEFAULT_BOOKING_SOURCE: &str = "ghl_calendar";

/// Tag written to `outcome_recorded_by` for outcomes applied by this ingestion path.
pub const OUTCOME_RECORDED_BY: &str = "ghl_webhook";

/// Closed outcome vocabulary stored in `appointments.outcome_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Showed,
    NoShow,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Showed => "showed",
            Self::NoShow => "no_show",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipeline created an appointment row.
///
/// The automation sync is authoritative; rows it writes are never re-attributed
/// by the webhook path. Values the storage layer knows about but this crate
/// does not are carried through untouched as [`CreatedSource::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CreatedSource {
    AutomationSync,
    RepManual,
    Other(String),
}

impl CreatedSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AutomationSync => "n8n_sync",
            Self::RepManual => "rep_manual",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for CreatedSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            "n8n_sync" => Self::AutomationSync,
            "rep_manual" => Self::RepManual,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for CreatedSource {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<CreatedSource> for String {
    fn from(value: CreatedSource) -> Self {
        match value {
            CreatedSource::Other(value) => value,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for CreatedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal observations made while normalizing a vendor payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizeWarning {
    UnparsableStartTime { raw: String },
}

/// Canonical appointment event extracted from one webhook delivery.
///
/// `location_id` and `contact_id` stay optional here: they are only required
/// once the event turns out to be insert-eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub ghl_appointment_id: String,
    pub location_id: Option<String>,
    pub contact_id: Option<String>,
    pub calendar_id: Option<String>,
    /// Lower-cased lifecycle status; empty when the payload carries none.
    pub status: String,
    pub appointment_status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub assigned_rep_id: Option<String>,
    pub assigned_rep_name: Option<String>,
    pub created_by_id: Option<String>,
    pub created_by_name: Option<String>,
    pub title: Option<String>,
    pub appointment_type: Option<String>,
    pub workflow_id: Option<String>,
    pub booking_source: String,
    pub warnings: Vec<NormalizeWarning>,
    pub raw_payload: JsonValue,
}

/// Slice of an existing row needed to branch between update and ignore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingAppointment {
    pub id: Uuid,
    pub created_source: CreatedSource,
    pub outcome_status: Option<String>,
}

/// Arguments of the passive insert-if-absent storage primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassiveUpsert {
    pub ghl_appointment_id: String,
    pub location_id: String,
    pub contact_id: String,
    pub calendar_id: Option<String>,
    pub assigned_rep_id: Option<String>,
    pub assigned_rep_name: Option<String>,
    pub title: Option<String>,
    pub appointment_type: Option<String>,
    pub appointment_time: Option<DateTime<Utc>>,
    /// Raw lifecycle status from the event (`status`), when present.
    pub lifecycle_status: Option<String>,
    /// Vendor booking label (`appointmentStatus`), stored as `status`.
    pub booking_status: String,
    pub outcome_status_seed: Option<OutcomeStatus>,
    pub created_by_id: Option<String>,
    pub created_by_name: Option<String>,
    pub booking_source: String,
    pub raw_payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    SkippedExisting,
}

impl UpsertAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::SkippedExisting => "skipped_existing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub appointment_id: Uuid,
    pub action_taken: UpsertAction,
    pub created_source: CreatedSource,
}

/// Outcome-only mutation. Nothing else on the row is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeUpdate {
    pub ghl_appointment_id: String,
    pub outcome_status: OutcomeStatus,
    pub recorded_by: String,
    pub recorded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full persisted appointment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    pub id: Uuid,
    pub ghl_appointment_id: String,
    pub location_id: String,
    pub contact_id: String,
    pub calendar_id: Option<String>,
    pub assigned_rep_id: Option<String>,
    pub assigned_rep_name: Option<String>,
    pub title: Option<String>,
    pub appointment_type: Option<String>,
    pub appointment_time: Option<DateTime<Utc>>,
    pub status: String,
    pub outcome_status: Option<String>,
    pub created_source: CreatedSource,
    pub created_by_user_id: Option<String>,
    pub created_by_user_name: Option<String>,
    pub booking_source: Option<String>,
    pub raw_data: JsonValue,
    pub outcome_recorded_at: Option<DateTime<Utc>>,
    pub outcome_recorded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppointmentRecord {
    /// Row shape produced by the passive webhook insert.
    ///
    /// A seeded outcome is stamped as recorded by the webhook at insert time.
    pub fn from_passive_upsert(req: &PassiveUpsert, now: DateTime<Utc>) -> Self {
        let seeded = req.outcome_status_seed.is_some();
        Self {
            id: Uuid::new_v4(),
            ghl_appointment_id: req.ghl_appointment_id.clone(),
            location_id: req.location_id.clone(),
            contact_id: req.contact_id.clone(),
            calendar_id: req.calendar_id.clone(),
            assigned_rep_id: req.assigned_rep_id.clone(),
            assigned_rep_name: req.assigned_rep_name.clone(),
            title: req.title.clone(),
            appointment_type: req.appointment_type.clone(),
            appointment_time: req.appointment_time,
            status: req.booking_status.clone(),
            outcome_status: req.outcome_status_seed.map(|o| o.as_str().to_string()),
            created_source: CreatedSource::RepManual,
            created_by_user_id: req.created_by_id.clone(),
            created_by_user_name: req.created_by_name.clone(),
            booking_source: Some(req.booking_source.clone()),
            raw_data: req.raw_payload.clone(),
            outcome_recorded_at: seeded.then_some(now),
            outcome_recorded_by: seeded.then(|| OUTCOME_RECORDED_BY.to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn as_existing(&self) -> ExistingAppointment {
        ExistingAppointment {
            id: self.id,
            created_source: self.created_source.clone(),
            outcome_status: self.outcome_status.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_source_round_trips_unknown_values() {
        let parsed: CreatedSource = serde_json::from_str("\"reactivation_flow\"").unwrap();
        assert_eq!(parsed, CreatedSource::Other("reactivation_flow".into()));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"reactivation_flow\"");

        let manual: CreatedSource = serde_json::from_str("\"rep_manual\"").unwrap();
        assert_eq!(manual, CreatedSource::RepManual);
    }

    #[test]
    fn outcome_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&OutcomeStatus::NoShow).unwrap(), "\"no_show\"");
        assert_eq!(OutcomeStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn passive_upsert_rows_are_rep_manual() {
        let req = PassiveUpsert {
            ghl_appointment_id: "appt-1".into(),
            location_id: "loc-1".into(),
            contact_id: "contact-1".into(),
            calendar_id: None,
            assigned_rep_id: None,
            assigned_rep_name: Some("Dana Reyes".into()),
            title: None,
            appointment_type: None,
            appointment_time: None,
            lifecycle_status: Some(BOOKING_STATUS_CONFIRMED.into()),
            booking_status: BOOKING_STATUS_CONFIRMED.into(),
            outcome_status_seed: None,
            created_by_id: None,
            created_by_name: None,
            booking_source: DEFAULT_BOOKING_SOURCE.into(),
            raw_payload: serde_json::json!({"id": "appt-1"}),
        };
        let record = AppointmentRecord::from_passive_upsert(&req, Utc::now());
        assert_eq!(record.created_source, CreatedSource::RepManual);
        assert_eq!(record.outcome_status, None);
        assert_eq!(record.booking_source.as_deref(), Some("ghl_calendar"));
        assert_eq!(record.outcome_recorded_at, None);
        assert_eq!(record.outcome_recorded_by, None);
    }

    #[test]
    fn seeded_outcome_is_stamped_at_insert() {
        let now = Utc::now();
        let req = PassiveUpsert {
            ghl_appointment_id: "appt-2".into(),
            location_id: "loc-1".into(),
            contact_id: "contact-1".into(),
            calendar_id: None,
            assigned_rep_id: None,
            assigned_rep_name: None,
            title: None,
            appointment_type: None,
            appointment_time: None,
            lifecycle_status: Some("showed".into()),
            booking_status: "Booked".into(),
            outcome_status_seed: Some(OutcomeStatus::Showed),
            created_by_id: None,
            created_by_name: None,
            booking_source: DEFAULT_BOOKING_SOURCE.into(),
            raw_payload: serde_json::json!({"id": "appt-2"}),
        };
        let record = AppointmentRecord::from_passive_upsert(&req, now);
        assert_eq!(record.status, "Booked");
        assert_eq!(record.outcome_status.as_deref(), Some("showed"));
        assert_eq!(record.outcome_recorded_at, Some(now));
        assert_eq!(record.outcome_recorded_by.as_deref(), Some(OUTCOME_RECORDED_BY));
    }
}
