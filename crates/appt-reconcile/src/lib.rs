//! Reconciliation engine: decides insert / update / ignore for appointment webhooks.
//!
//! The automation sync owns row creation. This path only ever inserts through
//! the gateway's passive insert-if-absent primitive, so a race with the sync
//! resolves in the sync's favour without any locking here. The lookup below is
//! used for branching only.

use std::fmt;
use std::sync::Arc;

use appt_adapters::{require_attribution, GhlAdapter, NormalizeError, PayloadAdapter};
use appt_core::{
    CreatedSource, ExistingAppointment, InboundEvent, NormalizeWarning, OutcomeStatus,
    OutcomeUpdate, PassiveUpsert, UpsertAction, UpsertResult, BOOKING_STATUS_CONFIRMED,
    OUTCOME_RECORDED_BY,
};
use appt_storage::{AppointmentGateway, GatewayError};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "appt-reconcile";

const UNKNOWN_APPOINTMENT_SUGGESTION: &str =
    "This appointment may have been created before webhook integration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Insert,
    UpdateOutcome,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert appointment",
            Self::UpdateOutcome => "update outcome",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Missing appointment ID")]
    MissingIdentifier,
    #[error("Missing locationId or contactId for new booking")]
    MissingRequiredAttribution {
        location_id: Option<String>,
        contact_id: Option<String>,
    },
    #[error("Database lookup failed")]
    LookupFailure(#[source] GatewayError),
    #[error("Failed to {operation}")]
    WriteFailure {
        operation: WriteOperation,
        #[source]
        source: GatewayError,
    },
}

impl ReconcileError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingIdentifier => "missing_identifier",
            Self::MissingRequiredAttribution { .. } => "missing_required_attribution",
            Self::LookupFailure(_) => "lookup_failure",
            Self::WriteFailure { .. } => "write_failure",
        }
    }

    /// True when resending the same payload cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingIdentifier | Self::MissingRequiredAttribution { .. }
        )
    }

    /// Underlying storage error text, when there is one.
    pub fn details(&self) -> Option<String> {
        match self {
            Self::LookupFailure(source) | Self::WriteFailure { source, .. } => {
                Some(source.to_string())
            }
            _ => None,
        }
    }
}

impl From<NormalizeError> for ReconcileError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::MissingIdentifier => Self::MissingIdentifier,
            NormalizeError::MissingRequiredAttribution {
                location_id,
                contact_id,
            } => Self::MissingRequiredAttribution {
                location_id,
                contact_id,
            },
        }
    }
}

/// What the engine will do with one event, given the existing row (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No row yet and the booking is confirmed: passive insert.
    Insert,
    /// Row exists and the status maps to an outcome.
    UpdateOutcome {
        existing: ExistingAppointment,
        outcome: OutcomeStatus,
    },
    /// Row exists but the status carries no outcome (duplicate "confirmed" etc).
    IgnoreUnmapped { existing: ExistingAppointment },
    /// No row and not a new booking.
    SkipUnknown,
}

pub fn decide(
    existing: Option<ExistingAppointment>,
    status: &str,
    outcome: Option<OutcomeStatus>,
) -> Decision {
    match (existing, outcome) {
        (None, _) if status == BOOKING_STATUS_CONFIRMED => Decision::Insert,
        (None, _) => Decision::SkipUnknown,
        (Some(existing), Some(outcome)) => Decision::UpdateOutcome { existing, outcome },
        (Some(existing), None) => Decision::IgnoreUnmapped { existing },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Inserted,
    SkippedExisting,
    UpdatedOutcome,
    Ignored,
    Skipped,
}

impl From<UpsertAction> for ReconcileAction {
    fn from(action: UpsertAction) -> Self {
        match action {
            UpsertAction::Inserted => Self::Inserted,
            UpsertAction::SkippedExisting => Self::SkippedExisting,
        }
    }
}

/// Successful (200) response body. Ignored and skipped events are successes too.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub success: bool,
    pub action: ReconcileAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_source: Option<CreatedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_source: Option<CreatedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_outcome: Option<OutcomeStatus>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<NormalizeWarning>,
}

impl ReconcileOutcome {
    fn new(action: ReconcileAction, message: String) -> Self {
        Self {
            success: true,
            action,
            appointment_id: None,
            created_source: None,
            existing_source: None,
            previous_outcome: None,
            new_outcome: None,
            message,
            suggestion: None,
            warnings: Vec::new(),
        }
    }

    fn from_upsert(result: UpsertResult) -> Self {
        let message = match result.action_taken {
            UpsertAction::Inserted => {
                "New manual appointment created with created_source=rep_manual".to_string()
            }
            UpsertAction::SkippedExisting => {
                "Appointment already exists (from automation sync) - no action taken".to_string()
            }
        };
        Self {
            appointment_id: Some(result.appointment_id),
            created_source: Some(result.created_source),
            ..Self::new(result.action_taken.into(), message)
        }
    }
}

pub struct Reconciler {
    gateway: Arc<dyn AppointmentGateway>,
    adapter: Box<dyn PayloadAdapter>,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn AppointmentGateway>) -> Self {
        Self {
            gateway,
            adapter: Box::new(GhlAdapter),
        }
    }

    /// Lifecycle webhook: new bookings and status changes share one entry point.
    pub async fn handle_status_event(
        &self,
        payload: &JsonValue,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let event = self.adapter.normalize(payload)?;
        let id = event.ghl_appointment_id.as_str();
        info!(
            vendor = self.adapter.vendor_id(),
            ghl_appointment_id = id,
            status = %event.status,
            "processing appointment webhook"
        );

        let existing = self.gateway.lookup(id).await.map_err(|err| {
            error!(ghl_appointment_id = id, error = %err, "appointment lookup failed");
            ReconcileError::LookupFailure(err)
        })?;
        let outcome = self.adapter.classify_status(&event.status);

        let response = match decide(existing, &event.status, outcome) {
            Decision::Insert => {
                info!(ghl_appointment_id = id, "new booking detected; inserting as rep_manual");
                self.insert(&event, BOOKING_STATUS_CONFIRMED.to_string(), None)
                    .await?
            }
            Decision::UpdateOutcome { existing, outcome } => {
                self.update_outcome(&event, existing, outcome).await?
            }
            Decision::IgnoreUnmapped { existing } => {
                info!(
                    ghl_appointment_id = id,
                    status = %event.status,
                    "status does not map to an outcome; ignoring"
                );
                ReconcileOutcome {
                    existing_source: Some(existing.created_source),
                    ..ReconcileOutcome::new(
                        ReconcileAction::Ignored,
                        format!(
                            "Status \"{}\" does not map to an outcome - no update needed",
                            event.status
                        ),
                    )
                }
            }
            Decision::SkipUnknown => {
                warn!(
                    ghl_appointment_id = id,
                    status = %event.status,
                    "status received for unknown appointment"
                );
                ReconcileOutcome {
                    suggestion: Some(UNKNOWN_APPOINTMENT_SUGGESTION.to_string()),
                    ..ReconcileOutcome::new(
                        ReconcileAction::Skipped,
                        format!(
                            "Appointment {id} not found and status \"{}\" is not a new booking",
                            event.status
                        ),
                    )
                }
            }
        };

        Ok(ReconcileOutcome {
            warnings: event.warnings,
            ..response
        })
    }

    /// "Appointment created" webhook: always a passive insert, no lookup.
    pub async fn handle_created_event(
        &self,
        payload: &JsonValue,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let event = self.adapter.normalize(payload)?;
        info!(
            vendor = self.adapter.vendor_id(),
            ghl_appointment_id = %event.ghl_appointment_id,
            "processing appointment created webhook"
        );
        let booking_status = event
            .appointment_status
            .clone()
            .unwrap_or_else(|| BOOKING_STATUS_CONFIRMED.to_string());
        let seed = self.adapter.classify_status(&event.status);
        let response = self.insert(&event, booking_status, seed).await?;
        Ok(ReconcileOutcome {
            warnings: event.warnings,
            ..response
        })
    }

    async fn insert(
        &self,
        event: &InboundEvent,
        booking_status: String,
        outcome_status_seed: Option<OutcomeStatus>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let (location_id, contact_id) = require_attribution(event)?;
        let req = PassiveUpsert {
            ghl_appointment_id: event.ghl_appointment_id.clone(),
            location_id,
            contact_id,
            calendar_id: event.calendar_id.clone(),
            assigned_rep_id: event.assigned_rep_id.clone(),
            assigned_rep_name: event.assigned_rep_name.clone(),
            title: event.title.clone(),
            appointment_type: event.appointment_type.clone(),
            appointment_time: event.start_time,
            lifecycle_status: (!event.status.is_empty()).then(|| event.status.clone()),
            booking_status,
            outcome_status_seed,
            created_by_id: event.created_by_id.clone(),
            created_by_name: event
                .created_by_name
                .clone()
                .or_else(|| event.assigned_rep_name.clone()),
            booking_source: event.booking_source.clone(),
            raw_payload: event.raw_payload.clone(),
        };

        let result = self.gateway.upsert_passive(&req).await.map_err(|err| {
            error!(ghl_appointment_id = %req.ghl_appointment_id, error = %err, "passive upsert failed");
            ReconcileError::WriteFailure {
                operation: WriteOperation::Insert,
                source: err,
            }
        })?;
        info!(
            ghl_appointment_id = %req.ghl_appointment_id,
            action = result.action_taken.as_str(),
            created_source = %result.created_source,
            "passive upsert result"
        );
        Ok(ReconcileOutcome::from_upsert(result))
    }

    async fn update_outcome(
        &self,
        event: &InboundEvent,
        existing: ExistingAppointment,
        outcome: OutcomeStatus,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        info!(
            ghl_appointment_id = %event.ghl_appointment_id,
            outcome = %outcome,
            "updating appointment outcome"
        );
        let now = Utc::now();
        let update = OutcomeUpdate {
            ghl_appointment_id: event.ghl_appointment_id.clone(),
            outcome_status: outcome,
            recorded_by: OUTCOME_RECORDED_BY.to_string(),
            recorded_at: now,
            updated_at: now,
        };
        self.gateway.update_outcome(&update).await.map_err(|err| {
            error!(ghl_appointment_id = %update.ghl_appointment_id, error = %err, "outcome update failed");
            ReconcileError::WriteFailure {
                operation: WriteOperation::UpdateOutcome,
                source: err,
            }
        })?;

        Ok(ReconcileOutcome {
            appointment_id: Some(existing.id),
            created_source: Some(existing.created_source),
            previous_outcome: existing.outcome_status,
            new_outcome: Some(outcome),
            ..ReconcileOutcome::new(
                ReconcileAction::UpdatedOutcome,
                format!("Outcome recorded as {outcome}"),
            )
        })
    }
}
