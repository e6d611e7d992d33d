//! Persistence gateway for appointment rows: trait seam + memory, Postgres and PostgREST backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use appt_core::{
    AppointmentRecord, CreatedSource, ExistingAppointment, OutcomeUpdate, PassiveUpsert,
    UpsertAction, UpsertResult, OUTCOME_RECORDED_BY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "appt-storage";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("could not decode storage response: {0}")]
    Decode(String),
    #[error("appointment {0} not found")]
    NotFound(String),
}

/// Storage operations the reconciliation engine depends on.
///
/// `upsert_passive` must be an atomic insert-if-absent: when a row already
/// exists for the vendor id it reports [`UpsertAction::SkippedExisting`] and
/// leaves the row untouched.
#[async_trait]
pub trait AppointmentGateway: Send + Sync {
    async fn lookup(
        &self,
        ghl_appointment_id: &str,
    ) -> Result<Option<ExistingAppointment>, GatewayError>;

    async fn upsert_passive(&self, req: &PassiveUpsert) -> Result<UpsertResult, GatewayError>;

    async fn update_outcome(&self, update: &OutcomeUpdate) -> Result<(), GatewayError>;
}

#[derive(Debug, Default)]
pub struct InMemoryGateway {
    rows: Mutex<HashMap<String, AppointmentRecord>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, ghl_appointment_id: &str) -> Option<AppointmentRecord> {
        self.rows.lock().await.get(ghl_appointment_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    /// Overwriting upsert with the automation sync's semantics.
    ///
    /// Keeps `id`, `created_at` and any recorded outcome of an existing row;
    /// everything else, including `created_source`, is replaced.
    pub async fn upsert_authoritative(&self, mut record: AppointmentRecord) -> AppointmentRecord {
        record.created_source = CreatedSource::AutomationSync;
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(&record.ghl_appointment_id) {
            record.id = existing.id;
            record.created_at = existing.created_at;
            if existing.outcome_status.is_some() {
                record.outcome_status = existing.outcome_status.clone();
                record.outcome_recorded_at = existing.outcome_recorded_at;
                record.outcome_recorded_by = existing.outcome_recorded_by.clone();
            }
        }
        rows.insert(record.ghl_appointment_id.clone(), record.clone());
        record
    }
}

#[async_trait]
impl AppointmentGateway for InMemoryGateway {
    async fn lookup(
        &self,
        ghl_appointment_id: &str,
    ) -> Result<Option<ExistingAppointment>, GatewayError> {
        Ok(self
            .rows
            .lock()
            .await
            .get(ghl_appointment_id)
            .map(AppointmentRecord::as_existing))
    }

    async fn upsert_passive(&self, req: &PassiveUpsert) -> Result<UpsertResult, GatewayError> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(&req.ghl_appointment_id) {
            return Ok(UpsertResult {
                appointment_id: existing.id,
                action_taken: UpsertAction::SkippedExisting,
                created_source: existing.created_source.clone(),
            });
        }
        let record = AppointmentRecord::from_passive_upsert(req, Utc::now());
        let result = UpsertResult {
            appointment_id: record.id,
            action_taken: UpsertAction::Inserted,
            created_source: record.created_source.clone(),
        };
        rows.insert(req.ghl_appointment_id.clone(), record);
        Ok(result)
    }

    async fn update_outcome(&self, update: &OutcomeUpdate) -> Result<(), GatewayError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&update.ghl_appointment_id)
            .ok_or_else(|| GatewayError::NotFound(update.ghl_appointment_id.clone()))?;
        row.outcome_status = Some(update.outcome_status.as_str().to_string());
        row.outcome_recorded_at = Some(update.recorded_at);
        row.outcome_recorded_by = Some(update.recorded_by.clone());
        row.updated_at = update.updated_at;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running appointment migrations")?;
        Ok(())
    }
}

#[async_trait]
impl AppointmentGateway for PgGateway {
    async fn lookup(
        &self,
        ghl_appointment_id: &str,
    ) -> Result<Option<ExistingAppointment>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT id, created_source, outcome_status
              FROM appointments
             WHERE ghl_appointment_id = $1
            "#,
        )
        .bind(ghl_appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ExistingAppointment, GatewayError> {
            Ok(ExistingAppointment {
                id: row.try_get("id")?,
                created_source: CreatedSource::from(row.try_get::<String, _>("created_source")?),
                outcome_status: row.try_get("outcome_status")?,
            })
        })
        .transpose()
    }

    async fn upsert_passive(&self, req: &PassiveUpsert) -> Result<UpsertResult, GatewayError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO appointments (
                ghl_appointment_id, location_id, contact_id, calendar_id,
                assigned_rep_id, assigned_rep_name, title, appointment_type,
                appointment_time, status, outcome_status, created_source,
                created_by_user_id, created_by_user_name, booking_source, raw_data,
                outcome_recorded_at, outcome_recorded_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    CASE WHEN $11::text IS NULL THEN NULL ELSE NOW() END,
                    CASE WHEN $11::text IS NULL THEN NULL ELSE $17 END)
            ON CONFLICT (ghl_appointment_id) DO NOTHING
            RETURNING id, created_source
            "#,
        )
        .bind(&req.ghl_appointment_id)
        .bind(&req.location_id)
        .bind(&req.contact_id)
        .bind(&req.calendar_id)
        .bind(&req.assigned_rep_id)
        .bind(&req.assigned_rep_name)
        .bind(&req.title)
        .bind(&req.appointment_type)
        .bind(req.appointment_time)
        .bind(&req.booking_status)
        .bind(req.outcome_status_seed.map(|o| o.as_str()))
        .bind(String::from(CreatedSource::RepManual))
        .bind(&req.created_by_id)
        .bind(&req.created_by_name)
        .bind(&req.booking_source)
        .bind(&req.raw_payload)
        .bind(OUTCOME_RECORDED_BY)
        .fetch_optional(&self.pool)
        .await?;

        let (row, action_taken) = match inserted {
            Some(row) => (row, UpsertAction::Inserted),
            None => {
                let row = sqlx::query(
                    r#"
                    SELECT id, created_source
                      FROM appointments
                     WHERE ghl_appointment_id = $1
                    "#,
                )
                .bind(&req.ghl_appointment_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| GatewayError::NotFound(req.ghl_appointment_id.clone()))?;
                (row, UpsertAction::SkippedExisting)
            }
        };

        debug!(
            ghl_appointment_id = %req.ghl_appointment_id,
            action = action_taken.as_str(),
            "passive upsert finished"
        );
        Ok(UpsertResult {
            appointment_id: row.try_get("id")?,
            action_taken,
            created_source: CreatedSource::from(row.try_get::<String, _>("created_source")?),
        })
    }

    async fn update_outcome(&self, update: &OutcomeUpdate) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE appointments
               SET outcome_status = $2,
                   outcome_recorded_at = $3,
                   outcome_recorded_by = $4,
                   updated_at = $5
             WHERE ghl_appointment_id = $1
            "#,
        )
        .bind(&update.ghl_appointment_id)
        .bind(update.outcome_status.as_str())
        .bind(update.recorded_at)
        .bind(&update.recorded_by)
        .bind(update.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(update.ghl_appointment_id.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
}

/// Gateway over a Supabase/PostgREST endpoint using the `upsert_appointment_from_webhook` RPC.
///
/// The RPC takes the raw lifecycle status and derives any outcome seed itself,
/// so only the function's own argument names go over the wire.
#[derive(Debug, Clone)]
pub struct PostgrestGateway {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

#[derive(Debug, Serialize)]
struct RpcUpsertParams<'a> {
    p_ghl_appointment_id: &'a str,
    p_location_id: &'a str,
    p_contact_id: &'a str,
    p_calendar_id: Option<&'a str>,
    p_assigned_rep_id: Option<&'a str>,
    p_assigned_rep_name: Option<&'a str>,
    p_title: Option<&'a str>,
    p_appointment_type: Option<&'a str>,
    p_appointment_time: Option<DateTime<Utc>>,
    p_status: Option<&'a str>,
    p_appointment_status: &'a str,
    p_created_by_user_id: Option<&'a str>,
    p_created_by_user_name: Option<&'a str>,
    p_booking_source: &'a str,
    p_raw_data: &'a JsonValue,
}

impl<'a> From<&'a PassiveUpsert> for RpcUpsertParams<'a> {
    fn from(req: &'a PassiveUpsert) -> Self {
        Self {
            p_ghl_appointment_id: &req.ghl_appointment_id,
            p_location_id: &req.location_id,
            p_contact_id: &req.contact_id,
            p_calendar_id: req.calendar_id.as_deref(),
            p_assigned_rep_id: req.assigned_rep_id.as_deref(),
            p_assigned_rep_name: req.assigned_rep_name.as_deref(),
            p_title: req.title.as_deref(),
            p_appointment_type: req.appointment_type.as_deref(),
            p_appointment_time: req.appointment_time,
            p_status: req.lifecycle_status.as_deref(),
            p_appointment_status: &req.booking_status,
            p_created_by_user_id: req.created_by_id.as_deref(),
            p_created_by_user_name: req.created_by_name.as_deref(),
            p_booking_source: &req.booking_source,
            p_raw_data: &req.raw_payload,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LookupRow {
    id: Uuid,
    created_source: CreatedSource,
    outcome_status: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutcomePatch<'a> {
    outcome_status: &'static str,
    outcome_recorded_at: DateTime<Utc>,
    outcome_recorded_by: &'a str,
    updated_at: DateTime<Utc>,
}

impl PostgrestGateway {
    pub fn new(config: PostgrestConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key,
        })
    }

    pub fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder) -> Result<JsonValue, GatewayError> {
        let resp = self.authed(builder).send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        Ok(resp.json::<JsonValue>().await?)
    }
}

#[async_trait]
impl AppointmentGateway for PostgrestGateway {
    async fn lookup(
        &self,
        ghl_appointment_id: &str,
    ) -> Result<Option<ExistingAppointment>, GatewayError> {
        let filter = format!("eq.{ghl_appointment_id}");
        let value = self
            .send_json(self.client.get(self.rest_url("appointments")).query(&[
                ("select", "id,created_source,outcome_status"),
                ("ghl_appointment_id", filter.as_str()),
                ("limit", "1"),
            ]))
            .await?;
        let rows: Vec<LookupRow> =
            serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(rows.into_iter().next().map(|row| ExistingAppointment {
            id: row.id,
            created_source: row.created_source,
            outcome_status: row.outcome_status,
        }))
    }

    async fn upsert_passive(&self, req: &PassiveUpsert) -> Result<UpsertResult, GatewayError> {
        let value = self
            .send_json(
                self.client
                    .post(self.rest_url("rpc/upsert_appointment_from_webhook"))
                    .json(&RpcUpsertParams::from(req)),
            )
            .await?;
        decode_rpc_result(value)
    }

    async fn update_outcome(&self, update: &OutcomeUpdate) -> Result<(), GatewayError> {
        let filter = format!("eq.{}", update.ghl_appointment_id);
        let value = self
            .send_json(
                self.client
                    .patch(self.rest_url("appointments"))
                    .query(&[("ghl_appointment_id", filter.as_str())])
                    .header("Prefer", "return=representation")
                    .json(&OutcomePatch {
                        outcome_status: update.outcome_status.as_str(),
                        outcome_recorded_at: update.recorded_at,
                        outcome_recorded_by: &update.recorded_by,
                        updated_at: update.updated_at,
                    }),
            )
            .await?;
        match value.as_array() {
            Some(rows) if rows.is_empty() => {
                Err(GatewayError::NotFound(update.ghl_appointment_id.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// RPC results come back either as a row object or a single-row array.
pub fn decode_rpc_result(value: JsonValue) -> Result<UpsertResult, GatewayError> {
    let row = match value {
        JsonValue::Array(rows) => rows
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("empty rpc result set".to_string()))?,
        other => other,
    };
    serde_json::from_value(row).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Memory,
    Postgres,
    Postgrest,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub database_url: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_service_key: Option<String>,
    pub http_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from any key lookup. `APPT_GATEWAY` wins; otherwise
    /// the backend is inferred from which connection settings are present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let database_url = non_empty("DATABASE_URL");
        let supabase_url = non_empty("SUPABASE_URL");
        let supabase_service_key = non_empty("SUPABASE_SERVICE_ROLE_KEY");

        let kind = match non_empty("APPT_GATEWAY").as_deref() {
            Some("memory") => GatewayKind::Memory,
            Some("postgres") => GatewayKind::Postgres,
            Some("postgrest") | Some("supabase") => GatewayKind::Postgrest,
            Some(other) => anyhow::bail!("unknown APPT_GATEWAY value {other:?}"),
            None if database_url.is_some() => GatewayKind::Postgres,
            None if supabase_url.is_some() => GatewayKind::Postgrest,
            None => GatewayKind::Memory,
        };

        Ok(Self {
            kind,
            database_url,
            supabase_url,
            supabase_service_key,
            http_timeout_secs: non_empty("APPT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }
}

pub async fn connect_gateway(config: &GatewayConfig) -> anyhow::Result<Arc<dyn AppointmentGateway>> {
    match config.kind {
        GatewayKind::Memory => {
            warn!("using in-memory appointment gateway; rows are lost on restart");
            Ok(Arc::new(InMemoryGateway::new()))
        }
        GatewayKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres gateway")?;
            let gateway = PgGateway::connect(url).await?;
            info!("connected postgres appointment gateway");
            Ok(Arc::new(gateway))
        }
        GatewayKind::Postgrest => {
            let base_url = config
                .supabase_url
                .clone()
                .context("SUPABASE_URL is required for the postgrest gateway")?;
            let service_key = config
                .supabase_service_key
                .clone()
                .context("SUPABASE_SERVICE_ROLE_KEY is required for the postgrest gateway")?;
            let gateway = PostgrestGateway::new(PostgrestConfig {
                base_url,
                service_key,
                timeout: Duration::from_secs(config.http_timeout_secs),
            })?;
            info!(base_url = %gateway.base_url, "using postgrest appointment gateway");
            Ok(Arc::new(gateway))
        }
    }
}
