use axum::{body::Bytes, extract::State, Json};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use water_client::domain::{HistoricalUsage, UsageIncrement, UsageTotals};

use super::{errors::HttpError, state::ApiState};

/// How many finalized days `/api/history` returns.
pub const HISTORY_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    activations: Option<u32>,
    liters: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    status: &'static str,
    added_activations: u32,
    added_liters: f64,
}

#[derive(Debug, Serialize)]
pub struct TotalsResponse {
    total_activations: i64,
    total_liters: f64,
}

impl From<UsageTotals> for TotalsResponse {
    fn from(t: UsageTotals) -> Self {
        Self {
            total_activations: t.total_activations,
            total_liters: t.total_liters,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    usage_date: String,
    total_activations: i64,
    total_liters: f64,
}

impl From<HistoricalUsage> for HistoryEntry {
    fn from(row: HistoricalUsage) -> Self {
        let usage_date = row
            .usage_date
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_else(|_| row.usage_date.to_string());
        Self {
            usage_date,
            total_activations: row.total_activations,
            total_liters: row.total_liters,
        }
    }
}

pub async fn update(State(state): State<ApiState>, body: Bytes) -> Result<Json<UpdateResponse>, HttpError> {
    metrics::counter!("http_api_requests_total", "route" => "update").increment(1);

    let req: UpdateRequest = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("Invalid JSON body: {e}")))?;
    let (Some(activations), Some(liters)) = (req.activations, req.liters) else {
        return Err(HttpError::bad_request("Missing activations or liters in JSON"));
    };
    if !liters.is_finite() || liters < 0.0 {
        return Err(HttpError::bad_request("liters must be a non-negative number"));
    }

    let increment = UsageIncrement {
        device_id: state.device_id.clone(),
        usage_date: state.today(),
        counter_increase: activations,
        liters,
    };
    state.repo.accumulate_daily(&increment).await?;

    tracing::info!(
        device_id = %increment.device_id,
        usage_date = %increment.usage_date,
        activations,
        liters,
        "accepted manual usage update"
    );

    Ok(Json(UpdateResponse {
        status: "success",
        added_activations: activations,
        added_liters: liters,
    }))
}

pub async fn today(State(state): State<ApiState>) -> Result<Json<TotalsResponse>, HttpError> {
    metrics::counter!("http_api_requests_total", "route" => "today").increment(1);

    let totals = state
        .repo
        .today(&state.device_id, state.today())
        .await?
        .map(|row| UsageTotals::from(&row))
        .unwrap_or_default();

    Ok(Json(totals.into()))
}

pub async fn history(State(state): State<ApiState>) -> Result<Json<Vec<HistoryEntry>>, HttpError> {
    metrics::counter!("http_api_requests_total", "route" => "history").increment(1);

    let rows = state.repo.recent_history(&state.device_id, HISTORY_DAYS).await?;

    Ok(Json(rows.into_iter().map(HistoryEntry::from).collect()))
}

pub async fn summary(State(state): State<ApiState>) -> Result<Json<TotalsResponse>, HttpError> {
    metrics::counter!("http_api_requests_total", "route" => "summary").increment(1);

    let totals = state.repo.lifetime_totals(&state.device_id, state.today()).await?;

    Ok(Json(totals.into()))
}
