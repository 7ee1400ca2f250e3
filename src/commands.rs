// src/commands.rs
//
// Request/response control surface: connect, disconnect, port discovery and
// event history queries. Used by the CLI, callable by any other front end.

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::event_store::{Event, EventKind};
use crate::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectRequest {
    /// Falls back to the configured default port
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default, alias = "baudrate")]
    pub baud_rate: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectResponse {
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Stats {
    /// Motion episodes ever recorded
    pub total_events: u64,
    /// Motion episodes started today (local calendar day)
    pub today_events: u64,
    pub last_event: Option<Event>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClearResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Connection Commands
// ============================================================================

pub async fn connect(state: &AppState, request: ConnectRequest) -> ConnectResponse {
    let port = request
        .port
        .unwrap_or_else(|| state.settings.default_port.clone());
    let baud_rate = request
        .baud_rate
        .unwrap_or(state.settings.default_baud_rate);

    let success = state.manager.connect(&port, baud_rate).await;
    ConnectResponse { success }
}

pub async fn disconnect(state: &AppState) -> ConnectResponse {
    state.manager.disconnect().await;
    ConnectResponse { success: true }
}

/// Names of the serial ports currently present
pub fn list_ports(state: &AppState) -> Result<Vec<String>, String> {
    let ports = state.manager.list_ports()?;
    let names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    tlog!("[commands] Available ports: {:?}", names);
    Ok(names)
}

// ============================================================================
// Event History Commands
// ============================================================================

pub fn recent_events(state: &AppState, limit: Option<usize>) -> Result<Vec<Event>, String> {
    let limit = limit.unwrap_or(state.settings.recent_events_limit);
    state.manager.sink().query_recent(limit)
}

pub fn stats(state: &AppState) -> Result<Stats, String> {
    let sink = state.manager.sink();
    let today = Local::now().date_naive();

    Ok(Stats {
        total_events: sink.count_by_kind(EventKind::MotionStart, None)?,
        today_events: sink.count_by_kind(EventKind::MotionStart, Some(today))?,
        last_event: sink.latest()?,
    })
}

/// Delete the whole event history. Failures are reported in the response.
pub fn clear_events(state: &AppState) -> ClearResponse {
    match state.manager.sink().clear_all() {
        Ok(removed) => {
            tlog!("[commands] Cleared {} events", removed);
            ClearResponse {
                success: true,
                error: None,
            }
        }
        Err(e) => {
            tlog!("[commands] Failed to clear events: {}", e);
            ClearResponse {
                success: false,
                error: Some(e),
            }
        }
    }
}
