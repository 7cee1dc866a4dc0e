//! WebSocket stream of progress snapshots.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use decklift_core::{JobId, ProgressSnapshot};

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_LAG_EVENTS, WS_MESSAGES_SENT};
use crate::state::AppState;

/// Query parameters for the progress stream
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Only forward snapshots for this job.
    pub job_id: Option<JobId>,
}

impl WsParams {
    fn wants(&self, snapshot: &ProgressSnapshot) -> bool {
        self.job_id.is_none_or(|id| id == snapshot.job_id)
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published in between is lost
    let rx = state.orchestrator().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, params))
}

/// Handle a single WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    mut rx: broadcast::Receiver<ProgressSnapshot>,
    params: WsParams,
) {
    let (mut sender, mut receiver) = socket.split();

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();

    info!(job_id = ?params.job_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if !params.wants(&snapshot) {
                        continue;
                    }
                    WS_MESSAGES_SENT
                        .with_label_values(&[snapshot.stage.as_str()])
                        .inc();

                    match serde_json::to_string(&snapshot) {
                        Ok(json) => {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                debug!("WebSocket send failed, client disconnected");
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to serialize progress snapshot: {}", e);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WebSocket client lagged, skipped {} snapshots", n);
                    WS_LAG_EVENTS.inc();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Progress bus closed");
                    break;
                }
            }
        }
    });

    // Client messages are only read to notice the close
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("Ignoring client text message: {}", text);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!("WebSocket client disconnected");
}
