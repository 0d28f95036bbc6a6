//! HTTP and websocket surface.
//!
//! Thin request front over [`SplitService`]: JSON command endpoints plus the
//! per-bill snapshot websocket. The caller's wallet arrives in the
//! `X-Wallet-Address` header.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use split_types::{Bill, BillStatus, HistoryItem, Intent, OpType, SplitError};

use crate::service::SplitService;

const WALLET_HEADER: &str = "X-Wallet-Address";
const WS_READ_DEADLINE: Duration = Duration::from_secs(60);
const WS_WRITE_DEADLINE: Duration = Duration::from_secs(2);
const WS_READ_LIMIT: usize = 512;

pub fn router(service: Arc<SplitService>) -> Router {
	Router::new()
		.route("/api/healthz", get(healthz))
		.route("/api/history", get(history))
		.route("/api/bills", post(create_bill))
		.route("/api/bills/:id", get(get_bill))
		.route("/api/bills/:id/refund", post(refund_bill))
		.route("/api/bills/:id/transactions", post(create_intent))
		.route("/api/bills/:id/ws", get(bill_ws))
		.with_state(service)
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
}

// ---- DTOs -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateBillRequest {
	goal: i64,
	destination_address: String,
}

#[derive(Debug, Serialize)]
struct BillResponse {
	id: Uuid,
	goal: i64,
	collected: i64,
	creator_address: String,
	destination_address: String,
	status: BillStatus,
	created_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	ended_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	transactions: Vec<Intent>,
	proxy_wallet_address: String,
	state_init_hash: String,
}

impl From<Bill> for BillResponse {
	fn from(bill: Bill) -> Self {
		Self {
			id: bill.id,
			goal: bill.goal,
			collected: bill.collected,
			creator_address: bill.creator_address,
			destination_address: bill.destination_address,
			status: bill.status,
			created_at: bill.created_at,
			ended_at: bill.ended_at,
			transactions: bill.transactions,
			proxy_wallet_address: bill.proxy_wallet,
			state_init_hash: bill.state_init_hash,
		}
	}
}

#[derive(Debug, Deserialize)]
struct CreateIntentRequest {
	amount: String,
	op_type: String,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
	page: Option<u32>,
	pagesize: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryPage {
	page: u32,
	page_size: u32,
	total: i64,
	data: Vec<HistoryItem>,
}

// ---- Error mapping --------------------------------------------------------

#[derive(Debug)]
struct ApiError(SplitError);

impl From<SplitError> for ApiError {
	fn from(e: SplitError) -> Self {
		Self(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			SplitError::Validation(_) => StatusCode::BAD_REQUEST,
			SplitError::NotFound(_) => StatusCode::NOT_FOUND,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let body = Json(serde_json::json!({ "error": self.0.to_string() }));
		(status, body).into_response()
	}
}

fn wallet_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
	let wallet = headers
		.get(WALLET_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.unwrap_or_default();
	if wallet.is_empty() {
		return Err(ApiError(SplitError::validation(
			"X-Wallet-Address header is required",
		)));
	}
	Ok(wallet.to_string())
}

fn parse_amount(raw: &str) -> Result<i64, ApiError> {
	raw.trim().parse::<i64>().map_err(|_| {
		ApiError(SplitError::validation(
			"amount must be a positive int64 in base units",
		))
	})
}

// ---- Handlers -------------------------------------------------------------

async fn healthz() -> Json<&'static str> {
	Json("ok")
}

async fn create_bill(
	State(service): State<Arc<SplitService>>,
	headers: HeaderMap,
	Json(req): Json<CreateBillRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let creator = wallet_from_headers(&headers)?;
	let bill = service
		.create_bill(req.goal, &req.destination_address, &creator)
		.await?;
	Ok((StatusCode::CREATED, Json(BillResponse::from(bill))))
}

async fn get_bill(
	State(service): State<Arc<SplitService>>,
	Path(id): Path<Uuid>,
) -> Result<Json<BillResponse>, ApiError> {
	let bill = service.get_bill(id).await?;
	Ok(Json(BillResponse::from(bill)))
}

async fn refund_bill(
	State(service): State<Arc<SplitService>>,
	Path(id): Path<Uuid>,
	headers: HeaderMap,
) -> Result<Json<&'static str>, ApiError> {
	let creator = wallet_from_headers(&headers)?;
	service.refund_bill(id, &creator).await?;
	Ok(Json("ok"))
}

async fn create_intent(
	State(service): State<Arc<SplitService>>,
	Path(id): Path<Uuid>,
	headers: HeaderMap,
	Json(req): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let sender = wallet_from_headers(&headers)?;
	let amount = parse_amount(&req.amount)?;
	let op = OpType::parse(&req.op_type).map_err(ApiError)?;
	let intent = service.create_intent(id, amount, &sender, op).await?;
	Ok((StatusCode::CREATED, Json(intent)))
}

async fn history(
	State(service): State<Arc<SplitService>>,
	headers: HeaderMap,
	Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, ApiError> {
	let sender = wallet_from_headers(&headers)?;
	let page = params.page.filter(|p| *p > 0).unwrap_or(1);
	let page_size = params.pagesize.filter(|p| *p > 0).unwrap_or(20).min(100);

	let (data, total) = service.history(&sender, page, page_size).await?;
	Ok(Json(HistoryPage {
		page,
		page_size,
		total,
		data,
	}))
}

// ---- Snapshot websocket ---------------------------------------------------

async fn bill_ws(
	State(service): State<Arc<SplitService>>,
	Path(id): Path<Uuid>,
	ws: WebSocketUpgrade,
) -> impl IntoResponse {
	info!(bill_id = %id, "snapshot subscribe request");
	ws.max_message_size(WS_READ_LIMIT)
		.on_upgrade(move |socket| snapshot_socket(socket, service, id))
}

/// Bridge one upgraded connection to the snapshot bus: an immediate
/// snapshot on subscribe, then one message per transition. The sink never
/// sends payloads; inbound traffic only refreshes the read deadline.
async fn snapshot_socket(socket: WebSocket, service: Arc<SplitService>, bill_id: Uuid) {
	let (sink_id, mut snapshots) = service.bus().subscribe(bill_id).await;
	let (mut sender, mut receiver) = socket.split();

	match service.get_bill(bill_id).await {
		Ok(bill) => {
			if let Ok(payload) = serde_json::to_string(&bill) {
				if write_snapshot(&mut sender, payload).await.is_err() {
					service.bus().unsubscribe(bill_id, sink_id).await;
					return;
				}
				debug!(%bill_id, "initial snapshot sent");
			}
		}
		Err(e) => debug!(%bill_id, error = %e, "initial snapshot unavailable"),
	}

	loop {
		tokio::select! {
			maybe = snapshots.recv() => match maybe {
				Some(payload) => {
					if write_snapshot(&mut sender, payload).await.is_err() {
						break;
					}
				}
				None => break,
			},
			inbound = tokio::time::timeout(WS_READ_DEADLINE, receiver.next()) => match inbound {
				// Deadline passed without a frame or pong.
				Err(_) => break,
				Ok(None) | Ok(Some(Err(_))) => break,
				Ok(Some(Ok(Message::Close(_)))) => break,
				Ok(Some(Ok(_))) => {}
			},
		}
	}

	service.bus().unsubscribe(bill_id, sink_id).await;
	info!(%bill_id, "snapshot subscriber disconnected");
}

async fn write_snapshot(
	sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
	payload: String,
) -> Result<(), ()> {
	let write = async {
		sender.send(Message::Ping(Vec::new())).await?;
		sender.send(Message::Text(payload)).await
	};
	match tokio::time::timeout(WS_WRITE_DEADLINE, write).await {
		Ok(Ok(())) => Ok(()),
		_ => Err(()),
	}
}
