//! Shared websocket subscription to the chain gateway.
//!
//! One connection multiplexes `account_transaction` notifications for every
//! in-flight watcher. Consumers register buffered per-address listener
//! channels; dispatch never blocks on a slow consumer. A full buffer drops
//! the event and the watcher's polling fallback re-derives state from the
//! REST query. The reconnect driver redials with exponential backoff and
//! replays every tracked subscription.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use split_types::address::canonical;
use split_types::{AccountStream, ChainEvent, ListenerHandle, Result, SplitError};

const LISTENER_BUFFER: usize = 16;
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const MAX_FRAME_SIZE: usize = 1 << 20;
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Deserialize)]
struct RpcFrame {
	#[serde(default)]
	method: Option<String>,
	#[serde(default)]
	params: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct StreamCounters {
	pub delivered: AtomicU64,
	pub dropped: AtomicU64,
	pub no_listener: AtomicU64,
}

#[derive(Default)]
struct StreamState {
	subs: HashSet<String>,
	listeners: HashMap<String, HashMap<u64, mpsc::Sender<ChainEvent>>>,
	next_listener_id: u64,
}

pub struct ChainStream {
	url: String,
	token: String,
	state: Arc<Mutex<StreamState>>,
	writer: AsyncMutex<Option<WsSink>>,
	counters: StreamCounters,
}

fn reconnect_backoff() -> ExponentialBackoff {
	ExponentialBackoff {
		initial_interval: RECONNECT_INITIAL,
		multiplier: 2.0,
		randomization_factor: 0.0,
		max_interval: RECONNECT_CAP,
		max_elapsed_time: None,
		..Default::default()
	}
}

impl ChainStream {
	pub fn new(url: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			url: url.into(),
			token: token.into(),
			state: Arc::new(Mutex::new(StreamState::default())),
			writer: AsyncMutex::new(None),
			counters: StreamCounters::default(),
		})
	}

	pub fn counters(&self) -> &StreamCounters {
		&self.counters
	}

	pub fn listener_count(&self, address: &str) -> usize {
		let key = canonical(address);
		self.state().listeners.get(&key).map_or(0, HashMap::len)
	}

	/// Spawn the reconnect driver. It owns the connection for the rest of
	/// the process lifetime; flipping the shutdown signal closes the socket
	/// and every listener channel.
	pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		let stream = self.clone();
		tokio::spawn(async move { stream.run(shutdown).await })
	}

	async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut backoff = reconnect_backoff();
		loop {
			if *shutdown.borrow() {
				break;
			}

			match self.dial().await {
				Ok((sink, source)) => {
					*self.writer.lock().await = Some(sink);
					backoff.reset();
					info!(url = %self.url, "chain stream connected");

					self.replay_subscriptions().await;

					let pinger = {
						let stream = self.clone();
						tokio::spawn(async move { stream.ping_loop().await })
					};
					self.read_frames(source, &mut shutdown).await;
					pinger.abort();
					*self.writer.lock().await = None;
				}
				Err(e) => {
					warn!(url = %self.url, error = %e, "chain stream dial failed");
				}
			}

			if *shutdown.borrow() {
				break;
			}
			let delay = backoff.next_backoff().unwrap_or(RECONNECT_CAP);
			debug!(?delay, "chain stream reconnecting");
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = shutdown.changed() => {}
			}
		}

		self.close_listeners();
		info!("chain stream stopped");
	}

	async fn dial(&self) -> Result<(WsSink, WsSource)> {
		let mut request = self
			.url
			.as_str()
			.into_client_request()
			.map_err(|e| SplitError::ChainStream(e.to_string()))?;
		if !self.token.is_empty() {
			let bearer = format!("Bearer {}", self.token)
				.parse()
				.map_err(|_| SplitError::ChainStream("invalid gateway token".to_string()))?;
			request.headers_mut().insert("Authorization", bearer);
		}

		let mut config = WebSocketConfig::default();
		config.max_message_size = Some(MAX_FRAME_SIZE);
		config.max_frame_size = Some(MAX_FRAME_SIZE);

		let (ws, _) = connect_async_with_config(request, Some(config), false)
			.await
			.map_err(|e| SplitError::ChainStream(e.to_string()))?;
		Ok(ws.split())
	}

	/// Resend `subscribe_account` for every address tracked so far. A
	/// transient failure here is logged only; the next reconnect retries.
	async fn replay_subscriptions(&self) {
		let subs: Vec<String> = self.state().subs.iter().cloned().collect();
		if subs.is_empty() {
			return;
		}
		match self.send_subscribe(&subs).await {
			Ok(()) => info!(count = subs.len(), "chain stream subscriptions replayed"),
			Err(e) => warn!(error = %e, "subscription replay failed"),
		}
	}

	async fn ping_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(PING_INTERVAL);
		ticker.tick().await;
		loop {
			ticker.tick().await;
			let mut writer = self.writer.lock().await;
			let Some(sink) = writer.as_mut() else { return };
			match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await
			{
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					warn!(error = %e, "chain stream ping failed");
					return;
				}
				Err(_) => {
					warn!("chain stream ping write deadline exceeded");
					return;
				}
			}
		}
	}

	/// Read until transport error, read deadline, or shutdown. Every frame
	/// (pongs included) refreshes the deadline.
	async fn read_frames(&self, mut source: WsSource, shutdown: &mut watch::Receiver<bool>) {
		loop {
			let frame = tokio::select! {
				_ = shutdown.changed() => return,
				frame = tokio::time::timeout(READ_DEADLINE, source.next()) => frame,
			};

			match frame {
				Err(_) => {
					warn!("chain stream read deadline exceeded");
					return;
				}
				Ok(None) => {
					warn!("chain stream closed by gateway");
					return;
				}
				Ok(Some(Err(e))) => {
					warn!(error = %e, "chain stream read error");
					return;
				}
				Ok(Some(Ok(Message::Text(text)))) => self.handle_frame(&text),
				Ok(Some(Ok(Message::Binary(bytes)))) => {
					if let Ok(text) = std::str::from_utf8(&bytes) {
						self.handle_frame(text);
					}
				}
				Ok(Some(Ok(Message::Close(_)))) => {
					warn!("chain stream received close frame");
					return;
				}
				Ok(Some(Ok(_))) => {}
			}
		}
	}

	/// Decode one inbound frame. Anything that is not an
	/// `account_transaction` notification is discarded without error.
	fn handle_frame(&self, text: &str) {
		let frame: RpcFrame = match serde_json::from_str(text) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(error = %e, "chain stream frame decode failed");
				return;
			}
		};

		if frame.method.as_deref() != Some("account_transaction") {
			return;
		}

		let Some(params) = frame.params else { return };
		let event: ChainEvent = match serde_json::from_value(params) {
			Ok(event) => event,
			Err(e) => {
				warn!(error = %e, "account_transaction params decode failed");
				return;
			}
		};
		self.dispatch(event);
	}

	/// Fan an event out to every listener of its account. The listener set
	/// is snapshotted under the lock; sends happen outside it and never
	/// block; a full buffer drops the event for that listener.
	fn dispatch(&self, event: ChainEvent) {
		let key = canonical(&event.account);
		let targets: Vec<mpsc::Sender<ChainEvent>> = self
			.state()
			.listeners
			.get(&key)
			.map(|set| set.values().cloned().collect())
			.unwrap_or_default();

		if targets.is_empty() {
			self.counters.no_listener.fetch_add(1, Ordering::Relaxed);
			return;
		}

		for target in targets {
			match target.try_send(event.clone()) {
				Ok(()) => {
					self.counters.delivered.fetch_add(1, Ordering::Relaxed);
				}
				Err(_) => {
					self.counters.dropped.fetch_add(1, Ordering::Relaxed);
					warn!(account = %event.account, lt = event.lt, "listener buffer full, event dropped");
				}
			}
		}
	}

	async fn send_subscribe(&self, addresses: &[String]) -> Result<()> {
		// The gateway does not correlate responses; the id only needs to be
		// unique per frame.
		let id = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
		let frame = serde_json::json!({
			"id": id,
			"jsonrpc": "2.0",
			"method": "subscribe_account",
			"params": addresses,
		});
		let text = frame.to_string();

		let mut writer = self.writer.lock().await;
		let Some(sink) = writer.as_mut() else {
			return Err(SplitError::ChainStream("not connected".to_string()));
		};
		match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text))).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(SplitError::ChainStream(e.to_string())),
			Err(_) => Err(SplitError::ChainStream(
				"subscribe write deadline exceeded".to_string(),
			)),
		}
	}

	/// Record which of `addresses` are not yet tracked, marking them
	/// tracked. Only those produce an outbound frame.
	fn mark_new_subscriptions(&self, addresses: &[String]) -> Vec<String> {
		let mut state = self.state();
		addresses
			.iter()
			.filter(|a| state.subs.insert((*a).clone()))
			.cloned()
			.collect()
	}

	fn close_listeners(&self) {
		let mut state = self.state();
		state.listeners.clear();
	}

	fn state(&self) -> MutexGuard<'_, StreamState> {
		self.state.lock().expect("stream state lock poisoned")
	}
}

#[async_trait::async_trait]
impl AccountStream for ChainStream {
	fn register_listener(&self, address: &str) -> (mpsc::Receiver<ChainEvent>, ListenerHandle) {
		let key = canonical(address);
		let (tx, rx) = mpsc::channel(LISTENER_BUFFER);

		let id = {
			let mut state = self.state();
			state.next_listener_id += 1;
			let id = state.next_listener_id;
			state.listeners.entry(key.clone()).or_default().insert(id, tx);
			id
		};

		let state = self.state.clone();
		let handle = ListenerHandle::new(move || {
			let mut state = state.lock().expect("stream state lock poisoned");
			let emptied = match state.listeners.get_mut(&key) {
				Some(set) => {
					set.remove(&id);
					set.is_empty()
				}
				None => false,
			};
			if emptied {
				state.listeners.remove(&key);
			}
		});

		(rx, handle)
	}

	/// Track the addresses and send one `subscribe_account` frame for the
	/// not-yet-subscribed subset. Tracked addresses stay tracked even when
	/// the frame cannot be written; the reconnect replay picks them up.
	async fn subscribe(&self, addresses: &[String]) -> Result<()> {
		let new = self.mark_new_subscriptions(addresses);
		if new.is_empty() {
			return Ok(());
		}
		self.send_subscribe(&new).await
	}
}
