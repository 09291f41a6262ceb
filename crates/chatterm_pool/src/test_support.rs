#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatterm_domain::{Account, AccountId, SecretString};
use chatterm_protocol::eventsub::{CreateSubscriptionRequest, CreateSubscriptionResponse, Subscription};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::chat::ConnDeps;
use crate::settings::PoolSettings;
use crate::ws::{BoxFuture, Ws, WsConnector, default_connector};
use crate::{EventSink, PoolEvent, StaticAccounts, SubscriptionService};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) type ServerWs = WebSocketStream<TcpStream>;

/// Local websocket endpoint standing in for the chat or event service.
pub(crate) struct TestServer {
	listener: TcpListener,
	addr: SocketAddr,
}

impl TestServer {
	pub(crate) async fn bind() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
		let addr = listener.local_addr().expect("local addr");
		Self { listener, addr }
	}

	pub(crate) fn url(&self) -> String {
		format!("ws://{}", self.addr)
	}

	pub(crate) async fn accept(&self) -> ServerWs {
		let (stream, _) = timeout(WAIT, self.listener.accept())
			.await
			.expect("client dialed within timeout")
			.expect("accept");
		tokio_tungstenite::accept_async(stream).await.expect("websocket handshake")
	}

	/// True if nobody dials within `within`.
	pub(crate) async fn no_dial(&self, within: Duration) -> bool {
		timeout(within, self.listener.accept()).await.is_err()
	}
}

/// Next text frame from the client, skipping control frames.
pub(crate) async fn recv_text(ws: &mut ServerWs) -> String {
	loop {
		let msg = timeout(WAIT, ws.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("read frame");
		match msg {
			Message::Text(t) => return t.as_str().to_string(),
			Message::Close(frame) => panic!("client closed: {frame:?}"),
			_ => continue,
		}
	}
}

/// Collect `n` chat lines, splitting frames that carry several.
pub(crate) async fn recv_lines(ws: &mut ServerWs, n: usize) -> Vec<String> {
	let mut lines = Vec::new();
	while lines.len() < n {
		let frame = recv_text(ws).await;
		lines.extend(frame.split("\r\n").filter(|l| !l.is_empty()).map(str::to_string));
	}
	lines
}

pub(crate) async fn send_text(ws: &mut ServerWs, text: impl Into<String>) {
	ws.send(Message::text(text.into())).await.expect("server send");
}

/// True if the client sends no text frame within `within`.
pub(crate) async fn quiet(ws: &mut ServerWs, within: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + within;
	loop {
		match tokio::time::timeout_at(deadline, ws.next()).await {
			Err(_) => return true,
			Ok(Some(Ok(Message::Text(_)))) => return false,
			Ok(Some(Ok(_))) => continue,
			Ok(_) => return true,
		}
	}
}

pub(crate) fn account_id(raw: &str) -> AccountId {
	AccountId::new(raw).expect("valid account id")
}

pub(crate) fn accounts(ids: &[&str]) -> Arc<StaticAccounts> {
	Arc::new(StaticAccounts::from_accounts(ids.iter().map(|id| {
		Account::new(account_id(id), format!("user{id}"), SecretString::new(format!("tok{id}"))).with_client_id("cid")
	})))
}

/// Short timers; chat keepalive is effectively off unless a test turns it on.
pub(crate) fn settings(chat_url: &str, eventsub_url: &str) -> PoolSettings {
	PoolSettings {
		chat_url: chat_url.to_string(),
		eventsub_url: eventsub_url.to_string(),
		dial_timeout: Duration::from_secs(2),
		keepalive_interval: Duration::from_secs(60),
		keepalive_timeout: Duration::from_secs(5),
		reconnect_backoff: Duration::from_millis(50),
		welcome_timeout: Duration::from_secs(2),
		subscribe_timeout: Duration::from_secs(2),
		dedup_window: Duration::from_secs(60),
		dedup_sweep_interval: Duration::from_secs(60),
		queue_capacity: 16,
		sink_capacity: 64,
		max_chat_frame: 1024 * 1024,
		max_event_frame: 1024 * 1024,
	}
}

/// Dialer that counts every attempt.
pub(crate) fn counting_connector() -> (WsConnector, Arc<AtomicUsize>) {
	let dials = Arc::new(AtomicUsize::new(0));
	let inner = default_connector(1024 * 1024);
	let counter = dials.clone();
	let connector: WsConnector = Arc::new(move |url: url::Url| {
		counter.fetch_add(1, Ordering::SeqCst);
		inner(url) as BoxFuture<'static, anyhow::Result<Ws>>
	});
	(connector, dials)
}

/// Connection collaborators wired to a receiver the test can drain.
pub(crate) fn deps(settings: PoolSettings, accounts: Arc<StaticAccounts>) -> (ConnDeps, mpsc::Receiver<PoolEvent>) {
	let (tx, rx) = mpsc::channel(64);
	let (connector, _) = counting_connector();
	let deps = ConnDeps {
		accounts,
		sink: EventSink::new(tx),
		settings: Arc::new(settings),
		connector,
	};
	(deps, rx)
}

pub(crate) async fn next_event(rx: &mut mpsc::Receiver<PoolEvent>) -> PoolEvent {
	timeout(WAIT, rx.recv())
		.await
		.expect("event within timeout")
		.expect("sink open")
}

/// Records every registration; kinds listed in `fail_kinds` are rejected.
#[derive(Default)]
pub(crate) struct RecordingService {
	calls: Mutex<Vec<CreateSubscriptionRequest>>,
	fail_kinds: Mutex<Vec<String>>,
}

impl RecordingService {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub(crate) fn fail_kind(&self, kind: &str) {
		self.fail_kinds.lock().push(kind.to_string());
	}

	pub(crate) fn calls(&self) -> Vec<CreateSubscriptionRequest> {
		self.calls.lock().clone()
	}

	/// (kind, session id) of every call so far.
	pub(crate) fn seen(&self) -> Vec<(String, String)> {
		self.calls
			.lock()
			.iter()
			.map(|r| (r.subscription.kind.clone(), r.session_id().unwrap_or_default().to_string()))
			.collect()
	}

	pub(crate) async fn wait_for_calls(&self, n: usize) -> Vec<CreateSubscriptionRequest> {
		timeout(WAIT, async {
			loop {
				let calls = self.calls();
				if calls.len() >= n {
					return calls;
				}
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("subscription calls within timeout")
	}
}

#[async_trait::async_trait]
impl SubscriptionService for RecordingService {
	async fn create_subscription(&self, request: CreateSubscriptionRequest) -> anyhow::Result<CreateSubscriptionResponse> {
		let kind = request.subscription.kind.clone();
		let transport = request.transport.clone();
		self.calls.lock().push(request);

		if self.fail_kinds.lock().contains(&kind) {
			anyhow::bail!("rejected {kind}");
		}

		Ok(CreateSubscriptionResponse {
			data: vec![Subscription {
				id: format!("sub-{kind}"),
				status: "enabled".to_string(),
				kind,
				version: "1".to_string(),
				transport,
				..Default::default()
			}],
			total: 1,
			total_cost: 0,
			max_total_cost: 10,
		})
	}
}

pub(crate) fn welcome(session_id: &str, keepalive_secs: u64) -> String {
	json!({
		"metadata": {
			"message_id": format!("welcome-{session_id}"),
			"message_type": "session_welcome",
			"message_timestamp": "2024-01-01T00:00:00.000Z"
		},
		"payload": {
			"session": {
				"id": session_id,
				"status": "connected",
				"connected_at": "2024-01-01T00:00:00.000Z",
				"keepalive_timeout_seconds": keepalive_secs,
				"reconnect_url": null
			}
		}
	})
	.to_string()
}

pub(crate) fn keepalive() -> String {
	json!({
		"metadata": {
			"message_id": "ka",
			"message_type": "session_keepalive",
			"message_timestamp": "2024-01-01T00:00:01.000Z"
		},
		"payload": {}
	})
	.to_string()
}

pub(crate) fn reconnect(url: &str) -> String {
	json!({
		"metadata": {
			"message_id": "rc",
			"message_type": "session_reconnect",
			"message_timestamp": "2024-01-01T00:00:02.000Z"
		},
		"payload": {
			"session": {
				"id": "old",
				"status": "reconnecting",
				"keepalive_timeout_seconds": null,
				"reconnect_url": url
			}
		}
	})
	.to_string()
}

pub(crate) fn notification(message_id: &str, kind: &str) -> String {
	json!({
		"metadata": {
			"message_id": message_id,
			"message_type": "notification",
			"message_timestamp": "2024-01-01T00:00:03.000Z",
			"subscription_type": kind,
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {
				"id": format!("sub-{kind}"),
				"status": "enabled",
				"type": kind,
				"version": "1",
				"cost": 0,
				"condition": { "broadcaster_user_id": "1" },
				"transport": { "method": "websocket", "session_id": "s1" },
				"created_at": "2024-01-01T00:00:00.000Z"
			},
			"event": {
				"user_id": "7",
				"user_login": "viewer",
				"user_name": "Viewer",
				"broadcaster_user_id": "1"
			}
		}
	})
	.to_string()
}

/// Cheer from an anonymous user; the platform sends the user fields as `null`.
pub(crate) fn anonymous_cheer(message_id: &str) -> String {
	json!({
		"metadata": {
			"message_id": message_id,
			"message_type": "notification",
			"message_timestamp": "2024-01-01T00:00:04.000Z",
			"subscription_type": "channel.cheer",
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {
				"id": "sub-channel.cheer",
				"status": "enabled",
				"type": "channel.cheer",
				"version": "1",
				"cost": 0,
				"condition": { "broadcaster_user_id": "1" },
				"transport": { "method": "websocket", "session_id": "s1" },
				"created_at": "2024-01-01T00:00:00.000Z"
			},
			"event": {
				"is_anonymous": true,
				"user_id": null,
				"user_login": null,
				"user_name": null,
				"broadcaster_user_id": "1",
				"broadcaster_user_login": "streamer",
				"broadcaster_user_name": "Streamer",
				"message": "cheer100",
				"bits": 100
			}
		}
	})
	.to_string()
}
