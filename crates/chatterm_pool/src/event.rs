#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatterm_domain::AccountId;
use chatterm_protocol::eventsub::{
	self, CreateSubscriptionRequest, MESSAGE_TYPE_KEEPALIVE, MESSAGE_TYPE_NOTIFICATION, MESSAGE_TYPE_RECONNECT,
	MESSAGE_TYPE_REVOCATION, MESSAGE_TYPE_WELCOME, Session,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::chat::ConnDeps;
use crate::dedup::DedupCache;
use crate::error::ConnectionError;
use crate::settings::DEFAULT_SESSION_KEEPALIVE;
use crate::ws::Ws;
use crate::{PendingSubscription, PoolEvent};

#[derive(Debug, Default)]
struct EventState {
	/// Successfully registered subscriptions, in acceptance order.
	active: Vec<PendingSubscription>,
	closed: bool,
}

/// One account's notification session. Does not dial until the first subscription arrives.
pub(crate) struct EventConnection {
	account_id: AccountId,
	cancel: CancellationToken,
	sub_tx: mpsc::Sender<PendingSubscription>,
	state: Arc<Mutex<EventState>>,
}

impl EventConnection {
	pub(crate) fn start(account_id: AccountId, deps: ConnDeps) -> Self {
		let (sub_tx, sub_rx) = mpsc::channel(deps.settings.queue_capacity.max(1));
		let cancel = CancellationToken::new();
		let state = Arc::new(Mutex::new(EventState::default()));

		let runner = EventRunner {
			account_id: account_id.clone(),
			cancel: cancel.clone(),
			state: state.clone(),
			deps,
		};
		tokio::spawn(runner.run(sub_rx));

		Self {
			account_id,
			cancel,
			sub_tx,
			state,
		}
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.state.lock().closed
	}

	/// Subscription kinds registered so far, in acceptance order.
	pub(crate) fn active_kinds(&self) -> Vec<String> {
		self.state
			.lock()
			.active
			.iter()
			.map(|p| p.subscription.kind.clone())
			.collect()
	}

	/// Queue a subscription. Dropped silently if the connection is closed.
	pub(crate) async fn subscribe(&self, pending: PendingSubscription) {
		if self.is_closed() {
			debug!(account_id = %self.account_id, conn = "eventsub", kind = %pending.subscription.kind, "connection closed; subscription dropped");
			return;
		}

		let kind = pending.subscription.kind.clone();
		let queued = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => false,
			res = self.sub_tx.send(pending) => res.is_ok(),
		};
		if !queued {
			debug!(account_id = %self.account_id, conn = "eventsub", %kind, "connection closed; subscription dropped");
		}
	}

	/// Stop the background task. Idempotent.
	pub(crate) fn close(&self) {
		{
			let mut state = self.state.lock();
			if state.closed {
				return;
			}
			state.closed = true;
		}

		self.cancel.cancel();
		info!(account_id = %self.account_id, conn = "eventsub", "event connection closed");
	}
}

impl Drop for EventConnection {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

/// Why a session ended without an error.
#[derive(Debug)]
enum SessionEnd {
	/// Server asked us to move to a new url; redial right away.
	Reconnect(String),
	/// The subscription queue was dropped.
	QueueClosed,
}

struct EventRunner {
	account_id: AccountId,
	cancel: CancellationToken,
	state: Arc<Mutex<EventState>>,
	deps: ConnDeps,
}

impl EventRunner {
	async fn run(self, mut sub_rx: mpsc::Receiver<PendingSubscription>) {
		let settings = self.deps.settings.clone();
		let dedup = DedupCache::start(settings.dedup_window, settings.dedup_sweep_interval);

		// The server drops sessions that see no subscription shortly after connecting.
		let first = tokio::select! {
			_ = self.cancel.cancelled() => None,
			req = sub_rx.recv() => req,
		};

		let Some(first) = first else {
			dedup.stop();
			debug!(account_id = %self.account_id, conn = "eventsub", "stopped before first subscription");
			return;
		};

		let mut initial = Some(first);
		let mut target = settings.eventsub_url.clone();
		let mut replay = false;

		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			let result = tokio::select! {
				_ = self.cancel.cancelled() => break,
				res = self.connect_once(&target, replay, &mut initial, &mut sub_rx, &dedup) => res,
			};

			match result {
				Ok(SessionEnd::Reconnect(url)) => {
					metrics::counter!("chatterm_eventsub_reconnects_total", "reason" => "forced").increment(1);
					info!(account_id = %self.account_id, conn = "eventsub", %url, "server requested reconnect");
					target = url;
					// subscriptions move with the session
					replay = false;
					continue;
				}
				Ok(SessionEnd::QueueClosed) => {
					debug!(account_id = %self.account_id, conn = "eventsub", "subscription queue closed; stopping");
					break;
				}
				Err(err) => {
					warn!(account_id = %self.account_id, conn = "eventsub", error = %err, "event connection error, will reconnect");
					self.emit(PoolEvent::NotificationError {
						account_id: self.account_id.clone(),
						error: err,
					})
					.await;
					target = settings.eventsub_url.clone();
					replay = true;
				}
			}

			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = sleep(settings.reconnect_backoff) => {
					metrics::counter!("chatterm_eventsub_reconnects_total", "reason" => "error").increment(1);
					info!(account_id = %self.account_id, conn = "eventsub", "reconnecting");
				}
			}
		}

		dedup.stop();
		info!(account_id = %self.account_id, conn = "eventsub", "event connection stopped");
	}

	async fn emit(&self, event: PoolEvent) {
		if !self.deps.sink.send(event, &self.cancel).await {
			debug!(account_id = %self.account_id, conn = "eventsub", "sink unavailable; event dropped");
		}
	}

	async fn dial(&self, target: &str) -> Result<Ws, ConnectionError> {
		let url = Url::parse(target).map_err(|e| ConnectionError::InvalidEndpoint {
			url: target.to_string(),
			reason: e.to_string(),
		})?;

		let after = self.deps.settings.dial_timeout;
		match timeout(after, (self.deps.connector)(url)).await {
			Ok(Ok(ws)) => Ok(ws),
			Ok(Err(e)) => Err(ConnectionError::Dial {
				url: target.to_string(),
				reason: format!("{e:#}"),
			}),
			Err(_) => Err(ConnectionError::DialTimeout {
				url: target.to_string(),
				after,
			}),
		}
	}

	async fn connect_once(
		&self,
		target: &str,
		replay: bool,
		initial: &mut Option<PendingSubscription>,
		sub_rx: &mut mpsc::Receiver<PendingSubscription>,
		dedup: &DedupCache,
	) -> Result<SessionEnd, ConnectionError> {
		let mut ws = self.dial(target).await?;

		let result = self.session(&mut ws, replay, initial, sub_rx, dedup).await;

		let _ = ws.close(None).await;
		result
	}

	async fn session(
		&self,
		ws: &mut Ws,
		replay: bool,
		initial: &mut Option<PendingSubscription>,
		sub_rx: &mut mpsc::Receiver<PendingSubscription>,
		dedup: &DedupCache,
	) -> Result<SessionEnd, ConnectionError> {
		let welcome_timeout = self.deps.settings.welcome_timeout;
		let session = match timeout(welcome_timeout, read_welcome(ws)).await {
			Ok(res) => res?,
			Err(_) => {
				return Err(ConnectionError::Handshake(format!(
					"no session_welcome within {welcome_timeout:?}"
				)));
			}
		};

		let keepalive = session
			.keepalive_timeout_seconds
			.filter(|s| *s > 0)
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_SESSION_KEEPALIVE);

		info!(
			account_id = %self.account_id,
			conn = "eventsub",
			session_id = %session.id,
			keepalive_secs = keepalive.as_secs(),
			"eventsub connected"
		);

		if replay {
			let active = self.state.lock().active.clone();
			for pending in &active {
				self.register(pending, &session.id).await;
			}
		}

		if let Some(pending) = initial.take()
			&& self.register(&pending, &session.id).await
		{
			self.state.lock().active.push(pending);
		}

		tokio::select! {
			res = self.read_loop(ws, keepalive * 2, dedup) => res,
			res = self.intake_loop(sub_rx, &session.id) => res,
		}
	}

	/// Register one subscription. Failures go to the sink and never end the session.
	async fn register(&self, pending: &PendingSubscription, session_id: &str) -> bool {
		let kind = pending.subscription.kind.clone();
		let request = CreateSubscriptionRequest::with_session(pending.subscription.clone(), session_id);

		let reason = match timeout(
			self.deps.settings.subscribe_timeout,
			pending.service.create_subscription(request),
		)
		.await
		{
			Ok(Ok(resp)) => {
				let cost = resp.data.first().map(|s| s.cost).unwrap_or_default();
				info!(account_id = %self.account_id, conn = "eventsub", %kind, cost, total_cost = resp.total_cost, "subscription created");
				return true;
			}
			Ok(Err(e)) => format!("{e:#}"),
			Err(_) => format!("timed out after {:?}", self.deps.settings.subscribe_timeout),
		};

		metrics::counter!("chatterm_eventsub_subscription_failures_total").increment(1);
		warn!(account_id = %self.account_id, conn = "eventsub", %kind, error = %reason, "failed to create subscription");
		self.emit(PoolEvent::NotificationError {
			account_id: self.account_id.clone(),
			error: ConnectionError::Subscription { kind, reason },
		})
		.await;
		false
	}

	async fn intake_loop(
		&self,
		sub_rx: &mut mpsc::Receiver<PendingSubscription>,
		session_id: &str,
	) -> Result<SessionEnd, ConnectionError> {
		while let Some(pending) = sub_rx.recv().await {
			if self.register(&pending, session_id).await {
				self.state.lock().active.push(pending);
			}
		}
		Ok(SessionEnd::QueueClosed)
	}

	/// Any frame resets the watchdog; silence past `watchdog` is a dead session.
	async fn read_loop(&self, ws: &mut Ws, watchdog: Duration, dedup: &DedupCache) -> Result<SessionEnd, ConnectionError> {
		loop {
			let frame = match timeout(watchdog, ws.next()).await {
				Ok(Some(frame)) => frame.map_err(|e| ConnectionError::Read(e.to_string()))?,
				Ok(None) => return Err(ConnectionError::RemoteClosed),
				Err(_) => return Err(ConnectionError::KeepaliveTimeout(watchdog)),
			};

			let text = match frame {
				Message::Text(text) => text,
				Message::Close(frame) => {
					debug!(account_id = %self.account_id, conn = "eventsub", ?frame, "server closed eventsub socket");
					return Err(ConnectionError::RemoteClosed);
				}
				_ => continue,
			};

			let message_type = match eventsub::peek_message_type(&text) {
				Ok(t) => t,
				Err(e) => {
					debug!(account_id = %self.account_id, conn = "eventsub", error = %e, "skipping undecodable frame");
					continue;
				}
			};

			match message_type.as_str() {
				MESSAGE_TYPE_KEEPALIVE => {
					debug!(account_id = %self.account_id, conn = "eventsub", "eventsub keepalive");
				}
				MESSAGE_TYPE_RECONNECT => {
					let msg = eventsub::parse_reconnect(&text).map_err(|e| ConnectionError::Protocol(e.to_string()))?;
					let url = msg
						.payload
						.session
						.reconnect_url
						.filter(|u| !u.trim().is_empty())
						.ok_or_else(|| ConnectionError::Protocol("session_reconnect without reconnect_url".to_string()))?;
					return Ok(SessionEnd::Reconnect(url));
				}
				MESSAGE_TYPE_NOTIFICATION => {
					let notification = match eventsub::parse_notification(&text) {
						Ok(n) => n,
						Err(e) => {
							debug!(account_id = %self.account_id, conn = "eventsub", error = %e, "dropping undecodable notification");
							continue;
						}
					};

					if !dedup.check_and_set(notification.message_id()) {
						metrics::counter!("chatterm_eventsub_duplicates_dropped_total").increment(1);
						debug!(
							account_id = %self.account_id,
							conn = "eventsub",
							message_id = notification.message_id(),
							"duplicate notification dropped"
						);
						continue;
					}

					self.emit(PoolEvent::Notification {
						account_id: self.account_id.clone(),
						notification: Box::new(notification),
					})
					.await;
				}
				MESSAGE_TYPE_REVOCATION => {
					info!(account_id = %self.account_id, conn = "eventsub", "subscription revoked by server");
				}
				other => {
					debug!(account_id = %self.account_id, conn = "eventsub", message_type = other, "ignoring eventsub frame");
				}
			}
		}
	}
}

/// The first text frame after dialing must be `session_welcome`.
async fn read_welcome(ws: &mut Ws) -> Result<Session, ConnectionError> {
	loop {
		let Some(msg) = ws.next().await else {
			return Err(ConnectionError::Handshake("ws closed before welcome".to_string()));
		};
		let msg = msg.map_err(|e| ConnectionError::Read(e.to_string()))?;

		match msg {
			Message::Text(t) => {
				let ty = eventsub::peek_message_type(&t).map_err(|e| ConnectionError::Handshake(e.to_string()))?;
				if ty != MESSAGE_TYPE_WELCOME {
					return Err(ConnectionError::Handshake(format!("expected session_welcome, got {ty}")));
				}
				let welcome = eventsub::parse_welcome(&t).map_err(|e| ConnectionError::Handshake(e.to_string()))?;
				return Ok(welcome.payload.session);
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				return Err(ConnectionError::Handshake(format!("ws closed before welcome: close={c:?}")));
			}
			_ => {}
		}
	}
}
