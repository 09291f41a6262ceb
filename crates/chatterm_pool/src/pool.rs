#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatterm_domain::{AccountId, ChannelName};
use chatterm_protocol::eventsub::EventSubscription;
use chatterm_protocol::irc::OutboundMessage;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::chat::{ChatConnection, ConnDeps};
use crate::error::PoolError;
use crate::event::EventConnection;
use crate::settings::PoolSettings;
use crate::ws::{WsConnector, default_connector};
use crate::{AccountProvider, EventSink, PendingSubscription, PoolEvent, SubscriptionService};

#[derive(Default)]
struct PoolInner {
	sink: Option<EventSink>,
	chat: HashMap<AccountId, Arc<ChatConnection>>,
	event: HashMap<AccountId, Arc<EventConnection>>,
	closed: bool,
}

/// Per-account registry of chat and event connections.
///
/// At most one connection of each kind exists per account. Chat connections are
/// ref-counted across consumers; event connections live until [`Pool::close`].
pub struct Pool {
	accounts: Arc<dyn AccountProvider>,
	settings: Arc<PoolSettings>,
	chat_connector: WsConnector,
	event_connector: WsConnector,
	inner: Mutex<PoolInner>,
}

impl Pool {
	pub fn new(accounts: Arc<dyn AccountProvider>, settings: PoolSettings) -> Self {
		let chat_connector = default_connector(settings.max_chat_frame);
		let event_connector = default_connector(settings.max_event_frame);
		Self {
			accounts,
			settings: Arc::new(settings),
			chat_connector,
			event_connector,
			inner: Mutex::new(PoolInner::default()),
		}
	}

	/// Use `connector` for both protocols instead of the default dialer.
	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.chat_connector = connector.clone();
		self.event_connector = connector;
		self
	}

	/// Install the function that receives every [`PoolEvent`].
	///
	/// Events are queued and handed to `f` from one forwarding task, in the order
	/// connections produced them. Connections created before a later call keep
	/// delivering to the queue they started with. Must be called inside a tokio runtime.
	pub fn set_sink<F>(&self, mut f: F)
	where
		F: FnMut(PoolEvent) + Send + 'static,
	{
		let (tx, mut rx) = mpsc::channel::<PoolEvent>(self.settings.sink_capacity.max(1));

		tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				f(event);
			}
			debug!("pool sink forwarder stopped");
		});

		self.inner.lock().sink = Some(EventSink::new(tx));
	}

	fn deps(&self, inner: &PoolInner, connector: &WsConnector) -> Result<ConnDeps, PoolError> {
		if inner.closed {
			return Err(PoolError::Closed);
		}
		let sink = inner.sink.clone().ok_or(PoolError::SinkUnset)?;
		Ok(ConnDeps {
			accounts: self.accounts.clone(),
			sink,
			settings: self.settings.clone(),
			connector: connector.clone(),
		})
	}

	/// Take a reference on the account's chat connection, starting it if needed.
	pub fn attach_chat(&self, account_id: &AccountId) -> Result<(), PoolError> {
		let mut inner = self.inner.lock();
		let deps = self.deps(&inner, &self.chat_connector)?;

		if let Some(conn) = inner.chat.get(account_id) {
			let refs = conn.inc_ref();
			debug!(account_id = %account_id, conn = "irc", refs, "chat connection attached");
			return Ok(());
		}

		let conn = ChatConnection::start(account_id.clone(), deps);
		conn.inc_ref();
		inner.chat.insert(account_id.clone(), Arc::new(conn));
		info!(account_id = %account_id, conn = "irc", "chat connection created");
		Ok(())
	}

	/// Drop a reference; the last one closes the connection. Unknown accounts are ignored.
	pub fn detach_chat(&self, account_id: &AccountId) {
		let mut inner = self.inner.lock();
		let Some(conn) = inner.chat.get(account_id) else {
			return;
		};

		let refs = conn.dec_ref();
		if refs > 0 {
			debug!(account_id = %account_id, conn = "irc", refs, "chat connection detached");
			return;
		}

		if let Some(conn) = inner.chat.remove(account_id) {
			conn.close();
		}
	}

	fn chat(&self, account_id: &AccountId) -> Result<Arc<ChatConnection>, PoolError> {
		let inner = self.inner.lock();
		if inner.closed {
			return Err(PoolError::Closed);
		}
		inner
			.chat
			.get(account_id)
			.cloned()
			.ok_or_else(|| PoolError::NoConnection(account_id.clone()))
	}

	pub async fn send_chat(&self, account_id: &AccountId, message: OutboundMessage) -> Result<(), PoolError> {
		self.chat(account_id)?.send(message).await
	}

	/// Join `channel` and keep it joined across reconnects.
	pub async fn join_channel(&self, account_id: &AccountId, channel: ChannelName) -> Result<(), PoolError> {
		self.chat(account_id)?.join_channel(channel).await
	}

	pub async fn leave_channel(&self, account_id: &AccountId, channel: ChannelName) -> Result<(), PoolError> {
		self.chat(account_id)?.leave_channel(channel).await
	}

	/// Queue a subscription on the account's event connection, creating it on first use.
	///
	/// Returns once the request is queued. Registration happens in the background
	/// and failures arrive at the sink as [`PoolEvent::NotificationError`].
	pub async fn subscribe_event(
		&self,
		account_id: &AccountId,
		subscription: EventSubscription,
		service: Arc<dyn SubscriptionService>,
	) -> Result<(), PoolError> {
		let conn = {
			let mut inner = self.inner.lock();
			let deps = self.deps(&inner, &self.event_connector)?;

			if let Some(conn) = inner.event.get(account_id).cloned() {
				conn
			} else {
				let conn = Arc::new(EventConnection::start(account_id.clone(), deps));
				inner.event.insert(account_id.clone(), conn.clone());
				info!(account_id = %account_id, conn = "eventsub", "event connection created");
				conn
			}
		};

		conn.subscribe(PendingSubscription::new(subscription, service)).await;
		Ok(())
	}

	/// Close every connection. Idempotent; later attach and subscribe calls fail.
	pub fn close(&self) {
		let (chat, event) = {
			let mut inner = self.inner.lock();
			if inner.closed {
				return;
			}
			inner.closed = true;
			inner.sink = None;
			(std::mem::take(&mut inner.chat), std::mem::take(&mut inner.event))
		};

		for conn in chat.values() {
			conn.close();
		}
		for conn in event.values() {
			conn.close();
		}

		info!(chat = chat.len(), event = event.len(), "connection pool closed");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.lock().closed
	}

	/// Current reference count of the account's chat connection, if one exists.
	pub fn chat_ref_count(&self, account_id: &AccountId) -> Option<usize> {
		self.inner.lock().chat.get(account_id).map(|c| c.ref_count())
	}

	pub fn has_event_connection(&self, account_id: &AccountId) -> bool {
		self.inner.lock().event.contains_key(account_id)
	}

	/// Channels the account's chat connection will rejoin after a reconnect.
	pub fn joined_channels(&self, account_id: &AccountId) -> Vec<ChannelName> {
		self.inner
			.lock()
			.chat
			.get(account_id)
			.map(|c| c.channels())
			.unwrap_or_default()
	}

	/// Subscription types the account's event connection has registered.
	pub fn active_subscriptions(&self, account_id: &AccountId) -> Vec<String> {
		self.inner
			.lock()
			.event
			.get(account_id)
			.map(|c| c.active_kinds())
			.unwrap_or_default()
	}
}

impl Drop for Pool {
	fn drop(&mut self) {
		self.close();
	}
}
