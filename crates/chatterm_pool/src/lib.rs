#![forbid(unsafe_code)]

//! Multiplexed websocket connection layer.
//!
//! A [`Pool`] keeps at most one chat connection and one event connection per
//! account, shared by any number of consumers, and funnels everything they
//! receive into a single sink.

use std::sync::Arc;

use chatterm_domain::{Account, AccountId};
use chatterm_protocol::eventsub::{CreateSubscriptionRequest, CreateSubscriptionResponse, EventSubscription, Notification};
use chatterm_protocol::irc::IrcMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod accounts;
pub mod dedup;
pub mod error;
pub mod helix;
pub mod settings;
pub mod ws;

mod chat;
mod event;
mod pool;

#[cfg(test)]
mod test_support;




pub use accounts::StaticAccounts;
pub use dedup::DedupCache;
pub use error::{ConnectionError, PoolError};
pub use helix::HelixSubscriptions;
pub use pool::Pool;
pub use settings::PoolSettings;
pub use ws::{Ws, WsConnector};

/// Resolves credentials for an account. Called once per connection attempt,
/// so rotated tokens are picked up on the next reconnect.
pub trait AccountProvider: Send + Sync + 'static {
	fn account_by(&self, id: &AccountId) -> anyhow::Result<Account>;
}

/// Registers event subscriptions against a live session.
#[async_trait::async_trait]
pub trait SubscriptionService: Send + Sync + 'static {
	async fn create_subscription(&self, request: CreateSubscriptionRequest) -> anyhow::Result<CreateSubscriptionResponse>;
}

/// A subscription waiting to be registered, together with the service that registers it.
#[derive(Clone)]
pub struct PendingSubscription {
	pub subscription: EventSubscription,
	pub service: Arc<dyn SubscriptionService>,
}

impl PendingSubscription {
	pub fn new(subscription: EventSubscription, service: Arc<dyn SubscriptionService>) -> Self {
		Self { subscription, service }
	}
}

impl std::fmt::Debug for PendingSubscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PendingSubscription")
			.field("subscription", &self.subscription)
			.finish_non_exhaustive()
	}
}

/// Everything delivered to the sink, tagged with the originating account.
#[derive(Debug, Clone)]
pub enum PoolEvent {
	ChatMessage {
		account_id: AccountId,
		message: IrcMessage,
	},
	ChatError {
		account_id: AccountId,
		error: ConnectionError,
	},
	Notification {
		account_id: AccountId,
		notification: Box<Notification>,
	},
	NotificationError {
		account_id: AccountId,
		error: ConnectionError,
	},
}

impl PoolEvent {
	pub fn account_id(&self) -> &AccountId {
		match self {
			Self::ChatMessage { account_id, .. }
			| Self::ChatError { account_id, .. }
			| Self::Notification { account_id, .. }
			| Self::NotificationError { account_id, .. } => account_id,
		}
	}

	pub fn is_error(&self) -> bool {
		matches!(self, Self::ChatError { .. } | Self::NotificationError { .. })
	}
}

/// Producer side of the pool's bounded delivery queue.
#[derive(Clone)]
pub(crate) struct EventSink {
	tx: mpsc::Sender<PoolEvent>,
}

impl EventSink {
	pub(crate) fn new(tx: mpsc::Sender<PoolEvent>) -> Self {
		Self { tx }
	}

	/// Blocks while the queue is full, but gives up once `cancel` fires.
	/// Returns `false` if the event was not delivered.
	pub(crate) async fn send(&self, event: PoolEvent, cancel: &CancellationToken) -> bool {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => false,
			res = self.tx.send(event) => res.is_ok(),
		}
	}
}
