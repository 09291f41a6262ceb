#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::version::EVENTSUB_TRANSPORT_METHOD;

pub const MESSAGE_TYPE_WELCOME: &str = "session_welcome";
pub const MESSAGE_TYPE_KEEPALIVE: &str = "session_keepalive";
pub const MESSAGE_TYPE_RECONNECT: &str = "session_reconnect";
pub const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
pub const MESSAGE_TYPE_REVOCATION: &str = "revocation";

#[derive(Debug, Error)]
pub enum EventSubParseError {
	#[error("parse {frame}: {source}")]
	Json {
		frame: &'static str,
		#[source]
		source: serde_json::Error,
	},

	#[error("invalid RFC3339 timestamp {value:?}: {source}")]
	Timestamp {
		value: String,
		#[source]
		source: chrono::ParseError,
	},
}

fn from_json<'a, T: Deserialize<'a>>(frame: &'static str, raw: &'a str) -> Result<T, EventSubParseError> {
	serde_json::from_str(raw).map_err(|source| EventSubParseError::Json { frame, source })
}

/// Event bodies send `null` where a value is absent (anonymous cheers, for one).
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// Metadata present on every frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Metadata {
	#[serde(default)]
	pub message_id: String,
	pub message_type: String,
	#[serde(default)]
	pub message_timestamp: String,

	#[serde(default)]
	pub subscription_type: Option<String>,
	#[serde(default)]
	pub subscription_version: Option<String>,
}

impl Metadata {
	/// Convert `message_timestamp` into `SystemTime`.
	pub fn timestamp(&self) -> Result<SystemTime, EventSubParseError> {
		parse_timestamp(&self.message_timestamp)
	}
}

/// EventSub timestamps are RFC3339 with fractional seconds in UTC.
pub fn parse_timestamp(ts: &str) -> Result<SystemTime, EventSubParseError> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).map_err(|source| EventSubParseError::Timestamp {
		value: ts.to_string(),
		source,
	})?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

#[derive(Debug, Deserialize)]
struct MetadataPeek {
	metadata: MetadataPeekInner,
}

#[derive(Debug, Deserialize)]
struct MetadataPeekInner {
	message_type: String,
}

/// Extract `metadata.message_type` without decoding the payload.
pub fn peek_message_type(raw_json: &str) -> Result<String, EventSubParseError> {
	let peek: MetadataPeek = from_json("metadata peek", raw_json)?;
	Ok(peek.metadata.message_type)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Session {
	pub id: String,
	#[serde(default)]
	pub status: String,
	#[serde(default)]
	pub connected_at: String,
	#[serde(default)]
	pub keepalive_timeout_seconds: Option<u64>,
	#[serde(default)]
	pub reconnect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionPayload {
	pub session: Session,
}

/// `session_welcome` and `session_reconnect` share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionMessage {
	pub metadata: Metadata,
	pub payload: SessionPayload,
}

/// Parse a `session_welcome` frame.
pub fn parse_welcome(raw_json: &str) -> Result<SessionMessage, EventSubParseError> {
	from_json(MESSAGE_TYPE_WELCOME, raw_json)
}

/// Parse a `session_reconnect` frame. The new target is `payload.session.reconnect_url`.
pub fn parse_reconnect(raw_json: &str) -> Result<SessionMessage, EventSubParseError> {
	from_json(MESSAGE_TYPE_RECONNECT, raw_json)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Subscription as echoed back by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Subscription {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub status: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub cost: u64,
	#[serde(default)]
	pub condition: BTreeMap<String, String>,
	#[serde(default)]
	pub transport: Transport,
	#[serde(default)]
	pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Voting {
	#[serde(deserialize_with = "null_as_default")]
	pub is_enabled: bool,
	#[serde(deserialize_with = "null_as_default")]
	pub amount_per_vote: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollChoice {
	#[serde(deserialize_with = "null_as_default")]
	pub id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub title: String,
	#[serde(deserialize_with = "null_as_default")]
	pub bits_votes: u64,
	#[serde(deserialize_with = "null_as_default")]
	pub channel_points_votes: u64,
	#[serde(deserialize_with = "null_as_default")]
	pub votes: u64,
}

/// Union of the event bodies this client subscribes to.
///
/// Every field defaults, so unknown event types still decode and the
/// consumer picks what it needs by `subscription.kind`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationEvent {
	#[serde(deserialize_with = "null_as_default")]
	pub user_id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub user_login: String,
	#[serde(deserialize_with = "null_as_default")]
	pub user_name: String,
	#[serde(deserialize_with = "null_as_default")]
	pub broadcaster_user_id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub broadcaster_user_login: String,
	#[serde(deserialize_with = "null_as_default")]
	pub broadcaster_user_name: String,
	pub followed_at: Option<String>,

	// channel.poll.*
	#[serde(deserialize_with = "null_as_default")]
	pub id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub title: String,
	#[serde(deserialize_with = "null_as_default")]
	pub choices: Vec<PollChoice>,
	#[serde(deserialize_with = "null_as_default")]
	pub bits_voting: Voting,
	#[serde(deserialize_with = "null_as_default")]
	pub channel_points_voting: Voting,
	pub started_at: Option<String>,
	pub ends_at: Option<String>,
	pub ended_at: Option<String>,
	#[serde(deserialize_with = "null_as_default")]
	pub status: String,

	// channel.raid
	#[serde(deserialize_with = "null_as_default")]
	pub from_broadcaster_user_id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub from_broadcaster_user_login: String,
	#[serde(deserialize_with = "null_as_default")]
	pub from_broadcaster_user_name: String,
	#[serde(deserialize_with = "null_as_default")]
	pub to_broadcaster_user_id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub to_broadcaster_user_login: String,
	#[serde(deserialize_with = "null_as_default")]
	pub to_broadcaster_user_name: String,
	#[serde(deserialize_with = "null_as_default")]
	pub viewers: u64,

	// channel.ad_break.begin
	#[serde(deserialize_with = "null_as_default")]
	pub is_automatic: bool,
	#[serde(deserialize_with = "null_as_default")]
	pub duration_seconds: u64,
	#[serde(deserialize_with = "null_as_default")]
	pub requester_user_id: String,
	#[serde(deserialize_with = "null_as_default")]
	pub requester_user_login: String,
	#[serde(deserialize_with = "null_as_default")]
	pub requester_user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationPayload {
	pub subscription: Subscription,
	#[serde(default, deserialize_with = "null_as_default")]
	pub event: NotificationEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Notification {
	pub metadata: Metadata,
	pub payload: NotificationPayload,
}

impl Notification {
	/// Unique id used for redelivery suppression.
	pub fn message_id(&self) -> &str {
		&self.metadata.message_id
	}

	pub fn kind(&self) -> &str {
		&self.payload.subscription.kind
	}
}

/// Parse a `notification` frame.
pub fn parse_notification(raw_json: &str) -> Result<Notification, EventSubParseError> {
	from_json(MESSAGE_TYPE_NOTIFICATION, raw_json)
}

/// What a consumer asks to subscribe to. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSubscription {
	#[serde(rename = "type")]
	pub kind: String,
	pub version: String,
	pub condition: BTreeMap<String, String>,
}

impl EventSubscription {
	pub fn new(kind: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			version: version.into(),
			condition: BTreeMap::new(),
		}
	}

	pub fn with_condition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.condition.insert(key.into(), value.into());
		self
	}
}

/// Body of `POST /helix/eventsub/subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateSubscriptionRequest {
	#[serde(flatten)]
	pub subscription: EventSubscription,
	pub transport: Transport,
}

impl CreateSubscriptionRequest {
	/// Bind a subscription to a live websocket session.
	pub fn with_session(subscription: EventSubscription, session_id: impl Into<String>) -> Self {
		Self {
			subscription,
			transport: Transport {
				method: EVENTSUB_TRANSPORT_METHOD.to_string(),
				session_id: Some(session_id.into()),
			},
		}
	}

	pub fn session_id(&self) -> Option<&str> {
		self.transport.session_id.as_deref()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CreateSubscriptionResponse {
	#[serde(default)]
	pub data: Vec<Subscription>,
	#[serde(default)]
	pub total: u64,
	#[serde(default)]
	pub total_cost: u64,
	#[serde(default)]
	pub max_total_cost: u64,
}
