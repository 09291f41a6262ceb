#![forbid(unsafe_code)]

use std::time::Duration;

pub const DEFAULT_CHAT_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
pub const DEFAULT_EVENTSUB_URL: &str = "wss://eventsub.wss.twitch.tv/ws?keepalive_timeout_seconds=30";

/// Fallback when the welcome frame does not advertise a keepalive timeout.
pub(crate) const DEFAULT_SESSION_KEEPALIVE: Duration = Duration::from_secs(10);

/// Connection-layer constants. `Default` holds the production values.
#[derive(Debug, Clone)]
pub struct PoolSettings {
	pub chat_url: String,
	pub eventsub_url: String,

	pub dial_timeout: Duration,

	/// Chat ping cadence and how long to wait for the pong.
	pub keepalive_interval: Duration,
	pub keepalive_timeout: Duration,

	/// Fixed delay between an error-path disconnect and the next dial.
	pub reconnect_backoff: Duration,

	/// How long the event connection waits for `session_welcome` after dialing.
	pub welcome_timeout: Duration,
	pub subscribe_timeout: Duration,

	pub dedup_window: Duration,
	pub dedup_sweep_interval: Duration,

	/// Capacity of each connection's outbound and subscription queues.
	pub queue_capacity: usize,
	pub sink_capacity: usize,

	pub max_chat_frame: usize,
	pub max_event_frame: usize,
}

impl Default for PoolSettings {
	fn default() -> Self {
		Self {
			chat_url: DEFAULT_CHAT_URL.to_string(),
			eventsub_url: DEFAULT_EVENTSUB_URL.to_string(),
			dial_timeout: Duration::from_secs(5),
			keepalive_interval: Duration::from_secs(10),
			keepalive_timeout: Duration::from_secs(5),
			reconnect_backoff: Duration::from_secs(5),
			welcome_timeout: Duration::from_secs(10),
			subscribe_timeout: Duration::from_secs(10),
			dedup_window: Duration::from_secs(15 * 60),
			dedup_sweep_interval: Duration::from_secs(60),
			queue_capacity: 64,
			sink_capacity: 1024,
			max_chat_frame: 1024 * 1024,
			max_event_frame: 5 * 1024 * 1024,
		}
	}
}
