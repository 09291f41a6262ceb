#![forbid(unsafe_code)]

pub mod eventsub;
pub mod irc;

pub use eventsub::{
	CreateSubscriptionRequest, CreateSubscriptionResponse, EventSubParseError, EventSubscription, Notification,
};
pub use irc::{IrcMessage, IrcParseError, OutboundMessage, is_membership_noise, parse_line, split_lines};

/// Protocol constants shared by the connection layer.
pub mod version {
	/// Capabilities requested right after authenticating on the chat socket.
	pub const CHAT_CAPABILITIES: &str = "twitch.tv/membership twitch.tv/tags twitch.tv/commands";

	/// Transport method used when registering event subscriptions.
	pub const EVENTSUB_TRANSPORT_METHOD: &str = "websocket";
}
