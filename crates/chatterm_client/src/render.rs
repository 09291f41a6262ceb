#![forbid(unsafe_code)]

use chatterm_pool::PoolEvent;
use chatterm_protocol::irc::IrcMessage;

/// One transcript line for `event`, or `None` for state-only updates.
pub fn render(event: &PoolEvent) -> Option<String> {
	match event {
		PoolEvent::ChatMessage { message, .. } => render_chat(message),
		PoolEvent::ChatError { account_id, error } => Some(format!("! chat ({account_id}): {error}")),
		PoolEvent::Notification { notification, .. } => {
			let ev = &notification.payload.event;
			let line = match notification.kind() {
				"channel.follow" => format!("{} followed", ev.user_name),
				"channel.raid" => format!("{} raided with {} viewers", ev.from_broadcaster_user_name, ev.viewers),
				"channel.ad_break.begin" => format!("ad break for {}s", ev.duration_seconds),
				kind if kind.starts_with("channel.poll.") => format!("poll {}: {}", ev.status, ev.title),
				other => format!("{other} event"),
			};
			Some(format!("[event] {line}"))
		}
		PoolEvent::NotificationError { account_id, error } => Some(format!("! events ({account_id}): {error}")),
	}
}

fn render_chat(message: &IrcMessage) -> Option<String> {
	match message {
		IrcMessage::PrivateMessage(m) => {
			let name = if m.display_name.is_empty() { &m.login } else { &m.display_name };
			Some(format!("[#{}] {name}: {}", m.channel, m.text))
		}
		IrcMessage::Notice(n) => Some(match &n.channel {
			Some(channel) => format!("[#{channel}] * {}", n.text),
			None => format!("* {}", n.text),
		}),
		IrcMessage::UserNotice(u) => {
			let mut line = format!("[#{}] * {}", u.channel, u.system_message);
			if let Some(text) = &u.text {
				line.push_str(" | ");
				line.push_str(text);
			}
			Some(line)
		}
		IrcMessage::ClearChat(c) => Some(match (&c.target_login, c.ban_duration_seconds) {
			(Some(login), Some(secs)) => format!("[#{}] * {login} timed out for {secs}s", c.channel),
			(Some(login), None) => format!("[#{}] * {login} banned", c.channel),
			(None, _) => format!("[#{}] * chat cleared", c.channel),
		}),
		IrcMessage::ClearMessage(c) => Some(format!("[#{}] * message from {} deleted", c.channel, c.login)),
		IrcMessage::Whisper(w) => Some(format!("[whisper] {}: {}", w.display_name, w.text)),
		IrcMessage::Ping(_) | IrcMessage::UserState(_) | IrcMessage::RoomState(_) => None,
	}
}
