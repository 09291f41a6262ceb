#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chatterm_domain::{ChannelName, SecretString};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrcParseError {
	#[error("cannot parse zero-length line")]
	Empty,

	#[error("no message data after tags")]
	MissingDataAfterTags,

	#[error("no message data after prefix")]
	MissingDataAfterPrefix,

	#[error("missing message command")]
	MissingCommand,

	#[error("invalid numeric tag: {tag}={value}")]
	InvalidNumber {
		tag: String,
		value: String,
	},

	#[error("command not handled by parser: {0}")]
	UnhandledCommand(String),
}

impl IrcParseError {
	/// Unhandled commands are protocol noise, not a broken stream.
	pub fn is_unhandled(&self) -> bool {
		matches!(self, Self::UnhandledCommand(_))
	}
}

/// Split one websocket frame into protocol lines. Empty lines are skipped.
pub fn split_lines(frame: &str) -> impl Iterator<Item = &str> {
	frame.split("\r\n").filter(|line| !line.is_empty())
}

/// Membership and server-notice lines that are dropped without logging.
pub fn is_membership_noise(line: &str) -> bool {
	line.contains("PART") || line.contains("JOIN") || line.starts_with(":tmi.twitch.tv")
}

/// `nick!user@host` message source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefix {
	pub name: String,
	pub user: String,
	pub host: String,
}

impl Prefix {
	fn parse(raw: &str) -> Self {
		let (rest, host) = match raw.split_once('@') {
			Some((rest, host)) => (rest, host),
			None => (raw, ""),
		};
		let (name, user) = match rest.split_once('!') {
			Some((name, user)) => (name, user),
			None => (rest, ""),
		};
		Self {
			name: name.to_string(),
			user: user.to_string(),
			host: host.to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Badge {
	pub name: String,
	pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmotePosition {
	pub start: usize,
	pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emote {
	pub id: String,
	pub positions: Vec<EmotePosition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyParent {
	pub message_id: String,
	pub user_id: String,
	pub user_login: String,
	pub display_name: String,
	pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
	pub id: String,
	pub channel: String,
	pub room_id: String,
	pub user_id: String,
	pub login: String,
	pub display_name: String,
	pub color: String,
	pub text: String,
	pub badges: Vec<Badge>,
	pub badge_info: Vec<Badge>,
	pub emotes: Vec<Emote>,
	pub bits: u64,
	pub first_message: bool,
	pub moderator: bool,
	pub subscriber: bool,
	pub vip: bool,
	pub reply_parent: Option<ReplyParent>,
	pub sent_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
	pub channel: Option<String>,
	pub msg_id: Option<String>,
	pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotice {
	pub id: String,
	pub channel: String,
	pub room_id: String,
	pub msg_id: String,
	pub user_id: String,
	pub login: String,
	pub display_name: String,
	pub color: String,
	pub system_message: String,
	pub text: Option<String>,
	pub badges: Vec<Badge>,

	/// `msg-param-*` tags with the prefix stripped.
	pub params: BTreeMap<String, String>,
	pub sent_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
	pub channel: String,
	pub display_name: String,
	pub color: String,
	pub badges: Vec<Badge>,
	pub emote_sets: Vec<String>,
	pub moderator: bool,
	pub subscriber: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
	pub channel: String,
	pub room_id: String,
	pub emote_only: Option<bool>,
	pub r9k: Option<bool>,
	pub subs_only: Option<bool>,

	/// `-1` means followers-only is off.
	pub followers_only_minutes: Option<i64>,
	pub slow_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearChat {
	pub channel: String,
	pub room_id: String,
	pub target_user_id: Option<String>,
	pub target_login: Option<String>,

	/// `None` for a permanent ban or a full chat clear.
	pub ban_duration_seconds: Option<u64>,
	pub sent_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearMessage {
	pub channel: String,
	pub room_id: String,
	pub login: String,
	pub target_message_id: String,
	pub sent_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whisper {
	pub id: String,
	pub thread_id: String,
	pub from_login: String,
	pub user_id: String,
	pub display_name: String,
	pub color: String,
	pub text: String,
	pub badges: Vec<Badge>,
}

/// Structured inbound chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcMessage {
	PrivateMessage(Box<PrivateMessage>),
	Ping(Option<String>),
	Notice(Notice),
	UserNotice(Box<UserNotice>),
	UserState(UserState),
	RoomState(RoomState),
	ClearChat(ClearChat),
	ClearMessage(ClearMessage),
	Whisper(Whisper),
}

impl IrcMessage {
	/// Channel the message belongs to, when it has one.
	pub fn channel(&self) -> Option<&str> {
		match self {
			Self::PrivateMessage(m) => Some(&m.channel),
			Self::Notice(n) => n.channel.as_deref(),
			Self::UserNotice(u) => Some(&u.channel),
			Self::UserState(u) => Some(&u.channel),
			Self::RoomState(r) => Some(&r.channel),
			Self::ClearChat(c) => Some(&c.channel),
			Self::ClearMessage(c) => Some(&c.channel),
			Self::Ping(_) | Self::Whisper(_) => None,
		}
	}
}

struct RawLine {
	tags: HashMap<String, String>,
	prefix: Prefix,
	command: String,
	params: Vec<String>,
}

impl RawLine {
	fn parse(line: &str) -> Result<Self, IrcParseError> {
		let mut rest = line.trim_end_matches(['\r', '\n']);
		if rest.is_empty() {
			return Err(IrcParseError::Empty);
		}

		let mut tags = HashMap::new();
		if let Some(stripped) = rest.strip_prefix('@') {
			let (raw_tags, after) = stripped.split_once(' ').ok_or(IrcParseError::MissingDataAfterTags)?;
			tags = parse_tags(raw_tags);
			rest = after;
		}

		let mut prefix = Prefix::default();
		if let Some(stripped) = rest.strip_prefix(':') {
			let (raw_prefix, after) = stripped.split_once(' ').ok_or(IrcParseError::MissingDataAfterPrefix)?;
			prefix = Prefix::parse(raw_prefix);
			rest = after;
		}

		let (head, trailing) = match rest.split_once(" :") {
			Some((head, trailing)) => (head, Some(trailing)),
			None => (rest, None),
		};

		let mut params: Vec<String> = head.split(' ').filter(|p| !p.is_empty()).map(str::to_string).collect();
		if params.is_empty() {
			return Err(IrcParseError::MissingCommand);
		}

		let command = params.remove(0).to_ascii_uppercase();
		if let Some(trailing) = trailing {
			params.push(trailing.to_string());
		}

		Ok(Self {
			tags,
			prefix,
			command,
			params,
		})
	}

	fn tag(&self, key: &str) -> String {
		self.tags.get(key).cloned().unwrap_or_default()
	}

	fn non_empty_tag(&self, key: &str) -> Option<String> {
		self.tags.get(key).filter(|v| !v.is_empty()).cloned()
	}

	fn flag(&self, key: &str) -> bool {
		self.tags.get(key).is_some_and(|v| v == "1")
	}

	fn opt_flag(&self, key: &str) -> Option<bool> {
		self.tags.get(key).map(|v| v == "1")
	}

	fn number<T: FromStr>(&self, key: &str) -> Result<Option<T>, IrcParseError> {
		match self.tags.get(key) {
			None => Ok(None),
			Some(v) if v.is_empty() => Ok(None),
			Some(v) => v.parse::<T>().map(Some).map_err(|_| IrcParseError::InvalidNumber {
				tag: key.to_string(),
				value: v.clone(),
			}),
		}
	}

	fn channel(&self) -> String {
		self.params
			.first()
			.map(|c| c.trim_start_matches('#').to_string())
			.unwrap_or_default()
	}

	fn text(&self) -> Option<String> {
		self.params.get(1).cloned()
	}

	fn sent_at(&self) -> Option<SystemTime> {
		let millis: u64 = self.tags.get("tmi-sent-ts")?.parse().ok()?;
		UNIX_EPOCH.checked_add(Duration::from_millis(millis))
	}
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
	raw.split(';')
		.filter(|t| !t.is_empty())
		.map(|tag| match tag.split_once('=') {
			Some((k, v)) => (k.to_string(), unescape_tag_value(v)),
			None => (tag.to_string(), String::new()),
		})
		.collect()
}

fn unescape_tag_value(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			// trailing lone backslash is dropped
			None => {}
		}
	}
	out
}

pub(crate) fn parse_badges(raw: &str) -> Vec<Badge> {
	raw.split(',')
		.filter(|b| !b.is_empty())
		.map(|badge| match badge.split_once('/') {
			Some((name, version)) => Badge {
				name: name.to_string(),
				version: version.to_string(),
			},
			None => Badge {
				name: badge.to_string(),
				version: String::new(),
			},
		})
		.collect()
}

/// Parse the `emotes` tag (`id:0-4,6-10/id2:12-15`). Malformed entries are skipped.
pub(crate) fn parse_emotes(raw: &str) -> Vec<Emote> {
	let mut emotes = Vec::new();
	for entry in raw.split('/').filter(|e| !e.is_empty()) {
		let Some((id, ranges)) = entry.split_once(':') else {
			continue;
		};

		let positions: Vec<EmotePosition> = ranges
			.split(',')
			.filter_map(|range| {
				let (start, end) = range.split_once('-')?;
				Some(EmotePosition {
					start: start.parse().ok()?,
					end: end.parse().ok()?,
				})
			})
			.collect();

		if positions.is_empty() {
			continue;
		}

		emotes.push(Emote {
			id: id.to_string(),
			positions,
		});
	}
	emotes
}

/// Parse one protocol line into a structured message.
pub fn parse_line(line: &str) -> Result<IrcMessage, IrcParseError> {
	let raw = RawLine::parse(line)?;

	match raw.command.as_str() {
		"PRIVMSG" => {
			let reply_parent = raw.non_empty_tag("reply-parent-msg-id").map(|message_id| ReplyParent {
				message_id,
				user_id: raw.tag("reply-parent-user-id"),
				user_login: raw.tag("reply-parent-user-login"),
				display_name: raw.tag("reply-parent-display-name"),
				body: raw.tag("reply-parent-msg-body"),
			});

			Ok(IrcMessage::PrivateMessage(Box::new(PrivateMessage {
				id: raw.tag("id"),
				channel: raw.channel(),
				room_id: raw.tag("room-id"),
				user_id: raw.tag("user-id"),
				login: raw.prefix.name.clone(),
				display_name: raw.tag("display-name"),
				color: raw.tag("color"),
				text: raw.text().unwrap_or_default(),
				badges: parse_badges(&raw.tag("badges")),
				badge_info: parse_badges(&raw.tag("badge-info")),
				emotes: parse_emotes(&raw.tag("emotes")),
				bits: raw.number("bits")?.unwrap_or(0),
				first_message: raw.flag("first-msg"),
				moderator: raw.flag("mod"),
				subscriber: raw.flag("subscriber"),
				vip: raw.flag("vip"),
				reply_parent,
				sent_at: raw.sent_at(),
			})))
		}
		"PING" => Ok(IrcMessage::Ping(raw.params.first().cloned())),
		"NOTICE" => {
			let (channel, text) = match raw.params.as_slice() {
				[channel, text, ..] => (Some(channel.trim_start_matches('#').to_string()), text.clone()),
				[text] => (None, text.clone()),
				[] => (None, String::new()),
			};
			Ok(IrcMessage::Notice(Notice {
				channel,
				msg_id: raw.non_empty_tag("msg-id"),
				text,
			}))
		}
		"USERNOTICE" => {
			let params = raw
				.tags
				.iter()
				.filter_map(|(k, v)| k.strip_prefix("msg-param-").map(|k| (k.to_string(), v.clone())))
				.collect();

			Ok(IrcMessage::UserNotice(Box::new(UserNotice {
				id: raw.tag("id"),
				channel: raw.channel(),
				room_id: raw.tag("room-id"),
				msg_id: raw.tag("msg-id"),
				user_id: raw.tag("user-id"),
				login: raw.tag("login"),
				display_name: raw.tag("display-name"),
				color: raw.tag("color"),
				system_message: raw.tag("system-msg"),
				text: raw.text(),
				badges: parse_badges(&raw.tag("badges")),
				params,
				sent_at: raw.sent_at(),
			})))
		}
		"USERSTATE" => Ok(IrcMessage::UserState(UserState {
			channel: raw.channel(),
			display_name: raw.tag("display-name"),
			color: raw.tag("color"),
			badges: parse_badges(&raw.tag("badges")),
			emote_sets: raw
				.tag("emote-sets")
				.split(',')
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.collect(),
			moderator: raw.flag("mod"),
			subscriber: raw.flag("subscriber"),
		})),
		"ROOMSTATE" => Ok(IrcMessage::RoomState(RoomState {
			channel: raw.channel(),
			room_id: raw.tag("room-id"),
			emote_only: raw.opt_flag("emote-only"),
			r9k: raw.opt_flag("r9k"),
			subs_only: raw.opt_flag("subs-only"),
			followers_only_minutes: raw.number("followers-only")?,
			slow_seconds: raw.number("slow")?,
		})),
		"CLEARCHAT" => Ok(IrcMessage::ClearChat(ClearChat {
			channel: raw.channel(),
			room_id: raw.tag("room-id"),
			target_user_id: raw.non_empty_tag("target-user-id"),
			target_login: raw.text(),
			ban_duration_seconds: raw.number("ban-duration")?,
			sent_at: raw.sent_at(),
		})),
		"CLEARMSG" => Ok(IrcMessage::ClearMessage(ClearMessage {
			channel: raw.channel(),
			room_id: raw.tag("room-id"),
			login: raw.tag("login"),
			target_message_id: raw.tag("target-msg-id"),
			sent_at: raw.sent_at(),
		})),
		"WHISPER" => Ok(IrcMessage::Whisper(Whisper {
			id: raw.tag("message-id"),
			thread_id: raw.tag("thread-id"),
			from_login: raw.prefix.name.clone(),
			user_id: raw.tag("user-id"),
			display_name: raw.tag("display-name"),
			color: raw.tag("color"),
			text: raw.text().unwrap_or_default(),
			badges: parse_badges(&raw.tag("badges")),
		})),
		other => Err(IrcParseError::UnhandledCommand(other.to_string())),
	}
}

/// Outbound chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
	Pass(SecretString),
	Nick(String),
	CapReq(String),
	Join(ChannelName),
	Part(ChannelName),
	PrivMsg {
		channel: ChannelName,
		text: String,
		reply_to: Option<String>,
	},
	Pong,
}

impl OutboundMessage {
	pub fn privmsg(channel: ChannelName, text: impl Into<String>) -> Self {
		Self::PrivMsg {
			channel,
			text: text.into(),
			reply_to: None,
		}
	}

	/// Wire representation without the trailing CRLF.
	pub fn to_line(&self) -> String {
		match self {
			Self::Pass(token) => {
				let token = token.expose();
				let token = token.strip_prefix("oauth:").unwrap_or(token);
				format!("PASS oauth:{token}")
			}
			Self::Nick(name) => format!("NICK {}", single_line(name)),
			Self::CapReq(caps) => format!("CAP REQ :{caps}"),
			Self::Join(channel) => format!("JOIN #{channel}"),
			Self::Part(channel) => format!("PART #{channel}"),
			Self::PrivMsg {
				channel,
				text,
				reply_to: Some(parent),
			} => format!(
				"@reply-parent-msg-id={} PRIVMSG #{channel} :{}",
				single_line(parent),
				single_line(text)
			),
			Self::PrivMsg { channel, text, .. } => format!("PRIVMSG #{channel} :{}", single_line(text)),
			Self::Pong => "PONG".to_string(),
		}
	}
}

/// Line breaks in caller text would start a new command on the wire.
fn single_line(value: &str) -> Cow<'_, str> {
	if value.contains(['\r', '\n']) {
		Cow::Owned(value.replace(['\r', '\n'], " "))
	} else {
		Cow::Borrowed(value)
	}
}

impl fmt::Display for OutboundMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pass(_) => f.write_str("PASS oauth:<redacted>"),
			other => f.write_str(&other.to_line()),
		}
	}
}
