use std::time::{Duration, UNIX_EPOCH};

use chatterm_domain::{ChannelName, SecretString};
use chatterm_protocol::irc::{IrcMessage, IrcParseError, OutboundMessage, is_membership_noise, parse_line, split_lines};
use proptest::prelude::*;

const PRIVMSG: &str = "@badge-info=subscriber/8;badges=subscriber/6,premium/1;color=#FF4500;display-name=Ronni;emotes=25:0-4;first-msg=0;id=b34ccfc7-4977-403a-8a94-33c6bac34fb8;mod=0;room-id=1337;subscriber=1;tmi-sent-ts=1507246572675;user-id=1337;vip=1 :ronni!ronni@ronni.tmi.twitch.tv PRIVMSG #ronni :Kappa Keepo Kappa";

#[test]
fn parses_privmsg_tags_and_body() {
	let IrcMessage::PrivateMessage(msg) = parse_line(PRIVMSG).expect("parse privmsg") else {
		panic!("expected privmsg");
	};

	assert_eq!(msg.channel, "ronni");
	assert_eq!(msg.login, "ronni");
	assert_eq!(msg.display_name, "Ronni");
	assert_eq!(msg.color, "#FF4500");
	assert_eq!(msg.text, "Kappa Keepo Kappa");
	assert_eq!(msg.id, "b34ccfc7-4977-403a-8a94-33c6bac34fb8");
	assert_eq!(msg.room_id, "1337");
	assert_eq!(msg.badges.len(), 2);
	assert_eq!(msg.badge_info[0].version, "8");
	assert_eq!(msg.emotes[0].id, "25");
	assert!(msg.subscriber);
	assert!(msg.vip);
	assert!(!msg.moderator);
	assert!(!msg.first_message);
	assert_eq!(msg.bits, 0);
	assert!(msg.reply_parent.is_none());
	assert_eq!(msg.sent_at, Some(UNIX_EPOCH + Duration::from_millis(1_507_246_572_675)));
}

#[test]
fn parses_reply_parent_with_escaped_body() {
	let line = r"@id=1;reply-parent-msg-id=parent-1;reply-parent-user-login=alice;reply-parent-display-name=Alice;reply-parent-msg-body=hello\sthere\:) :bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :@alice hi";
	let IrcMessage::PrivateMessage(msg) = parse_line(line).expect("parse reply") else {
		panic!("expected privmsg");
	};

	let parent = msg.reply_parent.expect("reply parent");
	assert_eq!(parent.message_id, "parent-1");
	assert_eq!(parent.user_login, "alice");
	assert_eq!(parent.body, "hello there;)");
	assert_eq!(msg.text, "@alice hi");
}

#[test]
fn trailing_param_keeps_inner_colons() {
	let IrcMessage::PrivateMessage(msg) = parse_line(":a!a@a PRIVMSG #c :time is 12:30 :)").expect("parse") else {
		panic!("expected privmsg");
	};
	assert_eq!(msg.text, "time is 12:30 :)");
}

#[test]
fn parses_ping_with_and_without_origin() {
	assert_eq!(
		parse_line("PING :tmi.twitch.tv").expect("ping"),
		IrcMessage::Ping(Some("tmi.twitch.tv".to_string()))
	);
	assert_eq!(parse_line("PING").expect("bare ping"), IrcMessage::Ping(None));
}

#[test]
fn parses_notice_with_msg_id() {
	let line = "@msg-id=msg_banned :tmi.twitch.tv NOTICE #bar :You are permanently banned from talking in bar.";
	let IrcMessage::Notice(notice) = parse_line(line).expect("notice") else {
		panic!("expected notice");
	};
	assert_eq!(notice.channel.as_deref(), Some("bar"));
	assert_eq!(notice.msg_id.as_deref(), Some("msg_banned"));
	assert!(notice.text.starts_with("You are permanently banned"));

	let IrcMessage::Notice(global) = parse_line(":tmi.twitch.tv NOTICE * :Login authentication failed").expect("global")
	else {
		panic!("expected notice");
	};
	assert_eq!(global.channel.as_deref(), Some("*"));
	assert_eq!(global.text, "Login authentication failed");
}

#[test]
fn parses_usernotice_params() {
	let line = r"@badges=staff/1;color=#008000;display-name=ronni;id=db25007f;login=ronni;msg-id=resub;msg-param-cumulative-months=6;msg-param-sub-plan=Prime;room-id=12345678;system-msg=ronni\shas\ssubscribed;tmi-sent-ts=1507246572675;user-id=87654321 :tmi.twitch.tv USERNOTICE #dallas :Great stream -- keep it up!";
	let IrcMessage::UserNotice(notice) = parse_line(line).expect("usernotice") else {
		panic!("expected usernotice");
	};
	assert_eq!(notice.msg_id, "resub");
	assert_eq!(notice.system_message, "ronni has subscribed");
	assert_eq!(notice.text.as_deref(), Some("Great stream -- keep it up!"));
	assert_eq!(notice.params.get("cumulative-months").map(String::as_str), Some("6"));
	assert_eq!(notice.params.get("sub-plan").map(String::as_str), Some("Prime"));
	assert_eq!(notice.channel, "dallas");
}

#[test]
fn parses_roomstate_optional_flags() {
	let line = "@emote-only=0;followers-only=-1;r9k=0;room-id=12345678;slow=10;subs-only=1 :tmi.twitch.tv ROOMSTATE #bar";
	let IrcMessage::RoomState(state) = parse_line(line).expect("roomstate") else {
		panic!("expected roomstate");
	};
	assert_eq!(state.emote_only, Some(false));
	assert_eq!(state.subs_only, Some(true));
	assert_eq!(state.followers_only_minutes, Some(-1));
	assert_eq!(state.slow_seconds, Some(10));

	let IrcMessage::RoomState(partial) = parse_line("@room-id=1;slow=0 :tmi.twitch.tv ROOMSTATE #bar").expect("partial")
	else {
		panic!("expected roomstate");
	};
	assert_eq!(partial.emote_only, None);
	assert_eq!(partial.slow_seconds, Some(0));
}

#[test]
fn parses_clearchat_timeout_and_full_clear() {
	let timeout = "@ban-duration=350;room-id=12345678;target-user-id=87654321;tmi-sent-ts=1642719320727 :tmi.twitch.tv CLEARCHAT #dallas :ronni";
	let IrcMessage::ClearChat(clear) = parse_line(timeout).expect("clearchat") else {
		panic!("expected clearchat");
	};
	assert_eq!(clear.ban_duration_seconds, Some(350));
	assert_eq!(clear.target_login.as_deref(), Some("ronni"));
	assert_eq!(clear.target_user_id.as_deref(), Some("87654321"));

	let IrcMessage::ClearChat(all) = parse_line("@room-id=1 :tmi.twitch.tv CLEARCHAT #dallas").expect("clear all") else {
		panic!("expected clearchat");
	};
	assert!(all.target_login.is_none());
	assert!(all.ban_duration_seconds.is_none());
}

#[test]
fn parses_clearmsg_and_whisper() {
	let IrcMessage::ClearMessage(clear) =
		parse_line("@login=foo;room-id=;target-msg-id=94e6c7ff;tmi-sent-ts=1642720582342 :tmi.twitch.tv CLEARMSG #bar :what a great day")
			.expect("clearmsg")
	else {
		panic!("expected clearmsg");
	};
	assert_eq!(clear.login, "foo");
	assert_eq!(clear.target_message_id, "94e6c7ff");

	let IrcMessage::Whisper(whisper) = parse_line(
		"@badges=;color=;display-name=PetsgomOO;message-id=306;thread-id=12345678_87654321;user-id=87654321 :petsgomoo!petsgomoo@petsgomoo.tmi.twitch.tv WHISPER foo :hello",
	)
	.expect("whisper") else {
		panic!("expected whisper");
	};
	assert_eq!(whisper.from_login, "petsgomoo");
	assert_eq!(whisper.thread_id, "12345678_87654321");
	assert_eq!(whisper.text, "hello");
	assert!(whisper.badges.is_empty());
}

#[test]
fn userstate_splits_emote_sets() {
	let IrcMessage::UserState(state) =
		parse_line("@badges=moderator/1;display-name=me;emote-sets=0,33,50;mod=1;subscriber=0 :tmi.twitch.tv USERSTATE #dallas")
			.expect("userstate")
	else {
		panic!("expected userstate");
	};
	assert_eq!(state.emote_sets, vec!["0", "33", "50"]);
	assert!(state.moderator);
	assert_eq!(state.channel, "dallas");
}

#[test]
fn membership_and_server_lines_are_unhandled_noise() {
	for line in [
		":ronni!ronni@ronni.tmi.twitch.tv JOIN #dallas",
		":ronni!ronni@ronni.tmi.twitch.tv PART #dallas",
		":tmi.twitch.tv 001 ronni :Welcome, GLHF!",
		":tmi.twitch.tv CAP * ACK :twitch.tv/membership",
	] {
		let err = parse_line(line).unwrap_err();
		assert!(err.is_unhandled(), "{line}: {err}");
		assert!(is_membership_noise(line), "{line}");
	}

	let err = parse_line(":ronni.tmi.twitch.tv 353 ronni = #dallas :ronni").unwrap_err();
	assert!(err.is_unhandled());
	assert!(!is_membership_noise(":ronni.tmi.twitch.tv 353 ronni = #dallas :ronni"));
}

#[test]
fn malformed_lines_are_fatal_errors() {
	assert_eq!(parse_line("").unwrap_err(), IrcParseError::Empty);
	assert_eq!(parse_line("@a=b").unwrap_err(), IrcParseError::MissingDataAfterTags);
	assert_eq!(parse_line(":nick!u@h").unwrap_err(), IrcParseError::MissingDataAfterPrefix);
	assert_eq!(parse_line(":nick!u@h ").unwrap_err(), IrcParseError::MissingCommand);

	let err = parse_line("@bits=lots :a!a@a PRIVMSG #c :cheer").unwrap_err();
	assert_eq!(
		err,
		IrcParseError::InvalidNumber {
			tag: "bits".to_string(),
			value: "lots".to_string(),
		}
	);
	assert!(!err.is_unhandled());
}

#[test]
fn splits_batched_frame() {
	let frame = "PING :tmi.twitch.tv\r\n:a!a@a PRIVMSG #c :hi\r\n";
	let lines: Vec<&str> = split_lines(frame).collect();
	assert_eq!(lines, vec!["PING :tmi.twitch.tv", ":a!a@a PRIVMSG #c :hi"]);
	assert_eq!(split_lines("\r\n\r\n").count(), 0);
}

#[test]
fn outbound_lines() {
	let channel = ChannelName::new("#Foo").expect("channel");
	assert_eq!(OutboundMessage::Pass(SecretString::new("tok")).to_line(), "PASS oauth:tok");
	assert_eq!(OutboundMessage::Nick("Me".to_string()).to_line(), "NICK Me");
	assert_eq!(
		OutboundMessage::CapReq(chatterm_protocol::version::CHAT_CAPABILITIES.to_string()).to_line(),
		"CAP REQ :twitch.tv/membership twitch.tv/tags twitch.tv/commands"
	);
	assert_eq!(OutboundMessage::Join(channel.clone()).to_line(), "JOIN #foo");
	assert_eq!(OutboundMessage::Part(channel.clone()).to_line(), "PART #foo");
	assert_eq!(OutboundMessage::privmsg(channel, "hi there").to_line(), "PRIVMSG #foo :hi there");
	assert_eq!(OutboundMessage::Pong.to_line(), "PONG");
}

#[test]
fn outbound_text_cannot_smuggle_extra_commands() {
	let channel = ChannelName::new("foo").expect("channel");

	let line = OutboundMessage::privmsg(channel.clone(), "hi\r\nJOIN #evil\nPASS x").to_line();
	assert_eq!(line, "PRIVMSG #foo :hi  JOIN #evil PASS x");
	assert_eq!(split_lines(&line).count(), 1);

	let reply = OutboundMessage::PrivMsg {
		channel,
		text: "ok".to_string(),
		reply_to: Some("p1\r\nPART #foo".to_string()),
	}
	.to_line();
	assert_eq!(reply, "@reply-parent-msg-id=p1  PART #foo PRIVMSG #foo :ok");
	assert!(!reply.contains(['\r', '\n']));

	assert_eq!(OutboundMessage::Nick("me\nJOIN #x".to_string()).to_line(), "NICK me JOIN #x");
}

proptest! {
	#[test]
	fn parse_line_never_panics(line in "\\PC{0,200}") {
		let _ = parse_line(&line);
	}

	#[test]
	fn outbound_privmsg_parses_back(channel in "[a-z0-9_]{1,25}", text in "[a-zA-Z0-9 !?.,]{0,100}") {
		let name = ChannelName::new(channel.clone()).expect("channel");
		let line = OutboundMessage::privmsg(name, text.clone()).to_line();
		let IrcMessage::PrivateMessage(msg) = parse_line(&line).expect("parse") else {
			panic!("expected privmsg");
		};
		prop_assert_eq!(msg.channel, channel);
		prop_assert_eq!(msg.text, text);
	}
}
