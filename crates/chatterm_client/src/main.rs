#![forbid(unsafe_code)]

mod config;
mod input;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chatterm_domain::{AccountId, ChannelName};
use chatterm_pool::{HelixSubscriptions, Pool, StaticAccounts};
use chatterm_protocol::eventsub::EventSubscription;
use chatterm_protocol::irc::OutboundMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::input::{Command, parse_input};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatterm [--config path] [--account id] [--join channel]... [--no-events]\n\
\n\
Options:\n\
	--config     Config file (default: ~/.chatterm/config.toml)\n\
	--account    Account id to use (overrides `account` in the config)\n\
	--join       Channel to join on startup (repeatable)\n\
	--no-events  Do not subscribe to channel notifications\n\
	--help       Show this help\n\
\n\
Input:\n\
	/join #channel   join and make it the current channel\n\
	/part #channel   leave a channel\n\
	/quit            exit\n\
	anything else    is sent to the current channel\n"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	account: Option<String>,
	channels: Vec<String>,
	events: bool,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		account: None,
		channels: Vec::new(),
		events: true,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--account" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--account must be non-empty");
					usage_and_exit();
				}
				args.account = Some(v.trim().to_string());
			}
			"--join" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if ChannelName::new(v.clone()).is_err() {
					eprintln!("Invalid --join value: {v}");
					usage_and_exit();
				}
				args.channels.push(v);
			}
			"--no-events" => args.events = false,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Logs go to stderr so stdout stays the chat transcript.
fn init_tracing(level: Option<&str>) {
	let filter = std::env::var("RUST_LOG")
		.ok()
		.filter(|v| !v.trim().is_empty())
		.or_else(|| level.map(str::to_string))
		.unwrap_or_else(|| "warn,chatterm_pool=info".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(false)
				.with_writer(std::io::stderr),
		)
		.init();
}

/// Notifications the terminal shows for the account's own channel.
fn event_subscriptions(account_id: &AccountId) -> Vec<EventSubscription> {
	let id = account_id.as_str();
	vec![
		EventSubscription::new("channel.follow", "2")
			.with_condition("broadcaster_user_id", id)
			.with_condition("moderator_user_id", id),
		EventSubscription::new("channel.raid", "1").with_condition("to_broadcaster_user_id", id),
		EventSubscription::new("channel.ad_break.begin", "1").with_condition("broadcaster_user_id", id),
		EventSubscription::new("channel.poll.begin", "1").with_condition("broadcaster_user_id", id),
		EventSubscription::new("channel.poll.end", "1").with_condition("broadcaster_user_id", id),
	]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_client_config_from_path(&config_path)?;
	if let Some(account) = args.account {
		cfg.account = Some(account);
	}

	init_tracing(cfg.log_level.as_deref());
	info!(path = %config_path.display(), "loaded client config (toml + env overrides)");

	let active = cfg.active_account()?.clone();
	let account_id = active.account_id()?;
	let mut channels = active.channel_names()?;
	for raw in &args.channels {
		let channel = ChannelName::new(raw.clone()).with_context(|| format!("invalid channel {raw:?}"))?;
		if !channels.contains(&channel) {
			channels.push(channel);
		}
	}

	let accounts = Arc::new(StaticAccounts::from_accounts(cfg.domain_accounts()?));
	let pool = Pool::new(accounts.clone(), cfg.pool_settings());

	pool.set_sink(|event| {
		if let Some(line) = render::render(&event) {
			println!("{line}");
		}
	});

	pool.attach_chat(&account_id)?;
	for channel in &channels {
		pool.join_channel(&account_id, channel.clone()).await?;
	}
	let mut current = channels.last().cloned();
	info!(account = %account_id, channels = channels.len(), "chat attached");

	if args.events {
		if active.client_id.is_some() {
			let service = Arc::new(HelixSubscriptions::new(account_id.clone(), accounts.clone())?);
			for subscription in event_subscriptions(&account_id) {
				pool.subscribe_event(&account_id, subscription, service.clone()).await?;
			}
		} else {
			warn!(account = %account_id, "no client_id configured; channel notifications disabled");
		}
	}

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		let line = tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			line = lines.next_line() => match line.context("read stdin")? {
				Some(line) => line,
				None => break,
			},
		};

		match parse_input(&line) {
			Ok(None) => {}
			Ok(Some(Command::Quit)) => break,
			Ok(Some(Command::Join(channel))) => {
				pool.join_channel(&account_id, channel.clone()).await?;
				current = Some(channel);
			}
			Ok(Some(Command::Part(channel))) => {
				pool.leave_channel(&account_id, channel.clone()).await?;
				if current.as_ref() == Some(&channel) {
					current = None;
				}
			}
			Ok(Some(Command::Say(text))) => match &current {
				Some(channel) => {
					pool.send_chat(&account_id, OutboundMessage::privmsg(channel.clone(), text))
						.await?
				}
				None => eprintln!("join a channel first (/join #channel)"),
			},
			Err(e) => eprintln!("{e}"),
		}
	}

	pool.detach_chat(&account_id);
	pool.close();
	info!("chatterm exiting");

	Ok(())
}
