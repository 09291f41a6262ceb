#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use chatterm_domain::{AccountId, ChannelName};
use chatterm_protocol::irc::{self, IrcMessage, OutboundMessage};
use chatterm_protocol::version::CHAT_CAPABILITIES;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConnectionError, PoolError};
use crate::settings::PoolSettings;
use crate::ws::{Ws, WsConnector};
use crate::{AccountProvider, EventSink, PoolEvent};

type WsSink = tokio::sync::Mutex<SplitSink<Ws, Message>>;

#[derive(Debug, Default)]
struct ChatState {
	/// Join order is kept so rejoins go out in the same order.
	channels: Vec<ChannelName>,
	refs: usize,
	closed: bool,
}

/// Shared collaborators a connection needs to run.
#[derive(Clone)]
pub(crate) struct ConnDeps {
	pub(crate) accounts: Arc<dyn AccountProvider>,
	pub(crate) sink: EventSink,
	pub(crate) settings: Arc<PoolSettings>,
	pub(crate) connector: WsConnector,
}

/// One account's chat session, reconnecting in the background until closed.
pub(crate) struct ChatConnection {
	account_id: AccountId,
	cancel: CancellationToken,
	send_tx: mpsc::Sender<OutboundMessage>,
	state: Arc<Mutex<ChatState>>,
}

impl ChatConnection {
	/// Create the connection and spawn its reconnect loop.
	pub(crate) fn start(account_id: AccountId, deps: ConnDeps) -> Self {
		let (send_tx, send_rx) = mpsc::channel(deps.settings.queue_capacity.max(1));
		let cancel = CancellationToken::new();
		let state = Arc::new(Mutex::new(ChatState::default()));

		let runner = ChatRunner {
			account_id: account_id.clone(),
			cancel: cancel.clone(),
			state: state.clone(),
			deps,
		};
		tokio::spawn(runner.run(send_rx));

		Self {
			account_id,
			cancel,
			send_tx,
			state,
		}
	}

	pub(crate) fn inc_ref(&self) -> usize {
		let mut state = self.state.lock();
		state.refs += 1;
		state.refs
	}

	pub(crate) fn dec_ref(&self) -> usize {
		let mut state = self.state.lock();
		state.refs = state.refs.saturating_sub(1);
		state.refs
	}

	pub(crate) fn ref_count(&self) -> usize {
		self.state.lock().refs
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.state.lock().closed
	}

	pub(crate) fn channels(&self) -> Vec<ChannelName> {
		self.state.lock().channels.clone()
	}

	/// Queue a message. Waits while the queue is full unless the connection closes.
	pub(crate) async fn send(&self, message: OutboundMessage) -> Result<(), PoolError> {
		if self.is_closed() {
			return Err(PoolError::ConnectionClosed);
		}

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => Err(PoolError::ConnectionClosed),
			res = self.send_tx.send(message) => res.map_err(|_| PoolError::ConnectionClosed),
		}
	}

	/// Remember `channel` for rejoin and queue a `JOIN`.
	pub(crate) async fn join_channel(&self, channel: ChannelName) -> Result<(), PoolError> {
		{
			let mut state = self.state.lock();
			if state.closed {
				return Err(PoolError::ConnectionClosed);
			}
			if !state.channels.contains(&channel) {
				state.channels.push(channel.clone());
			}
		}

		self.send(OutboundMessage::Join(channel)).await
	}

	/// Forget `channel` and queue a `PART`.
	pub(crate) async fn leave_channel(&self, channel: ChannelName) -> Result<(), PoolError> {
		{
			let mut state = self.state.lock();
			if state.closed {
				return Err(PoolError::ConnectionClosed);
			}
			state.channels.retain(|c| c != &channel);
		}

		self.send(OutboundMessage::Part(channel)).await
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
		info!(account_id = %self.account_id, conn = "irc", "chat connection closed");
	}
}

impl Drop for ChatConnection {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

struct ChatRunner {
	account_id: AccountId,
	cancel: CancellationToken,
	state: Arc<Mutex<ChatState>>,
	deps: ConnDeps,
}

impl ChatRunner {
	async fn run(self, mut send_rx: mpsc::Receiver<OutboundMessage>) {
		let mut attempt: u64 = 0;

		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			let result = tokio::select! {
				_ = self.cancel.cancelled() => break,
				res = self.connect_once(attempt, &mut send_rx) => res,
			};
			attempt = attempt.saturating_add(1);

			match result {
				Ok(()) => {
					debug!(account_id = %self.account_id, conn = "irc", "outbound queue closed; stopping");
					break;
				}
				Err(err) => {
					warn!(account_id = %self.account_id, conn = "irc", error = %err, "chat connection error, will reconnect");
					self.emit(PoolEvent::ChatError {
						account_id: self.account_id.clone(),
						error: err,
					})
					.await;
				}
			}

			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = sleep(self.deps.settings.reconnect_backoff) => {
					metrics::counter!("chatterm_irc_reconnects_total").increment(1);
					info!(account_id = %self.account_id, conn = "irc", attempt, "reconnecting");
				}
			}
		}

		info!(account_id = %self.account_id, conn = "irc", "chat connection stopped");
	}

	async fn emit(&self, event: PoolEvent) {
		if !self.deps.sink.send(event, &self.cancel).await {
			debug!(account_id = %self.account_id, conn = "irc", "sink unavailable; event dropped");
		}
	}

	async fn dial(&self) -> Result<Ws, ConnectionError> {
		let raw = &self.deps.settings.chat_url;
		let url = Url::parse(raw).map_err(|e| ConnectionError::InvalidEndpoint {
			url: raw.clone(),
			reason: e.to_string(),
		})?;

		let after = self.deps.settings.dial_timeout;
		match timeout(after, (self.deps.connector)(url)).await {
			Ok(Ok(ws)) => Ok(ws),
			Ok(Err(e)) => Err(ConnectionError::Dial {
				url: raw.clone(),
				reason: format!("{e:#}"),
			}),
			Err(_) => Err(ConnectionError::DialTimeout { url: raw.clone(), after }),
		}
	}

	/// Dial, authenticate, rejoin, then serve until one of the session loops stops.
	async fn connect_once(&self, attempt: u64, send_rx: &mut mpsc::Receiver<OutboundMessage>) -> Result<(), ConnectionError> {
		let ws = self.dial().await?;
		let (sink, mut stream) = ws.split();
		let sink: WsSink = tokio::sync::Mutex::new(sink);

		let result = self.session(attempt, &sink, &mut stream, send_rx).await;

		let _ = sink.lock().await.close().await;
		result
	}

	async fn session(
		&self,
		attempt: u64,
		sink: &WsSink,
		stream: &mut SplitStream<Ws>,
		send_rx: &mut mpsc::Receiver<OutboundMessage>,
	) -> Result<(), ConnectionError> {
		self.authenticate(sink).await?;

		// Queued JOINs for channels rejoined here are skipped by the write loop.
		let mut joined = self.rejoin(sink).await?;

		info!(account_id = %self.account_id, conn = "irc", attempt, channels = joined.len(), "chat connected");

		let (pong_tx, mut pong_rx) = mpsc::channel::<()>(1);
		let pong = Notify::new();

		tokio::select! {
			res = self.read_loop(stream, &pong_tx, &pong) => res,
			res = self.write_loop(sink, send_rx, &mut pong_rx, &mut joined) => res,
			res = self.keepalive_loop(sink, &pong) => res,
		}
	}

	async fn authenticate(&self, sink: &WsSink) -> Result<(), ConnectionError> {
		let account = self
			.deps
			.accounts
			.account_by(&self.account_id)
			.map_err(|e| ConnectionError::Account(format!("{e:#}")))?;

		let lines = [
			OutboundMessage::Pass(account.access_token),
			OutboundMessage::Nick(account.display_name),
			OutboundMessage::CapReq(CHAT_CAPABILITIES.to_string()),
		];

		let mut sink = sink.lock().await;
		for line in lines {
			sink.send(Message::text(line.to_line()))
				.await
				.map_err(|e| ConnectionError::Auth(e.to_string()))?;
		}
		Ok(())
	}

	/// Join every recorded channel in join order; returns the channels now joined on this socket.
	async fn rejoin(&self, sink: &WsSink) -> Result<HashSet<ChannelName>, ConnectionError> {
		let channels = self.state.lock().channels.clone();
		let mut joined = HashSet::with_capacity(channels.len());
		if channels.is_empty() {
			return Ok(joined);
		}

		let mut sink = sink.lock().await;
		for channel in channels {
			let line = OutboundMessage::Join(channel.clone()).to_line();
			sink.send(Message::text(line))
				.await
				.map_err(|e| ConnectionError::Write(format!("rejoin: {e}")))?;
			joined.insert(channel);
		}
		Ok(joined)
	}

	async fn read_loop(
		&self,
		stream: &mut SplitStream<Ws>,
		pong_tx: &mpsc::Sender<()>,
		pong: &Notify,
	) -> Result<(), ConnectionError> {
		loop {
			let Some(frame) = stream.next().await else {
				return Err(ConnectionError::RemoteClosed);
			};
			let frame = frame.map_err(|e| ConnectionError::Read(e.to_string()))?;

			match frame {
				Message::Text(text) => self.handle_frame(&text, pong_tx).await?,
				Message::Pong(_) => pong.notify_one(),
				Message::Close(frame) => {
					debug!(account_id = %self.account_id, conn = "irc", ?frame, "server closed chat socket");
					return Err(ConnectionError::RemoteClosed);
				}
				_ => {}
			}
		}
	}

	async fn handle_frame(&self, frame: &str, pong_tx: &mpsc::Sender<()>) -> Result<(), ConnectionError> {
		for line in irc::split_lines(frame) {
			let message = match irc::parse_line(line) {
				Ok(m) => m,
				Err(e) if e.is_unhandled() => {
					if !irc::is_membership_noise(line) {
						debug!(account_id = %self.account_id, conn = "irc", line, "unhandled chat command");
					}
					continue;
				}
				Err(e) => return Err(ConnectionError::Protocol(format!("parse chat line: {e}"))),
			};

			if let IrcMessage::Ping(_) = message {
				// a pong is already pending if this fails
				let _ = pong_tx.try_send(());
				continue;
			}

			self.emit(PoolEvent::ChatMessage {
				account_id: self.account_id.clone(),
				message,
			})
			.await;
		}
		Ok(())
	}

	/// Pending `PONG`s always go out before queued consumer messages.
	async fn write_loop(
		&self,
		sink: &WsSink,
		send_rx: &mut mpsc::Receiver<OutboundMessage>,
		pong_rx: &mut mpsc::Receiver<()>,
		joined: &mut HashSet<ChannelName>,
	) -> Result<(), ConnectionError> {
		loop {
			let msg = tokio::select! {
				biased;
				Some(()) = pong_rx.recv() => OutboundMessage::Pong,
				msg = send_rx.recv() => match msg {
					Some(msg) => msg,
					None => return Ok(()),
				},
			};

			match &msg {
				OutboundMessage::Join(channel) if !joined.insert(channel.clone()) => {
					debug!(account_id = %self.account_id, conn = "irc", %channel, "already joined on this socket; JOIN skipped");
					continue;
				}
				OutboundMessage::Part(channel) => {
					joined.remove(channel);
				}
				_ => {}
			}
			if !matches!(msg, OutboundMessage::Pong) {
				debug!(account_id = %self.account_id, conn = "irc", line = %msg, "chat send");
			}

			sink.lock()
				.await
				.send(Message::text(msg.to_line()))
				.await
				.map_err(|e| ConnectionError::Write(e.to_string()))?;
		}
	}

	/// Websocket-level ping on a fixed cadence; a missing pong ends the session.
	async fn keepalive_loop(&self, sink: &WsSink, pong: &Notify) -> Result<(), ConnectionError> {
		let every = self.deps.settings.keepalive_interval;
		let wait = self.deps.settings.keepalive_timeout;
		let mut ticker = interval_at(Instant::now() + every, every);

		loop {
			ticker.tick().await;

			let waiter = pong.notified();
			tokio::pin!(waiter);
			waiter.as_mut().enable();

			sink.lock()
				.await
				.send(Message::Ping(Default::default()))
				.await
				.map_err(|e| ConnectionError::Write(format!("ping: {e}")))?;

			if timeout(wait, waiter).await.is_err() {
				return Err(ConnectionError::KeepaliveTimeout(wait));
			}
		}
	}
}
