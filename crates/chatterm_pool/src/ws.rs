#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials a websocket. Swappable so tests can observe or fail dials.
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<Ws>> + Send + Sync>;

async fn connect(url: Url, max_message_size: usize) -> anyhow::Result<Ws> {
	let config = WebSocketConfig::default()
		.max_message_size(Some(max_message_size))
		.max_frame_size(Some(max_message_size));

	let (ws, _resp) = tokio_tungstenite::connect_async_with_config(url.as_str(), Some(config), false)
		.await
		.with_context(|| format!("connect_async to {url}"))?;
	Ok(ws)
}

/// `connect_async` with a read limit.
pub fn default_connector(max_message_size: usize) -> WsConnector {
	Arc::new(move |url: Url| {
		Box::pin(async move { connect(url, max_message_size).await }) as BoxFuture<'static, anyhow::Result<Ws>>
	})
}
