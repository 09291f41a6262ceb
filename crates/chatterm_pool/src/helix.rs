#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chatterm_domain::AccountId;
use chatterm_protocol::eventsub::{CreateSubscriptionRequest, CreateSubscriptionResponse};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::debug;
use url::Url;

use crate::{AccountProvider, SubscriptionService};

pub const DEFAULT_HELIX_URL: &str = "https://api.twitch.tv";
const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// One retry on 429 (when the server says how long to wait) or 5xx. Auth failures never retry.
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		debug!(label, delay_ms = delay.as_millis() as u64, "helix rate limited; retrying once");
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		debug!(label, %status, "helix server error; retrying once");
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Registers event subscriptions over the REST API on behalf of one account.
///
/// Credentials are read from the [`AccountProvider`] on every call.
#[derive(Clone)]
pub struct HelixSubscriptions {
	http: reqwest::Client,
	base_url: Url,
	account_id: AccountId,
	accounts: Arc<dyn AccountProvider>,
}

impl HelixSubscriptions {
	pub fn new(account_id: AccountId, accounts: Arc<dyn AccountProvider>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("chatterm/0.x (eventsub-ws)")
			.build()
			.context("build reqwest client")?;
		let base_url = Url::parse(DEFAULT_HELIX_URL).context("parse helix base url")?;

		Ok(Self {
			http,
			base_url,
			account_id,
			accounts,
		})
	}

	pub fn with_base_url(mut self, base_url: Url) -> Self {
		self.base_url = base_url;
		self
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}
}

#[async_trait::async_trait]
impl SubscriptionService for HelixSubscriptions {
	async fn create_subscription(&self, request: CreateSubscriptionRequest) -> anyhow::Result<CreateSubscriptionResponse> {
		let kind = request.subscription.kind.clone();
		let account = self
			.accounts
			.account_by(&self.account_id)
			.with_context(|| format!("resolve credentials for {}", self.account_id))?;
		let client_id = account
			.client_id
			.as_deref()
			.filter(|s| !s.trim().is_empty())
			.with_context(|| format!("account {} has no client id", account.id))?;

		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let req = self
			.http
			.post(url)
			.header("Client-Id", client_id)
			.header("Authorization", format!("Bearer {}", account.access_token.expose()))
			.json(&request);

		let resp = send_with_retry(req, "POST /helix/eventsub/subscriptions")
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={body}");
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={body}");
		}

		serde_json::from_str(&body).with_context(|| format!("helix create subscription parse json (type={kind})"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::StaticAccounts;
	use chatterm_domain::{Account, SecretString};
	use chatterm_protocol::eventsub::EventSubscription;
	use reqwest::header::HeaderValue;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;
	use tokio::sync::mpsc;

	const CREATED: &str = r#"{"data":[{"id":"sub-1","status":"enabled","type":"channel.follow","version":"2","cost":0,"condition":{"broadcaster_user_id":"1"},"transport":{"method":"websocket","session_id":"sess-1"},"created_at":"2024-01-01T00:00:00Z"}],"total":1,"total_cost":0,"max_total_cost":10}"#;

	/// Serves one canned response per connection and reports each raw request.
	async fn http_stub(responses: Vec<(u16, &'static str)>) -> (Url, mpsc::UnboundedReceiver<String>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("addr");
		let (tx, rx) = mpsc::unbounded_channel();

		tokio::spawn(async move {
			for (status, body) in responses {
				let Ok((mut stream, _)) = listener.accept().await else {
					return;
				};
				let request = read_request(&mut stream).await;
				let _ = tx.send(request);
				let reply = format!(
					"HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
					body.len()
				);
				let _ = stream.write_all(reply.as_bytes()).await;
				let _ = stream.shutdown().await;
			}
		});

		(Url::parse(&format!("http://{addr}")).expect("url"), rx)
	}

	async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
		let mut buf = Vec::new();
		let mut chunk = [0u8; 4096];
		loop {
			let n = stream.read(&mut chunk).await.unwrap_or(0);
			if n == 0 {
				break;
			}
			buf.extend_from_slice(&chunk[..n]);

			let text = String::from_utf8_lossy(&buf).to_string();
			if let Some(head_end) = text.find("\r\n\r\n") {
				let content_length = text[..head_end]
					.lines()
					.find_map(|l| {
						let (name, value) = l.split_once(':')?;
						name.eq_ignore_ascii_case("content-length")
							.then(|| value.trim().parse::<usize>().ok())
							.flatten()
					})
					.unwrap_or(0);
				if buf.len() >= head_end + 4 + content_length {
					break;
				}
			}
		}
		String::from_utf8_lossy(&buf).to_string()
	}

	fn service(base: Url, client_id: Option<&str>) -> HelixSubscriptions {
		let id = AccountId::new("42").unwrap();
		let mut account = Account::new(id.clone(), "tester", SecretString::new("tok"));
		if let Some(client_id) = client_id {
			account = account.with_client_id(client_id);
		}
		let accounts = Arc::new(StaticAccounts::from_accounts([account]));
		HelixSubscriptions::new(id, accounts).unwrap().with_base_url(base)
	}

	fn request() -> CreateSubscriptionRequest {
		CreateSubscriptionRequest::with_session(
			EventSubscription::new("channel.follow", "2").with_condition("broadcaster_user_id", "1"),
			"sess-1",
		)
	}

	#[test]
	fn retry_after_header_wins() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("1"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(3)));
	}

	#[test]
	fn ratelimit_reset_in_future_gives_delay() {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
		let mut headers = HeaderMap::new();
		headers.insert("Ratelimit-Reset", HeaderValue::from_str(&(now + 30).to_string()).unwrap());
		let delay = retry_delay_from_headers(&headers).unwrap();
		assert!(delay <= Duration::from_secs(30) && delay >= Duration::from_secs(28));
	}

	#[test]
	fn no_headers_no_retry() {
		assert_eq!(retry_delay_from_headers(&HeaderMap::new()), None);

		let mut headers = HeaderMap::new();
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("1"));
		assert_eq!(retry_delay_from_headers(&headers), None);
	}

	#[tokio::test]
	async fn create_subscription_posts_session_transport_with_credentials() {
		let (base, mut requests) = http_stub(vec![(202, CREATED)]).await;
		let helix = service(base, Some("cid"));

		let resp = helix.create_subscription(request()).await.expect("created");
		assert_eq!(resp.data.len(), 1);
		assert_eq!(resp.max_total_cost, 10);

		let raw = requests.recv().await.expect("request seen");
		let lower = raw.to_ascii_lowercase();
		assert!(raw.starts_with("POST /helix/eventsub/subscriptions "));
		assert!(lower.contains("client-id: cid"));
		assert!(lower.contains("authorization: bearer tok"));
		assert!(raw.contains(r#""type":"channel.follow""#));
		assert!(raw.contains(r#""method":"websocket""#));
		assert!(raw.contains(r#""session_id":"sess-1""#));
	}

	#[tokio::test]
	async fn server_error_is_retried_once() {
		let (base, mut requests) = http_stub(vec![(503, "{}"), (202, CREATED)]).await;
		let helix = service(base, Some("cid"));

		helix.create_subscription(request()).await.expect("created after retry");
		assert!(requests.recv().await.is_some());
		assert!(requests.recv().await.is_some());
	}

	#[tokio::test]
	async fn conflict_is_an_error_with_body() {
		let (base, _requests) = http_stub(vec![(409, r#"{"message":"subscription already exists"}"#)]).await;
		let helix = service(base, Some("cid"));

		let err = helix.create_subscription(request()).await.unwrap_err();
		let msg = format!("{err:#}");
		assert!(msg.contains("conflict"), "{msg}");
		assert!(msg.contains("already exists"), "{msg}");
	}

	#[tokio::test]
	async fn unauthorized_is_not_retried() {
		let (base, mut requests) = http_stub(vec![(401, "bad token"), (202, CREATED)]).await;
		let helix = service(base, Some("cid"));

		let err = helix.create_subscription(request()).await.unwrap_err();
		assert!(format!("{err:#}").contains("auth failed"));
		assert!(requests.recv().await.is_some());
		assert!(requests.try_recv().is_err());
	}

	#[tokio::test]
	async fn missing_client_id_fails_before_sending() {
		let (base, mut requests) = http_stub(vec![(202, CREATED)]).await;
		let helix = service(base, None);

		let err = helix.create_subscription(request()).await.unwrap_err();
		assert!(err.to_string().contains("client id"));
		assert!(requests.try_recv().is_err());
	}
}
