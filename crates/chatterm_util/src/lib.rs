#![forbid(unsafe_code)]

pub mod endpoint {
	use url::Url;

	/// Parsed `ws://` or `wss://` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub struct WsEndpoint {
		url: Url,
	}

	impl WsEndpoint {
		/// Parse a websocket endpoint string (`wss://host[:port][/path][?query]`).
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected wss://host[:port][/path])".to_string());
			}

			let url = Url::parse(s).map_err(|e| format!("invalid endpoint {s}: {e}"))?;

			match url.scheme() {
				"ws" | "wss" => {}
				other => return Err(format!("invalid endpoint scheme {other:?} (expected ws or wss): {s}")),
			}

			if url.host_str().is_none_or(str::is_empty) {
				return Err(format!("invalid endpoint host (expected wss://host[:port]): {s}"));
			}

			if url.port() == Some(0) {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			if url.fragment().is_some() {
				return Err(format!("invalid endpoint (fragments are not allowed): {s}"));
			}

			if !url.username().is_empty() || url.password().is_some() {
				return Err(format!("invalid endpoint (credentials must not be embedded in the url): {s}"));
			}

			Ok(Self { url })
		}

		pub fn is_tls(&self) -> bool {
			self.url.scheme() == "wss"
		}

		/// Returns `host:port`, using the scheme default when no port is given.
		pub fn hostport(&self) -> String {
			let host = self.url.host_str().unwrap_or_default();
			match self.url.port_or_known_default() {
				Some(port) => format!("{host}:{port}"),
				None => host.to_string(),
			}
		}

		pub fn as_url(&self) -> &Url {
			&self.url
		}

		pub fn into_url(self) -> Url {
			self.url
		}
	}

	/// Validate a `ws://` / `wss://` endpoint.
	pub fn validate_ws_endpoint(s: &str) -> Result<(), String> {
		let _ = WsEndpoint::parse(s)?;
		Ok(())
	}

}
