#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use chatterm_domain::{Account, AccountId, ChannelName, SecretString};
use chatterm_pool::PoolSettings;
use chatterm_util::endpoint::validate_ws_endpoint;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatterm/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatterm").join("config.toml"))
}

/// Load the client config from TOML and env overrides.
pub fn load_client_config_from_path(path: &Path) -> anyhow::Result<ClientConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.validate()?;

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
	/// Log filter used when `RUST_LOG` is unset.
	pub log_level: Option<String>,
	/// Account to attach on startup; the first configured account otherwise.
	pub account: Option<String>,
	pub endpoints: EndpointSettings,
	pub accounts: Vec<AccountSettings>,
}

/// Optional overrides for the service endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointSettings {
	pub chat_url: Option<String>,
	pub eventsub_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccountSettings {
	pub id: String,
	pub display_name: String,
	pub access_token: SecretString,
	pub client_id: Option<String>,
	/// Channels joined right after attaching.
	pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	log_level: Option<String>,
	account: Option<String>,

	#[serde(default)]
	endpoints: FileEndpointSettings,

	#[serde(default)]
	accounts: Vec<FileAccountSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEndpointSettings {
	chat_url: Option<String>,
	eventsub_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileAccountSettings {
	id: String,
	display_name: Option<String>,
	access_token: Option<String>,
	client_id: Option<String>,

	#[serde(default)]
	channels: Vec<String>,
}

impl ClientConfig {
	fn from_file(file: FileConfig) -> Self {
		let accounts = file
			.accounts
			.into_iter()
			.filter(|a| !a.id.trim().is_empty())
			.map(|a| AccountSettings {
				display_name: a
					.display_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| a.id.clone()),
				id: a.id,
				access_token: SecretString::new(a.access_token.unwrap_or_default()),
				client_id: a.client_id.filter(|s| !s.trim().is_empty()),
				channels: a.channels.into_iter().filter(|c| !c.trim().is_empty()).collect(),
			})
			.collect();

		Self {
			log_level: file.log_level.filter(|s| !s.trim().is_empty()),
			account: file.account.filter(|s| !s.trim().is_empty()),
			endpoints: EndpointSettings {
				chat_url: file.endpoints.chat_url.filter(|s| !s.trim().is_empty()),
				eventsub_url: file.endpoints.eventsub_url.filter(|s| !s.trim().is_empty()),
			},
			accounts,
		}
	}

	fn validate(&self) -> anyhow::Result<()> {
		if let Some(url) = self.endpoints.chat_url.as_deref() {
			validate_ws_endpoint(url).map_err(|e| anyhow!("endpoints.chat_url: {e}"))?;
		}
		if let Some(url) = self.endpoints.eventsub_url.as_deref() {
			validate_ws_endpoint(url).map_err(|e| anyhow!("endpoints.eventsub_url: {e}"))?;
		}
		for account in &self.accounts {
			if account.access_token.expose().trim().is_empty() {
				warn!(account = %account.id, "account has no access_token; chat authentication will fail");
			}
		}
		Ok(())
	}

	/// Production pool settings with the configured endpoint overrides.
	pub fn pool_settings(&self) -> PoolSettings {
		let mut settings = PoolSettings::default();
		if let Some(url) = self.endpoints.chat_url.clone() {
			settings.chat_url = url;
		}
		if let Some(url) = self.endpoints.eventsub_url.clone() {
			settings.eventsub_url = url;
		}
		settings
	}

	/// The account selected by `account`, or the first one configured.
	pub fn active_account(&self) -> anyhow::Result<&AccountSettings> {
		match self.account.as_deref() {
			Some(id) => self
				.accounts
				.iter()
				.find(|a| a.id == id)
				.ok_or_else(|| anyhow!("account {id} is not configured")),
			None => self.accounts.first().ok_or_else(|| anyhow!("no accounts configured")),
		}
	}

	pub fn domain_accounts(&self) -> anyhow::Result<Vec<Account>> {
		self.accounts.iter().map(AccountSettings::to_account).collect()
	}
}

impl AccountSettings {
	pub fn account_id(&self) -> anyhow::Result<AccountId> {
		AccountId::new(self.id.clone()).with_context(|| format!("invalid account id {:?}", self.id))
	}

	pub fn to_account(&self) -> anyhow::Result<Account> {
		let mut account = Account::new(self.account_id()?, self.display_name.clone(), self.access_token.clone());
		if let Some(client_id) = self.client_id.clone() {
			account = account.with_client_id(client_id);
		}
		Ok(account)
	}

	pub fn channel_names(&self) -> anyhow::Result<Vec<ChannelName>> {
		self.channels
			.iter()
			.map(|c| ChannelName::new(c.clone()).with_context(|| format!("invalid channel {c:?} for account {}", self.id)))
			.collect()
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ClientConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
	if let Some(v) = var("CHATTERM_LOG") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.log_level = Some(v);
			info!("client config: log_level overridden by env");
		}
	}

	if let Some(v) = var("CHATTERM_ACCOUNT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.account = Some(v);
			info!("client config: account overridden by env");
		}
	}

	if let Some(v) = var("CHATTERM_CHAT_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.endpoints.chat_url = Some(v);
			info!("client config: chat_url overridden by env");
		}
	}

	if let Some(v) = var("CHATTERM_EVENTSUB_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.endpoints.eventsub_url = Some(v);
			info!("client config: eventsub_url overridden by env");
		}
	}
}
