#![forbid(unsafe_code)]

use std::time::Duration;

use chatterm_domain::AccountId;
use thiserror::Error;

/// Lifecycle errors returned synchronously to callers. Never sent to the sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
	#[error("pool is closed")]
	Closed,

	#[error("sink not set; call set_sink before attaching or subscribing")]
	SinkUnset,

	#[error("no chat connection for account {0}")]
	NoConnection(AccountId),

	#[error("connection closed")]
	ConnectionClosed,
}

/// Transient connection failure, delivered to the sink. The connection keeps retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
	#[error("resolve account: {0}")]
	Account(String),

	#[error("invalid endpoint {url}: {reason}")]
	InvalidEndpoint {
		url: String,
		reason: String,
	},

	#[error("dial {url}: {reason}")]
	Dial {
		url: String,
		reason: String,
	},

	#[error("dial {url}: timed out after {after:?}")]
	DialTimeout {
		url: String,
		after: Duration,
	},

	#[error("authenticate: {0}")]
	Auth(String),

	#[error("read: {0}")]
	Read(String),

	#[error("write: {0}")]
	Write(String),

	#[error("remote closed the connection")]
	RemoteClosed,

	#[error("no keepalive within {0:?}")]
	KeepaliveTimeout(Duration),

	#[error("protocol: {0}")]
	Protocol(String),

	#[error("session handshake: {0}")]
	Handshake(String),

	#[error("create subscription {kind}: {reason}")]
	Subscription {
		kind: String,
		reason: String,
	},
}
