pub mod app;
pub mod breaker;
pub mod client;
pub mod config;
pub mod filters;
pub mod http;
pub mod kv;
pub mod lb;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod strng;
pub mod telemetry;
pub mod types;

pub use config::Config;

mod prelude {
	pub use std::fmt::Debug;
	pub use std::net::{IpAddr, SocketAddr};
	pub use std::pin::Pin;
	pub use std::sync::Arc;
	pub use std::task::{Context, Poll, ready};
	pub use std::time::{Duration, Instant};

	pub use anyhow::Context as _;
	pub use bytes::Bytes;
	pub use tracing::{debug, error, info, trace, warn};

	pub use crate::strng;
	pub use crate::strng::Strng;
}

pub(crate) use prelude::*;
