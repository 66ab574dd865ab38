//! Listening surface: accept loop, optional TLS termination, HTTP/1.1 + h2
//! serving, and per-connection keep-alive limits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use rustls_pemfile::Item;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::config::ListenConfig;
use crate::http::{HeaderValue, header};
use crate::proxy::engine::ProxyEngine;
use crate::telemetry::metrics::{CloseLabels, Metrics};
use crate::*;

pub struct Server {
	cfg: ListenConfig,
	engine: ProxyEngine,
	metrics: Arc<Metrics>,
	shutdown: tokio::sync::watch::Receiver<bool>,
}

struct ConnState {
	requests: AtomicU64,
	started: Instant,
	closing: AtomicBool,
	close_reason: parking_lot::Mutex<&'static str>,
}

impl Server {
	pub fn new(
		cfg: ListenConfig,
		engine: ProxyEngine,
		metrics: Arc<Metrics>,
		shutdown: tokio::sync::watch::Receiver<bool>,
	) -> Server {
		Server {
			cfg,
			engine,
			metrics,
			shutdown,
		}
	}

	pub async fn run(mut self) -> anyhow::Result<()> {
		let listener = TcpListener::bind(self.cfg.address).await?;
		let tls = self.tls_acceptor()?;
		info!(
			address = %self.cfg.address,
			tls = tls.is_some(),
			"listening"
		);

		let mut conns = JoinSet::new();
		loop {
			tokio::select! {
				_ = self.shutdown.changed() => {
					info!("shutdown requested, draining connections");
					break;
				}
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(a) => a,
						Err(e) => {
							warn!("accept failed: {e}");
							continue;
						},
					};
					let engine = self.engine.clone();
					let metrics = self.metrics.clone();
					let cfg = self.cfg.clone();
					let tls = tls.clone();
					conns.spawn(async move {
						handle_connection(stream, peer, engine, metrics, cfg, tls).await;
					});
				}
				// Reap finished connections so the set stays bounded.
				Some(_) = conns.join_next(), if !conns.is_empty() => {}
			}
		}

		let drain = async {
			while conns.join_next().await.is_some() {}
		};
		if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
			warn!("drain deadline reached, aborting remaining connections");
			conns.abort_all();
		}
		Ok(())
	}

	fn tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
		let (Some(cert), Some(key)) = (&self.cfg.tls_cert, &self.cfg.tls_key) else {
			return Ok(None);
		};
		let certs = parse_certs(&std::fs::read(cert)?)?;
		let key = parse_key(&std::fs::read(key)?)?;
		let config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(certs, key)?;
		Ok(Some(TlsAcceptor::from(Arc::new(config))))
	}
}

pub fn parse_certs(
	mut pem: &[u8],
) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
	let mut reader = std::io::BufReader::new(std::io::Cursor::new(&mut pem));
	let parsed: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	parsed?
		.into_iter()
		.map(|item| match item {
			Item::X509Certificate(der) => Ok(der),
			_ => Err(anyhow::anyhow!("no certificate")),
		})
		.collect()
}

pub fn parse_key(mut pem: &[u8]) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
	let mut reader = std::io::BufReader::new(std::io::Cursor::new(&mut pem));
	let parsed = rustls_pemfile::read_one(&mut reader)?;
	match parsed.ok_or_else(|| anyhow::anyhow!("no key"))? {
		Item::Pkcs8Key(k) => Ok(rustls::pki_types::PrivateKeyDer::Pkcs8(k)),
		Item::Pkcs1Key(k) => Ok(rustls::pki_types::PrivateKeyDer::Pkcs1(k)),
		Item::Sec1Key(k) => Ok(rustls::pki_types::PrivateKeyDer::Sec1(k)),
		_ => Err(anyhow::anyhow!("unsupported key")),
	}
}

async fn handle_connection(
	stream: tokio::net::TcpStream,
	peer: SocketAddr,
	engine: ProxyEngine,
	metrics: Arc<Metrics>,
	cfg: ListenConfig,
	tls: Option<TlsAcceptor>,
) {
	metrics.connections_opened.inc();
	metrics.connections_active.inc();
	let state = Arc::new(ConnState {
		requests: AtomicU64::new(0),
		started: Instant::now(),
		closing: AtomicBool::new(false),
		close_reason: parking_lot::Mutex::new("eof"),
	});

	let is_tls = tls.is_some();
	let service = {
		let state = state.clone();
		service_fn(move |req| {
			let engine = engine.clone();
			let state = state.clone();
			let cfg = cfg.clone();
			async move {
				let mut resp = engine.handle(req, Some(peer), is_tls).await;
				let n = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
				let over_requests = cfg
					.max_keepalive_requests
					.map(|max| n >= max)
					.unwrap_or(false);
				let over_age = cfg
					.max_keepalive_duration
					.map(|max| state.started.elapsed() >= max)
					.unwrap_or(false);
				if over_requests || over_age {
					// Signal the client to reconnect; h2 ignores the header
					// and is limited by the accept loop instead.
					resp
						.headers_mut()
						.insert(header::CONNECTION, HeaderValue::from_static("close"));
					if !state.closing.swap(true, Ordering::Relaxed) {
						*state.close_reason.lock() = if over_requests {
							"keepalive_requests"
						} else {
							"keepalive_age"
						};
					}
				}
				Ok::<_, std::convert::Infallible>(resp)
			}
		})
	};

	let served = match tls {
		Some(acceptor) => match acceptor.accept(stream).await {
			Ok(stream) => {
				auto::Builder::new(TokioExecutor::new())
					.serve_connection_with_upgrades(TokioIo::new(stream), service)
					.await
			},
			Err(e) => {
				debug!(%peer, "tls handshake failed: {e}");
				*state.close_reason.lock() = "tls_handshake";
				Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
			},
		},
		None => {
			auto::Builder::new(TokioExecutor::new())
				.serve_connection_with_upgrades(TokioIo::new(stream), service)
				.await
		},
	};

	let reason = if let Err(e) = served {
		if state.closing.load(Ordering::Relaxed) {
			*state.close_reason.lock()
		} else {
			debug!(%peer, "connection error: {e}");
			"error"
		}
	} else {
		*state.close_reason.lock()
	};
	metrics.connections_active.dec();
	metrics
		.connections_closed
		.get_or_create(&CloseLabels {
			reason: reason.to_string(),
		})
		.inc();
}
