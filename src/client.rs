//! Shared HTTP client for backend calls: one hyper pool for the whole proxy,
//! with a bounded idle set per host and an idle-close period.

use http_body_util::BodyExt;
use hyper_util::client::legacy;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::http::{Body, Request, Response};
use crate::proxy::ProxyError;
use crate::*;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ClientConfig {
	/// Skip TLS verification for backends.
	pub insecure: bool,
	#[serde(with = "crate::config::serde_duration")]
	pub close_idle_period: Duration,
	pub max_idle_per_host: usize,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			insecure: false,
			close_idle_period: Duration::from_secs(20),
			max_idle_per_host: 64,
		}
	}
}

#[derive(Clone)]
pub struct Client {
	client: legacy::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

impl Client {
	pub fn new(cfg: &ClientConfig) -> anyhow::Result<Client> {
		let tls = if cfg.insecure {
			rustls::ClientConfig::builder()
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(danger::NoVerify))
				.with_no_client_auth()
		} else {
			let mut roots = rustls::RootCertStore::empty();
			for cert in load_system_roots()? {
				// Individual unparsable system certs are skipped.
				let _ = roots.add(cert);
			}
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		};
		let mut http = HttpConnector::new();
		http.enforce_http(false);
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_tls_config(tls)
			.https_or_http()
			.enable_http1()
			.enable_http2()
			.wrap_connector(http);
		let client = legacy::Client::builder(TokioExecutor::new())
			.timer(TokioTimer::new())
			.pool_idle_timeout(cfg.close_idle_period)
			.pool_max_idle_per_host(cfg.max_idle_per_host)
			.build(https);
		Ok(Client { client })
	}

	/// Forward a fully mapped request. The deadline covers connect and the
	/// response head; body streaming is separately cancellable by the client
	/// connection.
	pub async fn call(&self, req: Request, deadline: Option<Duration>) -> Result<Response, ProxyError> {
		let start = Instant::now();
		let method = req.method().clone();
		let uri = req.uri().clone();
		let fut = self.client.request(req);
		let res = match deadline {
			Some(d) => match tokio::time::timeout(d, fut).await {
				Ok(r) => r,
				Err(_) => return Err(ProxyError::BackendTimeout),
			},
			None => fut.await,
		};
		let resp = res.map_err(|e| ProxyError::BackendNetwork(e.to_string()))?;
		trace!(
			method = %method,
			uri = %uri,
			status = resp.status().as_u16(),
			duration_ms = start.elapsed().as_millis() as u64,
			"upstream request"
		);
		Ok(resp.map(|b| Body::new(b.map_err(|e| Box::new(e) as http::BoxError))))
	}
}

fn load_system_roots() -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
	let result = rustls_native_certs::load_native_certs();
	if result.certs.is_empty() && !result.errors.is_empty() {
		anyhow::bail!("no usable system trust roots: {:?}", result.errors);
	}
	Ok(result.certs)
}

mod danger {
	use rustls::DigitallySignedStruct;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any backend certificate; only used with the `insecure` option.
	#[derive(Debug)]
	pub struct NoVerify;

	impl ServerCertVerifier for NoVerify {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			rustls::crypto::ring::default_provider()
				.signature_verification_algorithms
				.supported_schemes()
		}
	}
}
