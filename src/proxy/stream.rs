//! Response body passthrough: frames are handed to the client as soon as they
//! arrive (nothing is buffered beyond the transport's own read buffer), with
//! stream-failure accounting, endpoint inflight bookkeeping, and the deferred
//! access log line.

use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project_lite::pin_project;

use crate::http::{Body, BoxError};
use crate::telemetry::log::AccessLog;
use crate::telemetry::metrics::Metrics;
use crate::types::route::Route;
use crate::*;

/// Decrements the chosen LB endpoint's inflight counter when the response
/// finishes (or is abandoned).
pub struct InflightGuard {
	route: Arc<Route>,
	endpoint: usize,
}

impl InflightGuard {
	/// The caller has already incremented the counter.
	pub fn new(route: Arc<Route>, endpoint: usize) -> InflightGuard {
		InflightGuard { route, endpoint }
	}

	pub fn note_failure(&self) {
		if let types::route::Backend::LoadBalanced(lb) = &self.route.backend {
			let now = std::time::SystemTime::now()
				.duration_since(std::time::UNIX_EPOCH)
				.unwrap_or_default()
				.as_millis() as u64;
			lb.endpoints[self.endpoint].metrics.note_failure(now);
		}
	}
}

impl Drop for InflightGuard {
	fn drop(&mut self) {
		if let types::route::Backend::LoadBalanced(lb) = &self.route.backend {
			lb.endpoints[self.endpoint].metrics.end_request();
		}
	}
}

pin_project! {
	pub struct StreamBody {
		#[pin]
		inner: Body,
		metrics: Arc<Metrics>,
		guard: Option<InflightGuard>,
		log: Option<AccessLog>,
		failed: bool,
	}

	impl PinnedDrop for StreamBody {
		fn drop(this: Pin<&mut Self>) {
			let this = this.project();
			if let Some(log) = this.log.take() {
				log.emit();
			}
			// guard drops here, releasing the endpoint slot
		}
	}
}

impl StreamBody {
	pub fn new(
		inner: Body,
		metrics: Arc<Metrics>,
		guard: Option<InflightGuard>,
		log: Option<AccessLog>,
	) -> StreamBody {
		StreamBody {
			inner,
			metrics,
			guard,
			log,
			failed: false,
		}
	}
}

impl HttpBody for StreamBody {
	type Data = Bytes;
	type Error = BoxError;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		match ready!(this.inner.poll_frame(cx)) {
			Some(Err(e)) => {
				// Fatal to this response, not to the process. No retry.
				if !*this.failed {
					*this.failed = true;
					this.metrics.streaming_errors.inc();
					if let Some(g) = this.guard.as_ref() {
						g.note_failure();
					}
					warn!("response streaming failed: {e}");
				}
				Poll::Ready(Some(Err(e)))
			},
			other => Poll::Ready(other),
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}
