//! Debug mode: the response body is replaced with a JSON document describing
//! how the request was handled, preserving the status code.

use std::collections::BTreeMap;

use crate::http::{HeaderMap, Response};
use crate::proxy::context::{OriginalRequest, RequestContext};
use crate::*;

#[derive(serde::Serialize)]
struct RequestView {
	method: String,
	uri: String,
	headers: BTreeMap<String, Vec<String>>,
}

impl From<&OriginalRequest> for RequestView {
	fn from(r: &OriginalRequest) -> Self {
		RequestView {
			method: r.method.to_string(),
			uri: r.uri.to_string(),
			headers: header_map(&r.headers),
		}
	}
}

#[derive(serde::Serialize)]
struct RouteView {
	id: String,
	backend: &'static str,
}

#[derive(serde::Serialize)]
struct DebugDocument {
	#[serde(skip_serializing_if = "Option::is_none")]
	route: Option<RouteView>,
	/// Filters whose request hook actually ran, in execution order.
	filters: Vec<String>,
	incoming: RequestView,
	#[serde(skip_serializing_if = "Option::is_none")]
	outgoing: Option<RequestView>,
	response_status: u16,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	filter_panics: Vec<String>,
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
	let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
	for (name, value) in headers {
		out
			.entry(name.to_string())
			.or_default()
			.push(String::from_utf8_lossy(value.as_bytes()).into_owned());
	}
	out
}

/// Swap the body for the debug report; status and headers stay.
pub fn envelope(ctx: &RequestContext, resp: Response) -> Response {
	let doc = DebugDocument {
		route: ctx.route.as_ref().map(|r| RouteView {
			id: r.id.to_string(),
			backend: r.backend.kind(),
		}),
		filters: ctx.filters_run.iter().map(|f| f.to_string()).collect(),
		incoming: (&ctx.original).into(),
		outgoing: ctx.outgoing.as_ref().map(Into::into),
		response_status: resp.status().as_u16(),
		filter_panics: ctx.panics.clone(),
	};
	let body = serde_json::to_vec_pretty(&doc).unwrap_or_else(|_| b"{}".to_vec());
	let (mut parts, _) = resp.into_parts();
	parts.headers.remove(http::header::CONTENT_LENGTH);
	parts.headers.insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/json"),
	);
	Response::from_parts(parts, http::full_body(body))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::StatusCode;

	#[test]
	fn envelope_preserves_status_and_reports_panics() {
		let req = ::http::Request::builder()
			.uri("http://h/x")
			.header("x-a", "1")
			.body(http::empty_body())
			.unwrap();
		let mut ctx = RequestContext::new(req, None);
		ctx.panics.push("request: boom".to_string());
		let resp = ::http::Response::builder()
			.status(StatusCode::BAD_GATEWAY)
			.body(http::full_body("original"))
			.unwrap();
		let out = envelope(&ctx, resp);
		assert_eq!(out.status(), StatusCode::BAD_GATEWAY);
		assert_eq!(out.headers()[http::header::CONTENT_TYPE], "application/json");
	}
}
