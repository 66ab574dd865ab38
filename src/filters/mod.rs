//! The filter contract and registry.
//!
//! A filter is a pair of hooks over the request context. `request` hooks run
//! in route order before dispatch; `response` hooks run in reverse order, and
//! only for filters whose `request` hook actually ran. Hook invocation is
//! wrapped in an isolation boundary by the proxy engine, so a faulting filter
//! cannot terminate the request.

pub mod builtin;

use std::collections::HashMap;

use crate::proxy::context::RequestContext;
use crate::types::value::{ArgError, Value};
use crate::*;

pub trait Filter: Send + Sync {
	fn request(&self, _ctx: &mut RequestContext) {}
	fn response(&self, _ctx: &mut RequestContext) {}
}

/// Per-route construction context the builder threads through the chain.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
	/// Set once a fail-closed marker appeared earlier in the chain; rate
	/// limit filters constructed after it deny on backend errors.
	pub fail_closed: bool,
}

pub trait FilterSpec: Send + Sync {
	fn name(&self) -> Strng;
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError>;
}

/// Immutable name→spec map constructed at startup; no process-wide
/// singletons, handles are passed down to the builder.
pub struct FilterRegistry {
	specs: HashMap<Strng, Arc<dyn FilterSpec>>,
}

impl FilterRegistry {
	pub fn empty() -> Self {
		Self {
			specs: HashMap::new(),
		}
	}

	pub fn with_defaults() -> Self {
		let mut r = Self::empty();
		for spec in builtin::all() {
			r.register(spec);
		}
		r
	}

	pub fn register(&mut self, spec: Arc<dyn FilterSpec>) {
		self.specs.insert(spec.name(), spec);
	}

	pub fn create(
		&self,
		name: &str,
		args: &[Value],
		bctx: &BuildContext,
	) -> anyhow::Result<Arc<dyn Filter>> {
		let spec = self
			.specs
			.get(name)
			.ok_or_else(|| anyhow::anyhow!("unknown filter {name:?}"))?;
		spec
			.create(args, bctx)
			.map_err(|e| anyhow::anyhow!("filter {name:?}: {e}"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_filter_fails_fast() {
		let reg = FilterRegistry::with_defaults();
		assert!(reg.create("nope", &[], &BuildContext::default()).is_err());
	}

	#[test]
	fn bad_arity_fails_fast() {
		let reg = FilterRegistry::with_defaults();
		assert!(
			reg
				.create("setRequestHeader", &[], &BuildContext::default())
				.is_err()
		);
	}
}
