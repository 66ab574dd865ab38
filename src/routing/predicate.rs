//! Route predicates: pure accept/reject functions over a request, plus the
//! registry that constructs per-route instances from argument lists.
//!
//! The well-known matcher predicates (`Path`, `PathSubtree`, `Host`, `Method`,
//! `Header`, `HeaderRegexp`, `Weight`) are extracted into route shortcut
//! fields by the builder and never become `Predicate` instances; the registry
//! owns everything else.

use std::collections::HashMap;

use regex::Regex;

use crate::http::Request;
use crate::types::value::{ArgError, Value, arg, expect_args};
use crate::*;

/// Must be pure: lookup backtracking may evaluate a predicate several times
/// for one request.
pub trait Predicate: Send + Sync + Debug {
	fn matches(&self, req: &Request) -> bool;
}

pub trait PredicateSpec: Send + Sync {
	fn name(&self) -> Strng;
	fn create(&self, args: &[Value]) -> Result<Arc<dyn Predicate>, ArgError>;
}

/// Immutable name→spec map, constructed at startup and borrowed by the route
/// builder.
pub struct PredicateRegistry {
	specs: HashMap<Strng, Arc<dyn PredicateSpec>>,
}

impl PredicateRegistry {
	pub fn empty() -> Self {
		Self {
			specs: HashMap::new(),
		}
	}

	pub fn with_defaults() -> Self {
		let mut r = Self::empty();
		r.register(Arc::new(QueryParamSpec));
		r.register(Arc::new(ConstSpec(true)));
		r.register(Arc::new(ConstSpec(false)));
		r
	}

	pub fn register(&mut self, spec: Arc<dyn PredicateSpec>) {
		self.specs.insert(spec.name(), spec);
	}

	pub fn create(&self, name: &str, args: &[Value]) -> anyhow::Result<Arc<dyn Predicate>> {
		let spec = self
			.specs
			.get(name)
			.ok_or_else(|| anyhow::anyhow!("unknown predicate {name:?}"))?;
		spec
			.create(args)
			.map_err(|e| anyhow::anyhow!("predicate {name:?}: {e}"))
	}
}

/// `QueryParam("key")` requires presence; `QueryParam("key", "^v$")` matches
/// the value against a regex.
struct QueryParamSpec;

#[derive(Debug)]
struct QueryParam {
	key: String,
	value: Option<Regex>,
}

impl PredicateSpec for QueryParamSpec {
	fn name(&self) -> Strng {
		strng::literal!("QueryParam")
	}
	fn create(&self, args: &[Value]) -> Result<Arc<dyn Predicate>, ArgError> {
		if args.is_empty() || args.len() > 2 {
			return Err(ArgError::Arity {
				expected: 1,
				got: args.len(),
			});
		}
		let key = arg(args, 0, 1)?.as_str(0)?.to_string();
		let value = match args.get(1) {
			Some(v) => Some(v.as_regex(1)?),
			None => None,
		};
		Ok(Arc::new(QueryParam { key, value }))
	}
}

impl Predicate for QueryParam {
	fn matches(&self, req: &Request) -> bool {
		let Some(query) = req.uri().query() else {
			return false;
		};
		query
			.split('&')
			.filter_map(|kv| {
				let mut it = kv.splitn(2, '=');
				Some((it.next()?, it.next().unwrap_or("")))
			})
			.any(|(k, v)| {
				k == self.key
					&& match &self.value {
						Some(re) => re.is_match(v),
						None => true,
					}
			})
	}
}

/// `True()` / `False()`: constant predicates, useful for weighting and for
/// disabling a route without deleting it.
struct ConstSpec(bool);

#[derive(Debug)]
struct Const(bool);

impl PredicateSpec for ConstSpec {
	fn name(&self) -> Strng {
		if self.0 {
			strng::literal!("True")
		} else {
			strng::literal!("False")
		}
	}
	fn create(&self, args: &[Value]) -> Result<Arc<dyn Predicate>, ArgError> {
		expect_args(args, 0)?;
		Ok(Arc::new(Const(self.0)))
	}
}

impl Predicate for Const {
	fn matches(&self, _req: &Request) -> bool {
		self.0
	}
}
