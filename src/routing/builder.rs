//! Route construction: raw definitions from data clients become immutable
//! `Route` values, post-processed in a fixed order, and assembled into a
//! fresh routing table.

use regex::RegexBuilder;

use crate::filters::{BuildContext, FilterRegistry};
use crate::http::Method;
use crate::lb;
use crate::routing::RoutingTable;
use crate::routing::predicate::PredicateRegistry;
use crate::routing::tree::PathTree;
use crate::types::route::{
	Backend, BackendDefinition, LbBackend, LbEndpoint, NetworkBackend, PathSpec, Route,
	RouteDefinition, SpecInvocation,
};
use crate::*;

/// Filters applied to every route around its own chain.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DefaultFilters {
	pub prepend: Vec<SpecInvocation>,
	pub append: Vec<SpecInvocation>,
}

pub struct RouteBuilder {
	pub predicates: Arc<PredicateRegistry>,
	pub filters: Arc<FilterRegistry>,
	pub ignore_trailing_slash: bool,
	pub default_filters: DefaultFilters,
	/// Consulted before the tree, in list order.
	pub priority_routes: Vec<RouteDefinition>,
}

impl RouteBuilder {
	pub fn new(predicates: Arc<PredicateRegistry>, filters: Arc<FilterRegistry>) -> RouteBuilder {
		RouteBuilder {
			predicates,
			filters,
			ignore_trailing_slash: false,
			default_filters: DefaultFilters::default(),
			priority_routes: Vec::new(),
		}
	}

	/// Build one route. Errors drop the route from the table; the table
	/// build itself carries on.
	pub fn build_route(&self, namespace: &str, def: &RouteDefinition) -> anyhow::Result<Arc<Route>> {
		let id = if namespace.is_empty() {
			def.id.clone()
		} else {
			strng::format!("{namespace}/{}", def.id)
		};

		let mut path: Option<PathSpec> = None;
		let mut host_regexps = Vec::new();
		let mut method: Option<Method> = None;
		let mut headers_exact = Vec::new();
		let mut headers_regex = Vec::new();
		let mut predicates = Vec::new();
		let mut weight = 0i32;

		for p in &def.predicates {
			match p.name.as_str() {
				"Path" => {
					anyhow::ensure!(path.is_none(), "multiple path predicates");
					types::value::expect_args(&p.args, 1)?;
					path = Some(PathSpec::parse_exact(p.args[0].as_str(0)?)?);
				},
				"PathSubtree" => {
					anyhow::ensure!(path.is_none(), "multiple path predicates");
					types::value::expect_args(&p.args, 1)?;
					path = Some(PathSpec::parse_subtree(p.args[0].as_str(0)?)?);
				},
				"Host" => {
					anyhow::ensure!(!p.args.is_empty(), "Host needs at least one pattern");
					for (i, a) in p.args.iter().enumerate() {
						// Hosts are compared case-insensitively on the patched
						// (lowercased, port-stripped) form.
						let re = RegexBuilder::new(a.as_str(i)?)
							.case_insensitive(true)
							.build()?;
						host_regexps.push(re);
					}
				},
				"Method" => {
					types::value::expect_args(&p.args, 1)?;
					method = Some(Method::from_bytes(
						p.args[0].as_str(0)?.to_ascii_uppercase().as_bytes(),
					)?);
				},
				"Header" => {
					types::value::expect_args(&p.args, 2)?;
					headers_exact.push((
						p.args[0].as_str(0)?.parse()?,
						p.args[1].as_str(1)?.parse()?,
					));
				},
				"HeaderRegexp" => {
					types::value::expect_args(&p.args, 2)?;
					headers_regex.push((p.args[0].as_str(0)?.parse()?, p.args[1].as_regex(1)?));
				},
				"Weight" => {
					types::value::expect_args(&p.args, 1)?;
					weight = i32::try_from(p.args[0].as_int(0)?)?;
				},
				_ => predicates.push(self.predicates.create(&p.name, &p.args)?),
			}
		}

		// Fixed post-processing order: the filter chain walk tags fail-closed
		// before the rate-limit filters behind the marker are constructed.
		let mut bctx = BuildContext::default();
		let chain = self
			.default_filters
			.prepend
			.iter()
			.chain(def.filters.iter())
			.chain(self.default_filters.append.iter());
		let mut filters = Vec::new();
		let mut filter_names = Vec::new();
		for f in chain {
			let built = self.filters.create(&f.name, &f.args, &bctx)?;
			if f.name.as_str() == "failClosed" {
				bctx.fail_closed = true;
			}
			filter_names.push(f.name.clone());
			filters.push(built);
		}

		let backend = self.build_backend(&id, &def.backend)?;

		Ok(Arc::new(Route {
			id,
			weight,
			path,
			host_regexps,
			method,
			headers_exact,
			headers_regex,
			predicates,
			filters,
			filter_names,
			backend,
		}))
	}

	fn build_backend(&self, id: &Strng, def: &BackendDefinition) -> anyhow::Result<Backend> {
		Ok(match def {
			BackendDefinition::Network(url) => Backend::Network(NetworkBackend::parse(url)?),
			BackendDefinition::Shunt => Backend::Shunt,
			BackendDefinition::Loopback => Backend::Loopback,
			BackendDefinition::Dynamic => Backend::Dynamic,
			BackendDefinition::Lb {
				algorithm,
				endpoints,
				balance_factor,
			} => {
				anyhow::ensure!(!endpoints.is_empty(), "route {id}: empty LB endpoint list");
				let parsed = endpoints
					.iter()
					.map(|e| LbEndpoint::parse(e))
					.collect::<anyhow::Result<Vec<_>>>()?;
				let endpoints: Arc<[LbEndpoint]> = parsed.into();
				let name = algorithm
					.as_ref()
					.map(|a| a.as_str())
					.unwrap_or(lb::DEFAULT_ALGORITHM);
				let algorithm = lb::create(name, &endpoints, *balance_factor)?;
				Backend::LoadBalanced(LbBackend {
					endpoints,
					algorithm,
				})
			},
		})
	}

	/// Assemble a table from the merged union of all data clients. Routes
	/// failing validation are dropped with a logged error; the rest of the
	/// table still builds.
	pub fn build_table(&self, union: &[(Strng, RouteDefinition)]) -> RoutingTable {
		let mut routes = Vec::with_capacity(union.len());
		let mut dropped = 0usize;
		for (ns, def) in union {
			match self.build_route(ns, def) {
				Ok(r) => routes.push(r),
				Err(e) => {
					dropped += 1;
					error!(route = def.id.as_str(), "dropping invalid route: {e:#}");
				},
			}
		}
		let mut priority = Vec::with_capacity(self.priority_routes.len());
		for def in &self.priority_routes {
			match self.build_route("", def) {
				Ok(r) => priority.push(r),
				Err(e) => {
					dropped += 1;
					error!(route = def.id.as_str(), "dropping invalid priority route: {e:#}");
				},
			}
		}
		let tree = PathTree::build(&routes, self.ignore_trailing_slash);
		RoutingTable::new(
			tree,
			priority,
			routes.len(),
			dropped,
			self.ignore_trailing_slash,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::empty_body;
	use crate::types::value::Value;

	fn builder() -> RouteBuilder {
		RouteBuilder::new(
			Arc::new(PredicateRegistry::with_defaults()),
			Arc::new(FilterRegistry::with_defaults()),
		)
	}

	fn pred(name: &str, args: Vec<Value>) -> SpecInvocation {
		SpecInvocation {
			name: strng::new(name),
			args,
		}
	}

	fn def(id: &str) -> RouteDefinition {
		RouteDefinition {
			id: strng::new(id),
			predicates: vec![],
			filters: vec![],
			backend: BackendDefinition::Shunt,
		}
	}

	#[test]
	fn well_known_predicates_become_shortcuts() {
		let mut d = def("r");
		d.predicates = vec![
			pred("Path", vec![Value::String("/a/:id".into())]),
			pred("Method", vec![Value::String("get".into())]),
			pred("Host", vec![Value::String("^api[.]example[.]org$".into())]),
			pred("Header", vec![Value::String("x-tenant".into()), Value::String("t1".into())]),
			pred("Weight", vec![Value::Int(5)]),
		];
		let r = builder().build_route("ns", &d).unwrap();
		assert_eq!(r.id.as_str(), "ns/r");
		assert!(r.path.is_some());
		assert_eq!(r.method, Some(Method::GET));
		assert_eq!(r.host_regexps.len(), 1);
		assert_eq!(r.headers_exact.len(), 1);
		assert_eq!(r.weight, 5);
		assert!(r.predicates.is_empty());
	}

	#[test]
	fn host_matching_is_case_insensitive() {
		let mut d = def("r");
		d.predicates = vec![pred("Host", vec![Value::String("^api[.]example[.]org$".into())])];
		let r = builder().build_route("", &d).unwrap();
		let req = ::http::Request::builder()
			.uri("http://API.Example.ORG/")
			.body(empty_body())
			.unwrap();
		assert!(r.matches_non_path(&req));
	}

	#[test]
	fn empty_lb_endpoint_list_drops_route() {
		let mut d = def("r");
		d.backend = BackendDefinition::Lb {
			algorithm: None,
			endpoints: vec![],
			balance_factor: None,
		};
		assert!(builder().build_route("", &d).is_err());
		let table = builder().build_table(&[(Strng::default(), d)]);
		assert_eq!(table.route_count(), 0);
	}

	#[test]
	fn malformed_lb_endpoint_drops_route() {
		let mut d = def("r");
		d.backend = BackendDefinition::Lb {
			algorithm: None,
			endpoints: vec!["http://ok.test".into(), ":-(".into()],
			balance_factor: None,
		};
		assert!(builder().build_route("", &d).is_err());
	}

	#[test]
	fn unknown_algorithm_is_an_error() {
		let mut d = def("r");
		d.backend = BackendDefinition::Lb {
			algorithm: Some(strng::literal!("bogus")),
			endpoints: vec!["http://ok.test".into()],
			balance_factor: None,
		};
		assert!(builder().build_route("", &d).is_err());
	}

	#[test]
	fn fail_closed_tags_only_later_ratelimits() {
		let mut d = def("r");
		d.filters = vec![
			SpecInvocation {
				name: strng::literal!("clusterRatelimit"),
				args: vec![
					Value::String("before".into()),
					Value::Int(1),
					Value::String("1s".into()),
				],
			},
			SpecInvocation {
				name: strng::literal!("failClosed"),
				args: vec![],
			},
			SpecInvocation {
				name: strng::literal!("clusterRatelimit"),
				args: vec![
					Value::String("after".into()),
					Value::Int(1),
					Value::String("1s".into()),
				],
			},
		];
		let r = builder().build_route("", &d).unwrap();
		assert_eq!(r.filters.len(), 3);

		// Drive both limit filters and inspect what they recorded: the chain
		// is applied in order, so the last write wins and carries the tag.
		let req = ::http::Request::builder()
			.uri("http://h/")
			.body(empty_body())
			.unwrap();
		let mut ctx = crate::proxy::context::RequestContext::new(req, None);
		r.filters[0].request(&mut ctx);
		let s = ctx
			.state_bag
			.ratelimit(crate::proxy::context::bag_keys::RATELIMIT_SETTINGS)
			.unwrap();
		assert!(!s.fail_closed);
		r.filters[2].request(&mut ctx);
		let s = ctx
			.state_bag
			.ratelimit(crate::proxy::context::bag_keys::RATELIMIT_SETTINGS)
			.unwrap();
		assert!(s.fail_closed);
	}
}
