//! Compiled path tree: static segment children, single-segment wildcards, and
//! subtree anchors, with full backtracking over predicate rejection.

use std::collections::HashMap;

use crate::http::Request;
use crate::types::route::{Params, PathSpec, Route, Segment, split_path};
use crate::*;

#[derive(Default)]
struct Node {
	static_children: HashMap<Strng, Node>,
	wildcard: Option<Box<Node>>,
	/// Exact-terminal routes at this node, sorted (weight desc, id asc).
	leafs: Vec<Arc<Route>>,
	/// Subtree and catch-all routes anchored here, sorted the same way.
	subtree: Vec<Arc<Route>>,
}

pub struct PathTree {
	root: Node,
	ignore_trailing_slash: bool,
}

impl PathTree {
	pub fn build(routes: &[Arc<Route>], ignore_trailing_slash: bool) -> PathTree {
		let mut root = Node::default();
		for route in routes {
			insert(&mut root, route.clone());
		}
		sort_node(&mut root);
		PathTree {
			root,
			ignore_trailing_slash,
		}
	}

	/// Never fails; `None` simply means no route matched. All candidate
	/// predicates are re-evaluated on every backtracking step, so they must be
	/// pure.
	pub fn lookup(&self, req: &Request) -> Option<(Arc<Route>, Params)> {
		let path = req.uri().path();
		let (segs, trailing) = split_path(path);
		let route = match_node(
			&self.root,
			&segs,
			0,
			trailing,
			self.ignore_trailing_slash,
			req,
		)?;
		let params = match &route.path {
			Some(spec) => spec
				.matches(path, self.ignore_trailing_slash)
				.unwrap_or_default(),
			None => Params::new(),
		};
		Some((route, params))
	}
}

fn insert(root: &mut Node, route: Arc<Route>) {
	match route.path.clone() {
		None => root.subtree.push(route),
		Some(PathSpec::Subtree { segments }) => {
			let mut node = root;
			for seg in &segments {
				node = node.static_children.entry(seg.clone()).or_default();
			}
			node.subtree.push(route);
		},
		Some(PathSpec::Exact { segments, .. }) => {
			let mut node = root;
			for seg in &segments {
				match seg {
					Segment::Static(s) => {
						node = node.static_children.entry(s.clone()).or_default();
					},
					Segment::Param(_) => {
						node = node.wildcard.get_or_insert_with(Default::default);
					},
					Segment::CatchAll(_) => {
						node.subtree.push(route);
						return;
					},
				}
			}
			node.leafs.push(route);
		},
	}
}

fn sort_node(node: &mut Node) {
	let by_weight_then_id =
		|a: &Arc<Route>, b: &Arc<Route>| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id));
	node.leafs.sort_by(by_weight_then_id);
	node.subtree.sort_by(by_weight_then_id);
	for child in node.static_children.values_mut() {
		sort_node(child);
	}
	if let Some(w) = &mut node.wildcard {
		sort_node(w);
	}
}

/// Depth-first descent preferring static children over the wildcard child.
/// When every candidate in a branch rejects, the walk backs up one segment and
/// retries the alternative at that depth, ending with the subtree anchors on
/// the way out.
fn match_node(
	node: &Node,
	segs: &[&str],
	idx: usize,
	trailing: bool,
	ignore_trailing_slash: bool,
	req: &Request,
) -> Option<Arc<Route>> {
	if idx == segs.len() {
		for route in &node.leafs {
			if !ignore_trailing_slash
				&& let Some(PathSpec::Exact { trailing_slash, .. }) = &route.path
				&& *trailing_slash != trailing
			{
				continue;
			}
			if route.matches_non_path(req) {
				return Some(route.clone());
			}
		}
		return first_accepting(&node.subtree, req);
	}
	if let Some(child) = node.static_children.get(segs[idx])
		&& let Some(hit) = match_node(child, segs, idx + 1, trailing, ignore_trailing_slash, req)
	{
		return Some(hit);
	}
	if let Some(child) = &node.wildcard
		&& let Some(hit) = match_node(child, segs, idx + 1, trailing, ignore_trailing_slash, req)
	{
		return Some(hit);
	}
	first_accepting(&node.subtree, req)
}

fn first_accepting(routes: &[Arc<Route>], req: &Request) -> Option<Arc<Route>> {
	routes
		.iter()
		.find(|r| r.matches_non_path(req))
		.cloned()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::{Method, empty_body};
	use crate::types::route::Backend;

	fn route(id: &str, path: Option<PathSpec>, method: Option<Method>, weight: i32) -> Arc<Route> {
		Arc::new(Route {
			id: strng::new(id),
			weight,
			path,
			host_regexps: vec![],
			method,
			headers_exact: vec![],
			headers_regex: vec![],
			predicates: vec![],
			filters: vec![],
			filter_names: vec![],
			backend: Backend::Shunt,
		})
	}

	fn req(method: Method, uri: &str) -> Request {
		::http::Request::builder()
			.method(method)
			.uri(uri)
			.body(empty_body())
			.unwrap()
	}

	fn id_of(tree: &PathTree, r: &Request) -> Option<String> {
		tree.lookup(r).map(|(route, _)| route.id.to_string())
	}

	#[test]
	fn path_and_method_routing() {
		let routes = vec![
			route(
				"a",
				Some(PathSpec::parse_exact("/x").unwrap()),
				Some(Method::GET),
				0,
			),
			route(
				"b",
				Some(PathSpec::parse_exact("/x").unwrap()),
				Some(Method::POST),
				0,
			),
		];
		let tree = PathTree::build(&routes, false);
		assert_eq!(id_of(&tree, &req(Method::GET, "/x")), Some("a".into()));
		assert_eq!(id_of(&tree, &req(Method::POST, "/x")), Some("b".into()));
		assert_eq!(id_of(&tree, &req(Method::DELETE, "/x")), None);
	}

	#[test]
	fn subtree_yields_to_more_specific_exact_path() {
		let routes = vec![
			route("s", Some(PathSpec::parse_subtree("/api/").unwrap()), None, 0),
			route(
				"e",
				Some(PathSpec::parse_exact("/api/health").unwrap()),
				None,
				0,
			),
		];
		let tree = PathTree::build(&routes, false);
		assert_eq!(
			id_of(&tree, &req(Method::GET, "/api/health")),
			Some("e".into())
		);
		assert_eq!(
			id_of(&tree, &req(Method::GET, "/api/users")),
			Some("s".into())
		);
		assert_eq!(id_of(&tree, &req(Method::GET, "/api")), Some("s".into()));
	}

	#[test]
	fn backtracks_from_static_branch_to_wildcard() {
		// The static branch commits the walker, but its leaf only accepts
		// POST; the wildcard alternative must win for GET.
		let routes = vec![
			route(
				"static-post",
				Some(PathSpec::parse_exact("/a/b").unwrap()),
				Some(Method::POST),
				0,
			),
			route(
				"wildcard-get",
				Some(PathSpec::parse_exact("/a/:x").unwrap()),
				Some(Method::GET),
				0,
			),
		];
		let tree = PathTree::build(&routes, false);
		assert_eq!(
			id_of(&tree, &req(Method::POST, "/a/b")),
			Some("static-post".into())
		);
		let (r, params) = tree.lookup(&req(Method::GET, "/a/b")).unwrap();
		assert_eq!(r.id.as_str(), "wildcard-get");
		assert_eq!(params.get("x").map(String::as_str), Some("b"));
	}

	#[test]
	fn weight_breaks_ties_then_id() {
		let routes = vec![
			route("z-heavy", Some(PathSpec::parse_exact("/x").unwrap()), None, 5),
			route("a-light", Some(PathSpec::parse_exact("/x").unwrap()), None, 0),
			route("b-heavy", Some(PathSpec::parse_exact("/x").unwrap()), None, 5),
		];
		let tree = PathTree::build(&routes, false);
		assert_eq!(id_of(&tree, &req(Method::GET, "/x")), Some("b-heavy".into()));
	}

	#[test]
	fn trailing_slash_policy() {
		let routes = vec![route(
			"r",
			Some(PathSpec::parse_exact("/foo").unwrap()),
			None,
			0,
		)];
		let strict = PathTree::build(&routes, false);
		assert_eq!(id_of(&strict, &req(Method::GET, "/foo")), Some("r".into()));
		assert_eq!(id_of(&strict, &req(Method::GET, "/foo/")), None);
		let lax = PathTree::build(&routes, true);
		assert_eq!(id_of(&lax, &req(Method::GET, "/foo/")), Some("r".into()));
	}

	#[test]
	fn pathless_routes_are_root_catch_alls() {
		let routes = vec![
			route("anything", None, None, 0),
			route("exact", Some(PathSpec::parse_exact("/x").unwrap()), None, 0),
		];
		let tree = PathTree::build(&routes, false);
		assert_eq!(id_of(&tree, &req(Method::GET, "/x")), Some("exact".into()));
		assert_eq!(
			id_of(&tree, &req(Method::GET, "/deep/ly/nested")),
			Some("anything".into())
		);
	}

	#[test]
	fn empty_tree_matches_nothing() {
		let tree = PathTree::build(&[], false);
		assert!(tree.lookup(&req(Method::GET, "/")).is_none());
	}
}
