//! Cheaply clonable string type used for route ids, names, and keys.

pub use arcstr::{ArcStr as Strng, format, literal};

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_and_literal_compare_equal() {
		assert_eq!(new("x"), literal!("x"));
	}
}
