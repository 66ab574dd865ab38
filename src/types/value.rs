//! Tagged argument values for predicate and filter construction.
//!
//! Route definitions carry heterogeneous argument lists; specs validate arity
//! and variant tags up front and fail fast, so a bad route never reaches the
//! serving table.

use regex::Regex;

use crate::*;

#[derive(Debug, Clone)]
pub enum Value {
	String(String),
	Int(i64),
	Float(f64),
	Duration(Duration),
	Regex(Regex),
	Bytes(Bytes),
	List(Vec<Value>),
}

#[derive(thiserror::Error, Debug)]
pub enum ArgError {
	#[error("expected {expected} arguments, got {got}")]
	Arity { expected: usize, got: usize },
	#[error("argument {index}: expected {expected}")]
	Type {
		index: usize,
		expected: &'static str,
	},
	#[error("argument {index}: {reason}")]
	Invalid { index: usize, reason: String },
}

impl Value {
	pub fn as_str(&self, index: usize) -> Result<&str, ArgError> {
		match self {
			Value::String(s) => Ok(s),
			_ => Err(ArgError::Type {
				index,
				expected: "string",
			}),
		}
	}

	pub fn as_int(&self, index: usize) -> Result<i64, ArgError> {
		match self {
			Value::Int(i) => Ok(*i),
			Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
			_ => Err(ArgError::Type {
				index,
				expected: "integer",
			}),
		}
	}

	pub fn as_float(&self, index: usize) -> Result<f64, ArgError> {
		match self {
			Value::Int(i) => Ok(*i as f64),
			Value::Float(f) => Ok(*f),
			_ => Err(ArgError::Type {
				index,
				expected: "number",
			}),
		}
	}

	/// Durations are written either as an integer (seconds) or a
	/// human-readable string like `"200ms"`.
	pub fn as_duration(&self, index: usize) -> Result<Duration, ArgError> {
		match self {
			Value::Duration(d) => Ok(*d),
			Value::Int(secs) if *secs >= 0 => Ok(Duration::from_secs(*secs as u64)),
			Value::String(s) => duration_str::parse(s).map_err(|e| ArgError::Invalid {
				index,
				reason: e.to_string(),
			}),
			_ => Err(ArgError::Type {
				index,
				expected: "duration",
			}),
		}
	}

	pub fn as_regex(&self, index: usize) -> Result<Regex, ArgError> {
		match self {
			Value::Regex(r) => Ok(r.clone()),
			Value::String(s) => Regex::new(s).map_err(|e| ArgError::Invalid {
				index,
				reason: e.to_string(),
			}),
			_ => Err(ArgError::Type {
				index,
				expected: "regex",
			}),
		}
	}
}

/// Fetch argument `index` or fail with an arity error.
pub fn arg(args: &[Value], index: usize, expected: usize) -> Result<&Value, ArgError> {
	args.get(index).ok_or(ArgError::Arity {
		expected,
		got: args.len(),
	})
}

/// Exact arity check for specs with a fixed argument count.
pub fn expect_args(args: &[Value], expected: usize) -> Result<(), ArgError> {
	if args.len() != expected {
		return Err(ArgError::Arity {
			expected,
			got: args.len(),
		});
	}
	Ok(())
}

impl serde::Serialize for Value {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Value::String(s) => serializer.serialize_str(s),
			Value::Int(i) => serializer.serialize_i64(*i),
			Value::Float(f) => serializer.serialize_f64(*f),
			Value::Duration(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
			Value::Regex(r) => serializer.serialize_str(r.as_str()),
			Value::Bytes(b) => serializer.serialize_bytes(b),
			Value::List(l) => l.serialize(serializer),
		}
	}
}

impl<'de> serde::Deserialize<'de> for Value {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(serde::Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Int(i64),
			Float(f64),
			String(String),
			List(Vec<Raw>),
		}
		fn conv(raw: Raw) -> Value {
			match raw {
				Raw::Int(i) => Value::Int(i),
				Raw::Float(f) => Value::Float(f),
				Raw::String(s) => Value::String(s),
				Raw::List(l) => Value::List(l.into_iter().map(conv).collect()),
			}
		}
		Ok(conv(Raw::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duration_accepts_int_and_string() {
		assert_eq!(
			Value::Int(2).as_duration(0).unwrap(),
			Duration::from_secs(2)
		);
		assert_eq!(
			Value::String("250ms".into()).as_duration(0).unwrap(),
			Duration::from_millis(250)
		);
		assert!(Value::Float(1.5).as_duration(0).is_err());
	}

	#[test]
	fn arity_errors() {
		let args = vec![Value::Int(1)];
		assert!(arg(&args, 1, 2).is_err());
		assert!(expect_args(&args, 1).is_ok());
		assert!(expect_args(&args, 2).is_err());
	}

	#[test]
	fn untagged_deserialization() {
		let v: Vec<Value> = serde_json::from_str(r#"["/x", 3, 1.5, ["a"]]"#).unwrap();
		assert!(matches!(&v[0], Value::String(s) if s == "/x"));
		assert!(matches!(v[1], Value::Int(3)));
		assert!(matches!(v[2], Value::Float(f) if f == 1.5));
		assert!(matches!(&v[3], Value::List(l) if l.len() == 1));
	}
}
