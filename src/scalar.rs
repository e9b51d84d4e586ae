//! The closed set of values legal for observed properties and named
//! values. "Absent" is not a variant here — it is modeled as
//! `Option<Scalar> == None` at every call site that needs it.

use serde::{Deserialize, Serialize};

/// A wire- and checksum-safe scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Str(String),
    Null,
}

impl Scalar {
    /// Render the value the way `Item::checksum`'s deterministic
    /// serialization requires: quoted strings, decimal numbers,
    /// boolean literals, or the literal `null`.
    pub fn encode(value: Option<&Scalar>) -> String {
        match value {
            None => "absent".to_string(),
            Some(Scalar::Null) => "null".to_string(),
            Some(Scalar::Bool(b)) => b.to_string(),
            Some(Scalar::Number(n)) => encode_number(*n),
            Some(Scalar::Str(s)) => format!("{:?}", s),
        }
    }
}

/// Decimal rendering that collapses whole-valued floats like `3.0`
/// down to `3`, otherwise renders the full `f64` precision. Kept
/// simple rather than chasing a "nice" formatter: the only requirement
/// is that equal numbers render identically and unequal numbers
/// render differently.
fn encode_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_distinguishes_absent_and_null() {
        assert_ne!(Scalar::encode(None), Scalar::encode(Some(&Scalar::Null)));
    }

    #[test]
    fn encode_is_stable_for_equal_values() {
        let a = Scalar::Str("x".into());
        let b = Scalar::Str("x".into());
        assert_eq!(Scalar::encode(Some(&a)), Scalar::encode(Some(&b)));
    }

    #[test]
    fn encode_distinguishes_number_from_string() {
        let n = Scalar::Number(3.0);
        let s = Scalar::Str("3".into());
        assert_ne!(Scalar::encode(Some(&n)), Scalar::encode(Some(&s)));
    }

    #[test]
    fn roundtrip_json() {
        for v in [
            Scalar::Bool(true),
            Scalar::Number(42.5),
            Scalar::Str("hi".into()),
            Scalar::Null,
        ] {
            let json = serde_json::to_string(&v).unwrap();
            let back: Scalar = serde_json::from_str(&json).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn rejects_non_scalar_json() {
        let err = serde_json::from_str::<Scalar>("{\"a\":1}");
        assert!(err.is_err());
        let err = serde_json::from_str::<Scalar>("[1,2,3]");
        assert!(err.is_err());
    }
}
