//! The runtime value model.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// A value on the interpreter's operand stack or in a variable store.
///
/// Arrays are shared: cloning a `Variant::Array` clones the handle, not the
/// elements, so an in-place element store is observed through every copy of
/// the array that scripts are holding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    /// The value of unset variables and of frames that exit without a result.
    #[default]
    Nil,
    Int(i32),
    Double(f64),
    Str(String),
    Array(Rc<RefCell<Vec<Variant>>>),
}

/// Two numeric operands after promotion; mixed int/double promotes to double.
#[derive(Clone, Copy, Debug)]
pub enum NumericPair {
    Int(i32, i32),
    Double(f64, f64),
}

impl Variant {
    pub fn array(items: Vec<Variant>) -> Variant {
        Variant::Array(Rc::new(RefCell::new(items)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Variant::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Variant::Int(_) | Variant::Double(_))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Variant::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Variant::Int(v) => Some(*v as f64),
            Variant::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Variant::Nil => false,
            Variant::Int(v) => *v != 0,
            Variant::Double(v) => *v != 0.0,
            Variant::Str(s) => !s.is_empty(),
            Variant::Array(items) => !items.borrow().is_empty(),
        }
    }

    /// Promote a pair of operands for arithmetic or comparison; `None` when
    /// either operand is non-numeric.
    pub fn numeric_pair(a: &Variant, b: &Variant) -> Option<NumericPair> {
        match (a, b) {
            (Variant::Int(x), Variant::Int(y)) => Some(NumericPair::Int(*x, *y)),
            (Variant::Int(x), Variant::Double(y)) => Some(NumericPair::Double(*x as f64, *y)),
            (Variant::Double(x), Variant::Int(y)) => Some(NumericPair::Double(*x, *y as f64)),
            (Variant::Double(x), Variant::Double(y)) => Some(NumericPair::Double(*x, *y)),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Nil => "undefined",
            Variant::Int(_) => "int",
            Variant::Double(_) => "double",
            Variant::Str(_) => "string",
            Variant::Array(_) => "array",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Nil => write!(f, "undefined"),
            Variant::Int(v) => write!(f, "{v}"),
            Variant::Double(v) => write!(f, "{v}"),
            Variant::Str(s) => write!(f, "{s}"),
            Variant::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::Str(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Variant::Nil.truthy());
        assert!(!Variant::Int(0).truthy());
        assert!(!Variant::Double(0.0).truthy());
        assert!(!Variant::from("").truthy());
        assert!(!Variant::array(vec![]).truthy());

        assert!(Variant::Int(-3).truthy());
        assert!(Variant::Double(0.5).truthy());
        assert!(Variant::from("x").truthy());
        assert!(Variant::array(vec![Variant::Nil]).truthy());
    }

    #[test]
    fn numeric_promotion() {
        match Variant::numeric_pair(&Variant::Int(2), &Variant::Double(0.5)) {
            Some(NumericPair::Double(a, b)) => {
                assert_eq!(a, 2.0);
                assert_eq!(b, 0.5);
            }
            other => panic!("expected double pair, got {other:?}"),
        }
        assert!(Variant::numeric_pair(&Variant::Int(1), &Variant::from("1")).is_none());
    }

    #[test]
    fn arrays_share_storage() {
        let a = Variant::array(vec![Variant::Int(1)]);
        let b = a.clone();
        if let Variant::Array(items) = &a {
            items.borrow_mut()[0] = Variant::Int(9);
        }
        if let Variant::Array(items) = &b {
            assert_eq!(items.borrow()[0], Variant::Int(9));
        }
    }

    #[test]
    fn display_coercion() {
        assert_eq!(Variant::Nil.to_string(), "undefined");
        assert_eq!(Variant::Int(42).to_string(), "42");
        assert_eq!(Variant::from("hi").to_string(), "hi");
        let arr = Variant::array(vec![Variant::Int(1), Variant::from("two")]);
        assert_eq!(arr.to_string(), "[1, two]");
    }
}
