#![forbid(unsafe_code)]

//! Canonical immutable values.
//!
//! Every value is interned: independently constructing two structurally
//! equal values yields the same canonical allocation, so pointer identity
//! implies equality. Values are ordered totally, across kinds as
//! bool < rational < integer < string < set < tuple and within a kind by
//! natural order. Interned values live for the lifetime of the process.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use num_bigint::BigInt;
use num_rational::BigRational;

use crate::types::Type;

#[derive(Clone, Debug)]
pub struct Value(Arc<ValueData>);

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum ValueData {
    Bool(bool),
    Rational(BigRational),
    Integer(BigInt),
    String(String),
    Set(BTreeSet<Value>),
    Tuple(Vec<Value>),
}

static INTERNED: OnceLock<Mutex<HashSet<Value>>> = OnceLock::new();

fn intern(data: ValueData) -> Value {
    let candidate = Value(Arc::new(data));
    let mut table = INTERNED
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match table.get(&candidate) {
        Some(existing) => existing.clone(),
        None => {
            table.insert(candidate.clone());
            candidate
        }
    }
}

impl Value {
    pub fn boolean(value: bool) -> Value {
        intern(ValueData::Bool(value))
    }

    pub fn rational(value: BigRational) -> Value {
        intern(ValueData::Rational(value))
    }

    pub fn integer(value: BigInt) -> Value {
        intern(ValueData::Integer(value))
    }

    pub fn int(value: i64) -> Value {
        Value::integer(BigInt::from(value))
    }

    pub fn string(value: impl Into<String>) -> Value {
        intern(ValueData::String(value.into()))
    }

    pub fn set(values: impl IntoIterator<Item = Value>) -> Value {
        intern(ValueData::Set(values.into_iter().collect()))
    }

    pub fn tuple(values: Vec<Value>) -> Value {
        intern(ValueData::Tuple(values))
    }

    pub fn data(&self) -> &ValueData {
        &self.0
    }

    /// True when both handles point at the same canonical allocation.
    pub fn same(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The structural type of this value.
    pub fn type_of(&self) -> Type {
        match self.data() {
            ValueData::Bool(_) => Type::Bool,
            ValueData::Rational(_) => Type::Real,
            ValueData::Integer(_) => Type::Int,
            ValueData::String(_) => Type::String,
            ValueData::Set(vs) => {
                let element = vs
                    .iter()
                    .map(Value::type_of)
                    .fold(Type::Void, |acc, t| crate::types::union(&acc, &t));
                Type::Set(Box::new(element))
            }
            ValueData::Tuple(vs) => Type::Tuple(vs.iter().map(Value::type_of).collect()),
        }
    }

    pub fn add(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Rational(a), ValueData::Rational(b)) => Some(Value::rational(a + b)),
            (ValueData::Integer(a), ValueData::Integer(b)) => Some(Value::integer(a + b)),
            _ => None,
        }
    }

    pub fn sub(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Rational(a), ValueData::Rational(b)) => Some(Value::rational(a - b)),
            (ValueData::Integer(a), ValueData::Integer(b)) => Some(Value::integer(a - b)),
            _ => None,
        }
    }

    pub fn mul(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Rational(a), ValueData::Rational(b)) => Some(Value::rational(a * b)),
            (ValueData::Integer(a), ValueData::Integer(b)) => Some(Value::integer(a * b)),
            _ => None,
        }
    }

    /// Division; a zero divisor is the caller's responsibility.
    pub fn div(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Rational(a), ValueData::Rational(b)) => Some(Value::rational(a / b)),
            (ValueData::Integer(a), ValueData::Integer(b)) => Some(Value::integer(a / b)),
            _ => None,
        }
    }

    pub fn remainder(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Integer(a), ValueData::Integer(b)) => Some(Value::integer(a % b)),
            _ => None,
        }
    }

    pub fn union(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Set(a), ValueData::Set(b)) => {
                Some(Value::set(a.iter().chain(b.iter()).cloned()))
            }
            _ => None,
        }
    }

    pub fn intersect(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Set(a), ValueData::Set(b)) => {
                Some(Value::set(a.iter().filter(|v| b.contains(*v)).cloned()))
            }
            _ => None,
        }
    }

    pub fn difference(&self, other: &Value) -> Option<Value> {
        match (self.data(), other.data()) {
            (ValueData::Set(a), ValueData::Set(b)) => {
                Some(Value::set(a.iter().filter(|v| !b.contains(*v)).cloned()))
            }
            _ => None,
        }
    }

    pub fn insert(&self, element: Value) -> Option<Value> {
        match self.data() {
            ValueData::Set(a) => {
                let mut values = a.clone();
                values.insert(element);
                Some(intern(ValueData::Set(values)))
            }
            _ => None,
        }
    }

    pub fn remove(&self, element: &Value) -> Option<Value> {
        match self.data() {
            ValueData::Set(a) => {
                let mut values = a.clone();
                values.remove(element);
                Some(intern(ValueData::Set(values)))
            }
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self.data() {
            ValueData::Bool(_) => 0,
            ValueData::Rational(_) => 1,
            ValueData::Integer(_) => 2,
            ValueData::String(_) => 3,
            ValueData::Set(_) => 4,
            ValueData::Tuple(_) => 5,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.same(other) || self.0 == other.0
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> Ordering {
        if self.same(other) {
            return Ordering::Equal;
        }
        match (self.data(), other.data()) {
            (ValueData::Bool(a), ValueData::Bool(b)) => a.cmp(b),
            (ValueData::Rational(a), ValueData::Rational(b)) => a.cmp(b),
            (ValueData::Integer(a), ValueData::Integer(b)) => a.cmp(b),
            (ValueData::String(a), ValueData::String(b)) => a.cmp(b),
            (ValueData::Set(a), ValueData::Set(b)) => {
                // Size first; membership is unordered, but BTreeSet iterates
                // its elements in sorted order, so positional comparison is
                // well defined.
                a.len().cmp(&b.len()).then_with(|| a.iter().cmp(b.iter()))
            }
            (ValueData::Tuple(a), ValueData::Tuple(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.iter().cmp(b.iter()))
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data() {
            ValueData::Bool(true) => write!(f, "true"),
            ValueData::Bool(false) => write!(f, "false"),
            ValueData::Rational(v) => write!(f, "{v}"),
            ValueData::Integer(v) => write!(f, "{v}"),
            ValueData::String(v) => write!(f, "\"{v}\""),
            ValueData::Set(vs) => {
                write!(f, "{{")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            ValueData::Tuple(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}
