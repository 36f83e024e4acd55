#![forbid(unsafe_code)]

//! Structural types and the subtype/coercion lattice.
//!
//! Raw types are fully alias-expanded and drive every subtype and coercion
//! check; nominal types are whatever the source wrote and only surface in
//! diagnostics. The pair invariant `raw = expand(nominal)` is maintained by
//! whoever constructs a [`TypePair`].

use std::collections::BTreeMap;
use std::fmt;

use crate::QualifiedName;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Any,
    Void,
    Null,
    Bool,
    Byte,
    Char,
    Int,
    Real,
    String,
    Set(Box<Type>),
    List(Box<Type>),
    Dictionary {
        key: Box<Type>,
        value: Box<Type>,
    },
    Tuple(Vec<Type>),
    Record(BTreeMap<String, Type>),
    Union(Vec<Type>),
    Process(Box<Type>),
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
    },
    Method {
        receiver: Option<Box<Type>>,
        params: Vec<Type>,
        ret: Box<Type>,
    },
    // Unexpanded alias reference; raw types never contain one.
    Nominal(QualifiedName),
}

/// The (nominal, raw) pair threaded through type propagation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypePair {
    pub nominal: Type,
    pub raw: Type,
}

impl TypePair {
    pub fn new(nominal: Type, raw: Type) -> Self {
        TypePair { nominal, raw }
    }

    /// A pair for a structural type that expands to itself.
    pub fn plain(ty: Type) -> Self {
        TypePair {
            nominal: ty.clone(),
            raw: ty,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Coercion {
    None,
    Implicit,
    Explicit,
}

/// Strict structural subtyping: `sub` values are usable wherever `sup`
/// values are expected, with no representation change.
pub fn is_subtype(sup: &Type, sub: &Type) -> bool {
    subtype(sup, sub, Coercion::None)
}

/// Subtyping extended with the implicit coercion lattice char < int < real.
pub fn is_implicit_coercive_subtype(sup: &Type, sub: &Type) -> bool {
    subtype(sup, sub, Coercion::Implicit)
}

/// Subtyping as permitted in explicit conversion contexts; additionally
/// allows numeric narrowing (e.g. real to int).
pub fn is_explicit_coercive_subtype(sup: &Type, sub: &Type) -> bool {
    subtype(sup, sub, Coercion::Explicit)
}

fn numeric_leaf(sup: &Type, sub: &Type, coercion: Coercion) -> bool {
    use Type::{Char, Int, Real};
    match coercion {
        Coercion::None => false,
        Coercion::Implicit => matches!(
            (sup, sub),
            (Int, Char) | (Real, Char) | (Real, Int)
        ),
        Coercion::Explicit => {
            matches!(sup, Char | Int | Real) && matches!(sub, Char | Int | Real)
        }
    }
}

fn subtype(sup: &Type, sub: &Type, coercion: Coercion) -> bool {
    if sup == sub {
        return true;
    }
    if numeric_leaf(sup, sub, coercion) {
        return true;
    }
    match (sup, sub) {
        (Type::Any, _) => true,
        (_, Type::Void) => true,
        // A union on the subtype side must be wholly contained.
        (_, Type::Union(members)) => members.iter().all(|m| subtype(sup, m, coercion)),
        (Type::Union(members), _) => members.iter().any(|m| subtype(m, sub, coercion)),
        (Type::Set(a), Type::Set(b)) => subtype(a, b, coercion),
        (Type::List(a), Type::List(b)) => subtype(a, b, coercion),
        (
            Type::Dictionary { key: ka, value: va },
            Type::Dictionary { key: kb, value: vb },
        ) => subtype(ka, kb, coercion) && subtype(va, vb, coercion),
        (Type::Tuple(a), Type::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| subtype(x, y, coercion))
        }
        // Width subtyping: the subtype record may carry extra fields.
        (Type::Record(a), Type::Record(b)) => a
            .iter()
            .all(|(name, fa)| b.get(name).is_some_and(|fb| subtype(fa, fb, coercion))),
        (Type::Process(a), Type::Process(b)) => subtype(a, b, coercion),
        (
            Type::Function { params: pa, ret: ra },
            Type::Function { params: pb, ret: rb },
        ) => {
            pa.len() == pb.len()
                && pa.iter().zip(pb).all(|(x, y)| subtype(y, x, coercion))
                && subtype(ra, rb, coercion)
        }
        (
            Type::Method { receiver: xa, params: pa, ret: ra },
            Type::Method { receiver: xb, params: pb, ret: rb },
        ) => {
            let receivers = match (xa, xb) {
                (None, None) => true,
                (Some(a), Some(b)) => subtype(b, a, coercion),
                _ => false,
            };
            receivers
                && pa.len() == pb.len()
                && pa.iter().zip(pb).all(|(x, y)| subtype(y, x, coercion))
                && subtype(ra, rb, coercion)
        }
        _ => false,
    }
}

/// Least upper bound of two raw types. Joins through the implicit coercion
/// lattice, so `int ∪ real` is `real` rather than a two-member union.
pub fn union(a: &Type, b: &Type) -> Type {
    if is_implicit_coercive_subtype(a, b) {
        return a.clone();
    }
    if is_implicit_coercive_subtype(b, a) {
        return b.clone();
    }
    let mut members = Vec::new();
    flatten_into(a, &mut members);
    flatten_into(b, &mut members);
    Type::Union(members)
}

fn flatten_into(ty: &Type, members: &mut Vec<Type>) {
    match ty {
        Type::Union(ms) => {
            for m in ms {
                flatten_into(m, members);
            }
        }
        other => {
            if !members.contains(other) {
                members.push(other.clone());
            }
        }
    }
}

/// Projects a raw type onto its set shape, yielding the element type.
pub fn effective_set_type(ty: &Type) -> Option<Type> {
    match ty {
        Type::Set(element) => Some((**element).clone()),
        Type::Union(members) => members
            .iter()
            .map(effective_set_type)
            .try_fold(Type::Void, |acc, e| e.map(|e| union(&acc, &e))),
        _ => None,
    }
}

/// Projects a raw type onto its list shape, yielding the element type.
pub fn effective_list_type(ty: &Type) -> Option<Type> {
    match ty {
        Type::List(element) => Some((**element).clone()),
        Type::Union(members) => members
            .iter()
            .map(effective_list_type)
            .try_fold(Type::Void, |acc, e| e.map(|e| union(&acc, &e))),
        _ => None,
    }
}

/// Projects a raw type onto its dictionary shape as (key, value).
pub fn effective_dict_type(ty: &Type) -> Option<(Type, Type)> {
    match ty {
        Type::Dictionary { key, value } => Some(((**key).clone(), (**value).clone())),
        Type::Union(members) => members.iter().map(effective_dict_type).try_fold(
            (Type::Void, Type::Void),
            |(ak, av), e| e.map(|(k, v)| (union(&ak, &k), union(&av, &v))),
        ),
        _ => None,
    }
}

/// Projects a raw type onto its record shape. For unions this is the set of
/// fields common to every member, each bound to the union of its types.
pub fn effective_record_type(ty: &Type) -> Option<BTreeMap<String, Type>> {
    match ty {
        Type::Record(fields) => Some(fields.clone()),
        Type::Union(members) => {
            let mut iter = members.iter().map(effective_record_type);
            let mut common = iter.next()??;
            for next in iter {
                let next = next?;
                common = common
                    .into_iter()
                    .filter_map(|(name, ty)| {
                        next.get(&name).map(|other| {
                            let joined = union(&ty, other);
                            (name, joined)
                        })
                    })
                    .collect();
            }
            Some(common)
        }
        _ => None,
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "any"),
            Type::Void => write!(f, "void"),
            Type::Null => write!(f, "null"),
            Type::Bool => write!(f, "bool"),
            Type::Byte => write!(f, "byte"),
            Type::Char => write!(f, "char"),
            Type::Int => write!(f, "int"),
            Type::Real => write!(f, "real"),
            Type::String => write!(f, "string"),
            Type::Set(e) => write!(f, "{{{e}}}"),
            Type::List(e) => write!(f, "[{e}]"),
            Type::Dictionary { key, value } => write!(f, "{{{key}->{value}}}"),
            Type::Tuple(elements) => {
                write!(f, "(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Type::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{ty} {name}")?;
                }
                write!(f, "}}")
            }
            Type::Union(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{m}")?;
                }
                Ok(())
            }
            Type::Process(e) => write!(f, "process {e}"),
            Type::Function { params, ret } => {
                write!(f, "{ret}(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
            Type::Method { receiver, params, ret } => {
                if let Some(r) = receiver {
                    write!(f, "{r}::")?;
                }
                write!(f, "{ret}(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
            Type::Nominal(name) => write!(f, "{name}"),
        }
    }
}
