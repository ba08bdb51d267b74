//! Runtime values
//!
//! A [`Value`] is either an immediate (nil, booleans, fixnums, floats,
//! symbols, class references) or a shared reference to a heap cell.
//! Heap cells use `Arc` plus a `parking_lot::Mutex` where they are mutable,
//! so values can be cloned freely into registers, caches and closures.

use crate::vm::frame::Block;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Largest integer stored as a fixnum.
pub const FIXNUM_MAX: i64 = (1 << 62) - 1;
/// Smallest integer stored as a fixnum.
pub const FIXNUM_MIN: i64 = -(1 << 62);

/// Identifier of a class owned by the object model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// An interned method, variable or constant name.
///
/// Symbols compare by content; cloning only bumps a reference count.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::new(name)
    }
}

impl serde::Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    True,
    False,
    /// Integer within `FIXNUM_MIN..=FIXNUM_MAX`
    Fixnum(i64),
    Float(f64),
    /// Integer outside the fixnum range
    Bignum(Arc<BigInt>),
    Symbol(Symbol),
    Str(Arc<Mutex<String>>),
    Array(Arc<Mutex<Vec<Value>>>),
    Hash(Arc<Mutex<RHash>>),
    Range(Arc<RRange>),
    Object(Arc<RObject>),
    Class(ClassId),
    Proc(Arc<RProc>),
}

/// Core kinds whose basic operations the dispatch loop inlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreKind {
    Integer = 0,
    Float = 1,
    String = 2,
    Symbol = 3,
    Array = 4,
    Hash = 5,
    Nil = 6,
    True = 7,
    False = 8,
}

impl CoreKind {
    pub fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

impl Value {
    /// Build an integer, promoting to a bignum outside the fixnum range.
    pub fn int(n: i64) -> Value {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&n) {
            Value::Fixnum(n)
        } else {
            Value::Bignum(Arc::new(BigInt::from(n)))
        }
    }

    /// Build an integer from a wide intermediate result.
    pub fn int_wide(n: i128) -> Value {
        if n >= FIXNUM_MIN as i128 && n <= FIXNUM_MAX as i128 {
            Value::Fixnum(n as i64)
        } else {
            Value::Bignum(Arc::new(BigInt::from(n)))
        }
    }

    /// Build an integer from a bignum, demoting it when it fits a fixnum.
    pub fn from_bigint(n: BigInt) -> Value {
        match n.to_i64() {
            Some(small) if (FIXNUM_MIN..=FIXNUM_MAX).contains(&small) => Value::Fixnum(small),
            _ => Value::Bignum(Arc::new(n)),
        }
    }

    pub fn bool(b: bool) -> Value {
        if b {
            Value::True
        } else {
            Value::False
        }
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Arc::new(Mutex::new(s.into())))
    }

    pub fn sym(name: &str) -> Value {
        Value::Symbol(Symbol::new(name))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn hash(hash: RHash) -> Value {
        Value::Hash(Arc::new(Mutex::new(hash)))
    }

    pub fn range(low: Value, high: Value, exclude_end: bool) -> Value {
        Value::Range(Arc::new(RRange {
            low,
            high,
            exclude_end,
        }))
    }

    /// Everything except `nil` and `false` is true.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Kind used to check basic-operation redefinition.
    ///
    /// Instances of user classes have no core kind.
    pub fn core_kind(&self) -> Option<CoreKind> {
        match self {
            Value::Fixnum(_) | Value::Bignum(_) => Some(CoreKind::Integer),
            Value::Float(_) => Some(CoreKind::Float),
            Value::Str(_) => Some(CoreKind::String),
            Value::Symbol(_) => Some(CoreKind::Symbol),
            Value::Array(_) => Some(CoreKind::Array),
            Value::Hash(_) => Some(CoreKind::Hash),
            Value::Nil => Some(CoreKind::Nil),
            Value::True => Some(CoreKind::True),
            Value::False => Some(CoreKind::False),
            _ => None,
        }
    }

    /// Object identity (`equal?`).
    ///
    /// Immediates are identical when their payloads are; floats compare
    /// by bit pattern so `0.0` and `-0.0` are distinct objects.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::True, Value::True) | (Value::False, Value::False) => {
                true
            }
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Bignum(a), Value::Bignum(b)) => Arc::ptr_eq(a, b),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Hash(a), Value::Hash(b)) => Arc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Key under which this value is stored in a hash.
    ///
    /// With `identity` set, heap values are keyed by address
    /// (`compare_by_identity` hashes).
    pub fn hash_key(&self, identity: bool) -> HashKey {
        match self {
            Value::Nil => HashKey::Nil,
            Value::True => HashKey::True,
            Value::False => HashKey::False,
            Value::Fixnum(n) => HashKey::Int(*n),
            Value::Float(f) => {
                // -0.0 and 0.0 are eql?
                let f = if *f == 0.0 { 0.0 } else { *f };
                HashKey::Float(f.to_bits())
            }
            Value::Symbol(s) => HashKey::Sym(s.clone()),
            Value::Class(c) => HashKey::Class(c.0),
            _ if identity => HashKey::Identity(self.address()),
            Value::Bignum(b) => HashKey::Big((**b).clone()),
            Value::Str(s) => HashKey::Str(s.lock().clone()),
            Value::Array(items) => HashKey::Array(
                items
                    .lock()
                    .iter()
                    .map(|item| item.hash_key(false))
                    .collect(),
            ),
            _ => HashKey::Identity(self.address()),
        }
    }

    fn address(&self) -> usize {
        match self {
            Value::Bignum(a) => Arc::as_ptr(a) as usize,
            Value::Str(a) => Arc::as_ptr(a) as *const u8 as usize,
            Value::Array(a) => Arc::as_ptr(a) as *const u8 as usize,
            Value::Hash(a) => Arc::as_ptr(a) as *const u8 as usize,
            Value::Range(a) => Arc::as_ptr(a) as usize,
            Value::Object(a) => Arc::as_ptr(a) as usize,
            Value::Proc(a) => Arc::as_ptr(a) as usize,
            _ => 0,
        }
    }

    /// Short kind name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::True => "true",
            Value::False => "false",
            Value::Fixnum(_) | Value::Bignum(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Symbol(_) => "Symbol",
            Value::Str(_) => "String",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Range(_) => "Range",
            Value::Object(_) => "Object",
            Value::Class(_) => "Class",
            Value::Proc(_) => "Proc",
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

/// Hash key derived from a value at insertion time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Nil,
    True,
    False,
    Int(i64),
    Big(BigInt),
    Float(u64),
    Sym(Symbol),
    Class(u32),
    Str(String),
    Array(Vec<HashKey>),
    Identity(usize),
}

/// Insertion-ordered hash table
#[derive(Debug, Clone, Default)]
pub struct RHash {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
    compare_by_identity: bool,
}

impl RHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compare_by_identity(&self) -> bool {
        self.compare_by_identity
    }

    /// Switch to identity comparison, rehashing existing entries.
    pub fn set_compare_by_identity(&mut self) {
        self.compare_by_identity = true;
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.hash_key(true), i))
            .collect();
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        let hk = key.hash_key(self.compare_by_identity);
        self.index.get(&hk).map(|&i| self.entries[i].1.clone())
    }

    /// Insert or overwrite. String keys are copied unless the hash
    /// compares by identity.
    pub fn insert(&mut self, key: Value, value: Value) {
        let hk = key.hash_key(self.compare_by_identity);
        if let Some(&i) = self.index.get(&hk) {
            self.entries[i].1 = value;
            return;
        }
        let key = match &key {
            Value::Str(s) if !self.compare_by_identity => Value::str(s.lock().clone()),
            _ => key,
        };
        self.index.insert(hk, self.entries.len());
        self.entries.push((key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }
}

/// Range literal
#[derive(Debug, Clone)]
pub struct RRange {
    pub low: Value,
    pub high: Value,
    pub exclude_end: bool,
}

/// Instance of a user-defined (or exception) class
pub struct RObject {
    pub class: ClassId,
    ivars: Mutex<Vec<Value>>,
}

impl RObject {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            ivars: Mutex::new(Vec::new()),
        }
    }

    /// Read the ivar stored at `slot`; unset slots read as nil.
    pub fn ivar(&self, slot: usize) -> Value {
        self.ivars.lock().get(slot).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_ivar(&self, slot: usize, value: Value) {
        let mut ivars = self.ivars.lock();
        if ivars.len() <= slot {
            ivars.resize(slot + 1, Value::Nil);
        }
        ivars[slot] = value;
    }
}

impl fmt::Debug for RObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<object class={}>", self.class.0)
    }
}

/// A block captured as a first-class object.
pub struct RProc {
    pub block: Block,
    pub lambda: bool,
}

impl fmt::Debug for RProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#<Proc {}{}>",
            self.block.routine.name,
            if self.lambda { " (lambda)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_int_promotes_outside_fixnum_range() {
        assert!(matches!(Value::int(FIXNUM_MAX), Value::Fixnum(_)));
        assert!(matches!(Value::int(FIXNUM_MAX + 1), Value::Bignum(_)));
        assert!(matches!(Value::int(FIXNUM_MIN - 1), Value::Bignum(_)));
    }

    #[test]
    fn test_from_bigint_demotes() {
        let v = Value::from_bigint(BigInt::from(42));
        assert_eq!(v.as_fixnum(), Some(42));
    }

    #[test]
    fn test_float_identity_distinguishes_signed_zero() {
        assert!(!Value::Float(0.0).same(&Value::Float(-0.0)));
        assert!(Value::Float(1.5).same(&Value::Float(1.5)));
    }

    #[test]
    fn test_hash_signed_zero_keys_collide() {
        let mut h = RHash::new();
        h.insert(Value::Float(0.0), Value::int(1));
        assert_eq!(h.get(&Value::Float(-0.0)).and_then(|v| v.as_fixnum()), Some(1));
    }

    #[test]
    fn test_hash_string_keys_by_content() {
        let mut h = RHash::new();
        h.insert(Value::str("a"), Value::int(1));
        assert_eq!(h.get(&Value::str("a")).and_then(|v| v.as_fixnum()), Some(1));
        assert!(h.get(&Value::sym("a")).is_none());
    }

    #[test]
    fn test_hash_identity_mode() {
        let mut h = RHash::new();
        h.set_compare_by_identity();
        let key = Value::str("k");
        h.insert(key.clone(), Value::True);
        assert!(h.get(&key).is_some());
        assert!(h.get(&Value::str("k")).is_none());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::False.truthy());
        assert!(Value::int(0).truthy());
        assert!(Value::str("").truthy());
    }
}
