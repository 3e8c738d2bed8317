//! Value: what crosses the boundary between Rust and the interpreter
//!
//! A `Value` is a 16-byte tagged union. Primitive variants (nil, boolean,
//! light userdata, integer, number) are stored inline and never allocate.
//! Reference variants hold a single thin pointer:
//!
//! ```text
//! ┌──────────────────┬────────────────────────────────────────┐
//! │ tag (8 bytes)    │ payload (8 bytes)                      │
//! ├──────────────────┼────────────────────────────────────────┤
//! │ Nil              │ -                                      │
//! │ Boolean          │ bool                                   │
//! │ LightUserData    │ *mut c_void                            │
//! │ Integer          │ i64                                    │
//! │ Number           │ f64                                    │
//! │ String           │ Rc<String>                             │
//! │ Table/Function/  │ Rc<ForeignInner> (interned proxy)      │
//! │ Thread/UserData  │                                        │
//! │ Native           │ Rc<NativeCell> (Rust object)           │
//! │ NativeType       │ Rc<TypeDescriptor>                     │
//! └──────────────────┴────────────────────────────────────────┘
//! ```
//!
//! # Equality
//!
//! Two values are equal when both are nil, when both carry the same primitive
//! variant with bit-identical payloads (so `Integer(1) != Number(1.0)` and
//! `Number(0.0) != Number(-0.0)`), when both are strings with the same
//! contents, or when both refer to the same proxy or Rust object.
//!
//! # Narrow accessors
//!
//! `as_*` methods are for the hot path after an `is_*` check: they
//! debug-assert the variant and return a neutral value on mismatch in release
//! builds. `to_*` methods check and return `Error::InvalidCast`. Neither
//! coerces between numbers and strings; coercion happens only when pulling
//! from the interpreter stack.

use crate::function::Function;
use crate::native::{NativeObject, NativeType};
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::UserData;
use moonlink_core::{Error, Result};
use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;

/// Immutable, shared UTF-8 string
///
/// A thin `Rc` keeps `Value` at 16 bytes; cloning is a reference count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LuaString(Rc<String>);

impl LuaString {
    pub fn new(text: impl Into<String>) -> Self {
        LuaString(Rc::new(text.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for LuaString {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for LuaString {
    fn from(s: &str) -> Self {
        LuaString::new(s)
    }
}

impl From<String> for LuaString {
    fn from(s: String) -> Self {
        LuaString::new(s)
    }
}

/// Opaque pointer-sized data, passed through untouched
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightUserData(pub *mut c_void);

impl fmt::Debug for LightUserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LightUserData({:p})", self.0)
    }
}

/// Any value exchangeable with the interpreter
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    LightUserData(LightUserData),
    Integer(i64),
    Number(f64),
    String(LuaString),
    Table(Table),
    Function(Function),
    Thread(Thread),
    /// Foreign userdata that does not wrap a Rust object
    UserData(UserData),
    /// A Rust object handed to the interpreter
    Native(NativeObject),
    /// A Rust type descriptor handed to the interpreter
    NativeType(NativeType),
}

const _: () = assert!(
    std::mem::size_of::<Value>() == 16,
    "Value must stay 16 bytes"
);

impl Value {
    /// Relaxed constructor: `None` collapses to nil
    pub fn from_optional<T: Into<Value>>(value: Option<T>) -> Value {
        value.map_or(Value::Nil, Into::into)
    }

    /// Strict constructor: `None` is an invalid argument
    pub fn require<T: Into<Value>>(value: Option<T>, what: &str) -> Result<Value> {
        value
            .map(Into::into)
            .ok_or_else(|| Error::InvalidArgument(format!("{} must not be missing", what)))
    }

    /// Wrap a Rust object
    pub fn native<T: 'static>(object: T) -> Value {
        Value::Native(NativeObject::new(object))
    }

    /// Name of the active variant, in interpreter vocabulary
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::LightUserData(_) => "lightuserdata",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
            Value::UserData(_) => "userdata",
            Value::Native(_) => "native object",
            Value::NativeType(_) => "native type",
        }
    }

    // =========================================================================
    // Discriminant checks
    // =========================================================================

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn is_boolean(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    #[inline]
    pub fn is_light_userdata(&self) -> bool {
        matches!(self, Value::LightUserData(_))
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, Value::Integer(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Table, function, thread or foreign userdata
    #[inline]
    pub fn is_foreign_object(&self) -> bool {
        matches!(
            self,
            Value::Table(_) | Value::Function(_) | Value::Thread(_) | Value::UserData(_)
        )
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    #[inline]
    pub fn is_thread(&self) -> bool {
        matches!(self, Value::Thread(_))
    }

    #[inline]
    pub fn is_native_object(&self) -> bool {
        matches!(self, Value::Native(_))
    }

    #[inline]
    pub fn is_native_type(&self) -> bool {
        matches!(self, Value::NativeType(_))
    }

    // =========================================================================
    // Narrow accessors (caller checked the variant)
    // =========================================================================

    #[inline]
    pub fn as_boolean(&self) -> bool {
        debug_assert!(self.is_boolean(), "as_boolean on {}", self.type_name());
        match self {
            Value::Boolean(b) => *b,
            _ => false,
        }
    }

    #[inline]
    pub fn as_light_userdata(&self) -> *mut c_void {
        debug_assert!(
            self.is_light_userdata(),
            "as_light_userdata on {}",
            self.type_name()
        );
        match self {
            Value::LightUserData(p) => p.0,
            _ => std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn as_integer(&self) -> i64 {
        debug_assert!(self.is_integer(), "as_integer on {}", self.type_name());
        match self {
            Value::Integer(i) => *i,
            _ => 0,
        }
    }

    #[inline]
    pub fn as_number(&self) -> f64 {
        debug_assert!(self.is_number(), "as_number on {}", self.type_name());
        match self {
            Value::Number(n) => *n,
            _ => 0.0,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        debug_assert!(self.is_string(), "as_str on {}", self.type_name());
        match self {
            Value::String(s) => s.as_str(),
            _ => "",
        }
    }

    // =========================================================================
    // Checked conversions
    // =========================================================================

    fn cast_error(&self, expected: &'static str) -> Error {
        Error::InvalidCast {
            expected,
            actual: self.type_name(),
        }
    }

    pub fn to_boolean(&self) -> Result<bool> {
        match self {
            Value::Boolean(b) => Ok(*b),
            _ => Err(self.cast_error("boolean")),
        }
    }

    pub fn to_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            _ => Err(self.cast_error("integer")),
        }
    }

    pub fn to_number(&self) -> Result<f64> {
        match self {
            Value::Number(n) => Ok(*n),
            _ => Err(self.cast_error("number")),
        }
    }

    pub fn to_lua_string(&self) -> Result<LuaString> {
        match self {
            Value::String(s) => Ok(s.clone()),
            _ => Err(self.cast_error("string")),
        }
    }

    pub fn to_table(&self) -> Result<Table> {
        match self {
            Value::Table(t) => Ok(t.clone()),
            _ => Err(self.cast_error("table")),
        }
    }

    pub fn to_function(&self) -> Result<Function> {
        match self {
            Value::Function(f) => Ok(f.clone()),
            _ => Err(self.cast_error("function")),
        }
    }

    pub fn to_thread(&self) -> Result<Thread> {
        match self {
            Value::Thread(t) => Ok(t.clone()),
            _ => Err(self.cast_error("thread")),
        }
    }

    pub fn to_native_object(&self) -> Result<NativeObject> {
        match self {
            Value::Native(o) => Ok(o.clone()),
            _ => Err(self.cast_error("native object")),
        }
    }

    /// Truthiness as the interpreter defines it: only nil and false are false
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::NativeType(a), Value::NativeType(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => {}
            Value::Boolean(b) => b.hash(state),
            Value::LightUserData(p) => p.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Table(t) => t.identity().hash(state),
            Value::Function(f) => f.identity().hash(state),
            Value::Thread(t) => t.identity().hash(state),
            Value::UserData(u) => u.identity().hash(state),
            Value::Native(o) => o.identity().hash(state),
            Value::NativeType(t) => t.hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::LightUserData(p) => write!(f, "{:?}", p),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Table(t) => write!(f, "{:?}", t),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Thread(t) => write!(f, "{:?}", t),
            Value::UserData(u) => write!(f, "{:?}", u),
            Value::Native(o) => write!(f, "{:?}", o),
            Value::NativeType(t) => write!(f, "{:?}", t),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(LuaString::new(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(LuaString::new(s))
    }
}

impl From<LuaString> for Value {
    fn from(s: LuaString) -> Self {
        Value::String(s)
    }
}

impl From<LightUserData> for Value {
    fn from(p: LightUserData) -> Self {
        Value::LightUserData(p)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Thread> for Value {
    fn from(t: Thread) -> Self {
        Value::Thread(t)
    }
}

impl From<UserData> for Value {
    fn from(u: UserData) -> Self {
        Value::UserData(u)
    }
}

impl From<NativeObject> for Value {
    fn from(o: NativeObject) -> Self {
        Value::Native(o)
    }
}

impl From<NativeType> for Value {
    fn from(t: NativeType) -> Self {
        Value::NativeType(t)
    }
}
