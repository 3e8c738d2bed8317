//! Table proxy
//!
//! Indexing goes through a protected call of a small trampoline, so
//! `__index`/`__newindex` metamethods run with the interpreter's normal
//! semantics and their errors surface as `Error::Runtime`.

use crate::environment::EnvCore;
use crate::marshal;
use crate::refs::ForeignRef;
use crate::stack::{State, StackGuard, call_error, ensure_capacity};
use crate::value::{LuaString, Value};
use mlua_sys as ffi;
use moonlink_core::Result;
use std::ffi::c_int;
use std::fmt;
use std::rc::Rc;

#[derive(Clone, PartialEq, Eq)]
pub struct Table(pub(crate) ForeignRef);

impl Table {
    /// `self[key]`, honoring metamethods
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        self.fetch(key.into(), |core, state| unsafe { marshal::pull(core, state, -1, None) })
    }

    /// `self[key]` read as an integer, coercing floats and numeric strings
    pub fn get_integer(&self, key: impl Into<Value>) -> Result<i64> {
        self.fetch(key.into(), |_, state| unsafe { marshal::pull_integer(state, -1) })
    }

    /// `self[key]` read as a float, coercing integers and numeric strings
    pub fn get_number(&self, key: impl Into<Value>) -> Result<f64> {
        self.fetch(key.into(), |_, state| unsafe { marshal::pull_number(state, -1) })
    }

    /// `self[key]` read as a string, converting numbers
    pub fn get_string(&self, key: impl Into<Value>) -> Result<LuaString> {
        self.fetch(key.into(), |_, state| unsafe { marshal::pull_string(state, -1) })
    }

    /// `self[key] = value`, honoring metamethods
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            // trampoline + table + key + value
            ensure_capacity(state, 4)?;
            let _guard = StackGuard::new(state);
            ffi::lua_pushcfunction(state, protected_set);
            self.0.push(&core, state)?;
            marshal::push(&core, state, &key)?;
            marshal::push(&core, state, &value)?;
            let status = ffi::lua_pcall(state, 3, 0, 0);
            if status != ffi::LUA_OK {
                return Err(call_error(state, status));
            }
        }
        Ok(())
    }

    /// Raw length (a border of the sequence part); `__len` is not consulted
    pub fn len(&self) -> Result<usize> {
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.0.push(&core, state)?;
            Ok(ffi::lua_rawlen(state, -1) as usize)
        }
    }

    /// True when the table has no entries at all, in any part
    pub fn is_empty(&self) -> Result<bool> {
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            ensure_capacity(state, 3)?;
            let _guard = StackGuard::new(state);
            self.0.push(&core, state)?;
            ffi::lua_pushnil(state);
            Ok(ffi::lua_next(state, -2) == 0)
        }
    }

    /// Every key/value pair, in the interpreter's traversal order
    ///
    /// Raw traversal: `__pairs` is not consulted.
    pub fn pairs(&self) -> Result<Vec<(Value, Value)>> {
        let core = self.0.env()?;
        let state = core.state()?;
        let mut entries = Vec::new();
        unsafe {
            // table + key + value
            ensure_capacity(state, 3)?;
            let _guard = StackGuard::new(state);
            self.0.push(&core, state)?;
            ffi::lua_pushnil(state);
            while ffi::lua_next(state, -2) != 0 {
                let key = marshal::pull(&core, state, -2, None)?;
                let value = marshal::pull(&core, state, -1, None)?;
                entries.push((key, value));
                ffi::lua_pop(state, 1);
            }
        }
        Ok(entries)
    }

    /// Release the registry handle now; later use fails with `Error::Disposed`
    pub fn dispose(&self) {
        self.0.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.0.is_disposed()
    }

    pub(crate) fn identity(&self) -> usize {
        self.0.identity()
    }

    /// Look up `key` in protected mode, then read the result with `read`
    fn fetch<R>(
        &self,
        key: Value,
        read: impl FnOnce(&Rc<EnvCore>, State) -> Result<R>,
    ) -> Result<R> {
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            // trampoline + table + key
            ensure_capacity(state, 3)?;
            let _guard = StackGuard::new(state);
            ffi::lua_pushcfunction(state, protected_get);
            self.0.push(&core, state)?;
            marshal::push(&core, state, &key)?;
            let status = ffi::lua_pcall(state, 2, 1, 0);
            if status != ffi::LUA_OK {
                return Err(call_error(state, status));
            }
            read(&core, state)
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({:?})", self.0)
    }
}

/// (table, key) -> table[key]
pub(crate) unsafe extern "C-unwind" fn protected_get(state: State) -> c_int {
    unsafe { ffi::lua_gettable(state, 1) };
    1
}

/// (table, key, value) -> (); table[key] = value
pub(crate) unsafe extern "C-unwind" fn protected_set(state: State) -> c_int {
    unsafe { ffi::lua_settable(state, 1) };
    0
}
