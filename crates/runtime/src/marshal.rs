//! Stack marshaling: `Value` <-> interpreter stack slots
//!
//! - [`push`] writes exactly one slot. Reference variants go through the
//!   registry (proxies) or a fresh userdata block (Rust objects), but always
//!   net one visible slot. On error nothing is left behind.
//! - [`pull`] reads one slot without popping it. Tables, functions, threads
//!   and foreign userdata are resolved through the intern table so identity
//!   is preserved.
//! - The `pull_*` helpers implement the interpreter's own read-time coercion
//!   (integers, floats and numeric strings convert into each other).
//!
//! String pushes hand the UTF-8 bytes straight to the interpreter, which
//! copies them into its heap; string pulls validate UTF-8. Strings skip the
//! encode buffer: a `&str` is already UTF-8 with a known length, so there is
//! nothing to transcode or terminate (names still go through the buffer).

use crate::environment::EnvCore;
use crate::function::Function;
use crate::native::{self, NativePayload};
use crate::refs::{ForeignKind, resolve};
use crate::stack::{State, StackGuard, ensure_capacity, type_name};
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::UserData;
use crate::value::{LightUserData, LuaString, Value};
use mlua_sys as ffi;
use moonlink_core::{Error, Result};
use std::ffi::c_int;
use std::rc::Rc;

/// Push one value onto `state`
///
/// # Safety
/// `state` must be a live state (or coroutine) of `core`.
pub(crate) unsafe fn push(core: &Rc<EnvCore>, state: State, value: &Value) -> Result<()> {
    unsafe {
        match value {
            Value::Nil => {
                ensure_capacity(state, 1)?;
                ffi::lua_pushnil(state);
            }
            Value::Boolean(b) => {
                ensure_capacity(state, 1)?;
                ffi::lua_pushboolean(state, c_int::from(*b));
            }
            Value::LightUserData(p) => {
                ensure_capacity(state, 1)?;
                ffi::lua_pushlightuserdata(state, p.0);
            }
            Value::Integer(i) => {
                ensure_capacity(state, 1)?;
                ffi::lua_pushinteger(state, *i);
            }
            Value::Number(n) => {
                ensure_capacity(state, 1)?;
                ffi::lua_pushnumber(state, *n);
            }
            Value::String(s) => {
                ensure_capacity(state, 1)?;
                ffi::lua_pushlstring(state, s.as_ptr() as *const _, s.len());
            }
            Value::Table(t) => t.0.push(core, state)?,
            Value::Function(f) => f.0.push(core, state)?,
            Value::Thread(t) => t.0.push(core, state)?,
            Value::UserData(u) => u.0.push(core, state)?,
            Value::Native(o) => native::push_object(state, o)?,
            Value::NativeType(t) => native::push_type(state, t)?,
        }
    }
    Ok(())
}

/// Push several values, all or nothing
///
/// # Safety
/// `state` must be a live state (or coroutine) of `core`.
pub(crate) unsafe fn push_all(core: &Rc<EnvCore>, state: State, values: &[Value]) -> Result<()> {
    unsafe {
        ensure_capacity(state, values.len())?;
        let top = ffi::lua_gettop(state);
        for value in values {
            if let Err(e) = push(core, state, value) {
                ffi::lua_settop(state, top);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Read the slot at `index` without popping it
///
/// `type_hint`, when given, must be the slot's type tag; callers that already
/// dispatched on the type pass it to skip a second query.
///
/// # Safety
/// `state` must be a live state (or coroutine) of `core`.
pub(crate) unsafe fn pull(
    core: &Rc<EnvCore>,
    state: State,
    index: c_int,
    type_hint: Option<c_int>,
) -> Result<Value> {
    unsafe {
        let tag = match type_hint {
            Some(tag) => {
                debug_assert_eq!(tag, ffi::lua_type(state, index), "stale type hint");
                tag
            }
            None => ffi::lua_type(state, index),
        };

        let value = match tag {
            ffi::LUA_TNONE | ffi::LUA_TNIL => Value::Nil,
            ffi::LUA_TBOOLEAN => Value::Boolean(ffi::lua_toboolean(state, index) != 0),
            ffi::LUA_TLIGHTUSERDATA => {
                Value::LightUserData(LightUserData(ffi::lua_touserdata(state, index)))
            }
            ffi::LUA_TNUMBER => {
                if ffi::lua_isinteger(state, index) != 0 {
                    Value::Integer(ffi::lua_tointegerx(state, index, std::ptr::null_mut()))
                } else {
                    Value::Number(ffi::lua_tonumberx(state, index, std::ptr::null_mut()))
                }
            }
            ffi::LUA_TSTRING => Value::String(read_string(state, index)?),
            ffi::LUA_TTABLE => Value::Table(Table(resolve(core, state, index, ForeignKind::Table)?)),
            ffi::LUA_TFUNCTION => {
                Value::Function(Function(resolve(core, state, index, ForeignKind::Function)?))
            }
            ffi::LUA_TTHREAD => {
                Value::Thread(Thread(resolve(core, state, index, ForeignKind::Thread)?))
            }
            ffi::LUA_TUSERDATA => match native::pull(state, index)? {
                Some(NativePayload::Object(o)) => Value::Native(o),
                Some(NativePayload::Type(t)) => Value::NativeType(t),
                None => Value::UserData(UserData(resolve(core, state, index, ForeignKind::UserData)?)),
            },
            other => {
                return Err(Error::InvalidOperation(format!(
                    "unexpected interpreter type tag {}",
                    other
                )));
            }
        };
        Ok(value)
    }
}

/// Pull the slots `first..=last`
///
/// # Safety
/// `state` must be a live state (or coroutine) of `core`.
pub(crate) unsafe fn pull_range(
    core: &Rc<EnvCore>,
    state: State,
    first: c_int,
    last: c_int,
) -> Result<Vec<Value>> {
    let count = usize::try_from(last - first + 1).unwrap_or(0);
    let mut values = Vec::with_capacity(count);
    for index in first..=last {
        values.push(unsafe { pull(core, state, index, None)? });
    }
    Ok(values)
}

/// Pull an integer, coercing floats with an exact integer value and numeric strings
///
/// # Safety
/// `state` must be a live interpreter state.
pub(crate) unsafe fn pull_integer(state: State, index: c_int) -> Result<i64> {
    unsafe {
        let mut isnum: c_int = 0;
        let value = ffi::lua_tointegerx(state, index, &mut isnum);
        if isnum == 0 {
            return Err(Error::InvalidCast {
                expected: "integer",
                actual: type_name(ffi::lua_type(state, index)),
            });
        }
        Ok(value)
    }
}

/// Pull a float, coercing integers and numeric strings
///
/// # Safety
/// `state` must be a live interpreter state.
pub(crate) unsafe fn pull_number(state: State, index: c_int) -> Result<f64> {
    unsafe {
        let mut isnum: c_int = 0;
        let value = ffi::lua_tonumberx(state, index, &mut isnum);
        if isnum == 0 {
            return Err(Error::InvalidCast {
                expected: "number",
                actual: type_name(ffi::lua_type(state, index)),
            });
        }
        Ok(value)
    }
}

/// Pull a string, converting numbers the way the interpreter prints them
///
/// Numbers are converted on a copy so the original slot keeps its type.
///
/// # Safety
/// `state` must be a live interpreter state.
pub(crate) unsafe fn pull_string(state: State, index: c_int) -> Result<LuaString> {
    unsafe {
        match ffi::lua_type(state, index) {
            ffi::LUA_TSTRING => read_string(state, index),
            ffi::LUA_TNUMBER => {
                let index = ffi::lua_absindex(state, index);
                ensure_capacity(state, 1)?;
                let _guard = StackGuard::new(state);
                ffi::lua_pushvalue(state, index);
                read_string(state, -1)
            }
            other => Err(Error::InvalidCast {
                expected: "string",
                actual: type_name(other),
            }),
        }
    }
}

/// Copy the string (or number, converted in place) at `index`
unsafe fn read_string(state: State, index: c_int) -> Result<LuaString> {
    unsafe {
        let mut len = 0usize;
        let ptr = ffi::lua_tolstring(state, index, &mut len);
        if ptr.is_null() {
            return Err(Error::InvalidCast {
                expected: "string",
                actual: type_name(ffi::lua_type(state, index)),
            });
        }
        let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
        let text = std::str::from_utf8(bytes)?;
        Ok(LuaString::new(text))
    }
}
