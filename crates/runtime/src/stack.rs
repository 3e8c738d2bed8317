//! Interpreter stack discipline
//!
//! Every public entry point follows the same pattern: remember the stack top,
//! push what it needs, consume it, and put the top back where it was, on the
//! success path and on the error path alike.
//!
//! ```text
//! let guard = StackGuard::new(state);   // top = N
//! push ... push ... call ... pull ...   // top = N + k
//! drop(guard)                           // top = N again
//! ```
//!
//! Capacity is checked with [`ensure_capacity`] *before* anything is pushed,
//! so a stack that cannot grow is reported as an error instead of being
//! written past its end.

use mlua_sys as ffi;
use moonlink_core::{Error, Result};
use std::ffi::c_int;

/// Raw interpreter state (main state or a coroutine)
pub(crate) type State = *mut ffi::lua_State;

/// Restores the stack top when dropped
pub(crate) struct StackGuard {
    state: State,
    top: c_int,
}

impl StackGuard {
    /// # Safety
    /// `state` must be a live interpreter state for the lifetime of the guard.
    pub(crate) unsafe fn new(state: State) -> Self {
        let top = unsafe { ffi::lua_gettop(state) };
        StackGuard { state, top }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        unsafe {
            let current = ffi::lua_gettop(self.state);
            debug_assert!(
                current >= self.top,
                "stack shrank below guarded top ({} < {})",
                current,
                self.top
            );
            ffi::lua_settop(self.state, self.top);
        }
    }
}

/// Make room for `n` more slots or fail without touching the stack
///
/// # Safety
/// `state` must be a live interpreter state.
pub(crate) unsafe fn ensure_capacity(state: State, n: usize) -> Result<()> {
    let requested = c_int::try_from(n).map_err(|_| Error::StackOverflow { requested: n })?;
    if unsafe { ffi::lua_checkstack(state, requested) } == 0 {
        return Err(Error::StackOverflow { requested: n });
    }
    Ok(())
}

/// Name of a type tag as the interpreter spells it
pub(crate) fn type_name(tag: c_int) -> &'static str {
    match tag {
        ffi::LUA_TNONE => "no value",
        ffi::LUA_TNIL => "nil",
        ffi::LUA_TBOOLEAN => "boolean",
        ffi::LUA_TLIGHTUSERDATA => "lightuserdata",
        ffi::LUA_TNUMBER => "number",
        ffi::LUA_TSTRING => "string",
        ffi::LUA_TTABLE => "table",
        ffi::LUA_TFUNCTION => "function",
        ffi::LUA_TUSERDATA => "userdata",
        ffi::LUA_TTHREAD => "thread",
        _ => "unknown",
    }
}

/// Copy the error object on top of the stack into a message, then pop it
///
/// Non-string error objects are described by their type, the same way the
/// standalone interpreter reports them.
///
/// # Safety
/// `state` must be a live interpreter state with at least one slot.
pub(crate) unsafe fn pop_error_message(state: State) -> String {
    unsafe {
        let tag = ffi::lua_type(state, -1);
        let message = match tag {
            ffi::LUA_TSTRING | ffi::LUA_TNUMBER => {
                let mut len = 0usize;
                let ptr = ffi::lua_tolstring(state, -1, &mut len);
                if ptr.is_null() {
                    String::from("(error object is not a string)")
                } else {
                    let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
                    String::from_utf8_lossy(bytes).into_owned()
                }
            }
            ffi::LUA_TNIL => String::from("(error object is a nil value)"),
            other => format!("(error object is a {} value)", type_name(other)),
        };
        ffi::lua_pop(state, 1);
        message
    }
}

/// Turn a non-OK load status into an error, consuming the message
///
/// # Safety
/// `state` must hold the error object on top.
pub(crate) unsafe fn load_error(state: State, status: c_int) -> Error {
    let message = unsafe { pop_error_message(state) };
    match status {
        ffi::LUA_ERRMEM => Error::Load(format!("out of memory: {}", message)),
        _ => Error::Load(message),
    }
}

/// Turn a non-OK call/resume status into an error, consuming the message
///
/// # Safety
/// `state` must hold the error object on top.
pub(crate) unsafe fn call_error(state: State, status: c_int) -> Error {
    let message = unsafe { pop_error_message(state) };
    match status {
        ffi::LUA_ERRMEM => Error::Runtime(format!("out of memory: {}", message)),
        ffi::LUA_ERRERR => Error::Runtime(format!("error in error handling: {}", message)),
        _ => Error::Runtime(message),
    }
}

/// Message handler that appends a traceback to string errors
pub(crate) unsafe extern "C-unwind" fn traceback_handler(state: State) -> c_int {
    unsafe {
        let msg = ffi::lua_tolstring(state, 1, std::ptr::null_mut());
        if !msg.is_null() {
            ffi::luaL_traceback(state, state, msg, 1);
        }
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RawState(State);

    impl RawState {
        fn new() -> Self {
            let state = unsafe { ffi::luaL_newstate() };
            assert!(!state.is_null());
            RawState(state)
        }
    }

    impl Drop for RawState {
        fn drop(&mut self) {
            unsafe { ffi::lua_close(self.0) }
        }
    }

    #[test]
    fn test_guard_restores_top() {
        let raw = RawState::new();
        unsafe {
            ffi::lua_pushinteger(raw.0, 1);
            {
                let _guard = StackGuard::new(raw.0);
                ffi::lua_pushinteger(raw.0, 2);
                ffi::lua_pushinteger(raw.0, 3);
            }
            assert_eq!(ffi::lua_gettop(raw.0), 1);
        }
    }

    #[test]
    fn test_ensure_capacity_rejects_huge_requests() {
        let raw = RawState::new();
        unsafe {
            assert!(ensure_capacity(raw.0, 16).is_ok());
            let err = ensure_capacity(raw.0, 10_000_000).unwrap_err();
            assert_eq!(err, Error::StackOverflow { requested: 10_000_000 });
            assert_eq!(ffi::lua_gettop(raw.0), 0);
        }
    }

    #[test]
    fn test_pop_error_message_variants() {
        let raw = RawState::new();
        unsafe {
            let text = "boom";
            ffi::lua_pushlstring(raw.0, text.as_ptr() as *const _, text.len());
            assert_eq!(pop_error_message(raw.0), "boom");

            ffi::lua_pushinteger(raw.0, 42);
            assert_eq!(pop_error_message(raw.0), "42");

            ffi::lua_createtable(raw.0, 0, 0);
            assert_eq!(pop_error_message(raw.0), "(error object is a table value)");

            assert_eq!(ffi::lua_gettop(raw.0), 0);
        }
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(ffi::LUA_TTABLE), "table");
        assert_eq!(type_name(ffi::LUA_TNONE), "no value");
        assert_eq!(type_name(99), "unknown");
    }
}
