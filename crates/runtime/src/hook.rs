//! Collection hook: sweep the intern table on the interpreter's GC cadence
//!
//! A sentinel userdata with a `__gc` metamethod is created and immediately
//! dropped from the stack. The next collection cycle finds it unreachable and
//! runs its finalizer, which:
//!
//! 1. looks up the owning environment by token,
//! 2. sweeps the intern table (releasing handles of dead proxies),
//! 3. plants a fresh sentinel for the following cycle.
//!
//! ```text
//!  plant ──▶ [sentinel] ──(GC cycle)──▶ __gc ──▶ sweep ──▶ plant ──▶ ...
//! ```
//!
//! # Environment lookup
//!
//! The finalizer is a bare C callback with no closure state, so each sentinel
//! stores a `u64` token and the token resolves through a thread-local map.
//! Environments are `!Send`, so every callback runs on the thread that owns
//! the environment. Tokens come from a process-wide counter and are never
//! reused.
//!
//! # Reentrancy
//!
//! The finalizer runs inside whatever interpreter operation triggered the
//! collection step. It therefore only touches the intern table (skipping the
//! sweep if the table is currently borrowed) and issues registry releases
//! plus one allocation for the new sentinel.

use crate::environment::EnvCore;
use crate::refs::RegistryHandle;
use crate::stack::{State, ensure_capacity};
use mlua_sys as ffi;
use moonlink_core::{Result, format_panic_payload};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, c_int};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metatable name for sentinels
pub(crate) const SENTINEL_METATABLE: &CStr = c"moonlink.sentinel";

/// Global counter for environment tokens; 0 is never handed out
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENVIRONMENTS: RefCell<HashMap<u64, Weak<EnvCore>>> = RefCell::new(HashMap::new());
}

#[repr(C)]
struct SentinelBlock {
    token: u64,
}

/// Hand out a fresh environment token
pub(crate) fn next_token() -> u64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Make `core` reachable from finalizers by its token
pub(crate) fn register(core: &Rc<EnvCore>) {
    ENVIRONMENTS.with(|envs| {
        envs.borrow_mut().insert(core.token(), Rc::downgrade(core));
    });
}

/// Stop routing finalizers to the environment with `token`
///
/// Called before the interpreter is closed, so sentinels finalized during
/// close neither sweep nor re-arm.
pub(crate) fn unregister(token: u64) {
    // try_with: the thread-local may already be gone during thread teardown
    let _ = ENVIRONMENTS.try_with(|envs| {
        envs.borrow_mut().remove(&token);
    });
}

fn lookup(token: u64) -> Option<Rc<EnvCore>> {
    ENVIRONMENTS
        .try_with(|envs| envs.borrow().get(&token).and_then(Weak::upgrade))
        .ok()
        .flatten()
}

/// Create the sentinel metatable in a fresh state
///
/// # Safety
/// `state` must be a live interpreter state.
pub(crate) unsafe fn register_metatable(state: State) -> Result<()> {
    unsafe {
        ensure_capacity(state, 2)?;
        if ffi::luaL_newmetatable(state, SENTINEL_METATABLE.as_ptr()) != 0 {
            ffi::lua_pushcfunction(state, sentinel_gc);
            ffi::lua_setfield(state, -2, c"__gc".as_ptr());
        }
        ffi::lua_pop(state, 1);
    }
    Ok(())
}

/// Plant an unreachable sentinel for the next collection cycle
///
/// # Safety
/// `state` must be a live interpreter state with the sentinel metatable registered.
pub(crate) unsafe fn plant(state: State, token: u64) -> Result<()> {
    unsafe {
        ensure_capacity(state, 2)?;
        let block = ffi::lua_newuserdatauv(state, std::mem::size_of::<SentinelBlock>(), 0)
            as *mut SentinelBlock;
        block.write(SentinelBlock { token });
        ffi::luaL_setmetatable(state, SENTINEL_METATABLE.as_ptr());
        ffi::lua_pop(state, 1);
    }
    tracing::trace!(token, "sentinel planted");
    Ok(())
}

/// Release the handles of every proxy that is no longer reachable
///
/// Returns how many handles were released; 0 when the intern table is busy.
///
/// # Safety
/// `state` must be a live state of `core`.
pub(crate) unsafe fn sweep(core: &EnvCore, state: State) -> usize {
    let dead: Vec<RegistryHandle> = match core.refs.try_borrow_mut() {
        Ok(mut refs) => refs.take_dead(),
        Err(_) => {
            tracing::trace!(token = core.token(), "intern table busy, sweep skipped");
            return 0;
        }
    };
    for handle in &dead {
        unsafe { handle.release(state) };
    }
    if !dead.is_empty() {
        tracing::debug!(token = core.token(), released = dead.len(), "sweep released handles");
    }
    dead.len()
}

/// `__gc` for sentinels: sweep, then re-arm
unsafe extern "C-unwind" fn sentinel_gc(state: State) -> c_int {
    let token = unsafe {
        let block = ffi::lua_touserdata(state, 1) as *const SentinelBlock;
        if block.is_null() {
            return 0;
        }
        (*block).token
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Some(core) = lookup(token) else {
            return;
        };
        if core.is_closed() {
            return;
        }
        unsafe {
            sweep(&core, state);
            if let Err(e) = plant(state, token) {
                tracing::warn!(token, error = %e, "could not re-arm collection hook");
            }
        }
    }));
    if let Err(payload) = outcome {
        tracing::warn!(
            token,
            panic = %format_panic_payload(&payload),
            "panic in collection hook"
        );
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_nonzero() {
        let a = next_token();
        let b = next_token();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_token_is_ignored() {
        unregister(u64::MAX);
        assert!(lookup(u64::MAX).is_none());
    }

    #[test]
    fn test_orphan_sentinel_is_harmless() {
        // A sentinel whose environment is not registered neither sweeps nor re-arms
        unsafe {
            let state = ffi::luaL_newstate();
            register_metatable(state).unwrap();
            plant(state, u64::MAX - 1).unwrap();
            ffi::lua_gc(state, ffi::LUA_GCCOLLECT, 0);
            assert_eq!(ffi::lua_gettop(state), 0);
            ffi::lua_close(state);
        }
    }
}
