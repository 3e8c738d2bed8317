//! Cross-heap reference manager
//!
//! Tables, functions, threads and foreign userdata live in the interpreter
//! heap. Rust sees them through proxies, and this module keeps the two sides
//! consistent:
//!
//! - **Identity**: at most one live proxy exists per interpreter object. The
//!   intern table maps the object's heap address to a registry handle and a
//!   `Weak` to the proxy, so pulling the same object twice yields the same
//!   `Rc`.
//! - **Lifetime**: the registry handle keeps the interpreter object alive for
//!   as long as the entry exists. When the last proxy clone is dropped the
//!   `Weak` dies; the handle is released later by a sweep.
//!
//! ```text
//!             first pull                 proxy dropped              sweep
//!   Unseen ──────────────▶ Interned ───────────────────▶ Pending ──────────▶ Released
//!                            ▲   │ pulled again while         │
//!                            └───┘ the proxy is alive         │ pulled again before
//!                                                             │ the sweep: handle reused
//!                                                             ▼
//!                                                          Interned
//! ```
//!
//! An address cannot be reused by the interpreter while its entry holds a
//! handle, so a dead entry found at the same address always describes the
//! same object and its handle can be reused for the new proxy.
//!
//! Sweeps are driven by the collection hook (see `hook`), so their cadence
//! follows the interpreter's collector rather than Rust drops.

use crate::environment::EnvCore;
use crate::stack::{State, ensure_capacity};
use mlua_sys as ffi;
use moonlink_core::{Error, Result};
use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::c_int;
use std::fmt;
use std::rc::{Rc, Weak};

/// Integer key into the interpreter registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RegistryHandle(pub(crate) c_int);

impl RegistryHandle {
    /// Pop the top of the stack into the registry
    ///
    /// # Safety
    /// `state` must be a live interpreter state with a value on top.
    pub(crate) unsafe fn take_top(state: State) -> Self {
        RegistryHandle(unsafe { ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX) })
    }

    /// Push the referenced value
    ///
    /// # Safety
    /// `state` must share the registry the handle was created in.
    pub(crate) unsafe fn push(self, state: State) -> Result<()> {
        unsafe {
            ensure_capacity(state, 1)?;
            ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::lua_Integer::from(self.0));
        }
        Ok(())
    }

    /// Give the slot back to the registry
    ///
    /// # Safety
    /// `state` must share the registry the handle was created in.
    pub(crate) unsafe fn release(self, state: State) {
        unsafe { ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, self.0) }
    }
}

/// Which proxy type an interned object is exposed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ForeignKind {
    Table,
    Function,
    Thread,
    UserData,
}

impl ForeignKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ForeignKind::Table => "table",
            ForeignKind::Function => "function",
            ForeignKind::Thread => "thread",
            ForeignKind::UserData => "userdata",
        }
    }
}

/// Shared state behind every clone of one proxy
pub(crate) struct ForeignInner {
    env: Weak<EnvCore>,
    handle: RegistryHandle,
    address: usize,
    kind: ForeignKind,
    disposed: Cell<bool>,
}

/// Reference-counted proxy handle shared by `Table`, `Function`, `Thread`
/// and `UserData`
#[derive(Clone)]
pub(crate) struct ForeignRef(Rc<ForeignInner>);

impl ForeignRef {
    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.0.disposed.get() || self.0.env.upgrade().is_none_or(|core| core.is_closed())
    }

    /// The owning environment, if it and this proxy are still usable
    pub(crate) fn env(&self) -> Result<Rc<EnvCore>> {
        if self.0.disposed.get() {
            return Err(Error::Disposed(self.0.kind.name()));
        }
        let core = self.0.env.upgrade().ok_or(Error::Disposed("environment"))?;
        if core.is_closed() {
            return Err(Error::Disposed("environment"));
        }
        Ok(core)
    }

    /// Whether this proxy was created by `core`
    pub(crate) fn belongs_to(&self, core: &Rc<EnvCore>) -> bool {
        std::ptr::eq(self.0.env.as_ptr(), Rc::as_ptr(core))
    }

    /// Push the proxied object onto `state`
    ///
    /// Fails without touching the stack when the proxy belongs to another
    /// environment or was disposed.
    ///
    /// # Safety
    /// `state` must be a live state (or coroutine) of `core`.
    pub(crate) unsafe fn push(&self, core: &Rc<EnvCore>, state: State) -> Result<()> {
        if !self.belongs_to(core) {
            return Err(Error::InvalidOperation(format!(
                "{} belongs to a different environment",
                self.0.kind.name()
            )));
        }
        if self.0.disposed.get() {
            return Err(Error::Disposed(self.0.kind.name()));
        }
        unsafe { self.0.handle.push(state) }
    }

    /// Release the registry handle now instead of waiting for a sweep
    ///
    /// Idempotent. Other clones of the proxy observe `Error::Disposed`.
    pub(crate) fn dispose(&self) {
        if self.0.disposed.replace(true) {
            return;
        }
        let Some(core) = self.0.env.upgrade() else {
            return;
        };
        let Ok(state) = core.state() else {
            return;
        };
        let owned = core
            .refs
            .borrow_mut()
            .remove_owned(self.0.address, Rc::as_ptr(&self.0));
        if let Some(handle) = owned {
            unsafe { handle.release(state) };
            tracing::trace!(kind = self.0.kind.name(), handle = handle.0, "proxy disposed");
        }
    }
}

impl PartialEq for ForeignRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ForeignRef {}

impl fmt::Debug for ForeignRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#x}", self.0.kind.name(), self.0.address)
    }
}

struct InternEntry {
    handle: RegistryHandle,
    proxy: Weak<ForeignInner>,
}

/// Intern table: interpreter heap address -> (registry handle, weak proxy)
///
/// Pure bookkeeping; the callers issue the matching registry calls.
#[derive(Default)]
pub(crate) struct ReferenceManager {
    interned: HashMap<usize, InternEntry>,
    sweeps: u64,
    released: u64,
}

impl ReferenceManager {
    pub(crate) fn new() -> Self {
        ReferenceManager::default()
    }

    /// Live proxy for `address`, if one is still reachable
    pub(crate) fn lookup(&self, address: usize) -> Option<Rc<ForeignInner>> {
        self.interned
            .get(&address)
            .and_then(|entry| entry.proxy.upgrade())
    }

    /// Handle of a dead entry at `address`, for reuse by a new proxy
    pub(crate) fn reclaim(&self, address: usize) -> Option<RegistryHandle> {
        self.interned
            .get(&address)
            .filter(|entry| entry.proxy.strong_count() == 0)
            .map(|entry| entry.handle)
    }

    pub(crate) fn insert(&mut self, address: usize, handle: RegistryHandle, proxy: Weak<ForeignInner>) {
        self.interned.insert(address, InternEntry { handle, proxy });
    }

    /// Remove the entry for `address` if it still points at `proxy`
    pub(crate) fn remove_owned(
        &mut self,
        address: usize,
        proxy: *const ForeignInner,
    ) -> Option<RegistryHandle> {
        match self.interned.get(&address) {
            Some(entry) if std::ptr::eq(entry.proxy.as_ptr(), proxy) => {
                self.released += 1;
                self.interned.remove(&address).map(|entry| entry.handle)
            }
            _ => None,
        }
    }

    /// Remove every entry whose proxy is gone and return their handles
    pub(crate) fn take_dead(&mut self) -> Vec<RegistryHandle> {
        let mut dead = Vec::new();
        self.interned.retain(|_, entry| {
            if entry.proxy.strong_count() == 0 {
                dead.push(entry.handle);
                false
            } else {
                true
            }
        });
        self.sweeps += 1;
        self.released += dead.len() as u64;
        dead
    }

    /// Remove every entry, live or not (environment teardown)
    pub(crate) fn drain(&mut self) -> Vec<RegistryHandle> {
        let handles: Vec<_> = self.interned.drain().map(|(_, entry)| entry.handle).collect();
        self.released += handles.len() as u64;
        handles
    }

    pub(crate) fn len(&self) -> usize {
        self.interned.len()
    }

    pub(crate) fn sweeps(&self) -> u64 {
        self.sweeps
    }

    pub(crate) fn released(&self) -> u64 {
        self.released
    }
}

/// Return the proxy for the object at `index`, interning it if needed
///
/// `kind` must match the object's interpreter type.
///
/// # Safety
/// `state` must be a live state (or coroutine) of `core`, `index` a valid slot.
pub(crate) unsafe fn resolve(
    core: &Rc<EnvCore>,
    state: State,
    index: c_int,
    kind: ForeignKind,
) -> Result<ForeignRef> {
    let address = unsafe { ffi::lua_topointer(state, index) } as usize;
    debug_assert!(address != 0, "interned object without a heap address");

    // Bind before matching so the borrow ends here
    let live = core.refs.borrow().lookup(address);
    if let Some(inner) = live {
        debug_assert_eq!(inner.kind, kind);
        return Ok(ForeignRef(inner));
    }

    let reclaimed = core.refs.borrow().reclaim(address);
    let handle = match reclaimed {
        Some(handle) => handle,
        None => unsafe {
            let index = ffi::lua_absindex(state, index);
            ensure_capacity(state, 1)?;
            ffi::lua_pushvalue(state, index);
            RegistryHandle::take_top(state)
        },
    };

    let inner = Rc::new(ForeignInner {
        env: Rc::downgrade(core),
        handle,
        address,
        kind,
        disposed: Cell::new(false),
    });
    core.refs
        .borrow_mut()
        .insert(address, handle, Rc::downgrade(&inner));
    Ok(ForeignRef(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(address: usize, handle: c_int) -> Rc<ForeignInner> {
        Rc::new(ForeignInner {
            env: Weak::new(),
            handle: RegistryHandle(handle),
            address,
            kind: ForeignKind::Table,
            disposed: Cell::new(false),
        })
    }

    #[test]
    fn test_lookup_returns_live_proxy() {
        let mut refs = ReferenceManager::new();
        let proxy = detached(0x1000, 3);
        refs.insert(0x1000, RegistryHandle(3), Rc::downgrade(&proxy));

        let found = refs.lookup(0x1000).unwrap();
        assert!(Rc::ptr_eq(&found, &proxy));
        assert!(refs.lookup(0x2000).is_none());
        assert!(refs.reclaim(0x1000).is_none());
    }

    #[test]
    fn test_dead_proxy_is_pending_until_sweep() {
        let mut refs = ReferenceManager::new();
        let proxy = detached(0x1000, 3);
        refs.insert(0x1000, RegistryHandle(3), Rc::downgrade(&proxy));
        drop(proxy);

        // Discovered only by lookups and sweeps, never eagerly
        assert_eq!(refs.len(), 1);
        assert!(refs.lookup(0x1000).is_none());
        assert_eq!(refs.reclaim(0x1000), Some(RegistryHandle(3)));

        let dead = refs.take_dead();
        assert_eq!(dead, vec![RegistryHandle(3)]);
        assert_eq!(refs.len(), 0);
        assert_eq!(refs.sweeps(), 1);
        assert_eq!(refs.released(), 1);
    }

    #[test]
    fn test_sweep_keeps_live_entries() {
        let mut refs = ReferenceManager::new();
        let alive = detached(0x1000, 3);
        let dying = detached(0x2000, 4);
        refs.insert(0x1000, RegistryHandle(3), Rc::downgrade(&alive));
        refs.insert(0x2000, RegistryHandle(4), Rc::downgrade(&dying));
        drop(dying);

        assert_eq!(refs.take_dead(), vec![RegistryHandle(4)]);
        assert_eq!(refs.len(), 1);
        assert!(refs.lookup(0x1000).is_some());
    }

    #[test]
    fn test_remove_owned_ignores_replaced_entries() {
        let mut refs = ReferenceManager::new();
        let old = detached(0x1000, 3);
        let new = detached(0x1000, 3);
        refs.insert(0x1000, RegistryHandle(3), Rc::downgrade(&new));

        assert!(refs.remove_owned(0x1000, Rc::as_ptr(&old)).is_none());
        assert_eq!(refs.len(), 1);
        assert_eq!(
            refs.remove_owned(0x1000, Rc::as_ptr(&new)),
            Some(RegistryHandle(3))
        );
        assert_eq!(refs.len(), 0);
    }

    #[test]
    fn test_drain_returns_everything() {
        let mut refs = ReferenceManager::new();
        let a = detached(0x1000, 3);
        refs.insert(0x1000, RegistryHandle(3), Rc::downgrade(&a));
        refs.insert(0x2000, RegistryHandle(4), Weak::new());

        let mut handles = refs.drain();
        handles.sort_by_key(|h| h.0);
        assert_eq!(handles, vec![RegistryHandle(3), RegistryHandle(4)]);
        assert_eq!(refs.len(), 0);
    }

    #[test]
    fn test_detached_proxy_reports_disposed_environment() {
        let proxy = ForeignRef(detached(0x1000, 3));
        assert!(proxy.is_disposed());
        assert_eq!(proxy.env().err(), Some(Error::Disposed("environment")));
        // No environment to release into; still idempotent
        proxy.dispose();
        proxy.dispose();
        assert_eq!(proxy.env().err(), Some(Error::Disposed("table")));
    }
}
