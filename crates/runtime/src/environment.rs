//! Environment: one interpreter instance plus everything bridged into it
//!
//! An `Environment` owns the interpreter state, its intern table and the
//! encode buffer. Proxies and finalizers reach it through a shared
//! [`EnvCore`]; proxies hold only a `Weak` to it, so dropping or disposing the
//! environment while proxies are alive is fine. Their later use fails with
//! `Error::Disposed`.
//!
//! ## Lifecycle
//!
//! ```text
//! new:     newstate -> openlibs? -> metatables -> register token -> plant sentinel?
//! dispose: unregister token -> release every handle -> close
//! ```
//!
//! Handles are released before the state is closed so finalizers running
//! during close still see a valid registry.

use crate::function::{self, Function};
use crate::hook;
use crate::marshal;
use crate::native;
use crate::refs::{ForeignKind, ReferenceManager, resolve};
use crate::results::Results;
use crate::stack::{State, StackGuard, call_error, ensure_capacity, load_error};
use crate::table::{self, Table};
use crate::thread::Thread;
use crate::value::Value;
use mlua_sys as ffi;
use moonlink_core::{EncodeBuffer, EnvironmentConfig, Error, Result};
use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

/// State shared between an environment, its proxies and its finalizers
pub(crate) struct EnvCore {
    token: u64,
    /// Null once the environment is disposed
    state: Cell<State>,
    pub(crate) refs: RefCell<ReferenceManager>,
    encode: RefCell<EncodeBuffer>,
    pub(crate) config: EnvironmentConfig,
}

impl EnvCore {
    pub(crate) fn state(&self) -> Result<State> {
        let state = self.state.get();
        if state.is_null() {
            return Err(Error::Disposed("environment"));
        }
        Ok(state)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.get().is_null()
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Run `f` with `text` as a C string, using the encode buffer when it is free
    pub(crate) fn with_cstr<R>(&self, text: &str, f: impl FnOnce(&CStr) -> R) -> Result<R> {
        match self.encode.try_borrow_mut() {
            Ok(mut encode) => {
                let cstr = encode.encode(text)?;
                Ok(f(&cstr))
            }
            // Nested use (a finalizer during an encode): take the heap path
            Err(_) => {
                let mut scratch = EncodeBuffer::new(1);
                let cstr = scratch.encode(text)?;
                Ok(f(&cstr))
            }
        }
    }
}

/// Counters describing the bridge between Rust and the interpreter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentStats {
    /// Intern-table entries, live or pending release
    pub interned: usize,
    /// High-water mark of the registry's integer slots
    pub registry_slots: usize,
    /// Sweep passes run so far
    pub sweeps: u64,
    /// Registry handles released so far (sweeps, disposal)
    pub released: u64,
}

/// An embedded interpreter instance
///
/// Not `Send`: an environment and its proxies are used from one thread.
pub struct Environment {
    core: Rc<EnvCore>,
}

impl Environment {
    /// Create an environment with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(EnvironmentConfig::default())
    }

    pub fn with_config(config: EnvironmentConfig) -> Result<Self> {
        config.validate()?;

        let state = unsafe { ffi::luaL_newstate() };
        if state.is_null() {
            return Err(Error::Runtime(
                "could not allocate an interpreter state".to_string(),
            ));
        }
        if let Err(e) = unsafe { prepare_state(state, &config) } {
            unsafe { ffi::lua_close(state) };
            return Err(e);
        }

        let core = Rc::new(EnvCore {
            token: hook::next_token(),
            state: Cell::new(state),
            refs: RefCell::new(ReferenceManager::new()),
            encode: RefCell::new(EncodeBuffer::new(config.encode_buffer_size)),
            config,
        });
        hook::register(&core);
        let env = Environment { core };

        // From here on, Drop cleans up on failure
        if env.core.config.collection_hook {
            unsafe { hook::plant(state, env.core.token)? };
        }

        tracing::debug!(
            token = env.core.token,
            open_libs = env.core.config.open_libs,
            collection_hook = env.core.config.collection_hook,
            "environment created"
        );
        Ok(env)
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.core.config
    }

    /// `_G[name]`, honoring metamethods on the global table
    pub fn get_global(&self, name: &str) -> Result<Value> {
        let state = self.core.state()?;
        unsafe {
            // trampoline + globals + name
            ensure_capacity(state, 3)?;
            let _guard = StackGuard::new(state);
            ffi::lua_pushcfunction(state, table::protected_get);
            self.push_global_key(state, name)?;
            let status = ffi::lua_pcall(state, 2, 1, 0);
            if status != ffi::LUA_OK {
                return Err(call_error(state, status));
            }
            marshal::pull(&self.core, state, -1, None)
        }
    }

    /// `_G[name] = value`, honoring metamethods on the global table
    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let state = self.core.state()?;
        let value = value.into();
        unsafe {
            // trampoline + globals + name + value
            ensure_capacity(state, 4)?;
            let _guard = StackGuard::new(state);
            ffi::lua_pushcfunction(state, table::protected_set);
            self.push_global_key(state, name)?;
            marshal::push(&self.core, state, &value)?;
            let status = ffi::lua_pcall(state, 3, 0, 0);
            if status != ffi::LUA_OK {
                return Err(call_error(state, status));
            }
        }
        Ok(())
    }

    /// Compile and run `source` with no arguments
    pub fn eval(&self, source: &str) -> Result<Results> {
        let state = self.core.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.load_chunk(state, source.as_bytes(), &self.core.config.chunk_name)?;
            function::invoke(&self.core, state, &[])
        }
    }

    /// Compile and run the file at `path` with no arguments
    pub fn eval_file(&self, path: impl AsRef<Path>) -> Result<Results> {
        let path = path.as_ref();
        let source = read_source(path)?;
        let state = self.core.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.load_chunk(state, &source, &file_chunk_name(path))?;
            function::invoke(&self.core, state, &[])
        }
    }

    /// Compile `source` without running it
    ///
    /// `chunk_name` follows the interpreter's convention: `=name` is used
    /// verbatim in messages, `@path` names a file.
    pub fn load(&self, source: &str, chunk_name: &str) -> Result<Function> {
        let state = self.core.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.load_chunk(state, source.as_bytes(), chunk_name)?;
            Ok(Function(resolve(&self.core, state, -1, ForeignKind::Function)?))
        }
    }

    /// Compile the file at `path` without running it
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Function> {
        let path = path.as_ref();
        let source = read_source(path)?;
        let state = self.core.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.load_chunk(state, &source, &file_chunk_name(path))?;
            Ok(Function(resolve(&self.core, state, -1, ForeignKind::Function)?))
        }
    }

    /// The global table
    pub fn globals(&self) -> Result<Table> {
        let state = self.core.state()?;
        unsafe {
            ensure_capacity(state, 1)?;
            let _guard = StackGuard::new(state);
            ffi::lua_pushglobaltable(state);
            Ok(Table(resolve(&self.core, state, -1, ForeignKind::Table)?))
        }
    }

    pub fn create_table(&self) -> Result<Table> {
        let state = self.core.state()?;
        unsafe {
            ensure_capacity(state, 1)?;
            let _guard = StackGuard::new(state);
            ffi::lua_createtable(state, 0, 0);
            Ok(Table(resolve(&self.core, state, -1, ForeignKind::Table)?))
        }
    }

    /// Create a coroutine that will run `body` on its first resume
    pub fn create_thread(&self, body: &Function) -> Result<Thread> {
        let state = self.core.state()?;
        unsafe {
            ensure_capacity(state, 2)?;
            let _guard = StackGuard::new(state);
            let co = ffi::lua_newthread(state);
            body.0.push(&self.core, state)?;
            ffi::lua_xmove(state, co, 1);
            Ok(Thread(resolve(&self.core, state, -1, ForeignKind::Thread)?))
        }
    }

    /// Run a full interpreter collection cycle
    ///
    /// With the collection hook enabled this also sweeps the intern table,
    /// releasing handles of proxies dropped since the previous cycle.
    pub fn collect_garbage(&self) -> Result<()> {
        let state = self.core.state()?;
        unsafe { ffi::lua_gc(state, ffi::LUA_GCCOLLECT, 0) };
        Ok(())
    }

    /// Release the handles of dropped proxies now; returns how many were released
    pub fn sweep(&self) -> Result<usize> {
        let state = self.core.state()?;
        Ok(unsafe { hook::sweep(&self.core, state) })
    }

    pub fn stats(&self) -> Result<EnvironmentStats> {
        let state = self.core.state()?;
        let refs = self.core.refs.borrow();
        Ok(EnvironmentStats {
            interned: refs.len(),
            registry_slots: unsafe { ffi::lua_rawlen(state, ffi::LUA_REGISTRYINDEX) } as usize,
            sweeps: refs.sweeps(),
            released: refs.released(),
        })
    }

    /// Current depth of the main interpreter stack
    ///
    /// Every operation restores it, so outside of a call this is always 0.
    pub fn stack_depth(&self) -> Result<usize> {
        let state = self.core.state()?;
        Ok(unsafe { ffi::lua_gettop(state) }.max(0) as usize)
    }

    /// Release every handle and close the interpreter
    ///
    /// Idempotent; also run on drop.
    pub fn dispose(&self) {
        let state = self.core.state.replace(std::ptr::null_mut());
        if state.is_null() {
            return;
        }
        hook::unregister(self.core.token);
        let handles = self.core.refs.borrow_mut().drain();
        unsafe {
            for handle in &handles {
                handle.release(state);
            }
            ffi::lua_close(state);
        }
        tracing::debug!(
            token = self.core.token,
            released = handles.len(),
            "environment disposed"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_closed()
    }

    /// Push the global table and `name` as the key into it
    unsafe fn push_global_key(&self, state: State, name: &str) -> Result<()> {
        unsafe {
            ffi::lua_pushglobaltable(state);
            self.core
                .with_cstr(name, |cname| ffi::lua_pushstring(state, cname.as_ptr()))?;
        }
        Ok(())
    }

    /// Compile `source` and leave the chunk on top of the stack
    unsafe fn load_chunk(&self, state: State, source: &[u8], chunk_name: &str) -> Result<()> {
        unsafe {
            ensure_capacity(state, 1)?;
            let status = self.core.with_cstr(chunk_name, |name| {
                ffi::luaL_loadbufferx(
                    state,
                    source.as_ptr() as *const _,
                    source.len(),
                    name.as_ptr(),
                    c"t".as_ptr(),
                )
            })?;
            if status != ffi::LUA_OK {
                return Err(load_error(state, status));
            }
        }
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("token", &self.core.token)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Libraries and metatables every environment needs
unsafe fn prepare_state(state: State, config: &EnvironmentConfig) -> Result<()> {
    unsafe {
        if config.open_libs {
            ffi::luaL_openlibs(state);
        }
        native::register_metatable(state)?;
        hook::register_metatable(state)?;
    }
    Ok(())
}

fn read_source(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Load(format!("cannot read {}: {}", path.display(), e)))
}

fn file_chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}
