//! Thread (coroutine) proxy
//!
//! Resuming is synchronous: `resume` returns when the coroutine yields,
//! returns or fails. Whether a resume is allowed is decided from the
//! coroutine's own status before anything is pushed, so resuming a finished
//! or failed coroutine is a usage error that never reaches the interpreter.
//!
//! ```text
//!               resume                 yield
//!  NotStarted ─────────▶ Running ─────────────▶ Suspended
//!                          │  ▲                     │
//!                          │  └─────── resume ──────┘
//!               return     │     error
//!   Finished ◀─────────────┴──────────────▶ Failed
//! ```

use crate::environment::EnvCore;
use crate::marshal;
use crate::refs::ForeignRef;
use crate::results::Results;
use crate::stack::{State, StackGuard, call_error, ensure_capacity};
use crate::value::Value;
use mlua_sys as ffi;
use moonlink_core::{Error, Result};
use std::ffi::c_int;
use std::fmt;
use std::mem::MaybeUninit;
use std::rc::Rc;

/// Coroutine status as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    /// Created, body not entered yet
    NotStarted,
    /// Yielded; can be resumed
    Suspended,
    /// Currently executing (or resuming another coroutine)
    Running,
    /// Body returned
    Finished,
    /// Body raised an error
    Failed,
}

impl ThreadStatus {
    pub fn is_resumable(self) -> bool {
        matches!(self, ThreadStatus::NotStarted | ThreadStatus::Suspended)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadStatus::NotStarted => "not started",
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Finished => "finished",
            ThreadStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Thread(pub(crate) ForeignRef);

impl Thread {
    pub fn status(&self) -> Result<ThreadStatus> {
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            let co = self.coroutine(&core, state)?;
            if co == state {
                return Ok(ThreadStatus::Running);
            }
            Ok(status_of(co))
        }
    }

    /// True when the body has not been entered yet
    pub fn can_start(&self) -> bool {
        matches!(self.status(), Ok(ThreadStatus::NotStarted))
    }

    /// True when `resume` would be attempted (not started or suspended)
    pub fn can_resume(&self) -> bool {
        self.status().is_ok_and(ThreadStatus::is_resumable)
    }

    /// Start or continue the coroutine with `args`
    ///
    /// Returns the values passed to `coroutine.yield`, or the body's return
    /// values once it finishes. Errors raised by the body come back as
    /// `Error::Runtime` and leave the thread `Failed`.
    pub fn resume(&self, args: &[Value]) -> Result<Results> {
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            // Keeps the coroutine anchored on the main stack while it runs
            let _guard = StackGuard::new(state);
            let co = self.coroutine(&core, state)?;
            if co == state {
                return Err(Error::InvalidOperation(
                    "cannot resume the main thread".to_string(),
                ));
            }
            let status = status_of(co);
            if !status.is_resumable() {
                return Err(Error::InvalidOperation(format!(
                    "cannot resume a {} thread",
                    status
                )));
            }

            marshal::push_all(&core, co, args)?;
            // push_all bounded args.len() to c_int
            let nargs = args.len() as c_int;
            let mut nres: c_int = 0;
            match ffi::lua_resume(co, state, nargs, &mut nres) {
                ffi::LUA_OK | ffi::LUA_YIELD => {
                    let top = ffi::lua_gettop(co);
                    let pulled = marshal::pull_range(&core, co, top - nres + 1, top);
                    ffi::lua_pop(co, nres);
                    Ok(Results::new(pulled?))
                }
                status => Err(call_error(co, status)),
            }
        }
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

    /// Push the thread onto `state` and return its state pointer
    ///
    /// The caller's guard pops it again.
    unsafe fn coroutine(&self, core: &Rc<EnvCore>, state: State) -> Result<State> {
        unsafe {
            ensure_capacity(state, 1)?;
            self.0.push(core, state)?;
            Ok(ffi::lua_tothread(state, -1))
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({:?})", self.0)
    }
}

/// Status of a coroutine other than the main thread
unsafe fn status_of(co: State) -> ThreadStatus {
    unsafe {
        match ffi::lua_status(co) {
            ffi::LUA_YIELD => ThreadStatus::Suspended,
            ffi::LUA_OK => {
                let mut ar = MaybeUninit::<ffi::lua_Debug>::uninit();
                if ffi::lua_getstack(co, 0, ar.as_mut_ptr()) > 0 {
                    ThreadStatus::Running
                } else if ffi::lua_gettop(co) == 0 {
                    ThreadStatus::Finished
                } else {
                    ThreadStatus::NotStarted
                }
            }
            _ => ThreadStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    #[test]
    fn test_yield_then_finish() {
        let env = Environment::new().unwrap();
        let body = env
            .load(
                "local a = ... ; local b = coroutine.yield(a + 1) ; return a + b",
                "=body",
            )
            .unwrap();
        let thread = env.create_thread(&body).unwrap();
        assert_eq!(thread.status().unwrap(), ThreadStatus::NotStarted);
        assert!(thread.can_start());

        let first = thread.resume(&[Value::Integer(10)]).unwrap();
        assert_eq!(first.as_slice(), &[Value::Integer(11)]);
        assert_eq!(thread.status().unwrap(), ThreadStatus::Suspended);
        assert!(thread.can_resume());
        assert!(!thread.can_start());

        let second = thread.resume(&[Value::Integer(5)]).unwrap();
        assert_eq!(second.as_slice(), &[Value::Integer(15)]);
        assert_eq!(thread.status().unwrap(), ThreadStatus::Finished);
        assert!(!thread.can_resume());
        assert_eq!(env.stack_depth().unwrap(), 0);
    }

    #[test]
    fn test_failed_thread_is_not_resumable() {
        let env = Environment::new().unwrap();
        let body = env.load("error('nope', 0)", "=body").unwrap();
        let thread = env.create_thread(&body).unwrap();
        assert_eq!(
            thread.resume(&[]).unwrap_err(),
            Error::Runtime("nope".to_string())
        );
        assert_eq!(thread.status().unwrap(), ThreadStatus::Failed);
        assert!(matches!(
            thread.resume(&[]),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(env.stack_depth().unwrap(), 0);
    }

    #[test]
    fn test_threads_from_scripts() {
        let env = Environment::new().unwrap();
        let thread = env
            .eval("return coroutine.create(function() coroutine.yield('tick') end)")
            .unwrap()[0]
            .to_thread()
            .unwrap();
        assert_eq!(thread.resume(&[]).unwrap()[0], Value::from("tick"));
        assert_eq!(thread.resume(&[]).unwrap().len(), 0);
        assert_eq!(thread.status().unwrap(), ThreadStatus::Finished);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ThreadStatus::NotStarted.to_string(), "not started");
        assert!(!ThreadStatus::Running.is_resumable());
    }
}
