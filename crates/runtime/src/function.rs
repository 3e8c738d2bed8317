//! Function proxy and the protected-call path shared with `eval`

use crate::environment::EnvCore;
use crate::marshal;
use crate::refs::ForeignRef;
use crate::results::Results;
use crate::stack::{State, StackGuard, call_error, ensure_capacity, traceback_handler};
use crate::value::Value;
use mlua_sys as ffi;
use moonlink_core::Result;
use std::ffi::c_int;
use std::fmt;
use std::rc::Rc;

/// A callable interpreter value (function or closure)
#[derive(Clone, PartialEq, Eq)]
pub struct Function(pub(crate) ForeignRef);

impl Function {
    /// Call with `args` in protected mode and collect every result
    ///
    /// Interpreter errors come back as `Error::Runtime` carrying the error
    /// message (with a traceback when the environment enables it).
    pub fn call(&self, args: &[Value]) -> Result<Results> {
        let core = self.0.env()?;
        let state = core.state()?;
        unsafe {
            // callee + arguments
            ensure_capacity(state, args.len() + 1)?;
            let _guard = StackGuard::new(state);
            self.0.push(&core, state)?;
            invoke(&core, state, args)
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
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:?})", self.0)
    }
}

/// Call the function on top of the stack with `args`
///
/// Leaves the stack above the callee's slot in an unspecified state; callers
/// hold a `StackGuard` taken below the callee.
///
/// # Safety
/// `state` must be a live state of `core` with a function on top.
pub(crate) unsafe fn invoke(core: &Rc<EnvCore>, state: State, args: &[Value]) -> Result<Results> {
    unsafe {
        // arguments + message handler
        ensure_capacity(state, args.len() + 1)?;

        let msgh = if core.config.traceback {
            ffi::lua_pushcfunction(state, traceback_handler);
            ffi::lua_insert(state, -2);
            ffi::lua_gettop(state) - 1
        } else {
            0
        };
        let callee = ffi::lua_gettop(state);

        marshal::push_all(core, state, args)?;
        // ensure_capacity bounded args.len() to c_int
        let nargs = args.len() as c_int;
        let status = ffi::lua_pcall(state, nargs, ffi::LUA_MULTRET, msgh);
        if status != ffi::LUA_OK {
            return Err(call_error(state, status));
        }

        let values = marshal::pull_range(core, state, callee, ffi::lua_gettop(state))?;
        Ok(Results::new(values))
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::value::Value;
    use moonlink_core::{EnvironmentConfig, Error};

    #[test]
    fn test_call_with_arguments() {
        let env = Environment::new().unwrap();
        let add = env
            .eval("return function(a, b) return a + b, a * b end")
            .unwrap()
            .first()
            .unwrap()
            .to_function()
            .unwrap();
        let results = add.call(&[Value::Integer(3), Value::Integer(4)]).unwrap();
        assert_eq!(results.as_slice(), &[Value::Integer(7), Value::Integer(12)]);
        assert_eq!(env.stack_depth().unwrap(), 0);
    }

    #[test]
    fn test_runtime_error_carries_message() {
        let env = Environment::new().unwrap();
        let f = env.load("error('boom')", "=thrower").unwrap();
        match f.call(&[]).unwrap_err() {
            Error::Runtime(message) => assert_eq!(message, "thrower:1: boom"),
            other => panic!("expected a runtime error, got {:?}", other),
        }
        assert_eq!(env.stack_depth().unwrap(), 0);
    }

    #[test]
    fn test_non_string_error_object() {
        let env = Environment::new().unwrap();
        let f = env.load("error({})", "=thrower").unwrap();
        assert_eq!(
            f.call(&[]).unwrap_err(),
            Error::Runtime("(error object is a table value)".to_string())
        );
    }

    #[test]
    fn test_traceback_is_appended() {
        let env = Environment::with_config(EnvironmentConfig::new().with_traceback(true)).unwrap();
        let f = env.load("local function inner() error('deep') end inner()", "=tb").unwrap();
        match f.call(&[]).unwrap_err() {
            Error::Runtime(message) => {
                assert!(message.starts_with("tb:1: deep"), "{}", message);
                assert!(message.contains("stack traceback:"), "{}", message);
            }
            other => panic!("expected a runtime error, got {:?}", other),
        }
        assert_eq!(env.stack_depth().unwrap(), 0);
    }

    #[test]
    fn test_disposed_function() {
        let env = Environment::new().unwrap();
        let f = env.load("return 1", "=f").unwrap();
        let alias = f.clone();
        f.dispose();
        f.dispose();
        assert!(alias.is_disposed());
        assert_eq!(alias.call(&[]).unwrap_err(), Error::Disposed("function"));
    }
}
