//! Moonlink Runtime: values and objects shared between Rust and an embedded
//! Lua interpreter
//!
//! Key design principles:
//! - Value: a 16-byte tagged union for everything that crosses the boundary
//! - Proxies (`Table`, `Function`, `Thread`, `UserData`): interned per
//!   interpreter object, so the same object always comes back as the same proxy
//! - Reclamation: dropped proxies are released on the interpreter's own GC
//!   cadence through a self re-arming sentinel finalizer
//! - Stack discipline: every operation leaves the interpreter stack at the
//!   depth it found it, on success and on error
//!
//! ```no_run
//! use moonlink_runtime::{Environment, Value};
//!
//! let env = Environment::new()?;
//! env.set_global("x", "hi")?;
//! env.eval("assert(x == 'hi')")?;
//! assert_eq!(env.eval("return 1 + 1")?[0], Value::Integer(2));
//! # Ok::<(), moonlink_runtime::Error>(())
//! ```

pub mod environment;
pub mod function;
mod hook;
mod marshal;
pub mod native;
mod refs;
pub mod results;
mod stack;
pub mod table;
pub mod thread;
pub mod userdata;
pub mod value;

pub use environment::{Environment, EnvironmentStats};
pub use function::Function;
pub use native::{NativeObject, NativeType};
pub use results::Results;
pub use table::Table;
pub use thread::{Thread, ThreadStatus};
pub use userdata::UserData;
pub use value::{LightUserData, LuaString, Value};

pub use moonlink_core::{EnvironmentConfig, Error, Result};
