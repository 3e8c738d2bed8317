//! Rust objects inside the interpreter heap
//!
//! A Rust object crosses into the interpreter as a full userdata block that
//! owns one strong reference to it. The first byte of the block is a marker
//! saying what the reference points at:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────────────┐
//! │ marker: u8 │ (padding)    │ handle: *const _ (Rc strong) │
//! └────────────┴──────────────┴──────────────────────────────┘
//!   0 = object instance  -> Rc<NativeCell>
//!   1 = type descriptor  -> Rc<TypeDescriptor>
//! ```
//!
//! Blocks carry the `moonlink.native` metatable, whose `__gc` gives the strong
//! reference back when the interpreter collects the block. Pulling a block
//! clones the reference, so the same Rust object comes back out.

use crate::stack::{State, ensure_capacity};
use mlua_sys as ffi;
use moonlink_core::{Result, format_panic_payload};
use std::any::{Any, TypeId};
use std::ffi::{CStr, c_int, c_void};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

/// Metatable name for native blocks
pub(crate) const NATIVE_METATABLE: &CStr = c"moonlink.native";

pub(crate) const MARKER_OBJECT: u8 = 0;
pub(crate) const MARKER_TYPE: u8 = 1;

#[repr(C)]
struct NativeBlock {
    marker: u8,
    handle: *const c_void,
}

struct NativeCell {
    object: Box<dyn Any>,
    type_name: &'static str,
}

/// A Rust object shared with the interpreter
///
/// Clones share the object; equality is identity.
#[derive(Clone)]
pub struct NativeObject(Rc<NativeCell>);

impl NativeObject {
    pub fn new<T: 'static>(object: T) -> Self {
        NativeObject(Rc::new(NativeCell {
            object: Box::new(object),
            type_name: std::any::type_name::<T>(),
        }))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.object.downcast_ref::<T>()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.object.is::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for NativeObject {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for NativeObject {}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeObject({} @ {:#x})", self.0.type_name, self.identity())
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

/// A Rust type handed to the interpreter, for static access and construction
///
/// Two descriptors are equal when they describe the same type.
#[derive(Clone)]
pub struct NativeType(Rc<TypeDescriptor>);

impl NativeType {
    pub fn of<T: 'static>() -> Self {
        NativeType(Rc::new(TypeDescriptor {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }))
    }

    pub fn type_id(&self) -> TypeId {
        self.0.id
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.id == TypeId::of::<T>()
    }
}

impl PartialEq for NativeType {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for NativeType {}

impl Hash for NativeType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeType({})", self.0.name)
    }
}

/// Create the native metatable in a fresh state
///
/// # Safety
/// `state` must be a live interpreter state.
pub(crate) unsafe fn register_metatable(state: State) -> Result<()> {
    unsafe {
        ensure_capacity(state, 2)?;
        if ffi::luaL_newmetatable(state, NATIVE_METATABLE.as_ptr()) != 0 {
            ffi::lua_pushcfunction(state, native_gc);
            ffi::lua_setfield(state, -2, c"__gc".as_ptr());
            ffi::lua_pushboolean(state, 0);
            ffi::lua_setfield(state, -2, c"__metatable".as_ptr());
        }
        ffi::lua_pop(state, 1);
    }
    Ok(())
}

/// Push a native object as a fresh userdata block
///
/// # Safety
/// `state` must be a live interpreter state with the native metatable registered.
pub(crate) unsafe fn push_object(state: State, object: &NativeObject) -> Result<()> {
    let raw = Rc::into_raw(Rc::clone(&object.0)) as *const c_void;
    let pushed = unsafe { push_block(state, MARKER_OBJECT, raw) };
    if pushed.is_err() {
        drop(unsafe { Rc::from_raw(raw as *const NativeCell) });
    }
    pushed
}

/// Push a type descriptor as a fresh userdata block
///
/// # Safety
/// `state` must be a live interpreter state with the native metatable registered.
pub(crate) unsafe fn push_type(state: State, ty: &NativeType) -> Result<()> {
    let raw = Rc::into_raw(Rc::clone(&ty.0)) as *const c_void;
    let pushed = unsafe { push_block(state, MARKER_TYPE, raw) };
    if pushed.is_err() {
        drop(unsafe { Rc::from_raw(raw as *const TypeDescriptor) });
    }
    pushed
}

unsafe fn push_block(state: State, marker: u8, handle: *const c_void) -> Result<()> {
    unsafe {
        // block + metatable during luaL_setmetatable
        ensure_capacity(state, 2)?;
        let block =
            ffi::lua_newuserdatauv(state, std::mem::size_of::<NativeBlock>(), 0) as *mut NativeBlock;
        block.write(NativeBlock { marker, handle });
        ffi::luaL_setmetatable(state, NATIVE_METATABLE.as_ptr());
    }
    Ok(())
}

/// What a native block at `index` holds, if it is one
pub(crate) enum NativePayload {
    Object(NativeObject),
    Type(NativeType),
}

/// Read a native block without popping it
///
/// Returns `None` for userdata that is not a native block (foreign userdata)
/// or for a block whose reference was already given back.
///
/// # Safety
/// `state` must be a live interpreter state and `index` a valid userdata slot.
pub(crate) unsafe fn pull(state: State, index: c_int) -> Result<Option<NativePayload>> {
    unsafe {
        // luaL_testudata pushes the metatable for comparison
        ensure_capacity(state, 2)?;
        let block = ffi::luaL_testudata(state, index, NATIVE_METATABLE.as_ptr()) as *const NativeBlock;
        if block.is_null() || (*block).handle.is_null() {
            return Ok(None);
        }
        let NativeBlock { marker, handle } = block.read();
        let payload = match marker {
            MARKER_OBJECT => {
                let cell = handle as *const NativeCell;
                Rc::increment_strong_count(cell);
                NativePayload::Object(NativeObject(Rc::from_raw(cell)))
            }
            MARKER_TYPE => {
                let desc = handle as *const TypeDescriptor;
                Rc::increment_strong_count(desc);
                NativePayload::Type(NativeType(Rc::from_raw(desc)))
            }
            _ => return Ok(None),
        };
        Ok(Some(payload))
    }
}

/// `__gc` for native blocks: give the strong reference back
unsafe extern "C-unwind" fn native_gc(state: State) -> c_int {
    unsafe {
        let block = ffi::lua_touserdata(state, 1) as *mut NativeBlock;
        if block.is_null() || (*block).handle.is_null() {
            return 0;
        }
        let NativeBlock { marker, handle } = block.read();
        (*block).handle = std::ptr::null();

        // Drop runs arbitrary Rust code; a panic must not unwind into the interpreter
        let released = catch_unwind(AssertUnwindSafe(|| match marker {
            MARKER_OBJECT => drop(Rc::from_raw(handle as *const NativeCell)),
            MARKER_TYPE => drop(Rc::from_raw(handle as *const TypeDescriptor)),
            other => tracing::warn!(marker = other, "native block with unknown marker"),
        }));
        if let Err(payload) = released {
            tracing::warn!(
                panic = %format_panic_payload(&payload),
                "panic while dropping a native object"
            );
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast() {
        let obj = NativeObject::new(String::from("payload"));
        assert!(obj.is::<String>());
        assert!(!obj.is::<u32>());
        assert_eq!(obj.downcast_ref::<String>().unwrap(), "payload");
        assert!(obj.type_name().contains("String"));
    }

    #[test]
    fn test_type_descriptor_equality() {
        assert_eq!(NativeType::of::<u32>(), NativeType::of::<u32>());
        assert_ne!(NativeType::of::<u32>(), NativeType::of::<i32>());
        assert!(NativeType::of::<Vec<u8>>().is::<Vec<u8>>());
    }

    #[test]
    fn test_block_round_trip_keeps_identity() {
        unsafe {
            let state = ffi::luaL_newstate();
            register_metatable(state).unwrap();

            let obj = NativeObject::new(7u64);
            push_object(state, &obj).unwrap();
            assert_eq!(Rc::strong_count(&obj.0), 2);

            match pull(state, -1).unwrap() {
                Some(NativePayload::Object(back)) => assert_eq!(back, obj),
                _ => panic!("expected a native object"),
            }

            ffi::lua_pop(state, 1);
            ffi::lua_gc(state, ffi::LUA_GCCOLLECT, 0);
            assert_eq!(Rc::strong_count(&obj.0), 1);

            ffi::lua_close(state);
        }
    }

    #[test]
    fn test_foreign_userdata_is_not_native() {
        unsafe {
            let state = ffi::luaL_newstate();
            register_metatable(state).unwrap();
            ffi::lua_newuserdatauv(state, 8, 0);
            assert!(pull(state, -1).unwrap().is_none());
            ffi::lua_close(state);
        }
    }

    #[test]
    fn test_close_releases_blocks() {
        let obj = NativeObject::new(vec![1u8, 2, 3]);
        unsafe {
            let state = ffi::luaL_newstate();
            register_metatable(state).unwrap();
            push_type(state, &NativeType::of::<u8>()).unwrap();
            push_object(state, &obj).unwrap();
            ffi::lua_close(state);
        }
        assert_eq!(Rc::strong_count(&obj.0), 1);
    }
}
