//! Bridges native updater callbacks back into Rust closures.
//!
//! The native store takes bare function pointers plus an opaque context
//! pointer, so closures live in a process-wide registry keyed by the
//! owning store's handle address and the trampolines look them up per
//! call. Panics must not unwind across the native frames; a trampoline
//! catches them and parks the payload until control returns to Rust.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use libc::{c_char, c_int, c_void};

use crate::api::sys::NDArrayHandle;
use crate::kvstore::KvKey;
use crate::ndarray::NDArray;

/// An installed store updater. Called with the key, the pushed value and
/// the stored value for every push routed through the updater.
pub(crate) type Updater = Box<dyn FnMut(KvKey, NDArray, NDArray) + Send>;

lazy_static! {
    /// Installed updaters keyed by the owning store's handle address.
    static ref UPDATERS: RwLock<HashMap<usize, Arc<Mutex<Updater>>>> =
        RwLock::new(HashMap::new());
}

thread_local! {
    /// Panic payload caught in a trampoline, parked until the native call
    /// that triggered it returns to this thread.
    static PARKED_PANIC: RefCell<Option<Box<dyn Any + Send>>> = RefCell::new(None);
}

pub(crate) fn register(handle: usize, updater: Updater) {
    UPDATERS
        .write()
        .unwrap()
        .insert(handle, Arc::new(Mutex::new(updater)));
}

pub(crate) fn unregister(handle: usize) {
    UPDATERS.write().unwrap().remove(&handle);
}

/// Resumes a panic parked by a trampoline on this thread, if any.
pub(crate) fn rethrow_parked() {
    if let Some(payload) = PARKED_PANIC.with(|slot| slot.borrow_mut().take()) {
        panic::resume_unwind(payload);
    }
}

pub(crate) unsafe extern "C" fn int_updater_trampoline(
    key: c_int,
    recv: NDArrayHandle,
    local: NDArrayHandle,
    ctx: *mut c_void,
) {
    dispatch(KvKey::Int(key), recv, local, ctx);
}

pub(crate) unsafe extern "C" fn str_updater_trampoline(
    key: *const c_char,
    recv: NDArrayHandle,
    local: NDArrayHandle,
    ctx: *mut c_void,
) {
    let key = std::ffi::CStr::from_ptr(key).to_string_lossy().into_owned();
    dispatch(KvKey::Name(key), recv, local, ctx);
}

fn dispatch(key: KvKey, recv: NDArrayHandle, local: NDArrayHandle, ctx: *mut c_void) {
    let entry = {
        let updaters = UPDATERS.read().unwrap();
        updaters.get(&(ctx as usize)).cloned()
    };
    let entry = match entry {
        Some(entry) => entry,
        // The store dropped between scheduling and delivery.
        None => return,
    };

    // The wrappers take ownership of the handles the native side minted
    // for this delivery.
    let recv = NDArray::from_handle(recv);
    let local = NDArray::from_handle(local);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // A caught panic from an earlier delivery poisons the lock; the
        // closure stays usable regardless.
        let mut updater = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        updater(key, recv, local);
    }));
    if let Err(payload) = outcome {
        PARKED_PANIC.with(|slot| *slot.borrow_mut() = Some(payload));
    }
}
