//! Key-value store wrappers for parameter synchronization.
//!
//! The native store keeps one array per key and aggregates pushes before
//! they land. Keys come in two families, integers and names; a batch must
//! stay inside one family because the native API splits into plain and
//! `Ex` entry points. Updaters installed through [`KVStore::set_updater`]
//! run on whatever thread the native engine delivers them on.

use std::ffi::CString;
use std::ptr;

use libc::c_int;

use crate::api::sys::{KVStoreHandle, NDArrayHandle};
use crate::callback;
use crate::error::{check, Error, Result};
use crate::marshal::{checked_uint, cstr_to_string, cstring_ptrs, pin_cstring, AttrPairs};
use crate::ndarray::NDArray;

/// A store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KvKey {
    Int(i32),
    Name(String),
}

/// Keys for one store operation.
#[derive(Debug, Clone)]
pub enum Keys<'a> {
    One(KvKey),
    Many(&'a [KvKey]),
}

impl From<i32> for Keys<'_> {
    fn from(key: i32) -> Self {
        Keys::One(KvKey::Int(key))
    }
}

impl From<&str> for Keys<'_> {
    fn from(key: &str) -> Self {
        Keys::One(KvKey::Name(key.to_owned()))
    }
}

impl From<KvKey> for Keys<'_> {
    fn from(key: KvKey) -> Self {
        Keys::One(key)
    }
}

impl<'a> From<&'a [KvKey]> for Keys<'a> {
    fn from(keys: &'a [KvKey]) -> Self {
        Keys::Many(keys)
    }
}

/// Value arrays for one store operation. One key paired with many arrays
/// broadcasts the key across all of them.
#[derive(Debug, Clone, Copy)]
pub enum Vals<'a> {
    One(&'a NDArray),
    Many(&'a [NDArray]),
}

impl<'a> From<&'a NDArray> for Vals<'a> {
    fn from(array: &'a NDArray) -> Self {
        Vals::One(array)
    }
}

impl<'a> From<&'a [NDArray]> for Vals<'a> {
    fn from(arrays: &'a [NDArray]) -> Self {
        Vals::Many(arrays)
    }
}

impl<'a> From<&'a Vec<NDArray>> for Vals<'a> {
    fn from(arrays: &'a Vec<NDArray>) -> Self {
        Vals::Many(arrays)
    }
}

/// A handle to one native key-value store.
#[derive(Debug)]
pub struct KVStore {
    handle: KVStoreHandle,
}

unsafe impl Send for KVStore {}

impl KVStore {
    /// Creates a store of the given kind, "local" being the conventional
    /// single-process choice.
    pub fn create(kind: &str) -> Result<Self> {
        let api = crate::api::table()?;
        let kind = pin_cstring(kind)?;
        let mut handle: KVStoreHandle = ptr::null_mut();
        // SAFETY: kind is NUL-terminated and outlives the call.
        unsafe {
            check(api, (api.mx_kv_store_create)(kind.as_ptr(), &mut handle))?;
        }
        Ok(KVStore { handle })
    }

    /// Creates a "local" store.
    pub fn local() -> Result<Self> {
        Self::create("local")
    }

    /// The store's kind as reported by the native side.
    pub fn kind(&self) -> Result<String> {
        let api = crate::api::table()?;
        let mut kind: *const libc::c_char = ptr::null();
        // SAFETY: the call fills kind before it is read.
        unsafe {
            check(api, (api.mx_kv_store_get_type)(self.handle, &mut kind))?;
            cstr_to_string(kind)
        }
    }

    /// Creates the given keys with their initial values.
    pub fn init<'a>(&self, keys: impl Into<Keys<'a>>, vals: impl Into<Vals<'a>>) -> Result<()> {
        let keys = keys.into();
        let vals = vals.into();
        let (lowered, handles) = lower(&keys, &vals)?;

        let api = crate::api::table()?;
        let num = checked_uint(handles.len(), "key value lengths")?;
        match &lowered {
            LoweredKeys::Int(ids) => {
                // SAFETY: the parallel key and handle arrays are backed by
                // locals for the duration of the call.
                unsafe {
                    check(
                        api,
                        (api.mx_kv_store_init)(self.handle, num, ids.as_ptr(), handles.as_ptr()),
                    )
                }
            }
            LoweredKeys::Str(names) => {
                let key_ptrs = cstring_ptrs(names);
                // SAFETY: as above; the pinned strings outlive the call.
                unsafe {
                    check(
                        api,
                        (api.mx_kv_store_init_ex)(
                            self.handle,
                            num,
                            key_ptrs.as_ptr(),
                            handles.as_ptr(),
                        ),
                    )
                }
            }
        }
    }

    /// Pushes values into the store. Pushes with the same priority land in
    /// issue order; higher priorities may overtake.
    pub fn push<'a>(
        &self,
        keys: impl Into<Keys<'a>>,
        vals: impl Into<Vals<'a>>,
        priority: i32,
    ) -> Result<()> {
        let keys = keys.into();
        let vals = vals.into();
        let (lowered, handles) = lower(&keys, &vals)?;

        let api = crate::api::table()?;
        let num = checked_uint(handles.len(), "key value lengths")?;
        let status = match &lowered {
            LoweredKeys::Int(ids) => {
                // SAFETY: the parallel key and handle arrays are backed by
                // locals for the duration of the call.
                unsafe {
                    (api.mx_kv_store_push)(
                        self.handle,
                        num,
                        ids.as_ptr(),
                        handles.as_ptr(),
                        priority,
                    )
                }
            }
            LoweredKeys::Str(names) => {
                let key_ptrs = cstring_ptrs(names);
                // SAFETY: as above; the pinned strings outlive the call.
                unsafe {
                    (api.mx_kv_store_push_ex)(
                        self.handle,
                        num,
                        key_ptrs.as_ptr(),
                        handles.as_ptr(),
                        priority,
                    )
                }
            }
        };
        // A local store may have run the updater synchronously.
        callback::rethrow_parked();
        check(api, status)
    }

    /// Pulls current values into the `out` arrays, which are required:
    /// the store writes results, it never allocates them.
    pub fn pull<'a>(
        &self,
        keys: impl Into<Keys<'a>>,
        out: Option<Vals<'a>>,
        priority: i32,
    ) -> Result<()> {
        let out = match out {
            Some(out) => out,
            None => return Err(Error::ArgumentMissing("out")),
        };
        let keys = keys.into();
        let (lowered, handles) = lower(&keys, &out)?;

        let api = crate::api::table()?;
        let num = checked_uint(handles.len(), "key value lengths")?;
        let status = match &lowered {
            LoweredKeys::Int(ids) => {
                // SAFETY: the parallel key and handle arrays are backed by
                // locals for the duration of the call.
                unsafe {
                    (api.mx_kv_store_pull)(
                        self.handle,
                        num,
                        ids.as_ptr(),
                        handles.as_ptr(),
                        priority,
                    )
                }
            }
            LoweredKeys::Str(names) => {
                let key_ptrs = cstring_ptrs(names);
                // SAFETY: as above; the pinned strings outlive the call.
                unsafe {
                    (api.mx_kv_store_pull_ex)(
                        self.handle,
                        num,
                        key_ptrs.as_ptr(),
                        handles.as_ptr(),
                        priority,
                    )
                }
            }
        };
        callback::rethrow_parked();
        check(api, status)
    }

    /// Installs `updater` as the store's aggregation step. It is called
    /// with the key, the pushed value and the stored value; replacing the
    /// updater replaces the previous one, and the closure lives until the
    /// store drops.
    pub fn set_updater(
        &self,
        updater: impl FnMut(KvKey, NDArray, NDArray) + Send + 'static,
    ) -> Result<()> {
        let api = crate::api::table()?;
        callback::register(self.handle as usize, Box::new(updater));
        // SAFETY: the trampolines stay valid for the process lifetime and
        // look the closure up by the ctx pointer.
        unsafe {
            check(
                api,
                (api.mx_kv_store_set_updater_ex)(
                    self.handle,
                    callback::int_updater_trampoline,
                    callback::str_updater_trampoline,
                    self.handle,
                ),
            )
        }
    }

    /// Configures gradient compression. Only device and distributed store
    /// kinds support it.
    pub fn set_gradient_compression(&self, params: &[(&str, String)]) -> Result<()> {
        let kind = self.kind()?;
        if !(kind.starts_with("device") || kind.starts_with("dist")) {
            return Err(Error::InvalidArgument(
                "Gradient compression is not supported for this type of kvstore".into(),
            ));
        }

        let api = crate::api::table()?;
        let mut pairs = AttrPairs::with_capacity(params.len());
        for (key, value) in params {
            pairs.push(key, value)?;
        }
        let num_params = pairs.count_uint("compression parameters")?;
        let key_ptrs = pairs.key_ptrs();
        let val_ptrs = pairs.val_ptrs();
        // SAFETY: the key/value pointer arrays are backed by pairs for the
        // duration of the call.
        unsafe {
            check(
                api,
                (api.mx_kv_store_set_gradient_compression)(
                    self.handle,
                    num_params,
                    key_ptrs.as_ptr(),
                    val_ptrs.as_ptr(),
                ),
            )
        }
    }
}

// Two wrappers are the same store exactly when they hold the same handle.
impl PartialEq for KVStore {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for KVStore {}

impl Drop for KVStore {
    fn drop(&mut self) {
        callback::unregister(self.handle as usize);
        if let Ok(api) = crate::api::table() {
            // SAFETY: the wrapper owns its handle and frees it exactly once.
            unsafe {
                (api.mx_kv_store_free)(self.handle);
            }
        }
    }
}

#[derive(Debug)]
enum LoweredKeys {
    Int(Vec<c_int>),
    Str(Vec<CString>),
}

fn inconsistent_keys() -> Error {
    Error::InvalidArgument("inconsistent types of keys detected.".into())
}

/// Expands a key/value pairing into parallel native arrays. The first key
/// decides the family for the whole batch.
fn lower(keys: &Keys<'_>, vals: &Vals<'_>) -> Result<(LoweredKeys, Vec<NDArrayHandle>)> {
    let mut pairs: Vec<(&KvKey, NDArrayHandle)> = Vec::new();
    match (keys, vals) {
        (Keys::One(key), Vals::One(array)) => pairs.push((key, array.handle())),
        (Keys::One(key), Vals::Many(arrays)) => {
            for array in *arrays {
                pairs.push((key, array.handle()));
            }
        }
        (Keys::Many(keys), vals) => {
            let arrays: &[NDArray] = match vals {
                Vals::Many(arrays) => arrays,
                Vals::One(array) => std::slice::from_ref(*array),
            };
            if keys.len() != arrays.len() {
                return Err(Error::ArgumentMismatch("key value lengths mismatched".into()));
            }
            for (key, array) in keys.iter().zip(arrays.iter()) {
                pairs.push((key, array.handle()));
            }
        }
    }

    match pairs.first() {
        None | Some((KvKey::Int(_), _)) => {
            let mut ids = Vec::with_capacity(pairs.len());
            let mut handles = Vec::with_capacity(pairs.len());
            for (key, handle) in &pairs {
                match key {
                    KvKey::Int(id) => ids.push(*id),
                    KvKey::Name(_) => return Err(inconsistent_keys()),
                }
                handles.push(*handle);
            }
            Ok((LoweredKeys::Int(ids), handles))
        }
        Some((KvKey::Name(_), _)) => {
            let mut names = Vec::with_capacity(pairs.len());
            let mut handles = Vec::with_capacity(pairs.len());
            for (key, handle) in &pairs {
                match key {
                    KvKey::Name(name) => names.push(pin_cstring(name)?),
                    KvKey::Int(_) => return Err(inconsistent_keys()),
                }
                handles.push(*handle);
            }
            Ok((LoweredKeys::Str(names), handles))
        }
    }
}
