//! Cached operators: a symbol compiled once and invoked repeatedly.

use std::ptr;

use libc::c_int;

use crate::api::sys::{CachedOpHandle, NDArrayHandle};
use crate::error::{check, Result};
use crate::marshal::{checked_int, AttrPairs};
use crate::ndarray::NDArray;
use crate::ops::Outputs;
use crate::symbol::Symbol;

/// A graph cached on the native side for fast repeated invocation.
#[derive(Debug)]
pub struct CachedOp {
    handle: CachedOpHandle,
}

// The cached graph is immutable after creation; the engine serializes
// invocation internally.
unsafe impl Send for CachedOp {}

impl CachedOp {
    /// Caches `symbol` with the given stringified creation flags.
    pub fn new(symbol: &Symbol, flags: &[(&str, String)]) -> Result<Self> {
        let api = crate::api::table()?;

        let mut pairs = AttrPairs::with_capacity(flags.len());
        for (key, value) in flags {
            pairs.push(key, value)?;
        }
        let num_flags = pairs.count_int("flags")?;
        let key_ptrs = pairs.key_ptrs();
        let val_ptrs = pairs.val_ptrs();

        let mut handle: CachedOpHandle = ptr::null_mut();
        // SAFETY: the flag arrays are backed by pairs for the duration of
        // the call.
        unsafe {
            check(
                api,
                (api.mx_create_cached_op_ex)(
                    symbol.handle(),
                    num_flags,
                    key_ptrs.as_ptr(),
                    val_ptrs.as_ptr(),
                    &mut handle,
                ),
            )?;
        }
        Ok(CachedOp { handle })
    }

    /// Runs the cached graph over `inputs`, wrapping whatever it produced
    /// under the single-vs-list rule.
    pub fn invoke(&self, inputs: &[&NDArray]) -> Result<Outputs> {
        self.run(inputs, None)
    }

    /// Runs the cached graph writing results into the `out` arrays; the
    /// caller keeps ownership of its buffers.
    pub fn invoke_into(&self, inputs: &[&NDArray], out: &[&NDArray]) -> Result<()> {
        self.run(inputs, Some(out)).map(|_| ())
    }

    fn run(&self, inputs: &[&NDArray], out: Option<&[&NDArray]>) -> Result<Outputs> {
        let api = crate::api::table()?;

        let input_handles: Vec<NDArrayHandle> = inputs.iter().map(|a| a.handle()).collect();
        let num_inputs = checked_int(input_handles.len(), "inputs")?;

        let mut out_handles: Vec<NDArrayHandle> = out
            .map(|arrays| arrays.iter().map(|a| a.handle()).collect())
            .unwrap_or_default();
        let mut num_outputs: c_int = match out {
            Some(arrays) => checked_int(arrays.len(), "outputs")?,
            None => 0,
        };
        let mut outputs_ptr: *mut NDArrayHandle = if out.is_some() {
            out_handles.as_mut_ptr()
        } else {
            ptr::null_mut()
        };
        // Storage types of the outputs; reported by the native side but
        // not surfaced here.
        let mut out_stypes: *const c_int = ptr::null();

        // SAFETY: every pointer borrows a local that outlives the call.
        let status = unsafe {
            (api.mx_invoke_cached_op_ex)(
                self.handle,
                num_inputs,
                input_handles.as_ptr(),
                &mut num_outputs,
                &mut outputs_ptr,
                &mut out_stypes,
            )
        };
        check(api, status)?;

        if out.is_some() || num_outputs == 0 {
            return Ok(Outputs::None);
        }
        // SAFETY: without caller buffers the native side returned
        // `num_outputs` fresh handles; ownership passes to the wrappers.
        let fresh = unsafe { std::slice::from_raw_parts(outputs_ptr, num_outputs as usize) };
        match fresh {
            [one] => Ok(Outputs::One(NDArray::from_handle(*one))),
            many => Ok(Outputs::List(
                many.iter().map(|&h| NDArray::from_handle(h)).collect(),
            )),
        }
    }
}

impl Drop for CachedOp {
    fn drop(&mut self) {
        if let Ok(api) = crate::api::table() {
            // SAFETY: the wrapper owns its handle and frees it exactly once.
            unsafe {
                (api.mx_free_cached_op)(self.handle);
            }
        }
    }
}
