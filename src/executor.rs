//! Executors: symbols bound to a device and concrete arrays.

use std::collections::HashMap;
use std::ptr;

use libc::c_int;

use crate::api::sys::{mx_uint, ExecutorHandle, NDArrayHandle};
use crate::context::Context;
use crate::error::{check, Error, Result};
use crate::marshal::checked_uint;
use crate::ndarray::NDArray;
use crate::symbol::Symbol;

/// Head gradients for [`Executor::backward`].
#[derive(Debug)]
pub enum OutGrads<'a> {
    /// No explicit head gradients.
    None,
    /// One gradient for a single-output graph.
    Single(&'a NDArray),
    /// Gradients in `list_outputs` order.
    Ordered(&'a [&'a NDArray]),
    /// Gradients keyed by output name; every listed output needs an entry.
    Named(&'a [(&'a str, &'a NDArray)]),
}

/// A bound computation graph.
///
/// The executor retains the arrays it was bound over together with a copy
/// of the symbol and the device context. Fresh input flows in through
/// [`forward`](Self::forward)'s named inputs or by writing into the
/// retained argument arrays directly.
#[derive(Debug)]
pub struct Executor {
    handle: ExecutorHandle,
    symbol: Symbol,
    context: Context,
    arg_slots: HashMap<String, usize>,
    arg_arrays: Vec<NDArray>,
    grad_arrays: Vec<Option<NDArray>>,
    aux_arrays: Vec<NDArray>,
}

// The retained parts are Send and the native engine guards the bound
// graph's state itself.
unsafe impl Send for Executor {}

impl Executor {
    pub(crate) fn from_bind(
        handle: ExecutorHandle,
        symbol: Symbol,
        context: Context,
        arg_slots: HashMap<String, usize>,
        arg_arrays: Vec<NDArray>,
        grad_arrays: Vec<Option<NDArray>>,
        aux_arrays: Vec<NDArray>,
    ) -> Self {
        Executor {
            handle,
            symbol,
            context,
            arg_slots,
            arg_arrays,
            grad_arrays,
            aux_arrays,
        }
    }

    pub(crate) fn handle(&self) -> ExecutorHandle {
        self.handle
    }

    /// The graph's current outputs, freshly wrapped on every call.
    pub fn outputs(&self) -> Result<Vec<NDArray>> {
        let api = crate::api::table()?;
        let mut size: mx_uint = 0;
        let mut handles: *mut NDArrayHandle = ptr::null_mut();
        // SAFETY: the call fills size and handles; the handle array stays
        // valid until the next call into the library.
        unsafe {
            check(
                api,
                (api.mx_executor_outputs)(self.handle, &mut size, &mut handles),
            )?;
            if size == 0 {
                return Ok(Vec::new());
            }
            let raw = std::slice::from_raw_parts(handles, size as usize);
            Ok(raw.iter().map(|&h| NDArray::from_handle(h)).collect())
        }
    }

    /// Runs the forward pass and returns the outputs.
    ///
    /// Each named input must name a bound argument and match its shape;
    /// the supplied array is copied into the bound slot before the pass.
    pub fn forward(
        &self,
        is_train: bool,
        named_inputs: &[(&str, &NDArray)],
    ) -> Result<Vec<NDArray>> {
        for (name, supplied) in named_inputs {
            let slot = match self.arg_slots.get(*name) {
                Some(&idx) => &self.arg_arrays[idx],
                None => return Err(Error::TypeError(format!("Unknown argument {name}"))),
            };
            let expected = slot.shape()?;
            let received = supplied.shape()?;
            if expected != received {
                return Err(Error::ShapeMismatch {
                    name: (*name).to_owned(),
                    expected,
                    received,
                });
            }
            supplied.copy_to(slot)?;
        }

        let api = crate::api::table()?;
        // SAFETY: the handle is live.
        unsafe {
            check(api, (api.mx_executor_forward)(self.handle, is_train as c_int))?;
        }
        self.outputs()
    }

    /// Runs the backward pass, accumulating into the bound gradient
    /// arrays per the binding's gradient requests.
    pub fn backward(&self, out_grads: OutGrads<'_>, is_train: bool) -> Result<()> {
        let handles: Vec<NDArrayHandle> = match out_grads {
            OutGrads::None => Vec::new(),
            OutGrads::Single(grad) => vec![grad.handle()],
            OutGrads::Ordered(grads) => grads.iter().map(|grad| grad.handle()).collect(),
            OutGrads::Named(named) => {
                let outputs = self.symbol.list_outputs()?;
                let mut handles = Vec::with_capacity(outputs.len());
                for output in &outputs {
                    match named.iter().find(|(name, _)| *name == output.as_str()) {
                        Some((_, grad)) => handles.push(grad.handle()),
                        None => return Err(Error::TypeError("inputs must be NDArray".into())),
                    }
                }
                handles
            }
        };

        let api = crate::api::table()?;
        let len = checked_uint(handles.len(), "head gradients")?;
        // SAFETY: the handle vector stays alive across the call.
        unsafe {
            check(
                api,
                (api.mx_executor_backward_ex)(
                    self.handle,
                    len,
                    handles.as_ptr(),
                    is_train as c_int,
                ),
            )
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn arg_arrays(&self) -> &[NDArray] {
        &self.arg_arrays
    }

    pub fn grad_arrays(&self) -> &[Option<NDArray>] {
        &self.grad_arrays
    }

    pub fn aux_arrays(&self) -> &[NDArray] {
        &self.aux_arrays
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Ok(api) = crate::api::table() {
            // SAFETY: the wrapper owns its handle and frees it exactly
            // once. The retained arrays free themselves afterwards.
            unsafe {
                (api.mx_executor_free)(self.handle);
            }
        }
    }
}
