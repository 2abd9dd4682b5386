//! Autograd recording state and the gradient entry points.
//!
//! The native library keeps two thread-local flags: whether operations
//! are recorded into a gradient graph, and whether operators run in
//! training mode. Both setters return the previous value; the scope
//! guards here flip a flag for a lexical region and put the old value
//! back on drop.

use std::ptr;

use libc::c_int;

use crate::api::sys::{mx_uint, NDArrayHandle};
use crate::error::{check, Error, Result};
use crate::marshal::checked_uint;
use crate::ndarray::NDArray;
use crate::symbol::GradReq;

/// Turns gradient recording on or off, returning the previous state.
pub fn set_recording(recording: bool) -> Result<bool> {
    let api = crate::api::table()?;
    let mut prev: c_int = 0;
    check(api, unsafe {
        (api.mx_autograd_set_is_recording)(recording as c_int, &mut prev)
    })?;
    Ok(prev != 0)
}

/// Switches operators between training and prediction behavior,
/// returning the previous state.
pub fn set_training(training: bool) -> Result<bool> {
    let api = crate::api::table()?;
    let mut prev: c_int = 0;
    check(api, unsafe {
        (api.mx_autograd_set_is_training)(training as c_int, &mut prev)
    })?;
    Ok(prev != 0)
}

/// Whether operations are currently recorded for gradient computation.
pub fn is_recording() -> Result<bool> {
    let api = crate::api::table()?;
    let mut curr: u8 = 0;
    check(api, unsafe { (api.mx_autograd_is_recording)(&mut curr) })?;
    Ok(curr != 0)
}

/// Whether operators currently run in training mode.
pub fn is_training() -> Result<bool> {
    let api = crate::api::table()?;
    let mut curr: u8 = 0;
    check(api, unsafe { (api.mx_autograd_is_training)(&mut curr) })?;
    Ok(curr != 0)
}

/// Restores the autograd flags it changed when dropped.
#[must_use = "the previous mode is restored when the guard drops"]
#[derive(Debug)]
pub struct ScopeGuard {
    restore_recording: Option<bool>,
    restore_training: Option<bool>,
}

/// Records operations into a gradient graph (training mode) until the
/// guard drops.
pub fn record() -> Result<ScopeGuard> {
    with_state(Some(true), Some(true))
}

/// Suspends recording (prediction mode) until the guard drops.
pub fn pause() -> Result<ScopeGuard> {
    with_state(Some(false), Some(false))
}

/// Runs operators in training mode without touching recording.
pub fn train_mode() -> Result<ScopeGuard> {
    with_state(None, Some(true))
}

/// Runs operators in prediction mode without touching recording.
pub fn predict_mode() -> Result<ScopeGuard> {
    with_state(None, Some(false))
}

fn with_state(recording: Option<bool>, training: Option<bool>) -> Result<ScopeGuard> {
    let mut guard = ScopeGuard {
        restore_recording: None,
        restore_training: None,
    };
    // A flag is restored only when this guard actually changed it. If the
    // second set fails the half-built guard drops and undoes the first.
    if let Some(flag) = recording {
        let prev = set_recording(flag)?;
        if prev != flag {
            guard.restore_recording = Some(prev);
        }
    }
    if let Some(flag) = training {
        let prev = set_training(flag)?;
        if prev != flag {
            guard.restore_training = Some(prev);
        }
    }
    Ok(guard)
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.restore_recording.take() {
            let _ = set_recording(prev);
        }
        if let Some(prev) = self.restore_training.take() {
            let _ = set_training(prev);
        }
    }
}

/// Marks arrays as gradient roots, attaching a gradient buffer and a
/// write policy to each.
pub fn mark_variables(
    arrays: &[&NDArray],
    gradients: &[&NDArray],
    reqs: &[GradReq],
) -> Result<()> {
    if gradients.len() != arrays.len() {
        return Err(Error::ArgumentMismatch(
            "Length of gradients does not match the number of variables".to_string(),
        ));
    }
    if reqs.len() != arrays.len() {
        return Err(Error::ArgumentMismatch(
            "Length of grad_req does not match the number of variables".to_string(),
        ));
    }
    let api = crate::api::table()?;

    let var_handles: Vec<NDArrayHandle> = arrays.iter().map(|a| a.handle()).collect();
    let grad_handles: Vec<NDArrayHandle> = gradients.iter().map(|a| a.handle()).collect();
    let req_codes: Vec<mx_uint> = reqs.iter().map(|r| r.code()).collect();
    let num_var = checked_uint(var_handles.len(), "variables")?;

    // SAFETY: the three arrays are parallel and outlive the call.
    let status = unsafe {
        (api.mx_autograd_mark_variables)(
            num_var,
            var_handles.as_ptr(),
            req_codes.as_ptr(),
            grad_handles.as_ptr(),
        )
    };
    check(api, status)
}

/// Computes gradients of `heads` with respect to every marked variable.
///
/// Without explicit head gradients the native side seeds each head with
/// ones. `retain_graph` keeps the recorded graph alive for another
/// backward pass.
pub fn backward(
    heads: &[&NDArray],
    head_grads: Option<&[&NDArray]>,
    retain_graph: bool,
    train_mode: bool,
) -> Result<()> {
    if let Some(grads) = head_grads {
        if grads.len() != heads.len() {
            return Err(Error::ArgumentMismatch(
                "Length of head gradients does not match the number of heads".to_string(),
            ));
        }
    }
    let api = crate::api::table()?;

    let head_handles: Vec<NDArrayHandle> = heads.iter().map(|a| a.handle()).collect();
    let grad_handles: Vec<NDArrayHandle> = head_grads
        .map(|grads| grads.iter().map(|a| a.handle()).collect())
        .unwrap_or_default();
    let ograds = if head_grads.is_some() {
        grad_handles.as_ptr()
    } else {
        ptr::null()
    };
    let num_output = checked_uint(head_handles.len(), "heads")?;

    // SAFETY: handle arrays outlive the call; no per-variable gradient
    // readback is requested.
    let status = unsafe {
        (api.mx_autograd_backward_ex)(
            num_output,
            head_handles.as_ptr(),
            ograds,
            0,
            ptr::null(),
            retain_graph as c_int,
            0,
            train_mode as c_int,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    check(api, status)
}
