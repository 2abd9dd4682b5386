//! Operator catalog and imperative invocation.
//!
//! The native library registers its operators in a global table. On first
//! use the binding enumerates that table once and keeps an immutable
//! catalog of descriptors keyed by canonical operator name; both the
//! imperative path here and symbolic composition go through the same
//! descriptors.

use std::collections::HashMap;

use libc::{c_char, c_int};
use once_cell::sync::OnceCell;

use crate::api::sys::{mx_uint, NDArrayHandle, OpHandle};
use crate::api::MxApi;
use crate::error::{check, Error, Result};
use crate::marshal::{
    checked_int, cstr_array_to_vec, cstr_to_opt_string, cstr_to_string, pin_cstring, AttrPairs,
};
use crate::ndarray::NDArray;

/// One declared operator argument.
#[derive(Debug, Clone)]
pub struct OpArgInfo {
    pub name: String,
    pub type_info: String,
    pub description: String,
}

/// Introspected description of one native operator.
#[derive(Debug)]
pub struct OpDescriptor {
    pub name: String,
    pub description: String,
    pub args: Vec<OpArgInfo>,
    pub key_var_num_args: Option<String>,
    pub return_type: Option<String>,
    pub(crate) handle: OpHandle,
}

// Operator handles index an immutable native registry.
unsafe impl Send for OpDescriptor {}
unsafe impl Sync for OpDescriptor {}

static CATALOG: OnceCell<HashMap<String, OpDescriptor>> = OnceCell::new();

/// The full operator catalog, enumerated from the native registry on
/// first use.
pub fn all() -> Result<&'static HashMap<String, OpDescriptor>> {
    CATALOG.get_or_try_init(build_catalog)
}

/// Looks up one operator by canonical name.
pub fn get(name: &str) -> Result<&'static OpDescriptor> {
    all()?
        .get(name)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown operator: {name}")))
}

/// Runs `name` imperatively over `inputs`, wrapping whatever fresh
/// outputs the native side produces.
pub fn invoke(name: &str, inputs: &[&NDArray], params: &[(&str, String)]) -> Result<Outputs> {
    get(name)?.invoke(inputs, params)
}

/// Runs `name` writing results into the `out` arrays.
pub fn invoke_into(
    name: &str,
    inputs: &[&NDArray],
    params: &[(&str, String)],
    out: &[&NDArray],
) -> Result<()> {
    get(name)?.invoke_into(inputs, params, out)
}

impl OpDescriptor {
    /// Runs the operator imperatively over `inputs`.
    pub fn invoke(&self, inputs: &[&NDArray], params: &[(&str, String)]) -> Result<Outputs> {
        imperative(self, inputs, params, None)
    }

    /// Runs the operator writing results into the `out` arrays; the caller
    /// keeps ownership of its buffers.
    pub fn invoke_into(
        &self,
        inputs: &[&NDArray],
        params: &[(&str, String)],
        out: &[&NDArray],
    ) -> Result<()> {
        imperative(self, inputs, params, Some(out)).map(|_| ())
    }
}

/// Imperative results, following the native single-vs-list rule: zero
/// outputs collapse to `None`, exactly one is unwrapped, several stay
/// a list.
#[derive(Debug)]
pub enum Outputs {
    None,
    One(NDArray),
    List(Vec<NDArray>),
}

impl Outputs {
    pub fn len(&self) -> usize {
        match self {
            Outputs::None => 0,
            Outputs::One(_) => 1,
            Outputs::List(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sole output, failing when the operator produced none or several.
    pub fn into_single(self) -> Result<NDArray> {
        match self {
            Outputs::One(array) => Ok(array),
            Outputs::None => Err(Error::InvalidArgument(
                "operator produced no outputs".to_string(),
            )),
            Outputs::List(list) => Err(Error::InvalidArgument(format!(
                "operator produced {} outputs, expected one",
                list.len()
            ))),
        }
    }

    /// Flattens into a vector regardless of arity.
    pub fn into_vec(self) -> Vec<NDArray> {
        match self {
            Outputs::None => Vec::new(),
            Outputs::One(array) => vec![array],
            Outputs::List(list) => list,
        }
    }
}

fn imperative(
    op: &OpDescriptor,
    inputs: &[&NDArray],
    params: &[(&str, String)],
    out: Option<&[&NDArray]>,
) -> Result<Outputs> {
    let api = crate::api::table()?;

    let input_handles: Vec<NDArrayHandle> = inputs.iter().map(|a| a.handle()).collect();
    let num_inputs = checked_int(input_handles.len(), "inputs")?;

    let mut pairs = AttrPairs::with_capacity(params.len());
    for (key, value) in params {
        pairs.push(key, value)?;
    }
    let num_params = pairs.count_int("operator parameters")?;
    let key_ptrs = pairs.key_ptrs();
    let val_ptrs = pairs.val_ptrs();

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
        std::ptr::null_mut()
    };

    // SAFETY: every pointer borrows a local that outlives the call.
    let status = unsafe {
        (api.mx_imperative_invoke)(
            op.handle,
            num_inputs,
            input_handles.as_ptr(),
            &mut num_outputs,
            &mut outputs_ptr,
            num_params,
            key_ptrs.as_ptr(),
            val_ptrs.as_ptr(),
        )
    };
    check(api, status)?;

    if out.is_some() || num_outputs == 0 {
        return Ok(Outputs::None);
    }
    // SAFETY: without caller buffers the native side returned `num_outputs`
    // fresh handles; ownership passes to the wrappers.
    let fresh = unsafe { std::slice::from_raw_parts(outputs_ptr, num_outputs as usize) };
    match fresh {
        [one] => Ok(Outputs::One(NDArray::from_handle(*one))),
        many => Ok(Outputs::List(
            many.iter().map(|&h| NDArray::from_handle(h)).collect(),
        )),
    }
}

fn build_catalog() -> Result<HashMap<String, OpDescriptor>> {
    let api = crate::api::table()?;
    let mut size: mx_uint = 0;
    let mut names: *mut *const c_char = std::ptr::null_mut();
    check(api, unsafe {
        (api.mx_list_all_op_names)(&mut size, &mut names)
    })?;
    // SAFETY: the native side returned `size` name pointers.
    let names =
        unsafe { cstr_array_to_vec(names as *const *const c_char, size as usize) }?;

    let mut catalog = HashMap::with_capacity(names.len());
    for name in names {
        let descriptor = describe(api, &name)?;
        // Aliases share a canonical descriptor; the first one wins.
        catalog
            .entry(descriptor.name.clone())
            .or_insert(descriptor);
    }
    Ok(catalog)
}

fn describe(api: &MxApi, name: &str) -> Result<OpDescriptor> {
    let cname = pin_cstring(name)?;
    let mut handle: OpHandle = std::ptr::null_mut();
    check(api, unsafe {
        (api.nn_get_op_handle)(cname.as_ptr(), &mut handle)
    })?;

    let mut real_name: *const c_char = std::ptr::null();
    let mut description: *const c_char = std::ptr::null();
    let mut num_args: mx_uint = 0;
    let mut arg_names: *mut *const c_char = std::ptr::null_mut();
    let mut arg_type_infos: *mut *const c_char = std::ptr::null_mut();
    let mut arg_descriptions: *mut *const c_char = std::ptr::null_mut();
    let mut key_var_num_args: *const c_char = std::ptr::null();
    let mut return_type: *const c_char = std::ptr::null();
    let status = unsafe {
        (api.mx_symbol_get_atomic_symbol_info)(
            handle,
            &mut real_name,
            &mut description,
            &mut num_args,
            &mut arg_names,
            &mut arg_type_infos,
            &mut arg_descriptions,
            &mut key_var_num_args,
            &mut return_type,
        )
    };
    check(api, status)?;

    // SAFETY: the native side returned `num_args` parallel entries plus
    // NUL-terminated strings valid for the duration of this call.
    let (real_name, description, names, type_infos, descriptions, key_var, ret) = unsafe {
        (
            cstr_to_string(real_name)?,
            cstr_to_string(description)?,
            cstr_array_to_vec(arg_names as *const *const c_char, num_args as usize)?,
            cstr_array_to_vec(arg_type_infos as *const *const c_char, num_args as usize)?,
            cstr_array_to_vec(arg_descriptions as *const *const c_char, num_args as usize)?,
            cstr_to_opt_string(key_var_num_args)?,
            cstr_to_opt_string(return_type)?,
        )
    };
    let args = names
        .into_iter()
        .zip(type_infos)
        .zip(descriptions)
        .map(|((name, type_info), description)| OpArgInfo {
            name,
            type_info,
            description,
        })
        .collect();
    Ok(OpDescriptor {
        name: real_name,
        description,
        args,
        key_var_num_args: key_var.filter(|s| !s.is_empty()),
        return_type: ret.filter(|s| !s.is_empty()),
        handle,
    })
}
