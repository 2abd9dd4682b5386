//! Data iterators: native batch providers behind a cursor interface.

use std::ptr;

use libc::{c_char, c_int};
use once_cell::sync::OnceCell;

use crate::api::sys::{mx_uint, DataIterCreator, DataIterHandle, NDArrayHandle};
use crate::api::MxApi;
use crate::error::{check, Error, Result};
use crate::marshal::{cstr_array_to_vec, cstr_to_string, AttrPairs};
use crate::ndarray::NDArray;

/// One declared parameter of a data iterator.
#[derive(Debug, Clone)]
pub struct IterArgInfo {
    pub name: String,
    pub type_info: String,
    pub description: String,
}

/// Introspected description of one registered data iterator.
#[derive(Debug, Clone)]
pub struct DataIterDescriptor {
    pub name: String,
    pub description: String,
    pub args: Vec<IterArgInfo>,
    handle: DataIterCreator,
}

// Creator handles index an immutable native registry.
unsafe impl Send for DataIterDescriptor {}
unsafe impl Sync for DataIterDescriptor {}

static CREATORS: OnceCell<Vec<DataIterDescriptor>> = OnceCell::new();

/// All registered data iterators, enumerated once per process.
pub fn creators() -> Result<&'static [DataIterDescriptor]> {
    CREATORS.get_or_try_init(build_creators).map(Vec::as_slice)
}

/// Looks up a data iterator by name.
pub fn find(name: &str) -> Result<&'static DataIterDescriptor> {
    creators()?
        .iter()
        .find(|creator| creator.name == name)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown data iterator: {name}")))
}

fn build_creators() -> Result<Vec<DataIterDescriptor>> {
    let api = crate::api::table()?;
    let mut size: mx_uint = 0;
    let mut handles: *mut DataIterCreator = ptr::null_mut();
    check(api, unsafe {
        (api.mx_list_data_iters)(&mut size, &mut handles)
    })?;

    // The readback array only lives until the next native call, so the
    // handles are copied out before the describe calls start.
    let handles: Vec<DataIterCreator> = if size == 0 {
        Vec::new()
    } else {
        // SAFETY: the native side returned `size` creator handles.
        unsafe { std::slice::from_raw_parts(handles, size as usize) }.to_vec()
    };

    let mut creators = Vec::with_capacity(handles.len());
    for handle in handles {
        creators.push(describe(api, handle)?);
    }
    Ok(creators)
}

fn describe(api: &MxApi, handle: DataIterCreator) -> Result<DataIterDescriptor> {
    let mut name: *const c_char = ptr::null();
    let mut description: *const c_char = ptr::null();
    let mut num_args: mx_uint = 0;
    let mut arg_names: *mut *const c_char = ptr::null_mut();
    let mut arg_types: *mut *const c_char = ptr::null_mut();
    let mut arg_descriptions: *mut *const c_char = ptr::null_mut();
    let status = unsafe {
        (api.mx_data_iter_get_iter_info)(
            handle,
            &mut name,
            &mut description,
            &mut num_args,
            &mut arg_names,
            &mut arg_types,
            &mut arg_descriptions,
        )
    };
    check(api, status)?;

    // SAFETY: the native side returned `num_args` parallel entries plus
    // NUL-terminated strings valid for the duration of this call.
    let (name, description, names, types, descriptions) = unsafe {
        (
            cstr_to_string(name)?,
            cstr_to_string(description)?,
            cstr_array_to_vec(arg_names as *const *const c_char, num_args as usize)?,
            cstr_array_to_vec(arg_types as *const *const c_char, num_args as usize)?,
            cstr_array_to_vec(arg_descriptions as *const *const c_char, num_args as usize)?,
        )
    };
    let args = names
        .into_iter()
        .zip(types)
        .zip(descriptions)
        .map(|((name, type_info), description)| IterArgInfo {
            name,
            type_info,
            description,
        })
        .collect();

    Ok(DataIterDescriptor {
        name,
        description,
        args,
        handle,
    })
}

impl DataIterDescriptor {
    /// Instantiates the iterator with the given stringified parameters.
    pub fn create(&self, params: &[(&str, String)]) -> Result<DataIter> {
        let api = crate::api::table()?;

        let mut pairs = AttrPairs::with_capacity(params.len());
        for (key, value) in params {
            pairs.push(key, value)?;
        }
        let num_params = pairs.count_uint("iterator parameters")?;
        let key_ptrs = pairs.key_ptrs();
        let val_ptrs = pairs.val_ptrs();

        let mut handle: DataIterHandle = ptr::null_mut();
        // SAFETY: the parameter arrays are backed by `pairs` for the
        // duration of the call.
        let status = unsafe {
            (api.mx_data_iter_create_iter)(
                self.handle,
                num_params,
                key_ptrs.as_ptr(),
                val_ptrs.as_ptr(),
                &mut handle,
            )
        };
        check(api, status)?;
        Ok(DataIter { handle })
    }
}

/// Instantiates the named iterator; shorthand for [`find`] + create.
pub fn create(name: &str, params: &[(&str, String)]) -> Result<DataIter> {
    find(name)?.create(params)
}

/// A live data iterator positioned before or on a batch.
#[derive(Debug)]
pub struct DataIter {
    handle: DataIterHandle,
}

unsafe impl Send for DataIter {}

impl DataIter {
    /// Advances to the next batch; `false` once the source is exhausted.
    pub fn next_batch(&self) -> Result<bool> {
        let api = crate::api::table()?;
        let mut more: c_int = 0;
        check(api, unsafe {
            (api.mx_data_iter_next)(self.handle, &mut more)
        })?;
        Ok(more != 0)
    }

    /// Rewinds to before the first batch.
    pub fn reset(&self) -> Result<()> {
        let api = crate::api::table()?;
        check(api, unsafe {
            (api.mx_data_iter_before_first)(self.handle)
        })
    }

    /// The current batch's data array.
    pub fn current_data(&self) -> Result<NDArray> {
        let api = crate::api::table()?;
        let mut handle: NDArrayHandle = ptr::null_mut();
        check(api, unsafe {
            (api.mx_data_iter_get_data)(self.handle, &mut handle)
        })?;
        // The native side minted a fresh handle for the batch view; the
        // wrapper takes ownership of it.
        Ok(NDArray::from_handle(handle))
    }

    /// The current batch's label array.
    pub fn current_label(&self) -> Result<NDArray> {
        let api = crate::api::table()?;
        let mut handle: NDArrayHandle = ptr::null_mut();
        check(api, unsafe {
            (api.mx_data_iter_get_label)(self.handle, &mut handle)
        })?;
        Ok(NDArray::from_handle(handle))
    }

    /// How many examples of the current batch are padding.
    pub fn current_pad(&self) -> Result<i32> {
        let api = crate::api::table()?;
        let mut pad: c_int = 0;
        check(api, unsafe {
            (api.mx_data_iter_get_pad_num)(self.handle, &mut pad)
        })?;
        Ok(pad)
    }

    /// The source indices of the current batch's examples.
    pub fn current_index(&self) -> Result<Vec<u64>> {
        let api = crate::api::table()?;
        let mut data: *mut u64 = ptr::null_mut();
        let mut size: u64 = 0;
        let status =
            unsafe { (api.mx_data_iter_get_index)(self.handle, &mut data, &mut size) };
        check(api, status)?;

        let size = usize::try_from(size).map_err(|_| {
            Error::NativeCallFailed("too many items from MXDataIterGetIndex".into())
        })?;
        if size == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: the native side returned `size` entries, valid until the
        // next call into the library.
        Ok(unsafe { std::slice::from_raw_parts(data, size) }.to_vec())
    }
}

impl Drop for DataIter {
    fn drop(&mut self) {
        if let Ok(api) = crate::api::table() {
            // SAFETY: the wrapper owns its handle and frees it exactly once.
            unsafe {
                (api.mx_data_iter_free)(self.handle);
            }
        }
    }
}
