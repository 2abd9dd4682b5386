//! Owning wrapper for native n-dimensional arrays.
//!
//! Each wrapper owns exactly one live handle and frees it exactly once on
//! drop. `at`, `slice` and `reshape` return new wrappers owning new
//! handles; whether storage is shared behind them is the native library's
//! refcounting concern, not the binding's.

use libc::{c_char, c_int};

use crate::api::sys::{self, NDArrayHandle};
use crate::context::{Context, DeviceType};
use crate::dtype::{float16_to_double, DType};
use crate::error::{check, Error, Result};
use crate::marshal::{checked_int, checked_uint, cstring_ptrs, pin_cstring, pin_cstrings};
use crate::ops;

#[derive(Debug)]
pub struct NDArray {
    handle: NDArrayHandle,
}

// Handles move freely between threads; the native engine serializes access
// to the underlying storage.
unsafe impl Send for NDArray {}

impl NDArray {
    /// Allocates an uninitialized array on `ctx` (the current default when
    /// `None`) with the given element type (float32 when `None`).
    pub fn empty(shape: &[usize], ctx: Option<Context>, dtype: Option<DType>) -> Result<Self> {
        Self::allocate(
            shape,
            ctx.unwrap_or_else(Context::current),
            false,
            dtype.unwrap_or_default(),
        )
    }

    fn allocate(shape: &[usize], ctx: Context, delay_alloc: bool, dtype: DType) -> Result<Self> {
        let api = crate::api::table()?;
        let mut dims = Vec::with_capacity(shape.len());
        for &dim in shape {
            dims.push(checked_uint(dim, "shape dimension")?);
        }
        let ndim = checked_uint(dims.len(), "shape length")?;
        let mut handle: NDArrayHandle = std::ptr::null_mut();
        // SAFETY: dims outlives the call and the out pointer is a valid local.
        let status = unsafe {
            (api.mx_nd_array_create_ex)(
                dims.as_ptr(),
                ndim,
                ctx.device_type.id(),
                ctx.device_id,
                delay_alloc as c_int,
                dtype.id(),
                &mut handle,
            )
        };
        check(api, status)?;
        Ok(Self { handle })
    }

    /// Fresh array filled with zeros.
    pub fn zeros(shape: &[usize], ctx: Option<Context>, dtype: Option<DType>) -> Result<Self> {
        Self::filled("_zeros", shape, ctx, dtype)
    }

    /// Fresh array filled with ones.
    pub fn ones(shape: &[usize], ctx: Option<Context>, dtype: Option<DType>) -> Result<Self> {
        Self::filled("_ones", shape, ctx, dtype)
    }

    fn filled(
        op: &str,
        shape: &[usize],
        ctx: Option<Context>,
        dtype: Option<DType>,
    ) -> Result<Self> {
        let ctx = ctx.unwrap_or_else(Context::current);
        let dtype = dtype.unwrap_or_default();
        let params = [
            ("shape", format!("{shape:?}")),
            ("ctx", ctx.to_string()),
            ("dtype", dtype.name().to_string()),
        ];
        ops::invoke(op, &[], &params)?.into_single()
    }

    /// Takes ownership of an operator-produced handle.
    pub(crate) fn from_handle(handle: NDArrayHandle) -> Self {
        Self { handle }
    }

    pub(crate) fn handle(&self) -> NDArrayHandle {
        self.handle
    }

    pub fn shape(&self) -> Result<Vec<usize>> {
        let api = crate::api::table()?;
        let mut ndim: sys::mx_uint = 0;
        let mut data: *const sys::mx_uint = std::ptr::null();
        let status = unsafe { (api.mx_nd_array_get_shape)(self.handle, &mut ndim, &mut data) };
        check(api, status)?;
        if ndim == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: the native side hands back `ndim` dimensions.
        let dims = unsafe { std::slice::from_raw_parts(data, ndim as usize) };
        Ok(dims.iter().map(|&d| d as usize).collect())
    }

    pub fn ndim(&self) -> Result<usize> {
        Ok(self.shape()?.len())
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.shape()?.iter().product())
    }

    pub fn dtype(&self) -> Result<DType> {
        let api = crate::api::table()?;
        let mut id: c_int = 0;
        check(api, unsafe {
            (api.mx_nd_array_get_dtype)(self.handle, &mut id)
        })?;
        DType::from_id(id)
    }

    pub fn context(&self) -> Result<Context> {
        let api = crate::api::table()?;
        let mut dev_type: c_int = 0;
        let mut dev_id: c_int = 0;
        check(api, unsafe {
            (api.mx_nd_array_get_context)(self.handle, &mut dev_type, &mut dev_id)
        })?;
        Ok(Context::new(DeviceType::from_id(dev_type)?, dev_id))
    }

    /// A view of row `idx` along the first axis. Negative indices count
    /// from the end.
    pub fn at(&self, idx: i64) -> Result<NDArray> {
        let len = self.shape()?.first().copied().unwrap_or(0) as i64;
        let normalized = if idx < 0 { idx + len } else { idx };
        if normalized < 0 || normalized >= len {
            return Err(Error::InvalidArgument(format!(
                "index {idx} is out of bounds for axis 0 with size {len}"
            )));
        }
        let api = crate::api::table()?;
        let mut out: NDArrayHandle = std::ptr::null_mut();
        let status =
            unsafe { (api.mx_nd_array_at)(self.handle, normalized as sys::mx_uint, &mut out) };
        check(api, status)?;
        Ok(NDArray::from_handle(out))
    }

    /// A view of rows `start..stop` along the first axis. `None` bounds
    /// default to the ends; negative bounds count from the end.
    pub fn slice(&self, start: Option<i64>, stop: Option<i64>) -> Result<NDArray> {
        let len = self.shape()?.first().copied().unwrap_or(0) as i64;
        let start = match start {
            None => 0,
            Some(s) if s < 0 => {
                let shifted = s + len;
                if shifted < 0 {
                    return Err(Error::InvalidArgument(format!(
                        "Slicing start {s} exceeds limit of {len}"
                    )));
                }
                shifted
            }
            Some(s) => s,
        };
        let stop = match stop {
            None => len,
            Some(s) if s < 0 => {
                let shifted = s + len;
                if shifted < 0 {
                    return Err(Error::InvalidArgument(format!(
                        "Slicing stop {s} exceeds limit of {len}"
                    )));
                }
                shifted
            }
            Some(s) => s,
        };
        let api = crate::api::table()?;
        let mut out: NDArrayHandle = std::ptr::null_mut();
        let status = unsafe {
            (api.mx_nd_array_slice)(
                self.handle,
                checked_uint(start as usize, "slice start")?,
                checked_uint(stop as usize, "slice stop")?,
                &mut out,
            )
        };
        check(api, status)?;
        Ok(NDArray::from_handle(out))
    }

    /// Reshapes into `dims` without copying. `-1` infers one dimension and
    /// `0` keeps the corresponding input dimension.
    pub fn reshape(&self, dims: &[i32]) -> Result<NDArray> {
        let api = crate::api::table()?;
        let ndim = checked_int(dims.len(), "reshape rank")?;
        let mut out: NDArrayHandle = std::ptr::null_mut();
        let status =
            unsafe { (api.mx_nd_array_reshape)(self.handle, ndim, dims.as_ptr(), &mut out) };
        check(api, status)?;
        Ok(NDArray::from_handle(out))
    }

    /// Blocks until pending writes into this array have completed.
    pub fn wait_to_read(&self) -> Result<()> {
        let api = crate::api::table()?;
        check(api, unsafe { (api.mx_nd_array_wait_to_read)(self.handle) })
    }

    /// Copies `data` synchronously into the array. The array must be
    /// float32 and `data` must cover it exactly.
    pub fn sync_copy_from_slice(&self, data: &[f32]) -> Result<()> {
        let dtype = self.dtype()?;
        if dtype != DType::Float32 {
            return Err(Error::TypeError(format!(
                "cannot copy float32 data into a {dtype} array"
            )));
        }
        let size = self.size()?;
        if data.len() != size {
            return Err(Error::ArgumentMismatch(format!(
                "data length {} does not match the array size {size}",
                data.len()
            )));
        }
        let api = crate::api::table()?;
        let status = unsafe {
            (api.mx_nd_array_sync_copy_from_cpu)(self.handle, data.as_ptr().cast(), data.len())
        };
        check(api, status)
    }

    /// Copies a 1-D array out, widening every element type to `f64`.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        let shape = self.shape()?;
        if shape.len() > 1 {
            return Err(Error::TypeError(
                "The current array is not a 1D array".to_string(),
            ));
        }
        let length = shape.first().copied().unwrap_or(1);
        match self.dtype()? {
            DType::Float32 => {
                let buf = self.copy_out::<f32>(length)?;
                Ok(buf.into_iter().map(f64::from).collect())
            }
            DType::Float64 => self.copy_out::<f64>(length),
            DType::Float16 => {
                let buf = self.copy_out::<u16>(length)?;
                Ok(buf.into_iter().map(float16_to_double).collect())
            }
            DType::Uint8 => {
                let buf = self.copy_out::<u8>(length)?;
                Ok(buf.into_iter().map(f64::from).collect())
            }
            DType::Int32 => {
                let buf = self.copy_out::<i32>(length)?;
                Ok(buf.into_iter().map(f64::from).collect())
            }
            DType::Int8 => {
                let buf = self.copy_out::<i8>(length)?;
                Ok(buf.into_iter().map(f64::from).collect())
            }
            DType::Int64 => {
                let buf = self.copy_out::<i64>(length)?;
                Ok(buf.into_iter().map(|v| v as f64).collect())
            }
        }
    }

    fn copy_out<T: Default + Clone>(&self, length: usize) -> Result<Vec<T>> {
        let api = crate::api::table()?;
        let mut buf = vec![T::default(); length];
        // The native size argument counts elements, not bytes.
        let status = unsafe {
            (api.mx_nd_array_sync_copy_to_cpu)(self.handle, buf.as_mut_ptr().cast(), length)
        };
        check(api, status)?;
        Ok(buf)
    }

    /// The single element of a `[1]`-shaped array.
    pub fn as_scalar(&self) -> Result<f64> {
        if self.shape()? != [1] {
            return Err(Error::TypeError(
                "The current array is not a scalar".to_string(),
            ));
        }
        Ok(self.to_vec()?[0])
    }

    /// Copies this array's contents into `dst`.
    pub fn copy_to(&self, dst: &NDArray) -> Result<()> {
        ops::invoke_into("_copyto", &[self], &[], &[dst])
    }

    /// Copies into a fresh array allocated on `ctx`.
    pub fn copy_to_ctx(&self, ctx: Context) -> Result<NDArray> {
        let out = NDArray::empty(&self.shape()?, Some(ctx), Some(self.dtype()?))?;
        self.copy_to(&out)?;
        Ok(out)
    }

    /// The gradient buffer attached by `autograd::mark_variables`, if any.
    pub fn grad(&self) -> Result<Option<NDArray>> {
        let api = crate::api::table()?;
        let mut out: NDArrayHandle = std::ptr::null_mut();
        check(api, unsafe {
            (api.mx_nd_array_get_grad)(self.handle, &mut out)
        })?;
        if out.is_null() {
            Ok(None)
        } else {
            Ok(Some(NDArray::from_handle(out)))
        }
    }

    /// Writes `arrays` to `path` in the native serialization format.
    pub fn save(path: &str, arrays: &[NDArray]) -> Result<()> {
        let api = crate::api::table()?;
        let fname = pin_cstring(path)?;
        let handles: Vec<NDArrayHandle> = arrays.iter().map(|a| a.handle()).collect();
        let num = checked_uint(handles.len(), "array count")?;
        let status = unsafe {
            (api.mx_nd_array_save)(fname.as_ptr(), num, handles.as_ptr(), std::ptr::null())
        };
        check(api, status)
    }

    /// Writes name/array pairs to `path`.
    pub fn save_named(path: &str, entries: &[(&str, &NDArray)]) -> Result<()> {
        let api = crate::api::table()?;
        let fname = pin_cstring(path)?;
        let names = pin_cstrings(entries.iter().map(|(name, _)| *name))?;
        let name_ptrs = cstring_ptrs(&names);
        let handles: Vec<NDArrayHandle> = entries.iter().map(|(_, a)| a.handle()).collect();
        let num = checked_uint(handles.len(), "array count")?;
        let status = unsafe {
            (api.mx_nd_array_save)(fname.as_ptr(), num, handles.as_ptr(), name_ptrs.as_ptr())
        };
        check(api, status)
    }

    /// Reads arrays back from `path`. A file carrying names loads as the
    /// [`LoadedArrays::Named`] form.
    pub fn load(path: &str) -> Result<LoadedArrays> {
        let api = crate::api::table()?;
        let fname = pin_cstring(path)?;
        let mut out_size: sys::mx_uint = 0;
        let mut out_arr: *mut NDArrayHandle = std::ptr::null_mut();
        let mut name_size: sys::mx_uint = 0;
        let mut name_ptrs: *mut *const c_char = std::ptr::null_mut();
        let status = unsafe {
            (api.mx_nd_array_load)(
                fname.as_ptr(),
                &mut out_size,
                &mut out_arr,
                &mut name_size,
                &mut name_ptrs,
            )
        };
        check(api, status)?;
        // SAFETY: the native side returned `out_size` handles and
        // `name_size` name pointers.
        let arrays: Vec<NDArray> = unsafe { std::slice::from_raw_parts(out_arr, out_size as usize) }
            .iter()
            .map(|&h| NDArray::from_handle(h))
            .collect();
        if name_size == 0 {
            return Ok(LoadedArrays::List(arrays));
        }
        if name_size as usize != arrays.len() {
            return Err(Error::ArgumentMismatch(format!(
                "loaded {} arrays but {name_size} names",
                arrays.len()
            )));
        }
        let names = unsafe {
            crate::marshal::cstr_array_to_vec(name_ptrs as *const *const c_char, name_size as usize)
        }?;
        Ok(LoadedArrays::Named(names.into_iter().zip(arrays).collect()))
    }
}

impl Drop for NDArray {
    fn drop(&mut self) {
        if let Ok(api) = crate::api::table() {
            unsafe { (api.mx_nd_array_free)(self.handle) };
        }
    }
}

/// Result of [`NDArray::load`].
#[derive(Debug)]
pub enum LoadedArrays {
    List(Vec<NDArray>),
    Named(Vec<(String, NDArray)>),
}

/// Blocks until every pending native operation has completed.
pub fn wait_all() -> Result<()> {
    let api = crate::api::table()?;
    check(api, unsafe { (api.mx_nd_array_wait_all)() })
}
