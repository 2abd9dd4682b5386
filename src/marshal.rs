//! Conversion between owned Rust values and the raw views native calls read.
//!
//! Native entry points consume parallel C-string arrays, handle arrays and
//! fixed-width integer buffers. The types here own the backing storage and
//! hand out pointer views; callers bind both to locals so the storage stays
//! alive across the unsafe call, including any updater callback that runs
//! on the same stack before the call returns.
//!
//! Every narrowing into a native integer width is checked. An oversized
//! count surfaces as [`Error::ArgumentTooLarge`] instead of truncating.

use std::ffi::{CStr, CString};

use libc::{c_char, c_int};

use crate::api::sys::mx_uint;
use crate::error::{Error, Result};

// ======================================================================
// Width checks
// ======================================================================

/// Narrows a count to `mx_uint`, naming the argument on overflow.
pub fn checked_uint(value: usize, what: &'static str) -> Result<mx_uint> {
    mx_uint::try_from(value).map_err(|_| Error::ArgumentTooLarge {
        what,
        count: value,
        limit: u64::from(mx_uint::MAX),
    })
}

/// Narrows a count to `c_int`, naming the argument on overflow.
pub fn checked_int(value: usize, what: &'static str) -> Result<c_int> {
    c_int::try_from(value).map_err(|_| Error::ArgumentTooLarge {
        what,
        count: value,
        limit: c_int::MAX as u64,
    })
}

// ======================================================================
// C-string pinning
// ======================================================================

/// Pins one string as an owned C string, rejecting interior NUL bytes.
pub fn pin_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument("string contains null byte".to_string()))
}

/// Pins a sequence of strings.
pub fn pin_cstrings<I>(items: I) -> Result<Vec<CString>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    items.into_iter().map(|s| pin_cstring(s.as_ref())).collect()
}

/// Pointer view over pinned strings. Borrows `pinned`; keep both alive
/// until the native call returns.
pub fn cstring_ptrs(pinned: &[CString]) -> Vec<*const c_char> {
    pinned.iter().map(|s| s.as_ptr()).collect()
}

// ======================================================================
// Key/value maps
// ======================================================================

/// Owned backing storage for a native `(keys, vals)` string map.
///
/// Values are stringified on push, so flag maps may mix strings, numbers
/// and booleans. `key_ptrs`/`val_ptrs` build the parallel pointer arrays
/// the native call reads.
#[derive(Default)]
pub struct AttrPairs {
    keys: Vec<CString>,
    vals: Vec<CString>,
}

impl AttrPairs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            keys: Vec::with_capacity(n),
            vals: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, key: &str, value: impl ToString) -> Result<()> {
        self.keys.push(pin_cstring(key)?);
        self.vals.push(pin_cstring(&value.to_string())?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Entry count narrowed to `mx_uint`.
    pub fn count_uint(&self, what: &'static str) -> Result<mx_uint> {
        checked_uint(self.keys.len(), what)
    }

    /// Entry count narrowed to `c_int`.
    pub fn count_int(&self, what: &'static str) -> Result<c_int> {
        checked_int(self.keys.len(), what)
    }

    pub fn key_ptrs(&self) -> Vec<*const c_char> {
        cstring_ptrs(&self.keys)
    }

    pub fn val_ptrs(&self) -> Vec<*const c_char> {
        cstring_ptrs(&self.vals)
    }
}

// ======================================================================
// Shape buffers
// ======================================================================

/// CSR layout for a list of shapes: row `i` spans
/// `data[indptr[i]..indptr[i + 1]]`.
pub struct ShapeCsr {
    indptr: Vec<mx_uint>,
    data: Vec<mx_uint>,
}

impl ShapeCsr {
    pub fn new() -> Self {
        Self {
            indptr: vec![0],
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, shape: &[usize]) -> Result<()> {
        for &dim in shape {
            self.data.push(checked_uint(dim, "shape dimension")?);
        }
        let end = checked_uint(self.data.len(), "total shape data length")?;
        self.indptr.push(end);
        Ok(())
    }

    /// Number of shapes pushed so far.
    pub fn rows(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn indptr_ptr(&self) -> *const mx_uint {
        self.indptr.as_ptr()
    }

    pub fn data_ptr(&self) -> *const mx_uint {
        self.data.as_ptr()
    }
}

// ======================================================================
// Native string readback
// ======================================================================

/// Copies a native NUL-terminated string into an owned `String`.
///
/// # Safety
///
/// `ptr` must point to a valid NUL-terminated string that stays alive for
/// the duration of the call.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char) -> Result<String> {
    Ok(CStr::from_ptr(ptr).to_str()?.to_owned())
}

/// Like [`cstr_to_string`] with NULL mapped to `None`.
///
/// # Safety
///
/// `ptr` is either NULL or a valid NUL-terminated string.
pub(crate) unsafe fn cstr_to_opt_string(ptr: *const c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        cstr_to_string(ptr).map(Some)
    }
}

/// Copies a native array of NUL-terminated strings.
///
/// # Safety
///
/// `ptr` must point to `len` valid string pointers.
pub(crate) unsafe fn cstr_array_to_vec(
    ptr: *const *const c_char,
    len: usize,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(cstr_to_string(*ptr.add(i))?);
    }
    Ok(out)
}

/// Copies `count` native shape rows described by a per-row `ndims` array
/// and a per-row dimension pointer array.
///
/// # Safety
///
/// `ndims` must hold `count` entries and `data` must hold `count` pointers,
/// each valid for its row's dimension count.
pub(crate) unsafe fn shape_rows_to_vec(
    count: mx_uint,
    ndims: *const mx_uint,
    data: *const *const mx_uint,
) -> Vec<Vec<usize>> {
    let count = count as usize;
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let ndim = *ndims.add(i) as usize;
        let row = std::slice::from_raw_parts(*data.add(i), ndim);
        rows.push(row.iter().map(|&d| d as usize).collect());
    }
    rows
}
