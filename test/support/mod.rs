//! In-memory stand-in for the native library.
//!
//! Builds a complete [`MxApi`] table over plain Rust state so the binding's
//! marshaling, lifecycle and callback paths run end to end without a real
//! libmxnet on the machine. Handles are boxed `Arc`s; freeing a handle drops
//! one reference, aliased handles keep the underlying value alive, and every
//! free bumps a per-kind counter the tests can read back.
//!
//! Semantics are intentionally small:
//! - arrays store their elements widened to `f64` regardless of dtype
//! - the operator set is `_zeros`, `_ones`, `_copyto` and `elemwise_add`
//! - an executor has exactly one output, the elementwise sum of its
//!   arguments
//! - `ArrayBatchIter` is the only data iterator; it yields deterministic
//!   sequences
//! - files written by the save calls land in a process-local map, not on
//!   disk

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use libc::{c_char, c_int, c_void};

use mxnet::api::sys::{
    mx_uint, CachedOpHandle, DataIterCreator, DataIterHandle, ExecutorHandle, KVStoreHandle,
    MXKVStoreStrUpdater, MXKVStoreUpdater, MxApi, NDArrayHandle, OpHandle, SymbolHandle,
};

// ======================================================================
// Shared state
// ======================================================================

type ArrayRef = Arc<Mutex<ArrayData>>;
type SymbolRef = Arc<Mutex<SymbolData>>;
type ExecutorRef = Arc<Mutex<ExecutorData>>;
type CachedOpRef = Arc<Mutex<CachedOpData>>;
type KvStoreRef = Arc<Mutex<KvStoreData>>;
type DataIterRef = Arc<Mutex<DataIterData>>;

#[derive(Debug, Clone, Default)]
struct ArrayData {
    shape: Vec<usize>,
    dtype: c_int,
    dev_type: c_int,
    dev_id: c_int,
    data: Vec<f64>,
}

impl ArrayData {
    fn len(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Default)]
struct SymbolData {
    /// `None` for free variables.
    op: Option<String>,
    name: Option<String>,
    params: Vec<(String, String)>,
    attrs: Vec<(String, String)>,
    inputs: Vec<SymbolRef>,
}

impl SymbolData {
    fn deep_clone(&self) -> SymbolData {
        SymbolData {
            op: self.op.clone(),
            name: self.name.clone(),
            params: self.params.clone(),
            attrs: self.attrs.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|child| Arc::new(Mutex::new(child.lock().unwrap().deep_clone())))
                .collect(),
        }
    }

    /// Distinct variable names, depth first, matching list_arguments order.
    fn argument_names(&self, out: &mut Vec<String>) {
        if self.op.is_none() {
            if let Some(name) = &self.name {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            return;
        }
        for child in &self.inputs {
            child.lock().unwrap().argument_names(out);
        }
    }

    fn output_name(&self) -> String {
        match (&self.name, &self.op) {
            (Some(name), _) => format!("{name}_output"),
            (None, Some(op)) => format!("{op}_output"),
            (None, None) => "output".to_string(),
        }
    }
}

struct ExecutorData {
    args: Vec<ArrayRef>,
    grads: Vec<Option<ArrayRef>>,
    reqs: Vec<mx_uint>,
    aux: Vec<ArrayRef>,
    output: ArrayRef,
}

struct CachedOpData {
    flags: Vec<(String, String)>,
}

#[derive(Clone, Copy)]
struct UpdaterEntry {
    int_fn: MXKVStoreUpdater,
    str_fn: MXKVStoreStrUpdater,
    ctx: usize,
}

#[derive(Default)]
struct KvStoreData {
    kind: String,
    int_vals: HashMap<c_int, ArrayRef>,
    str_vals: HashMap<String, ArrayRef>,
    updater: Option<UpdaterEntry>,
    compression: Vec<(String, String)>,
}

struct DataIterData {
    batch_size: usize,
    num_batches: usize,
    pad: c_int,
    /// -1 before the first batch.
    cursor: isize,
}

enum StoredFile {
    Arrays(Vec<(Option<String>, ArrayData)>),
    Symbol(SymbolData),
}

/// Frees observed per resource kind since process start.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub ndarrays: usize,
    pub symbols: usize,
    pub executors: usize,
    pub cached_ops: usize,
    pub kvstores: usize,
    pub data_iters: usize,
}

lazy_static::lazy_static! {
    static ref COUNTERS: Mutex<Counters> = Mutex::new(Counters::default());
    static ref FILES: Mutex<HashMap<String, StoredFile>> = Mutex::new(HashMap::new());
    /// Graphs parked by save_to_json so from_json can round-trip them.
    static ref JSON_GRAPHS: Mutex<HashMap<String, SymbolData>> = Mutex::new(HashMap::new());
    /// (variable, gradient, req) triples registered by mark_variables.
    static ref MARKED: Mutex<Vec<(ArrayRef, ArrayRef, mx_uint)>> = Mutex::new(Vec::new());
}

static JSON_SERIAL: AtomicUsize = AtomicUsize::new(0);
static LAST_SEED: AtomicI32 = AtomicI32::new(0);

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
    static SCRATCH: RefCell<Scratch> = RefCell::new(Scratch::default());
    static RECORDING: RefCell<bool> = const { RefCell::new(false) };
    static TRAINING: RefCell<bool> = const { RefCell::new(false) };
}

/// Per-thread storage backing the pointers a call hands out; each
/// producing call replaces the previous generation, matching the native
/// "valid until the next call" contract.
///
/// Pointer arrays live in inner vectors that are complete before their
/// address is taken; growing an outer vector moves only the headers, not
/// the heap buffers the handed-out pointers reference.
#[derive(Default)]
struct Scratch {
    strings: Vec<CString>,
    string_lists: Vec<Vec<*const c_char>>,
    handles: Vec<*mut c_void>,
    shape_sets: Vec<ShapeSet>,
    type_sets: Vec<Vec<c_int>>,
    index: Vec<u64>,
    stypes: Vec<c_int>,
}

#[derive(Default)]
struct ShapeSet {
    ndims: Vec<mx_uint>,
    rows: Vec<Vec<mx_uint>>,
    row_ptrs: Vec<*const mx_uint>,
}

impl ShapeSet {
    fn from_rows(shapes: &[Vec<usize>]) -> ShapeSet {
        let mut set = ShapeSet {
            ndims: shapes.iter().map(|s| s.len() as mx_uint).collect(),
            rows: shapes
                .iter()
                .map(|s| s.iter().map(|&d| d as mx_uint).collect())
                .collect(),
            row_ptrs: Vec::new(),
        };
        // Row buffers are complete; their addresses are stable from here.
        set.row_ptrs = set.rows.iter().map(|r| r.as_ptr()).collect();
        set
    }
}

impl Scratch {
    fn reset(&mut self) {
        self.strings.clear();
        self.string_lists.clear();
        self.handles.clear();
        self.shape_sets.clear();
        self.type_sets.clear();
        self.index.clear();
        self.stypes.clear();
    }

    fn push_strings(&mut self, items: &[String]) -> *mut *const c_char {
        let mut list = Vec::with_capacity(items.len());
        for item in items {
            self.strings
                .push(CString::new(item.as_str()).unwrap_or_default());
            list.push(self.strings[self.strings.len() - 1].as_ptr());
        }
        self.string_lists.push(list);
        self.string_lists[self.string_lists.len() - 1].as_ptr() as *mut *const c_char
    }

    fn push_string(&mut self, item: &str) -> *const c_char {
        self.strings.push(CString::new(item).unwrap_or_default());
        self.strings[self.strings.len() - 1].as_ptr()
    }
}

fn set_error(msg: &str) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = CString::new(msg).unwrap_or_default();
    });
}

fn status(result: Result<(), String>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(msg) => {
            set_error(&msg);
            1
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, String> {
    mutex.lock().map_err(|_| "stub state lock poisoned".to_string())
}

// ======================================================================
// Handle plumbing
// ======================================================================

fn mint<T>(value: T) -> *mut c_void {
    Box::into_raw(Box::new(value)) as *mut c_void
}

unsafe fn deref<T: Clone>(handle: *mut c_void, what: &str) -> Result<T, String> {
    if handle.is_null() {
        return Err(format!("null {what} handle"));
    }
    Ok((*(handle as *const T)).clone())
}

unsafe fn release<T>(handle: *mut c_void) -> bool {
    if handle.is_null() {
        return false;
    }
    drop(Box::from_raw(handle as *mut T));
    true
}

fn array_handle(array: ArrayRef) -> NDArrayHandle {
    mint(array)
}

fn fresh_array(data: ArrayData) -> NDArrayHandle {
    array_handle(Arc::new(Mutex::new(data)))
}

unsafe fn array(handle: NDArrayHandle) -> Result<ArrayRef, String> {
    deref::<ArrayRef>(handle, "array")
}

unsafe fn symbol(handle: SymbolHandle) -> Result<SymbolRef, String> {
    deref::<SymbolRef>(handle, "symbol")
}

// ======================================================================
// Parameter parsing
// ======================================================================

unsafe fn read_str(ptr: *const c_char, what: &str) -> Result<String, String> {
    if ptr.is_null() {
        return Err(format!("null {what} string"));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|_| format!("{what} string is not UTF-8"))
}

unsafe fn read_pairs(
    num: usize,
    keys: *const *const c_char,
    vals: *const *const c_char,
) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::with_capacity(num);
    for i in 0..num {
        pairs.push((
            read_str(*keys.add(i), "parameter key")?,
            read_str(*vals.add(i), "parameter value")?,
        ));
    }
    Ok(pairs)
}

/// Parses the `[2, 3]` rendering of a shape.
fn parse_shape(text: &str) -> Result<Vec<usize>, String> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| format!("malformed shape literal: {text}"))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| format!("malformed shape literal: {text}"))
        })
        .collect()
}

/// Parses the `cpu(0)` rendering of a context.
fn parse_context(text: &str) -> Result<(c_int, c_int), String> {
    let (name, rest) = text
        .split_once('(')
        .ok_or_else(|| format!("malformed context literal: {text}"))?;
    let id = rest
        .strip_suffix(')')
        .and_then(|digits| digits.parse::<c_int>().ok())
        .ok_or_else(|| format!("malformed context literal: {text}"))?;
    let dev_type = match name {
        "cpu" => 1,
        "gpu" => 2,
        "cpu_pinned" => 3,
        other => return Err(format!("unknown device type: {other}")),
    };
    Ok((dev_type, id))
}

fn parse_dtype(name: &str) -> Result<c_int, String> {
    match name {
        "float32" => Ok(0),
        "float64" => Ok(1),
        "float16" => Ok(2),
        "uint8" => Ok(3),
        "int32" => Ok(4),
        "int8" => Ok(5),
        "int64" => Ok(6),
        other => Err(format!("unknown dtype: {other}")),
    }
}

fn dtype_width(dtype: c_int) -> usize {
    match dtype {
        1 | 6 => 8,
        0 | 4 => 4,
        2 => 2,
        _ => 1,
    }
}

// ======================================================================
// Error reporting
// ======================================================================

extern "C" fn get_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

// ======================================================================
// NDArray
// ======================================================================

extern "C" fn nd_create_ex(
    shape: *const mx_uint,
    ndim: mx_uint,
    dev_type: c_int,
    dev_id: c_int,
    _delay_alloc: c_int,
    dtype: c_int,
    out: *mut NDArrayHandle,
) -> c_int {
    status((|| unsafe {
        let dims: Vec<usize> = (0..ndim as usize).map(|i| *shape.add(i) as usize).collect();
        let len = dims.iter().product();
        *out = fresh_array(ArrayData {
            shape: dims,
            dtype,
            dev_type,
            dev_id,
            data: vec![0.0; len],
        });
        Ok(())
    })())
}

extern "C" fn nd_free(handle: NDArrayHandle) -> c_int {
    unsafe {
        if release::<ArrayRef>(handle) {
            if let Ok(mut counters) = COUNTERS.lock() {
                counters.ndarrays += 1;
            }
        }
    }
    0
}

extern "C" fn nd_get_shape(
    handle: NDArrayHandle,
    out_dim: *mut mx_uint,
    out_pdata: *mut *const mx_uint,
) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let shape = lock(&array)?.shape.clone();
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            scratch.shape_sets.push(ShapeSet::from_rows(&[shape]));
            let set = &scratch.shape_sets[0];
            *out_dim = set.ndims[0];
            *out_pdata = set.row_ptrs[0];
        });
        Ok(())
    })())
}

extern "C" fn nd_get_dtype(handle: NDArrayHandle, out_dtype: *mut c_int) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        *out_dtype = lock(&array)?.dtype;
        Ok(())
    })())
}

extern "C" fn nd_get_context(
    handle: NDArrayHandle,
    out_dev_type: *mut c_int,
    out_dev_id: *mut c_int,
) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let guard = lock(&array)?;
        *out_dev_type = guard.dev_type;
        *out_dev_id = guard.dev_id;
        Ok(())
    })())
}

extern "C" fn nd_at(handle: NDArrayHandle, idx: mx_uint, out: *mut NDArrayHandle) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let guard = lock(&array)?;
        let rows = *guard.shape.first().ok_or("cannot index a 0-d array")?;
        let idx = idx as usize;
        if idx >= rows {
            return Err(format!("index {idx} out of range for {rows} rows"));
        }
        let row_len: usize = guard.shape[1..].iter().product();
        // Indexing a vector keeps a [1] shape, matching NDArray::At
        let shape = if guard.shape.len() > 1 {
            guard.shape[1..].to_vec()
        } else {
            vec![1]
        };
        *out = fresh_array(ArrayData {
            shape,
            dtype: guard.dtype,
            dev_type: guard.dev_type,
            dev_id: guard.dev_id,
            data: guard.data[idx * row_len..(idx + 1) * row_len].to_vec(),
        });
        Ok(())
    })())
}

extern "C" fn nd_slice(
    handle: NDArrayHandle,
    begin: mx_uint,
    end: mx_uint,
    out: *mut NDArrayHandle,
) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let guard = lock(&array)?;
        let rows = *guard.shape.first().ok_or("cannot slice a 0-d array")?;
        let (begin, end) = (begin as usize, end as usize);
        if begin > end || end > rows {
            return Err(format!("invalid slice {begin}..{end} for {rows} rows"));
        }
        let row_len: usize = guard.shape[1..].iter().product();
        let mut shape = guard.shape.clone();
        shape[0] = end - begin;
        *out = fresh_array(ArrayData {
            shape,
            dtype: guard.dtype,
            dev_type: guard.dev_type,
            dev_id: guard.dev_id,
            data: guard.data[begin * row_len..end * row_len].to_vec(),
        });
        Ok(())
    })())
}

extern "C" fn nd_reshape(
    handle: NDArrayHandle,
    ndim: c_int,
    dims: *const c_int,
    out: *mut NDArrayHandle,
) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let guard = lock(&array)?;
        let len = guard.len();
        let requested: Vec<c_int> = (0..ndim as usize).map(|i| *dims.add(i)).collect();

        let mut shape = Vec::with_capacity(requested.len());
        let mut infer = None;
        let mut known = 1usize;
        for (i, &dim) in requested.iter().enumerate() {
            let resolved = match dim {
                -1 if infer.is_none() => {
                    infer = Some(i);
                    shape.push(0);
                    continue;
                }
                -1 => return Err("can only infer one dimension".to_string()),
                0 => *guard
                    .shape
                    .get(i)
                    .ok_or("0 may only keep an existing dimension")?,
                d if d > 0 => d as usize,
                _ => return Err(format!("invalid reshape dimension {dim}")),
            };
            known *= resolved;
            shape.push(resolved);
        }
        if let Some(i) = infer {
            if known == 0 || len % known != 0 {
                return Err(format!("cannot infer dimension {i} for {len} elements"));
            }
            shape[i] = len / known;
        } else if known != len {
            return Err(format!("cannot reshape {len} elements to {shape:?}"));
        }

        *out = fresh_array(ArrayData {
            shape,
            dtype: guard.dtype,
            dev_type: guard.dev_type,
            dev_id: guard.dev_id,
            data: guard.data.clone(),
        });
        Ok(())
    })())
}

extern "C" fn nd_wait_to_read(_handle: NDArrayHandle) -> c_int {
    0
}

extern "C" fn nd_wait_all() -> c_int {
    0
}

extern "C" fn nd_sync_copy_from_cpu(
    handle: NDArrayHandle,
    data: *const c_void,
    size: libc::size_t,
) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let mut guard = lock(&array)?;
        if guard.dtype != 0 {
            return Err("stub sync copy only supports float32 sources".to_string());
        }
        if size != guard.len() {
            return Err(format!(
                "copy size {size} does not match array size {}",
                guard.len()
            ));
        }
        let src = std::slice::from_raw_parts(data as *const f32, size);
        guard.data = src.iter().map(|&v| f64::from(v)).collect();
        Ok(())
    })())
}

extern "C" fn nd_sync_copy_to_cpu(
    handle: NDArrayHandle,
    data: *mut c_void,
    size: libc::size_t,
) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let guard = lock(&array)?;
        if size > guard.data.len() {
            return Err(format!(
                "copy size {size} exceeds array size {}",
                guard.data.len()
            ));
        }
        // Elements leave in the array's native width.
        for (i, &value) in guard.data[..size].iter().enumerate() {
            match guard.dtype {
                0 => *(data as *mut f32).add(i) = value as f32,
                1 => *(data as *mut f64).add(i) = value,
                2 => *(data as *mut u16).add(i) = f32_to_half(value as f32),
                3 => *(data as *mut u8).add(i) = value as u8,
                4 => *(data as *mut i32).add(i) = value as i32,
                5 => *(data as *mut i8).add(i) = value as i8,
                6 => *(data as *mut i64).add(i) = value as i64,
                other => return Err(format!("unknown dtype id {other}")),
            }
        }
        Ok(())
    })())
}

/// Narrowing for the float16 readback path; round-to-nearest is not
/// needed for the exact test values used.
fn f32_to_half(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let frac = bits & 0x007f_ffff;
    if exp == 0 {
        return sign;
    }
    let half_exp = exp - 127 + 15;
    if half_exp <= 0 {
        return sign;
    }
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }
    sign | ((half_exp as u16) << 10) | ((frac >> 13) as u16)
}

extern "C" fn nd_get_grad(handle: NDArrayHandle, out: *mut NDArrayHandle) -> c_int {
    status((|| unsafe {
        let array = array(handle)?;
        let marked = lock(&MARKED)?;
        let grad = marked
            .iter()
            .find(|(var, _, _)| Arc::ptr_eq(var, &array))
            .map(|(_, grad, _)| grad.clone());
        *out = match grad {
            Some(grad) => array_handle(grad),
            None => std::ptr::null_mut(),
        };
        Ok(())
    })())
}

extern "C" fn nd_save(
    fname: *const c_char,
    num_args: mx_uint,
    args: *const NDArrayHandle,
    keys: *const *const c_char,
) -> c_int {
    status((|| unsafe {
        let path = read_str(fname, "file name")?;
        let mut entries = Vec::with_capacity(num_args as usize);
        for i in 0..num_args as usize {
            let name = if keys.is_null() {
                None
            } else {
                Some(read_str(*keys.add(i), "array name")?)
            };
            let array = array(*args.add(i))?;
            let data = lock(&array)?.clone();
            entries.push((name, data));
        }
        lock(&FILES)?.insert(path, StoredFile::Arrays(entries));
        Ok(())
    })())
}

extern "C" fn nd_load(
    fname: *const c_char,
    out_size: *mut mx_uint,
    out_arr: *mut *mut NDArrayHandle,
    out_name_size: *mut mx_uint,
    out_names: *mut *mut *const c_char,
) -> c_int {
    status((|| unsafe {
        let path = read_str(fname, "file name")?;
        let files = lock(&FILES)?;
        let entries = match files.get(&path) {
            Some(StoredFile::Arrays(entries)) => entries.clone(),
            Some(StoredFile::Symbol(_)) => {
                return Err(format!("{path} does not hold arrays"));
            }
            None => return Err(format!("file not found: {path}")),
        };
        drop(files);

        let named = entries.iter().any(|(name, _)| name.is_some());
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            for (_, data) in &entries {
                scratch
                    .handles
                    .push(fresh_array(data.clone()));
            }
            *out_size = entries.len() as mx_uint;
            *out_arr = scratch.handles.as_mut_ptr() as *mut NDArrayHandle;
            if named {
                let names: Vec<String> = entries
                    .iter()
                    .map(|(name, _)| name.clone().unwrap_or_default())
                    .collect();
                *out_names = scratch.push_strings(&names);
                *out_name_size = names.len() as mx_uint;
            } else {
                *out_names = std::ptr::null_mut();
                *out_name_size = 0;
            }
        });
        Ok(())
    })())
}

// ======================================================================
// Operator catalog and imperative invocation
// ======================================================================

struct OpSpec {
    name: &'static str,
    description: &'static str,
    args: &'static [(&'static str, &'static str, &'static str)],
}

static OPS: &[OpSpec] = &[
    OpSpec {
        name: "_copyto",
        description: "Copies the input into the output buffer.",
        args: &[("data", "NDArray", "Source array.")],
    },
    OpSpec {
        name: "_zeros",
        description: "Fills a fresh array with zeros.",
        args: &[
            ("shape", "Shape(tuple)", "Shape of the result."),
            ("ctx", "string", "Device the result lives on."),
            ("dtype", "string", "Element type of the result."),
        ],
    },
    OpSpec {
        name: "_ones",
        description: "Fills a fresh array with ones.",
        args: &[
            ("shape", "Shape(tuple)", "Shape of the result."),
            ("ctx", "string", "Device the result lives on."),
            ("dtype", "string", "Element type of the result."),
        ],
    },
    OpSpec {
        name: "elemwise_add",
        description: "Adds two arrays of identical shape.",
        args: &[
            ("lhs", "NDArray", "First operand."),
            ("rhs", "NDArray", "Second operand."),
        ],
    },
];

fn op_by_handle(creator: OpHandle) -> Result<&'static OpSpec, String> {
    let idx = creator as usize;
    if idx == 0 || idx > OPS.len() {
        return Err("unknown operator handle".to_string());
    }
    Ok(&OPS[idx - 1])
}

extern "C" fn list_all_op_names(out_size: *mut mx_uint, out_array: *mut *mut *const c_char) -> c_int {
    status((|| unsafe {
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            let names: Vec<String> = OPS.iter().map(|op| op.name.to_string()).collect();
            *out_array = scratch.push_strings(&names);
            *out_size = names.len() as mx_uint;
        });
        Ok(())
    })())
}

extern "C" fn get_op_handle(name: *const c_char, out: *mut OpHandle) -> c_int {
    status((|| unsafe {
        let name = read_str(name, "operator name")?;
        let idx = OPS
            .iter()
            .position(|op| op.name == name)
            .ok_or_else(|| format!("operator {name} is not registered"))?;
        *out = (idx + 1) as OpHandle;
        Ok(())
    })())
}

extern "C" fn get_atomic_symbol_info(
    creator: OpHandle,
    name: *mut *const c_char,
    description: *mut *const c_char,
    num_args: *mut mx_uint,
    arg_names: *mut *mut *const c_char,
    arg_type_infos: *mut *mut *const c_char,
    arg_descriptions: *mut *mut *const c_char,
    key_var_num_args: *mut *const c_char,
    return_type: *mut *const c_char,
) -> c_int {
    status((|| unsafe {
        let op = op_by_handle(creator)?;
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            *name = scratch.push_string(op.name);
            *description = scratch.push_string(op.description);
            let names: Vec<String> = op.args.iter().map(|(n, _, _)| n.to_string()).collect();
            let types: Vec<String> = op.args.iter().map(|(_, t, _)| t.to_string()).collect();
            let descs: Vec<String> = op.args.iter().map(|(_, _, d)| d.to_string()).collect();
            *arg_names = scratch.push_strings(&names);
            *arg_type_infos = scratch.push_strings(&types);
            *arg_descriptions = scratch.push_strings(&descs);
            *num_args = op.args.len() as mx_uint;
            *key_var_num_args = scratch.push_string("");
            *return_type = scratch.push_string("");
        });
        Ok(())
    })())
}

/// Runs one operator over already-resolved inputs.
fn run_operator(
    op: &OpSpec,
    inputs: &[ArrayRef],
    params: &HashMap<String, String>,
) -> Result<Vec<ArrayData>, String> {
    match op.name {
        "_zeros" | "_ones" => {
            let shape = parse_shape(params.get("shape").map_or("[]", String::as_str))?;
            let (dev_type, dev_id) = match params.get("ctx") {
                Some(ctx) => parse_context(ctx)?,
                None => (1, 0),
            };
            let dtype = match params.get("dtype") {
                Some(name) => parse_dtype(name)?,
                None => 0,
            };
            let fill = if op.name == "_ones" { 1.0 } else { 0.0 };
            let len = shape.iter().product();
            Ok(vec![ArrayData {
                shape,
                dtype,
                dev_type,
                dev_id,
                data: vec![fill; len],
            }])
        }
        "_copyto" => {
            let src = inputs.first().ok_or("_copyto takes one input")?;
            Ok(vec![lock(src)?.clone()])
        }
        "elemwise_add" => {
            let [lhs, rhs] = inputs else {
                return Err("elemwise_add takes two inputs".to_string());
            };
            let lhs = lock(lhs)?.clone();
            let rhs = lock(rhs)?.clone();
            if lhs.shape != rhs.shape {
                return Err(format!(
                    "elemwise_add shape mismatch: {:?} vs {:?}",
                    lhs.shape, rhs.shape
                ));
            }
            let data = lhs
                .data
                .iter()
                .zip(&rhs.data)
                .map(|(a, b)| a + b)
                .collect();
            Ok(vec![ArrayData { data, ..lhs }])
        }
        other => Err(format!("operator {other} is not implemented")),
    }
}

extern "C" fn imperative_invoke(
    creator: OpHandle,
    num_inputs: c_int,
    inputs: *const NDArrayHandle,
    num_outputs: *mut c_int,
    outputs: *mut *mut NDArrayHandle,
    num_params: c_int,
    param_keys: *const *const c_char,
    param_vals: *const *const c_char,
) -> c_int {
    status((|| unsafe {
        let op = op_by_handle(creator)?;
        let mut resolved = Vec::with_capacity(num_inputs as usize);
        for i in 0..num_inputs as usize {
            resolved.push(array(*inputs.add(i))?);
        }
        let params: HashMap<String, String> =
            read_pairs(num_params as usize, param_keys, param_vals)?
                .into_iter()
                .collect();

        let results = run_operator(op, &resolved, &params)?;

        if *num_outputs > 0 && !(*outputs).is_null() {
            // Caller-provided buffers: results land in place and the
            // buffers keep their device placement.
            if results.len() != *num_outputs as usize {
                return Err(format!(
                    "{} produced {} outputs for {} buffers",
                    op.name,
                    results.len(),
                    *num_outputs
                ));
            }
            for (i, result) in results.into_iter().enumerate() {
                let target = array(*(*outputs).add(i))?;
                let mut guard = lock(&target)?;
                let (dev_type, dev_id) = (guard.dev_type, guard.dev_id);
                *guard = result;
                guard.dev_type = dev_type;
                guard.dev_id = dev_id;
            }
            return Ok(());
        }

        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            for result in &results {
                scratch.handles.push(fresh_array(result.clone()));
            }
            *num_outputs = results.len() as c_int;
            *outputs = scratch.handles.as_mut_ptr() as *mut NDArrayHandle;
        });
        Ok(())
    })())
}

// ======================================================================
// Symbol
// ======================================================================

extern "C" fn sym_create_from_file(fname: *const c_char, out: *mut SymbolHandle) -> c_int {
    status((|| unsafe {
        let path = read_str(fname, "file name")?;
        let files = lock(&FILES)?;
        let data = match files.get(&path) {
            Some(StoredFile::Symbol(data)) => data.deep_clone(),
            Some(StoredFile::Arrays(_)) => {
                return Err(format!("{path} does not hold a symbol"));
            }
            None => return Err(format!("file not found: {path}")),
        };
        drop(files);
        *out = mint::<SymbolRef>(Arc::new(Mutex::new(data)));
        Ok(())
    })())
}

extern "C" fn sym_create_from_json(json: *const c_char, out: *mut SymbolHandle) -> c_int {
    status((|| unsafe {
        let json = read_str(json, "json")?;
        let graphs = lock(&JSON_GRAPHS)?;
        let data = graphs
            .iter()
            .find(|(token, _)| json.contains(token.as_str()))
            .map(|(_, data)| data.deep_clone())
            .ok_or_else(|| format!("unparseable graph document: {json}"))?;
        drop(graphs);
        *out = mint::<SymbolRef>(Arc::new(Mutex::new(data)));
        Ok(())
    })())
}

extern "C" fn sym_create_variable(name: *const c_char, out: *mut SymbolHandle) -> c_int {
    status((|| unsafe {
        let name = read_str(name, "variable name")?;
        *out = mint::<SymbolRef>(Arc::new(Mutex::new(SymbolData {
            name: Some(name),
            ..SymbolData::default()
        })));
        Ok(())
    })())
}

extern "C" fn sym_create_atomic_symbol(
    creator: OpHandle,
    num_param: mx_uint,
    keys: *const *const c_char,
    vals: *const *const c_char,
    out: *mut SymbolHandle,
) -> c_int {
    status((|| unsafe {
        let op = op_by_handle(creator)?;
        let params = read_pairs(num_param as usize, keys, vals)?;
        *out = mint::<SymbolRef>(Arc::new(Mutex::new(SymbolData {
            op: Some(op.name.to_string()),
            params,
            ..SymbolData::default()
        })));
        Ok(())
    })())
}

extern "C" fn sym_compose(
    sym: SymbolHandle,
    name: *const c_char,
    num_args: mx_uint,
    keys: *const *const c_char,
    args: *const SymbolHandle,
) -> c_int {
    status((|| unsafe {
        let target = symbol(sym)?;
        let mut inputs = Vec::with_capacity(num_args as usize);
        for i in 0..num_args as usize {
            // Keyword order is accepted as given; the stub graph does not
            // reorder by declared argument name.
            if !keys.is_null() {
                let _ = read_str(*keys.add(i), "input name")?;
            }
            inputs.push(symbol(*args.add(i))?);
        }
        let mut guard = lock(&target)?;
        if guard.op.is_none() {
            return Err("only operator symbols can be composed".to_string());
        }
        if !name.is_null() {
            guard.name = Some(read_str(name, "symbol name")?);
        }
        guard.inputs = inputs;
        Ok(())
    })())
}

extern "C" fn sym_copy(handle: SymbolHandle, out: *mut SymbolHandle) -> c_int {
    status((|| unsafe {
        let source = symbol(handle)?;
        let copy = lock(&source)?.deep_clone();
        *out = mint::<SymbolRef>(Arc::new(Mutex::new(copy)));
        Ok(())
    })())
}

extern "C" fn sym_free(handle: SymbolHandle) -> c_int {
    unsafe {
        if release::<SymbolRef>(handle) {
            if let Ok(mut counters) = COUNTERS.lock() {
                counters.symbols += 1;
            }
        }
    }
    0
}

extern "C" fn sym_get_name(
    handle: SymbolHandle,
    out: *mut *const c_char,
    success: *mut c_int,
) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let name = lock(&sym)?.name.clone();
        match name {
            Some(name) => {
                SCRATCH.with(|scratch| {
                    let mut scratch = scratch.borrow_mut();
                    scratch.reset();
                    *out = scratch.push_string(&name);
                });
                *success = 1;
            }
            None => {
                *out = std::ptr::null();
                *success = 0;
            }
        }
        Ok(())
    })())
}

extern "C" fn sym_set_attr(
    handle: SymbolHandle,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let key = read_str(key, "attribute key")?;
        let value = read_str(value, "attribute value")?;
        let mut guard = lock(&sym)?;
        if let Some(entry) = guard.attrs.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            guard.attrs.push((key, value));
        }
        Ok(())
    })())
}

extern "C" fn sym_save_to_file(handle: SymbolHandle, fname: *const c_char) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let path = read_str(fname, "file name")?;
        let data = lock(&sym)?.deep_clone();
        lock(&FILES)?.insert(path, StoredFile::Symbol(data));
        Ok(())
    })())
}

extern "C" fn sym_save_to_json(handle: SymbolHandle, out_json: *mut *const c_char) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let data = lock(&sym)?.deep_clone();
        let token = format!("graph-{}", JSON_SERIAL.fetch_add(1, Ordering::Relaxed));
        let document = format!("{{\"nodes\":\"{token}\"}}");
        lock(&JSON_GRAPHS)?.insert(token, data);
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            *out_json = scratch.push_string(&document);
        });
        Ok(())
    })())
}

fn write_string_list(
    names: Vec<String>,
    out_size: *mut mx_uint,
    out_array: *mut *mut *const c_char,
) {
    SCRATCH.with(|scratch| {
        let mut scratch = scratch.borrow_mut();
        scratch.reset();
        unsafe {
            *out_array = scratch.push_strings(&names);
            *out_size = names.len() as mx_uint;
        }
    });
}

extern "C" fn sym_list_arguments(
    handle: SymbolHandle,
    out_size: *mut mx_uint,
    out_array: *mut *mut *const c_char,
) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let mut names = Vec::new();
        lock(&sym)?.argument_names(&mut names);
        write_string_list(names, out_size, out_array);
        Ok(())
    })())
}

extern "C" fn sym_list_outputs(
    handle: SymbolHandle,
    out_size: *mut mx_uint,
    out_array: *mut *mut *const c_char,
) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let name = lock(&sym)?.output_name();
        write_string_list(vec![name], out_size, out_array);
        Ok(())
    })())
}

extern "C" fn sym_list_auxiliary_states(
    _handle: SymbolHandle,
    out_size: *mut mx_uint,
    out_array: *mut *mut *const c_char,
) -> c_int {
    status((|| {
        write_string_list(Vec::new(), out_size, out_array);
        Ok(())
    })())
}

/// Shared body of the shape inference entry points: every argument and the
/// single output adopt the first known hint.
unsafe fn infer_shape_common(
    handle: SymbolHandle,
    num_args: mx_uint,
    keys: *const *const c_char,
    arg_ind_ptr: *const mx_uint,
    arg_shape_data: *const mx_uint,
    in_shape_size: *mut mx_uint,
    in_shape_ndim: *mut *const mx_uint,
    in_shape_data: *mut *const *const mx_uint,
    out_shape_size: *mut mx_uint,
    out_shape_ndim: *mut *const mx_uint,
    out_shape_data: *mut *const *const mx_uint,
    aux_shape_size: *mut mx_uint,
    aux_shape_ndim: *mut *const mx_uint,
    aux_shape_data: *mut *const *const mx_uint,
    complete: *mut c_int,
) -> Result<(), String> {
    let sym = symbol(handle)?;
    let mut arg_names = Vec::new();
    lock(&sym)?.argument_names(&mut arg_names);

    let mut candidate: Option<Vec<usize>> = None;
    for i in 0..num_args as usize {
        let start = *arg_ind_ptr.add(i) as usize;
        let end = *arg_ind_ptr.add(i + 1) as usize;
        if end > start {
            let row: Vec<usize> = (start..end)
                .map(|j| *arg_shape_data.add(j) as usize)
                .collect();
            if !keys.is_null() {
                let _ = read_str(*keys.add(i), "shape hint key")?;
            }
            candidate = Some(row);
            break;
        }
    }

    let Some(shape) = candidate else {
        *complete = 0;
        *in_shape_size = 0;
        *out_shape_size = 0;
        *aux_shape_size = 0;
        return Ok(());
    };

    let args: Vec<Vec<usize>> = arg_names.iter().map(|_| shape.clone()).collect();
    let outputs = vec![shape];
    SCRATCH.with(|scratch| {
        let mut scratch = scratch.borrow_mut();
        scratch.reset();
        scratch.shape_sets.push(ShapeSet::from_rows(&args));
        scratch.shape_sets.push(ShapeSet::from_rows(&outputs));
        scratch.shape_sets.push(ShapeSet::from_rows(&[]));

        let arg_set = &scratch.shape_sets[0];
        *in_shape_size = arg_set.ndims.len() as mx_uint;
        *in_shape_ndim = arg_set.ndims.as_ptr();
        *in_shape_data = arg_set.row_ptrs.as_ptr();

        let out_set = &scratch.shape_sets[1];
        *out_shape_size = out_set.ndims.len() as mx_uint;
        *out_shape_ndim = out_set.ndims.as_ptr();
        *out_shape_data = out_set.row_ptrs.as_ptr();

        let aux_set = &scratch.shape_sets[2];
        *aux_shape_size = 0;
        *aux_shape_ndim = aux_set.ndims.as_ptr();
        *aux_shape_data = aux_set.row_ptrs.as_ptr();
    });
    *complete = 1;
    Ok(())
}

extern "C" fn sym_infer_shape(
    handle: SymbolHandle,
    num_args: mx_uint,
    keys: *const *const c_char,
    arg_ind_ptr: *const mx_uint,
    arg_shape_data: *const mx_uint,
    in_shape_size: *mut mx_uint,
    in_shape_ndim: *mut *const mx_uint,
    in_shape_data: *mut *const *const mx_uint,
    out_shape_size: *mut mx_uint,
    out_shape_ndim: *mut *const mx_uint,
    out_shape_data: *mut *const *const mx_uint,
    aux_shape_size: *mut mx_uint,
    aux_shape_ndim: *mut *const mx_uint,
    aux_shape_data: *mut *const *const mx_uint,
    complete: *mut c_int,
) -> c_int {
    status(unsafe {
        infer_shape_common(
            handle,
            num_args,
            keys,
            arg_ind_ptr,
            arg_shape_data,
            in_shape_size,
            in_shape_ndim,
            in_shape_data,
            out_shape_size,
            out_shape_ndim,
            out_shape_data,
            aux_shape_size,
            aux_shape_ndim,
            aux_shape_data,
            complete,
        )
    })
}

extern "C" fn sym_infer_type(
    handle: SymbolHandle,
    num_args: mx_uint,
    keys: *const *const c_char,
    arg_type_data: *const c_int,
    in_type_size: *mut mx_uint,
    in_type_data: *mut *const c_int,
    out_type_size: *mut mx_uint,
    out_type_data: *mut *const c_int,
    aux_type_size: *mut mx_uint,
    aux_type_data: *mut *const c_int,
    complete: *mut c_int,
) -> c_int {
    status((|| unsafe {
        let sym = symbol(handle)?;
        let mut arg_names = Vec::new();
        lock(&sym)?.argument_names(&mut arg_names);

        let mut candidate = None;
        for i in 0..num_args as usize {
            let id = *arg_type_data.add(i);
            if id >= 0 {
                if !keys.is_null() {
                    let _ = read_str(*keys.add(i), "type hint key")?;
                }
                candidate = Some(id);
                break;
            }
        }

        let Some(id) = candidate else {
            *complete = 0;
            *in_type_size = 0;
            *out_type_size = 0;
            *aux_type_size = 0;
            return Ok(());
        };

        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            scratch.type_sets.push(vec![id; arg_names.len()]);
            scratch.type_sets.push(vec![id]);
            scratch.type_sets.push(Vec::new());

            *in_type_size = scratch.type_sets[0].len() as mx_uint;
            *in_type_data = scratch.type_sets[0].as_ptr();
            *out_type_size = scratch.type_sets[1].len() as mx_uint;
            *out_type_data = scratch.type_sets[1].as_ptr();
            *aux_type_size = 0;
            *aux_type_data = scratch.type_sets[2].as_ptr();
        });
        *complete = 1;
        Ok(())
    })())
}

// ======================================================================
// Executor
// ======================================================================

#[allow(clippy::too_many_arguments)]
extern "C" fn executor_bind_ex(
    symbol_handle: SymbolHandle,
    _dev_type: c_int,
    _dev_id: c_int,
    _num_map_keys: mx_uint,
    _map_keys: *const *const c_char,
    _map_dev_types: *const c_int,
    _map_dev_ids: *const c_int,
    len: mx_uint,
    in_args: *const NDArrayHandle,
    arg_grad_store: *const NDArrayHandle,
    grad_req_type: *const mx_uint,
    aux_states_len: mx_uint,
    aux_states: *const NDArrayHandle,
    _shared_exec: ExecutorHandle,
    out: *mut ExecutorHandle,
) -> c_int {
    status((|| unsafe {
        let _ = symbol(symbol_handle)?;
        let mut args = Vec::with_capacity(len as usize);
        let mut grads = Vec::with_capacity(len as usize);
        let mut reqs = Vec::with_capacity(len as usize);
        for i in 0..len as usize {
            args.push(array(*in_args.add(i))?);
            let grad_handle = *arg_grad_store.add(i);
            grads.push(if grad_handle.is_null() {
                None
            } else {
                Some(array(grad_handle)?)
            });
            reqs.push(*grad_req_type.add(i));
        }
        let mut aux = Vec::with_capacity(aux_states_len as usize);
        for i in 0..aux_states_len as usize {
            aux.push(array(*aux_states.add(i))?);
        }

        let template = match args.first() {
            Some(first) => {
                let guard = lock(first)?;
                ArrayData {
                    data: vec![0.0; guard.len()],
                    ..guard.clone()
                }
            }
            None => ArrayData::default(),
        };
        let output = Arc::new(Mutex::new(template));

        *out = mint::<ExecutorRef>(Arc::new(Mutex::new(ExecutorData {
            args,
            grads,
            reqs,
            aux,
            output,
        })));
        Ok(())
    })())
}

extern "C" fn executor_forward(handle: ExecutorHandle, _is_train: c_int) -> c_int {
    status((|| unsafe {
        let exec = deref::<ExecutorRef>(handle, "executor")?;
        let exec = lock(&exec)?;
        let mut sum: Option<ArrayData> = None;
        for arg in &exec.args {
            let arg = lock(arg)?;
            match &mut sum {
                None => sum = Some(arg.clone()),
                Some(acc) => {
                    if acc.shape != arg.shape {
                        return Err(format!(
                            "argument shape {:?} does not match {:?}",
                            arg.shape, acc.shape
                        ));
                    }
                    for (slot, value) in acc.data.iter_mut().zip(&arg.data) {
                        *slot += value;
                    }
                }
            }
        }
        if let Some(sum) = sum {
            *lock(&exec.output)? = sum;
        }
        Ok(())
    })())
}

extern "C" fn executor_backward_ex(
    handle: ExecutorHandle,
    len: mx_uint,
    head_grads: *const NDArrayHandle,
    _is_train: c_int,
) -> c_int {
    status((|| unsafe {
        let exec = deref::<ExecutorRef>(handle, "executor")?;
        let exec = lock(&exec)?;
        let ograd = if len > 0 {
            let head = array(*head_grads)?;
            let head = lock(&head)?.clone();
            Some(head)
        } else {
            None
        };
        for (grad, &req) in exec.grads.iter().zip(&exec.reqs) {
            let Some(grad) = grad else { continue };
            let mut grad = lock(grad)?;
            let incoming: Vec<f64> = match &ograd {
                Some(ograd) => ograd.data.clone(),
                None => vec![1.0; grad.data.len()],
            };
            match req {
                0 => {}
                1 => grad.data = incoming,
                3 => {
                    for (slot, value) in grad.data.iter_mut().zip(&incoming) {
                        *slot += value;
                    }
                }
                other => return Err(format!("unknown grad req code {other}")),
            }
        }
        Ok(())
    })())
}

extern "C" fn executor_outputs(
    handle: ExecutorHandle,
    out_size: *mut mx_uint,
    out: *mut *mut NDArrayHandle,
) -> c_int {
    status((|| unsafe {
        let exec = deref::<ExecutorRef>(handle, "executor")?;
        let output = lock(&exec)?.output.clone();
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            scratch.handles.push(array_handle(output));
            *out_size = 1;
            *out = scratch.handles.as_mut_ptr() as *mut NDArrayHandle;
        });
        Ok(())
    })())
}

extern "C" fn executor_free(handle: ExecutorHandle) -> c_int {
    unsafe {
        if release::<ExecutorRef>(handle) {
            if let Ok(mut counters) = COUNTERS.lock() {
                counters.executors += 1;
            }
        }
    }
    0
}

// ======================================================================
// CachedOp
// ======================================================================

extern "C" fn create_cached_op_ex(
    handle: SymbolHandle,
    num_flags: c_int,
    keys: *const *const c_char,
    vals: *const *const c_char,
    out: *mut CachedOpHandle,
) -> c_int {
    status((|| unsafe {
        let _ = symbol(handle)?;
        let flags = read_pairs(num_flags as usize, keys, vals)?;
        *out = mint::<CachedOpRef>(Arc::new(Mutex::new(CachedOpData { flags })));
        Ok(())
    })())
}

extern "C" fn invoke_cached_op_ex(
    handle: CachedOpHandle,
    num_inputs: c_int,
    inputs: *const NDArrayHandle,
    num_outputs: *mut c_int,
    outputs: *mut *mut NDArrayHandle,
    out_stypes: *mut *const c_int,
) -> c_int {
    status((|| unsafe {
        let _ = deref::<CachedOpRef>(handle, "cached op")?;
        let mut sum: Option<ArrayData> = None;
        for i in 0..num_inputs as usize {
            let input = array(*inputs.add(i))?;
            let input = lock(&input)?;
            match &mut sum {
                None => sum = Some(input.clone()),
                Some(acc) => {
                    if acc.shape != input.shape {
                        return Err(format!(
                            "input shape {:?} does not match {:?}",
                            input.shape, acc.shape
                        ));
                    }
                    for (slot, value) in acc.data.iter_mut().zip(&input.data) {
                        *slot += value;
                    }
                }
            }
        }
        let result = sum.ok_or("cached op invoked without inputs")?;

        if *num_outputs > 0 && !(*outputs).is_null() {
            if *num_outputs != 1 {
                return Err(format!("expected one output buffer, got {}", *num_outputs));
            }
            let target = array(**outputs)?;
            let mut guard = lock(&target)?;
            let (dev_type, dev_id) = (guard.dev_type, guard.dev_id);
            *guard = result;
            guard.dev_type = dev_type;
            guard.dev_id = dev_id;
            drop(guard);
            SCRATCH.with(|scratch| {
                let mut scratch = scratch.borrow_mut();
                scratch.reset();
                scratch.stypes.push(0);
                *out_stypes = scratch.stypes.as_ptr();
            });
            return Ok(());
        }

        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            scratch.handles.push(fresh_array(result));
            scratch.stypes.push(0);
            *num_outputs = 1;
            *outputs = scratch.handles.as_mut_ptr() as *mut NDArrayHandle;
            *out_stypes = scratch.stypes.as_ptr();
        });
        Ok(())
    })())
}

extern "C" fn free_cached_op(handle: CachedOpHandle) -> c_int {
    unsafe {
        if release::<CachedOpRef>(handle) {
            if let Ok(mut counters) = COUNTERS.lock() {
                counters.cached_ops += 1;
            }
        }
    }
    0
}

// ======================================================================
// KVStore
// ======================================================================

extern "C" fn kv_create(kind: *const c_char, out: *mut KVStoreHandle) -> c_int {
    status((|| unsafe {
        let kind = read_str(kind, "store kind")?;
        *out = mint::<KvStoreRef>(Arc::new(Mutex::new(KvStoreData {
            kind,
            ..KvStoreData::default()
        })));
        Ok(())
    })())
}

extern "C" fn kv_free(handle: KVStoreHandle) -> c_int {
    unsafe {
        if release::<KvStoreRef>(handle) {
            if let Ok(mut counters) = COUNTERS.lock() {
                counters.kvstores += 1;
            }
        }
    }
    0
}

extern "C" fn kv_get_type(handle: KVStoreHandle, kind: *mut *const c_char) -> c_int {
    status((|| unsafe {
        let store = deref::<KvStoreRef>(handle, "store")?;
        let name = lock(&store)?.kind.clone();
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            *kind = scratch.push_string(&name);
        });
        Ok(())
    })())
}

enum KvKeyRepr {
    Int(c_int),
    Str(String),
}

unsafe fn kv_entries(
    num: mx_uint,
    int_keys: *const c_int,
    str_keys: *const *const c_char,
    vals: *const NDArrayHandle,
) -> Result<Vec<(KvKeyRepr, ArrayRef)>, String> {
    let mut entries = Vec::with_capacity(num as usize);
    for i in 0..num as usize {
        let key = if str_keys.is_null() {
            KvKeyRepr::Int(*int_keys.add(i))
        } else {
            KvKeyRepr::Str(read_str(*str_keys.add(i), "store key")?)
        };
        entries.push((key, array(*vals.add(i))?));
    }
    Ok(entries)
}

unsafe fn kv_init(
    handle: KVStoreHandle,
    num: mx_uint,
    int_keys: *const c_int,
    str_keys: *const *const c_char,
    vals: *const NDArrayHandle,
) -> Result<(), String> {
    let store = deref::<KvStoreRef>(handle, "store")?;
    let entries = kv_entries(num, int_keys, str_keys, vals)?;
    let mut guard = lock(&store)?;
    for (key, value) in entries {
        let copy = Arc::new(Mutex::new(lock(&value)?.clone()));
        match key {
            KvKeyRepr::Int(key) => {
                guard.int_vals.insert(key, copy);
            }
            KvKeyRepr::Str(key) => {
                guard.str_vals.insert(key, copy);
            }
        }
    }
    Ok(())
}

unsafe fn kv_push(
    handle: KVStoreHandle,
    num: mx_uint,
    int_keys: *const c_int,
    str_keys: *const *const c_char,
    vals: *const NDArrayHandle,
) -> Result<(), String> {
    let store = deref::<KvStoreRef>(handle, "store")?;
    let entries = kv_entries(num, int_keys, str_keys, vals)?;
    for (key, value) in entries {
        // State is read under the lock but the updater runs outside it:
        // the callback re-enters this table through the wrapped arrays.
        let (stored, updater) = {
            let guard = lock(&store)?;
            let stored = match &key {
                KvKeyRepr::Int(key) => guard.int_vals.get(key).cloned(),
                KvKeyRepr::Str(key) => guard.str_vals.get(key).cloned(),
            };
            (stored, guard.updater)
        };
        let stored = stored.ok_or_else(|| match &key {
            KvKeyRepr::Int(key) => format!("key {key} has not been initialized"),
            KvKeyRepr::Str(key) => format!("key {key} has not been initialized"),
        })?;

        match updater {
            Some(entry) => {
                let recv = fresh_array(lock(&value)?.clone());
                let local = array_handle(stored);
                match key {
                    KvKeyRepr::Int(key) => {
                        (entry.int_fn)(key, recv, local, entry.ctx as *mut c_void)
                    }
                    KvKeyRepr::Str(key) => {
                        let key = CString::new(key).unwrap_or_default();
                        (entry.str_fn)(key.as_ptr(), recv, local, entry.ctx as *mut c_void)
                    }
                }
            }
            None => {
                *lock(&stored)? = lock(&value)?.clone();
            }
        }
    }
    Ok(())
}

unsafe fn kv_pull(
    handle: KVStoreHandle,
    num: mx_uint,
    int_keys: *const c_int,
    str_keys: *const *const c_char,
    vals: *const NDArrayHandle,
) -> Result<(), String> {
    let store = deref::<KvStoreRef>(handle, "store")?;
    let entries = kv_entries(num, int_keys, str_keys, vals)?;
    let guard = lock(&store)?;
    for (key, out) in entries {
        let stored = match &key {
            KvKeyRepr::Int(key) => guard.int_vals.get(key).cloned(),
            KvKeyRepr::Str(key) => guard.str_vals.get(key).cloned(),
        };
        let stored = stored.ok_or_else(|| match &key {
            KvKeyRepr::Int(key) => format!("key {key} has not been initialized"),
            KvKeyRepr::Str(key) => format!("key {key} has not been initialized"),
        })?;
        *lock(&out)? = lock(&stored)?.clone();
    }
    Ok(())
}

extern "C" fn kv_store_init(
    handle: KVStoreHandle,
    num: mx_uint,
    keys: *const c_int,
    vals: *const NDArrayHandle,
) -> c_int {
    status(unsafe { kv_init(handle, num, keys, std::ptr::null(), vals) })
}

extern "C" fn kv_store_init_ex(
    handle: KVStoreHandle,
    num: mx_uint,
    keys: *const *const c_char,
    vals: *const NDArrayHandle,
) -> c_int {
    status(unsafe { kv_init(handle, num, std::ptr::null(), keys, vals) })
}

extern "C" fn kv_store_push(
    handle: KVStoreHandle,
    num: mx_uint,
    keys: *const c_int,
    vals: *const NDArrayHandle,
    _priority: c_int,
) -> c_int {
    status(unsafe { kv_push(handle, num, keys, std::ptr::null(), vals) })
}

extern "C" fn kv_store_push_ex(
    handle: KVStoreHandle,
    num: mx_uint,
    keys: *const *const c_char,
    vals: *const NDArrayHandle,
    _priority: c_int,
) -> c_int {
    status(unsafe { kv_push(handle, num, std::ptr::null(), keys, vals) })
}

extern "C" fn kv_store_pull(
    handle: KVStoreHandle,
    num: mx_uint,
    keys: *const c_int,
    vals: *const NDArrayHandle,
    _priority: c_int,
) -> c_int {
    status(unsafe { kv_pull(handle, num, keys, std::ptr::null(), vals) })
}

extern "C" fn kv_store_pull_ex(
    handle: KVStoreHandle,
    num: mx_uint,
    keys: *const *const c_char,
    vals: *const NDArrayHandle,
    _priority: c_int,
) -> c_int {
    status(unsafe { kv_pull(handle, num, std::ptr::null(), keys, vals) })
}

extern "C" fn kv_set_updater_ex(
    handle: KVStoreHandle,
    updater: MXKVStoreUpdater,
    str_updater: MXKVStoreStrUpdater,
    ctx: *mut c_void,
) -> c_int {
    status((|| unsafe {
        let store = deref::<KvStoreRef>(handle, "store")?;
        lock(&store)?.updater = Some(UpdaterEntry {
            int_fn: updater,
            str_fn: str_updater,
            ctx: ctx as usize,
        });
        Ok(())
    })())
}

extern "C" fn kv_set_gradient_compression(
    handle: KVStoreHandle,
    num_params: mx_uint,
    keys: *const *const c_char,
    vals: *const *const c_char,
) -> c_int {
    status((|| unsafe {
        let store = deref::<KvStoreRef>(handle, "store")?;
        let params = read_pairs(num_params as usize, keys, vals)?;
        lock(&store)?.compression = params;
        Ok(())
    })())
}

// ======================================================================
// DataIter
// ======================================================================

const ITER_NAME: &str = "ArrayBatchIter";
const ITER_CREATOR: DataIterCreator = 1 as DataIterCreator;

extern "C" fn list_data_iters(out_size: *mut mx_uint, out_array: *mut *mut DataIterCreator) -> c_int {
    status((|| unsafe {
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            scratch.handles.push(ITER_CREATOR);
            *out_size = 1;
            *out_array = scratch.handles.as_mut_ptr() as *mut DataIterCreator;
        });
        Ok(())
    })())
}

extern "C" fn data_iter_get_iter_info(
    creator: DataIterCreator,
    name: *mut *const c_char,
    description: *mut *const c_char,
    num_args: *mut mx_uint,
    arg_names: *mut *mut *const c_char,
    arg_type_infos: *mut *mut *const c_char,
    arg_descriptions: *mut *mut *const c_char,
) -> c_int {
    status((|| unsafe {
        if creator != ITER_CREATOR {
            return Err("unknown iterator creator handle".to_string());
        }
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            *name = scratch.push_string(ITER_NAME);
            *description =
                scratch.push_string("Iterates fixed-size batches over a synthetic sequence.");
            let names = vec![
                "batch_size".to_string(),
                "num_batches".to_string(),
                "pad".to_string(),
            ];
            let types = vec![
                "int, required".to_string(),
                "int, optional".to_string(),
                "int, optional".to_string(),
            ];
            let descs = vec![
                "Examples per batch.".to_string(),
                "Batches per epoch.".to_string(),
                "Padding examples reported for every batch.".to_string(),
            ];
            *arg_names = scratch.push_strings(&names);
            *arg_type_infos = scratch.push_strings(&types);
            *arg_descriptions = scratch.push_strings(&descs);
            *num_args = 3;
        });
        Ok(())
    })())
}

extern "C" fn data_iter_create_iter(
    creator: DataIterCreator,
    num_param: mx_uint,
    keys: *const *const c_char,
    vals: *const *const c_char,
    out: *mut DataIterHandle,
) -> c_int {
    status((|| unsafe {
        if creator != ITER_CREATOR {
            return Err("unknown iterator creator handle".to_string());
        }
        let mut batch_size = 1usize;
        let mut num_batches = 3usize;
        let mut pad: c_int = 0;
        for (key, value) in read_pairs(num_param as usize, keys, vals)? {
            let parsed = value
                .parse::<i64>()
                .map_err(|_| format!("invalid value for {key}: {value}"))?;
            match key.as_str() {
                "batch_size" => batch_size = parsed as usize,
                "num_batches" => num_batches = parsed as usize,
                "pad" => pad = parsed as c_int,
                other => return Err(format!("unknown parameter {other} for {ITER_NAME}")),
            }
        }
        *out = mint::<DataIterRef>(Arc::new(Mutex::new(DataIterData {
            batch_size,
            num_batches,
            pad,
            cursor: -1,
        })));
        Ok(())
    })())
}

extern "C" fn data_iter_free(handle: DataIterHandle) -> c_int {
    unsafe {
        if release::<DataIterRef>(handle) {
            if let Ok(mut counters) = COUNTERS.lock() {
                counters.data_iters += 1;
            }
        }
    }
    0
}

extern "C" fn data_iter_next(handle: DataIterHandle, out: *mut c_int) -> c_int {
    status((|| unsafe {
        let iter = deref::<DataIterRef>(handle, "iterator")?;
        let mut guard = lock(&iter)?;
        guard.cursor += 1;
        *out = (guard.cursor < guard.num_batches as isize) as c_int;
        Ok(())
    })())
}

extern "C" fn data_iter_before_first(handle: DataIterHandle) -> c_int {
    status((|| unsafe {
        let iter = deref::<DataIterRef>(handle, "iterator")?;
        lock(&iter)?.cursor = -1;
        Ok(())
    })())
}

unsafe fn current_batch(handle: DataIterHandle) -> Result<(usize, usize), String> {
    let iter = deref::<DataIterRef>(handle, "iterator")?;
    let guard = lock(&iter)?;
    if guard.cursor < 0 || guard.cursor >= guard.num_batches as isize {
        return Err("iterator is not positioned on a batch".to_string());
    }
    Ok((guard.cursor as usize, guard.batch_size))
}

extern "C" fn data_iter_get_data(handle: DataIterHandle, out: *mut NDArrayHandle) -> c_int {
    status((|| unsafe {
        let (batch, batch_size) = current_batch(handle)?;
        *out = fresh_array(ArrayData {
            shape: vec![batch_size],
            dtype: 0,
            dev_type: 1,
            dev_id: 0,
            data: (0..batch_size)
                .map(|j| (batch * batch_size + j) as f64)
                .collect(),
        });
        Ok(())
    })())
}

extern "C" fn data_iter_get_label(handle: DataIterHandle, out: *mut NDArrayHandle) -> c_int {
    status((|| unsafe {
        let (batch, batch_size) = current_batch(handle)?;
        *out = fresh_array(ArrayData {
            shape: vec![batch_size],
            dtype: 0,
            dev_type: 1,
            dev_id: 0,
            data: (0..batch_size)
                .map(|j| (batch * batch_size + j) as f64 + 0.5)
                .collect(),
        });
        Ok(())
    })())
}

extern "C" fn data_iter_get_pad_num(handle: DataIterHandle, pad: *mut c_int) -> c_int {
    status((|| unsafe {
        let iter = deref::<DataIterRef>(handle, "iterator")?;
        *pad = lock(&iter)?.pad;
        Ok(())
    })())
}

extern "C" fn data_iter_get_index(
    handle: DataIterHandle,
    out_index: *mut *mut u64,
    out_size: *mut u64,
) -> c_int {
    status((|| unsafe {
        let (batch, batch_size) = current_batch(handle)?;
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.reset();
            scratch.index = (0..batch_size)
                .map(|j| (batch * batch_size + j) as u64)
                .collect();
            *out_index = scratch.index.as_mut_ptr();
            *out_size = batch_size as u64;
        });
        Ok(())
    })())
}

// ======================================================================
// Autograd and random
// ======================================================================

extern "C" fn autograd_set_is_recording(is_recording: c_int, prev: *mut c_int) -> c_int {
    status((|| unsafe {
        RECORDING.with(|flag| {
            let mut flag = flag.borrow_mut();
            *prev = *flag as c_int;
            *flag = is_recording != 0;
        });
        Ok(())
    })())
}

extern "C" fn autograd_set_is_training(is_training: c_int, prev: *mut c_int) -> c_int {
    status((|| unsafe {
        TRAINING.with(|flag| {
            let mut flag = flag.borrow_mut();
            *prev = *flag as c_int;
            *flag = is_training != 0;
        });
        Ok(())
    })())
}

extern "C" fn autograd_is_recording(curr: *mut u8) -> c_int {
    status((|| unsafe {
        RECORDING.with(|flag| *curr = *flag.borrow() as u8);
        Ok(())
    })())
}

extern "C" fn autograd_is_training(curr: *mut u8) -> c_int {
    status((|| unsafe {
        TRAINING.with(|flag| *curr = *flag.borrow() as u8);
        Ok(())
    })())
}

extern "C" fn autograd_mark_variables(
    num_var: mx_uint,
    var_handles: *const NDArrayHandle,
    reqs_array: *const mx_uint,
    grad_handles: *const NDArrayHandle,
) -> c_int {
    status((|| unsafe {
        let mut marked = lock(&MARKED)?;
        for i in 0..num_var as usize {
            marked.push((
                array(*var_handles.add(i))?,
                array(*grad_handles.add(i))?,
                *reqs_array.add(i),
            ));
        }
        Ok(())
    })())
}

extern "C" fn autograd_backward_ex(
    num_output: mx_uint,
    _output_handles: *const NDArrayHandle,
    ograd_handles: *const NDArrayHandle,
    _num_variables: mx_uint,
    _var_handles: *const NDArrayHandle,
    _retain_graph: c_int,
    _create_graph: c_int,
    _is_train: c_int,
    _grad_handles: *mut *mut NDArrayHandle,
    _grad_stypes: *mut *const c_int,
) -> c_int {
    status((|| unsafe {
        let scale = if ograd_handles.is_null() || num_output == 0 {
            1.0
        } else {
            let ograd = array(*ograd_handles)?;
            let guard = lock(&ograd)?;
            guard.data.first().copied().unwrap_or(1.0)
        };
        let marked = lock(&MARKED)?;
        for (var, grad, req) in marked.iter() {
            let len = lock(var)?.len();
            let mut grad = lock(grad)?;
            match req {
                0 => {}
                1 => grad.data = vec![scale; len],
                3 => {
                    for slot in grad.data.iter_mut() {
                        *slot += scale;
                    }
                }
                other => return Err(format!("unknown grad req code {other}")),
            }
        }
        Ok(())
    })())
}

extern "C" fn random_seed(seed: c_int) -> c_int {
    LAST_SEED.store(seed, Ordering::Relaxed);
    0
}

// ======================================================================
// Table assembly and test accessors
// ======================================================================

/// The full function table over the in-memory state.
pub fn table() -> MxApi {
    MxApi {
        mx_get_last_error: get_last_error,

        mx_nd_array_create_ex: nd_create_ex,
        mx_nd_array_free: nd_free,
        mx_nd_array_get_shape: nd_get_shape,
        mx_nd_array_get_dtype: nd_get_dtype,
        mx_nd_array_get_context: nd_get_context,
        mx_nd_array_at: nd_at,
        mx_nd_array_slice: nd_slice,
        mx_nd_array_reshape: nd_reshape,
        mx_nd_array_wait_to_read: nd_wait_to_read,
        mx_nd_array_wait_all: nd_wait_all,
        mx_nd_array_sync_copy_from_cpu: nd_sync_copy_from_cpu,
        mx_nd_array_sync_copy_to_cpu: nd_sync_copy_to_cpu,
        mx_nd_array_get_grad: nd_get_grad,
        mx_nd_array_save: nd_save,
        mx_nd_array_load: nd_load,

        mx_symbol_create_from_file: sym_create_from_file,
        mx_symbol_create_from_json: sym_create_from_json,
        mx_symbol_create_variable: sym_create_variable,
        mx_symbol_create_atomic_symbol: sym_create_atomic_symbol,
        mx_symbol_compose: sym_compose,
        mx_symbol_copy: sym_copy,
        mx_symbol_free: sym_free,
        mx_symbol_get_name: sym_get_name,
        mx_symbol_set_attr: sym_set_attr,
        mx_symbol_save_to_file: sym_save_to_file,
        mx_symbol_save_to_json: sym_save_to_json,
        mx_symbol_list_arguments: sym_list_arguments,
        mx_symbol_list_outputs: sym_list_outputs,
        mx_symbol_list_auxiliary_states: sym_list_auxiliary_states,
        mx_symbol_infer_shape: sym_infer_shape,
        mx_symbol_infer_shape_partial: sym_infer_shape,
        mx_symbol_infer_type: sym_infer_type,

        mx_executor_bind_ex: executor_bind_ex,
        mx_executor_forward: executor_forward,
        mx_executor_backward_ex: executor_backward_ex,
        mx_executor_outputs: executor_outputs,
        mx_executor_free: executor_free,

        mx_create_cached_op_ex: create_cached_op_ex,
        mx_invoke_cached_op_ex: invoke_cached_op_ex,
        mx_free_cached_op: free_cached_op,

        mx_kv_store_create: kv_create,
        mx_kv_store_free: kv_free,
        mx_kv_store_get_type: kv_get_type,
        mx_kv_store_init: kv_store_init,
        mx_kv_store_init_ex: kv_store_init_ex,
        mx_kv_store_push: kv_store_push,
        mx_kv_store_push_ex: kv_store_push_ex,
        mx_kv_store_pull: kv_store_pull,
        mx_kv_store_pull_ex: kv_store_pull_ex,
        mx_kv_store_set_updater_ex: kv_set_updater_ex,
        mx_kv_store_set_gradient_compression: kv_set_gradient_compression,

        mx_list_data_iters: list_data_iters,
        mx_data_iter_get_iter_info: data_iter_get_iter_info,
        mx_data_iter_create_iter: data_iter_create_iter,
        mx_data_iter_free: data_iter_free,
        mx_data_iter_next: data_iter_next,
        mx_data_iter_before_first: data_iter_before_first,
        mx_data_iter_get_data: data_iter_get_data,
        mx_data_iter_get_label: data_iter_get_label,
        mx_data_iter_get_pad_num: data_iter_get_pad_num,
        mx_data_iter_get_index: data_iter_get_index,

        mx_autograd_set_is_recording: autograd_set_is_recording,
        mx_autograd_set_is_training: autograd_set_is_training,
        mx_autograd_is_recording: autograd_is_recording,
        mx_autograd_is_training: autograd_is_training,
        mx_autograd_mark_variables: autograd_mark_variables,
        mx_autograd_backward_ex: autograd_backward_ex,

        mx_random_seed: random_seed,

        mx_list_all_op_names: list_all_op_names,
        nn_get_op_handle: get_op_handle,
        mx_symbol_get_atomic_symbol_info: get_atomic_symbol_info,
        mx_imperative_invoke: imperative_invoke,
    }
}

static INSTALL: Once = Once::new();

/// Installs the stub table as the process-wide API, once.
pub fn install() {
    INSTALL.call_once(|| {
        mxnet::api::install(table()).expect("no other API table may be installed first");
    });
}

/// Snapshot of the per-kind free counters.
pub fn counters() -> Counters {
    *COUNTERS.lock().unwrap()
}

/// The most recent seed forwarded to the stub.
pub fn last_seed() -> i32 {
    LAST_SEED.load(Ordering::Relaxed)
}
