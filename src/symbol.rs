//! Symbolic graph handles.
//!
//! A `Symbol` names a node in the declarative graph: a free variable, a
//! loaded graph, or an operator applied to other symbols. Inspection and
//! inference go straight to the native graph; `bind` pairs the graph with
//! concrete arrays on a device and produces an [`Executor`].

use std::collections::HashMap;
use std::ptr;

use libc::{c_char, c_int};

use crate::api::sys::{mx_uint, ExecutorHandle, NDArrayHandle, SymbolHandle};
use crate::context::Context;
use crate::dtype::DType;
use crate::error::{check, Error, Result};
use crate::executor::Executor;
use crate::marshal::{
    checked_uint, cstr_array_to_vec, cstr_to_string, cstring_ptrs, pin_cstring, AttrPairs,
    ShapeCsr,
};
use crate::ndarray::NDArray;
use crate::ops;

#[derive(Debug)]
pub struct Symbol {
    handle: SymbolHandle,
}

// Symbol handles reference immutable graph nodes once composed; the native
// library guards its own registries.
unsafe impl Send for Symbol {}

impl Symbol {
    /// Loads a serialized graph from `path`.
    pub fn load(path: &str) -> Result<Self> {
        let api = crate::api::table()?;
        let fname = pin_cstring(path)?;
        let mut handle: SymbolHandle = ptr::null_mut();
        // SAFETY: fname is NUL-terminated and outlives the call.
        unsafe {
            check(
                api,
                (api.mx_symbol_create_from_file)(fname.as_ptr(), &mut handle),
            )?;
        }
        Ok(Symbol { handle })
    }

    /// Builds a graph from its JSON serialization.
    pub fn from_json(json: &str) -> Result<Self> {
        let api = crate::api::table()?;
        let json = pin_cstring(json)?;
        let mut handle: SymbolHandle = ptr::null_mut();
        // SAFETY: json is NUL-terminated and outlives the call.
        unsafe {
            check(
                api,
                (api.mx_symbol_create_from_json)(json.as_ptr(), &mut handle),
            )?;
        }
        Ok(Symbol { handle })
    }

    /// Creates a free variable named `name`.
    pub fn variable(name: &str) -> Result<Self> {
        let api = crate::api::table()?;
        let name = pin_cstring(name)?;
        let mut handle: SymbolHandle = ptr::null_mut();
        // SAFETY: name is NUL-terminated and outlives the call.
        unsafe {
            check(
                api,
                (api.mx_symbol_create_variable)(name.as_ptr(), &mut handle),
            )?;
        }
        Ok(Symbol { handle })
    }

    /// Applies the operator `op` to the given input symbols.
    ///
    /// Scalar parameters are stringified into the operator's key/value
    /// attribute form. Inputs are supplied either positionally or by
    /// argument name; a `None` name lets the native library pick one.
    pub fn create(
        op: &str,
        name: Option<&str>,
        inputs: &SymbolInputs<'_>,
        params: &[(&str, String)],
    ) -> Result<Self> {
        let descriptor = ops::get(op)?;
        let api = crate::api::table()?;

        let mut pairs = AttrPairs::with_capacity(params.len());
        for (key, value) in params {
            pairs.push(key, value)?;
        }
        let num_params = pairs.count_uint("operator parameters")?;
        let key_ptrs = pairs.key_ptrs();
        let val_ptrs = pairs.val_ptrs();

        let mut handle: SymbolHandle = ptr::null_mut();
        // SAFETY: the key/value pointer arrays are backed by pairs for the
        // duration of the call.
        unsafe {
            check(
                api,
                (api.mx_symbol_create_atomic_symbol)(
                    descriptor.handle,
                    num_params,
                    key_ptrs.as_ptr(),
                    val_ptrs.as_ptr(),
                    &mut handle,
                ),
            )?;
        }

        // The wrapper owns the fresh handle from here on, so a failed
        // compose still frees it.
        let symbol = Symbol { handle };
        symbol.compose(name, inputs)?;
        Ok(symbol)
    }

    fn compose(&self, name: Option<&str>, inputs: &SymbolInputs<'_>) -> Result<()> {
        if !inputs.positional.is_empty() && !inputs.named.is_empty() {
            return Err(Error::InvalidArgument(
                "compose only accept input Symbols either as positional or keyword arguments"
                    .into(),
            ));
        }

        let api = crate::api::table()?;
        let name = match name {
            Some(name) => Some(pin_cstring(name)?),
            None => None,
        };

        let mut keys = Vec::new();
        let mut args: Vec<SymbolHandle> = Vec::new();
        if inputs.named.is_empty() {
            for input in &inputs.positional {
                args.push(input.handle);
            }
        } else {
            for (key, input) in &inputs.named {
                keys.push(pin_cstring(key)?);
                args.push(input.handle);
            }
        }
        let key_ptrs = cstring_ptrs(&keys);
        let num_args = checked_uint(args.len(), "input symbols")?;

        // SAFETY: name, keys and args are all backed by locals alive for
        // the duration of the call; NULL keys selects positional compose.
        unsafe {
            check(
                api,
                (api.mx_symbol_compose)(
                    self.handle,
                    name.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
                    num_args,
                    if keys.is_empty() {
                        ptr::null()
                    } else {
                        key_ptrs.as_ptr()
                    },
                    args.as_ptr(),
                ),
            )
        }
    }

    pub(crate) fn handle(&self) -> SymbolHandle {
        self.handle
    }

    // ==================================================================
    // Inspection
    // ==================================================================

    /// The symbol's name, or `None` for unnamed nodes such as freshly
    /// grouped outputs.
    pub fn name(&self) -> Result<Option<String>> {
        let api = crate::api::table()?;
        let mut out: *const c_char = ptr::null();
        let mut success: c_int = 0;
        // SAFETY: out parameters are written by the call; the string is
        // only read when the success flag says it was set.
        unsafe {
            check(
                api,
                (api.mx_symbol_get_name)(self.handle, &mut out, &mut success),
            )?;
            if success == 0 {
                Ok(None)
            } else {
                cstr_to_string(out).map(Some)
            }
        }
    }

    pub fn list_arguments(&self) -> Result<Vec<String>> {
        self.string_list(crate::api::table()?.mx_symbol_list_arguments)
    }

    pub fn list_outputs(&self) -> Result<Vec<String>> {
        self.string_list(crate::api::table()?.mx_symbol_list_outputs)
    }

    pub fn list_auxiliary_states(&self) -> Result<Vec<String>> {
        self.string_list(crate::api::table()?.mx_symbol_list_auxiliary_states)
    }

    fn string_list(
        &self,
        list: unsafe extern "C" fn(SymbolHandle, *mut mx_uint, *mut *mut *const c_char) -> c_int,
    ) -> Result<Vec<String>> {
        let api = crate::api::table()?;
        let mut size: mx_uint = 0;
        let mut names: *mut *const c_char = ptr::null_mut();
        // SAFETY: the native call fills size and names; the returned array
        // stays valid until the next call into the library.
        unsafe {
            check(api, list(self.handle, &mut size, &mut names))?;
            cstr_array_to_vec(names as *const *const c_char, size as usize)
        }
    }

    /// Serializes the graph to its JSON form.
    pub fn to_json(&self) -> Result<String> {
        let api = crate::api::table()?;
        let mut out: *const c_char = ptr::null();
        // SAFETY: out is written by the call before it is read.
        unsafe {
            check(api, (api.mx_symbol_save_to_json)(self.handle, &mut out))?;
            cstr_to_string(out)
        }
    }

    /// Writes the serialized graph to `path`.
    pub fn save(&self, path: &str) -> Result<()> {
        let api = crate::api::table()?;
        let fname = pin_cstring(path)?;
        // SAFETY: fname is NUL-terminated and outlives the call.
        unsafe {
            check(
                api,
                (api.mx_symbol_save_to_file)(self.handle, fname.as_ptr()),
            )
        }
    }

    /// Deep-copies the graph into a new handle.
    pub fn dup(&self) -> Result<Symbol> {
        let api = crate::api::table()?;
        let mut handle: SymbolHandle = ptr::null_mut();
        // SAFETY: out is written by the call.
        unsafe {
            check(api, (api.mx_symbol_copy)(self.handle, &mut handle))?;
        }
        Ok(Symbol { handle })
    }

    /// Sets string attributes on the symbol, one pair per native call.
    pub fn set_attr(&self, attrs: &[(&str, &str)]) -> Result<()> {
        let api = crate::api::table()?;
        for (key, value) in attrs {
            let key = pin_cstring(key)?;
            let value = pin_cstring(value)?;
            // SAFETY: both strings are NUL-terminated and outlive the call.
            unsafe {
                check(
                    api,
                    (api.mx_symbol_set_attr)(self.handle, key.as_ptr(), value.as_ptr()),
                )?;
            }
        }
        Ok(())
    }

    // ==================================================================
    // Inference
    // ==================================================================

    /// Deduces argument, output and auxiliary shapes from the known shapes
    /// in `hints`. Returns `None` when the graph is underdetermined.
    pub fn infer_shape(&self, hints: &ShapeHints) -> Result<Option<InferredShapes>> {
        self.infer_shape_impl(hints, false)
    }

    /// Like [`infer_shape`](Self::infer_shape) but returns whatever the
    /// native library could deduce even when inference is incomplete.
    pub fn infer_shape_partial(&self, hints: &ShapeHints) -> Result<Option<InferredShapes>> {
        self.infer_shape_impl(hints, true)
    }

    fn infer_shape_impl(&self, hints: &ShapeHints, partial: bool) -> Result<Option<InferredShapes>> {
        if !hints.positional.is_empty() && !hints.named.is_empty() {
            return Err(Error::InvalidArgument(
                "Can only specify known argument shapes either by positional or kwargs way."
                    .into(),
            ));
        }

        let api = crate::api::table()?;
        let mut csr = ShapeCsr::new();
        let mut keys = Vec::new();
        if hints.named.is_empty() {
            for shape in &hints.positional {
                // Unknown entries keep their row empty so the column
                // offsets stay aligned with the argument order.
                match shape {
                    Some(dims) => csr.push(dims)?,
                    None => csr.push(&[])?,
                }
            }
        } else {
            for (name, dims) in &hints.named {
                keys.push(pin_cstring(name)?);
                csr.push(dims)?;
            }
        }
        let key_ptrs = cstring_ptrs(&keys);
        let num_args = checked_uint(csr.rows(), "shape hints")?;

        let infer = if partial {
            api.mx_symbol_infer_shape_partial
        } else {
            api.mx_symbol_infer_shape
        };

        let mut arg_size: mx_uint = 0;
        let mut arg_ndim: *const mx_uint = ptr::null();
        let mut arg_data: *const *const mx_uint = ptr::null();
        let mut out_size: mx_uint = 0;
        let mut out_ndim: *const mx_uint = ptr::null();
        let mut out_data: *const *const mx_uint = ptr::null();
        let mut aux_size: mx_uint = 0;
        let mut aux_ndim: *const mx_uint = ptr::null();
        let mut aux_data: *const *const mx_uint = ptr::null();
        let mut complete: c_int = 0;

        // SAFETY: the CSR buffers and key array are backed by locals for
        // the duration of the call; the out pointers are only read when
        // the complete flag is set.
        unsafe {
            check(
                api,
                infer(
                    self.handle,
                    num_args,
                    if keys.is_empty() {
                        ptr::null()
                    } else {
                        key_ptrs.as_ptr()
                    },
                    csr.indptr_ptr(),
                    csr.data_ptr(),
                    &mut arg_size,
                    &mut arg_ndim,
                    &mut arg_data,
                    &mut out_size,
                    &mut out_ndim,
                    &mut out_data,
                    &mut aux_size,
                    &mut aux_ndim,
                    &mut aux_data,
                    &mut complete,
                ),
            )?;
            if complete == 0 {
                return Ok(None);
            }
            Ok(Some(InferredShapes {
                args: crate::marshal::shape_rows_to_vec(arg_size, arg_ndim, arg_data),
                outputs: crate::marshal::shape_rows_to_vec(out_size, out_ndim, out_data),
                aux: crate::marshal::shape_rows_to_vec(aux_size, aux_ndim, aux_data),
            }))
        }
    }

    /// Deduces argument, output and auxiliary element types from the known
    /// types in `hints`. Returns `None` when the graph is underdetermined.
    pub fn infer_type(&self, hints: &TypeHints) -> Result<Option<InferredTypes>> {
        if !hints.positional.is_empty() && !hints.named.is_empty() {
            return Err(Error::InvalidArgument(
                "Can only specify known argument shapes either by positional or kwargs way."
                    .into(),
            ));
        }

        let api = crate::api::table()?;
        let mut keys = Vec::new();
        let mut type_ids: Vec<c_int> = Vec::new();
        if hints.named.is_empty() {
            // -1 marks an unknown entry in the positional form.
            for dtype in &hints.positional {
                type_ids.push(dtype.map_or(-1, |d| d.id()));
            }
        } else {
            for (name, dtype) in &hints.named {
                keys.push(pin_cstring(name)?);
                type_ids.push(dtype.id());
            }
        }
        let key_ptrs = cstring_ptrs(&keys);
        let num_args = checked_uint(type_ids.len(), "type hints")?;

        let mut arg_size: mx_uint = 0;
        let mut arg_data: *const c_int = ptr::null();
        let mut out_size: mx_uint = 0;
        let mut out_data: *const c_int = ptr::null();
        let mut aux_size: mx_uint = 0;
        let mut aux_data: *const c_int = ptr::null();
        let mut complete: c_int = 0;

        // SAFETY: keys and type_ids live across the call; the out arrays
        // are only read when the complete flag is set.
        unsafe {
            check(
                api,
                (api.mx_symbol_infer_type)(
                    self.handle,
                    num_args,
                    if keys.is_empty() {
                        ptr::null()
                    } else {
                        key_ptrs.as_ptr()
                    },
                    type_ids.as_ptr(),
                    &mut arg_size,
                    &mut arg_data,
                    &mut out_size,
                    &mut out_data,
                    &mut aux_size,
                    &mut aux_data,
                    &mut complete,
                ),
            )?;
            if complete == 0 {
                return Ok(None);
            }
            Ok(Some(InferredTypes {
                args: dtype_ids_to_vec(arg_size, arg_data)?,
                outputs: dtype_ids_to_vec(out_size, out_data)?,
                aux: dtype_ids_to_vec(aux_size, aux_data)?,
            }))
        }
    }

    // ==================================================================
    // Binding
    // ==================================================================

    /// Binds the graph on `ctx` over concrete argument arrays, producing
    /// an executor that retains everything it was bound over.
    pub fn bind(&self, ctx: Context, args: NdInputs, opts: BindOpts<'_>) -> Result<Executor> {
        let api = crate::api::table()?;

        let arg_names = self.list_arguments()?;
        let (arg_handles, arg_arrays) = collect_required("args", args, &arg_names)?;

        let (grad_handles, grad_arrays) = match opts.args_grad {
            Some(grads) => collect_optional("args_grad", grads, &arg_names)?,
            None => (
                vec![ptr::null_mut(); arg_names.len()],
                (0..arg_names.len()).map(|_| None).collect(),
            ),
        };

        let reqs: Vec<mx_uint> = match &opts.grad_req {
            GradReqSpec::Uniform(req) => vec![req.code(); arg_names.len()],
            GradReqSpec::Ordered(reqs) => {
                if reqs.len() != arg_names.len() {
                    return Err(Error::ArgumentMismatch(
                        "Length of grad_req does not match the number of arguments".into(),
                    ));
                }
                reqs.iter().map(|req| req.code()).collect()
            }
            GradReqSpec::Named(named) => arg_names
                .iter()
                .map(|name| {
                    named
                        .iter()
                        .find(|(key, _)| key == name)
                        .map_or(0, |(_, req)| req.code())
                })
                .collect(),
        };

        let aux_names = self.list_auxiliary_states()?;
        let (aux_handles, aux_arrays) = match opts.aux_states {
            Some(aux) => collect_required("aux_states", aux, &aux_names)?,
            None => (Vec::new(), Vec::new()),
        };

        let mut map_keys = Vec::with_capacity(opts.group2ctx.len());
        let mut map_dev_types: Vec<c_int> = Vec::with_capacity(opts.group2ctx.len());
        let mut map_dev_ids: Vec<c_int> = Vec::with_capacity(opts.group2ctx.len());
        for (group, group_ctx) in &opts.group2ctx {
            map_keys.push(pin_cstring(group)?);
            map_dev_types.push(group_ctx.device_type.id());
            map_dev_ids.push(group_ctx.device_id);
        }
        let map_key_ptrs = cstring_ptrs(&map_keys);

        let num_maps = checked_uint(opts.group2ctx.len(), "group2ctx entries")?;
        let num_args = checked_uint(arg_handles.len(), "bound arguments")?;
        let num_aux = checked_uint(aux_handles.len(), "auxiliary states")?;
        let shared = opts
            .shared_exec
            .map_or(ptr::null_mut(), |exec| exec.handle());

        let mut handle: ExecutorHandle = ptr::null_mut();
        // SAFETY: every pointer argument is backed by a live local vector
        // for the duration of the call.
        unsafe {
            check(
                api,
                (api.mx_executor_bind_ex)(
                    self.handle,
                    ctx.device_type.id(),
                    ctx.device_id,
                    num_maps,
                    if map_keys.is_empty() {
                        ptr::null()
                    } else {
                        map_key_ptrs.as_ptr()
                    },
                    map_dev_types.as_ptr(),
                    map_dev_ids.as_ptr(),
                    num_args,
                    arg_handles.as_ptr(),
                    grad_handles.as_ptr(),
                    reqs.as_ptr(),
                    num_aux,
                    aux_handles.as_ptr(),
                    shared,
                    &mut handle,
                ),
            )?;
        }

        let mut arg_slots = HashMap::with_capacity(arg_names.len());
        for (i, name) in arg_names.iter().enumerate() {
            arg_slots.insert(name.clone(), i);
        }

        Ok(Executor::from_bind(
            handle,
            self.dup()?,
            ctx,
            arg_slots,
            arg_arrays,
            grad_arrays,
            aux_arrays,
        ))
    }
}

impl Drop for Symbol {
    fn drop(&mut self) {
        if let Ok(api) = crate::api::table() {
            // SAFETY: the wrapper owns its handle and frees it exactly
            // once. A failed free has nowhere to report to.
            unsafe {
                (api.mx_symbol_free)(self.handle);
            }
        }
    }
}

/// Reads `count` native dtype ids into the typed form.
///
/// # Safety
///
/// `ids` must hold `count` entries when `count` is nonzero.
unsafe fn dtype_ids_to_vec(count: mx_uint, ids: *const c_int) -> Result<Vec<DType>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    std::slice::from_raw_parts(ids, count as usize)
        .iter()
        .map(|&id| DType::from_id(id))
        .collect()
}

// ======================================================================
// Hints and binding inputs
// ======================================================================

/// Known shapes fed to shape inference, either positionally (aligned with
/// `list_arguments`, `None` marking unknown entries) or by argument name.
/// Supplying both forms at once is rejected.
#[derive(Debug, Clone, Default)]
pub struct ShapeHints {
    positional: Vec<Option<Vec<usize>>>,
    named: Vec<(String, Vec<usize>)>,
}

impl ShapeHints {
    pub fn positional(shapes: Vec<Option<Vec<usize>>>) -> Self {
        ShapeHints {
            positional: shapes,
            named: Vec::new(),
        }
    }

    pub fn named(pairs: Vec<(&str, Vec<usize>)>) -> Self {
        ShapeHints {
            positional: Vec::new(),
            named: pairs
                .into_iter()
                .map(|(name, dims)| (name.to_owned(), dims))
                .collect(),
        }
    }
}

/// Known element types fed to type inference, in the same two forms as
/// [`ShapeHints`].
#[derive(Debug, Clone, Default)]
pub struct TypeHints {
    positional: Vec<Option<DType>>,
    named: Vec<(String, DType)>,
}

impl TypeHints {
    pub fn positional(dtypes: Vec<Option<DType>>) -> Self {
        TypeHints {
            positional: dtypes,
            named: Vec::new(),
        }
    }

    pub fn named(pairs: Vec<(&str, DType)>) -> Self {
        TypeHints {
            positional: Vec::new(),
            named: pairs
                .into_iter()
                .map(|(name, dtype)| (name.to_owned(), dtype))
                .collect(),
        }
    }
}

/// Shapes deduced for a graph's arguments, outputs and auxiliary states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredShapes {
    pub args: Vec<Vec<usize>>,
    pub outputs: Vec<Vec<usize>>,
    pub aux: Vec<Vec<usize>>,
}

/// Element types deduced for a graph's arguments, outputs and auxiliary
/// states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredTypes {
    pub args: Vec<DType>,
    pub outputs: Vec<DType>,
    pub aux: Vec<DType>,
}

/// Input symbols for operator application, positional or keyed by the
/// operator's argument names. Mixing the two forms is rejected.
#[derive(Debug, Default)]
pub struct SymbolInputs<'a> {
    positional: Vec<&'a Symbol>,
    named: Vec<(String, &'a Symbol)>,
}

impl<'a> SymbolInputs<'a> {
    /// No inputs, for nullary operators and variable-only graphs.
    pub fn none() -> Self {
        SymbolInputs::default()
    }

    pub fn positional(inputs: &[&'a Symbol]) -> Self {
        SymbolInputs {
            positional: inputs.to_vec(),
            named: Vec::new(),
        }
    }

    pub fn named(inputs: &[(&str, &'a Symbol)]) -> Self {
        SymbolInputs {
            positional: Vec::new(),
            named: inputs
                .iter()
                .map(|&(name, sym)| (name.to_owned(), sym))
                .collect(),
        }
    }
}

/// Arrays handed to [`Symbol::bind`], positionally in name-list order or
/// keyed by argument name. The executor takes ownership either way.
#[derive(Debug)]
pub enum NdInputs {
    Positional(Vec<NDArray>),
    Named(Vec<(String, NDArray)>),
}

impl From<Vec<NDArray>> for NdInputs {
    fn from(arrays: Vec<NDArray>) -> Self {
        NdInputs::Positional(arrays)
    }
}

impl From<Vec<(String, NDArray)>> for NdInputs {
    fn from(entries: Vec<(String, NDArray)>) -> Self {
        NdInputs::Named(entries)
    }
}

/// Gradient accumulation request for one bound argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradReq {
    Null,
    Write,
    Add,
}

impl GradReq {
    pub(crate) fn code(self) -> mx_uint {
        match self {
            GradReq::Null => 0,
            GradReq::Write => 1,
            GradReq::Add => 3,
        }
    }
}

/// How gradients are requested across the bound arguments.
#[derive(Debug, Clone)]
pub enum GradReqSpec {
    /// One request applied to every argument.
    Uniform(GradReq),
    /// Per-argument requests in `list_arguments` order; the length must
    /// match the argument count.
    Ordered(Vec<GradReq>),
    /// Requests keyed by argument name; absent names get [`GradReq::Null`].
    Named(Vec<(String, GradReq)>),
}

impl Default for GradReqSpec {
    fn default() -> Self {
        GradReqSpec::Uniform(GradReq::Write)
    }
}

/// Optional pieces of [`Symbol::bind`].
#[derive(Debug, Default)]
pub struct BindOpts<'a> {
    /// Arrays gradients are written into, aligned with the arguments.
    /// Absent entries (and an absent map) leave the slot gradient-free.
    pub args_grad: Option<NdInputs>,
    pub grad_req: GradReqSpec,
    /// Arrays backing the graph's auxiliary states.
    pub aux_states: Option<NdInputs>,
    /// Device placement overrides per group name.
    pub group2ctx: Vec<(String, Context)>,
    /// A previously bound executor to share storage with.
    pub shared_exec: Option<&'a Executor>,
}

fn length_mismatch(kind: &str) -> Error {
    Error::ArgumentMismatch(format!(
        "Length of {kind} does not match the number of arguments"
    ))
}

fn collect_required(
    kind: &'static str,
    inputs: NdInputs,
    names: &[String],
) -> Result<(Vec<NDArrayHandle>, Vec<NDArray>)> {
    match inputs {
        NdInputs::Positional(arrays) => {
            if arrays.len() != names.len() {
                return Err(length_mismatch(kind));
            }
            let handles = arrays.iter().map(|array| array.handle()).collect();
            Ok((handles, arrays))
        }
        NdInputs::Named(entries) => {
            let mut by_name: HashMap<String, NDArray> = entries.into_iter().collect();
            let mut handles = Vec::with_capacity(names.len());
            let mut arrays = Vec::with_capacity(names.len());
            for name in names {
                match by_name.remove(name) {
                    Some(array) => {
                        handles.push(array.handle());
                        arrays.push(array);
                    }
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "key `{name}` is missing in `{kind}`"
                        )));
                    }
                }
            }
            Ok((handles, arrays))
        }
    }
}

fn collect_optional(
    kind: &'static str,
    inputs: NdInputs,
    names: &[String],
) -> Result<(Vec<NDArrayHandle>, Vec<Option<NDArray>>)> {
    match inputs {
        NdInputs::Positional(arrays) => {
            if arrays.len() != names.len() {
                return Err(length_mismatch(kind));
            }
            let handles = arrays.iter().map(|array| array.handle()).collect();
            Ok((handles, arrays.into_iter().map(Some).collect()))
        }
        NdInputs::Named(entries) => {
            let mut by_name: HashMap<String, NDArray> = entries.into_iter().collect();
            let mut handles = Vec::with_capacity(names.len());
            let mut arrays = Vec::with_capacity(names.len());
            for name in names {
                match by_name.remove(name) {
                    Some(array) => {
                        handles.push(array.handle());
                        arrays.push(Some(array));
                    }
                    None => {
                        handles.push(ptr::null_mut());
                        arrays.push(None);
                    }
                }
            }
            Ok((handles, arrays))
        }
    }
}
