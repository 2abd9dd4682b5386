//! Raw C-ABI surface of libmxnet.
//!
//! The binding never links against libmxnet at build time. Every entry
//! point is reached through a function pointer resolved by name from the
//! dynamically loaded library, so this module defines only the pointer
//! types and the [`MxApi`] table that holds one resolved pointer per
//! required symbol. Handles are opaque; equality is pointer identity and
//! the native library is the sole interpreter of what they reference.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_void};

/// `mx_uint` in the native headers.
pub type mx_uint = libc::c_uint;
/// `mx_float` in the native headers.
pub type mx_float = libc::c_float;

pub type NDArrayHandle = *mut c_void;
pub type SymbolHandle = *mut c_void;
pub type ExecutorHandle = *mut c_void;
pub type CachedOpHandle = *mut c_void;
pub type KVStoreHandle = *mut c_void;
pub type DataIterHandle = *mut c_void;
pub type DataIterCreator = *mut c_void;
pub type OpHandle = *mut c_void;

/// Integer-keyed updater invoked by the native store during push.
pub type MXKVStoreUpdater =
    unsafe extern "C" fn(key: c_int, recv: NDArrayHandle, local: NDArrayHandle, ctx: *mut c_void);

/// String-keyed updater invoked by the native store during push.
pub type MXKVStoreStrUpdater = unsafe extern "C" fn(
    key: *const c_char,
    recv: NDArrayHandle,
    local: NDArrayHandle,
    ctx: *mut c_void,
);

/// Resolved function-pointer table for every native entry point the
/// binding uses.
///
/// Populated exactly once per process, either by resolving each symbol
/// from the loaded shared library or by [`crate::api::install`] with a
/// caller-built table. Read-only afterwards; function pointers are `Copy`
/// and safe to share across threads without locking.
#[derive(Clone, Copy)]
pub struct MxApi {
    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------
    pub mx_get_last_error: unsafe extern "C" fn() -> *const c_char,

    // ------------------------------------------------------------------
    // NDArray
    // ------------------------------------------------------------------
    pub mx_nd_array_create_ex: unsafe extern "C" fn(
        shape: *const mx_uint,
        ndim: mx_uint,
        dev_type: c_int,
        dev_id: c_int,
        delay_alloc: c_int,
        dtype: c_int,
        out: *mut NDArrayHandle,
    ) -> c_int,
    pub mx_nd_array_free: unsafe extern "C" fn(handle: NDArrayHandle) -> c_int,
    pub mx_nd_array_get_shape: unsafe extern "C" fn(
        handle: NDArrayHandle,
        out_dim: *mut mx_uint,
        out_pdata: *mut *const mx_uint,
    ) -> c_int,
    pub mx_nd_array_get_dtype:
        unsafe extern "C" fn(handle: NDArrayHandle, out_dtype: *mut c_int) -> c_int,
    pub mx_nd_array_get_context: unsafe extern "C" fn(
        handle: NDArrayHandle,
        out_dev_type: *mut c_int,
        out_dev_id: *mut c_int,
    ) -> c_int,
    pub mx_nd_array_at: unsafe extern "C" fn(
        handle: NDArrayHandle,
        idx: mx_uint,
        out: *mut NDArrayHandle,
    ) -> c_int,
    pub mx_nd_array_slice: unsafe extern "C" fn(
        handle: NDArrayHandle,
        slice_begin: mx_uint,
        slice_end: mx_uint,
        out: *mut NDArrayHandle,
    ) -> c_int,
    pub mx_nd_array_reshape: unsafe extern "C" fn(
        handle: NDArrayHandle,
        ndim: c_int,
        dims: *const c_int,
        out: *mut NDArrayHandle,
    ) -> c_int,
    pub mx_nd_array_wait_to_read: unsafe extern "C" fn(handle: NDArrayHandle) -> c_int,
    pub mx_nd_array_wait_all: unsafe extern "C" fn() -> c_int,
    pub mx_nd_array_sync_copy_from_cpu: unsafe extern "C" fn(
        handle: NDArrayHandle,
        data: *const c_void,
        size: libc::size_t,
    ) -> c_int,
    pub mx_nd_array_sync_copy_to_cpu: unsafe extern "C" fn(
        handle: NDArrayHandle,
        data: *mut c_void,
        size: libc::size_t,
    ) -> c_int,
    pub mx_nd_array_get_grad:
        unsafe extern "C" fn(handle: NDArrayHandle, out: *mut NDArrayHandle) -> c_int,
    pub mx_nd_array_save: unsafe extern "C" fn(
        fname: *const c_char,
        num_args: mx_uint,
        args: *const NDArrayHandle,
        keys: *const *const c_char,
    ) -> c_int,
    pub mx_nd_array_load: unsafe extern "C" fn(
        fname: *const c_char,
        out_size: *mut mx_uint,
        out_arr: *mut *mut NDArrayHandle,
        out_name_size: *mut mx_uint,
        out_names: *mut *mut *const c_char,
    ) -> c_int,

    // ------------------------------------------------------------------
    // Symbol
    // ------------------------------------------------------------------
    pub mx_symbol_create_from_file:
        unsafe extern "C" fn(fname: *const c_char, out: *mut SymbolHandle) -> c_int,
    pub mx_symbol_create_from_json:
        unsafe extern "C" fn(json: *const c_char, out: *mut SymbolHandle) -> c_int,
    pub mx_symbol_create_variable:
        unsafe extern "C" fn(name: *const c_char, out: *mut SymbolHandle) -> c_int,
    pub mx_symbol_create_atomic_symbol: unsafe extern "C" fn(
        creator: OpHandle,
        num_param: mx_uint,
        keys: *const *const c_char,
        vals: *const *const c_char,
        out: *mut SymbolHandle,
    ) -> c_int,
    pub mx_symbol_compose: unsafe extern "C" fn(
        sym: SymbolHandle,
        name: *const c_char,
        num_args: mx_uint,
        keys: *const *const c_char,
        args: *const SymbolHandle,
    ) -> c_int,
    pub mx_symbol_copy:
        unsafe extern "C" fn(handle: SymbolHandle, out: *mut SymbolHandle) -> c_int,
    pub mx_symbol_free: unsafe extern "C" fn(handle: SymbolHandle) -> c_int,
    pub mx_symbol_get_name: unsafe extern "C" fn(
        handle: SymbolHandle,
        out: *mut *const c_char,
        success: *mut c_int,
    ) -> c_int,
    pub mx_symbol_set_attr: unsafe extern "C" fn(
        handle: SymbolHandle,
        key: *const c_char,
        value: *const c_char,
    ) -> c_int,
    pub mx_symbol_save_to_file:
        unsafe extern "C" fn(handle: SymbolHandle, fname: *const c_char) -> c_int,
    pub mx_symbol_save_to_json:
        unsafe extern "C" fn(handle: SymbolHandle, out_json: *mut *const c_char) -> c_int,
    pub mx_symbol_list_arguments: unsafe extern "C" fn(
        handle: SymbolHandle,
        out_size: *mut mx_uint,
        out_array: *mut *mut *const c_char,
    ) -> c_int,
    pub mx_symbol_list_outputs: unsafe extern "C" fn(
        handle: SymbolHandle,
        out_size: *mut mx_uint,
        out_array: *mut *mut *const c_char,
    ) -> c_int,
    pub mx_symbol_list_auxiliary_states: unsafe extern "C" fn(
        handle: SymbolHandle,
        out_size: *mut mx_uint,
        out_array: *mut *mut *const c_char,
    ) -> c_int,
    pub mx_symbol_infer_shape: unsafe extern "C" fn(
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
    ) -> c_int,
    pub mx_symbol_infer_shape_partial: unsafe extern "C" fn(
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
    ) -> c_int,
    pub mx_symbol_infer_type: unsafe extern "C" fn(
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
    ) -> c_int,

    // ------------------------------------------------------------------
    // Executor
    // ------------------------------------------------------------------
    pub mx_executor_bind_ex: unsafe extern "C" fn(
        symbol_handle: SymbolHandle,
        dev_type: c_int,
        dev_id: c_int,
        num_map_keys: mx_uint,
        map_keys: *const *const c_char,
        map_dev_types: *const c_int,
        map_dev_ids: *const c_int,
        len: mx_uint,
        in_args: *const NDArrayHandle,
        arg_grad_store: *const NDArrayHandle,
        grad_req_type: *const mx_uint,
        aux_states_len: mx_uint,
        aux_states: *const NDArrayHandle,
        shared_exec: ExecutorHandle,
        out: *mut ExecutorHandle,
    ) -> c_int,
    pub mx_executor_forward:
        unsafe extern "C" fn(handle: ExecutorHandle, is_train: c_int) -> c_int,
    pub mx_executor_backward_ex: unsafe extern "C" fn(
        handle: ExecutorHandle,
        len: mx_uint,
        head_grads: *const NDArrayHandle,
        is_train: c_int,
    ) -> c_int,
    pub mx_executor_outputs: unsafe extern "C" fn(
        handle: ExecutorHandle,
        out_size: *mut mx_uint,
        out: *mut *mut NDArrayHandle,
    ) -> c_int,
    pub mx_executor_free: unsafe extern "C" fn(handle: ExecutorHandle) -> c_int,

    // ------------------------------------------------------------------
    // CachedOp
    // ------------------------------------------------------------------
    pub mx_create_cached_op_ex: unsafe extern "C" fn(
        handle: SymbolHandle,
        num_flags: c_int,
        keys: *const *const c_char,
        vals: *const *const c_char,
        out: *mut CachedOpHandle,
    ) -> c_int,
    pub mx_invoke_cached_op_ex: unsafe extern "C" fn(
        handle: CachedOpHandle,
        num_inputs: c_int,
        inputs: *const NDArrayHandle,
        num_outputs: *mut c_int,
        outputs: *mut *mut NDArrayHandle,
        out_stypes: *mut *const c_int,
    ) -> c_int,
    pub mx_free_cached_op: unsafe extern "C" fn(handle: CachedOpHandle) -> c_int,

    // ------------------------------------------------------------------
    // KVStore
    // ------------------------------------------------------------------
    pub mx_kv_store_create:
        unsafe extern "C" fn(kind: *const c_char, out: *mut KVStoreHandle) -> c_int,
    pub mx_kv_store_free: unsafe extern "C" fn(handle: KVStoreHandle) -> c_int,
    pub mx_kv_store_get_type:
        unsafe extern "C" fn(handle: KVStoreHandle, kind: *mut *const c_char) -> c_int,
    pub mx_kv_store_init: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num: mx_uint,
        keys: *const c_int,
        vals: *const NDArrayHandle,
    ) -> c_int,
    pub mx_kv_store_init_ex: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num: mx_uint,
        keys: *const *const c_char,
        vals: *const NDArrayHandle,
    ) -> c_int,
    pub mx_kv_store_push: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num: mx_uint,
        keys: *const c_int,
        vals: *const NDArrayHandle,
        priority: c_int,
    ) -> c_int,
    pub mx_kv_store_push_ex: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num: mx_uint,
        keys: *const *const c_char,
        vals: *const NDArrayHandle,
        priority: c_int,
    ) -> c_int,
    pub mx_kv_store_pull: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num: mx_uint,
        keys: *const c_int,
        vals: *const NDArrayHandle,
        priority: c_int,
    ) -> c_int,
    pub mx_kv_store_pull_ex: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num: mx_uint,
        keys: *const *const c_char,
        vals: *const NDArrayHandle,
        priority: c_int,
    ) -> c_int,
    pub mx_kv_store_set_updater_ex: unsafe extern "C" fn(
        handle: KVStoreHandle,
        updater: MXKVStoreUpdater,
        str_updater: MXKVStoreStrUpdater,
        ctx: *mut c_void,
    ) -> c_int,
    pub mx_kv_store_set_gradient_compression: unsafe extern "C" fn(
        handle: KVStoreHandle,
        num_params: mx_uint,
        keys: *const *const c_char,
        vals: *const *const c_char,
    ) -> c_int,

    // ------------------------------------------------------------------
    // DataIter
    // ------------------------------------------------------------------
    pub mx_list_data_iters: unsafe extern "C" fn(
        out_size: *mut mx_uint,
        out_array: *mut *mut DataIterCreator,
    ) -> c_int,
    pub mx_data_iter_get_iter_info: unsafe extern "C" fn(
        creator: DataIterCreator,
        name: *mut *const c_char,
        description: *mut *const c_char,
        num_args: *mut mx_uint,
        arg_names: *mut *mut *const c_char,
        arg_type_infos: *mut *mut *const c_char,
        arg_descriptions: *mut *mut *const c_char,
    ) -> c_int,
    pub mx_data_iter_create_iter: unsafe extern "C" fn(
        creator: DataIterCreator,
        num_param: mx_uint,
        keys: *const *const c_char,
        vals: *const *const c_char,
        out: *mut DataIterHandle,
    ) -> c_int,
    pub mx_data_iter_free: unsafe extern "C" fn(handle: DataIterHandle) -> c_int,
    pub mx_data_iter_next:
        unsafe extern "C" fn(handle: DataIterHandle, out: *mut c_int) -> c_int,
    pub mx_data_iter_before_first: unsafe extern "C" fn(handle: DataIterHandle) -> c_int,
    pub mx_data_iter_get_data:
        unsafe extern "C" fn(handle: DataIterHandle, out: *mut NDArrayHandle) -> c_int,
    pub mx_data_iter_get_label:
        unsafe extern "C" fn(handle: DataIterHandle, out: *mut NDArrayHandle) -> c_int,
    pub mx_data_iter_get_pad_num:
        unsafe extern "C" fn(handle: DataIterHandle, pad: *mut c_int) -> c_int,
    pub mx_data_iter_get_index: unsafe extern "C" fn(
        handle: DataIterHandle,
        out_index: *mut *mut u64,
        out_size: *mut u64,
    ) -> c_int,

    // ------------------------------------------------------------------
    // Autograd
    // ------------------------------------------------------------------
    pub mx_autograd_set_is_recording:
        unsafe extern "C" fn(is_recording: c_int, prev: *mut c_int) -> c_int,
    pub mx_autograd_set_is_training:
        unsafe extern "C" fn(is_training: c_int, prev: *mut c_int) -> c_int,
    pub mx_autograd_is_recording: unsafe extern "C" fn(curr: *mut u8) -> c_int,
    pub mx_autograd_is_training: unsafe extern "C" fn(curr: *mut u8) -> c_int,
    pub mx_autograd_mark_variables: unsafe extern "C" fn(
        num_var: mx_uint,
        var_handles: *const NDArrayHandle,
        reqs_array: *const mx_uint,
        grad_handles: *const NDArrayHandle,
    ) -> c_int,
    pub mx_autograd_backward_ex: unsafe extern "C" fn(
        num_output: mx_uint,
        output_handles: *const NDArrayHandle,
        ograd_handles: *const NDArrayHandle,
        num_variables: mx_uint,
        var_handles: *const NDArrayHandle,
        retain_graph: c_int,
        create_graph: c_int,
        is_train: c_int,
        grad_handles: *mut *mut NDArrayHandle,
        grad_stypes: *mut *const c_int,
    ) -> c_int,

    // ------------------------------------------------------------------
    // Random
    // ------------------------------------------------------------------
    pub mx_random_seed: unsafe extern "C" fn(seed: c_int) -> c_int,

    // ------------------------------------------------------------------
    // Operator introspection and imperative invocation
    // ------------------------------------------------------------------
    pub mx_list_all_op_names: unsafe extern "C" fn(
        out_size: *mut mx_uint,
        out_array: *mut *mut *const c_char,
    ) -> c_int,
    pub nn_get_op_handle:
        unsafe extern "C" fn(name: *const c_char, out: *mut OpHandle) -> c_int,
    pub mx_symbol_get_atomic_symbol_info: unsafe extern "C" fn(
        creator: OpHandle,
        name: *mut *const c_char,
        description: *mut *const c_char,
        num_args: *mut mx_uint,
        arg_names: *mut *mut *const c_char,
        arg_type_infos: *mut *mut *const c_char,
        arg_descriptions: *mut *mut *const c_char,
        key_var_num_args: *mut *const c_char,
        return_type: *mut *const c_char,
    ) -> c_int,
    pub mx_imperative_invoke: unsafe extern "C" fn(
        creator: OpHandle,
        num_inputs: c_int,
        inputs: *const NDArrayHandle,
        num_outputs: *mut c_int,
        outputs: *mut *mut NDArrayHandle,
        num_params: c_int,
        param_keys: *const *const c_char,
        param_vals: *const *const c_char,
    ) -> c_int,
}
