//! Native API table and one-time initialization.
//!
//! # Architecture
//!
//! ```text
//! mxnet.toml / LIBMXNET env / search paths
//!       │
//!       ▼
//! loader (libloading)
//!       │  one typed resolve per required symbol
//!       ▼
//! MxApi function-pointer table  ──  OnceCell, read-only after init
//!       │
//!       ▼
//! every native call in the crate
//! ```
//!
//! The table is populated exactly once per process, before any other
//! component touches native code, and no component binds a symbol any other
//! way. A required symbol that cannot be resolved fails initialization with
//! [`Error::MissingSymbol`]; a partially-capable binding is never
//! constructed. After initialization the table is immutable, so concurrent
//! readers need no locking.
//!
//! Embedders that already hold resolved function pointers (and test
//! harnesses standing in for the native library) can supply a
//! caller-built table through [`install`] instead of loading a shared
//! library.

mod loader;
pub mod sys;


use std::path::{Path, PathBuf};

use libloading::Library;
use once_cell::sync::OnceCell;

use crate::config::Config;
use crate::error::{Error, Result};

pub use sys::MxApi;

struct Api {
    table: MxApi,
    path: Option<PathBuf>,
    /// Keeps the resolved pointers valid for the process lifetime.
    _library: Option<Library>,
}

static API: OnceCell<Api> = OnceCell::new();

/// Loads the native library with the discovered configuration and resolves
/// the full API table.
pub fn init() -> Result<()> {
    init_with(&Config::load_from_cwd()?)
}

/// Loads the native library described by `config` and resolves the full
/// API table. Fails with [`Error::AlreadyInitialized`] if a table is
/// already installed.
pub fn init_with(config: &Config) -> Result<()> {
    let api = load_api(config)?;
    API.set(api).map_err(|_| Error::AlreadyInitialized)
}

/// Installs a pre-resolved table.
pub fn install(table: MxApi) -> Result<()> {
    API.set(Api {
        table,
        path: None,
        _library: None,
    })
    .map_err(|_| Error::AlreadyInitialized)
}

/// Whether the process-wide table has been populated.
pub fn is_initialized() -> bool {
    API.get().is_some()
}

/// Path of the loaded shared library, when the table came from one.
pub fn library_path() -> Option<&'static Path> {
    API.get().and_then(|api| api.path.as_deref())
}

/// The process-wide table, initializing with the default configuration on
/// first use.
pub(crate) fn table() -> Result<&'static MxApi> {
    let api = API.get_or_try_init(|| load_api(&Config::load_from_cwd()?))?;
    Ok(&api.table)
}

fn load_api(config: &Config) -> Result<Api> {
    let loaded = loader::load(config)?;
    let table = resolve_table(&loaded.library)?;
    Ok(Api {
        table,
        path: Some(loaded.path),
        _library: Some(loaded.library),
    })
}

/// Resolves one typed function pointer, failing with the symbol's name.
fn resolve<T: Copy>(lib: &Library, name: &'static str) -> Result<T> {
    // Safety: the caller-side type T is the signature sys.rs declares for
    // this symbol; the targeted libmxnet version fixes the real one. A
    // mismatch here is a binding bug, not a runtime condition.
    unsafe {
        match lib.get::<T>(name.as_bytes()) {
            Ok(sym) => Ok(*sym),
            Err(_) => Err(Error::MissingSymbol(name)),
        }
    }
}

fn resolve_table(lib: &Library) -> Result<MxApi> {
    Ok(MxApi {
        mx_get_last_error: resolve(lib, "MXGetLastError")?,

        mx_nd_array_create_ex: resolve(lib, "MXNDArrayCreateEx")?,
        mx_nd_array_free: resolve(lib, "MXNDArrayFree")?,
        mx_nd_array_get_shape: resolve(lib, "MXNDArrayGetShape")?,
        mx_nd_array_get_dtype: resolve(lib, "MXNDArrayGetDType")?,
        mx_nd_array_get_context: resolve(lib, "MXNDArrayGetContext")?,
        mx_nd_array_at: resolve(lib, "MXNDArrayAt")?,
        mx_nd_array_slice: resolve(lib, "MXNDArraySlice")?,
        mx_nd_array_reshape: resolve(lib, "MXNDArrayReshape")?,
        mx_nd_array_wait_to_read: resolve(lib, "MXNDArrayWaitToRead")?,
        mx_nd_array_wait_all: resolve(lib, "MXNDArrayWaitAll")?,
        mx_nd_array_sync_copy_from_cpu: resolve(lib, "MXNDArraySyncCopyFromCPU")?,
        mx_nd_array_sync_copy_to_cpu: resolve(lib, "MXNDArraySyncCopyToCPU")?,
        mx_nd_array_get_grad: resolve(lib, "MXNDArrayGetGrad")?,
        mx_nd_array_save: resolve(lib, "MXNDArraySave")?,
        mx_nd_array_load: resolve(lib, "MXNDArrayLoad")?,

        mx_symbol_create_from_file: resolve(lib, "MXSymbolCreateFromFile")?,
        mx_symbol_create_from_json: resolve(lib, "MXSymbolCreateFromJSON")?,
        mx_symbol_create_variable: resolve(lib, "MXSymbolCreateVariable")?,
        mx_symbol_create_atomic_symbol: resolve(lib, "MXSymbolCreateAtomicSymbol")?,
        mx_symbol_compose: resolve(lib, "MXSymbolCompose")?,
        mx_symbol_copy: resolve(lib, "MXSymbolCopy")?,
        mx_symbol_free: resolve(lib, "MXSymbolFree")?,
        mx_symbol_get_name: resolve(lib, "MXSymbolGetName")?,
        mx_symbol_set_attr: resolve(lib, "MXSymbolSetAttr")?,
        mx_symbol_save_to_file: resolve(lib, "MXSymbolSaveToFile")?,
        mx_symbol_save_to_json: resolve(lib, "MXSymbolSaveToJSON")?,
        mx_symbol_list_arguments: resolve(lib, "MXSymbolListArguments")?,
        mx_symbol_list_outputs: resolve(lib, "MXSymbolListOutputs")?,
        mx_symbol_list_auxiliary_states: resolve(lib, "MXSymbolListAuxiliaryStates")?,
        mx_symbol_infer_shape: resolve(lib, "MXSymbolInferShape")?,
        mx_symbol_infer_shape_partial: resolve(lib, "MXSymbolInferShapePartial")?,
        mx_symbol_infer_type: resolve(lib, "MXSymbolInferType")?,

        mx_executor_bind_ex: resolve(lib, "MXExecutorBindEX")?,
        mx_executor_forward: resolve(lib, "MXExecutorForward")?,
        mx_executor_backward_ex: resolve(lib, "MXExecutorBackwardEx")?,
        mx_executor_outputs: resolve(lib, "MXExecutorOutputs")?,
        mx_executor_free: resolve(lib, "MXExecutorFree")?,

        mx_create_cached_op_ex: resolve(lib, "MXCreateCachedOpEx")?,
        mx_invoke_cached_op_ex: resolve(lib, "MXInvokeCachedOpEx")?,
        mx_free_cached_op: resolve(lib, "MXFreeCachedOp")?,

        mx_kv_store_create: resolve(lib, "MXKVStoreCreate")?,
        mx_kv_store_free: resolve(lib, "MXKVStoreFree")?,
        mx_kv_store_get_type: resolve(lib, "MXKVStoreGetType")?,
        mx_kv_store_init: resolve(lib, "MXKVStoreInit")?,
        mx_kv_store_init_ex: resolve(lib, "MXKVStoreInitEx")?,
        mx_kv_store_push: resolve(lib, "MXKVStorePush")?,
        mx_kv_store_push_ex: resolve(lib, "MXKVStorePushEx")?,
        mx_kv_store_pull: resolve(lib, "MXKVStorePull")?,
        mx_kv_store_pull_ex: resolve(lib, "MXKVStorePullEx")?,
        mx_kv_store_set_updater_ex: resolve(lib, "MXKVStoreSetUpdaterEx")?,
        mx_kv_store_set_gradient_compression: resolve(lib, "MXKVStoreSetGradientCompression")?,

        mx_list_data_iters: resolve(lib, "MXListDataIters")?,
        mx_data_iter_get_iter_info: resolve(lib, "MXDataIterGetIterInfo")?,
        mx_data_iter_create_iter: resolve(lib, "MXDataIterCreateIter")?,
        mx_data_iter_free: resolve(lib, "MXDataIterFree")?,
        mx_data_iter_next: resolve(lib, "MXDataIterNext")?,
        mx_data_iter_before_first: resolve(lib, "MXDataIterBeforeFirst")?,
        mx_data_iter_get_data: resolve(lib, "MXDataIterGetData")?,
        mx_data_iter_get_label: resolve(lib, "MXDataIterGetLabel")?,
        mx_data_iter_get_pad_num: resolve(lib, "MXDataIterGetPadNum")?,
        mx_data_iter_get_index: resolve(lib, "MXDataIterGetIndex")?,

        mx_autograd_set_is_recording: resolve(lib, "MXAutogradSetIsRecording")?,
        mx_autograd_set_is_training: resolve(lib, "MXAutogradSetIsTraining")?,
        mx_autograd_is_recording: resolve(lib, "MXAutogradIsRecording")?,
        mx_autograd_is_training: resolve(lib, "MXAutogradIsTraining")?,
        mx_autograd_mark_variables: resolve(lib, "MXAutogradMarkVariables")?,
        mx_autograd_backward_ex: resolve(lib, "MXAutogradBackwardEx")?,

        mx_random_seed: resolve(lib, "MXRandomSeed")?,

        mx_list_all_op_names: resolve(lib, "MXListAllOpNames")?,
        nn_get_op_handle: resolve(lib, "NNGetOpHandle")?,
        mx_symbol_get_atomic_symbol_info: resolve(lib, "MXSymbolGetAtomicSymbolInfo")?,
        mx_imperative_invoke: resolve(lib, "MXImperativeInvoke")?,
    })
}
