//! Rust binding for the libmxnet C API.
//!
//! The native library is loaded at runtime with `libloading`; every entry
//! point the binding needs is resolved once into a process-wide function
//! pointer table. On top of that table sit owning wrappers for the native
//! resource kinds (arrays, symbols, executors, cached operators, key-value
//! stores, data iterators), an argument marshaler that flattens host values
//! into the C calling convention, and an error bridge that turns non-zero
//! status codes into [`Error`] values carrying the native library's own
//! message.
//!
//! # Features
//!
//! - **Runtime loading**: no link-time dependency on libmxnet; the library
//!   path comes from `mxnet.toml`, the `LIBMXNET` variable, or the platform
//!   search paths
//! - **Owned handles**: every wrapper frees its native handle exactly once
//! - **Operator catalog**: the native operator registry is introspected once
//!   and drives both imperative invocation and symbolic composition
//! - **Callback bridge**: key-value store updaters written in Rust are
//!   invoked from the native side, with panics parked at the boundary and
//!   rethrown after the native call returns
//!
//! # Example
//!
//! ```no_run
//! use mxnet::{ops, Context, DType, NDArray};
//!
//! mxnet::api::init()?;
//!
//! let a = NDArray::ones(&[2, 3], Some(Context::cpu(0)), Some(DType::Float32))?;
//! let b = NDArray::zeros(&[2, 3], None, None)?;
//! let sum = ops::invoke("elemwise_add", &[&a, &b], &[])?.into_single()?;
//! assert_eq!(sum.shape()?, vec![2, 3]);
//! # Ok::<(), mxnet::Error>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   pinned buffers    ┌───────────────┐
//! │   host call   │ ──────────────────► │    marshal    │
//! └───────────────┘                     └───────┬───────┘
//!                                               │ raw pointers
//!                                               ▼
//! ┌───────────────┐    status code      ┌───────────────┐
//! │ error bridge  │ ◄────────────────── │  MxApi table  │ ──► libmxnet
//! └───────┬───────┘                     └───────────────┘
//!         │ fresh handles
//!         ▼
//! ┌───────────────┐
//! │   wrappers    │  NDArray, Symbol, Executor, CachedOp,
//! └───────────────┘  KVStore, DataIter
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod autograd;
pub mod cached_op;
mod callback;
pub mod config;
pub mod context;
pub mod dtype;
pub mod error;
pub mod executor;
pub mod io;
pub mod kvstore;
pub mod marshal;
pub mod ndarray;
pub mod ops;
pub mod random;
pub mod symbol;

// Core value types
pub use context::{Context, DeviceType};
pub use dtype::DType;
pub use error::{Error, Result};
pub use ndarray::{wait_all, LoadedArrays, NDArray};

// Symbolic graphs and their executors
pub use cached_op::CachedOp;
pub use executor::{Executor, OutGrads};
pub use ops::{OpArgInfo, OpDescriptor, Outputs};
pub use symbol::{
    BindOpts, GradReq, GradReqSpec, InferredShapes, InferredTypes, NdInputs, ShapeHints, Symbol,
    SymbolInputs, TypeHints,
};

// Distributed training and input pipelines
pub use io::{DataIter, DataIterDescriptor, IterArgInfo};
pub use kvstore::{KVStore, Keys, KvKey, Vals};

pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
