//! Device placement for arrays and executors.
//!
//! A context names a device type and an ordinal within that type. The
//! device type ids cross the native boundary raw, so the discriminants
//! here must stay in step with the native library.

use std::fmt;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Kind of device a value lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceType {
    Cpu = 1,
    Gpu = 2,
    CpuPinned = 3,
}

impl DeviceType {
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            1 => Ok(DeviceType::Cpu),
            2 => Ok(DeviceType::Gpu),
            3 => Ok(DeviceType::CpuPinned),
            _ => Err(Error::InvalidArgument(format!(
                "invalid id of device type: {id}"
            ))),
        }
    }

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::CpuPinned => "cpu_pinned",
        }
    }
}

/// A device type plus ordinal, e.g. `cpu(0)` or `gpu(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub device_type: DeviceType,
    pub device_id: i32,
}

lazy_static::lazy_static! {
    /// Process-wide default placement for newly created arrays.
    static ref DEFAULT_CONTEXT: RwLock<Context> = RwLock::new(Context::cpu(0));
}

impl Context {
    pub fn new(device_type: DeviceType, device_id: i32) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    pub fn cpu(device_id: i32) -> Self {
        Self::new(DeviceType::Cpu, device_id)
    }

    pub fn gpu(device_id: i32) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }

    pub fn cpu_pinned(device_id: i32) -> Self {
        Self::new(DeviceType::CpuPinned, device_id)
    }

    /// The current process-wide default, `cpu(0)` unless overridden.
    pub fn current() -> Self {
        *DEFAULT_CONTEXT.read().unwrap()
    }

    /// Runs `f` with `ctx` as the default, restoring the previous default
    /// afterwards even if `f` panics.
    pub fn with<R>(ctx: Context, f: impl FnOnce() -> R) -> R {
        struct Restore(Context);
        impl Drop for Restore {
            fn drop(&mut self) {
                *DEFAULT_CONTEXT.write().unwrap() = self.0;
            }
        }

        let previous = {
            let mut current = DEFAULT_CONTEXT.write().unwrap();
            std::mem::replace(&mut *current, ctx)
        };
        let _restore = Restore(previous);
        f()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::cpu(0)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device_type.name(), self.device_id)
    }
}
