//! Global random state.

use crate::error::{check, Result};

/// Seeds every random generator the native library owns.
pub fn seed(seed: i32) -> Result<()> {
    let api = crate::api::table()?;
    check(api, unsafe { (api.mx_random_seed)(seed) })
}
