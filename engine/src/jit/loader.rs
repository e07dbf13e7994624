//! Shared library loading and bridge binding.

use std::path::Path;

use libloading::Library;

use super::compiled::KernelFn;
use super::error::{FailureClass, JitError};
use crate::bridge::{BRIDGE, BRIDGE_ABI_VERSION, BRIDGE_BIND_SYMBOL, BindFn};

fn load_error(message: String, path: &Path) -> JitError {
    JitError::build(FailureClass::LoadFailed, message).with_context(path.display().to_string())
}

/// Open `path`, bind the math bridge when the unit uses it, and resolve `symbol`.
pub(crate) fn load_kernel(
    path: &Path,
    symbol: &str,
    bridge: bool,
) -> Result<(Library, KernelFn), JitError> {
    // SAFETY: the library was produced by our own code generator; its
    // initializers are empty.
    let library = unsafe { Library::new(path) }
        .map_err(|e| load_error(format!("cannot open shared library: {e}"), path))?;

    if bridge {
        // SAFETY: the bind symbol has the `BindFn` signature in every unit
        // emitted with the bridge enabled.
        let status = unsafe {
            let bind = library
                .get::<BindFn>(BRIDGE_BIND_SYMBOL.as_bytes())
                .map_err(|e| load_error(format!("missing bridge entry point: {e}"), path))?;
            bind(BRIDGE.as_ptr(), BRIDGE_ABI_VERSION)
        };
        if status != 0 {
            return Err(load_error(
                format!("bridge binding rejected (status {status})"),
                path,
            ));
        }
    }

    // SAFETY: the entry symbol is emitted with the `KernelFn` signature.
    let func = unsafe {
        *library
            .get::<KernelFn>(symbol.as_bytes())
            .map_err(|e| load_error(format!("missing entry point '{symbol}': {e}"), path))?
    };
    Ok((library, func))
}
