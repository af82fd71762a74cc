//! C ABI exports over [`Frontend`]
//!
//! All functions take an opaque context created by `circuit_jit_create`.
//! Status-returning functions return 0 on success and -1 on failure.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;

use crate::circuit::Circuit;
use crate::error::Result;
use crate::frontend::Frontend;

/// Opaque simulator context passed to all FFI functions
pub struct CircuitJitContext {
    pub frontend: Frontend,
}

impl CircuitJitContext {
    pub fn new(json: &str) -> Result<Self> {
        let circuit = Circuit::from_json(json)?;
        Ok(Self {
            frontend: Frontend::new(&circuit)?,
        })
    }
}

fn error_string(message: String) -> *mut c_char {
    let message = message.replace('\0', " ");
    CString::new(message).map_or(ptr::null_mut(), CString::into_raw)
}

unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create a simulator from circuit JSON
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_create(
    json: *const c_char,
    json_len: usize,
    error_out: *mut *mut c_char,
) -> *mut CircuitJitContext {
    let json_slice = slice::from_raw_parts(json as *const u8, json_len);
    let result = std::str::from_utf8(json_slice)
        .map_err(|e| format!("Invalid UTF-8 in JSON: {}", e))
        .and_then(|text| CircuitJitContext::new(text).map_err(|e| e.to_string()));

    match result {
        Ok(ctx) => Box::into_raw(Box::new(ctx)),
        Err(message) => {
            if !error_out.is_null() {
                *error_out = error_string(message);
            }
            ptr::null_mut()
        }
    }
}

/// Destroy a simulator
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_destroy(ctx: *mut CircuitJitContext) {
    if !ctx.is_null() {
        drop(Box::from_raw(ctx));
    }
}

/// Free an error string
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_free_error(error: *mut c_char) {
    if !error.is_null() {
        drop(CString::from_raw(error));
    }
}

/// Free a string returned by circuit_jit functions
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// Stage an input value
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_set_input(
    ctx: *mut CircuitJitContext,
    name: *const c_char,
    value: u64,
) -> c_int {
    if ctx.is_null() {
        return -1;
    }
    let Some(name) = str_arg(name) else {
        return -1;
    };
    match (*ctx).frontend.set_input(name, value) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Evaluate outputs
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_compute_output(ctx: *mut CircuitJitContext) -> c_int {
    if ctx.is_null() {
        return -1;
    }
    match (*ctx).frontend.compute_output() {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

/// Read the low 64 bits of an output from the last compute
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_get_output(
    ctx: *const CircuitJitContext,
    name: *const c_char,
    value_out: *mut u64,
) -> c_int {
    if ctx.is_null() || value_out.is_null() {
        return -1;
    }
    let Some(name) = str_arg(name) else {
        return -1;
    };
    match (*ctx).frontend.outputs().get_u64(name) {
        Ok(value) => {
            *value_out = value;
            0
        }
        Err(_) => -1,
    }
}

/// Advance state by one step
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_update_state(ctx: *mut CircuitJitContext) -> c_int {
    if ctx.is_null() {
        return -1;
    }
    match (*ctx).frontend.update_state() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Size of the persistent state in bytes
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_state_len(ctx: *const CircuitJitContext) -> usize {
    if ctx.is_null() {
        return 0;
    }
    (*ctx).frontend.state_bytes()
}

/// Read-only pointer to the persistent state
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_state_ptr(ctx: *const CircuitJitContext) -> *const u8 {
    if ctx.is_null() {
        return ptr::null();
    }
    (*ctx).frontend.state().as_ptr()
}

/// Low 64 bits of a debug tap; `path` is dot-separated (`u0.adder`)
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_get_value(
    ctx: *mut CircuitJitContext,
    path: *const c_char,
    input: *const c_char,
    value_out: *mut u64,
) -> c_int {
    if ctx.is_null() || value_out.is_null() {
        return -1;
    }
    let (Some(path), Some(input)) = (str_arg(path), str_arg(input)) else {
        return -1;
    };
    let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    match (*ctx).frontend.get_value(&parts, input) {
        Ok(value) => {
            let bytes = value.to_bytes_le();
            let mut raw = [0u8; 8];
            let n = bytes.len().min(8);
            raw[..n].copy_from_slice(&bytes[..n]);
            *value_out = u64::from_le_bytes(raw);
            0
        }
        Err(_) => -1,
    }
}

/// Generated IR text; free with `circuit_jit_free_string`
#[no_mangle]
pub unsafe extern "C" fn circuit_jit_dump_ir(ctx: *const CircuitJitContext) -> *mut c_char {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    error_string((*ctx).frontend.dump_ir().to_string())
}
