//! Fixed-ABI wrapper functions
//!
//! Callers only ever see three buffer-based entry points per circuit:
//!
//! ```text
//! <top>_wrap_compute_output(const u8 *in, u8 *out, u8 *state)
//! <top>_wrap_update_state(const u8 *in, u8 *state)
//! <top>_wrap_get_values(const u8 *in, u8 *state, u8 *debug)
//! ```
//!
//! Each unpacks the input record into scalar values and calls the internal
//! `<top>_*` function, whose convention is free to change.

use cranelift_module::FuncId;

use crate::abi::AbiLayout;
use crate::builder::{DefinitionFuncs, FlatGraph};
use crate::emitter::{container_bytes, load_field, store_field, CodeEmitter};
use crate::error::Result;
use crate::jit::{CodeModule, Param};

pub type ComputeFn = unsafe extern "C" fn(*const u8, *mut u8, *mut u8);
pub type UpdateFn = unsafe extern "C" fn(*const u8, *mut u8);
pub type GetValuesFn = unsafe extern "C" fn(*const u8, *mut u8, *mut u8);

/// Exported wrapper symbols of one compiled circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperSymbols {
    pub compute: String,
    pub update: String,
    pub get_values: Option<String>,
}

fn load_record<E: CodeEmitter>(e: &mut E, layout: &AbiLayout, ptr: E::Value) -> Result<Vec<E::Value>> {
    layout.members().iter().map(|m| load_field(e, ptr, m.placement())).collect()
}

pub fn emit_wrap_compute<E: CodeEmitter>(e: &mut E, inputs: &AbiLayout, outputs: &AbiLayout, compute: E::Func) -> Result<()> {
    let in_ptr = e.param(0);
    let out_ptr = e.param(1);
    let state = e.param(2);

    let mut args = load_record(e, inputs, in_ptr)?;
    args.push(state);
    let slots: Vec<E::Value> = outputs
        .members()
        .iter()
        .map(|m| e.stack_slot(container_bytes(m.width)))
        .collect();
    args.extend_from_slice(&slots);
    e.call(compute, &args);

    for (member, slot) in outputs.members().iter().zip(slots) {
        let value = e.load(slot, 0, container_bytes(member.width));
        store_field(e, out_ptr, member.placement(), value)?;
    }
    Ok(())
}

pub fn emit_wrap_update<E: CodeEmitter>(e: &mut E, inputs: &AbiLayout, update: E::Func) -> Result<()> {
    let in_ptr = e.param(0);
    let state = e.param(1);
    let mut args = load_record(e, inputs, in_ptr)?;
    args.push(state);
    e.call(update, &args);
    Ok(())
}

pub fn emit_wrap_get_values<E: CodeEmitter>(e: &mut E, inputs: &AbiLayout, capture: E::Func) -> Result<()> {
    let in_ptr = e.param(0);
    let state = e.param(1);
    let debug = e.param(2);
    let mut args = load_record(e, inputs, in_ptr)?;
    args.push(state);
    args.push(debug);
    e.call(capture, &args);
    Ok(())
}

/// Declare and define the wrappers around the top definition's functions.
pub fn build_wrappers(
    code: &mut CodeModule,
    graph: &FlatGraph,
    funcs: &DefinitionFuncs,
    inputs: &AbiLayout,
    outputs: &AbiLayout,
    capture: Option<FuncId>,
) -> Result<WrapperSymbols> {
    let compute = format!("{}_wrap_compute_output", graph.name);
    let id = code.declare_function(&compute, &[Param::Ptr, Param::Ptr, Param::Ptr], true)?;
    code.define_function(id, |e| emit_wrap_compute(e, inputs, outputs, funcs.compute))?;

    let update = format!("{}_wrap_update_state", graph.name);
    let id = code.declare_function(&update, &[Param::Ptr, Param::Ptr], true)?;
    code.define_function(id, |e| emit_wrap_update(e, inputs, funcs.update))?;

    let get_values = match capture {
        Some(capture) => {
            let name = format!("{}_wrap_get_values", graph.name);
            let id = code.declare_function(&name, &[Param::Ptr, Param::Ptr, Param::Ptr], true)?;
            code.define_function(id, |e| emit_wrap_get_values(e, inputs, capture))?;
            Some(name)
        }
        None => None,
    };

    Ok(WrapperSymbols { compute, update, get_values })
}
