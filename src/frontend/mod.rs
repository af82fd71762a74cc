//! Frontend Orchestrator
//!
//! [`Frontend`] compiles one top definition into a simulator and drives the
//! two-phase protocol over it:
//!
//! ```text
//! set_input*  ->  compute_output  ->  update_state?  ->  compute_output ...
//! ```
//!
//! `compute_output` only reads the persistent state; `update_state` is the
//! only call that changes it.

mod debug;
mod wrappers;


use std::mem;

use malachite_bigint::BigUint;
use tracing::{debug, info};

use crate::abi::AbiStruct;
use crate::builder::{emit_capture_body, DefinitionBuilder};
use crate::circuit::{Circuit, DefId, PortDef};
use crate::config::JitConfig;
use crate::error::{JitError, Result};
use crate::jit::{JitEngine, ModuleHandle};
use crate::primitives::PrimitiveLibrary;

pub use debug::{DebugInfo, TapRecord};
pub use wrappers::{ComputeFn, GetValuesFn, UpdateFn, WrapperSymbols};

/// Slack past the state footprint for window loads of bit-packed memories.
const STATE_GUARD_BYTES: usize = 16;

struct Instrumentation {
    info: DebugInfo,
    get_values: GetValuesFn,
}

/// Buffer sizes the compiled wrappers were built for
#[derive(Debug, Clone, Copy)]
struct Expected {
    inputs: usize,
    outputs: usize,
    state: usize,
    debug: usize,
}

/// A compiled, runnable circuit
pub struct Frontend {
    top: String,
    inputs: AbiStruct,
    outputs: AbiStruct,
    state: Vec<u8>,
    state_bytes: usize,
    expected: Expected,
    compute_fn: ComputeFn,
    update_fn: UpdateFn,
    debug: Option<Instrumentation>,
    symbols: WrapperSymbols,
    ir: String,
    module: ModuleHandle,
    engine: JitEngine,
}

impl Frontend {
    /// Compile the circuit's top definition with default settings.
    pub fn new(circuit: &Circuit) -> Result<Self> {
        Self::with_config(circuit, &JitConfig::default())
    }

    pub fn with_config(circuit: &Circuit, config: &JitConfig) -> Result<Self> {
        Self::with_top(circuit, circuit.top()?, config)
    }

    pub fn with_top(circuit: &Circuit, top: DefId, config: &JitConfig) -> Result<Self> {
        Self::with_library(circuit, top, &PrimitiveLibrary::builtin(), config)
    }

    pub fn with_library(circuit: &Circuit, top: DefId, library: &PrimitiveLibrary, config: &JitConfig) -> Result<Self> {
        circuit.validate()?;
        let builder = DefinitionBuilder::new(circuit, library);
        let reachable = circuit.reachable(top)?;
        let mut engine = JitEngine::new(config)?;
        let top_name = circuit.definition(top).name.clone();
        let mut code = engine.create_module(top_name.clone());

        for &id in reachable.iter().filter(|id| **id != top) {
            let graph = builder.flatten(id)?;
            builder.build(&mut code, &graph)?;
            debug!(definition = %graph.name, nodes = graph.nodes.len(), state_bytes = graph.state_bytes, "definition built");
        }
        let graph = builder.flatten(top)?;
        let funcs = builder.build(&mut code, &graph)?;

        let port_members = |ports: &[PortDef]| -> Vec<(String, u32)> { ports.iter().map(|p| (p.name.clone(), p.width)).collect() };
        let inputs = AbiStruct::with_members(&port_members(&graph.inputs), config.layout)?;
        let output_ports: Vec<_> = graph.outputs.iter().map(|(p, _)| p.clone()).collect();
        let outputs = AbiStruct::with_members(&port_members(&output_ports), config.layout)?;

        let (debug_info, capture) = if config.debug_taps {
            let info = DebugInfo::new(&graph, config.layout)?;
            let id = code.declare_function(&graph.capture_symbol(), &graph.capture_params(), true)?;
            code.define_function(id, |e| emit_capture_body(e, &graph, info.region().layout()))?;
            (Some(info), Some(id))
        } else {
            (None, None)
        };

        let symbols = wrappers::build_wrappers(&mut code, &graph, &funcs, inputs.layout(), outputs.layout(), capture)?;
        let ir = code.ir().to_string();
        let module = engine.add_module(code)?;

        let compute_fn = unsafe { mem::transmute::<*const u8, ComputeFn>(engine.get_symbol_address(&symbols.compute)?) };
        let update_fn = unsafe { mem::transmute::<*const u8, UpdateFn>(engine.get_symbol_address(&symbols.update)?) };
        let instrumentation = match (debug_info, &symbols.get_values) {
            (Some(info), Some(name)) => {
                let get_values = unsafe { mem::transmute::<*const u8, GetValuesFn>(engine.get_symbol_address(name)?) };
                Some(Instrumentation { info, get_values })
            }
            _ => None,
        };

        let expected = Expected {
            inputs: inputs.layout().size(),
            outputs: outputs.layout().size(),
            state: graph.state_bytes + STATE_GUARD_BYTES,
            debug: instrumentation.as_ref().map_or(0, |d| d.info.cursor()),
        };

        info!(
            top = %top_name,
            definitions = reachable.len(),
            nodes = graph.nodes.len(),
            state_bytes = graph.state_bytes,
            taps = instrumentation.as_ref().map_or(0, |d| d.info.records().len()),
            "circuit compiled"
        );

        Ok(Self {
            top: top_name,
            inputs,
            outputs,
            state: vec![0; expected.state],
            state_bytes: graph.state_bytes,
            expected,
            compute_fn,
            update_fn,
            debug: instrumentation,
            symbols,
            ir,
            module,
            engine,
        })
    }

    pub fn top(&self) -> &str {
        &self.top
    }

    fn check_width(&self, name: &str, bits: u64) -> Result<usize> {
        let index = self
            .inputs
            .layout()
            .position(name)
            .ok_or_else(|| JitError::UnknownInput(name.to_string()))?;
        let width = self.inputs.layout().members()[index].width;
        if bits > width as u64 {
            return Err(JitError::WidthMismatch {
                name: name.to_string(),
                width,
                bits,
            });
        }
        Ok(index)
    }

    /// Stage an input value. Values wider than the port are rejected.
    pub fn set_input(&mut self, name: &str, value: u64) -> Result<()> {
        let index = self.check_width(name, (64 - value.leading_zeros()) as u64)?;
        self.inputs.set_u64(index, value)
    }

    pub fn set_input_wide(&mut self, name: &str, value: &BigUint) -> Result<()> {
        let index = self.check_width(name, value.bits())?;
        self.inputs.set_member(index, value)
    }

    fn check_buffers(&self) -> Result<()> {
        let checks = [
            ("input", self.expected.inputs, self.inputs.data().len()),
            ("output", self.expected.outputs, self.outputs.data().len()),
            ("state", self.expected.state, self.state.len()),
        ];
        for (buffer, expected, actual) in checks {
            if expected != actual {
                return Err(JitError::BufferSizeMismatch { buffer, expected, actual });
            }
        }
        Ok(())
    }

    /// Evaluate outputs from the staged inputs and the current state.
    pub fn compute_output(&mut self) -> Result<&AbiStruct> {
        self.check_buffers()?;
        unsafe {
            (self.compute_fn)(
                self.inputs.data().as_ptr(),
                self.outputs.data_mut().as_mut_ptr(),
                self.state.as_mut_ptr(),
            )
        };
        Ok(&self.outputs)
    }

    /// Advance the state by one step.
    pub fn update_state(&mut self) -> Result<()> {
        self.check_buffers()?;
        unsafe { (self.update_fn)(self.inputs.data().as_ptr(), self.state.as_mut_ptr()) };
        Ok(())
    }

    /// Run the instrumented pass and return the value on input `input` of
    /// the instance at `path`.
    pub fn get_value(&mut self, path: &[&str], input: &str) -> Result<BigUint> {
        self.check_buffers()?;
        let debug = self.debug.as_mut().ok_or(JitError::DebugDisabled)?;
        let index = debug.info.find(path, input).ok_or_else(|| JitError::UnknownTap {
            path: path.join("."),
            input: input.to_string(),
        })?;

        let region = debug.info.region_mut();
        if region.data().len() != self.expected.debug {
            return Err(JitError::BufferSizeMismatch {
                buffer: "debug",
                expected: self.expected.debug,
                actual: region.data().len(),
            });
        }
        unsafe {
            (debug.get_values)(
                self.inputs.data().as_ptr(),
                self.state.as_mut_ptr(),
                region.data_mut().as_mut_ptr(),
            )
        };
        region.get_value(index)
    }

    pub fn inputs(&self) -> &AbiStruct {
        &self.inputs
    }

    /// Output record as of the last `compute_output`.
    pub fn outputs(&self) -> &AbiStruct {
        &self.outputs
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.layout().members().iter().map(|m| m.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.layout().members().iter().map(|m| m.name.as_str()).collect()
    }

    /// Persistent state, read-only.
    pub fn state(&self) -> &[u8] {
        &self.state[..self.state_bytes]
    }

    pub fn state_bytes(&self) -> usize {
        self.state_bytes
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug.as_ref().map(|d| &d.info)
    }

    pub fn tap_names(&self) -> Vec<String> {
        self.debug_info()
            .map(|info| info.records().iter().map(TapRecord::name).collect())
            .unwrap_or_default()
    }

    pub fn wrapper_symbols(&self) -> &WrapperSymbols {
        &self.symbols
    }

    /// Generated IR of every function, for inspection.
    pub fn dump_ir(&self) -> &str {
        &self.ir
    }

    pub fn engine(&self) -> &JitEngine {
        &self.engine
    }

    pub fn module(&self) -> ModuleHandle {
        self.module
    }
}
