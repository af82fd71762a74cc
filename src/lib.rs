//! Cranelift-based JIT compiler for circuit definitions
//!
//! Compiles an elaborated, hierarchical circuit into native compute/update
//! functions and drives them through a fixed buffer ABI. Pure Rust library
//! with C ABI exports.
//!
//! The crate is organized as:
//! - circuit.rs: Circuit graph (definitions, instances, nets) and JSON loading
//! - primitives.rs: Primitive library and lowering recipes
//! - emitter/: Code emission capability and its Cranelift implementation
//! - builder.rs: Definition builder (flatten, schedule, emit)
//! - jit.rs: JIT engine (add/find/remove modules)
//! - abi.rs: ABI struct packer for input/output/debug records
//! - frontend/: Simulator orchestration, ABI wrappers and debug taps
//! - ffi.rs: C ABI function exports
//!
//! ```no_run
//! use circuit_jit::{Circuit, Definition, Frontend};
//!
//! let delay = Definition::new("delay")
//!     .input("d", 8)
//!     .output("q", 8)
//!     .primitive("r", "register", &[("width", 8)])
//!     .net("self.d", &["r.in"])
//!     .net("r.out", &["self.q"]);
//! let mut circuit = Circuit::new();
//! circuit.add(delay)?;
//!
//! let mut sim = Frontend::new(&circuit)?;
//! sim.set_input("d", 5)?;
//! sim.update_state()?;
//! assert_eq!(sim.compute_output()?.get_u64("q")?, 5);
//! # Ok::<(), circuit_jit::JitError>(())
//! ```

pub mod abi;
pub mod builder;
pub mod circuit;
pub mod config;
pub mod emitter;
pub mod error;
pub mod frontend;
pub mod jit;
pub mod primitives;

mod ffi;

pub use abi::{AbiLayout, AbiMember, AbiStruct, LayoutRules};
pub use builder::{DefinitionBuilder, FlatGraph};
pub use circuit::{Circuit, DefId, Definition, PinRef};
pub use config::{JitConfig, OptLevel};
pub use error::{ErrorCategory, JitError, Result};
pub use frontend::{DebugInfo, Frontend, TapRecord};
pub use jit::{CodeModule, JitEngine, ModuleHandle};
pub use primitives::{Primitive, PrimitiveLibrary};

// Re-export FFI functions at crate root for easier linking
pub use ffi::*;

pub use malachite_bigint::BigUint;
