//! Primitive library
//!
//! Each circuit primitive is a [`Primitive`] value: pin metadata, state
//! footprint and two lowering recipes (`emit_compute`, `emit_update`) written
//! against the [`CodeEmitter`] capability. A [`PrimitiveLibrary`] maps kind
//! names to constructors; it is built once and passed by reference to the
//! definition builder.

use std::collections::HashMap;

use crate::circuit::GenArgs;
use crate::emitter::{
    check_native_width, load_element, load_field, packed_array_bytes, store_element, store_field, BinaryOp,
    CodeEmitter, CompareOp, FieldPlacement,
};
use crate::error::{JitError, Result};

/// Operation kinds of a circuit primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// One-cycle delay element. `out` shows the held value.
    Register { width: u32 },
    Const { width: u32, value: u128 },
    Binary { op: BinaryOp, width: u32 },
    Not { width: u32 },
    Compare { op: CompareOp, width: u32 },
    /// `lhs` when `sel` is set, `rhs` when it is clear.
    Mux { width: u32 },
    /// Single write port, asynchronous read port memory.
    Mem { width: u32, depth: u64 },
}

const NO_PINS: &[&str] = &[];
const REGISTER_IN: &[&str] = &["in"];
const OUT: &[&str] = &["out"];
const LHS_RHS: &[&str] = &["lhs", "rhs"];
const SUM: &[&str] = &["sum"];
const PROD: &[&str] = &["prod"];
const BIT: &[&str] = &["bit"];
const MUX_IN: &[&str] = &["lhs", "rhs", "sel"];
const RESULT: &[&str] = &["result"];
const MEM_IN: &[&str] = &["waddr", "wdata", "wen", "raddr"];
const MEM_OUT: &[&str] = &["rdata"];

impl Primitive {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Primitive::Register { .. } => "register",
            Primitive::Const { .. } => "const",
            Primitive::Binary { op, .. } => match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::And => "and",
                BinaryOp::Or => "or",
                BinaryOp::Xor => "xor",
            },
            Primitive::Not { .. } => "not",
            Primitive::Compare { op: CompareOp::Eq, .. } => "eq",
            Primitive::Compare { op: CompareOp::Ne, .. } => "neq",
            Primitive::Mux { .. } => "mux",
            Primitive::Mem { .. } => "mem",
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Primitive::Register { .. } | Primitive::Mem { .. })
    }

    /// Bytes of persistent state owned by one instance.
    pub fn state_bytes(&self) -> usize {
        match *self {
            Primitive::Register { width } => width.div_ceil(8) as usize,
            Primitive::Mem { width, depth } => packed_array_bytes(width, depth).unwrap_or(0) as usize,
            _ => 0,
        }
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        match self {
            Primitive::Register { .. } | Primitive::Not { .. } => REGISTER_IN,
            Primitive::Const { .. } => NO_PINS,
            Primitive::Binary { .. } | Primitive::Compare { .. } => LHS_RHS,
            Primitive::Mux { .. } => MUX_IN,
            Primitive::Mem { .. } => MEM_IN,
        }
    }

    pub fn output_names(&self) -> &'static [&'static str] {
        match self {
            Primitive::Binary { op: BinaryOp::Add, .. } => SUM,
            Primitive::Binary { op: BinaryOp::Mul, .. } => PROD,
            Primitive::Compare { .. } => BIT,
            Primitive::Mux { .. } => RESULT,
            Primitive::Mem { .. } => MEM_OUT,
            _ => OUT,
        }
    }

    pub fn input_widths(&self) -> Vec<u32> {
        match *self {
            Primitive::Register { width } | Primitive::Not { width } => vec![width],
            Primitive::Const { .. } => Vec::new(),
            Primitive::Binary { width, .. } | Primitive::Compare { width, .. } => vec![width, width],
            Primitive::Mux { width } => vec![width, width, 1],
            Primitive::Mem { width, depth } => {
                let aw = address_width(depth);
                vec![aw, width, 1, aw]
            }
        }
    }

    pub fn output_widths(&self) -> Vec<u32> {
        match *self {
            Primitive::Compare { .. } => vec![1],
            Primitive::Register { width }
            | Primitive::Const { width, .. }
            | Primitive::Binary { width, .. }
            | Primitive::Not { width }
            | Primitive::Mux { width }
            | Primitive::Mem { width, .. } => vec![width],
        }
    }

    /// Indices of the inputs read by `emit_compute`. Outputs never depend
    /// combinationally on the other inputs.
    pub fn compute_inputs(&self) -> &'static [usize] {
        match self {
            Primitive::Register { .. } | Primitive::Const { .. } => &[],
            Primitive::Not { .. } => &[0],
            Primitive::Binary { .. } | Primitive::Compare { .. } => &[0, 1],
            Primitive::Mux { .. } => &[0, 1, 2],
            Primitive::Mem { .. } => &[3],
        }
    }

    /// Emit the output values. `inputs` holds the values of
    /// [`compute_inputs`](Self::compute_inputs) in order; `state` points at
    /// this instance's state slice.
    pub fn emit_compute<E: CodeEmitter>(&self, e: &mut E, inputs: &[E::Value], state: E::Value) -> Result<Vec<E::Value>> {
        let out = match *self {
            Primitive::Register { width } => load_field(e, state, FieldPlacement::bytes(0, width))?,
            Primitive::Const { width, value } => e.constant(width, value),
            Primitive::Binary { op, width } => e.binary(op, width, inputs[0], inputs[1]),
            Primitive::Not { width } => e.not(width, inputs[0]),
            Primitive::Compare { op, width } => e.compare(op, width, inputs[0], inputs[1]),
            Primitive::Mux { width } => e.select(width, inputs[2], inputs[0], inputs[1]),
            Primitive::Mem { width, depth } => {
                let index = bounded_index(e, inputs[0], depth);
                load_element(e, state, index, width)?
            }
        };
        Ok(vec![out])
    }

    /// Emit the state update. `inputs` holds every input value in
    /// [`input_names`](Self::input_names) order. Stores stay inside `state`'s slice.
    pub fn emit_update<E: CodeEmitter>(&self, e: &mut E, inputs: &[E::Value], state: E::Value) -> Result<()> {
        match *self {
            Primitive::Register { width } => store_field(e, state, FieldPlacement::bytes(0, width), inputs[0]),
            Primitive::Mem { width, depth } => {
                let (waddr, wdata, wen) = (inputs[0], inputs[1], inputs[2]);
                e.emit_if(wen, |e| {
                    let index = bounded_index(e, waddr, depth);
                    store_element(e, state, index, width, wdata)
                })
            }
            _ => Ok(()),
        }
    }
}

/// Address bits of a memory with `depth` words.
pub fn address_width(depth: u64) -> u32 {
    if depth <= 2 {
        1
    } else {
        64 - (depth - 1).leading_zeros()
    }
}

/// Zero-extend an address to 64 bits and wrap it into `0..depth`.
fn bounded_index<E: CodeEmitter>(e: &mut E, addr: E::Value, depth: u64) -> E::Value {
    let aw = address_width(depth);
    let index = e.resize(addr, aw, 64);
    if aw < 64 && depth == 1u64 << aw {
        index
    } else {
        e.urem(64, index, depth)
    }
}

// ============================================================================
// Library
// ============================================================================

/// Generator arguments of one instance, with the context needed for errors.
pub struct GenArgsView<'a> {
    pub kind: &'a str,
    pub instance: &'a str,
    pub args: &'a GenArgs,
}

impl GenArgsView<'_> {
    pub fn require(&self, arg: &str) -> Result<u64> {
        self.args.get(arg).copied().ok_or_else(|| JitError::MissingArgument {
            kind: self.kind.to_string(),
            instance: self.instance.to_string(),
            arg: arg.to_string(),
        })
    }

    pub fn invalid(&self, arg: &str, reason: impl Into<String>) -> JitError {
        JitError::InvalidArgument {
            kind: self.kind.to_string(),
            instance: self.instance.to_string(),
            arg: arg.to_string(),
            reason: reason.into(),
        }
    }

    /// The `width` argument, checked against what native code can hold.
    pub fn width(&self) -> Result<u32> {
        let width = self.require("width")?;
        let width = u32::try_from(width).map_err(|_| self.invalid("width", "too large"))?;
        check_native_width(&format!("{} `{}`", self.kind, self.instance), width)?;
        Ok(width)
    }
}

/// Constructor of a primitive from its generator arguments.
pub type PrimitiveBuilder = fn(&GenArgsView<'_>) -> Result<Primitive>;

fn build_register(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Register { width: args.width()? })
}

fn build_const(args: &GenArgsView<'_>) -> Result<Primitive> {
    let width = args.width()?;
    let value = args.require("value")? as u128;
    if value > crate::emitter::low_mask(width) {
        return Err(args.invalid("value", format!("does not fit in {} bits", width)));
    }
    Ok(Primitive::Const { width, value })
}

fn build_add(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Binary { op: BinaryOp::Add, width: args.width()? })
}

fn build_sub(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Binary { op: BinaryOp::Sub, width: args.width()? })
}

fn build_mul(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Binary { op: BinaryOp::Mul, width: args.width()? })
}

fn build_and(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Binary { op: BinaryOp::And, width: args.width()? })
}

fn build_or(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Binary { op: BinaryOp::Or, width: args.width()? })
}

fn build_xor(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Binary { op: BinaryOp::Xor, width: args.width()? })
}

fn build_not(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Not { width: args.width()? })
}

fn build_eq(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Compare { op: CompareOp::Eq, width: args.width()? })
}

fn build_neq(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Compare { op: CompareOp::Ne, width: args.width()? })
}

fn build_mux(args: &GenArgsView<'_>) -> Result<Primitive> {
    Ok(Primitive::Mux { width: args.width()? })
}

fn build_mem(args: &GenArgsView<'_>) -> Result<Primitive> {
    let width = args.width()?;
    let depth = args.require("depth")?;
    if depth == 0 {
        return Err(args.invalid("depth", "must be at least 1"));
    }
    match packed_array_bytes(width, depth) {
        Some(bytes) if bytes <= i32::MAX as u64 => Ok(Primitive::Mem { width, depth }),
        _ => Err(args.invalid("depth", "memory too large")),
    }
}

const BUILTINS: &[(&str, PrimitiveBuilder)] = &[
    ("register", build_register),
    ("const", build_const),
    ("add", build_add),
    ("sub", build_sub),
    ("mul", build_mul),
    ("and", build_and),
    ("or", build_or),
    ("xor", build_xor),
    ("not", build_not),
    ("eq", build_eq),
    ("neq", build_neq),
    ("mux", build_mux),
    ("mem", build_mem),
];

/// Immutable table from primitive kind names to constructors.
#[derive(Clone)]
pub struct PrimitiveLibrary {
    builders: HashMap<String, PrimitiveBuilder>,
}

impl PrimitiveLibrary {
    /// Every built-in kind, under its plain name and in the `coreir.` namespace
    /// (`coreir.reg` for the register).
    pub fn builtin() -> Self {
        let mut builders = HashMap::new();
        for &(name, builder) in BUILTINS {
            builders.insert(name.to_string(), builder);
            let alias = if name == "register" { "reg" } else { name };
            builders.insert(format!("coreir.{}", alias), builder);
        }
        Self { builders }
    }

    /// Register an extra kind name. Consumes the library so the table is
    /// frozen once handed to a builder.
    pub fn with(mut self, kind: impl Into<String>, builder: PrimitiveBuilder) -> Self {
        self.builders.insert(kind.into(), builder);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, kind: &str, args: &GenArgs, instance: &str) -> Result<Primitive> {
        let builder = self.builders.get(kind).ok_or_else(|| JitError::UnknownPrimitive {
            kind: kind.to_string(),
            instance: instance.to_string(),
        })?;
        builder(&GenArgsView { kind, instance, args })
    }
}

impl Default for PrimitiveLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::eval::EvalEmitter;

    fn args(pairs: &[(&str, u64)]) -> GenArgs {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn build(kind: &str, pairs: &[(&str, u64)]) -> Primitive {
        PrimitiveLibrary::builtin().build(kind, &args(pairs), "u0").unwrap()
    }

    #[test]
    fn test_metadata_table() {
        let reg = build("register", &[("width", 12)]);
        assert!(reg.is_stateful());
        assert_eq!(reg.state_bytes(), 2);
        assert_eq!(reg.input_names(), &["in"]);
        assert_eq!(reg.compute_inputs(), &[] as &[usize]);

        let add = build("add", &[("width", 8)]);
        assert!(!add.is_stateful());
        assert_eq!(add.state_bytes(), 0);
        assert_eq!(add.output_names(), &["sum"]);

        let mul = build("coreir.mul", &[("width", 8)]);
        assert_eq!(mul.output_names(), &["prod"]);

        let eq = build("eq", &[("width", 8)]);
        assert_eq!(eq.output_names(), &["bit"]);
        assert_eq!(eq.output_widths(), vec![1]);

        let mem = build("mem", &[("width", 8), ("depth", 16)]);
        assert_eq!(mem.state_bytes(), 16);
        assert_eq!(mem.input_names(), &["waddr", "wdata", "wen", "raddr"]);
        assert_eq!(mem.input_widths(), vec![4, 8, 1, 4]);
        assert_eq!(mem.compute_inputs(), &[3]);

        let odd = build("mem", &[("width", 5), ("depth", 7)]);
        assert_eq!(odd.state_bytes(), 5);
    }

    #[test]
    fn test_address_width() {
        assert_eq!(address_width(1), 1);
        assert_eq!(address_width(2), 1);
        assert_eq!(address_width(3), 2);
        assert_eq!(address_width(16), 4);
        assert_eq!(address_width(17), 5);
    }

    #[test]
    fn test_unknown_kind() {
        let err = PrimitiveLibrary::builtin().build("coreir.slice", &args(&[]), "s0").unwrap_err();
        assert!(matches!(err, JitError::UnknownPrimitive { ref kind, .. } if kind == "coreir.slice"));
    }

    #[test]
    fn test_missing_width_is_an_error() {
        let err = PrimitiveLibrary::builtin().build("add", &args(&[]), "a0").unwrap_err();
        assert!(matches!(err, JitError::MissingArgument { ref arg, .. } if arg == "width"));

        let err = PrimitiveLibrary::builtin().build("mem", &args(&[("width", 8)]), "m0").unwrap_err();
        assert!(matches!(err, JitError::MissingArgument { ref arg, .. } if arg == "depth"));
    }

    #[test]
    fn test_invalid_arguments() {
        let lib = PrimitiveLibrary::builtin();
        assert!(lib.build("add", &args(&[("width", 0)]), "a0").is_err());
        assert!(lib.build("add", &args(&[("width", 129)]), "a0").is_err());
        assert!(lib.build("mem", &args(&[("width", 8), ("depth", 0)]), "m0").is_err());
        assert!(lib.build("const", &args(&[("width", 4), ("value", 16)]), "c0").is_err());
    }

    #[test]
    fn test_custom_alias() {
        let lib = PrimitiveLibrary::builtin().with("myadd", build_add);
        assert!(lib.contains("myadd"));
        assert!(lib.kinds().contains(&"coreir.reg"));
    }

    #[test]
    fn test_add_wraps() {
        let mut e = EvalEmitter::new(0);
        let add = build("add", &[("width", 8)]);
        assert_eq!(add.emit_compute(&mut e, &[200, 100], 0).unwrap(), vec![44]);
        let mul = build("mul", &[("width", 4)]);
        assert_eq!(mul.emit_compute(&mut e, &[5, 7], 0).unwrap(), vec![3]);
    }

    #[test]
    fn test_mux_polarity() {
        let mut e = EvalEmitter::new(0);
        let mux = build("mux", &[("width", 1)]);
        // sel clear picks rhs
        assert_eq!(mux.emit_compute(&mut e, &[1, 0, 0], 0).unwrap(), vec![0]);
        assert_eq!(mux.emit_compute(&mut e, &[1, 0, 1], 0).unwrap(), vec![1]);
    }

    #[test]
    fn test_register_state() {
        let mut e = EvalEmitter::new(4);
        let reg = build("register", &[("width", 17)]);
        assert_eq!(reg.emit_compute(&mut e, &[], 1).unwrap(), vec![0]);
        reg.emit_update(&mut e, &[0x1_2345], 1).unwrap();
        assert_eq!(reg.emit_compute(&mut e, &[], 1).unwrap(), vec![0x1_2345]);
        // only the 3-byte slice is touched
        assert_eq!(e.memory(), &[0, 0x45, 0x23, 0x01]);
    }

    #[test]
    fn test_mem_write_enable() {
        let mut e = EvalEmitter::new(16);
        let mem = build("mem", &[("width", 8), ("depth", 16)]);
        mem.emit_update(&mut e, &[3, 0x2a, 1, 0], 0).unwrap();
        assert_eq!(mem.emit_compute(&mut e, &[3], 0).unwrap(), vec![0x2a]);
        mem.emit_update(&mut e, &[3, 0x55, 0, 0], 0).unwrap();
        assert_eq!(mem.emit_compute(&mut e, &[3], 0).unwrap(), vec![0x2a]);
    }

    #[test]
    fn test_mem_odd_width_and_depth() {
        let mut e = EvalEmitter::new(8);
        let mem = build("mem", &[("width", 5), ("depth", 7)]);
        for addr in 0..7u128 {
            mem.emit_update(&mut e, &[addr, 31 - addr, 1, 0], 0).unwrap();
        }
        for addr in 0..7u128 {
            assert_eq!(mem.emit_compute(&mut e, &[addr], 0).unwrap(), vec![31 - addr]);
        }
        // address 7 wraps to 0
        assert_eq!(mem.emit_compute(&mut e, &[7], 0).unwrap(), vec![31]);
    }
}
