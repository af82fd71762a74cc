//! Code emission capability
//!
//! Primitive recipes and the definition builder only talk to a
//! [`CodeEmitter`]: a narrow interface of integer arithmetic, comparison,
//! select, shifts, byte-precise memory access and structured branching over
//! opaque value handles. [`clif::ClifEmitter`] implements it on top of
//! Cranelift.
//!
//! Every integer value carries an implicit bit width chosen by the caller.
//! Values are always kept zero-extended: bits above the width are zero.

pub mod clif;
#[cfg(test)]
pub(crate) mod eval;

use crate::error::{JitError, Result};

/// Widest integer a single emitted value can hold.
pub const MAX_NATIVE_WIDTH: u32 = 128;

/// Two-operand arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// Comparisons producing a 1-bit result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

/// Operations a backend must provide to lower circuit primitives.
pub trait CodeEmitter {
    /// Opaque handle of an emitted value (integer or pointer).
    type Value: Copy;
    /// Handle of a declared function that can be called.
    type Func: Copy;

    fn constant(&mut self, width: u32, value: u128) -> Self::Value;

    /// Wrapping arithmetic truncated to `width`.
    fn binary(&mut self, op: BinaryOp, width: u32, lhs: Self::Value, rhs: Self::Value) -> Self::Value;

    fn not(&mut self, width: u32, value: Self::Value) -> Self::Value;

    fn compare(&mut self, op: CompareOp, width: u32, lhs: Self::Value, rhs: Self::Value) -> Self::Value;

    /// `if_true` when the 1-bit `cond` is set, `if_false` otherwise.
    fn select(&mut self, width: u32, cond: Self::Value, if_true: Self::Value, if_false: Self::Value) -> Self::Value;

    /// Left shift truncated to `width`. `amount` must be below the container size of `width`.
    fn shl(&mut self, width: u32, value: Self::Value, amount: Self::Value) -> Self::Value;

    fn lshr(&mut self, width: u32, value: Self::Value, amount: Self::Value) -> Self::Value;

    /// Unsigned remainder by a constant; `width` is at most 64.
    fn urem(&mut self, width: u32, value: Self::Value, divisor: u64) -> Self::Value;

    /// Reinterpret a `from`-bit value as `to` bits, zero-extending or truncating.
    fn resize(&mut self, value: Self::Value, from: u32, to: u32) -> Self::Value;

    /// Little-endian load of `bytes` bytes (1..=16) as a `bytes * 8`-bit value.
    fn load(&mut self, ptr: Self::Value, offset: i32, bytes: u32) -> Self::Value;

    /// Little-endian store of a `bytes * 8`-bit value.
    fn store(&mut self, value: Self::Value, ptr: Self::Value, offset: i32, bytes: u32);

    fn offset_ptr(&mut self, ptr: Self::Value, offset: i64) -> Self::Value;

    /// `ptr + index` where `index` is an `index_width`-bit byte offset.
    fn index_ptr(&mut self, ptr: Self::Value, index: Self::Value, index_width: u32) -> Self::Value;

    /// Address of a fresh stack buffer of `bytes` bytes with undefined contents.
    fn stack_slot(&mut self, bytes: u32) -> Self::Value;

    fn param(&mut self, index: usize) -> Self::Value;

    fn call(&mut self, func: Self::Func, args: &[Self::Value]);

    /// Emit `then` so that it only executes when the 1-bit `cond` is set.
    fn emit_if<F>(&mut self, cond: Self::Value, then: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>;
}

// ============================================================================
// Width helpers
// ============================================================================

/// All-ones mask of `width` bits.
pub fn low_mask(width: u32) -> u128 {
    if width >= 128 { u128::MAX } else { (1u128 << width) - 1 }
}

/// Size of the power-of-two integer container holding `width` bits.
pub fn container_bytes(width: u32) -> u32 {
    match width {
        0..=8 => 1,
        9..=16 => 2,
        17..=32 => 4,
        33..=64 => 8,
        _ => 16,
    }
}

pub fn check_native_width(what: &str, width: u32) -> Result<()> {
    if width == 0 || width > MAX_NATIVE_WIDTH {
        return Err(JitError::UnsupportedWidth {
            what: what.to_string(),
            width: width as u64,
        });
    }
    Ok(())
}

fn window_bytes(bits: u32, what: &str) -> Result<u32> {
    let bytes = bits.div_ceil(8);
    if bytes > 16 {
        return Err(JitError::UnsupportedWidth {
            what: what.to_string(),
            width: bits as u64,
        });
    }
    Ok(bytes)
}

// ============================================================================
// Bit-field access
// ============================================================================

/// Where a field lives relative to a base pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPlacement {
    pub bit_offset: u64,
    pub width: u32,
    /// Bytes owned by the field when it starts on a byte boundary.
    pub storage_bytes: u32,
    /// True when no other field shares the storage bytes.
    pub exclusive: bool,
}

impl FieldPlacement {
    /// A field alone in `ceil(width / 8)` bytes at `byte_offset`.
    pub fn bytes(byte_offset: u64, width: u32) -> Self {
        Self {
            bit_offset: byte_offset * 8,
            width,
            storage_bytes: width.div_ceil(8),
            exclusive: true,
        }
    }

    /// Low 64 bits and the remaining high bits as two independent fields.
    fn split(self) -> (Self, Self) {
        let high_width = self.width - SPLIT_BITS;
        let low = Self {
            bit_offset: self.bit_offset,
            width: SPLIT_BITS,
            storage_bytes: SPLIT_BITS / 8,
            exclusive: false,
        };
        let high = Self {
            bit_offset: self.bit_offset + SPLIT_BITS as u64,
            width: high_width,
            storage_bytes: high_width.div_ceil(8),
            exclusive: false,
        };
        (low, high)
    }
}

/// Bits of the low half when a field is too wide for one shifted window.
const SPLIT_BITS: u32 = 64;

fn join_halves<E: CodeEmitter>(e: &mut E, width: u32, low: E::Value, high: E::Value) -> E::Value {
    let low = e.resize(low, SPLIT_BITS, width);
    let high = e.resize(high, width - SPLIT_BITS, width);
    let amount = e.constant(8, SPLIT_BITS as u128);
    let high = e.shl(width, high, amount);
    e.binary(BinaryOp::Or, width, low, high)
}

fn split_halves<E: CodeEmitter>(e: &mut E, width: u32, value: E::Value) -> (E::Value, E::Value) {
    let low = e.resize(value, width, SPLIT_BITS);
    let amount = e.constant(8, SPLIT_BITS as u128);
    let high = e.lshr(width, value, amount);
    let high = e.resize(high, width, width - SPLIT_BITS);
    (low, high)
}

/// Load a field at a static bit position.
pub fn load_field<E: CodeEmitter>(e: &mut E, base: E::Value, field: FieldPlacement) -> Result<E::Value> {
    let byte = (field.bit_offset / 8) as i32;
    let shift = (field.bit_offset % 8) as u32;
    if shift == 0 && field.storage_bytes <= 16 {
        let raw = e.load(base, byte, field.storage_bytes);
        return Ok(e.resize(raw, field.storage_bytes * 8, field.width));
    }
    if shift + field.width > MAX_NATIVE_WIDTH && field.width > SPLIT_BITS {
        let (low, high) = field.split();
        let low = load_field(e, base, low)?;
        let high = load_field(e, base, high)?;
        return Ok(join_halves(e, field.width, low, high));
    }
    let window = window_bytes(shift + field.width, "bit field")?;
    let raw = e.load(base, byte, window);
    let amount = e.constant(8, shift as u128);
    let shifted = e.lshr(window * 8, raw, amount);
    Ok(e.resize(shifted, window * 8, field.width))
}

/// Store a `field.width`-bit value at a static bit position, leaving
/// neighbouring bits untouched.
pub fn store_field<E: CodeEmitter>(e: &mut E, base: E::Value, field: FieldPlacement, value: E::Value) -> Result<()> {
    let byte = (field.bit_offset / 8) as i32;
    let shift = (field.bit_offset % 8) as u32;
    if shift == 0 && field.storage_bytes <= 16 && (field.exclusive || field.width % 8 == 0) {
        let wide = e.resize(value, field.width, field.storage_bytes * 8);
        e.store(wide, base, byte, field.storage_bytes);
        return Ok(());
    }
    if shift + field.width > MAX_NATIVE_WIDTH && field.width > SPLIT_BITS {
        let (low, high) = field.split();
        let (low_value, high_value) = split_halves(e, field.width, value);
        store_field(e, base, low, low_value)?;
        return store_field(e, base, high, high_value);
    }
    let window = window_bytes(shift + field.width, "bit field")?;
    let bits = window * 8;
    let old = e.load(base, byte, window);
    let keep = e.constant(bits, !(low_mask(field.width) << shift) & low_mask(bits));
    let kept = e.binary(BinaryOp::And, bits, old, keep);
    let wide = e.resize(value, field.width, bits);
    let amount = e.constant(8, shift as u128);
    let placed = e.shl(bits, wide, amount);
    let merged = e.binary(BinaryOp::Or, bits, kept, placed);
    e.store(merged, base, byte, window);
    Ok(())
}

/// Address of element `index` in an array of bit-packed `width`-bit elements:
/// the byte pointer plus the bit shift inside that byte (`None` when elements
/// are byte-aligned).
fn element_address<E: CodeEmitter>(e: &mut E, base: E::Value, index: E::Value, width: u32) -> (E::Value, Option<E::Value>) {
    if width % 8 == 0 {
        let stride = e.constant(64, (width / 8) as u128);
        let offset = e.binary(BinaryOp::Mul, 64, index, stride);
        return (e.index_ptr(base, offset, 64), None);
    }
    let stride = e.constant(64, width as u128);
    let bit = e.binary(BinaryOp::Mul, 64, index, stride);
    let three = e.constant(64, 3);
    let byte = e.lshr(64, bit, three);
    let seven = e.constant(64, 7);
    let shift = e.binary(BinaryOp::And, 64, bit, seven);
    (e.index_ptr(base, byte, 64), Some(shift))
}

/// True when a `width`-bit element at an unknown sub-byte shift fits one window.
fn fits_window(width: u32) -> bool {
    width + 7 <= MAX_NATIVE_WIDTH
}

fn load_shifted<E: CodeEmitter>(e: &mut E, ptr: E::Value, shift: E::Value, width: u32) -> Result<E::Value> {
    if !fits_window(width) {
        let low = load_shifted(e, ptr, shift, SPLIT_BITS)?;
        let upper = e.offset_ptr(ptr, (SPLIT_BITS / 8) as i64);
        let high = load_shifted(e, upper, shift, width - SPLIT_BITS)?;
        return Ok(join_halves(e, width, low, high));
    }
    let window = window_bytes(width + 7, "memory element")?;
    let bits = window * 8;
    let raw = e.load(ptr, 0, window);
    let shift = e.resize(shift, 64, bits);
    let shifted = e.lshr(bits, raw, shift);
    Ok(e.resize(shifted, bits, width))
}

fn store_shifted<E: CodeEmitter>(e: &mut E, ptr: E::Value, shift: E::Value, width: u32, value: E::Value) -> Result<()> {
    if !fits_window(width) {
        let (low, high) = split_halves(e, width, value);
        store_shifted(e, ptr, shift, SPLIT_BITS, low)?;
        let upper = e.offset_ptr(ptr, (SPLIT_BITS / 8) as i64);
        return store_shifted(e, upper, shift, width - SPLIT_BITS, high);
    }
    let window = window_bytes(width + 7, "memory element")?;
    let bits = window * 8;
    let shift = e.resize(shift, 64, bits);
    let old = e.load(ptr, 0, window);
    let ones = e.constant(bits, low_mask(width));
    let mask = e.shl(bits, ones, shift);
    let keep = e.not(bits, mask);
    let kept = e.binary(BinaryOp::And, bits, old, keep);
    let wide = e.resize(value, width, bits);
    let placed = e.shl(bits, wide, shift);
    let merged = e.binary(BinaryOp::Or, bits, kept, placed);
    e.store(merged, ptr, 0, window);
    Ok(())
}

/// Load element `index` (a 64-bit value) of a packed array.
pub fn load_element<E: CodeEmitter>(e: &mut E, base: E::Value, index: E::Value, width: u32) -> Result<E::Value> {
    match element_address(e, base, index, width) {
        (ptr, None) => Ok(e.load(ptr, 0, width / 8)),
        (ptr, Some(shift)) => load_shifted(e, ptr, shift, width),
    }
}

/// Store element `index` (a 64-bit value) of a packed array.
pub fn store_element<E: CodeEmitter>(e: &mut E, base: E::Value, index: E::Value, width: u32, value: E::Value) -> Result<()> {
    match element_address(e, base, index, width) {
        (ptr, None) => {
            e.store(value, ptr, 0, width / 8);
            Ok(())
        }
        (ptr, Some(shift)) => store_shifted(e, ptr, shift, width, value),
    }
}

/// Bytes a packed array of `depth` elements of `width` bits occupies.
pub fn packed_array_bytes(width: u32, depth: u64) -> Option<u64> {
    (width as u64).checked_mul(depth).map(|bits| bits.div_ceil(8))
}
