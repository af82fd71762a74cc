//! Interpreting emitter used by unit tests
//!
//! Values are evaluated eagerly as `u128`; pointers are offsets into a
//! private byte arena. This exercises primitive recipes and bit-field helpers
//! without going through the JIT.

use super::{low_mask, BinaryOp, CodeEmitter, CompareOp};
use crate::error::Result;

pub struct EvalEmitter {
    memory: Vec<u8>,
    params: Vec<u128>,
}

impl EvalEmitter {
    pub fn new(bytes: usize) -> Self {
        Self { memory: vec![0; bytes], params: Vec::new() }
    }

    pub fn with_params(mut self, params: &[u128]) -> Self {
        self.params = params.to_vec();
        self
    }

    pub fn fill(&mut self, offset: usize, bytes: &[u8]) {
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }
}

impl CodeEmitter for EvalEmitter {
    type Value = u128;
    type Func = usize;

    fn constant(&mut self, width: u32, value: u128) -> u128 {
        value & low_mask(width)
    }

    fn binary(&mut self, op: BinaryOp, width: u32, lhs: u128, rhs: u128) -> u128 {
        let result = match op {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::And => lhs & rhs,
            BinaryOp::Or => lhs | rhs,
            BinaryOp::Xor => lhs ^ rhs,
        };
        result & low_mask(width)
    }

    fn not(&mut self, width: u32, value: u128) -> u128 {
        !value & low_mask(width)
    }

    fn compare(&mut self, op: CompareOp, _width: u32, lhs: u128, rhs: u128) -> u128 {
        let hit = match op {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        };
        hit as u128
    }

    fn select(&mut self, _width: u32, cond: u128, if_true: u128, if_false: u128) -> u128 {
        if cond != 0 { if_true } else { if_false }
    }

    fn shl(&mut self, width: u32, value: u128, amount: u128) -> u128 {
        (value << amount) & low_mask(width)
    }

    fn lshr(&mut self, _width: u32, value: u128, amount: u128) -> u128 {
        value >> amount
    }

    fn urem(&mut self, _width: u32, value: u128, divisor: u64) -> u128 {
        value % divisor as u128
    }

    fn resize(&mut self, value: u128, _from: u32, to: u32) -> u128 {
        value & low_mask(to)
    }

    fn load(&mut self, ptr: u128, offset: i32, bytes: u32) -> u128 {
        let start = (ptr as i64 + offset as i64) as usize;
        let mut raw = [0u8; 16];
        raw[..bytes as usize].copy_from_slice(&self.memory[start..start + bytes as usize]);
        u128::from_le_bytes(raw)
    }

    fn store(&mut self, value: u128, ptr: u128, offset: i32, bytes: u32) {
        let start = (ptr as i64 + offset as i64) as usize;
        let raw = value.to_le_bytes();
        self.memory[start..start + bytes as usize].copy_from_slice(&raw[..bytes as usize]);
    }

    fn offset_ptr(&mut self, ptr: u128, offset: i64) -> u128 {
        (ptr as i64 + offset) as u128
    }

    fn index_ptr(&mut self, ptr: u128, index: u128, _index_width: u32) -> u128 {
        ptr + index
    }

    fn stack_slot(&mut self, bytes: u32) -> u128 {
        let at = self.memory.len();
        self.memory.resize(at + bytes as usize, 0);
        at as u128
    }

    fn param(&mut self, index: usize) -> u128 {
        self.params[index]
    }

    fn call(&mut self, _func: usize, _args: &[u128]) {
        unimplemented!("calls are not interpreted")
    }

    fn emit_if<F>(&mut self, cond: u128, then: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if cond != 0 {
            then(self)?;
        }
        Ok(())
    }
}
