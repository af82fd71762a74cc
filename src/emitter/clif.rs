//! Cranelift implementation of [`CodeEmitter`]
//!
//! Each `width`-bit value lives in the smallest Cranelift integer type that
//! holds it (`i8` .. `i128`), zero-extended. All memory traffic is explicitly
//! little-endian and makes no alignment promises, so the same code works for
//! packed and naturally aligned records.

use cranelift::codegen::ir::{Endianness, StackSlotData, StackSlotKind};
use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};

use super::{BinaryOp, CodeEmitter, CompareOp};
use crate::error::Result;

/// Cranelift type holding a `width`-bit value.
pub fn int_type(width: u32) -> Type {
    match width {
        0..=8 => types::I8,
        9..=16 => types::I16,
        17..=32 => types::I32,
        33..=64 => types::I64,
        _ => types::I128,
    }
}

fn mem_flags() -> MemFlags {
    MemFlags::new().with_notrap().with_endianness(Endianness::Little)
}

/// Emits one function body into a [`JITModule`].
pub struct ClifEmitter<'a, 'm> {
    builder: FunctionBuilder<'a>,
    module: &'m mut JITModule,
    entry: Block,
    ptr_ty: Type,
}

impl<'a, 'm> ClifEmitter<'a, 'm> {
    pub fn new(mut builder: FunctionBuilder<'a>, module: &'m mut JITModule) -> Self {
        let ptr_ty = module.target_config().pointer_type();
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        Self { builder, module, entry, ptr_ty }
    }

    /// Terminate the body and finalize the function.
    pub fn finish(mut self) {
        self.builder.ins().return_(&[]);
        self.builder.finalize();
    }

    fn truncate(&mut self, value: Value, width: u32) -> Value {
        let bits = int_type(width).bits();
        if width >= bits {
            return value;
        }
        if bits <= 64 {
            let mask = ((1u64 << width) - 1) as i64;
            self.builder.ins().band_imm(value, mask)
        } else {
            let unused = (bits - width) as i64;
            let up = self.builder.ins().ishl_imm(value, unused);
            self.builder.ins().ushr_imm(up, unused)
        }
    }

    /// Chunk sizes used to move `bytes` bytes with power-of-two accesses.
    fn chunks(bytes: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes {
            let remaining = bytes - pos;
            let size = if remaining == 16 && pos == 0 {
                16
            } else {
                [8, 4, 2, 1].into_iter().find(|s| *s <= remaining).unwrap_or(1)
            };
            out.push((pos, size));
            pos += size;
        }
        out
    }
}

impl CodeEmitter for ClifEmitter<'_, '_> {
    type Value = Value;
    type Func = FuncId;

    fn constant(&mut self, width: u32, value: u128) -> Value {
        let value = value & super::low_mask(width);
        let ty = int_type(width);
        if ty == types::I128 {
            let lo = self.builder.ins().iconst(types::I64, value as u64 as i64);
            let hi = self.builder.ins().iconst(types::I64, (value >> 64) as u64 as i64);
            self.builder.ins().iconcat(lo, hi)
        } else {
            self.builder.ins().iconst(ty, value as u64 as i64)
        }
    }

    fn binary(&mut self, op: BinaryOp, width: u32, lhs: Value, rhs: Value) -> Value {
        let result = match op {
            BinaryOp::Add => self.builder.ins().iadd(lhs, rhs),
            BinaryOp::Sub => self.builder.ins().isub(lhs, rhs),
            BinaryOp::Mul => self.builder.ins().imul(lhs, rhs),
            BinaryOp::And => self.builder.ins().band(lhs, rhs),
            BinaryOp::Or => self.builder.ins().bor(lhs, rhs),
            BinaryOp::Xor => self.builder.ins().bxor(lhs, rhs),
        };
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => self.truncate(result, width),
            _ => result,
        }
    }

    fn not(&mut self, width: u32, value: Value) -> Value {
        let inverted = self.builder.ins().bnot(value);
        self.truncate(inverted, width)
    }

    fn compare(&mut self, op: CompareOp, _width: u32, lhs: Value, rhs: Value) -> Value {
        let cc = match op {
            CompareOp::Eq => IntCC::Equal,
            CompareOp::Ne => IntCC::NotEqual,
        };
        self.builder.ins().icmp(cc, lhs, rhs)
    }

    fn select(&mut self, _width: u32, cond: Value, if_true: Value, if_false: Value) -> Value {
        self.builder.ins().select(cond, if_true, if_false)
    }

    fn shl(&mut self, width: u32, value: Value, amount: Value) -> Value {
        let shifted = self.builder.ins().ishl(value, amount);
        self.truncate(shifted, width)
    }

    fn lshr(&mut self, _width: u32, value: Value, amount: Value) -> Value {
        self.builder.ins().ushr(value, amount)
    }

    fn urem(&mut self, width: u32, value: Value, divisor: u64) -> Value {
        let divisor = self.builder.ins().iconst(int_type(width), divisor as i64);
        self.builder.ins().urem(value, divisor)
    }

    fn resize(&mut self, value: Value, from: u32, to: u32) -> Value {
        let from_ty = int_type(from);
        let to_ty = int_type(to);
        let value = if to_ty.bits() > from_ty.bits() {
            self.builder.ins().uextend(to_ty, value)
        } else if to_ty.bits() < from_ty.bits() {
            self.builder.ins().ireduce(to_ty, value)
        } else {
            value
        };
        if to < from {
            self.truncate(value, to)
        } else {
            value
        }
    }

    fn load(&mut self, ptr: Value, offset: i32, bytes: u32) -> Value {
        let ty = int_type(bytes * 8);
        if ty.bytes() == bytes {
            return self.builder.ins().load(ty, mem_flags(), ptr, offset);
        }
        let mut acc: Option<Value> = None;
        for (pos, size) in Self::chunks(bytes) {
            let chunk_ty = int_type(size * 8);
            let part = self.builder.ins().load(chunk_ty, mem_flags(), ptr, offset + pos as i32);
            let part = if chunk_ty == ty { part } else { self.builder.ins().uextend(ty, part) };
            let part = if pos > 0 { self.builder.ins().ishl_imm(part, (pos * 8) as i64) } else { part };
            acc = Some(match acc {
                Some(prev) => self.builder.ins().bor(prev, part),
                None => part,
            });
        }
        acc.unwrap_or_else(|| self.builder.ins().iconst(ty, 0))
    }

    fn store(&mut self, value: Value, ptr: Value, offset: i32, bytes: u32) {
        let ty = int_type(bytes * 8);
        if ty.bytes() == bytes {
            self.builder.ins().store(mem_flags(), value, ptr, offset);
            return;
        }
        for (pos, size) in Self::chunks(bytes) {
            let chunk_ty = int_type(size * 8);
            let part = if pos > 0 { self.builder.ins().ushr_imm(value, (pos * 8) as i64) } else { value };
            let part = if chunk_ty == ty { part } else { self.builder.ins().ireduce(chunk_ty, part) };
            self.builder.ins().store(mem_flags(), part, ptr, offset + pos as i32);
        }
    }

    fn offset_ptr(&mut self, ptr: Value, offset: i64) -> Value {
        if offset == 0 {
            return ptr;
        }
        self.builder.ins().iadd_imm(ptr, offset)
    }

    fn index_ptr(&mut self, ptr: Value, index: Value, index_width: u32) -> Value {
        let index = self.resize(index, index_width, 64);
        let index = if self.ptr_ty == types::I64 {
            index
        } else {
            self.builder.ins().ireduce(self.ptr_ty, index)
        };
        self.builder.ins().iadd(ptr, index)
    }

    fn stack_slot(&mut self, bytes: u32) -> Value {
        let slot = self
            .builder
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, bytes.max(1), 4));
        self.builder.ins().stack_addr(self.ptr_ty, slot, 0)
    }

    fn param(&mut self, index: usize) -> Value {
        self.builder.block_params(self.entry)[index]
    }

    fn call(&mut self, func: FuncId, args: &[Value]) {
        let callee = self.module.declare_func_in_func(func, self.builder.func);
        self.builder.ins().call(callee, args);
    }

    fn emit_if<F>(&mut self, cond: Value, then: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let then_block = self.builder.create_block();
        let merge_block = self.builder.create_block();
        self.builder.ins().brif(cond, then_block, &[], merge_block, &[]);

        self.builder.switch_to_block(then_block);
        self.builder.seal_block(then_block);
        then(self)?;
        self.builder.ins().jump(merge_block, &[]);

        self.builder.switch_to_block(merge_block);
        self.builder.seal_block(merge_block);
        Ok(())
    }
}
