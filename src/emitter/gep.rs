use super::buffer::CodeBuffer;
use super::encoding::{encode_inst, encode_s32_inst};
use super::function::FunctionEmitter;
use crate::analysis::{const_bytes, AddrListener};
use crate::error::{Error, Result};
use crate::ir::{Constant, GepBase, GepExpr, InstKind, ValueDef, ValueId};

/// Receives the folded terms of an address computation, mirroring the
/// callbacks the linear-memory helper drives while walking a GEP chain.
pub(crate) trait GepListener {
    fn add_value(&mut self, v: ValueId, size: u32);
    fn sub_value(&mut self, v: ValueId, size: u32);
    fn add_const(&mut self, v: i64);
}

/// Replay a folded address computation into a listener, returning the
/// base pointer the terms accumulate onto.
pub(crate) fn walk_gep(expr: &GepExpr, listener: &mut dyn GepListener) -> GepBase {
    for &(v, size) in &expr.added {
        listener.add_value(v, size);
    }
    for &(v, size) in &expr.subbed {
        listener.sub_value(v, size);
    }
    if expr.const_part != 0 {
        listener.add_const(expr.const_part);
    }
    expr.base
}

/// Accumulates scaled terms and emits them as
/// `Σ added − Σ subbed + const`.
#[derive(Default)]
pub(crate) struct WasmGepWriter {
    pub(crate) added_values: Vec<(ValueId, u32)>,
    pub(crate) subbed_values: Vec<(ValueId, u32)>,
    pub(crate) const_part: i64,
}

impl GepListener for WasmGepWriter {
    fn add_value(&mut self, v: ValueId, size: u32) {
        self.added_values.push((v, size));
    }

    fn sub_value(&mut self, v: ValueId, size: u32) {
        self.subbed_values.push((v, size));
    }

    fn add_const(&mut self, v: i64) {
        self.const_part += v;
    }
}

impl WasmGepWriter {
    /// Fold a constant base into the constant part.
    pub(crate) fn add_const(&mut self, v: i64) {
        self.const_part += v;
    }
}

impl<'a> FunctionEmitter<'a> {
    /// Emit one scaled term. Power-of-two scales become shifts.
    fn compile_scaled_value(&mut self, code: &mut CodeBuffer, v: ValueId, size: u32) -> Result<()> {
        self.compile_operand(code, v)?;
        if size > 1 {
            if size.is_power_of_two() {
                encode_s32_inst(code, 0x41, "i32.const", size.trailing_zeros() as i32);
                encode_inst(code, 0x74, "i32.shl");
            } else {
                encode_s32_inst(code, 0x41, "i32.const", size as i32);
                encode_inst(code, 0x6C, "i32.mul");
            }
        }
        Ok(())
    }

    /// Emit the accumulated terms. Returns true when nothing was pushed,
    /// so the caller knows the stack is still empty.
    pub(crate) fn compile_gep_values(
        &mut self,
        code: &mut CodeBuffer,
        writer: &WasmGepWriter,
        use_const_part: bool,
    ) -> Result<bool> {
        let mut first = true;
        for &(v, size) in &writer.added_values {
            self.compile_scaled_value(code, v, size)?;
            if !first {
                encode_inst(code, 0x6A, "i32.add");
            }
            first = false;
        }
        if use_const_part && writer.const_part != 0 {
            let imm = i32::try_from(writer.const_part)
                .map_err(|_| Error::codegen("address constant exceeds the 32-bit range"))?;
            encode_s32_inst(code, 0x41, "i32.const", imm);
            if !first {
                encode_inst(code, 0x6A, "i32.add");
            }
            first = false;
        }
        if writer.subbed_values.is_empty() {
            return Ok(first);
        }
        // Subtraction needs a minuend on the stack.
        if first {
            encode_s32_inst(code, 0x41, "i32.const", 0);
        }
        for &(v, size) in &writer.subbed_values {
            self.compile_scaled_value(code, v, size)?;
            encode_inst(code, 0x6B, "i32.sub");
        }
        Ok(false)
    }

    /// Emit a GEP as a standalone address value. Non-inlineable GEPs go
    /// through their local unless the caller is compiling the definition
    /// itself.
    pub(crate) fn compile_gep(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        standalone: bool,
    ) -> Result<()> {
        if !self.is_inlineable(v) && !standalone {
            return self.compile_get_local(code, v);
        }
        let Some(InstKind::Gep(expr)) = self.function.inst(v).map(|inst| &inst.kind) else {
            return Err(Error::internal("compile_gep called on a non-GEP value"));
        };
        let expr = expr.clone();
        let mut writer = WasmGepWriter::default();
        let base = walk_gep(&expr, &mut writer);
        match base {
            GepBase::Global(g) => {
                let address = self.layout.global_address(g)?;
                writer.add_const(i64::from(address));
            }
            GepBase::Null => {}
            GepBase::Value(base) => writer.add_value(base, 1),
        }
        let empty = self.compile_gep_values(code, &writer, true)?;
        if empty {
            // Every term folded away; the address is zero.
            encode_s32_inst(code, 0x41, "i32.const", 0);
        }
        Ok(())
    }

    /// Absolute address of a constant pointer, when it has one.
    fn constant_pointer_address(&self, c: &Constant) -> Option<u32> {
        let mut listener = AddrListener::default();
        const_bytes(c, self.layout, &mut listener).ok()?;
        Some(listener.addr)
    }

    /// Emit the address part of a load or store and return the unsigned
    /// offset to fold into the opcode immediate. A negative folded
    /// constant cannot live in the immediate, so it stays in the
    /// computed address instead.
    pub(crate) fn compile_load_store_pointer(
        &mut self,
        code: &mut CodeBuffer,
        ptr: ValueId,
    ) -> Result<u32> {
        if self.is_inlineable(ptr)
            && matches!(
                self.function.inst(ptr).map(|inst| &inst.kind),
                Some(InstKind::Gep(_))
            )
        {
            let Some(InstKind::Gep(expr)) = self.function.inst(ptr).map(|inst| &inst.kind) else {
                unreachable!();
            };
            let expr = expr.clone();
            let mut writer = WasmGepWriter::default();
            let base = walk_gep(&expr, &mut writer);
            match base {
                GepBase::Global(g) => {
                    let address = self.layout.global_address(g)?;
                    writer.add_const(i64::from(address));
                }
                GepBase::Null => {}
                GepBase::Value(base) => writer.add_value(base, 1),
            }
            let negative_const_part = writer.const_part < 0;
            let first = self.compile_gep_values(code, &writer, negative_const_part)?;
            if negative_const_part {
                if first {
                    encode_s32_inst(code, 0x41, "i32.const", 0);
                }
                return Ok(0);
            }
            if first {
                encode_s32_inst(code, 0x41, "i32.const", 0);
            }
            let offset = u32::try_from(writer.const_part)
                .map_err(|_| Error::codegen("address constant exceeds the 32-bit range"))?;
            return Ok(offset);
        }

        if let ValueDef::Const(c) = self.function.value(ptr) {
            let c = c.clone();
            let globalized = self.plan.constant_global_id(&c).is_some();
            if !globalized {
                if let Some(address) = self.constant_pointer_address(&c) {
                    encode_s32_inst(code, 0x41, "i32.const", 0);
                    return Ok(address);
                }
            }
        }

        self.compile_operand(code, ptr)?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{walk_gep, GepListener, WasmGepWriter};
    use crate::ir::{GepBase, GepExpr, ValueId};

    #[test]
    fn walk_replays_terms_in_order_and_returns_the_base() {
        let expr = GepExpr {
            added: vec![(ValueId(1), 4), (ValueId(2), 1)],
            subbed: vec![(ValueId(3), 8)],
            const_part: -12,
            base: GepBase::Value(ValueId(0)),
        };
        let mut writer = WasmGepWriter::default();
        let base = walk_gep(&expr, &mut writer);
        assert_eq!(writer.added_values, vec![(ValueId(1), 4), (ValueId(2), 1)]);
        assert_eq!(writer.subbed_values, vec![(ValueId(3), 8)]);
        assert_eq!(writer.const_part, -12);
        assert_eq!(base, GepBase::Value(ValueId(0)));
    }

    #[test]
    fn zero_const_part_is_not_reported() {
        let expr = GepExpr {
            added: Vec::new(),
            subbed: Vec::new(),
            const_part: 0,
            base: GepBase::Null,
        };
        struct Panics;
        impl GepListener for Panics {
            fn add_value(&mut self, _: ValueId, _: u32) {}
            fn sub_value(&mut self, _: ValueId, _: u32) {}
            fn add_const(&mut self, _: i64) {
                panic!("const part of zero must be skipped");
            }
        }
        walk_gep(&expr, &mut Panics);
    }
}
