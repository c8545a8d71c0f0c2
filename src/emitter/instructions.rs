use super::buffer::CodeBuffer;
use super::encoding::{
    encode_f32_const, encode_inst, encode_s32_inst, encode_s64_inst, encode_u32_inst,
    encode_u32_u32_inst,
};
use super::function::FunctionEmitter;
use super::operands::mask_for_width;
use crate::error::{Error, Result};
use crate::ir::{
    BinOp, CastOp, Constant, FloatPredicate, InstKind, IntPredicate, IrType, ValueDef, ValueId,
};

fn is_negative_zero(c: &Constant) -> bool {
    match c {
        Constant::Float {
            bits,
            ty: IrType::F32,
        } => *bits == 0x8000_0000,
        Constant::Float {
            bits,
            ty: IrType::F64,
        } => *bits == 0x8000_0000_0000_0000,
        _ => false,
    }
}

impl<'a> FunctionEmitter<'a> {
    /// Emit one instruction. Returns true when the result has already
    /// been consumed (void results, returns, stores, traps), so the
    /// caller knows not to route it through a local.
    pub(crate) fn compile_instruction(&mut self, code: &mut CodeBuffer, v: ValueId) -> Result<bool> {
        let kind = self
            .function
            .inst(v)
            .ok_or_else(|| Error::internal("compile_instruction on a non-instruction value"))?
            .kind
            .clone();
        match kind {
            InstKind::Binary {
                op: BinOp::FRem,
                lhs,
                rhs,
            } => {
                self.compile_frem(code, v, lhs, rhs)?;
                Ok(false)
            }
            InstKind::Binary { op, lhs, rhs } => {
                self.encode_bin_op(code, v, op, lhs, rhs)?;
                Ok(false)
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                self.compile_icmp(code, lhs, rhs, pred)?;
                Ok(false)
            }
            InstKind::FCmp { pred, lhs, rhs } => {
                self.compile_fcmp(code, lhs, rhs, pred)?;
                Ok(false)
            }
            InstKind::Load { ptr } => {
                if let ValueDef::Const(Constant::GlobalAddr(g)) = self.function.value(ptr) {
                    if let Some(id) = self.plan.promoted_global_id(*g) {
                        encode_u32_inst(code, 0x23, "global.get", id);
                        return Ok(false);
                    }
                }
                let sign_extend = self.is_signed_load(v);
                let offset = self.compile_load_store_pointer(code, ptr)?;
                self.encode_load(code, self.ir_type_of(v), offset, sign_extend);
                Ok(false)
            }
            InstKind::Store { ptr, value } => {
                self.compile_store(code, ptr, value)?;
                Ok(true)
            }
            InstKind::Gep(_) => {
                self.compile_gep(code, v, true)?;
                Ok(false)
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                self.compile_operand(code, if_true)?;
                self.compile_operand(code, if_false)?;
                self.compile_condition(code, cond, false)?;
                encode_inst(code, 0x1B, "select");
                Ok(false)
            }
            InstKind::Cast { op, value } => {
                self.compile_cast(code, v, op, value)?;
                Ok(false)
            }
            InstKind::Call(call) => self.compile_call(code, v, &call),
            InstKind::VaArg { list } => {
                // Read through the cursor, then bump it by one slot.
                self.compile_operand(code, list)?;
                encode_u32_u32_inst(code, 0x28, "i32.load", 2, 0);
                self.encode_load(code, self.ir_type_of(v), 0, false);
                self.compile_operand(code, list)?;
                self.compile_operand(code, list)?;
                encode_u32_u32_inst(code, 0x28, "i32.load", 2, 0);
                encode_s32_inst(code, 0x41, "i32.const", 8);
                encode_inst(code, 0x6A, "i32.add");
                encode_u32_u32_inst(code, 0x36, "i32.store", 2, 0);
                Ok(false)
            }
            InstKind::Ret { value } => {
                if let Some(ret) = value {
                    let skip = self.is_return_part_of_tail_call(v) && !self.is_inlineable(ret);
                    if !skip {
                        self.compile_operand(code, ret)?;
                    }
                }
                Ok(false)
            }
            // Branch shapes are rendered by the control lowering.
            InstKind::Jump { .. } | InstKind::CondBr { .. } | InstKind::Switch { .. } => Ok(false),
            InstKind::Unreachable => {
                encode_inst(code, 0x00, "unreachable");
                Ok(true)
            }
            InstKind::Phi { .. } => Err(Error::internal(
                "phis are resolved on edges, never compiled directly",
            )),
        }
    }

    fn encode_bin_op(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<()> {
        match op {
            BinOp::URem | BinOp::UDiv => {
                self.compile_unsigned_integer(code, lhs)?;
                self.compile_unsigned_integer(code, rhs)?;
            }
            BinOp::SRem | BinOp::SDiv => {
                self.compile_signed_integer(code, lhs, false)?;
                self.compile_signed_integer(code, rhs, false)?;
            }
            BinOp::LShr => {
                self.compile_unsigned_integer(code, lhs)?;
                self.compile_operand(code, rhs)?;
            }
            BinOp::AShr => {
                self.compile_signed_integer(code, lhs, false)?;
                self.compile_operand(code, rhs)?;
            }
            BinOp::FSub => {
                // (-0.0) - x is a plain negate; safe only for the
                // negative zero.
                if matches!(self.function.value(lhs), ValueDef::Const(c) if is_negative_zero(c)) {
                    self.compile_operand(code, rhs)?;
                    match self.ir_type_of(v) {
                        IrType::F32 => encode_inst(code, 0x8C, "f32.neg"),
                        IrType::F64 => encode_inst(code, 0x9A, "f64.neg"),
                        _ => return Err(Error::internal("fsub of a non-float type")),
                    }
                    return Ok(());
                }
                self.compile_operand(code, lhs)?;
                self.compile_operand(code, rhs)?;
            }
            _ => {
                // Favour an operand order that lets the peephole reuse
                // the most recently written local.
                if op.is_commutative() && self.find_depth(lhs) > self.find_depth(rhs) {
                    self.compile_operand(code, rhs)?;
                    self.compile_operand(code, lhs)?;
                } else {
                    self.compile_operand(code, lhs)?;
                    self.compile_operand(code, rhs)?;
                }
            }
        }

        let ty = self.ir_type_of(v);
        if ty.is_integer() || ty.is_pointer() {
            let (opcode, name) = match op {
                BinOp::Add => (0x6A, "i32.add"),
                BinOp::Sub => (0x6B, "i32.sub"),
                BinOp::Mul => (0x6C, "i32.mul"),
                BinOp::SDiv => (0x6D, "i32.div_s"),
                BinOp::UDiv => (0x6E, "i32.div_u"),
                BinOp::SRem => (0x6F, "i32.rem_s"),
                BinOp::URem => (0x70, "i32.rem_u"),
                BinOp::And => (0x71, "i32.and"),
                BinOp::Or => (0x72, "i32.or"),
                BinOp::Xor => (0x73, "i32.xor"),
                BinOp::Shl => (0x74, "i32.shl"),
                BinOp::AShr => (0x75, "i32.shr_s"),
                BinOp::LShr => (0x76, "i32.shr_u"),
                _ => return Err(Error::internal("float binop on an integer type")),
            };
            encode_inst(code, opcode, name);
        } else {
            let (f32_op, f64_op, f32_name, f64_name) = match op {
                BinOp::FAdd => (0x92, 0xA0, "f32.add", "f64.add"),
                BinOp::FSub => (0x93, 0xA1, "f32.sub", "f64.sub"),
                BinOp::FMul => (0x94, 0xA2, "f32.mul", "f64.mul"),
                BinOp::FDiv => (0x95, 0xA3, "f32.div", "f64.div"),
                _ => return Err(Error::internal("integer binop on a float type")),
            };
            match ty {
                IrType::F32 => encode_inst(code, f32_op, f32_name),
                IrType::F64 => encode_inst(code, f64_op, f64_name),
                _ => return Err(Error::internal("binop on an unsupported type")),
            }
        }
        Ok(())
    }

    /// `frem x, y` has no wasm opcode:
    /// `x - trunc(x / y) * y`.
    fn compile_frem(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<()> {
        let is_f32 = self.ir_type_of(v) == IrType::F32;
        let pick = |f32_pair: (u8, &'static str), f64_pair: (u8, &'static str)| {
            if is_f32 { f32_pair } else { f64_pair }
        };
        self.compile_operand(code, lhs)?;
        self.compile_operand(code, lhs)?;
        self.compile_operand(code, rhs)?;
        let (opcode, name) = pick((0x95, "f32.div"), (0xA3, "f64.div"));
        encode_inst(code, opcode, name);
        let (opcode, name) = pick((0x8F, "f32.trunc"), (0x9D, "f64.trunc"));
        encode_inst(code, opcode, name);
        self.compile_operand(code, rhs)?;
        let (opcode, name) = pick((0x94, "f32.mul"), (0xA2, "f64.mul"));
        encode_inst(code, opcode, name);
        let (opcode, name) = pick((0x93, "f32.sub"), (0xA1, "f64.sub"));
        encode_inst(code, opcode, name);
        Ok(())
    }

    pub(crate) fn encode_int_predicate(&self, code: &mut CodeBuffer, pred: IntPredicate) {
        let (opcode, name) = match pred {
            IntPredicate::Eq => (0x46, "i32.eq"),
            IntPredicate::Ne => (0x47, "i32.ne"),
            IntPredicate::Slt => (0x48, "i32.lt_s"),
            IntPredicate::Ult => (0x49, "i32.lt_u"),
            IntPredicate::Sgt => (0x4A, "i32.gt_s"),
            IntPredicate::Ugt => (0x4B, "i32.gt_u"),
            IntPredicate::Sle => (0x4C, "i32.le_s"),
            IntPredicate::Ule => (0x4D, "i32.le_u"),
            IntPredicate::Sge => (0x4E, "i32.ge_s"),
            IntPredicate::Uge => (0x4F, "i32.ge_u"),
        };
        encode_inst(code, opcode, name);
    }

    pub(crate) fn compile_icmp(
        &mut self,
        code: &mut CodeBuffer,
        op0: ValueId,
        op1: ValueId,
        pred: IntPredicate,
    ) -> Result<()> {
        let mut op0 = op0;
        let mut op1 = op1;
        let mut use_eqz = false;
        if pred == IntPredicate::Eq {
            if matches!(self.function.value(op0), ValueDef::Const(_)) {
                std::mem::swap(&mut op0, &mut op1);
            }
            if matches!(self.function.value(op1), ValueDef::Const(c) if c.is_null_value()) {
                use_eqz = true;
            }
        }
        let ty0 = self.ir_type_of(op0);
        if ty0.is_pointer() {
            self.compile_operand(code, op0)?;
            if use_eqz {
                encode_inst(code, 0x45, "i32.eqz");
                return Ok(());
            }
            self.compile_operand(code, op1)?;
        } else if pred.is_signed() {
            let op0_signed = self.is_signed_load(op0);
            let op1_signed = self.is_signed_load(op1);
            // The shifted-compare trick only works when both sides shift.
            let for_comparison = !op0_signed && !op1_signed;
            if op0_signed {
                self.compile_operand(code, op0)?;
            } else {
                self.compile_signed_integer(code, op0, for_comparison)?;
            }
            if op1_signed {
                self.compile_operand(code, op1)?;
            } else {
                self.compile_signed_integer(code, op1, for_comparison)?;
            }
        } else if pred.is_unsigned() || ty0 != IrType::I32 {
            self.compile_unsigned_integer(code, op0)?;
            if use_eqz {
                encode_inst(code, 0x45, "i32.eqz");
                return Ok(());
            }
            self.compile_unsigned_integer(code, op1)?;
        } else {
            self.compile_signed_integer(code, op0, true)?;
            if use_eqz {
                encode_inst(code, 0x45, "i32.eqz");
                return Ok(());
            }
            self.compile_signed_integer(code, op1, true)?;
        }
        self.encode_int_predicate(code, pred);
        Ok(())
    }

    pub(crate) fn compile_fcmp(
        &mut self,
        code: &mut CodeBuffer,
        lhs: ValueId,
        rhs: ValueId,
        pred: FloatPredicate,
    ) -> Result<()> {
        let is_f64 = self.ir_type_of(lhs) == IrType::F64;
        let eq: (u8, &str) = if is_f64 { (0x61, "f64.eq") } else { (0x5B, "f32.eq") };
        let ne: (u8, &str) = if is_f64 { (0x62, "f64.ne") } else { (0x5C, "f32.ne") };
        match pred {
            FloatPredicate::Ord => {
                // NaN is the only value not equal to itself.
                self.compile_operand(code, lhs)?;
                self.compile_operand(code, lhs)?;
                encode_inst(code, eq.0, eq.1);
                self.compile_operand(code, rhs)?;
                self.compile_operand(code, rhs)?;
                encode_inst(code, eq.0, eq.1);
                encode_inst(code, 0x71, "i32.and");
            }
            FloatPredicate::Uno => {
                self.compile_operand(code, lhs)?;
                self.compile_operand(code, lhs)?;
                encode_inst(code, ne.0, ne.1);
                self.compile_operand(code, rhs)?;
                self.compile_operand(code, rhs)?;
                encode_inst(code, ne.0, ne.1);
                encode_inst(code, 0x72, "i32.or");
            }
            _ => {
                self.compile_operand(code, lhs)?;
                self.compile_operand(code, rhs)?;
                // Unordered predicates invert the ordered compare and
                // negate the result.
                let invert = pred.is_unordered();
                let p = if invert { pred.inverse() } else { pred };
                let (f32_op, f64_op, f32_name, f64_name) = match p {
                    FloatPredicate::Oeq => (0x5B, 0x61, "f32.eq", "f64.eq"),
                    FloatPredicate::One => (0x5C, 0x62, "f32.ne", "f64.ne"),
                    FloatPredicate::Olt => (0x5D, 0x63, "f32.lt", "f64.lt"),
                    FloatPredicate::Ogt => (0x5E, 0x64, "f32.gt", "f64.gt"),
                    FloatPredicate::Ole => (0x5F, 0x65, "f32.le", "f64.le"),
                    FloatPredicate::Oge => (0x60, 0x66, "f32.ge", "f64.ge"),
                    _ => return Err(Error::internal("unordered predicate after inversion")),
                };
                if is_f64 {
                    encode_inst(code, f64_op, f64_name);
                } else {
                    encode_inst(code, f32_op, f32_name);
                }
                if invert {
                    encode_inst(code, 0x45, "i32.eqz");
                }
            }
        }
        Ok(())
    }

    /// Pick the load opcode by width and signedness.
    pub(crate) fn encode_load(
        &self,
        code: &mut CodeBuffer,
        ty: IrType,
        offset: u32,
        sign_extend: bool,
    ) {
        match ty {
            IrType::I1 | IrType::I8 => {
                if sign_extend {
                    encode_u32_u32_inst(code, 0x2C, "i32.load8_s", 0, offset);
                } else {
                    encode_u32_u32_inst(code, 0x2D, "i32.load8_u", 0, offset);
                }
            }
            IrType::I16 => {
                if sign_extend {
                    encode_u32_u32_inst(code, 0x2E, "i32.load16_s", 1, offset);
                } else {
                    encode_u32_u32_inst(code, 0x2F, "i32.load16_u", 1, offset);
                }
            }
            IrType::F32 => encode_u32_u32_inst(code, 0x2A, "f32.load", 2, offset),
            IrType::F64 => encode_u32_u32_inst(code, 0x2B, "f64.load", 3, offset),
            _ => encode_u32_u32_inst(code, 0x28, "i32.load", 2, offset),
        }
    }

    fn compile_store(&mut self, code: &mut CodeBuffer, ptr: ValueId, value: ValueId) -> Result<()> {
        if let ValueDef::Const(Constant::GlobalAddr(g)) = self.function.value(ptr) {
            if let Some(id) = self.plan.promoted_global_id(*g) {
                self.compile_operand(code, value)?;
                encode_u32_inst(code, 0x24, "global.set", id);
                return Ok(());
            }
        }
        let offset = self.compile_load_store_pointer(code, ptr)?;
        let value_ty = self.ir_type_of(value);

        // A float zero stores cheaper through the integer lane.
        let is_zero_const = matches!(
            self.function.value(value),
            ValueDef::Const(c) if c.is_null_value()
        );
        if value_ty.is_float() && is_zero_const {
            if value_ty == IrType::F32 {
                encode_s32_inst(code, 0x41, "i32.const", 0);
                encode_u32_u32_inst(code, 0x36, "i32.store", 2, offset);
            } else {
                encode_s64_inst(code, 0x42, "i64.const", 0);
                encode_u32_u32_inst(code, 0x37, "i64.store", 3, offset);
            }
            return Ok(());
        }

        self.compile_operand(code, value)?;
        match value_ty {
            IrType::I1 | IrType::I8 => encode_u32_u32_inst(code, 0x3A, "i32.store8", 0, offset),
            IrType::I16 => encode_u32_u32_inst(code, 0x3B, "i32.store16", 1, offset),
            IrType::F32 => encode_u32_u32_inst(code, 0x38, "f32.store", 2, offset),
            IrType::F64 => encode_u32_u32_inst(code, 0x39, "f64.store", 3, offset),
            _ => encode_u32_u32_inst(code, 0x36, "i32.store", 2, offset),
        }
        Ok(())
    }

    fn compile_cast(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        op: CastOp,
        value: ValueId,
    ) -> Result<()> {
        match op {
            // The i32 representation keeps narrow values as-is; the next
            // consumer truncates when it has to.
            CastOp::Trunc | CastOp::Bitcast | CastOp::IntToPtr | CastOp::PtrToInt => {
                self.compile_operand(code, value)
            }
            CastOp::ZExt => self.compile_unsigned_integer(code, value),
            CastOp::SExt => {
                self.compile_operand(code, value)?;
                if !self.is_signed_load(value) {
                    let shift = 32 - self.int_width_of(value);
                    encode_s32_inst(code, 0x41, "i32.const", shift as i32);
                    encode_inst(code, 0x74, "i32.shl");
                    encode_s32_inst(code, 0x41, "i32.const", shift as i32);
                    encode_inst(code, 0x75, "i32.shr_s");
                }
                Ok(())
            }
            CastOp::FpToSi => self.compile_fp_to_si(code, value),
            CastOp::FpToUi => self.compile_fp_to_ui(code, value),
            CastOp::SiToFp => {
                self.compile_operand(code, value)?;
                let width = self.int_width_of(value);
                if width != 32 && !self.is_signed_load(value) {
                    encode_s32_inst(code, 0x41, "i32.const", (32 - width) as i32);
                    encode_inst(code, 0x74, "i32.shl");
                    encode_s32_inst(code, 0x41, "i32.const", (32 - width) as i32);
                    encode_inst(code, 0x75, "i32.shr_s");
                }
                if self.ir_type_of(v) == IrType::F64 {
                    encode_inst(code, 0xB7, "f64.convert_i32_s");
                } else {
                    encode_inst(code, 0xB2, "f32.convert_i32_s");
                }
                Ok(())
            }
            CastOp::UiToFp => {
                self.compile_operand(code, value)?;
                let width = self.int_width_of(value);
                if width != 32 {
                    encode_s32_inst(code, 0x41, "i32.const", mask_for_width(width));
                    encode_inst(code, 0x71, "i32.and");
                }
                if self.ir_type_of(v) == IrType::F64 {
                    encode_inst(code, 0xB8, "f64.convert_i32_u");
                } else {
                    encode_inst(code, 0xB3, "f32.convert_i32_u");
                }
                Ok(())
            }
            CastOp::FpTrunc => {
                self.compile_operand(code, value)?;
                encode_inst(code, 0xB6, "f32.demote_f64");
                Ok(())
            }
            CastOp::FpExt => {
                self.compile_operand(code, value)?;
                encode_inst(code, 0xBB, "f64.promote_f32");
                Ok(())
            }
        }
    }

    /// `i32.trunc_s` traps out of range. When traps are avoided, guard
    /// with a magnitude check and fall back to INT_MIN, the value the
    /// undefined case collapses to.
    fn compile_fp_to_si(&mut self, code: &mut CodeBuffer, value: ValueId) -> Result<()> {
        let is_f32 = self.ir_type_of(value) == IrType::F32;
        if !self.options.avoid_wasm_traps {
            self.compile_operand(code, value)?;
            if is_f32 {
                encode_inst(code, 0xA8, "i32.trunc_f32_s");
            } else {
                encode_inst(code, 0xAA, "i32.trunc_f64_s");
            }
            return Ok(());
        }
        self.compile_operand(code, value)?;
        if is_f32 {
            encode_inst(code, 0x8B, "f32.abs");
            encode_f32_const(code, 2147483648.0);
            encode_inst(code, 0x5D, "f32.lt");
        } else {
            encode_inst(code, 0x99, "f64.abs");
            encode_f32_const(code, 2147483648.0);
            encode_inst(code, 0xBB, "f64.promote_f32");
            encode_inst(code, 0x63, "f64.lt");
        }
        encode_u32_inst(code, 0x04, "if", 0x7F);
        self.compile_operand(code, value)?;
        if is_f32 {
            encode_inst(code, 0xA8, "i32.trunc_f32_s");
        } else {
            encode_inst(code, 0xAA, "i32.trunc_f64_s");
        }
        encode_inst(code, 0x05, "else");
        encode_s32_inst(code, 0x41, "i32.const", i32::MIN);
        encode_inst(code, 0x0B, "end");
        Ok(())
    }

    fn compile_fp_to_ui(&mut self, code: &mut CodeBuffer, value: ValueId) -> Result<()> {
        let is_f32 = self.ir_type_of(value) == IrType::F32;
        if !self.options.avoid_wasm_traps {
            self.compile_operand(code, value)?;
            if is_f32 {
                encode_inst(code, 0xA9, "i32.trunc_f32_u");
            } else {
                encode_inst(code, 0xAB, "i32.trunc_f64_u");
            }
            return Ok(());
        }
        self.compile_operand(code, value)?;
        if is_f32 {
            encode_f32_const(code, 4294967296.0);
            encode_inst(code, 0x5D, "f32.lt");
            self.compile_operand(code, value)?;
            encode_f32_const(code, 0.0);
            encode_inst(code, 0x60, "f32.ge");
        } else {
            encode_f32_const(code, 4294967296.0);
            encode_inst(code, 0xBB, "f64.promote_f32");
            encode_inst(code, 0x63, "f64.lt");
            self.compile_operand(code, value)?;
            encode_f32_const(code, 0.0);
            encode_inst(code, 0xBB, "f64.promote_f32");
            encode_inst(code, 0x66, "f64.ge");
        }
        encode_inst(code, 0x71, "i32.and");
        encode_u32_inst(code, 0x04, "if", 0x7F);
        self.compile_operand(code, value)?;
        if is_f32 {
            encode_inst(code, 0xA9, "i32.trunc_f32_u");
        } else {
            encode_inst(code, 0xAB, "i32.trunc_f64_u");
        }
        encode_inst(code, 0x05, "else");
        encode_s32_inst(code, 0x41, "i32.const", 0);
        encode_inst(code, 0x0B, "end");
        Ok(())
    }
}
