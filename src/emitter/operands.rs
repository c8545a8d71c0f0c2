use super::buffer::CodeBuffer;
use super::encoding::{encode_inst, encode_s32_inst, encode_u32_inst};
use super::function::FunctionEmitter;
use crate::error::Result;
use crate::ir::{
    BinOp, CastOp, Constant, InstKind, IntPredicate, IrType, ValueDef, ValueId,
};

/// Low `width` bits set, as the i32 immediate the mask is emitted with.
pub(crate) fn mask_for_width(width: u32) -> i32 {
    if width >= 32 {
        return -1;
    }
    ((1u64 << width) - 1) as u32 as i32
}

/// Sign-extend the low `width` bits of a raw constant payload.
pub(crate) fn sign_extend(value: i64, width: u32) -> i64 {
    if width >= 64 {
        return value;
    }
    (value << (64 - width)) >> (64 - width)
}

impl<'a> FunctionEmitter<'a> {
    /// Put one operand on the stack: constants inline (or through their
    /// promoted global), inlineable producers emit in place, registered
    /// values go through `local.get` or the tee peephole.
    pub(crate) fn compile_operand(&mut self, code: &mut CodeBuffer, v: ValueId) -> Result<()> {
        match self.function.value(v) {
            ValueDef::Const(c) => {
                if let Some(id) = self.plan.constant_global_id(c) {
                    encode_u32_inst(code, 0x23, "global.get", id);
                } else {
                    let c = c.clone();
                    self.compile_constant(code, &c, false)?;
                }
                Ok(())
            }
            ValueDef::Inst(_) => {
                if self.is_inlineable(v) {
                    let consumed = self.compile_instruction(code, v)?;
                    debug_assert!(!consumed, "inlineable producers leave their value on the stack");
                    Ok(())
                } else {
                    self.compile_get_local(code, v)
                }
            }
            ValueDef::Param { index } => {
                encode_u32_inst(code, 0x20, "local.get", *index);
                Ok(())
            }
        }
    }

    /// Emit `v` with signed semantics. Values narrower than 32 bits have
    /// unspecified high bits, so a signed consumer needs an explicit
    /// shl/shr_s pair; comparisons can keep both sides shifted and skip
    /// the arithmetic shift back.
    pub(crate) fn compile_signed_integer(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        for_comparison: bool,
    ) -> Result<()> {
        let width = self.int_width_of(v);
        let shift = 32 - width.min(32);
        if let ValueDef::Const(Constant::Int { value, .. }) = self.function.value(v) {
            let mut imm = sign_extend(*value, width) as i32;
            if for_comparison {
                imm <<= shift;
            }
            encode_s32_inst(code, 0x41, "i32.const", imm);
            return Ok(());
        }

        self.compile_operand(code, v)?;
        if shift == 0 {
            return Ok(());
        }
        if for_comparison {
            encode_s32_inst(code, 0x41, "i32.const", shift as i32);
            encode_inst(code, 0x74, "i32.shl");
        } else {
            encode_s32_inst(code, 0x41, "i32.const", shift as i32);
            encode_inst(code, 0x74, "i32.shl");
            encode_s32_inst(code, 0x41, "i32.const", shift as i32);
            encode_inst(code, 0x75, "i32.shr_s");
        }
        Ok(())
    }

    /// Emit `v` with unsigned semantics, masking the high bits unless the
    /// producer provably left them clear.
    pub(crate) fn compile_unsigned_integer(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
    ) -> Result<()> {
        let width = self.int_width_of(v);
        if let ValueDef::Const(Constant::Int { value, .. }) = self.function.value(v) {
            let imm = (*value as u64 & (mask_for_width(width.min(32)) as u32 as u64)) as u32 as i32;
            encode_s32_inst(code, 0x41, "i32.const", imm);
            return Ok(());
        }

        self.compile_operand(code, v)?;
        if width < 32 && self.needs_unsigned_truncation(v) {
            encode_s32_inst(code, 0x41, "i32.const", mask_for_width(width));
            encode_inst(code, 0x71, "i32.and");
        }
        Ok(())
    }

    /// Whether a narrow value may carry garbage in its high bits.
    pub(crate) fn needs_unsigned_truncation(&self, v: ValueId) -> bool {
        match self.function.value(v) {
            ValueDef::Const(Constant::Int { .. }) => false,
            ValueDef::Const(_) => true,
            ValueDef::Inst(inst) => match &inst.kind {
                // Unsigned narrow loads zero-extend natively.
                InstKind::Load { .. } => self.is_signed_load(v),
                InstKind::Cast {
                    op: CastOp::ZExt, ..
                } => false,
                InstKind::ICmp { .. } | InstKind::FCmp { .. } => false,
                InstKind::Binary {
                    op: BinOp::And,
                    lhs,
                    rhs,
                } => {
                    let width = self.int_width_of(v);
                    let mask = mask_for_width(width) as i64;
                    ![*lhs, *rhs].iter().any(|op| {
                        matches!(
                            self.function.value(*op),
                            ValueDef::Const(Constant::Int { value, .. }) if *value & !mask == 0
                        )
                    })
                }
                InstKind::Binary {
                    op: BinOp::URem | BinOp::LShr,
                    lhs,
                    ..
                } => self.needs_unsigned_truncation(*lhs),
                _ => true,
            },
            ValueDef::Param { .. } => true,
        }
    }

    /// A load is signed when every user wants sign-extended bits, so the
    /// sign-extending load opcode does the work once.
    pub(crate) fn is_signed_load(&self, v: ValueId) -> bool {
        let Some(inst) = self.function.inst(v) else {
            return false;
        };
        let InstKind::Load { ptr } = &inst.kind else {
            return false;
        };
        let ptr = *ptr;
        // Promoted globals read through global.get, which has no
        // sign-extending flavour.
        if let ValueDef::Const(Constant::GlobalAddr(g)) = self.function.value(ptr) {
            if self.plan.global_is_promoted(*g) {
                return false;
            }
        }
        self.users_of(v).iter().all(|&user| {
            self.function.inst(user).is_some_and(|i| match &i.kind {
                InstKind::Cast {
                    op: CastOp::SExt, ..
                } => true,
                InstKind::ICmp { pred, .. } => pred.is_signed(),
                _ => false,
            })
        })
    }

    /// Stack distance to the nearest tee candidate reachable through `v`,
    /// `u32::MAX` when there is none. Drives commutative operand swaps.
    pub(crate) fn find_depth(&self, v: ValueId) -> u32 {
        let Some(inst) = self.function.inst(v) else {
            return u32::MAX;
        };
        if self.is_inlineable(v) {
            let ops = inst.kind.operands();
            let Some(&first) = ops.first() else {
                return u32::MAX;
            };
            let mut res = self.find_depth(first);
            if let InstKind::Binary { op, rhs, .. } = &inst.kind {
                if op.is_commutative() {
                    res = res.min(self.find_depth(*rhs));
                }
            }
            res
        } else {
            self.tee_locals.find_depth(v).unwrap_or(u32::MAX)
        }
    }

    /// Emit a branch condition, folding comparisons into the branch and
    /// inverting the predicate instead of negating the result where
    /// possible.
    pub(crate) fn compile_condition(
        &mut self,
        code: &mut CodeBuffer,
        cond: ValueId,
        boolean_invert: bool,
    ) -> Result<()> {
        let can_invert = self.is_inlineable(cond);
        let kind = self.function.inst(cond).map(|inst| inst.kind.clone());

        match kind {
            Some(InstKind::ICmp { pred, lhs, rhs }) if can_invert => {
                let mut p = pred;
                if boolean_invert {
                    p = p.inverse();
                }
                let mut op0 = lhs;
                let mut op1 = rhs;
                if matches!(p, IntPredicate::Eq | IntPredicate::Ne)
                    && matches!(self.function.value(op0), ValueDef::Const(_))
                {
                    std::mem::swap(&mut op0, &mut op1);
                }
                let op1_is_null = matches!(
                    self.function.value(op1),
                    ValueDef::Const(c) if c.is_null_value()
                );
                if matches!(p, IntPredicate::Eq | IntPredicate::Ne) && op1_is_null {
                    let ty = self.ir_type_of(op0);
                    if ty.is_pointer() {
                        self.compile_operand(code, op0)?;
                    } else if ty == IrType::I32 {
                        self.compile_signed_integer(code, op0, true)?;
                    } else {
                        self.compile_unsigned_integer(code, op0)?;
                    }
                    if p == IntPredicate::Eq {
                        encode_inst(code, 0x45, "i32.eqz");
                    }
                    self.tee_locals.remove_consumed();
                    return Ok(());
                }
                self.compile_icmp(code, op0, op1, p)?;
            }
            Some(InstKind::FCmp { pred, lhs, rhs }) if can_invert => {
                let p = if boolean_invert { pred.inverse() } else { pred };
                self.compile_fcmp(code, lhs, rhs, p)?;
            }
            _ => {
                self.compile_operand(code, cond)?;
                if boolean_invert {
                    encode_inst(code, 0x45, "i32.eqz");
                }
            }
        }
        self.tee_locals.remove_consumed();
        Ok(())
    }
}
