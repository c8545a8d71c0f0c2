use super::buffer::CodeBuffer;
use super::encoding::{
    encode_f32_const, encode_f64_const, encode_inst, encode_s32_inst, encode_u32_inst,
};
use super::function::FunctionEmitter;
use crate::error::{Error, Result};
use crate::ir::{ConstExpr, Constant, IrType};

impl<'a> FunctionEmitter<'a> {
    /// Emit a constant as explicit opcodes. Wide integer constants are
    /// accepted only when they fit the i32 range; aggregates never reach
    /// code, they exist for data-section bytes.
    pub(crate) fn compile_constant(
        &mut self,
        code: &mut CodeBuffer,
        constant: &Constant,
        for_global_init: bool,
    ) -> Result<()> {
        // Init expressions use the same lowering; the flag only matters
        // for diagnostics when an unsupported shape shows up there.
        let _ = for_global_init;
        match constant {
            Constant::Expr(expr) => self.compile_const_expr(code, expr),
            Constant::Int { value, ty } => {
                let imm = match ty {
                    IrType::I64 => i32::try_from(*value).map_err(|_| {
                        Error::codegen(format!(
                            "64-bit constant {value} does not fit the i32 range"
                        ))
                    })?,
                    IrType::I32 => *value as i32,
                    _ => {
                        let width = ty.int_width().unwrap_or(32);
                        (*value as u64 & ((1u64 << width) - 1)) as u32 as i32
                    }
                };
                encode_s32_inst(code, 0x41, "i32.const", imm);
                Ok(())
            }
            Constant::Float { .. } => {
                if let Some(value) = constant.as_f32() {
                    encode_f32_const(code, value);
                } else if let Some(value) = constant.as_f64() {
                    encode_f64_const(code, value);
                } else {
                    return Err(Error::internal("float constant with a non-float type"));
                }
                Ok(())
            }
            Constant::GlobalAddr(g) => {
                let address = self.layout.global_address(*g)?;
                encode_s32_inst(code, 0x41, "i32.const", address as i32);
                Ok(())
            }
            Constant::Null => {
                encode_s32_inst(code, 0x41, "i32.const", 0);
                Ok(())
            }
            Constant::FuncAddr(f) => {
                if self.layout.function_has_address(*f) {
                    let address = self.layout.function_address(*f)?;
                    encode_s32_inst(code, 0x41, "i32.const", address as i32);
                } else {
                    // An indirectly referenced function without a body
                    // collapses to the null table slot.
                    tracing::warn!(
                        function = %self.module.function(*f).name,
                        "function pointer to a never-address-taken function lowered to null"
                    );
                    encode_s32_inst(code, 0x41, "i32.const", 0);
                }
                Ok(())
            }
            Constant::Undef(ty) => {
                match ty {
                    IrType::F64 => encode_f64_const(code, 0.0),
                    IrType::F32 => encode_f32_const(code, 0.0),
                    _ => encode_s32_inst(code, 0x41, "i32.const", 0),
                }
                Ok(())
            }
            Constant::Aggregate(_) | Constant::Zeroes(_) => Err(Error::codegen(
                "aggregate constants cannot be materialised as operands",
            )),
        }
    }

    /// Recurse into a constant operand, consulting the globalization
    /// plan like any other operand.
    fn compile_const_operand(&mut self, code: &mut CodeBuffer, c: &Constant) -> Result<()> {
        if let Some(id) = self.plan.constant_global_id(c) {
            encode_u32_inst(code, 0x23, "global.get", id);
            return Ok(());
        }
        self.compile_constant(code, c, false)
    }

    /// Constant expressions lower to the equivalent opcode sequence at
    /// every use site.
    pub(crate) fn compile_const_expr(
        &mut self,
        code: &mut CodeBuffer,
        expr: &ConstExpr,
    ) -> Result<()> {
        match expr {
            ConstExpr::Add(lhs, rhs) => {
                self.compile_const_operand(code, lhs)?;
                self.compile_const_operand(code, rhs)?;
                encode_inst(code, 0x6A, "i32.add");
            }
            ConstExpr::Sub(lhs, rhs) => {
                self.compile_const_operand(code, lhs)?;
                self.compile_const_operand(code, rhs)?;
                encode_inst(code, 0x6B, "i32.sub");
            }
            ConstExpr::And(lhs, rhs) => {
                self.compile_const_operand(code, lhs)?;
                self.compile_const_operand(code, rhs)?;
                encode_inst(code, 0x71, "i32.and");
            }
            ConstExpr::Or(lhs, rhs) => {
                self.compile_const_operand(code, lhs)?;
                self.compile_const_operand(code, rhs)?;
                encode_inst(code, 0x72, "i32.or");
            }
            ConstExpr::Gep { base, offset } => {
                self.compile_const_operand(code, base)?;
                if *offset != 0 {
                    let imm = i32::try_from(*offset).map_err(|_| {
                        Error::codegen("constant address offset exceeds the 32-bit range")
                    })?;
                    encode_s32_inst(code, 0x41, "i32.const", imm);
                    encode_inst(code, 0x6A, "i32.add");
                }
            }
            // Pointer representation casts carry no code.
            ConstExpr::Bitcast(inner) | ConstExpr::IntToPtr(inner) | ConstExpr::PtrToInt(inner) => {
                self.compile_const_operand(code, inner)?;
            }
            ConstExpr::ICmp { pred, lhs, rhs } => {
                self.compile_const_operand(code, lhs)?;
                self.compile_const_operand(code, rhs)?;
                self.encode_int_predicate(code, *pred);
            }
            ConstExpr::Select {
                cond,
                if_true,
                if_false,
            } => {
                self.compile_const_operand(code, if_true)?;
                self.compile_const_operand(code, if_false)?;
                self.compile_const_operand(code, cond)?;
                encode_inst(code, 0x1B, "select");
            }
        }
        Ok(())
    }
}
