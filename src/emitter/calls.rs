use super::buffer::CodeBuffer;
use super::encoding::{encode_inst, encode_s32_inst, encode_u32_inst, encode_u32_u32_inst};
use super::function::FunctionEmitter;
use crate::analysis::HostBuiltin;
use crate::error::{Error, Result};
use crate::ir::{
    CallInst, Callee, Constant, FuncRef, InstKind, Intrinsic, IrType, ValueDef, ValueId,
};

impl<'a> FunctionEmitter<'a> {
    /// A call is in tail position when the block's return hands back
    /// exactly this call's result and the signatures agree on the
    /// return type.
    pub(crate) fn is_tail_call(&self, call_v: ValueId) -> bool {
        let Some(inst) = self.function.inst(call_v) else {
            return false;
        };
        let InstKind::Call(call) = &inst.kind else {
            return false;
        };
        let block = self.function.block(inst.block);
        let len = block.insts.len();
        if len < 2 || block.insts[len - 2] != call_v {
            return false;
        }
        let Some(term) = self.function.inst(block.insts[len - 1]) else {
            return false;
        };
        let InstKind::Ret { value } = &term.kind else {
            return false;
        };
        let value = *value;
        let caller_ret = self.signature().ret;
        let callee_ret = match &call.callee {
            Callee::Direct(f) => {
                let callee = self.module.function(*f);
                self.module.signature(callee.sig).ret
            }
            Callee::Indirect { sig, .. } => self.module.signature(*sig).ret,
            Callee::Intrinsic(_) => return false,
        };
        if caller_ret != callee_ret {
            return false;
        }
        match value {
            Some(ret) => ret == call_v,
            None => caller_ret == IrType::Void,
        }
    }

    /// Whether this return only closes off a call that was emitted as
    /// `return_call`.
    pub(crate) fn is_return_part_of_tail_call(&self, ret_v: ValueId) -> bool {
        let Some(inst) = self.function.inst(ret_v) else {
            return false;
        };
        let block = self.function.block(inst.block);
        let len = block.insts.len();
        if len < 2 {
            return false;
        }
        let prev = block.insts[len - 2];
        matches!(
            self.function.inst(prev).map(|i| &i.kind),
            Some(InstKind::Call(_))
        ) && self.is_tail_call(prev)
    }

    pub(crate) fn compile_call(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        call: &CallInst,
    ) -> Result<bool> {
        let use_tail_call = self.is_tail_call(v);
        let mut direct: Option<FuncRef> = None;

        match &call.callee {
            Callee::Intrinsic(intrinsic) => {
                match intrinsic {
                    Intrinsic::Trap => {
                        encode_inst(code, 0x00, "unreachable");
                        return Ok(true);
                    }
                    Intrinsic::StackSave => {
                        encode_u32_inst(code, 0x23, "global.get", self.plan.stack_top_global);
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    Intrinsic::StackRestore => {
                        self.compile_operand(code, call.args[0])?;
                        encode_u32_inst(code, 0x24, "global.set", self.plan.stack_top_global);
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                        }
                        return Ok(true);
                    }
                    Intrinsic::VaCopy => {
                        self.compile_operand(code, call.args[0])?;
                        self.compile_operand(code, call.args[1])?;
                        encode_u32_u32_inst(code, 0x28, "i32.load", 2, 0);
                        encode_u32_u32_inst(code, 0x36, "i32.store", 2, 0);
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                        }
                        return Ok(true);
                    }
                    Intrinsic::VaEnd => {
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                        }
                        return Ok(true);
                    }
                    Intrinsic::Downcast | Intrinsic::Virtualcast => {
                        self.compile_downcast(code, call)?;
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    Intrinsic::DowncastCurrent | Intrinsic::UpcastCollapsed => {
                        self.compile_operand(code, call.args[0])?;
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    Intrinsic::CastUser => {
                        if self.use_empty(v) {
                            return Ok(true);
                        }
                        self.compile_operand(code, call.args[0])?;
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    Intrinsic::GrowMemory => {
                        self.compile_operand(code, call.args[0])?;
                        if self.options.use_wasm_loader {
                            let imported = self.layout.builtin_id(HostBuiltin::GrowMem)?;
                            if use_tail_call {
                                encode_u32_inst(code, 0x12, "return_call", imported);
                                return Ok(true);
                            }
                            encode_u32_inst(code, 0x10, "call", imported);
                        } else {
                            // memory.grow on the only memory
                            encode_u32_inst(code, 0x40, "memory.grow", 0);
                            if use_tail_call {
                                encode_inst(code, 0x0F, "return");
                                return Ok(true);
                            }
                        }
                        return Ok(false);
                    }
                    Intrinsic::FltRounds => {
                        // Rounding mode 1: nearest
                        encode_s32_inst(code, 0x41, "i32.const", 1);
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    Intrinsic::Memcpy | Intrinsic::Memmove | Intrinsic::Memset => {
                        let name = match intrinsic {
                            Intrinsic::Memcpy => "memcpy",
                            Intrinsic::Memmove => "memmove",
                            _ => "memset",
                        };
                        for &arg in call.args.iter().take(3) {
                            self.compile_operand(code, arg)?;
                        }
                        let func = self.runtime_function(name)?;
                        let id = self.defined_function_id(func, name)?;
                        encode_u32_inst(code, 0x10, "call", id);
                        encode_inst(code, 0x1A, "drop");
                        // The runtime signature returns the pointer, so
                        // this can never be a real tail call.
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                        }
                        return Ok(true);
                    }
                    Intrinsic::Allocate | Intrinsic::AllocateArray => {
                        direct = Some(self.runtime_function("malloc")?);
                    }
                    Intrinsic::Reallocate => {
                        direct = Some(self.runtime_function("realloc")?);
                    }
                    Intrinsic::Deallocate => {
                        direct = Some(self.runtime_function("free")?);
                    }
                    Intrinsic::Ctlz
                    | Intrinsic::Fabs
                    | Intrinsic::Ceil
                    | Intrinsic::Floor
                    | Intrinsic::FTrunc
                    | Intrinsic::Sqrt
                    | Intrinsic::MinNum
                    | Intrinsic::MaxNum
                    | Intrinsic::CopySign => {
                        for &arg in &call.args {
                            self.compile_operand(code, arg)?;
                        }
                        self.encode_wasm_math_opcode(code, v, intrinsic)?;
                        if use_tail_call {
                            encode_inst(code, 0x0F, "return");
                        }
                        return Ok(use_tail_call);
                    }
                    Intrinsic::Sin
                    | Intrinsic::Cos
                    | Intrinsic::Tan
                    | Intrinsic::Asin
                    | Intrinsic::Acos
                    | Intrinsic::Atan
                    | Intrinsic::Atan2
                    | Intrinsic::Exp
                    | Intrinsic::Log
                    | Intrinsic::Pow => {
                        if let Some(builtin) = host_math_builtin(intrinsic) {
                            if self.options.math_mode == crate::MathMode::JsBuiltins {
                                return self.compile_math_builtin_call(
                                    code,
                                    v,
                                    call,
                                    builtin,
                                    use_tail_call,
                                );
                            }
                        }
                        direct = Some(self.libm_function(v, intrinsic)?);
                    }
                    Intrinsic::Unknown(name) => {
                        return Err(Error::codegen(format!("unknown intrinsic `{name}`")));
                    }
                }
            }
            Callee::Direct(f) => direct = Some(*f),
            Callee::Indirect { .. } => {}
        }

        for &arg in &call.args {
            self.compile_operand(code, arg)?;
        }

        if let Some(f) = direct {
            match self.layout.function_id(f) {
                Some(id) => {
                    if use_tail_call {
                        encode_u32_inst(code, 0x12, "return_call", id);
                        return Ok(true);
                    }
                    encode_u32_inst(code, 0x10, "call", id);
                }
                None => {
                    tracing::warn!(
                        function = %self.module.function(f).name,
                        "call to a function without a body or import"
                    );
                    encode_inst(code, 0x00, "unreachable");
                    return Ok(true);
                }
            }
        } else if let Callee::Indirect { ptr, sig } = &call.callee {
            match self.layout.function_tables.get(sig) {
                Some(table) => {
                    let type_index = table.type_index;
                    self.compile_operand(code, *ptr)?;
                    if use_tail_call {
                        encode_u32_u32_inst(code, 0x13, "return_call_indirect", type_index, 0);
                        return Ok(true);
                    }
                    encode_u32_u32_inst(code, 0x11, "call_indirect", type_index, 0);
                }
                None => {
                    // No table for this signature: the program can only
                    // trap here at runtime.
                    encode_inst(code, 0x00, "unreachable");
                    return Ok(true);
                }
            }
        }

        if self.ir_type_of(v) == IrType::Void {
            return Ok(true);
        }
        Ok(false)
    }

    /// Base-plus-offset adjustment shared by downcast and virtualcast.
    fn compile_downcast(&mut self, code: &mut CodeBuffer, call: &CallInst) -> Result<()> {
        self.compile_operand(code, call.args[0])?;
        let offset = call.args[1];
        let offset_is_zero = matches!(
            self.function.value(offset),
            ValueDef::Const(c) if c.is_null_value()
        );
        if !offset_is_zero {
            self.compile_operand(code, offset)?;
            encode_inst(code, 0x6A, "i32.add");
        }
        Ok(())
    }

    /// Call an imported host math builtin, promoting f32 arguments to
    /// the f64 the host expects and demoting the result back.
    fn compile_math_builtin_call(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
        call: &CallInst,
        builtin: HostBuiltin,
        use_tail_call: bool,
    ) -> Result<bool> {
        let float_type = self.ir_type_of(v) == IrType::F32;
        for &arg in &call.args {
            self.compile_operand(code, arg)?;
            if float_type {
                encode_inst(code, 0xBB, "f64.promote_f32");
            }
        }
        let imported = self.layout.builtin_id(builtin)?;
        encode_u32_inst(code, 0x10, "call", imported);
        if float_type {
            encode_inst(code, 0xB6, "f32.demote_f64");
        }
        if use_tail_call {
            encode_inst(code, 0x0F, "return");
            return Ok(true);
        }
        Ok(false)
    }

    fn encode_wasm_math_opcode(
        &self,
        code: &mut CodeBuffer,
        v: ValueId,
        intrinsic: &Intrinsic,
    ) -> Result<()> {
        if matches!(intrinsic, Intrinsic::Ctlz) {
            encode_inst(code, 0x67, "i32.clz");
            return Ok(());
        }
        let is_f64 = self.ir_type_of(v) == IrType::F64;
        let (f32_op, f64_op, f32_name, f64_name) = match intrinsic {
            Intrinsic::Fabs => (0x8B, 0x99, "f32.abs", "f64.abs"),
            Intrinsic::Ceil => (0x8D, 0x9B, "f32.ceil", "f64.ceil"),
            Intrinsic::Floor => (0x8E, 0x9C, "f32.floor", "f64.floor"),
            Intrinsic::FTrunc => (0x8F, 0x9D, "f32.trunc", "f64.trunc"),
            Intrinsic::Sqrt => (0x91, 0x9F, "f32.sqrt", "f64.sqrt"),
            Intrinsic::MinNum => (0x96, 0xA4, "f32.min", "f64.min"),
            Intrinsic::MaxNum => (0x97, 0xA5, "f32.max", "f64.max"),
            Intrinsic::CopySign => (0x98, 0xA6, "f32.copysign", "f64.copysign"),
            other => {
                return Err(Error::internal(format!(
                    "intrinsic {other:?} has no dedicated wasm opcode"
                )));
            }
        };
        if is_f64 {
            encode_inst(code, f64_op, f64_name);
        } else {
            encode_inst(code, f32_op, f32_name);
        }
        Ok(())
    }

    /// Resolve a required runtime symbol; its absence is fatal.
    fn runtime_function(&self, name: &str) -> Result<FuncRef> {
        self.module
            .function_by_name(name)
            .ok_or_else(|| Error::codegen(format!("missing runtime symbol `{name}`")))
    }

    /// Resolve the libm implementation backing a math intrinsic, trying
    /// the float-suffixed spelling for f32 results first.
    fn libm_function(&self, v: ValueId, intrinsic: &Intrinsic) -> Result<FuncRef> {
        let base = match intrinsic {
            Intrinsic::Sin => "sin",
            Intrinsic::Cos => "cos",
            Intrinsic::Tan => "tan",
            Intrinsic::Asin => "asin",
            Intrinsic::Acos => "acos",
            Intrinsic::Atan => "atan",
            Intrinsic::Atan2 => "atan2",
            Intrinsic::Exp => "exp",
            Intrinsic::Log => "log",
            Intrinsic::Pow => "pow",
            other => {
                return Err(Error::internal(format!("{other:?} is not a libm intrinsic")));
            }
        };
        if self.ir_type_of(v) == IrType::F32 {
            let suffixed = format!("{base}f");
            if let Some(f) = self.module.function_by_name(&suffixed) {
                return Ok(f);
            }
        }
        self.module
            .function_by_name(base)
            .ok_or_else(|| Error::codegen(format!("missing runtime symbol `{base}`")))
    }

    fn defined_function_id(&self, f: FuncRef, name: &str) -> Result<u32> {
        self.layout
            .function_id(f)
            .ok_or_else(|| Error::codegen(format!("runtime symbol `{name}` has no function id")))
    }
}

fn host_math_builtin(intrinsic: &Intrinsic) -> Option<HostBuiltin> {
    match intrinsic {
        // sin and cos stay on the module implementation; the host call
        // is slower than the table-based libm there.
        Intrinsic::Sin | Intrinsic::Cos => None,
        Intrinsic::Tan => Some(HostBuiltin::Tan),
        Intrinsic::Asin => Some(HostBuiltin::Asin),
        Intrinsic::Acos => Some(HostBuiltin::Acos),
        Intrinsic::Atan => Some(HostBuiltin::Atan),
        Intrinsic::Atan2 => Some(HostBuiltin::Atan2),
        Intrinsic::Exp => Some(HostBuiltin::Exp),
        Intrinsic::Log => Some(HostBuiltin::Log),
        Intrinsic::Pow => Some(HostBuiltin::Pow),
        _ => None,
    }
}
