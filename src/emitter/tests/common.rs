//! Shared fixtures: a small builder for SSA functions plus the analyses
//! the emitter consumes, and a harness that assembles test modules.

use std::collections::HashMap;

use crate::analysis::{
    Cfg, FunctionAnalysis, FunctionTable, MemoryLayout, ModuleAnalysis, PointerKind, RegKind,
    Registers,
};
use crate::emitter::{FunctionEmitter, GlobalizationPlan, ModuleWriter};
use crate::error::Result;
use crate::ir::{
    BasicBlock, BlockId, Constant, FuncRef, Function, GlobalVar, Inst, InstKind, IrType, Module,
    SigId, Signature, ValueDef, ValueId,
};
use crate::{EmitterOptions, OutputMode};

pub(crate) struct FunctionBuilder {
    name: String,
    signature: Signature,
    values: Vec<ValueDef>,
    blocks: Vec<BasicBlock>,
    current_block: Option<BlockId>,
    regs_by_value: Vec<Option<u32>>,
    reg_kinds: Vec<RegKind>,
    inlineable: Vec<bool>,
    cfg: Cfg,
}

impl FunctionBuilder {
    pub(crate) fn new(name: &str, params: Vec<IrType>, ret: IrType) -> Self {
        let mut builder = Self {
            name: name.to_string(),
            signature: Signature::new(params.clone(), ret),
            values: Vec::new(),
            blocks: Vec::new(),
            current_block: None,
            regs_by_value: Vec::new(),
            reg_kinds: Vec::new(),
            inlineable: Vec::new(),
            cfg: Cfg::Tokens(Vec::new()),
        };
        for index in 0..params.len() {
            builder.push_value(ValueDef::Param {
                index: index as u32,
            });
        }
        builder
    }

    fn push_value(&mut self, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(def);
        self.regs_by_value.push(None);
        self.inlineable.push(false);
        id
    }

    pub(crate) fn param(&self, index: u32) -> ValueId {
        ValueId(index)
    }

    pub(crate) fn constant(&mut self, c: Constant) -> ValueId {
        self.push_value(ValueDef::Const(c))
    }

    pub(crate) fn block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        self.current_block = Some(id);
        id
    }

    pub(crate) fn switch_to(&mut self, block: BlockId) {
        self.current_block = Some(block);
    }

    pub(crate) fn inst(&mut self, kind: InstKind, ty: IrType) -> ValueId {
        let block = self.current_block.expect("open a block before adding instructions");
        let id = self.push_value(ValueDef::Inst(Inst { kind, ty, block }));
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    /// Rewrite a PHI's incoming list once the edge blocks exist.
    pub(crate) fn patch_phi(&mut self, phi: ValueId, incoming: Vec<(BlockId, ValueId)>) {
        let ValueDef::Inst(inst) = &mut self.values[phi.0 as usize] else {
            panic!("patch_phi on a non-instruction value");
        };
        assert!(matches!(inst.kind, InstKind::Phi { .. }));
        inst.kind = InstKind::Phi { incoming };
    }

    /// Mark a value inlineable: folded into its consumer's operands.
    pub(crate) fn inline(&mut self, v: ValueId) -> ValueId {
        self.inlineable[v.0 as usize] = true;
        v
    }

    /// Put a value in the same register as another one.
    pub(crate) fn share_reg(&mut self, v: ValueId, with: ValueId) -> ValueId {
        self.regs_by_value[v.0 as usize] = self.regs_by_value[with.0 as usize];
        v
    }

    /// Assign the next register to a value.
    pub(crate) fn reg(&mut self, v: ValueId, kind: RegKind) -> ValueId {
        let reg = self.reg_kinds.len() as u32;
        self.reg_kinds.push(kind);
        self.regs_by_value[v.0 as usize] = Some(reg);
        v
    }

    pub(crate) fn tokens(&mut self, tokens: Vec<crate::analysis::Token>) {
        self.cfg = Cfg::Tokens(tokens);
    }

    pub(crate) fn relooper(&mut self, shape: crate::analysis::Shape) {
        self.cfg = Cfg::Relooper(shape);
    }

    pub(crate) fn finish(self) -> (Function, Signature, FunctionAnalysis) {
        let pointer_kinds = vec![PointerKind::ByteLayout; self.values.len()];
        let function = Function {
            name: self.name,
            sig: SigId(0),
            blocks: self.blocks,
            values: self.values,
        };
        let analysis = FunctionAnalysis {
            registers: Registers {
                by_value: self.regs_by_value,
                kinds: self.reg_kinds,
                on_edge: HashMap::new(),
            },
            inlineable: self.inlineable,
            pointer_kinds,
            cfg: self.cfg,
        };
        (function, self.signature, analysis)
    }
}

/// A module plus its analyses, ready for emission.
pub(crate) struct TestModule {
    pub(crate) module: Module,
    pub(crate) analysis: ModuleAnalysis,
    pub(crate) options: EmitterOptions,
}

impl TestModule {
    pub(crate) fn from_functions(parts: Vec<(Function, Signature, FunctionAnalysis)>) -> Self {
        let mut module = Module::default();
        let mut analysis = ModuleAnalysis::default();
        for (mut function, signature, fa) in parts {
            let sig_id = match module.signatures.iter().position(|s| *s == signature) {
                Some(index) => SigId(index as u32),
                None => {
                    module.signatures.push(signature);
                    SigId((module.signatures.len() - 1) as u32)
                }
            };
            function.sig = sig_id;
            let func_ref = FuncRef(module.functions.len() as u32);
            analysis
                .layout
                .function_ids
                .insert(func_ref, func_ref.0);
            module.functions.push(function);
            analysis.functions.push(fa);
        }
        analysis.layout.heap_start = 0x10000;
        analysis.layout.stack_start = 0x10000;
        Self {
            module,
            analysis,
            options: EmitterOptions::default(),
        }
    }

    pub(crate) fn from_function(part: (Function, Signature, FunctionAnalysis)) -> Self {
        Self::from_functions(vec![part])
    }

    pub(crate) fn add_global(&mut self, global: GlobalVar, address: u32) -> crate::ir::GlobalId {
        let id = crate::ir::GlobalId(self.module.globals.len() as u32);
        self.module.globals.push(global);
        self.analysis.layout.global_addresses.insert(id, address);
        id
    }

    pub(crate) fn add_table(&mut self, sig: SigId, functions: Vec<FuncRef>) {
        self.analysis.layout.function_tables.insert(
            sig,
            FunctionTable {
                type_index: sig.0,
                functions,
            },
        );
        self.analysis.layout.table_order.push(sig);
    }

    /// Emit one function's body bytes.
    pub(crate) fn emit_body(&self, name: &str) -> Result<Vec<u8>> {
        let func_ref = self
            .module
            .function_by_name(name)
            .unwrap_or_else(|| panic!("no function named `{name}` in the test module"));
        let plan = plan_for(&self.module, &self.analysis.layout);
        let mut emitter = FunctionEmitter::new(
            &self.module,
            func_ref,
            &self.analysis.functions[func_ref.0 as usize],
            &self.analysis.layout,
            &self.options,
            &plan,
        )?;
        emitter.emit_body()
    }

    /// Run a closure against a fresh emitter for `name`.
    pub(crate) fn with_emitter<R>(
        &self,
        name: &str,
        action: impl FnOnce(&mut FunctionEmitter<'_>) -> R,
    ) -> R {
        let func_ref = self
            .module
            .function_by_name(name)
            .unwrap_or_else(|| panic!("no function named `{name}` in the test module"));
        let plan = plan_for(&self.module, &self.analysis.layout);
        let mut emitter = FunctionEmitter::new(
            &self.module,
            func_ref,
            &self.analysis.functions[func_ref.0 as usize],
            &self.analysis.layout,
            &self.options,
            &plan,
        )
        .expect("construct function emitter");
        action(&mut emitter)
    }

    pub(crate) fn emit_module(&self) -> Result<Vec<u8>> {
        let writer = ModuleWriter::new(&self.module, &self.analysis, &self.options)?;
        writer.emit()
    }

    pub(crate) fn text_mode(mut self) -> Self {
        self.options.mode = OutputMode::Wast;
        self
    }
}

pub(crate) fn plan_for(module: &Module, layout: &MemoryLayout) -> GlobalizationPlan {
    crate::emitter::globalize::plan(module, layout)
}

/// A `define i32 @f() { ret i32 0 }` style single-return function.
pub(crate) fn const_return_function(name: &str, value: i32) -> (Function, Signature, FunctionAnalysis) {
    let mut builder = FunctionBuilder::new(name, Vec::new(), IrType::I32);
    builder.block();
    let zero = builder.constant(Constant::i32(value));
    builder.inst(InstKind::Ret { value: Some(zero) }, IrType::Void);
    builder.finish()
}
