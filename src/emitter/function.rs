use std::collections::{BTreeSet, HashMap, HashSet};

use super::buffer::CodeBuffer;
use super::encoding::{encode_inst, encode_literal_zero, encode_u32_inst, leb_len_u32, write_u32};
use super::globalize::GlobalizationPlan;
use super::tee::TeeLocals;
use super::value_kind::{map_reg_kind, map_value_type, ValueType};
use super::wat::signature_text;
use crate::analysis::{Cfg, FunctionAnalysis, MemoryLayout, RegKind};
use crate::error::{Error, Result};
use crate::ir::{
    BlockId, FuncRef, Function, InstKind, IrType, Module, Signature, ValueDef, ValueId,
};
use crate::{EmitterOptions, OutputMode};

/// Emits one function body. All mutable state is owned here, so function
/// compilations are independent of each other; the analyses and the
/// globalization plan are shared immutably.
pub(crate) struct FunctionEmitter<'a> {
    pub(crate) module: &'a Module,
    pub(crate) function: &'a Function,
    pub(crate) analysis: &'a FunctionAnalysis,
    pub(crate) layout: &'a MemoryLayout,
    pub(crate) options: &'a EmitterOptions,
    pub(crate) plan: &'a GlobalizationPlan,

    /// Register id to local index, parameters first.
    pub(crate) local_map: Vec<u32>,
    /// Run-length local declaration, one entry per non-empty kind group.
    local_groups: Vec<(ValueType, u32)>,
    /// The relooper's dispatch local, when the CFG needs one.
    pub(crate) label_local: Option<u32>,
    /// Scratch locals reserved for PHI swap cycles, one per kind.
    swap_locals: HashMap<ValueType, u32>,

    pub(crate) tee_locals: TeeLocals,
    /// Users of each value, computed once per function.
    users: Vec<Vec<ValueId>>,

    // Per-basic-block state, cleared after each block.
    pub(crate) current_block: Option<BlockId>,
    pub(crate) memory_dependencies: HashMap<ValueId, BTreeSet<ValueId>>,
    pub(crate) locals_dependencies: HashMap<ValueId, BTreeSet<ValueId>>,
    pub(crate) compiled: HashSet<ValueId>,
    pub(crate) get_local_done: HashSet<ValueId>,
}

impl<'a> FunctionEmitter<'a> {
    pub(crate) fn new(
        module: &'a Module,
        func_ref: FuncRef,
        analysis: &'a FunctionAnalysis,
        layout: &'a MemoryLayout,
        options: &'a EmitterOptions,
        plan: &'a GlobalizationPlan,
    ) -> Result<Self> {
        let function = module.function(func_ref);
        let mut emitter = Self {
            module,
            function,
            analysis,
            layout,
            options,
            plan,
            local_map: Vec::new(),
            local_groups: Vec::new(),
            label_local: None,
            swap_locals: HashMap::new(),
            tee_locals: TeeLocals::default(),
            users: Vec::new(),
            current_block: None,
            memory_dependencies: HashMap::new(),
            locals_dependencies: HashMap::new(),
            compiled: HashSet::new(),
            get_local_done: HashSet::new(),
        };
        emitter.compute_users();
        emitter.plan_locals()?;
        Ok(emitter)
    }

    pub(crate) fn signature(&self) -> &Signature {
        self.module.signature(self.function.sig)
    }

    fn compute_users(&mut self) {
        self.users = vec![Vec::new(); self.function.values.len()];
        for def in self.function.values.iter().enumerate() {
            if let (index, ValueDef::Inst(inst)) = def {
                for op in inst.kind.operands() {
                    self.users[op.0 as usize].push(ValueId(index as u32));
                }
            }
        }
    }

    pub(crate) fn users_of(&self, v: ValueId) -> &[ValueId] {
        &self.users[v.0 as usize]
    }

    pub(crate) fn use_empty(&self, v: ValueId) -> bool {
        self.users[v.0 as usize].is_empty()
    }

    /// PHIs and terminators are never inlineable, whatever the analysis
    /// says; everything else follows the inlining decision.
    pub(crate) fn is_inlineable(&self, v: ValueId) -> bool {
        if let Some(inst) = self.function.inst(v) {
            if inst.kind.is_terminator() || matches!(inst.kind, InstKind::Phi { .. }) {
                return false;
            }
            return self.analysis.is_inlineable(v);
        }
        false
    }

    pub(crate) fn ir_type_of(&self, v: ValueId) -> IrType {
        self.function.value_type(v, &self.module.signatures)
    }

    pub(crate) fn value_type_of(&self, v: ValueId) -> Result<ValueType> {
        map_value_type(self.ir_type_of(v), self.analysis.pointer_kind(v))
    }

    /// Bit width of an integer value, treating pointers as 32.
    pub(crate) fn int_width_of(&self, v: ValueId) -> u32 {
        self.ir_type_of(v).int_width().unwrap_or(32)
    }

    /// The local mapped to a non-inlineable value's register.
    pub(crate) fn local_of(&self, v: ValueId) -> Result<u32> {
        let reg = self.analysis.registers.register_of(v)?;
        self.local_map
            .get(reg as usize)
            .copied()
            .ok_or_else(|| Error::internal(format!("register {reg} is outside the local map")))
    }

    pub(crate) fn swap_local(&self, ty: ValueType) -> Result<u32> {
        self.swap_locals
            .get(&ty)
            .copied()
            .ok_or_else(|| Error::internal("phi cycle met without a reserved scratch local"))
    }

    /// Lay out locals: parameters occupy `[0, num_args)`, then registers
    /// grouped by kind so the declaration compresses into run-length
    /// groups, then the scratch and label extras.
    fn plan_locals(&mut self) -> Result<()> {
        let num_args = super::ensure_u32(
            self.signature().params.len(),
            "argument count exceeds WebAssembly limits",
        )?;
        let regs = &self.analysis.registers;

        let group_order = [
            RegKind::Integer,
            RegKind::Double,
            RegKind::Float,
            RegKind::Object,
        ];
        let mut counts: HashMap<RegKind, u32> = HashMap::new();
        for &kind in &regs.kinds {
            *counts.entry(kind).or_insert(0) += 1;
        }

        let needs_label = self.options.use_cfg_legacy
            && matches!(&self.analysis.cfg, Cfg::Relooper(shape) if shape.needs_label());
        let swap_kinds = self.phi_swap_kinds()?;

        // Totals per group, extras included.
        let mut totals: HashMap<RegKind, u32> = counts.clone();
        for &kind in &swap_kinds {
            *totals.entry(kind).or_insert(0) += 1;
        }
        if needs_label {
            *totals.entry(RegKind::Integer).or_insert(0) += 1;
        }

        let mut group_base: HashMap<RegKind, u32> = HashMap::new();
        let mut running = num_args;
        for &kind in &group_order {
            group_base.insert(kind, running);
            running = running
                .checked_add(totals.get(&kind).copied().unwrap_or(0))
                .ok_or_else(|| Error::codegen("local count exceeds WebAssembly limits"))?;
        }

        let mut next_in_group: HashMap<RegKind, u32> = HashMap::new();
        self.local_map = Vec::with_capacity(regs.kinds.len());
        for &kind in &regs.kinds {
            let slot = next_in_group.entry(kind).or_insert(0);
            self.local_map.push(group_base[&kind] + *slot);
            *slot += 1;
        }
        for &kind in &swap_kinds {
            let slot = next_in_group.entry(kind).or_insert(0);
            self.swap_locals
                .insert(map_reg_kind(kind)?, group_base[&kind] + *slot);
            *slot += 1;
        }
        if needs_label {
            let slot = next_in_group.entry(RegKind::Integer).or_insert(0);
            self.label_local = Some(group_base[&RegKind::Integer] + *slot);
            *slot += 1;
        }

        self.local_groups = group_order
            .iter()
            .filter_map(|&kind| {
                let total = totals.get(&kind).copied().unwrap_or(0);
                if total == 0 {
                    return None;
                }
                Some(map_reg_kind(kind).map(|ty| (ty, total)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Register kinds that participate in a PHI swap cycle on some edge,
    /// and therefore need a scratch local to break the cycle.
    fn phi_swap_kinds(&self) -> Result<Vec<RegKind>> {
        let mut kinds = Vec::new();
        let regs = &self.analysis.registers;
        for (to_index, block) in self.function.blocks.iter().enumerate() {
            let to = BlockId(to_index as u32);
            let mut froms = BTreeSet::new();
            for &inst_id in &block.insts {
                if let Some(inst) = self.function.inst(inst_id) {
                    if let InstKind::Phi { incoming } = &inst.kind {
                        froms.extend(incoming.iter().map(|(from, _)| *from));
                    }
                }
            }
            for from in froms {
                let mut move_srcs: HashMap<u32, u32> = HashMap::new();
                for &inst_id in &block.insts {
                    let Some(inst) = self.function.inst(inst_id) else {
                        continue;
                    };
                    let InstKind::Phi { incoming } = &inst.kind else {
                        continue;
                    };
                    let Some(&(_, value)) = incoming.iter().find(|(f, _)| *f == from) else {
                        continue;
                    };
                    if !regs.has_register(inst_id) || !regs.has_register(value) {
                        continue;
                    }
                    let dst = regs.register_of(inst_id)?;
                    let src = regs.register_on_edge(value, from, to)?;
                    if dst != src {
                        move_srcs.insert(dst, src);
                    }
                }
                // A register on a cycle is both written and read by the
                // parallel copy. Walk each source chain; only confirmed
                // cycle members are excluded from later walks.
                let mut on_cycle: HashSet<u32> = HashSet::new();
                for &start in move_srcs.keys() {
                    if on_cycle.contains(&start) {
                        continue;
                    }
                    let mut seen = vec![start];
                    let mut curr = start;
                    while let Some(&next) = move_srcs.get(&curr) {
                        if next == start {
                            if seen.len() > 1 {
                                on_cycle.extend(seen.iter().copied());
                                let kind = regs.kind_of(start);
                                if !kinds.contains(&kind) {
                                    kinds.push(kind);
                                }
                            }
                            break;
                        }
                        if seen.contains(&next) {
                            break;
                        }
                        seen.push(next);
                        curr = next;
                    }
                }
            }
        }
        Ok(kinds)
    }

    /// Emit the complete function body: locals declaration, code and the
    /// trailing `end`, with the NOP filter applied.
    pub(crate) fn emit_body(&mut self) -> Result<Vec<u8>> {
        let mut code = CodeBuffer::new(self.options.mode);
        wasm_debug!(
            "emit_body: `{}` ({} blocks, {} locals)",
            self.function.name,
            self.function.blocks.len(),
            self.local_map.len()
        );

        if code.mode() == OutputMode::Wast {
            code.push_str(&format!(
                "(func ${}{}\n",
                self.function.name,
                signature_text(self.signature())
            ));
        }
        self.emit_locals_declaration(&mut code);
        self.tee_locals.perform_initialization();
        self.tee_locals.instruction_start(&code);

        let last_depth0_block = if self.function.blocks.len() == 1 {
            self.compile_bb(&mut code, BlockId(0))?;
            Some(BlockId(0))
        } else {
            match &self.analysis.cfg {
                Cfg::Tokens(tokens) => self.compile_tokens(&mut code, tokens)?,
                Cfg::Relooper(shape) => {
                    if !self.options.use_cfg_legacy {
                        return Err(Error::codegen(
                            "relooper shapes supplied while the stackifier is selected",
                        ));
                    }
                    self.render_relooper(&mut code, shape)?
                }
            }
        };

        if !self.options.use_cfg_legacy {
            self.check_implicit_assigned_phis()?;
            if code.is_binary() {
                self.generate_nops(&mut code);
            }
        }
        self.get_local_done.clear();
        self.tee_locals.clear();
        self.compiled.clear();

        let terminated = last_depth0_block.is_some_and(|bb| {
            self.function
                .block(bb)
                .insts
                .last()
                .and_then(|&id| self.function.inst(id))
                .is_some_and(|inst| {
                    matches!(inst.kind, InstKind::Ret { .. } | InstKind::Unreachable)
                })
        });
        let ret = self.signature().ret;
        if !terminated && ret != IrType::Void {
            let ty = map_value_type(ret, crate::analysis::PointerKind::ByteLayout)?;
            encode_literal_zero(&mut code, ty);
        }

        if code.is_binary() {
            code.push_byte(0x0B);
            code.filter_nops();
        } else {
            code.push_str(")\n");
        }
        Ok(code.into_bytes())
    }

    fn emit_locals_declaration(&self, code: &mut CodeBuffer) {
        if code.is_binary() {
            let mut tmp = Vec::new();
            write_u32(&mut tmp, self.local_groups.len() as u32);
            for &(ty, count) in &self.local_groups {
                write_u32(&mut tmp, count);
                tmp.push(ty.to_byte());
            }
            code.extend_from_slice(&tmp);
        } else if !self.local_groups.is_empty() {
            code.push_str("(local");
            for &(ty, count) in &self.local_groups {
                for _ in 0..count {
                    code.push_str(" ");
                    code.push_str(ty.name());
                }
            }
            code.push_str(")\n");
        }
    }

    /// Compile one basic block: build its dependency graphs, then render
    /// the non-inlineable instructions, values without in-block users
    /// first.
    pub(crate) fn compile_bb(&mut self, code: &mut CodeBuffer, bb: BlockId) -> Result<()> {
        debug_assert!(self.memory_dependencies.is_empty());
        debug_assert!(self.locals_dependencies.is_empty());
        debug_assert!(self.current_block.is_none());
        self.current_block = Some(bb);

        let deferred = self.build_block_dependencies(bb)?;
        self.check_and_sanitize_dependencies();

        for &v in &deferred {
            if self.should_defer(v) {
                self.compile_instruction_and_set(code, v)?;
            }
        }
        for &v in &deferred {
            self.compile_instruction_and_set(code, v)?;
        }

        self.current_block = None;
        self.memory_dependencies.clear();
        self.locals_dependencies.clear();
        Ok(())
    }

    /// An instruction with no user in its own block gains nothing from
    /// staying in source order; emitting it first keeps operand chains of
    /// the remaining instructions unbroken.
    fn should_defer(&self, v: ValueId) -> bool {
        let bb = self.current_block.expect("inside a block");
        !self.users_of(v).iter().any(|user| {
            self.function
                .inst(*user)
                .is_some_and(|inst| inst.block == bb)
        })
    }

    pub(crate) fn compile_instruction_and_set(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
    ) -> Result<()> {
        if self.compiled.contains(&v) {
            return Ok(());
        }
        let Some(inst) = self.function.inst(v) else {
            return Ok(());
        };
        if Some(inst.block) != self.current_block {
            return Ok(());
        }
        if matches!(inst.kind, InstKind::Phi { .. }) || self.is_inlineable(v) {
            return Ok(());
        }

        let needs_sub_stack = self.tee_locals.needs_sub_stack(code);
        if needs_sub_stack {
            self.tee_locals.add_indentation();
        }

        self.flush_memory_dependencies(code, v)?;

        debug_assert!(!self.compiled.contains(&v));
        self.compiled.insert(v);
        let consumed = self.compile_instruction(code, v)?;

        self.flush_locals_dependencies(code, v)?;

        self.tee_locals.remove_consumed();
        if needs_sub_stack {
            self.tee_locals.decrease_indentation();
        }

        if !consumed && self.ir_type_of(v) != IrType::Void {
            if self.use_empty(v) {
                encode_inst(code, 0x1A, "drop");
            } else {
                let local = self.local_of(v)?;
                self.tee_locals.add_candidate(v, true, local, code.tell());
                encode_u32_inst(code, 0x21, "local.set", local);
            }
        }
        self.tee_locals.instruction_start(code);
        Ok(())
    }

    /// Materialise a non-inlineable value on the stack, preferring the
    /// tee-local peephole over a plain `local.get`.
    pub(crate) fn compile_get_local(&mut self, code: &mut CodeBuffer, v: ValueId) -> Result<()> {
        self.compile_instruction_and_set(code, v)?;
        if self.tee_locals.try_put_tee_on_stack(code, v) {
            return Ok(());
        }
        let local = self.local_of(v)?;
        self.get_local_done.insert(v);
        encode_u32_inst(code, 0x20, "local.get", local);
        Ok(())
    }

    /// Rewrite instruction assignments whose local is never read. A
    /// claimed tee is a pure stack pass-through and vanishes; an
    /// unclaimed set still has to pop its value, so it becomes a drop.
    fn generate_nops(&mut self, code: &mut CodeBuffer) {
        let inserted: Vec<_> = self.tee_locals.local_inserted().to_vec();
        for site in inserted {
            if self.get_local_done.contains(&site.value) {
                continue;
            }
            let width = 1 + leb_len_u32(site.local_id);
            if self.tee_locals.is_value_used(site.value) {
                code.mark_nop_run(site.buffer_offset, width);
            } else {
                code.patch_byte(site.buffer_offset, 0x1A);
                code.mark_nop_run(site.buffer_offset + 1, width - 1);
            }
        }
    }
}
