use std::collections::HashMap;

use super::buffer::CodeBuffer;
use super::function::FunctionEmitter;
use crate::error::Result;
use crate::ir::{BlockId, Callee, InstKind, Intrinsic, ValueDef, ValueId};

/// Whether an instruction may observe or mutate memory. Inlineable
/// producers contribute their effects to the consumer that folds them.
fn kind_may_have_side_effects(kind: &InstKind) -> bool {
    match kind {
        InstKind::Store { .. } | InstKind::VaArg { .. } => true,
        InstKind::Call(call) => match &call.callee {
            Callee::Intrinsic(intrinsic) => intrinsic_has_side_effects(intrinsic),
            Callee::Direct(_) | Callee::Indirect { .. } => true,
        },
        InstKind::Unreachable => true,
        _ => false,
    }
}

fn kind_may_read_memory(kind: &InstKind) -> bool {
    match kind {
        InstKind::Load { .. } | InstKind::VaArg { .. } => true,
        InstKind::Call(call) => match &call.callee {
            Callee::Intrinsic(intrinsic) => intrinsic_reads_memory(intrinsic),
            Callee::Direct(_) | Callee::Indirect { .. } => true,
        },
        _ => false,
    }
}

fn intrinsic_has_side_effects(intrinsic: &Intrinsic) -> bool {
    match intrinsic {
        Intrinsic::Trap
        | Intrinsic::StackRestore
        | Intrinsic::VaCopy
        | Intrinsic::Memcpy
        | Intrinsic::Memmove
        | Intrinsic::Memset
        | Intrinsic::Allocate
        | Intrinsic::AllocateArray
        | Intrinsic::Reallocate
        | Intrinsic::Deallocate
        | Intrinsic::GrowMemory
        | Intrinsic::Unknown(_) => true,
        Intrinsic::StackSave
        | Intrinsic::VaEnd
        | Intrinsic::Downcast
        | Intrinsic::Virtualcast
        | Intrinsic::DowncastCurrent
        | Intrinsic::UpcastCollapsed
        | Intrinsic::CastUser
        | Intrinsic::FltRounds
        | Intrinsic::Ctlz
        | Intrinsic::Fabs
        | Intrinsic::Ceil
        | Intrinsic::Floor
        | Intrinsic::FTrunc
        | Intrinsic::Sqrt
        | Intrinsic::MinNum
        | Intrinsic::MaxNum
        | Intrinsic::CopySign
        | Intrinsic::Sin
        | Intrinsic::Cos
        | Intrinsic::Tan
        | Intrinsic::Asin
        | Intrinsic::Acos
        | Intrinsic::Atan
        | Intrinsic::Atan2
        | Intrinsic::Exp
        | Intrinsic::Log
        | Intrinsic::Pow => false,
    }
}

fn intrinsic_reads_memory(intrinsic: &Intrinsic) -> bool {
    matches!(
        intrinsic,
        Intrinsic::Memcpy | Intrinsic::Memmove | Intrinsic::Unknown(_)
    )
}

impl<'a> FunctionEmitter<'a> {
    /// Walk the block in program order building the memory and local
    /// dependency graphs, and collect the non-inlineable instructions to
    /// render. Memory ordering: a side-effectful instruction depends on
    /// the previous one and on every load since; a load depends on the
    /// previous side effect. Local ordering: a register write depends on
    /// the previous write to the same register and on every read of it
    /// emitted since.
    pub(crate) fn build_block_dependencies(&mut self, bb: BlockId) -> Result<Vec<ValueId>> {
        let mut deferred = Vec::new();
        let mut last_store_like: Option<ValueId> = None;
        let mut loads_like: Vec<ValueId> = Vec::new();
        let mut get_local_from_register: HashMap<u32, Vec<ValueId>> = HashMap::new();
        let mut last_assigned_to_register: HashMap<u32, ValueId> = HashMap::new();
        let function = self.function;
        let analysis = self.analysis;
        let regs = &analysis.registers;

        for &inst_id in &function.block(bb).insts {
            let Some(inst) = function.inst(inst_id) else {
                continue;
            };
            let is_phi = matches!(inst.kind, InstKind::Phi { .. });

            // Register reads reached through this instruction's tree of
            // inlineable operands.
            if !is_phi {
                let mut queue = vec![inst_id];
                while let Some(curr) = queue.pop() {
                    let Some(curr_inst) = function.inst(curr) else {
                        continue;
                    };
                    for op in curr_inst.kind.operands() {
                        if !matches!(function.value(op), ValueDef::Inst(_)) {
                            continue;
                        }
                        if regs.has_register(op) {
                            let id = regs.register_of(op)?;
                            if let Some(&last) = last_assigned_to_register.get(&id) {
                                self.locals_dependencies
                                    .entry(inst_id)
                                    .or_default()
                                    .insert(last);
                            }
                            get_local_from_register.entry(id).or_default().push(inst_id);
                        } else {
                            queue.push(op);
                        }
                    }
                }
            }

            // A register write waits for the readers of the previous
            // value in that register. This also applies to PHIs.
            if regs.has_register(inst_id) {
                let id = regs.register_of(inst_id)?;
                let mut queue: Vec<ValueId> =
                    get_local_from_register.get(&id).cloned().unwrap_or_default();
                while let Some(curr) = queue.pop() {
                    if !self.is_inlineable(curr) {
                        self.locals_dependencies
                            .entry(inst_id)
                            .or_default()
                            .insert(curr);
                    } else {
                        let mut readers = Vec::new();
                        for &user in self.users_of(curr) {
                            let keep = function.inst(user).is_some_and(|i| {
                                i.block == bb && !matches!(i.kind, InstKind::Phi { .. })
                            });
                            if keep {
                                readers.push(user);
                            }
                        }
                        queue.extend(readers);
                    }
                }
                get_local_from_register.remove(&id);
                last_assigned_to_register.insert(id, inst_id);
            }

            if is_phi {
                continue;
            }

            if !self.is_inlineable(inst_id) {
                deferred.push(inst_id);

                let mut may_have_side_effects = kind_may_have_side_effects(&inst.kind);
                let mut may_read_memory = kind_may_read_memory(&inst.kind);
                let mut queue: Vec<ValueId> = inst
                    .kind
                    .operands()
                    .into_iter()
                    .filter(|op| matches!(function.value(*op), ValueDef::Inst(_)))
                    .collect();
                while let Some(curr) = queue.pop() {
                    if !self.is_inlineable(curr) {
                        continue;
                    }
                    let Some(curr_inst) = function.inst(curr) else {
                        continue;
                    };
                    may_read_memory |= kind_may_read_memory(&curr_inst.kind);
                    may_have_side_effects |= kind_may_have_side_effects(&curr_inst.kind);
                    for op in curr_inst.kind.operands() {
                        if matches!(function.value(op), ValueDef::Inst(_)) {
                            queue.push(op);
                        }
                    }
                }

                if may_have_side_effects {
                    if let Some(last) = last_store_like {
                        self.memory_dependencies
                            .entry(inst_id)
                            .or_default()
                            .insert(last);
                    }
                    last_store_like = Some(inst_id);
                    for &load in &loads_like {
                        self.memory_dependencies
                            .entry(inst_id)
                            .or_default()
                            .insert(load);
                    }
                    loads_like.clear();
                } else if may_read_memory {
                    loads_like.push(inst_id);
                    if let Some(last) = last_store_like {
                        self.memory_dependencies
                            .entry(inst_id)
                            .or_default()
                            .insert(last);
                    }
                }
            }
        }
        Ok(deferred)
    }

    /// Dependencies never include the instruction itself, and only refer
    /// to non-inlineable instructions of the current block.
    pub(crate) fn check_and_sanitize_dependencies(&mut self) {
        let bb = self.current_block.expect("inside a block");
        let function = self.function;
        let analysis = self.analysis;
        for (inst, deps) in self
            .memory_dependencies
            .iter_mut()
            .chain(self.locals_dependencies.iter_mut())
        {
            deps.remove(inst);
            debug_assert!(deps.iter().all(|dep| {
                function
                    .inst(*dep)
                    .is_some_and(|i| i.block == bb && !analysis.is_inlineable(*dep))
            }));
        }
    }

    pub(crate) fn flush_memory_dependencies(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
    ) -> Result<()> {
        let deps: Vec<ValueId> = self
            .memory_dependencies
            .get(&v)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if deps.is_empty() {
            return Ok(());
        }
        let needs_sub_stack = self.tee_locals.needs_sub_stack(code);
        if needs_sub_stack {
            self.tee_locals.add_indentation();
        }
        for dep in deps {
            self.compile_instruction_and_set(code, dep)?;
        }
        if needs_sub_stack {
            self.tee_locals.decrease_indentation();
        }
        Ok(())
    }

    pub(crate) fn flush_locals_dependencies(
        &mut self,
        code: &mut CodeBuffer,
        v: ValueId,
    ) -> Result<()> {
        let deps: Vec<ValueId> = self
            .locals_dependencies
            .get(&v)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if deps.is_empty() {
            return Ok(());
        }
        let needs_sub_stack = self.tee_locals.needs_sub_stack(code);
        if needs_sub_stack {
            self.tee_locals.add_indentation();
        }
        for dep in deps {
            self.compile_instruction_and_set(code, dep)?;
        }
        if needs_sub_stack {
            self.tee_locals.decrease_indentation();
        }
        Ok(())
    }
}
