use std::collections::{HashMap, HashSet};

use super::buffer::CodeBuffer;
use super::encoding::encode_u32_inst;
use super::function::FunctionEmitter;
use crate::error::{Error, Result};
use crate::ir::{BlockId, Constant, InstKind, ValueDef, ValueId};

struct PhiMove {
    phi: ValueId,
    value: ValueId,
    dst_reg: u32,
    dst_local: u32,
    /// Register the incoming value lives in, when it has one.
    src_reg: Option<u32>,
}

impl<'a> FunctionEmitter<'a> {
    /// No assignment is needed when the incoming value already lives in
    /// the PHI's register. That implicit flow still counts as a read of
    /// the incoming instruction's local.
    pub(crate) fn requires_explicit_assignment(
        &mut self,
        phi: ValueId,
        incoming: ValueId,
        from: BlockId,
        to: BlockId,
    ) -> Result<bool> {
        let regs = &self.analysis.registers;
        if !matches!(self.function.value(incoming), ValueDef::Inst(_)) {
            return Ok(true);
        }
        if self.is_inlineable(incoming) || !regs.has_register(incoming) {
            return Ok(true);
        }
        let same_register =
            regs.register_of(phi)? == regs.register_on_edge(incoming, from, to)?;
        if same_register {
            self.get_local_done.insert(incoming);
        }
        Ok(!same_register)
    }

    /// Walk every PHI once so implicit same-register flows are recorded
    /// before the NOP rewriter decides which assignments are dead.
    pub(crate) fn check_implicit_assigned_phis(&mut self) -> Result<()> {
        for (to_index, block) in self.function.blocks.iter().enumerate() {
            let to = BlockId(to_index as u32);
            let phi_list: Vec<(ValueId, Vec<(BlockId, ValueId)>)> = block
                .insts
                .iter()
                .filter_map(|&id| {
                    self.function.inst(id).and_then(|inst| match &inst.kind {
                        InstKind::Phi { incoming } => Some((id, incoming.clone())),
                        _ => None,
                    })
                })
                .collect();
            for (phi, incoming) in phi_list {
                for (from, value) in incoming {
                    if self.analysis.registers.has_register(phi) {
                        self.requires_explicit_assignment(phi, value, from, to)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Assign the PHIs of `to` their incoming values for the edge from
    /// `from`. Acyclic assignments snapshot every right-hand side on the
    /// stack and store in reverse; swap-style cycles rotate through one
    /// scratch local.
    pub(crate) fn compile_phi_edge(
        &mut self,
        code: &mut CodeBuffer,
        from: BlockId,
        to: BlockId,
    ) -> Result<()> {
        let phi_list: Vec<(ValueId, ValueId)> = self
            .function
            .block(to)
            .insts
            .iter()
            .filter_map(|&id| {
                self.function.inst(id).and_then(|inst| match &inst.kind {
                    InstKind::Phi { incoming } => incoming
                        .iter()
                        .find(|(f, _)| *f == from)
                        .map(|&(_, value)| (id, value)),
                    _ => None,
                })
            })
            .collect();

        let mut moves = Vec::new();
        for (phi, value) in phi_list {
            if matches!(
                self.function.value(value),
                ValueDef::Const(Constant::Undef(_))
            ) {
                continue;
            }
            if !self.requires_explicit_assignment(phi, value, from, to)? {
                continue;
            }
            let regs = &self.analysis.registers;
            let dst_reg = regs.register_of(phi)?;
            let src_reg = if matches!(self.function.value(value), ValueDef::Inst(_))
                && !self.is_inlineable(value)
                && regs.has_register(value)
            {
                Some(regs.register_on_edge(value, from, to)?)
            } else {
                None
            };
            let dst_local = self.local_map[dst_reg as usize];
            moves.push(PhiMove {
                phi,
                value,
                dst_reg,
                dst_local,
                src_reg,
            });
        }
        if moves.is_empty() {
            return Ok(());
        }

        let cycle_indices = find_cycles(&moves);
        let acyclic: Vec<usize> = (0..moves.len())
            .filter(|index| !cycle_indices.iter().any(|cycle| cycle.contains(index)))
            .collect();

        self.tee_locals.instruction_start(code);

        // Group acyclic moves by incoming value; each distinct value is
        // pushed once and distributed with tee/set.
        let mut ordered: Vec<(ValueId, Vec<u32>)> = Vec::new();
        for &index in &acyclic {
            let m = &moves[index];
            match ordered.iter_mut().find(|(value, _)| *value == m.value) {
                Some((_, locals)) => locals.push(m.dst_local),
                None => ordered.push((m.value, vec![m.dst_local])),
            }
        }
        for (value, _) in &ordered {
            self.compile_operand(code, *value)?;
        }
        self.tee_locals.remove_consumed();

        while let Some((value, locals)) = ordered.pop() {
            for (position, &local) in locals.iter().enumerate() {
                let last = position + 1 == locals.len();
                if last {
                    if ordered.is_empty() && cycle_indices.is_empty() {
                        self.tee_locals.add_candidate(value, false, local, code.tell());
                    }
                    encode_u32_inst(code, 0x21, "local.set", local);
                } else {
                    encode_u32_inst(code, 0x22, "local.tee", local);
                }
            }
        }

        // Rotate each cycle through a scratch local: save the first
        // destination, shift the rest up, then land the saved value.
        for cycle in &cycle_indices {
            let first = &moves[cycle[0]];
            let ty = self.value_type_of(first.phi)?;
            let tmp = self.swap_local(ty)?;
            encode_u32_inst(code, 0x20, "local.get", first.dst_local);
            encode_u32_inst(code, 0x21, "local.set", tmp);
            for (position, &index) in cycle.iter().enumerate() {
                let m = &moves[index];
                let src_reg = m
                    .src_reg
                    .ok_or_else(|| Error::internal("cycle move without a source register"))?;
                let src_local = if position + 1 == cycle.len() {
                    tmp
                } else {
                    self.local_map[src_reg as usize]
                };
                encode_u32_inst(code, 0x20, "local.get", src_local);
                encode_u32_inst(code, 0x21, "local.set", m.dst_local);
            }
        }

        self.tee_locals.instruction_start(code);
        Ok(())
    }
}

/// Permutation cycles of length > 1 in the register move graph. Each
/// cycle is returned in chain order: the move writing the start
/// register first, then the move feeding it, and so on.
fn find_cycles(moves: &[PhiMove]) -> Vec<Vec<usize>> {
    let by_dst: HashMap<u32, usize> = moves
        .iter()
        .enumerate()
        .map(|(index, m)| (m.dst_reg, index))
        .collect();
    let mut cycles = Vec::new();
    let mut visited: HashSet<u32> = HashSet::new();
    for (start_index, start) in moves.iter().enumerate() {
        if visited.contains(&start.dst_reg) {
            continue;
        }
        let mut chain = vec![start_index];
        let mut seen = vec![start.dst_reg];
        let mut curr = start;
        loop {
            let Some(src) = curr.src_reg else {
                break;
            };
            if src == start.dst_reg {
                if chain.len() > 1 {
                    visited.extend(seen.iter().copied());
                    cycles.push(chain);
                }
                break;
            }
            let Some(&next_index) = by_dst.get(&src) else {
                break;
            };
            if seen.contains(&src) {
                break;
            }
            chain.push(next_index);
            seen.push(src);
            curr = &moves[next_index];
        }
    }
    cycles
}
