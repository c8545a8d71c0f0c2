use super::buffer::CodeBuffer;
use super::encoding::{encode_br_table, encode_inst, encode_s32_inst, encode_u32_inst};
use super::function::FunctionEmitter;
use super::operands::mask_for_width;
use crate::analysis::{HandledShape, Shape, ShapeKind, Token};
use crate::error::{Error, Result};
use crate::ir::{BlockId, InstKind, ValueId};

fn indent(code: &mut CodeBuffer, depth: usize) {
    if !code.is_binary() {
        for _ in 0..depth {
            code.push_str("  ");
        }
    }
}

impl<'a> FunctionEmitter<'a> {
    fn block_condition(&self, bb: BlockId) -> Result<ValueId> {
        let term = self
            .function
            .block(bb)
            .insts
            .last()
            .and_then(|&id| self.function.inst(id));
        match term.map(|inst| &inst.kind) {
            Some(InstKind::CondBr { cond, .. }) => Ok(*cond),
            _ => Err(Error::internal(
                "conditional token on a block without a conditional branch",
            )),
        }
    }

    fn block_terminator(&self, bb: BlockId) -> Option<&InstKind> {
        self.function
            .block(bb)
            .insts
            .last()
            .and_then(|&id| self.function.inst(id))
            .map(|inst| &inst.kind)
    }

    fn block_ends_in_plain_return(&self, bb: BlockId) -> bool {
        let Some(&term) = self.function.block(bb).insts.last() else {
            return false;
        };
        matches!(
            self.function.inst(term).map(|inst| &inst.kind),
            Some(InstKind::Ret { .. })
        ) && !self.is_return_part_of_tail_call(term)
    }

    /// Walk the stackifier's token stream. Break depths fall out of the
    /// scope stack: the distance from the top to the targeted opening
    /// token. Returns the last basic block emitted at depth zero.
    pub(crate) fn compile_tokens(
        &mut self,
        code: &mut CodeBuffer,
        tokens: &[Token],
    ) -> Result<Option<BlockId>> {
        let mut scope_stack: Vec<usize> = Vec::new();
        let mut last_depth0_block = None;

        let depth_of = |scope_stack: &[usize], target: usize| -> Result<u32> {
            scope_stack
                .iter()
                .rev()
                .position(|&open| open == target)
                .map(|depth| depth as u32)
                .ok_or_else(|| Error::internal("branch token targets a closed scope"))
        };

        let mut index = 0;
        while index < tokens.len() {
            self.tee_locals.instruction_start(code);
            match &tokens[index] {
                Token::BasicBlock(bb) => {
                    let at_depth0 = scope_stack.is_empty();
                    last_depth0_block = at_depth0.then_some(*bb);
                    self.compile_bb(code, *bb)?;
                    if !at_depth0 && self.block_ends_in_plain_return(*bb) {
                        encode_inst(code, 0x0F, "return");
                    }
                }
                Token::Loop => {
                    self.tee_locals.add_indentation();
                    indent(code, scope_stack.len());
                    encode_u32_inst(code, 0x03, "loop", 0x40);
                    scope_stack.push(index);
                }
                Token::Block => {
                    self.tee_locals.add_indentation();
                    indent(code, scope_stack.len());
                    encode_u32_inst(code, 0x02, "block", 0x40);
                    scope_stack.push(index);
                }
                Token::Condition { bb } => {
                    let cond = self.block_condition(*bb)?;
                    self.compile_condition(code, cond, false)?;
                }
                Token::BrIf { target, bb } | Token::BrIfNot { target, bb } => {
                    let invert = matches!(tokens[index], Token::BrIfNot { .. });
                    let cond = self.block_condition(*bb)?;
                    self.compile_condition(code, cond, invert)?;
                    let depth = depth_of(&scope_stack, *target)?;
                    self.tee_locals.clear_topmost_candidates(depth + 1);
                    encode_u32_inst(code, 0x0D, "br_if", depth);
                }
                Token::If { bb } | Token::IfNot { bb } => {
                    let invert = matches!(tokens[index], Token::IfNot { .. });
                    let cond = self.block_condition(*bb)?;
                    self.compile_condition(code, cond, invert)?;
                    self.tee_locals.add_indentation();
                    indent(code, scope_stack.len());
                    encode_u32_inst(code, 0x04, "if", 0x40);
                    scope_stack.push(index);
                }
                Token::Else => {
                    self.tee_locals.decrease_indentation();
                    self.tee_locals.add_indentation();
                    indent(code, scope_stack.len().saturating_sub(1));
                    encode_inst(code, 0x05, "else");
                }
                Token::Branch { target } => {
                    let depth = depth_of(&scope_stack, *target)?;
                    self.tee_locals.clear_topmost_candidates(depth + 1);
                    encode_u32_inst(code, 0x0C, "br", depth);
                }
                Token::End => {
                    self.tee_locals.decrease_indentation();
                    scope_stack.pop();
                    indent(code, scope_stack.len());
                    encode_inst(code, 0x0B, "end");
                }
                Token::Prologue { from, to } => {
                    self.compile_phi_edge(code, *from, *to)?;
                }
                Token::Switch { bb } => {
                    // Collect the case/branch pairs up to the closing
                    // End, which belongs to the switch, not to a scope.
                    let mut cases: Vec<(u32, u32)> = Vec::new();
                    let mut cursor = index + 1;
                    while !matches!(tokens.get(cursor), Some(Token::End) | None) {
                        let mut ids = Vec::new();
                        while let Some(Token::Case { index: id }) = tokens.get(cursor) {
                            ids.push(*id);
                            cursor += 1;
                        }
                        let Some(Token::Branch { target }) = tokens.get(cursor) else {
                            return Err(Error::internal(
                                "switch cases must be followed by a branch token",
                            ));
                        };
                        let depth = depth_of(&scope_stack, *target)?;
                        for id in ids {
                            cases.push((id, depth));
                        }
                        cursor += 1;
                    }
                    if tokens.get(cursor).is_none() {
                        return Err(Error::internal("switch region is missing its end token"));
                    }
                    self.compile_branch_table(code, *bb, &cases)?;
                    index = cursor;
                }
                Token::Case { .. } => {
                    return Err(Error::internal("case token found outside of a switch"));
                }
            }
            index += 1;
        }
        Ok(last_depth0_block)
    }

    /// Lower a dense switch to `br_table`: rebase the condition on the
    /// smallest case value, mask sub-32-bit conditions, and fill the
    /// table with the default depth for unmentioned values.
    pub(crate) fn compile_branch_table(
        &mut self,
        code: &mut CodeBuffer,
        bb: BlockId,
        cases: &[(u32, u32)],
    ) -> Result<()> {
        let Some(InstKind::Switch {
            cond,
            default,
            cases: sw_cases,
        }) = self.block_terminator(bb).cloned()
        else {
            return Err(Error::internal(
                "switch token on a block without a switch terminator",
            ));
        };
        if sw_cases.is_empty() {
            return Err(Error::internal("switch with no cases survived lowering"));
        }
        let bit_width = self.int_width_of(cond);
        let case_value = |raw: i64| -> i64 {
            if bit_width == 32 {
                raw as i32 as i64
            } else {
                raw & i64::from(mask_for_width(bit_width) as u32)
            }
        };

        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for &(raw, target) in &sw_cases {
            if target == default {
                continue;
            }
            let value = case_value(raw);
            min = min.min(value);
            max = max.max(value);
        }
        if min > max {
            // Every case folds into the default.
            min = 0;
            max = 0;
        }

        let depth = usize::try_from(max - min + 1)
            .map_err(|_| Error::codegen("switch range exceeds the branch-table limit"))?;
        let mut table = vec![u32::MAX; depth];
        let mut default_depth = u32::MAX;
        for &(id, branch_depth) in cases {
            if id == 0 {
                default_depth = branch_depth;
            } else {
                let (raw, _) = sw_cases
                    .get(id as usize - 1)
                    .ok_or_else(|| Error::internal("case token index out of range"))?;
                let slot = (case_value(*raw) - min) as usize;
                table[slot] = branch_depth;
            }
        }
        if default_depth == u32::MAX {
            return Err(Error::internal("switch region without a default case"));
        }
        for slot in &mut table {
            if *slot == u32::MAX {
                *slot = default_depth;
            }
        }

        self.compile_operand(code, cond)?;
        if min != 0 {
            encode_s32_inst(code, 0x41, "i32.const", min as i32);
            encode_inst(code, 0x6B, "i32.sub");
        }
        if bit_width != 32 && self.needs_unsigned_truncation(cond) {
            encode_s32_inst(code, 0x41, "i32.const", mask_for_width(bit_width));
            encode_inst(code, 0x71, "i32.and");
        }
        encode_br_table(code, &table, default_depth);
        Ok(())
    }

    /// Render the legacy relooper tree. Loops nest `block { loop { .. } }`
    /// so depth 0 continues and depth 1 breaks; a `Multiple` opens one
    /// block per handled entry plus the exit block and dispatches over
    /// the label local.
    pub(crate) fn render_relooper(
        &mut self,
        code: &mut CodeBuffer,
        shape: &Shape,
    ) -> Result<Option<BlockId>> {
        let mut scopes: Vec<Vec<(BlockId, Option<u32>)>> = Vec::new();
        let mut last_depth0_block = None;
        self.render_shape(code, shape, &mut scopes, &mut last_depth0_block)?;
        Ok(last_depth0_block)
    }

    fn render_shape(
        &mut self,
        code: &mut CodeBuffer,
        shape: &Shape,
        scopes: &mut Vec<Vec<(BlockId, Option<u32>)>>,
        last_depth0_block: &mut Option<BlockId>,
    ) -> Result<()> {
        match &shape.kind {
            ShapeKind::Simple { bb } => {
                let at_depth0 = scopes.is_empty() && shape.next.is_none();
                *last_depth0_block = at_depth0.then_some(*bb);
                self.compile_bb(code, *bb)?;
                self.tee_locals.instruction_start(code);

                let next_entries = shape.next.as_ref().map(|next| next.entries());
                match self.block_terminator(*bb).cloned() {
                    Some(InstKind::Ret { .. }) => {
                        if !at_depth0 && self.block_ends_in_plain_return(*bb) {
                            encode_inst(code, 0x0F, "return");
                        }
                    }
                    Some(InstKind::Unreachable) | None => {}
                    Some(InstKind::Jump { target }) => {
                        self.render_branch(code, *bb, target, next_entries.as_deref(), scopes)?;
                    }
                    Some(InstKind::CondBr {
                        cond,
                        if_true,
                        if_false,
                    }) => {
                        self.compile_condition(code, cond, false)?;
                        self.tee_locals.add_indentation();
                        encode_u32_inst(code, 0x04, "if", 0x40);
                        scopes.push(Vec::new());
                        self.render_branch(code, *bb, if_true, next_entries.as_deref(), scopes)?;
                        self.tee_locals.decrease_indentation();
                        self.tee_locals.add_indentation();
                        encode_inst(code, 0x05, "else");
                        self.render_branch(code, *bb, if_false, next_entries.as_deref(), scopes)?;
                        scopes.pop();
                        self.tee_locals.decrease_indentation();
                        encode_inst(code, 0x0B, "end");
                    }
                    Some(InstKind::Switch { .. }) => {
                        return Err(Error::codegen(
                            "switch terminators are not supported by the legacy relooper path",
                        ));
                    }
                    Some(_) => {
                        return Err(Error::internal("basic block without a terminator shape"));
                    }
                }
            }
            ShapeKind::Loop { body } => {
                let break_labels = shape
                    .next
                    .as_ref()
                    .map(|next| next.entries())
                    .unwrap_or_default();
                self.tee_locals.add_indentation();
                encode_u32_inst(code, 0x02, "block", 0x40);
                scopes.push(break_labels);
                self.tee_locals.add_indentation();
                encode_u32_inst(code, 0x03, "loop", 0x40);
                scopes.push(body.entries());
                self.render_shape(code, body, scopes, last_depth0_block)?;
                scopes.pop();
                self.tee_locals.decrease_indentation();
                encode_inst(code, 0x0B, "end");
                scopes.pop();
                self.tee_locals.decrease_indentation();
                encode_inst(code, 0x0B, "end");
            }
            ShapeKind::Multiple { handled } => {
                self.render_multiple(code, shape, handled, scopes, last_depth0_block)?;
            }
        }
        if let Some(next) = &shape.next {
            self.render_shape(code, next, scopes, last_depth0_block)?;
        }
        Ok(())
    }

    fn render_multiple(
        &mut self,
        code: &mut CodeBuffer,
        shape: &Shape,
        handled: &[HandledShape],
        scopes: &mut Vec<Vec<(BlockId, Option<u32>)>>,
        last_depth0_block: &mut Option<BlockId>,
    ) -> Result<()> {
        let count = handled.len();
        let exit_labels = shape
            .next
            .as_ref()
            .map(|next| next.entries())
            .unwrap_or_default();

        // Exit block first, then one block per handled entry, innermost
        // belonging to the first entry.
        self.tee_locals.add_indentation();
        encode_u32_inst(code, 0x02, "block", 0x40);
        scopes.push(exit_labels);
        for entry in handled.iter().rev() {
            self.tee_locals.add_indentation();
            encode_u32_inst(code, 0x02, "block", 0x40);
            scopes.push(entry.labels.iter().map(|&bb| (bb, None)).collect());
        }

        let label_local = self
            .label_local
            .ok_or_else(|| Error::internal("multiple dispatch without a label local"))?;
        encode_u32_inst(code, 0x20, "local.get", label_local);
        let table: Vec<u32> = (0..count as u32).collect();
        encode_br_table(code, &table, count as u32);

        for (position, entry) in handled.iter().enumerate() {
            scopes.pop();
            self.tee_locals.decrease_indentation();
            encode_inst(code, 0x0B, "end");
            self.render_shape(code, &entry.shape, scopes, last_depth0_block)?;
            self.tee_locals.instruction_start(code);
            if position + 1 != count {
                // Skip the remaining handled bodies.
                let depth = (count - 2 - position) as u32 + 1;
                self.tee_locals.clear_topmost_candidates(depth + 1);
                encode_u32_inst(code, 0x0C, "br", depth);
            }
        }
        scopes.pop();
        self.tee_locals.decrease_indentation();
        encode_inst(code, 0x0B, "end");
        Ok(())
    }

    /// Resolve a CFG edge inside the relooper render: run the edge's PHI
    /// prologue, then either fall through into the next shape or break
    /// or continue to the scope that owns the target, setting the label
    /// local when the landing point is a dispatch.
    fn render_branch(
        &mut self,
        code: &mut CodeBuffer,
        from: BlockId,
        target: BlockId,
        fallthrough: Option<&[(BlockId, Option<u32>)]>,
        scopes: &[Vec<(BlockId, Option<u32>)>],
    ) -> Result<()> {
        self.compile_phi_edge(code, from, target)?;
        if let Some(entries) = fallthrough {
            if let Some((_, label_value)) = entries.iter().find(|(bb, _)| *bb == target) {
                if let Some(value) = label_value {
                    let label_local = self
                        .label_local
                        .ok_or_else(|| Error::internal("label value without a label local"))?;
                    encode_s32_inst(code, 0x41, "i32.const", *value as i32);
                    encode_u32_inst(code, 0x21, "local.set", label_local);
                }
                return Ok(());
            }
        }
        for (depth, labels) in scopes.iter().rev().enumerate() {
            if let Some((_, label_value)) = labels.iter().find(|(bb, _)| *bb == target) {
                if let Some(value) = label_value {
                    let label_local = self
                        .label_local
                        .ok_or_else(|| Error::internal("label value without a label local"))?;
                    encode_s32_inst(code, 0x41, "i32.const", *value as i32);
                    encode_u32_inst(code, 0x21, "local.set", label_local);
                }
                let depth = depth as u32;
                self.tee_locals.clear_topmost_candidates(depth + 1);
                encode_u32_inst(code, 0x0C, "br", depth);
                return Ok(());
            }
        }
        Err(Error::codegen(
            "relooper branch target is not reachable from any open scope",
        ))
    }
}
