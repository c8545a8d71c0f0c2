use std::collections::HashSet;

use super::buffer::CodeBuffer;
use crate::ir::ValueId;

/// A point in the code buffer where a `local.set` was emitted while the
/// operand stack was empty. If the value is needed again as the very next
/// operand, the byte at `buffer_offset` is rewritten to `local.tee`,
/// leaving the value on the stack.
#[derive(Debug)]
struct TeeLocalCandidate {
    value: ValueId,
    local_id: u32,
    buffer_offset: u32,
    used: bool,
}

/// A `local.set` emitted for an instruction result, remembered so the
/// NOP rewriter can drop assignments whose local is never read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalInserted {
    pub(crate) value: ValueId,
    pub(crate) local_id: u32,
    pub(crate) buffer_offset: u32,
}

/// Candidate sites for the set-to-tee peephole.
///
/// Candidates live in a stack of layers parallel to the structured-scope
/// stack: entering a scope pushes a layer, leaving pops it, so a patch
/// never targets a position whose stack shape has changed. A candidate is
/// claimed at most once.
#[derive(Debug, Default)]
pub(crate) struct TeeLocals {
    layers: Vec<Vec<TeeLocalCandidate>>,
    /// Last buffer position where the operand stack was empty.
    inst_start_pos: u32,
    inserted: Vec<LocalInserted>,
    used_values: HashSet<ValueId>,
}

impl TeeLocals {
    /// Stack distance from the topmost unused candidate to a candidate
    /// for `v`, or `None` when no unclaimed candidate matches.
    pub(crate) fn find_depth(&self, v: ValueId) -> Option<u32> {
        let layer = self.layers.last()?;
        let mut distance = 0;
        for candidate in layer.iter().rev() {
            distance += 1;
            if candidate.used {
                break;
            }
            if candidate.value == v {
                return Some(distance);
            }
        }
        None
    }

    fn claim(&mut self, v: ValueId, curr_offset: u32) -> Option<(u32, u32)> {
        if curr_offset != self.inst_start_pos {
            return None;
        }
        let layer = self.layers.last_mut()?;
        for candidate in layer.iter_mut().rev() {
            if candidate.used {
                break;
            }
            if candidate.value == v {
                candidate.used = true;
                return Some((candidate.buffer_offset, candidate.local_id));
            }
        }
        None
    }

    /// Try to satisfy a `local.get` of `v` by patching the matching
    /// `local.set` into `local.tee`. Returns true when the buffer now
    /// produces an extra value on the stack.
    pub(crate) fn try_put_tee_on_stack(&mut self, code: &mut CodeBuffer, v: ValueId) -> bool {
        let curr_offset = code.tell();
        if let Some((buffer_offset, _local_id)) = self.claim(v, curr_offset) {
            code.patch_set_to_tee(buffer_offset);
            self.used_values.insert(v);
            return true;
        }
        false
    }

    pub(crate) fn add_candidate(
        &mut self,
        v: ValueId,
        is_instruction_assignment: bool,
        local_id: u32,
        buffer_offset: u32,
    ) {
        if is_instruction_assignment {
            self.inserted.push(LocalInserted {
                value: v,
                local_id,
                buffer_offset,
            });
        }
        if let Some(layer) = self.layers.last_mut() {
            layer.push(TeeLocalCandidate {
                value: v,
                local_id,
                buffer_offset,
                used: false,
            });
        }
    }

    /// Drop claimed candidates and everything stacked above them.
    pub(crate) fn remove_consumed(&mut self) {
        if let Some(layer) = self.layers.last_mut() {
            if let Some(first_used) = layer.iter().position(|c| c.used) {
                layer.truncate(first_used);
            }
        }
    }

    pub(crate) fn add_indentation(&mut self) {
        self.layers.push(Vec::new());
    }

    pub(crate) fn decrease_indentation(&mut self) {
        self.layers.pop();
    }

    /// Invalidate candidates in the scopes a branch is about to cross.
    pub(crate) fn clear_topmost_candidates(&mut self, depth: u32) {
        for _ in 0..depth {
            self.decrease_indentation();
        }
        for _ in 0..depth {
            self.add_indentation();
        }
    }

    pub(crate) fn perform_initialization(&mut self) {
        debug_assert!(self.layers.is_empty());
        self.add_indentation();
    }

    pub(crate) fn clear(&mut self) {
        self.decrease_indentation();
        debug_assert!(self.layers.is_empty());
        self.inserted.clear();
        self.used_values.clear();
        self.inst_start_pos = 0;
    }

    /// Record that the operand stack is empty at the current position.
    pub(crate) fn instruction_start(&mut self, code: &CodeBuffer) {
        self.inst_start_pos = code.tell();
    }

    /// Whether emission is mid-operand, requiring dependency flushes to
    /// run under a fresh layer so their candidates cannot leak.
    pub(crate) fn needs_sub_stack(&self, code: &CodeBuffer) -> bool {
        code.tell() != self.inst_start_pos
    }

    pub(crate) fn local_inserted(&self) -> &[LocalInserted] {
        &self.inserted
    }

    pub(crate) fn is_value_used(&self, v: ValueId) -> bool {
        self.used_values.contains(&v)
    }
}

#[cfg(test)]
mod tests {
    use super::TeeLocals;
    use crate::emitter::CodeBuffer;
    use crate::ir::ValueId;
    use crate::OutputMode;

    fn emit_set(code: &mut CodeBuffer, tee: &mut TeeLocals, v: ValueId, local: u32) {
        tee.add_candidate(v, true, local, code.tell());
        code.push_byte(0x21);
        code.push_byte(local as u8);
        tee.instruction_start(code);
    }

    #[test]
    fn patches_matching_set_when_stack_is_empty() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(4), 2);
        assert!(tee.try_put_tee_on_stack(&mut code, ValueId(4)));
        assert_eq!(code.bytes(), &[0x22, 0x02]);
        assert!(tee.is_value_used(ValueId(4)));
    }

    #[test]
    fn refuses_to_patch_when_cursor_moved_past_instruction_start() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(4), 2);
        code.push_byte(0x41);
        assert!(!tee.try_put_tee_on_stack(&mut code, ValueId(4)));
        assert_eq!(code.bytes()[0], 0x21);
    }

    #[test]
    fn candidates_are_claimed_at_most_once() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(4), 2);
        assert!(tee.try_put_tee_on_stack(&mut code, ValueId(4)));
        assert!(!tee.try_put_tee_on_stack(&mut code, ValueId(4)));
    }

    #[test]
    fn used_candidate_blocks_older_matches() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(1), 0);
        emit_set(&mut code, &mut tee, ValueId(2), 1);
        assert!(tee.try_put_tee_on_stack(&mut code, ValueId(2)));
        // v1 sits below the claimed candidate and is unreachable now.
        assert!(!tee.try_put_tee_on_stack(&mut code, ValueId(1)));
    }

    #[test]
    fn scope_layers_isolate_candidates() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(1), 0);
        tee.add_indentation();
        assert!(!tee.try_put_tee_on_stack(&mut code, ValueId(1)));
        tee.decrease_indentation();
        assert!(tee.try_put_tee_on_stack(&mut code, ValueId(1)));
    }

    #[test]
    fn clear_topmost_candidates_resets_the_layer() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(1), 0);
        tee.clear_topmost_candidates(1);
        assert!(!tee.try_put_tee_on_stack(&mut code, ValueId(1)));
    }

    #[test]
    fn find_depth_counts_from_the_top() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(1), 0);
        emit_set(&mut code, &mut tee, ValueId(2), 1);
        assert_eq!(tee.find_depth(ValueId(2)), Some(1));
        assert_eq!(tee.find_depth(ValueId(1)), Some(2));
        assert_eq!(tee.find_depth(ValueId(9)), None);
    }

    #[test]
    fn remove_consumed_truncates_at_first_used_candidate() {
        let mut code = CodeBuffer::new(OutputMode::Wasm);
        let mut tee = TeeLocals::default();
        tee.perform_initialization();
        emit_set(&mut code, &mut tee, ValueId(1), 0);
        emit_set(&mut code, &mut tee, ValueId(2), 1);
        assert!(tee.try_put_tee_on_stack(&mut code, ValueId(2)));
        // The claimed candidate hides the older one until it is removed.
        assert_eq!(tee.find_depth(ValueId(1)), None);
        tee.remove_consumed();
        assert_eq!(tee.find_depth(ValueId(1)), Some(1));
    }
}
