use std::collections::HashMap;

use super::encoding::leb_len_u32;
use crate::analysis::MemoryLayout;
use crate::ir::{Constant, GlobalId, InstKind, IrType, Module, ValueDef};

/// How a constant is represented across the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlobalConstantEncoding {
    /// Emit inline at every use.
    None,
    /// Promote to an immutable wasm global holding the literal.
    Full,
    /// The IR global itself becomes a mutable wasm global.
    Global,
}

/// One entry of the global section, in emission order. Ids start at 1;
/// id 0 is the stack-top pointer.
#[derive(Debug, Clone)]
pub(crate) enum PlannedGlobal {
    Constant(Constant),
    PromotedGlobal(GlobalId),
}

/// The globalization plan: which constants read through `global.get`,
/// which IR globals left linear memory, and the order the global
/// section renders them in.
#[derive(Debug, Default)]
pub(crate) struct GlobalizationPlan {
    pub(crate) stack_top_global: u32,
    constants: HashMap<Constant, u32>,
    promoted_globals: HashMap<GlobalId, u32>,
    pub(crate) ordered: Vec<PlannedGlobal>,
}

impl GlobalizationPlan {
    pub(crate) fn constant_global_id(&self, c: &Constant) -> Option<u32> {
        self.constants.get(c).copied()
    }

    pub(crate) fn promoted_global_id(&self, g: GlobalId) -> Option<u32> {
        self.promoted_globals.get(&g).copied()
    }

    pub(crate) fn global_is_promoted(&self, g: GlobalId) -> bool {
        self.promoted_globals.contains_key(&g)
    }

    pub(crate) fn global_count(&self) -> u32 {
        1 + self.ordered.len() as u32
    }
}

struct CandidateOrder {
    usage: HashMap<Constant, u32>,
    insertion: HashMap<Constant, u32>,
}

impl CandidateOrder {
    fn record(&mut self, c: &Constant) {
        *self.usage.entry(c.clone()).or_insert(0) += 1;
        let next = self.insertion.len() as u32;
        self.insertion.entry(c.clone()).or_insert(next);
    }
}

/// Size win for promoting a float literal: the global pays its
/// definition once, every use shrinks from the literal to a
/// `global.get`. Integer literals always lose, their SLEB form is
/// already short.
fn should_encode_constant_as_global(
    c: &Constant,
    use_count: u32,
    get_global_cost: u32,
) -> GlobalConstantEncoding {
    debug_assert!(use_count > 1);
    match c {
        Constant::Float { ty, .. } => {
            let cost_as_literal: u32 = if *ty == IrType::F64 { 9 } else { 5 };
            // type byte + literal + end byte
            let global_init_cost = 2 + cost_as_literal;
            let global_uses_cost = global_init_cost + get_global_cost * use_count;
            let direct_uses_cost = cost_as_literal * use_count;
            if global_uses_cost < direct_uses_cost {
                GlobalConstantEncoding::Full
            } else {
                GlobalConstantEncoding::None
            }
        }
        _ => GlobalConstantEncoding::None,
    }
}

/// Scan every function body once and decide the promotions.
pub(crate) fn plan(module: &Module, layout: &MemoryLayout) -> GlobalizationPlan {
    let mut order = CandidateOrder {
        usage: HashMap::new(),
        insertion: HashMap::new(),
    };

    // Promoted IR globals come first in insertion order.
    for (index, _) in module.globals.iter().enumerate() {
        let g = GlobalId(index as u32);
        if layout.globalized_global_usage.contains_key(&g) {
            let next = order.insertion.len() as u32;
            order.insertion.entry(Constant::GlobalAddr(g)).or_insert(next);
        }
    }

    for function in &module.functions {
        for block in &function.blocks {
            for &inst_id in &block.insts {
                let Some(inst) = function.inst(inst_id) else {
                    continue;
                };
                // A GEP operand usually ends up folded into a load or
                // store offset; promoting it would lose that fold.
                if matches!(inst.kind, InstKind::Gep(_)) {
                    continue;
                }
                for op in inst.kind.operands() {
                    let ValueDef::Const(c) = function.value(op) else {
                        continue;
                    };
                    match c {
                        Constant::FuncAddr(_) | Constant::Null => continue,
                        Constant::GlobalAddr(g)
                            if layout.globalized_global_usage.contains_key(g) =>
                        {
                            // The whole global is promoted, its address
                            // is meaningless.
                            continue;
                        }
                        _ => order.record(c),
                    }
                }
            }
        }
    }

    struct GlobalConstant {
        constant: Constant,
        use_count: u32,
        encoding: GlobalConstantEncoding,
        insertion_index: u32,
    }

    let mut ordered_constants: Vec<GlobalConstant> = order
        .usage
        .iter()
        .filter(|&(_, &count)| count > 1)
        .map(|(c, &count)| GlobalConstant {
            constant: c.clone(),
            use_count: count,
            encoding: GlobalConstantEncoding::None,
            insertion_index: order.insertion[c],
        })
        .collect();
    for (&g, &count) in &layout.globalized_global_usage {
        ordered_constants.push(GlobalConstant {
            constant: Constant::GlobalAddr(g),
            use_count: count,
            encoding: GlobalConstantEncoding::Global,
            insertion_index: order.insertion[&Constant::GlobalAddr(g)],
        });
    }

    // High use counts first; insertion order is the tie-breaker that
    // keeps the output deterministic.
    ordered_constants.sort_by(|a, b| {
        b.use_count
            .cmp(&a.use_count)
            .then(a.insertion_index.cmp(&b.insertion_index))
    });

    let mut plan = GlobalizationPlan::default();
    let mut global_id: u32 = 1;
    for candidate in &mut ordered_constants {
        if candidate.encoding == GlobalConstantEncoding::Global {
            let Constant::GlobalAddr(g) = candidate.constant else {
                unreachable!();
            };
            plan.promoted_globals.insert(g, global_id);
            plan.ordered.push(PlannedGlobal::PromotedGlobal(g));
            global_id += 1;
            continue;
        }
        let get_global_cost = 1 + leb_len_u32(global_id);
        let encoding =
            should_encode_constant_as_global(&candidate.constant, candidate.use_count, get_global_cost);
        candidate.encoding = encoding;
        if encoding == GlobalConstantEncoding::Full {
            plan.constants.insert(candidate.constant.clone(), global_id);
            plan.ordered
                .push(PlannedGlobal::Constant(candidate.constant.clone()));
            global_id += 1;
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::{plan, should_encode_constant_as_global, GlobalConstantEncoding};
    use crate::analysis::MemoryLayout;
    use crate::ir::Constant;

    #[test]
    fn doubles_with_enough_uses_are_promoted() {
        // definition 11 bytes + 2 per use vs 9 per use: wins at 2 uses.
        let c = Constant::f64(3.141592653589793);
        assert_eq!(
            should_encode_constant_as_global(&c, 2, 2),
            GlobalConstantEncoding::Full
        );
    }

    #[test]
    fn floats_need_more_uses_than_doubles() {
        // definition 7 bytes + 2 per use vs 5 per use: needs 3 uses.
        let c = Constant::f32(1.5);
        assert_eq!(
            should_encode_constant_as_global(&c, 2, 2),
            GlobalConstantEncoding::None
        );
        assert_eq!(
            should_encode_constant_as_global(&c, 3, 2),
            GlobalConstantEncoding::Full
        );
    }

    #[test]
    fn integers_are_never_promoted() {
        let c = Constant::i32(123456);
        assert_eq!(
            should_encode_constant_as_global(&c, 100, 2),
            GlobalConstantEncoding::None
        );
    }

    #[test]
    fn empty_module_plans_only_the_stack_global() {
        let module = crate::ir::Module::default();
        let layout = MemoryLayout::default();
        let plan = plan(&module, &layout);
        assert_eq!(plan.global_count(), 1);
        assert_eq!(plan.stack_top_global, 0);
    }
}
