use crate::ir::BlockId;

/// Structured control reconstruction for one function, produced by either
/// the stackifier (token stream) or the legacy relooper (shape tree).
#[derive(Debug, Clone)]
pub enum Cfg {
    Tokens(Vec<Token>),
    Relooper(Shape),
}

impl Default for Cfg {
    fn default() -> Self {
        Cfg::Tokens(Vec::new())
    }
}

/// One token of the stackifier's linear stream.
///
/// Scope-opening tokens (`Loop`, `Block`, `If`, `IfNot`) are matched by a
/// later `End`. Branches carry the index of the scope-opening token they
/// target: a `Loop` for back edges, a `Block`/`If` for forward exits. The
/// emitter turns that into a relative depth against its scope stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    BasicBlock(BlockId),
    Loop,
    Block,
    /// Conditional scope; the condition is the terminator of `bb`.
    If { bb: BlockId },
    /// Same, with the condition inverted.
    IfNot { bb: BlockId },
    Else,
    End,
    Branch { target: usize },
    BrIf { target: usize, bb: BlockId },
    BrIfNot { target: usize, bb: BlockId },
    /// Emit the terminator condition of `bb` on the stack.
    Condition { bb: BlockId },
    /// Resolve PHIs for the edge `from` → `to`.
    Prologue { from: BlockId, to: BlockId },
    /// The switch terminator of `bb`; followed by `Case`/`Branch` pairs
    /// and closed by an `End` that does not emit a scope end.
    Switch { bb: BlockId },
    /// Case index into the switch: 0 is the default, `i` the i-th case.
    Case { index: u32 },
}

/// Relooper shapes, the legacy control reconstruction.
#[derive(Debug, Clone)]
pub struct Shape {
    pub kind: ShapeKind,
    pub next: Option<Box<Shape>>,
}

#[derive(Debug, Clone)]
pub enum ShapeKind {
    Simple { bb: BlockId },
    Loop { body: Box<Shape> },
    /// Entry dispatch over several handled sub-shapes, driven by the
    /// label local.
    Multiple { handled: Vec<HandledShape> },
}

#[derive(Debug, Clone)]
pub struct HandledShape {
    /// Basic blocks that enter this handled shape.
    pub labels: Vec<BlockId>,
    pub shape: Shape,
}

impl Shape {
    pub fn simple(bb: BlockId) -> Self {
        Shape {
            kind: ShapeKind::Simple { bb },
            next: None,
        }
    }

    /// Entry labels of this shape, with the label-local value to assign
    /// when the landing point is a `Multiple` dispatch.
    pub fn entries(&self) -> Vec<(BlockId, Option<u32>)> {
        match &self.kind {
            ShapeKind::Simple { bb } => vec![(*bb, None)],
            ShapeKind::Loop { body } => body.entries(),
            ShapeKind::Multiple { handled } => {
                let mut out = Vec::new();
                for (index, entry) in handled.iter().enumerate() {
                    for &label in &entry.labels {
                        out.push((label, Some(index as u32)));
                    }
                }
                out
            }
        }
    }

    /// Whether rendering this shape requires the label local.
    pub fn needs_label(&self) -> bool {
        let multiple_here = match &self.kind {
            ShapeKind::Multiple { handled } => {
                handled.len() > 1 || handled.iter().any(|h| h.labels.len() > 1)
            }
            _ => false,
        };
        multiple_here
            || match &self.kind {
                ShapeKind::Loop { body } => body.needs_label(),
                ShapeKind::Multiple { handled } => handled.iter().any(|h| h.shape.needs_label()),
                ShapeKind::Simple { .. } => false,
            }
            || self.next.as_ref().is_some_and(|next| next.needs_label())
    }
}
