//! Structured-control lowering: token streams, break depths, and the
//! legacy relooper render.

use super::common::{FunctionBuilder, TestModule};
use crate::analysis::{HandledShape, RegKind, Shape, ShapeKind, Token};
use crate::ir::{BinOp, BlockId, Constant, InstKind, IntPredicate, IrType};

#[test]
fn loop_token_stream_branches_back_at_depth_zero() {
    let mut builder = FunctionBuilder::new("spin", vec![IrType::I32], IrType::Void);
    let b0 = builder.block();
    let n = builder.param(0);
    let zero = builder.constant(Constant::i32(0));
    let cond = builder.inst(
        InstKind::ICmp {
            pred: IntPredicate::Ne,
            lhs: n,
            rhs: zero,
        },
        IrType::I1,
    );
    builder.inline(cond);
    let b1 = builder.block();
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    builder.switch_to(b0);
    builder.inst(
        InstKind::CondBr {
            cond,
            if_true: b0,
            if_false: b1,
        },
        IrType::Void,
    );
    builder.tokens(vec![
        Token::Block,
        Token::Loop,
        Token::BasicBlock(b0),
        Token::BrIf { target: 1, bb: b0 },
        Token::End,
        Token::End,
        Token::BasicBlock(b1),
    ]);
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("spin").expect("emit body");
    assert_eq!(
        body,
        vec![
            0x00, // no locals
            0x02, 0x40, // block
            0x03, 0x40, // loop
            0x20, 0x00, // the condition collapses to the bare value
            0x0D, 0x00, // br_if to the loop header
            0x0B, 0x0B, // loop and block ends
            0x0B, // function end
        ]
    );
}

#[test]
fn if_else_tokens_fold_the_condition_and_return_inside_scopes() {
    let mut builder = FunctionBuilder::new("pick", vec![IrType::I32], IrType::I32);
    let b0 = builder.block();
    let c = builder.param(0);
    let t = builder.block();
    let one = builder.constant(Constant::i32(1));
    builder.inst(InstKind::Ret { value: Some(one) }, IrType::Void);
    let f = builder.block();
    let two = builder.constant(Constant::i32(2));
    builder.inst(InstKind::Ret { value: Some(two) }, IrType::Void);
    let join = builder.block();
    let zero = builder.constant(Constant::i32(0));
    builder.inst(InstKind::Ret { value: Some(zero) }, IrType::Void);
    builder.switch_to(b0);
    builder.inst(
        InstKind::CondBr {
            cond: c,
            if_true: t,
            if_false: f,
        },
        IrType::Void,
    );
    builder.tokens(vec![
        Token::BasicBlock(b0),
        Token::If { bb: b0 },
        Token::BasicBlock(t),
        Token::Else,
        Token::BasicBlock(f),
        Token::End,
        Token::BasicBlock(join),
    ]);
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("pick").expect("emit body");
    assert_eq!(
        body,
        vec![
            0x00, // no locals
            0x20, 0x00, // condition
            0x04, 0x40, // if
            0x41, 0x01, 0x0F, // return 1
            0x05, // else
            0x41, 0x02, 0x0F, // return 2
            0x0B, // end if
            0x41, 0x00, // the depth-zero tail needs no return opcode
            0x0B,
        ]
    );
}

#[test]
fn relooper_loop_shape_nests_block_around_loop() {
    let mut builder = FunctionBuilder::new("legacy", vec![IrType::I32], IrType::Void);
    let b0 = builder.block();
    let c = builder.param(0);
    let b1 = builder.block();
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    builder.switch_to(b0);
    builder.inst(
        InstKind::CondBr {
            cond: c,
            if_true: b0,
            if_false: b1,
        },
        IrType::Void,
    );
    let loop_shape = Shape {
        kind: ShapeKind::Loop {
            body: Box::new(Shape::simple(b0)),
        },
        next: Some(Box::new(Shape::simple(b1))),
    };
    builder.relooper(loop_shape);
    let mut module = TestModule::from_function(builder.finish());
    module.options.use_cfg_legacy = true;
    let body = module.emit_body("legacy").expect("emit body");
    assert_eq!(
        body,
        vec![
            0x00, // no locals
            0x02, 0x40, // break target
            0x03, 0x40, // continue target
            0x20, 0x00, // condition
            0x04, 0x40, // if
            0x0C, 0x01, // continue: through the if scope to the loop
            0x05, // else
            0x0C, 0x02, // break: out to the wrapping block
            0x0B, // end if
            0x0B, 0x0B, // end loop, end block
            0x0B, // function end
        ]
    );
}

#[test]
fn relooper_multiple_dispatches_on_the_label_local() {
    let mut builder = FunctionBuilder::new("dispatch", vec![IrType::I32], IrType::Void);
    let b0 = builder.block();
    let c = builder.param(0);
    let b1 = builder.block();
    let b3 = builder.block();
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    builder.switch_to(b1);
    builder.inst(InstKind::Jump { target: b3 }, IrType::Void);
    let b2 = builder.block();
    builder.inst(InstKind::Jump { target: b3 }, IrType::Void);
    builder.switch_to(b0);
    builder.inst(
        InstKind::CondBr {
            cond: c,
            if_true: b1,
            if_false: b2,
        },
        IrType::Void,
    );
    let multiple = Shape {
        kind: ShapeKind::Multiple {
            handled: vec![
                HandledShape {
                    labels: vec![b1],
                    shape: Shape::simple(b1),
                },
                HandledShape {
                    labels: vec![b2],
                    shape: Shape::simple(b2),
                },
            ],
        },
        next: Some(Box::new(Shape::simple(b3))),
    };
    let root = Shape {
        kind: ShapeKind::Simple { bb: b0 },
        next: Some(Box::new(multiple)),
    };
    builder.relooper(root);
    let mut module = TestModule::from_function(builder.finish());
    module.options.use_cfg_legacy = true;
    let body = module.emit_body("dispatch").expect("emit body");
    assert_eq!(
        body,
        vec![
            0x01, 0x01, 0x7F, // the label local
            0x20, 0x00, // condition
            0x04, 0x40, // if
            0x41, 0x00, 0x21, 0x01, // label = 0, fall through to the dispatch
            0x05, // else
            0x41, 0x01, 0x21, 0x01, // label = 1
            0x0B, // end if
            0x02, 0x40, 0x02, 0x40, 0x02, 0x40, // exit + two handled blocks
            0x20, 0x01, // read the label
            0x0E, 0x02, 0x00, 0x01, 0x02, // br_table over the handled entries
            0x0B, // end of the first handled block
            0x0C, 0x01, // handled 0 branches to the exit
            0x0C, 0x01, // and skips the remaining bodies
            0x0B, // end of the second handled block
            0x0C, 0x00, // handled 1 branches to the exit
            0x0B, // end of the exit block
            0x0B, // function end
        ]
    );
}

#[test]
fn branch_depths_follow_the_scope_stack_through_nested_blocks() {
    let mut builder = FunctionBuilder::new("nest", Vec::new(), IrType::Void);
    let b0 = builder.block();
    builder.inst(InstKind::Jump { target: b0 }, IrType::Void);
    let b1 = builder.block();
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    builder.tokens(vec![
        Token::Block,
        Token::Block,
        Token::BasicBlock(b0),
        Token::Branch { target: 0 },
        Token::End,
        Token::End,
        Token::BasicBlock(b1),
    ]);
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("nest").expect("emit body");
    assert_eq!(
        body,
        vec![0x00, 0x02, 0x40, 0x02, 0x40, 0x0C, 0x01, 0x0B, 0x0B, 0x0B]
    );
}

#[test]
fn two_phis_sharing_an_incoming_value_reuse_the_stack_top() {
    let mut builder = FunctionBuilder::new("share", vec![IrType::I32], IrType::Void);
    let entry = builder.block();
    let v = builder.param(0);
    let header = builder.block();
    let p = builder.inst(
        InstKind::Phi {
            incoming: Vec::new(),
        },
        IrType::I32,
    );
    let q = builder.inst(
        InstKind::Phi {
            incoming: Vec::new(),
        },
        IrType::I32,
    );
    builder.reg(p, RegKind::Integer);
    builder.reg(q, RegKind::Integer);
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    builder.switch_to(entry);
    builder.inst(InstKind::Jump { target: header }, IrType::Void);
    builder.patch_phi(p, vec![(entry, v)]);
    builder.patch_phi(q, vec![(entry, v)]);
    let module = TestModule::from_function(builder.finish());
    let bytes = module.with_emitter("share", |emitter| {
        let mut code = crate::emitter::CodeBuffer::new(crate::OutputMode::Wasm);
        emitter.tee_locals.perform_initialization();
        emitter
            .compile_phi_edge(&mut code, entry, header)
            .expect("resolve the edge");
        code.into_bytes()
    });
    // One push, a tee for the first phi, a set for the last. Locals 1
    // and 2 follow the single parameter.
    assert_eq!(bytes, vec![0x20, 0x00, 0x22, 0x01, 0x21, 0x02]);
}

#[test]
fn same_register_incoming_values_elide_the_phi_assignment() {
    let mut builder = FunctionBuilder::new("elide", Vec::new(), IrType::Void);
    let entry = builder.block();
    let one = builder.constant(Constant::i32(1));
    let two = builder.constant(Constant::i32(2));
    let x = builder.inst(
        InstKind::Binary {
            op: BinOp::Add,
            lhs: one,
            rhs: two,
        },
        IrType::I32,
    );
    builder.reg(x, RegKind::Integer);
    builder.inst(InstKind::Jump { target: BlockId(1) }, IrType::Void);
    let header = builder.block();
    let p = builder.inst(
        InstKind::Phi {
            incoming: vec![(entry, x)],
        },
        IrType::I32,
    );
    builder.share_reg(p, x);
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    let module = TestModule::from_function(builder.finish());
    let (bytes, x_read) = module.with_emitter("elide", |emitter| {
        let mut code = crate::emitter::CodeBuffer::new(crate::OutputMode::Wasm);
        emitter.tee_locals.perform_initialization();
        emitter
            .compile_phi_edge(&mut code, entry, header)
            .expect("resolve the edge");
        (code.into_bytes(), emitter.get_local_done.contains(&x))
    });
    assert!(bytes.is_empty(), "same-register flow needs no assignment");
    assert!(x_read, "the implicit flow still counts as a read of x");
}
