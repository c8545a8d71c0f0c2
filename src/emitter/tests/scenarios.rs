//! Scenario tests pinning the exact byte sequences the emitter must
//! produce for the canonical shapes.

use super::common::{const_return_function, FunctionBuilder, TestModule};
use super::contains_bytes;
use crate::analysis::{RegKind, Token};
use crate::ir::{BinOp, Constant, InstKind, IrType};

#[test]
fn empty_i32_return_emits_constant_and_end() {
    let module = TestModule::from_function(const_return_function("f", 0));
    let body = module.emit_body("f").expect("emit body");
    // no local groups, i32.const 0, end
    assert_eq!(body, vec![0x00, 0x41, 0x00, 0x0B]);
}

#[test]
fn add_of_two_parameters_inlines_onto_the_stack() {
    let mut builder = FunctionBuilder::new("add", vec![IrType::I32, IrType::I32], IrType::I32);
    builder.block();
    let a = builder.param(0);
    let b = builder.param(1);
    let sum = builder.inst(
        InstKind::Binary {
            op: BinOp::Add,
            lhs: a,
            rhs: b,
        },
        IrType::I32,
    );
    builder.inline(sum);
    builder.inst(InstKind::Ret { value: Some(sum) }, IrType::Void);
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("add").expect("emit body");
    assert_eq!(
        body,
        vec![0x00, 0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B],
        "local.get 0, local.get 1, i32.add, end"
    );
}

#[test]
fn store_of_double_zero_uses_the_integer_lane() {
    let mut builder = FunctionBuilder::new("store0", vec![IrType::Ptr], IrType::Void);
    builder.block();
    let p = builder.param(0);
    let zero = builder.constant(Constant::f64(0.0));
    builder.inst(InstKind::Store { ptr: p, value: zero }, IrType::Void);
    builder.inst(InstKind::Ret { value: None }, IrType::Void);
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("store0").expect("emit body");
    // local.get p, i64.const 0, i64.store align=3 offset=0
    assert_eq!(body, vec![0x00, 0x20, 0x00, 0x42, 0x00, 0x37, 0x03, 0x00, 0x0B]);
    assert!(
        !contains_bytes(&body, &[0x44]),
        "the f64 literal must not appear"
    );
}

#[test]
fn freshly_set_local_is_reused_through_tee() {
    let mut builder = FunctionBuilder::new("tee", vec![IrType::I32, IrType::I32], IrType::I32);
    builder.block();
    let a = builder.param(0);
    let b = builder.param(1);
    let x = builder.inst(
        InstKind::Binary {
            op: BinOp::Add,
            lhs: a,
            rhs: b,
        },
        IrType::I32,
    );
    builder.reg(x, RegKind::Integer);
    let squared = builder.inst(
        InstKind::Binary {
            op: BinOp::Mul,
            lhs: x,
            rhs: x,
        },
        IrType::I32,
    );
    builder.reg(squared, RegKind::Integer);
    builder.inst(
        InstKind::Ret {
            value: Some(squared),
        },
        IrType::Void,
    );
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("tee").expect("emit body");
    assert_eq!(
        body,
        vec![
            0x01, 0x02, 0x7F, // two i32 locals in one group
            0x20, 0x00, 0x20, 0x01, 0x6A, // a + b
            0x22, 0x02, // local.tee x
            0x20, 0x02, // second read through local.get
            0x6C, // i32.mul
            0x0B,
        ]
    );
    assert!(
        !contains_bytes(&body, &[0x21, 0x02, 0x20, 0x02]),
        "a set/get pair for the same local defeats the peephole"
    );
}

#[test]
fn dense_switch_lowers_to_br_table_across_four_blocks() {
    let mut builder = FunctionBuilder::new("sw", vec![IrType::I32], IrType::I32);
    let b0 = builder.block();
    let v = builder.param(0);
    let b1 = builder.block();
    let c1 = builder.constant(Constant::i32(10));
    builder.inst(InstKind::Ret { value: Some(c1) }, IrType::Void);
    let b2 = builder.block();
    let c2 = builder.constant(Constant::i32(20));
    builder.inst(InstKind::Ret { value: Some(c2) }, IrType::Void);
    let b3 = builder.block();
    let c3 = builder.constant(Constant::i32(30));
    builder.inst(InstKind::Ret { value: Some(c3) }, IrType::Void);
    let b4 = builder.block();
    let c4 = builder.constant(Constant::i32(40));
    builder.inst(InstKind::Ret { value: Some(c4) }, IrType::Void);
    builder.switch_to(b0);
    builder.inst(
        InstKind::Switch {
            cond: v,
            default: b4,
            cases: vec![(0, b1), (1, b2), (2, b3)],
        },
        IrType::Void,
    );
    builder.tokens(vec![
        Token::Block,
        Token::Block,
        Token::Block,
        Token::Block,
        Token::BasicBlock(b0),
        Token::Switch { bb: b0 },
        Token::Case { index: 1 },
        Token::Branch { target: 3 },
        Token::Case { index: 2 },
        Token::Branch { target: 2 },
        Token::Case { index: 3 },
        Token::Branch { target: 1 },
        Token::Case { index: 0 },
        Token::Branch { target: 0 },
        Token::End,
        Token::End,
        Token::BasicBlock(b1),
        Token::End,
        Token::BasicBlock(b2),
        Token::End,
        Token::BasicBlock(b3),
        Token::End,
        Token::BasicBlock(b4),
    ]);
    let module = TestModule::from_function(builder.finish());
    let body = module.emit_body("sw").expect("emit body");
    assert_eq!(
        body,
        vec![
            0x00, // no locals
            0x02, 0x40, 0x02, 0x40, 0x02, 0x40, 0x02, 0x40, // four nested blocks
            0x20, 0x00, // the condition
            0x0E, 0x03, 0x00, 0x01, 0x02, 0x03, // br_table, three entries, default 3
            0x0B, // end of the innermost block
            0x41, 0x0A, 0x0F, 0x0B, // case 0: return 10
            0x41, 0x14, 0x0F, 0x0B, // case 1: return 20
            0x41, 0x1E, 0x0F, 0x0B, // case 2: return 30
            0x41, 0x28, // default falls out of the function
            0x0B,
        ]
    );
}

#[test]
fn phi_swap_cycle_rotates_through_one_scratch_local() {
    let mut builder = FunctionBuilder::new("swap", Vec::new(), IrType::Void);
    let entry = builder.block();
    let c0 = builder.constant(Constant::i32(0));
    let c1 = builder.constant(Constant::i32(1));
    let header = builder.block();
    let x = builder.inst(
        InstKind::Phi {
            incoming: Vec::new(),
        },
        IrType::I32,
    );
    let y = builder.inst(
        InstKind::Phi {
            incoming: Vec::new(),
        },
        IrType::I32,
    );
    builder.reg(x, RegKind::Integer);
    builder.reg(y, RegKind::Integer);
    let latch = builder.block();
    builder.inst(InstKind::Jump { target: header }, IrType::Void);
    builder.patch_phi(x, vec![(entry, c0), (latch, y)]);
    builder.patch_phi(y, vec![(entry, c1), (latch, x)]);
    let module = TestModule::from_function(builder.finish());
    let bytes = module.with_emitter("swap", |emitter| {
        let mut code = crate::emitter::CodeBuffer::new(crate::OutputMode::Wasm);
        emitter.tee_locals.perform_initialization();
        emitter
            .compile_phi_edge(&mut code, latch, header)
            .expect("resolve the edge");
        code.into_bytes()
    });
    assert_eq!(
        bytes,
        vec![
            0x20, 0x00, 0x21, 0x02, // local.get x, local.set tmp
            0x20, 0x01, 0x21, 0x00, // local.get y, local.set x
            0x20, 0x02, 0x21, 0x01, // local.get tmp, local.set y
        ]
    );
}
