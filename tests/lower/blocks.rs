use crate::util::*;
use expect_test::expect;

#[test]
fn blocks_inline_per_call_site() {
    let mut context = ctx();
    let plus = primitive(TypeTable::I32, "+", "add", &[("other", TypeTable::I32)], TypeTable::I32);
    let each = yielding_def("each", yld(vec![int32(5)], TypeTable::I32), TypeTable::I32);
    let block_body = |plus: &Rc<Def>| {
        call(Some(var("x", TypeTable::I32)), "+", vec![int32(10)], &[plus], TypeTable::I32)
    };
    let program = exprs(
        vec![
            call_with_block(
                None,
                "each",
                vec![],
                block(&[("x", TypeTable::I32)], &[], block_body(&plus), TypeTable::I32, None),
                &[&each],
                TypeTable::I32,
            ),
            call_with_block(
                None,
                "each",
                vec![],
                block(&[("x", TypeTable::I32)], &[], block_body(&plus), TypeTable::I32, None),
                &[&each],
                TypeTable::I32,
            ),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[]);
    // the target def is re-emitted per call site; each copy yields to its
    // own inlined block
    expect![[r#"
        <program>:
          call_with_block 1
          pop 4
          call_with_block 2
          leave 4
        each:
          put_i32 5
          call_block 0
          leave 4
        each:
          put_i32 5
          call_block 1
          leave 4
        block0:
          get_local 0 4
          put_i32 10
          add_i32
          leave 4
        block1:
          get_local 0 4
          put_i32 10
          add_i32
          leave 4
    "#]]
    .assert_eq(&out);
    assert_eq!(context.compiled_defs().len(), 3);
    assert_eq!(context.compiled_blocks().len(), 2);
}

#[test]
fn break_in_a_block_leaves_the_yielding_call() {
    let mut context = ctx();
    let each = yielding_def("each", yld(vec![], TypeTable::NO_RETURN), TypeTable::I32);
    let blk = block(&[], &[], brk(Some(int32(7))), TypeTable::NO_RETURN, Some(TypeTable::I32));
    let program = call_with_block(None, "each", vec![], blk, &[&each], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          call_with_block 1
          leave 4
        each:
          call_block 0
          leave 4
        block0:
          put_i32 7
          break_block 4
          put_nil
          leave 0
    "#]]
    .assert_eq(&out);
}

#[test]
fn next_in_a_block_leaves_the_block() {
    let mut context = ctx();
    let each = yielding_def("each", yld(vec![], TypeTable::I32), TypeTable::I32);
    let body = if_(var("c", TypeTable::BOOL), nxt(Some(int32(1))), int32(2), TypeTable::I32);
    let blk = block(&[], &[], body, TypeTable::I32, None);
    let program = call_with_block(None, "each", vec![], blk, &[&each], TypeTable::I32);
    let out = lower(&mut context, &program, &[("c", TypeTable::BOOL)]);
    expect![[r#"
        <program>:
          call_with_block 1
          leave 4
        each:
          call_block 0
          leave 4
        block0:
          get_local 0 1
          branch_unless L0
          put_i32 1
          leave 4
          jump L1
        L0:
          put_i32 2
        L1:
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn return_in_a_block_leaves_the_home_def() {
    let mut context = ctx();
    let each = yielding_def("each", yld(vec![], TypeTable::NO_RETURN), TypeTable::I32);
    let blk = block(&[], &[], ret(Some(int32(9))), TypeTable::NO_RETURN, None);
    let program = call_with_block(None, "each", vec![], blk, &[&each], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          call_with_block 1
          leave 4
        each:
          call_block 0
          leave 4
        block0:
          put_i32 9
          leave_def 4
          put_nil
          leave 0
    "#]]
    .assert_eq(&out);
}

#[test]
fn one_tuple_yield_unpacks_across_params() {
    let mut types = TypeTable::new();
    let pair = types.add("{Int32, Int32}", TypeKind::Tuple {
        elements: vec![TypeTable::I32, TypeTable::I32],
    });
    let mut context = Context::new(types);
    let plus = primitive(TypeTable::I32, "+", "add", &[("other", TypeTable::I32)], TypeTable::I32);
    let each = yielding_def(
        "each",
        yld(vec![tuple(vec![int32(1), int32(2)], pair)], TypeTable::I32),
        TypeTable::I32,
    );
    let body = call(Some(var("x", TypeTable::I32)), "+", vec![var("y", TypeTable::I32)], &[&plus], TypeTable::I32);
    let blk = block(&[("x", TypeTable::I32), ("y", TypeTable::I32)], &[], body, TypeTable::I32, None);
    let program = call_with_block(None, "each", vec![], blk, &[&each], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          call_with_block 1
          leave 4
        each:
          put_i32 1
          put_i32 2
          unpack_tuple 0
          call_block 0
          leave 4
        block0:
          get_local 0 4
          get_local 4 4
          add_i32
          leave 4
    "#]]
    .assert_eq(&out);
    let unpack = context.tuple_unpack(0);
    assert_eq!(unpack.tuple_size, 8);
    assert_eq!(unpack.elements.len(), 2);
    assert_eq!(unpack.elements[1].tuple_offset, 4);
}

#[test]
fn block_locals_nest_inside_the_caller_frame() {
    let mut context = ctx();
    let each = yielding_def("each", yld(vec![int32(5)], TypeTable::I32), TypeTable::I32);
    let body = exprs(
        vec![
            assign(var("tmp", TypeTable::I32), var("x", TypeTable::I32)),
            var("tmp", TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let blk = block(&[("x", TypeTable::I32)], &[("tmp", TypeTable::I32)], body, TypeTable::I32, None);
    let program = call_with_block(None, "each", vec![], blk, &[&each], TypeTable::I32);
    let out = lower(&mut context, &program, &[("acc", TypeTable::I32)]);
    expect![[r#"
        <program>:
          call_with_block 1
          leave 4
        each:
          put_i32 5
          call_block 0
          leave 4
        block0:
          get_local 4 4
          set_local 8 4
          get_local 8 4
          leave 4
    "#]]
    .assert_eq(&out);
    let compiled = &context.compiled_blocks()[0];
    assert_eq!(compiled.locals_start, 4);
    assert_eq!(compiled.locals_end, 12);
    assert_eq!(compiled.args_bytesize, 4);
    assert_eq!(compiled.block_level, 1);
}
