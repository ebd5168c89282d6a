use crate::util::*;
use expect_test::expect;

#[test]
fn if_else_branches_and_patches() {
    let mut context = ctx();
    let program = if_(var("c", TypeTable::BOOL), int32(10), int32(20), TypeTable::I32);
    let out = lower(&mut context, &program, &[("c", TypeTable::BOOL)]);
    expect![[r#"
        <program>:
          get_local 0 1
          branch_unless L0
          put_i32 10
          jump L1
        L0:
          put_i32 20
        L1:
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn known_truthy_condition_elides_dead_branch() {
    let mut context = ctx();
    let program = if_known(bool_(true), int32(10), int32(20), TypeTable::I32, true);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 10
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn while_loop_tests_condition_after_body() {
    let mut context = ctx();
    let lt = primitive(TypeTable::I32, "<", "lt", &[("other", TypeTable::I32)], TypeTable::BOOL);
    let plus = primitive(TypeTable::I32, "+", "add", &[("other", TypeTable::I32)], TypeTable::I32);
    let cond = call(Some(var("i", TypeTable::I32)), "<", vec![int32(3)], &[&lt], TypeTable::BOOL);
    let body = assign(
        var("i", TypeTable::I32),
        call(Some(var("i", TypeTable::I32)), "+", vec![int32(1)], &[&plus], TypeTable::I32),
    );
    let program = while_(cond, body);
    let out = lower(&mut context, &program, &[("i", TypeTable::I32)]);
    expect![[r#"
        <program>:
          jump L1
        L0:
          get_local 0 4
          put_i32 1
          add_i32
          set_local 0 4
        L1:
          get_local 0 4
          put_i32 3
          lt_i32
          branch_if L0
          put_nil
          leave 0
    "#]]
    .assert_eq(&out);
}

#[test]
fn break_and_next_patch_to_exit_and_condition() {
    let mut context = ctx();
    let body = if_(var("c", TypeTable::BOOL), brk(None), nxt(None), TypeTable::NO_RETURN);
    let program = while_(bool_(true), body);
    let out = lower(&mut context, &program, &[("c", TypeTable::BOOL)]);
    expect![[r#"
        <program>:
          jump L2
        L0:
          get_local 0 1
          branch_unless L1
          jump L3
          jump L2
        L1:
          jump L2
        L2:
          put_true
          branch_if L0
        L3:
          put_nil
          leave 0
    "#]]
    .assert_eq(&out);
}

#[test]
fn return_leaves_early() {
    let mut context = ctx();
    let body = exprs(vec![ret(Some(int32(1))), int32(2)], TypeTable::I32);
    let early = def("early", &[], &[], body, TypeTable::I32);
    let program = call(None, "early", vec![], &[&early], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          call 1
          leave 4
        early:
          put_i32 1
          leave 4
          put_i32 2
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn not_negates_a_bool() {
    let mut context = ctx();
    let program = not_(var("c", TypeTable::BOOL));
    let out = lower(&mut context, &program, &[("c", TypeTable::BOOL)]);
    expect![[r#"
        <program>:
          get_local 0 1
          logical_not
          leave 1
    "#]]
    .assert_eq(&out);
}

#[test]
fn ensure_runs_after_the_body_value() {
    let mut context = ctx();
    let program = handler(
        int32(1),
        Some(assign(var("e", TypeTable::I32), int32(2))),
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("e", TypeTable::I32)]);
    expect![[r#"
        <program>:
          put_i32 1
          put_i32 2
          set_local 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn rescue_clauses_are_unsupported() {
    let mut context = ctx();
    let program = node(
        NodeKind::ExceptionHandler {
            body: Box::new(int32(1)),
            rescues: vec![int32(0)],
            else_branch: None,
            ensure: None,
        },
        TypeTable::I32,
    );
    let err = lower_err(&mut context, &program, &[]);
    assert!(matches!(err.kind, CompileErrorKind::Unsupported(_)));
}

#[test]
fn break_outside_a_loop_is_an_error() {
    let mut context = ctx();
    let program = brk(None);
    let err = lower_err(&mut context, &program, &[]);
    assert!(matches!(err.kind, CompileErrorKind::InvalidBreak));
}
