use crate::util::*;
use expect_test::expect;

#[test]
fn adds_two_literals() {
    let mut context = ctx();
    let plus = primitive(TypeTable::I32, "+", "add", &[("other", TypeTable::I32)], TypeTable::I32);
    let program = call(Some(int32(1)), "+", vec![int32(2)], &[&plus], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 1
          put_i32 2
          add_i32
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn local_assignment_roundtrip() {
    let mut context = ctx();
    let program = exprs(
        vec![
            assign(var("a", TypeTable::I32), int32(1)),
            var("a", TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("a", TypeTable::I32)]);
    expect![[r#"
        <program>:
          put_i32 1
          set_local 0 4
          get_local 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn strings_intern_to_one_handle() {
    let mut context = ctx();
    let program = exprs(
        vec![
            assign(var("a", TypeTable::STRING), str_("hi")),
            assign(var("b", TypeTable::STRING), str_("hi")),
            var("b", TypeTable::STRING),
        ],
        TypeTable::STRING,
    );
    let out = lower(
        &mut context,
        &program,
        &[("a", TypeTable::STRING), ("b", TypeTable::STRING)],
    );
    expect![[r#"
        <program>:
          put_string 0
          set_local 0 8
          put_string 0
          set_local 8 8
          get_local 8 8
          leave 8
    "#]]
    .assert_eq(&out);
}

#[test]
fn symbols_push_their_table_index() {
    let mut context = ctx();
    let program = exprs(
        vec![
            assign(var("s", TypeTable::SYMBOL), sym("go")),
            var("s", TypeTable::SYMBOL),
        ],
        TypeTable::SYMBOL,
    );
    let out = lower(&mut context, &program, &[("s", TypeTable::SYMBOL)]);
    expect![[r#"
        <program>:
          put_symbol 0
          set_local 0 4
          get_local 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn tuple_literal_lays_out_padded_elements() {
    let mut types = TypeTable::new();
    let pair = types.add("{Bool, Int32}", TypeKind::Tuple {
        elements: vec![TypeTable::BOOL, TypeTable::I32],
    });
    let mut context = Context::new(types);
    let index_op = primitive(pair, "[]", "tuple_get", &[("index", TypeTable::I32)], TypeTable::I32);
    let program = exprs(
        vec![
            assign(var("t", pair), tuple(vec![bool_(true), int32(5)], pair)),
            call(Some(var("t", pair)), "[]", vec![int32(1)], &[&index_op], TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("t", pair)]);
    expect![[r#"
        <program>:
          put_true
          push_zeros 3
          put_i32 5
          set_local 0 8
          get_local 0 8
          tuple_get 8 4 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn named_tuple_literal_follows_type_entry_order() {
    let mut types = TypeTable::new();
    let record = types.add("{a: Int32, b: Float64}", TypeKind::NamedTuple {
        entries: vec![
            ("a".to_string(), TypeTable::I32),
            ("b".to_string(), TypeTable::F64),
        ],
    });
    let mut context = Context::new(types);
    let program = named_tuple(vec![("b", f64_(2.5)), ("a", int32(1))], record);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 1
          push_zeros 4
          put_f64 2.5
          leave 16
    "#]]
    .assert_eq(&out);
}

#[test]
fn discarded_expressions_emit_no_pushes() {
    let mut context = ctx();
    let program = exprs(vec![int32(1), int32(2)], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 2
          leave 4
    "#]]
    .assert_eq(&out);
}
