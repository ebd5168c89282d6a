use crate::util::*;
use expect_test::expect;

fn int_or_string(types: &mut TypeTable) -> TypeId {
    types.add("(Int32 | String)", TypeKind::MixedUnion {
        variants: vec![TypeTable::I32, TypeTable::STRING],
    })
}

#[test]
fn values_box_into_mixed_unions() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let program = exprs(
        vec![assign(var("u", union), int32(1)), var("u", union)],
        union,
    );
    let out = lower(&mut context, &program, &[("u", union)]);
    expect![[r#"
        <program>:
          put_i32 1
          put_in_union 6 4 16
          set_local 0 16
          get_local 0 16
          leave 16
    "#]]
    .assert_eq(&out);
}

#[test]
fn narrowed_reads_unbox_the_union() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let program = exprs(
        vec![assign(var("u", union), int32(1)), var("u", TypeTable::I32)],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("u", union)]);
    // box then unbox is the identity on the payload
    expect![[r#"
        <program>:
          put_i32 1
          put_in_union 6 4 16
          set_local 0 16
          get_local 0 16
          remove_from_union 16 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn nil_boxes_into_mixed_unions() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let program = exprs(
        vec![assign(var("u", union), nil_()), var("u", union)],
        union,
    );
    let out = lower(&mut context, &program, &[("u", union)]);
    expect![[r#"
        <program>:
          put_nil
          put_in_union 0 0 16
          set_local 0 16
          get_local 0 16
          leave 16
    "#]]
    .assert_eq(&out);
}

#[test]
fn union_is_a_compares_the_stored_tag() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let program = is_a(var("u", union), TypeTable::I32);
    let out = lower(&mut context, &program, &[("u", union)]);
    expect![[r#"
        <program>:
          get_local 0 16
          union_is_a 16 6
          leave 1
    "#]]
    .assert_eq(&out);
}

#[test]
fn reference_is_a_compares_the_header_type_id() {
    let mut types = TypeTable::new();
    let animal = types.add("Animal", TypeKind::Class {
        value_struct: false,
        ivars: Vec::new(),
        superclass: None,
        type_vars: Vec::new(),
    });
    let dog = types.add("Dog", TypeKind::Class {
        value_struct: false,
        ivars: Vec::new(),
        superclass: Some(animal),
        type_vars: Vec::new(),
    });
    let cat = types.add("Cat", TypeKind::Class {
        value_struct: false,
        ivars: Vec::new(),
        superclass: Some(animal),
        type_vars: Vec::new(),
    });
    let virt = types.add("Animal+", TypeKind::Virtual { base: animal, concrete: vec![dog, cat] });
    let mut context = Context::new(types);
    let program = is_a(var("a", virt), dog);
    let out = lower(&mut context, &program, &[("a", virt)]);
    expect![[r#"
        <program>:
          get_local 0 8
          reference_is_a 17
          leave 1
    "#]]
    .assert_eq(&out);
}

#[test]
fn nilable_pointers_compare_against_null() {
    let mut types = TypeTable::new();
    let nilable = types.add("String?", TypeKind::NilableReference { reference: TypeTable::STRING });
    let mut context = Context::new(types);
    let program = is_a(var("s", nilable), TypeTable::NIL);
    let out = lower(&mut context, &program, &[("s", nilable)]);
    expect![[r#"
        <program>:
          get_local 0 8
          pointer_is_null
          leave 1
    "#]]
    .assert_eq(&out);

    let mut types = TypeTable::new();
    let nilable = types.add("String?", TypeKind::NilableReference { reference: TypeTable::STRING });
    let mut context = Context::new(types);
    let program = is_a(var("s", nilable), TypeTable::STRING);
    let out = lower(&mut context, &program, &[("s", nilable)]);
    expect![[r#"
        <program>:
          get_local 0 8
          pointer_is_not_null
          leave 1
    "#]]
    .assert_eq(&out);
}

#[test]
fn union_conditions_test_truthiness() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let program = if_(var("u", union), int32(1), int32(2), TypeTable::I32);
    let out = lower(&mut context, &program, &[("u", union)]);
    expect![[r#"
        <program>:
          get_local 0 16
          union_truthy 16
          branch_unless L0
          put_i32 1
          jump L1
        L0:
          put_i32 2
        L1:
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn casts_check_then_unbox() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let program = cast(var("u", union), TypeTable::I32);
    let out = lower(&mut context, &program, &[("u", union)]);
    expect![[r#"
        <program>:
          get_local 0 16
          dup 16
          union_is_a 16 6
          branch_if L0
          unreachable 0
        L0:
          remove_from_union 16 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn nilable_casts_fall_through_to_nil() {
    let mut types = TypeTable::new();
    let nilable = types.add("String?", TypeKind::NilableReference { reference: TypeTable::STRING });
    let mut context = Context::new(types);
    let program = nilable_cast(var("s", nilable), TypeTable::STRING, nilable);
    let out = lower(&mut context, &program, &[("s", nilable)]);
    expect![[r#"
        <program>:
          get_local 0 8
          dup 8
          pointer_is_not_null
          branch_unless L0
          jump L1
        L0:
          pop 8
          put_i64 0
        L1:
          leave 8
    "#]]
    .assert_eq(&out);
}

#[test]
fn multidispatch_synthesizes_a_cached_trampoline() {
    let mut types = TypeTable::new();
    let union = int_or_string(&mut types);
    let mut context = Context::new(types);
    let foo_int = def("foo", &[("x", TypeTable::I32)], &[], int32(1), TypeTable::I32);
    let foo_str = def("foo", &[("x", TypeTable::STRING)], &[], int32(2), TypeTable::I32);
    let program = exprs(
        vec![
            call(None, "foo", vec![var("u", union)], &[&foo_int, &foo_str], TypeTable::I32),
            call(None, "foo", vec![var("u", union)], &[&foo_int, &foo_str], TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("u", union)]);
    // the second site reuses the cached trampoline and its candidates
    expect![[r#"
        <program>:
          get_local 0 16
          call 1
          pop 4
          get_local 0 16
          call 1
          leave 4
        foo:dispatch:
          get_local 0 16
          union_is_a 16 6
          branch_unless L0
          get_local 0 16
          remove_from_union 16 4
          call 2
          leave 4
        L0:
          get_local 0 16
          remove_from_union 16 8
          call 3
          leave 4
        foo:
          put_i32 1
          leave 4
        foo:
          put_i32 2
          leave 4
    "#]]
    .assert_eq(&out);
    assert_eq!(context.compiled_defs().len(), 4);
}
