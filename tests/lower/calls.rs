use crate::util::*;
use expect_test::expect;

#[test]
fn blockless_defs_compile_once_per_identity() {
    let mut context = ctx();
    let plus = primitive(TypeTable::I32, "+", "add", &[("other", TypeTable::I32)], TypeTable::I32);
    let body = call(Some(var("x", TypeTable::I32)), "+", vec![int32(1)], &[&plus], TypeTable::I32);
    let add1 = def("add1", &[("x", TypeTable::I32)], &[], body, TypeTable::I32);
    let program = exprs(
        vec![
            call(None, "add1", vec![int32(3)], &[&add1], TypeTable::I32),
            call(None, "add1", vec![int32(3)], &[&add1], TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[]);
    // both sites call the same compiled def
    expect![[r#"
        <program>:
          put_i32 3
          call 1
          pop 4
          put_i32 3
          call 1
          leave 4
        add1:
          get_local 0 4
          put_i32 1
          add_i32
          leave 4
    "#]]
    .assert_eq(&out);
    assert_eq!(context.compiled_defs().len(), 2);
}

#[test]
fn struct_receiver_hands_out_its_slot_address() {
    let mut types = TypeTable::new();
    let point = types.add("Point", TypeKind::Class {
        value_struct: true,
        ivars: vec![
            InstanceVar { name: "@x".to_string(), ty: TypeTable::I32 },
            InstanceVar { name: "@y".to_string(), ty: TypeTable::I32 },
        ],
        superclass: None,
        type_vars: Vec::new(),
    });
    let mut context = Context::new(types);
    let getter = method(point, "x", &[], ivar("@x", TypeTable::I32), TypeTable::I32);
    let program = call(Some(var("p", point)), "x", vec![], &[&getter], TypeTable::I32);
    let out = lower(&mut context, &program, &[("p", point)]);
    expect![[r#"
        <program>:
          pointerof_var 0
          call 1
          leave 4
        x:
          get_self_ivar 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn computed_struct_receiver_travels_as_value_plus_pointer() {
    let mut types = TypeTable::new();
    let point = types.add("Point", TypeKind::Class {
        value_struct: true,
        ivars: vec![
            InstanceVar { name: "@x".to_string(), ty: TypeTable::I32 },
            InstanceVar { name: "@y".to_string(), ty: TypeTable::I32 },
        ],
        superclass: None,
        type_vars: Vec::new(),
    });
    let mut context = Context::new(types);
    let getter = method(point, "x", &[], ivar("@x", TypeTable::I32), TypeTable::I32);
    let receiver = if_(var("c", TypeTable::BOOL), var("p", point), var("q", point), point);
    let program = call(Some(receiver), "x", vec![], &[&getter], TypeTable::I32);
    let out = lower(
        &mut context,
        &program,
        &[("p", point), ("q", point), ("c", TypeTable::BOOL)],
    );
    // each branch leaves [zeroed region][pointer]; the region is popped out
    // from under the result after the call
    expect![[r#"
        <program>:
          get_local 16 1
          branch_unless L0
          push_zeros 8
          pointerof_var 0
          jump L1
        L0:
          push_zeros 8
          pointerof_var 8
        L1:
          call 1
          pop_from_offset 8 4
          leave 4
        x:
          get_self_ivar 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn named_args_emit_in_parameter_order() {
    let mut context = ctx();
    let mix = def(
        "mix",
        &[("a", TypeTable::I32), ("b", TypeTable::I32)],
        &[],
        var("a", TypeTable::I32),
        TypeTable::I32,
    );
    let program = call_named(None, "mix", vec![int32(1)], vec![("b", int32(2))], &[&mix], TypeTable::I32);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 1
          put_i32 2
          call 1
          leave 4
        mix:
          get_local 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn number_literals_autocast_to_the_parameter_kind() {
    let mut context = ctx();
    let takes = def("takes", &[("x", TypeTable::F64)], &[], var("x", TypeTable::F64), TypeTable::F64);
    let program = call(None, "takes", vec![int32(7)], &[&takes], TypeTable::F64);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_f64 7
          call 1
          leave 8
        takes:
          get_local 0 8
          leave 8
    "#]]
    .assert_eq(&out);
}

#[test]
fn symbol_literals_autocast_to_enum_members() {
    let mut types = TypeTable::new();
    let color = types.add("Color", TypeKind::Enum {
        base: TypeTable::I32,
        members: vec![("Red".to_string(), 0), ("DarkBlue".to_string(), 1)],
    });
    let mut context = Context::new(types);
    let paint = def("paint", &[("c", color)], &[], var("c", color), color);
    let program = call(None, "paint", vec![sym("dark_blue")], &[&paint], color);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 1
          call 1
          leave 4
        paint:
          get_local 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn proc_literal_pushes_identity_and_null_context() {
    let mut types = TypeTable::new();
    let proc_ty = types.add("Proc(Int32, Int32)", TypeKind::Proc {
        params: vec![TypeTable::I32],
        ret: TypeTable::I32,
    });
    let mut context = Context::new(types);
    let doubler = def("doubler", &[("x", TypeTable::I32)], &[], var("x", TypeTable::I32), TypeTable::I32);
    let program = proc_lit(doubler, proc_ty);
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i64 1
          put_i64 0
          leave 16
        doubler:
          get_local 0 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn closures_are_rejected() {
    let mut types = TypeTable::new();
    let proc_ty = types.add("Proc(Int32)", TypeKind::Proc { params: vec![], ret: TypeTable::I32 });
    let mut context = Context::new(types);
    let mut inner = (*def("inner", &[], &[], int32(1), TypeTable::I32)).clone();
    inner.closure = true;
    let program = proc_lit(Rc::new(inner), proc_ty);
    let err = lower_err(&mut context, &program, &[]);
    assert!(matches!(err.kind, CompileErrorKind::Unsupported(_)));
}

#[test]
fn fixed_arity_lib_functions_are_cached() {
    let mut types = TypeTable::new();
    let libsys = types.add("LibSys", TypeKind::Lib);
    let mut context = Context::new(types);
    let abs = extern_def(libsys, "abs", "abs", &[("x", TypeTable::I32)], TypeTable::I32, false);
    let program = exprs(
        vec![
            call(Some(path("LibSys", libsys)), "abs", vec![int32(-3)], &[&abs], TypeTable::I32),
            call(Some(path("LibSys", libsys)), "abs", vec![int32(5)], &[&abs], TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_i32 -3
          lib_call 0
          pop 4
          put_i32 5
          lib_call 0
          leave 4
    "#]]
    .assert_eq(&out);
    assert_eq!(context.lib_functions().len(), 1);
}

#[test]
fn variadic_lib_functions_rebuild_per_site() {
    let mut types = TypeTable::new();
    let libsys = types.add("LibSys", TypeKind::Lib);
    let mut context = Context::new(types);
    let printf = extern_def(libsys, "printf", "printf", &[("fmt", TypeTable::STRING)], TypeTable::I32, true);
    let program = exprs(
        vec![
            call(Some(path("LibSys", libsys)), "printf", vec![str_("%d"), int32(1)], &[&printf], TypeTable::I32),
            call(Some(path("LibSys", libsys)), "printf", vec![str_("%d"), int32(2)], &[&printf], TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[]);
    expect![[r#"
        <program>:
          put_string 0
          put_i32 1
          lib_call 0
          pop 4
          put_string 0
          put_i32 2
          lib_call 1
          leave 4
    "#]]
    .assert_eq(&out);
    assert_eq!(context.lib_functions().len(), 2);
}

#[test]
fn out_and_nil_arguments_cross_as_pointers() {
    let mut types = TypeTable::new();
    let libsys = types.add("LibSys", TypeKind::Lib);
    let ptr_i32 = types.add("Pointer(Int32)", TypeKind::Pointer { element: TypeTable::I32 });
    let mut context = Context::new(types);
    let getnum = extern_def(
        libsys,
        "getnum",
        "get_num",
        &[("out", ptr_i32), ("opts", ptr_i32)],
        TypeTable::I32,
        false,
    );
    let out_arg = node(NodeKind::Out(Box::new(var("n", TypeTable::I32))), ptr_i32);
    let program = call(
        Some(path("LibSys", libsys)),
        "getnum",
        vec![out_arg, nil_()],
        &[&getnum],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("n", TypeTable::I32)]);
    expect![[r#"
        <program>:
          pointerof_var 0
          put_i64 0
          lib_call 0
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn pointer_primitives_emit_inline() {
    let mut types = TypeTable::new();
    let ptr_i32 = types.add("Pointer(Int32)", TypeKind::Pointer { element: TypeTable::I32 });
    let ptr_meta = types.add("Pointer(Int32).class", TypeKind::Metaclass { instance: ptr_i32 });
    let mut context = Context::new(types);
    let malloc = primitive(ptr_meta, "malloc", "pointer_malloc", &[("size", TypeTable::U64)], ptr_i32);
    let get = primitive(ptr_i32, "value", "pointer_get", &[], TypeTable::I32);
    let set = primitive(ptr_i32, "value=", "pointer_set", &[("value", TypeTable::I32)], TypeTable::I32);
    let program = exprs(
        vec![
            assign(
                var("p", ptr_i32),
                call(Some(path("Pointer", ptr_meta)), "malloc", vec![int32(3)], &[&malloc], ptr_i32),
            ),
            call(Some(var("p", ptr_i32)), "value=", vec![int32(9)], &[&set], TypeTable::I32),
            call(Some(var("p", ptr_i32)), "value", vec![], &[&get], TypeTable::I32),
        ],
        TypeTable::I32,
    );
    let out = lower(&mut context, &program, &[("p", ptr_i32)]);
    expect![[r#"
        <program>:
          put_i64 3
          pointer_malloc 4
          set_local 0 8
          put_i32 9
          get_local 0 8
          pointer_set 4
          get_local 0 8
          pointer_get 4
          leave 4
    "#]]
    .assert_eq(&out);
}

#[test]
fn calls_without_targets_are_frontend_errors() {
    let mut context = ctx();
    let program = call(None, "ghost", vec![], &[], TypeTable::I32);
    let err = lower_err(&mut context, &program, &[]);
    assert!(matches!(err.kind, CompileErrorKind::MissingTargets(_)));
}

#[test]
fn node_map_resolves_instruction_offsets() {
    let mut context = ctx();
    let mut literal = int32(1);
    literal.location = Location::new(3, 7);
    opal::compile_program(&mut context, &literal, &[]).unwrap();
    let compiled = &context.compiled_defs()[0];
    assert_eq!(compiled.node_map.lookup(0), Some(Location::new(3, 7)));
}
