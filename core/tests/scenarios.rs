use std::sync::Arc;

use bytepatch_core::PatchError;
use bytepatch_core::code::unitfile::{UnitFile, load_unit_file, write_unit_file};
use bytepatch_core::code::{CodeUnit, Const, UnitBuilder};
use bytepatch_core::ir::Opcode;
use bytepatch_core::patch::Function;
use bytepatch_core::patch::apply::{omit_return, optimize, replace};
use bytepatch_core::runtime::{Value, Vm, VmContext};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

fn call(func: &Function, ctx: &mut VmContext, args: &[Value]) -> Value {
    Vm::new().exec_with(func, ctx, Some(args)).expect("call")
}

/// Compiles a module-level snippet the way a statement would be compiled.
fn snippet(build: impl FnOnce(&mut UnitBuilder)) -> CodeUnit {
    let mut b = UnitBuilder::module("<snippet>");
    build(&mut b);
    b.load_const(Const::None).op(Opcode::ReturnValue);
    b.build().expect("snippet")
}

fn assign_p(value: i64) -> CodeUnit {
    snippet(|b| {
        b.load_const(Const::Int(value)).store_name("p");
    })
}

fn p_minus(value: i64) -> CodeUnit {
    snippet(|b| {
        b.load_name("p").load_const(Const::Int(value)).op(Opcode::BinarySubtract).op(Opcode::PopTop);
    })
}

/// def f():
///     p = 1
///     g = lambda: print("hi")
///     g()
///     return p - 3
fn build_f() -> Function {
    let mut lambda = UnitBuilder::function("<lambda>", &[]);
    lambda
        .load_global("print")
        .load_const(Const::str("hi"))
        .op_arg(Opcode::CallFunction, 1)
        .op(Opcode::ReturnValue);
    let lambda = lambda.build().expect("lambda");

    let mut b = UnitBuilder::function("f", &[]);
    b.load_const(Const::Int(1))
        .store_fast("p")
        .load_const(Const::code(lambda))
        .load_const(Const::str("f.<locals>.<lambda>"))
        .op_arg(Opcode::MakeFunction, 0)
        .store_fast("g")
        .load_fast("g")
        .op_arg(Opcode::CallFunction, 0)
        .op(Opcode::PopTop)
        .load_fast("p")
        .load_const(Const::Int(3))
        .op(Opcode::BinarySubtract)
        .op(Opcode::ReturnValue);
    Function::new(b.build().expect("f"))
}

#[test]
fn replace_constants_through_snippets() {
    init_tracing();
    let mut f = build_f();
    let mut ctx = VmContext::capturing();
    assert_eq!(call(&f, &mut ctx, &[]), Value::Int(-2));

    assert_eq!(replace(&mut f, &p_minus(3), &p_minus(4), true), Ok(1));
    assert_eq!(replace(&mut f, &assign_p(1), &assign_p(3), true), Ok(1));

    let mut ctx = VmContext::capturing();
    assert_eq!(call(&f, &mut ctx, &[]), Value::Int(-1));
    assert_eq!(ctx.output(), ["hi".to_string()]);
    assert_eq!(f.code().argcount, 0);
    assert_eq!(f.code().tables.locals.len(), 2);
}

#[test]
fn failed_replace_keeps_installed_body() {
    let mut f = build_f();
    let installed = Arc::clone(f.code());
    assert_eq!(
        replace(&mut f, &p_minus(9), &p_minus(4), true),
        Err(PatchError::PatternNotFound)
    );
    assert!(Arc::ptr_eq(&installed, f.code()));
}

#[test]
fn omit_return_yields_expression_value() {
    init_tracing();
    // def add(a, b): a + b
    let mut b = UnitBuilder::function("add", &["a", "b"]);
    b.load_fast("a")
        .load_fast("b")
        .op(Opcode::BinaryAdd)
        .op(Opcode::PopTop)
        .load_const(Const::None)
        .op(Opcode::ReturnValue);
    let mut add = Function::new(b.build().expect("add"));
    let mut ctx = VmContext::new();
    assert_eq!(call(&add, &mut ctx, &[Value::Int(1), Value::Int(2)]), Value::None);

    assert_eq!(omit_return(&mut add), Ok(1));
    assert_eq!(call(&add, &mut ctx, &[Value::Int(1), Value::Int(2)]), Value::Int(3));
    assert_eq!(add.code().code, vec![124, 0, 124, 1, 23, 0, 83, 0]);

    // Nothing left to rewrite.
    let installed = Arc::clone(add.code());
    assert_eq!(omit_return(&mut add), Ok(0));
    assert!(Arc::ptr_eq(&installed, add.code()));
}

#[test]
fn omit_return_through_branches() {
    // def choose(c, a, b):
    //     if c: a
    //     else: b
    let mut b = UnitBuilder::function("choose", &["c", "a", "b"]);
    let other = b.label();
    let end = b.label();
    b.load_fast("c")
        .jump(Opcode::PopJumpIfFalse, other)
        .load_fast("a")
        .op(Opcode::PopTop)
        .jump(Opcode::JumpForward, end)
        .bind(other)
        .load_fast("b")
        .op(Opcode::PopTop)
        .bind(end)
        .load_const(Const::None)
        .op(Opcode::ReturnValue);
    let mut choose = Function::new(b.build().expect("choose"));

    assert_eq!(omit_return(&mut choose), Ok(2));
    assert_eq!(
        choose.code().code,
        vec![124, 0, 114, 8, 124, 1, 110, 2, 124, 2, 83, 0]
    );
    let mut ctx = VmContext::new();
    let args = |c| [Value::Bool(c), Value::Int(1), Value::Int(2)];
    assert_eq!(call(&choose, &mut ctx, &args(true)), Value::Int(1));
    assert_eq!(call(&choose, &mut ctx, &args(false)), Value::Int(2));
}

#[test]
fn optimize_collapses_copy_chain() {
    init_tracing();
    // def g(): x = 1; y = x; z = y; return z
    let mut b = UnitBuilder::function("g", &[]);
    b.load_const(Const::Int(1))
        .store_fast("x")
        .load_fast("x")
        .store_fast("y")
        .load_fast("y")
        .store_fast("z")
        .load_fast("z")
        .op(Opcode::ReturnValue);
    let mut g = Function::new(b.build().expect("g"));

    // def one(): return 1
    let mut b = UnitBuilder::function("one", &[]);
    b.load_const(Const::Int(1)).op(Opcode::ReturnValue);
    let one = b.build().expect("one");

    assert_eq!(optimize(&mut g), Ok(3));
    assert_eq!(g.code().code, one.code);
    assert_eq!(g.code().tables, one.tables);
    assert_eq!(g.code().nlocals, 0);
    assert_eq!(call(&g, &mut VmContext::new(), &[]), Value::Int(1));

    let once = g.code().code.clone();
    assert_eq!(optimize(&mut g), Ok(0));
    assert_eq!(g.code().code, once);
}

fn loop_function(name: &str, copy_through: bool) -> CodeUnit {
    let mut b = UnitBuilder::function(name, &[]);
    let after = b.label();
    let head = b.label();
    let exit = b.label();
    b.jump(Opcode::SetupLoop, after)
        .load_global("range")
        .load_const(Const::Int(10))
        .op_arg(Opcode::CallFunction, 1)
        .op(Opcode::GetIter)
        .bind(head)
        .jump(Opcode::ForIter, exit);
    if copy_through {
        b.store_fast("i").load_fast("i").store_fast("j");
    } else {
        b.store_fast("j");
    }
    b.jump(Opcode::JumpAbsolute, head)
        .bind(exit)
        .op(Opcode::PopBlock)
        .bind(after)
        .load_fast("j")
        .op(Opcode::ReturnValue);
    b.build().expect("loop")
}

#[test]
fn optimize_inside_loop_body() {
    // def juanita():
    //     for i in range(10):
    //         j = i
    //     return j
    let mut juanita = Function::new(loop_function("juanita", true));
    let reference = loop_function("reference", false);

    assert_eq!(optimize(&mut juanita), Ok(1));
    assert_eq!(
        juanita.code().code,
        vec![120, 16, 116, 0, 100, 1, 131, 1, 68, 0, 93, 4, 125, 0, 113, 10, 87, 0, 124, 0, 83, 0]
    );
    assert_eq!(juanita.code().code, reference.code);
    assert_eq!(call(&juanita, &mut VmContext::new(), &[]), Value::Int(9));
}

#[test]
fn install_rejects_other_calling_convention() {
    let mut b = UnitBuilder::function("one", &["x"]);
    b.load_fast("x").op(Opcode::ReturnValue);
    let mut one = Function::new(b.build().expect("one"));

    let mut b = UnitBuilder::function("two", &["x", "y"]);
    b.load_fast("y").op(Opcode::ReturnValue);
    let err = one.install(b.build().expect("two")).unwrap_err();
    assert!(matches!(err, PatchError::IncompatibleInstall { .. }));
    assert!(err.to_string().contains("argcount"));
}

#[test]
fn patch_unit_loaded_from_disk() {
    let mut b = UnitBuilder::function("g", &[]);
    b.load_const(Const::Int(5)).store_fast("x").load_fast("x").op(Opcode::ReturnValue);
    let epoch = chrono::DateTime::from_timestamp(0, 0).expect("epoch");
    let bytes = write_unit_file(&UnitFile::new(b.build().expect("g"), epoch, 42)).expect("write");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("g.unit");
    std::fs::write(&path, bytes).expect("write file");

    let loaded = load_unit_file(&path).expect("load");
    let mut g = Function::new(loaded.unit);
    assert_eq!(optimize(&mut g), Ok(1));
    assert_eq!(g.code().code, vec![100, 1, 83, 0]);
    assert_eq!(call(&g, &mut VmContext::new(), &[]), Value::Int(5));
}

#[test]
fn optimize_preserves_result_of_overwritten_variable() {
    // x = 1; x = 3 (with 2 left below it); return x
    let mut b = UnitBuilder::function("h", &[]);
    b.load_const(Const::Int(1))
        .store_fast("x")
        .load_const(Const::Int(2))
        .load_const(Const::Int(3))
        .store_fast("x")
        .op(Opcode::PopTop)
        .load_fast("x")
        .op(Opcode::ReturnValue);
    let mut h = Function::new(b.build().expect("h"));
    let before = call(&h, &mut VmContext::new(), &[]);
    assert_eq!(before, Value::Int(3));

    assert_eq!(optimize(&mut h), Ok(0));
    assert_eq!(call(&h, &mut VmContext::new(), &[]), before);
}
