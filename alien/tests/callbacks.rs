use std::sync::{Arc, Mutex};

use alien::{CallConvention, Command, Context, ErrorCode, StructOptions, Value};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

extern "C" fn apply(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(x)
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

extern "C" fn visit(f: extern "C" fn(*const Point), x: i32, y: i32) {
    let p = Point { x, y };
    f(&p);
}

fn setup(ctx: &Context) {
    ctx.define_prototype("unary", &"int".into(), &"x int".into(), CallConvention::Default)
        .unwrap();
    ctx.define_function_at(
        "apply",
        apply as usize,
        &"int".into(),
        &"f pointer x int".into(),
        CallConvention::Default,
    )
    .unwrap();
}

#[test]
fn callbacks_reenter_the_interpreter() {
    init();
    let ctx = Context::default();
    setup(&ctx);
    ctx.define_function_at("add", add as usize, &"int".into(), &"a int b int".into(), CallConvention::Default)
        .unwrap();
    // The command makes a nested native call of its own.
    let plus_ten: Command = Arc::new(|ctx: &Context, args: &[Value]| {
        ctx.invoke(&"add".into(), &[args[0].clone(), 10.into()])
    });
    ctx.host.register("plusTen", plus_ten);

    let cb = ctx.callback_new("unary", &"plusTen".into(), Some(&(-1).into())).unwrap();
    assert_eq!(ctx.callback_list(), vec![cb.clone()]);
    let result = ctx
        .invoke(&"apply".into(), &[Value::Pointer(cb.clone()), 5.into()])
        .unwrap();
    assert_eq!(result, Value::Int(15));
    ctx.callback_free(&Value::Pointer(cb)).unwrap();
    assert!(ctx.callback_list().is_empty());
}

#[test]
fn a_running_callback_cannot_be_freed() {
    init();
    let ctx = Context::default();
    setup(&ctx);
    let me: Arc<Mutex<Option<Value>>> = Arc::default();
    let free_error: Arc<Mutex<Option<ErrorCode>>> = Arc::default();
    let (me2, err2) = (me.clone(), free_error.clone());
    let suicidal: Command = Arc::new(move |ctx: &Context, args: &[Value]| {
        let ptr = me2.lock().unwrap().clone().unwrap();
        *err2.lock().unwrap() = ctx.callback_free(&ptr).err().map(|e| e.code);
        Ok(Value::from(args[0].as_integer()? as i64 * 2))
    });
    ctx.host.register("suicidal", suicidal);

    let cb = Value::Pointer(ctx.callback_new("unary", &"suicidal".into(), Some(&0.into())).unwrap());
    *me.lock().unwrap() = Some(cb.clone());
    let result = ctx.invoke(&"apply".into(), &[cb.clone(), 21.into()]).unwrap();
    assert_eq!(result, Value::Int(42), "the callback still completes");
    assert_eq!(*free_error.lock().unwrap(), Some(ErrorCode::OperFailed));

    ctx.callback_free(&cb).unwrap();
    assert!(!ctx.pointer_is_valid(&cb));
}

#[test]
fn failures_return_the_error_result() {
    init();
    let ctx = Context::default();
    setup(&ctx);
    let cb = ctx
        .callback_new("unary", &"noSuchCommand".into(), Some(&(-7).into()))
        .unwrap();
    let result = ctx.invoke(&"apply".into(), &[Value::Pointer(cb.clone()), 1.into()]).unwrap();
    assert_eq!(result, Value::Int(-7));
    ctx.callback_free(&Value::Pointer(cb)).unwrap();
}

#[test]
fn byref_struct_arguments_arrive_as_dicts() {
    init();
    let ctx = Context::default();
    ctx.define_struct("Point", &"x int y int".into(), StructOptions::default())
        .unwrap();
    ctx.define_prototype(
        "visitor",
        &"void".into(),
        &"p {struct.Point byref}".into(),
        CallConvention::Default,
    )
    .unwrap();
    ctx.define_function_at(
        "visit",
        visit as usize,
        &"void".into(),
        &"f pointer x int y int".into(),
        CallConvention::Default,
    )
    .unwrap();
    let seen: Arc<Mutex<Option<Value>>> = Arc::default();
    let sink = seen.clone();
    let record: Command = Arc::new(move |_: &Context, args: &[Value]| {
        *sink.lock().unwrap() = Some(args[0].clone());
        Ok(Value::Empty)
    });
    ctx.host.register("record", record);
    let cb = ctx.callback_new("visitor", &"record".into(), None).unwrap();
    ctx.invoke(&"visit".into(), &[Value::Pointer(cb), 3.into(), 9.into()])
        .unwrap();
    let p = seen.lock().unwrap().clone().unwrap();
    assert_eq!(p.get("x"), Some(Value::Int(3)));
    assert_eq!(p.get("y"), Some(Value::Int(9)));
}
