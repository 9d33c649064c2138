use alien::{CallConvention, Context, ErrorCode, StructOptions, Value};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[repr(C)]
struct Samples {
    n: u16,
    items: [i32; 0],
}

extern "C" fn total(s: *const Samples) -> i32 {
    let s = unsafe { &*s };
    let items = unsafe { std::slice::from_raw_parts(s.items.as_ptr(), s.n as usize) };
    items.iter().sum()
}

extern "C" fn double_all(s: *mut Samples) {
    let s = unsafe { &mut *s };
    let items = unsafe { std::slice::from_raw_parts_mut(s.items.as_mut_ptr(), s.n as usize) };
    for v in items {
        *v *= 2;
    }
}

fn define_samples(ctx: &Context) {
    ctx.define_struct("Samples", &"n ushort items int[n]".into(), StructOptions::default())
        .unwrap();
}

#[test]
fn variable_size_structs_cross_the_boundary() {
    init();
    let ctx = Context::default();
    define_samples(&ctx);
    ctx.define_function_at(
        "total",
        total as usize,
        &"int".into(),
        &"s {struct.Samples byref}".into(),
        CallConvention::Default,
    )
    .unwrap();
    ctx.define_function_at(
        "doubleAll",
        double_all as usize,
        &"void".into(),
        &"s {struct.Samples inout}".into(),
        CallConvention::Default,
    )
    .unwrap();

    let value = Value::from("n 4 items {1 2 3 4}");
    assert_eq!(ctx.invoke(&"total".into(), &[value.clone()]).unwrap(), Value::Int(10));

    ctx.host.set_var("s", value);
    ctx.invoke(&"doubleAll".into(), &["s".into()]).unwrap();
    let doubled = ctx.host.get_var("s").unwrap();
    assert_eq!(doubled.get("items").unwrap().to_string(), "2 4 6 8");
}

#[test]
fn instance_sizes_follow_count_fields() {
    init();
    let ctx = Context::default();
    define_samples(&ctx);
    assert_eq!(ctx.struct_size_for_count("Samples", 3).unwrap(), 16);
    let p = Value::Pointer(
        ctx.memory_new(&"struct.Samples".into(), &"n 3 items {7 8 9}".into())
            .unwrap(),
    );
    assert_eq!(ctx.memory_instance_size(&p, &"struct.Samples".into()).unwrap(), 16);
    assert_eq!(ctx.struct_get("Samples", &p, "items", Some(1)).unwrap(), Value::Int(8));
    let bytes = ctx.memory_to_binary(&p, 16, 0).unwrap();
    let back = ctx.struct_from_binary("Samples", &bytes).unwrap();
    assert_eq!(back.to_string(), "n 3 items {7 8 9}");
    ctx.memory_free(&p).unwrap();
}

#[test]
fn arena_frames_nest() {
    init();
    let ctx = Context::default();
    ctx.arena_push().unwrap();
    let outer = Value::Pointer(ctx.arena_allocate(24, Some("Outer")).unwrap());
    ctx.arena_push().unwrap();
    let inner = Value::Pointer(ctx.arena_new(&"int[2]".into(), &"5 6".into()).unwrap());
    let big = Value::Pointer(ctx.arena_allocate(256 * 1024, None).unwrap());
    assert!(ctx.arena_validate());
    assert_eq!(ctx.memory_get(&inner, &"int".into(), 4).unwrap(), Value::Int(6));

    ctx.arena_pop().unwrap();
    assert!(!ctx.pointer_is_valid(&inner));
    assert!(!ctx.pointer_is_valid(&big));
    assert!(ctx.pointer_is_valid(&outer), "outer frame survives");
    assert!(ctx.arena_validate());

    ctx.arena_pop().unwrap();
    assert!(!ctx.pointer_is_valid(&outer));
    assert_eq!(ctx.arena_pop().unwrap_err().code, ErrorCode::OperFailed);
}

#[test]
fn introspection() {
    init();
    let ctx = Context::default();
    define_samples(&ctx);
    assert_eq!(ctx.limits("uchar").unwrap(), (0, 255));
    assert_eq!(ctx.limits("short").unwrap(), (-32768, 32767));
    assert!(ctx.limits("double").is_err());
    assert_eq!(ctx.struct_field_names("Samples").unwrap(), vec!["n", "items"]);
    let info = ctx.struct_info("Samples").unwrap();
    assert!(info.to_string().contains("items"), "{info}");
}
