//! Native entry points that forward to interpreter commands.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{
    AlienError, Context, ContextShared, PointerValue, Result, Value,
    attrs::AttrFlags,
    backend::{ClosureHandler, ClosureSignature, NativeClosure, NativeKind},
    base_type::BaseType,
    codec::read_address,
    prototype::FunctionPrototype,
};

struct CallbackState {
    ctx: Weak<ContextShared>,
    proto: Arc<FunctionPrototype>,
    command: Value,
    error_result: Option<Value>,
    /// Invocations currently on the stack.
    active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CallbackState {
    fn dispatch(&self, ctx: &Context, args: &[*const u8], ret: *mut u8) -> Result<()> {
        let mut values = Vec::with_capacity(args.len());
        for (param, &arg) in self.proto.params.iter().zip(args) {
            let value = if param.ta.has(AttrFlags::BYREF) {
                let address = unsafe { read_address(arg) };
                if address == 0 {
                    Value::Empty
                } else {
                    unsafe { ctx.value_from_native(&param.ta, address as *const u8, None)? }
                }
            } else {
                unsafe { ctx.scalar_from_native(&param.ta, arg)? }
            };
            values.push(value);
        }
        let result = ctx.invoke(&self.command, &values)?;
        if self.proto.ret.ty.base != BaseType::Void {
            unsafe { ctx.scalar_to_native(&self.proto.ret, &result, ret, None)? };
        }
        Ok(())
    }
}

impl ClosureHandler for CallbackState {
    fn invoke(&self, args: &[*const u8], ret: *mut u8) {
        let Some(ctx) = Context::upgrade(&self.ctx) else {
            log::warn!("callback {} invoked after its context was dropped", self.proto.name);
            return;
        };
        let _active = ActiveGuard::enter(&self.active);
        log::trace!("callback {} with {} args", self.proto.name, args.len());
        if let Err(err) = self.dispatch(&ctx, args, ret) {
            log::warn!("callback {} failed: {err}", self.proto.name);
            if let Some(fallback) = &self.error_result
                && let Err(err) = unsafe { ctx.scalar_to_native(&self.proto.ret, fallback, ret, None) }
            {
                log::warn!("callback {} error result rejected: {err}", self.proto.name);
            }
        }
    }
}

struct CallbackEntry {
    pointer: PointerValue,
    state: Arc<CallbackState>,
    // Dropping the closure frees the entry point.
    _closure: Box<dyn NativeClosure>,
}

#[derive(Default)]
pub struct CallbackTable {
    entries: RwLock<HashMap<usize, CallbackEntry>>,
}

impl Context {
    fn check_callback_prototype(&self, proto: &FunctionPrototype, error_result: Option<&Value>) -> Result<()> {
        let fail = |msg: String| Err(AlienError::invalid(format!("{msg} in callback prototype \"{}\".", proto.name)));
        if !self.backend.supports_callbacks() {
            return Err(AlienError::invalid("Callbacks are not supported by this backend."));
        }
        if proto.varargs {
            return fail("Variadic parameters are not allowed".into());
        }
        let forbidden = AttrFlags::OUTPUT
            .with(AttrFlags::ERROR_SOURCE)
            .with(AttrFlags::REQUIREMENT)
            .with(AttrFlags::STORE)
            .with(AttrFlags::STRUCTSIZE);
        for p in &proto.params {
            let ta = &p.ta;
            let base = ta.ty.base;
            if ta.ty.count.is_array() || base.is_char_array() {
                return fail(format!("Array parameter \"{}\" is not allowed", p.name));
            }
            if ta.flags.intersects(forbidden) {
                return fail(format!("Parameter \"{}\" has attributes not allowed", p.name));
            }
            if base == BaseType::Pointer && !ta.has(AttrFlags::UNSAFE) {
                return fail(format!("Pointer parameter \"{}\" must be unsafe", p.name));
            }
            if base == BaseType::Struct && !ta.has(AttrFlags::BYREF) {
                return fail(format!("Struct parameter \"{}\" must be byref", p.name));
            }
            if base == BaseType::Binary {
                return fail(format!("Binary parameter \"{}\" is not allowed", p.name));
            }
        }
        let ret = &proto.ret;
        if ret.ty.base == BaseType::Void {
            return Ok(());
        }
        if ret.ty.base.is_string() || ret.ty.base == BaseType::Struct || ret.has(AttrFlags::BYREF) {
            return fail("Return type is not allowed".into());
        }
        let Some(fallback) = error_result else {
            return fail("An error result is required for a non-void return".into());
        };
        let mut scratch = [0u64; 2];
        unsafe { self.scalar_to_native(ret, fallback, scratch.as_mut_ptr().cast(), None) }
            .map_err(|e| e.context("Invalid callback error result:"))
    }

    /// Creates a native function pointer that invokes `command` with the
    /// converted arguments. The pointer is tagged with the prototype name.
    pub fn callback_new(
        &self,
        proto_name: &str,
        command: &Value,
        error_result: Option<&Value>,
    ) -> Result<PointerValue> {
        let proto = self.prototypes.lookup(proto_name)?;
        self.check_callback_prototype(&proto, error_result)?;
        let sig = ClosureSignature {
            conv: proto.conv,
            ret: NativeKind::of(&proto.ret.ty),
            args: proto
                .params
                .iter()
                .map(|p| {
                    if p.ta.has(AttrFlags::BYREF) {
                        NativeKind::Pointer
                    } else {
                        NativeKind::of(&p.ta.ty)
                    }
                })
                .collect(),
        };
        let state = Arc::new(CallbackState {
            ctx: self.downgrade(),
            proto: proto.clone(),
            command: command.clone(),
            error_result: error_result.cloned(),
            active: AtomicUsize::new(0),
        });
        let closure = self.backend.create_closure(sig, state.clone())?;
        let pointer = PointerValue::new(closure.code(), Some(&proto.name));
        self.pointers.register(&pointer, false)?;
        log::debug!("created callback {pointer} for {command}");
        self.callbacks.entries.write().insert(
            pointer.address,
            CallbackEntry {
                pointer: pointer.clone(),
                state,
                _closure: closure,
            },
        );
        Ok(pointer)
    }

    /// Releases a callback. Fails while the callback is executing.
    pub fn callback_free(&self, ptr: &Value) -> Result<()> {
        let ptr = ptr.as_pointer()?;
        let entry = {
            let mut entries = self.callbacks.entries.write();
            let Some(entry) = entries.get(&ptr.address) else {
                return Err(AlienError::not_found("Callback", &ptr.to_string()));
            };
            if entry.state.active.load(Ordering::SeqCst) > 0 {
                return Err(AlienError::oper_failed(format!(
                    "Callback {} is active and cannot be deleted.",
                    entry.pointer
                )));
            }
            entries.remove(&ptr.address)
        };
        if let Some(entry) = entry {
            self.pointers.unregister(&entry.pointer)?;
            log::debug!("freed callback {}", entry.pointer);
        }
        Ok(())
    }

    pub fn callback_list(&self) -> Vec<PointerValue> {
        let mut list: Vec<PointerValue> = self
            .callbacks
            .entries
            .read()
            .values()
            .map(|e| e.pointer.clone())
            .collect();
        list.sort_by_key(|p| p.address);
        list
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{CallConvention, Command, ErrorCode};

    fn define(ctx: &Context, name: &str, ret: &str, params: &str) {
        ctx.define_prototype(name, &Value::from(ret), &Value::from(params), CallConvention::Default)
            .unwrap();
    }

    #[test]
    fn eligibility() {
        let ctx = Context::default();
        define(&ctx, "bad_array", "void", "a int[2]");
        define(&ctx, "bad_ptr", "void", "p pointer");
        define(&ctx, "bad_out", "void", "p {int out}");
        define(&ctx, "bad_ret", "string", "");
        define(&ctx, "needs_error", "int", "a int");
        let cmd = Value::from("noop");
        for name in ["bad_array", "bad_ptr", "bad_out", "bad_ret"] {
            assert!(ctx.callback_new(name, &cmd, Some(&Value::from(0))).is_err(), "{name}");
        }
        assert!(ctx.callback_new("needs_error", &cmd, None).is_err());
        assert!(ctx.callback_new("needs_error", &cmd, Some(&Value::from("x"))).is_err());
    }

    #[test]
    fn error_result_substitutes_failures() {
        let ctx = Context::default();
        let fails: Command = Arc::new(|_: &Context, _: &[Value]| Err(AlienError::failed("boom")));
        ctx.host.register("fails", fails);
        define(&ctx, "unary", "int", "x int");
        let cb = ctx.callback_new("unary", &Value::from("fails"), Some(&Value::from(-1))).unwrap();
        assert_eq!(cb.tag.as_deref(), Some("::unary"));
        let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(cb.address) };
        assert_eq!(f(3), -1);
        ctx.callback_free(&Value::Pointer(cb.clone())).unwrap();
        assert_eq!(
            ctx.callback_free(&Value::Pointer(cb)).unwrap_err().code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn stack_backend_has_no_callbacks() {
        let ctx = Context::new(crate::ContextCreateInfo {
            backend: crate::BackendKind::Stack,
            ..Default::default()
        });
        define(&ctx, "v", "void", "");
        assert!(ctx.callback_new("v", &Value::from("noop"), None).is_err());
    }
}
