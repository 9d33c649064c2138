//! Native call dispatch: argument binding, invocation, result checking and
//! output storeback.

use std::io;

use crate::{
    AlienError, ArenaFrame, Context, PointerValue, Result, Value,
    attrs::{AttrFlags, ParseMode},
    backend::NativeKind,
    base_type::BaseType,
    codec::{array_bytes, read_address, read_int, resolve_count, write_address},
    prototype::{FunctionPrototype, Param},
    types::{ArraySize, TypeAndAttrs},
};

/// One argument after conversion to native form.
struct Bound {
    kind: NativeKind,
    /// What gets pushed: the value itself or a slot holding its address.
    push: *const u8,
    /// Native storage of the value.
    holder: *mut u8,
    count: Option<usize>,
    input: Option<Value>,
    out_var: Option<String>,
}

/// Where an argument's value comes from.
enum Source<'a> {
    Value(&'a Value),
    Output(String),
    Retval,
}

fn requirement_passed(flags: AttrFlags, raw: i128) -> bool {
    if flags.contains(AttrFlags::ZERO) {
        raw == 0
    } else if flags.contains(AttrFlags::NONZERO) {
        raw != 0
    } else if flags.contains(AttrFlags::NONNEGATIVE) {
        raw >= 0
    } else if flags.contains(AttrFlags::POSITIVE) {
        raw > 0
    } else {
        true
    }
}

/// Whether an output is written back given the requirement outcome.
fn should_store(ta: &TypeAndAttrs, passed: bool) -> bool {
    let on_error = ta.has(AttrFlags::STOREONERROR);
    (passed && !on_error) || (!passed && on_error) || ta.has(AttrFlags::STOREALWAYS)
}

/// Checked outcome of the native call.
struct Outcome {
    passed: bool,
    /// Raw value handed to error handlers.
    raw: Value,
    /// Address of the value to convert, for byref returns.
    address: usize,
}

impl Context {
    fn holder_size(ta: &TypeAndAttrs, count: Option<usize>, input: Option<&Value>) -> Result<usize> {
        Ok(match count {
            Some(n) => array_bytes(ta, n)?,
            None => match ta.ty.struct_def() {
                Some(sd) if sd.variable_size => match input {
                    Some(v) => sd.size_for_value(v)?,
                    None => sd.size,
                },
                _ => ta.ty.base_size,
            },
        })
    }

    fn bind(
        &self,
        param: &Param,
        source: Source<'_>,
        dynamic: Option<usize>,
        frame: &ArenaFrame,
    ) -> Result<Bound> {
        let ta = &param.ta;
        let (input, out_var) = match source {
            Source::Value(v) => (Some(v.clone()), None),
            Source::Output(name) => {
                let input = if ta.has(AttrFlags::INOUT) {
                    Some(
                        self.host
                            .get_var(&name)
                            .ok_or_else(|| AlienError::not_found("Variable", &name))?,
                    )
                } else {
                    None
                };
                (input, Some(name))
            }
            Source::Retval => (None, None),
        };
        let count = resolve_count(ta, dynamic)?;
        let by_pointer = ta.has(AttrFlags::BYREF) || count.is_some();

        // An empty optional reference passes NULL.
        let null_ref = by_pointer
            && ta.has(AttrFlags::NULLOK)
            && match (&input, &out_var) {
                (_, Some(name)) => name.is_empty(),
                (Some(v), None) => v.is_empty_string(),
                (None, None) => false,
            };

        let size = Self::holder_size(ta, count, input.as_ref())?;
        let holder = frame.allocate_zeroed(size.max(8))?;
        if let Some(value) = &input
            && !null_ref
        {
            unsafe { self.value_to_native(ta, value, holder, count, Some(frame))? };
        }
        let (kind, push) = if by_pointer {
            let slot = frame.allocate(size_of::<usize>())?;
            let address = if null_ref { 0 } else { holder as usize };
            unsafe { write_address(slot, address) };
            (NativeKind::Pointer, slot as *const u8)
        } else {
            (NativeKind::of(&ta.ty), holder as *const u8)
        };
        Ok(Bound {
            kind,
            push,
            holder,
            count,
            input,
            out_var: out_var.filter(|n| !n.is_empty()),
        })
    }

    /// Converts one `{type value}` variadic argument, applying the C default
    /// promotions.
    fn bind_vararg(&self, arg: &Value, frame: &ArenaFrame) -> Result<(NativeKind, *const u8)> {
        let pair = arg.as_list()?;
        let [decl, value] = pair.as_slice() else {
            return Err(AlienError::invalid_value(
                "Variadic arguments must be type and value pairs.",
                arg,
            ));
        };
        let ta = self.parse_type_and_attrs(decl, ParseMode::Param)?;
        if ta.is_output() || ta.has(AttrFlags::BYREF) || ta.ty.count.is_array() {
            return Err(AlienError::invalid(
                "Variadic arguments must be scalar input values.",
            ));
        }
        let kind = NativeKind::of(&ta.ty);
        let promoted = kind.clone().promoted();
        let holder = frame.allocate_zeroed(ta.ty.base_size.max(8))?;
        if kind == NativeKind::F32 {
            let v = value.as_double()?;
            unsafe { std::ptr::write_unaligned(holder as *mut f64, v) };
        } else {
            unsafe {
                self.scalar_to_native(&ta, value, holder, Some(frame))?;
                if promoted != kind {
                    let word = kind.read_word(holder);
                    promoted.write_word(holder, word);
                }
            }
        }
        Ok((promoted, holder))
    }

    fn check_result(&self, ret: &TypeAndAttrs, buf: *const u8) -> Result<Outcome> {
        let flags = ret.flags;
        let base = ret.ty.base;
        if base == BaseType::Void {
            return Ok(Outcome {
                passed: true,
                raw: Value::Empty,
                address: 0,
            });
        }
        let (address, target) = if flags.contains(AttrFlags::BYREF) {
            let address = unsafe { read_address(buf) };
            if address == 0 {
                let raw = Value::Pointer(PointerValue::null(None));
                return Ok(Outcome {
                    passed: flags.contains(AttrFlags::NULLOK),
                    raw,
                    address,
                });
            }
            (address, address as *const u8)
        } else {
            (0, buf)
        };
        if base.is_integer() {
            let raw = unsafe { read_int(base, target) };
            return Ok(Outcome {
                passed: requirement_passed(flags, raw),
                raw: Value::from_i128(raw),
                address,
            });
        }
        if base.is_pointer_like() {
            let ptr = unsafe { read_address(target) };
            let passed = (ptr != 0 || flags.contains(AttrFlags::NULLOK))
                && requirement_passed(flags, ptr as i128);
            return Ok(Outcome {
                passed,
                raw: Value::Pointer(PointerValue::new(ptr, ret.ty.pointer_tag())),
                address,
            });
        }
        Ok(Outcome {
            passed: true,
            raw: Value::Empty,
            address,
        })
    }

    fn default_error(ret: &TypeAndAttrs, raw: &Value, os_error: io::Error) -> AlienError {
        let flags = ret.flags;
        if flags.intersects(AttrFlags::ERRNO.with(AttrFlags::LASTERROR)) {
            AlienError::failed(os_error.to_string())
        } else if flags.contains(AttrFlags::WINERROR)
            && let Ok(code) = raw.as_integer()
        {
            AlienError::failed(io::Error::from_raw_os_error(code as i32).to_string())
        } else {
            AlienError::failed("Function returned an error value.")
        }
    }

    /// Calls `func` as described by `proto` with interpreter values.
    ///
    /// Arguments map to the non-retval parameters in order. Output
    /// parameters take a variable name. Trailing parameters with defaults
    /// may be omitted and variadic prototypes accept extra `{type value}`
    /// pairs.
    pub fn call_function(
        &self,
        proto: &FunctionPrototype,
        func: usize,
        args: &[Value],
    ) -> Result<Value> {
        let nparams = proto.params.len();
        let supplied: Vec<usize> = proto.supplied_params().map(|(i, _)| i).collect();
        let too_many = args.len() > supplied.len() && !proto.varargs;
        let too_few = supplied[args.len().min(supplied.len())..]
            .iter()
            .any(|&i| proto.params[i].ta.default_value().is_none());
        if too_many || too_few {
            return Err(AlienError::num_args(format!(
                "Wrong number of arguments to \"{proto}\"."
            )));
        }
        log::trace!("calling {} at {func:#x} with {} args", proto.name, args.len());

        let mut sources: Vec<Source<'_>> = Vec::with_capacity(nparams);
        let mut next_arg = 0;
        for param in &proto.params {
            let ta = &param.ta;
            let source = if ta.has(AttrFlags::RETVAL) {
                Source::Retval
            } else {
                let arg = args.get(next_arg);
                next_arg += 1;
                match (arg, ta.is_output()) {
                    (Some(v), true) => Source::Output(v.to_string()),
                    (Some(v), false) => Source::Value(v),
                    (None, _) => match ta.default_value() {
                        Some(v) if ta.is_output() => Source::Output(v.to_string()),
                        Some(v) => Source::Value(v),
                        None => unreachable!("argument count checked above"),
                    },
                }
            };
            sources.push(source);
        }
        let extra = args.get(supplied.len()..).unwrap_or_default();

        let frame = self.arena_frame(0)?;
        let ret_kind = if proto.ret.has(AttrFlags::BYREF) {
            NativeKind::Pointer
        } else {
            NativeKind::of(&proto.ret.ty)
        };
        let fixed = proto.varargs.then_some(nparams);
        let mut stack = self.backend.begin(proto.conv, &ret_kind, fixed)?;

        // Pass 1 binds every parameter whose size does not depend on a
        // sibling; pass 2 binds the rest and replays the stack in order.
        let mut bound: Vec<Option<Bound>> = (0..nparams).map(|_| None).collect();
        let mut deferred = Vec::new();
        for (i, (param, source)) in proto.params.iter().zip(sources.iter_mut()).enumerate() {
            if matches!(param.ta.ty.count, ArraySize::Dynamic(_)) {
                deferred.push(i);
                continue;
            }
            let source = std::mem::replace(source, Source::Retval);
            let b = self
                .bind(param, source, None, &frame)
                .map_err(|e| e.context(&format!("Parameter {}:", param.name)))?;
            unsafe { stack.push(&b.kind, b.push)? };
            bound[i] = Some(b);
        }
        if !deferred.is_empty() {
            for &i in &deferred {
                let param = &proto.params[i];
                let ArraySize::Dynamic(count_name) = &param.ta.ty.count else {
                    unreachable!("only dynamic arrays are deferred")
                };
                let ci = proto.param_index(count_name).ok_or_else(|| {
                    AlienError::not_found("Parameter", count_name)
                })?;
                let Some(counter) = &bound[ci] else {
                    unreachable!("count parameters are scalars bound in pass 1")
                };
                let n = unsafe { read_int(proto.params[ci].ta.ty.base, counter.holder) };
                let n = usize::try_from(n).map_err(|_| {
                    AlienError::invalid(format!(
                        "Parameter {}: negative element count {n}.",
                        param.name
                    ))
                })?;
                let source = std::mem::replace(&mut sources[i], Source::Retval);
                let b = self
                    .bind(param, source, Some(n), &frame)
                    .map_err(|e| e.context(&format!("Parameter {}:", param.name)))?;
                bound[i] = Some(b);
            }
            stack.reset();
            for b in bound.iter().flatten() {
                unsafe { stack.push(&b.kind, b.push)? };
            }
        }
        for arg in extra {
            let (kind, ptr) = self.bind_vararg(arg, &frame)?;
            unsafe { stack.push(&kind, ptr)? };
        }
        let bound: Vec<Bound> = bound.into_iter().flatten().collect();

        let ret_size = proto.ret.ty.base_size.max(size_of::<u64>());
        let ret_buf = frame.allocate_zeroed(ret_size)?;
        let os_error = unsafe { stack.invoke(func, ret_buf)? };

        let outcome = self.check_result(&proto.ret, ret_buf)?;

        // Disposal precedes wrapping: the result may reuse a disposed
        // address.
        for (param, b) in proto.params.iter().zip(&bound) {
            let ta = &param.ta;
            let dispose = ta.has(AttrFlags::DISPOSE)
                || (ta.has(AttrFlags::DISPOSEONSUCCESS) && outcome.passed);
            if dispose
                && let Some(input) = &b.input
                && !input.is_empty_string()
            {
                let ptr = input.as_pointer()?;
                if !ptr.is_null() {
                    log::trace!("disposing {ptr}");
                    self.pointers.unregister(&ptr)?;
                }
            }
        }

        let mut stored = Vec::new();
        let mut retval = None;
        for (param, b) in proto.params.iter().zip(&bound) {
            let ta = &param.ta;
            if !ta.is_output() || !should_store(ta, outcome.passed) {
                continue;
            }
            if ta.has(AttrFlags::RETVAL) {
                retval = Some(unsafe { self.value_from_native(ta, b.holder, b.count)? });
                continue;
            }
            let Some(name) = &b.out_var else { continue };
            let value = unsafe { self.value_from_native(ta, b.holder, b.count)? };
            self.host.set_var(name, value.clone());
            stored.push((param.name.clone(), value));
        }

        if !outcome.passed {
            let Some(handler) = proto.ret.error_handler() else {
                return Err(Self::default_error(&proto.ret, &outcome.raw, os_error));
            };
            let inputs: Vec<(String, Value)> = proto
                .params
                .iter()
                .zip(&bound)
                .filter(|(p, _)| !p.ta.has(AttrFlags::OUT) && !p.ta.has(AttrFlags::RETVAL))
                .filter_map(|(p, b)| b.input.clone().map(|v| (p.name.clone(), v)))
                .collect();
            log::debug!("{} failed, invoking error handler", proto.name);
            return self.invoke(
                handler,
                &[outcome.raw, Value::Dict(inputs), Value::Dict(stored)],
            );
        }

        if let Some(value) = retval {
            return Ok(value);
        }
        if proto.ret.has(AttrFlags::DISCARD) || proto.ret.ty.base == BaseType::Void {
            return Ok(Value::Empty);
        }
        if proto.ret.has(AttrFlags::BYREF) {
            if outcome.address == 0 {
                return Ok(Value::Empty);
            }
            return unsafe { self.value_from_native(&proto.ret, outcome.address as *const u8, None) };
        }
        unsafe { self.scalar_from_native(&proto.ret, ret_buf) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallConvention, ErrorCode};

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn fill(out: *mut i32, value: i32) -> i32 {
        unsafe { *out = value * 2 };
        value
    }

    fn proto(ctx: &Context, ret: &str, params: &str) -> FunctionPrototype {
        ctx.build_prototype("f", &Value::from(ret), &Value::from(params), CallConvention::Default)
            .unwrap()
    }

    #[test]
    fn argument_count_policy() {
        let ctx = Context::default();
        let p = proto(&ctx, "int", "a int b {int {default 5}}");
        let f = add as usize;
        assert_eq!(ctx.call_function(&p, f, &[Value::from(1)]).unwrap(), Value::Int(6));
        assert_eq!(
            ctx.call_function(&p, f, &[Value::from(1), Value::from(2)]).unwrap(),
            Value::Int(3)
        );
        let err = ctx.call_function(&p, f, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::NumArgs);
        let err = ctx
            .call_function(&p, f, &[Value::from(1), Value::from(2), Value::from(3)])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NumArgs);
    }

    #[test]
    fn retval_becomes_the_result() {
        let ctx = Context::default();
        let p = proto(&ctx, "int nonzero", "out {int retval} value int");
        assert_eq!(ctx.call_function(&p, fill as usize, &[Value::from(4)]).unwrap(), Value::Int(8));
        let err = ctx.call_function(&p, fill as usize, &[Value::from(0)]).unwrap_err();
        assert_eq!(err.code, ErrorCode::Failed);
        assert_eq!(err.message, "Function returned an error value.");
    }

    #[test]
    fn requirement_outcomes() {
        let flags = AttrFlags::NONNEGATIVE;
        assert!(requirement_passed(flags, 0));
        assert!(!requirement_passed(flags, -1));
        assert!(!requirement_passed(AttrFlags::POSITIVE, 0));
        assert!(requirement_passed(AttrFlags::NONE, -5));
    }

    #[test]
    fn stack_backend_dispatch() {
        let ctx = Context::new(crate::ContextCreateInfo {
            backend: crate::BackendKind::Stack,
            ..Default::default()
        });
        let p = proto(&ctx, "int", "a int b int");
        assert_eq!(
            ctx.call_function(&p, add as usize, &[Value::from(-4), Value::from(10)]).unwrap(),
            Value::Int(6)
        );
    }
}
