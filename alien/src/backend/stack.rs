use std::{io, sync::Arc};

use super::{CallStack, ClosureHandler, ClosureSignature, NativeCallBackend, NativeClosure, NativeKind};
use crate::{AlienError, Result, prototype::CallConvention};

/// Most arguments the word invoker passes.
const MAX_WORDS: usize = 8;

/// Lightweight backend for signatures made only of integers and pointers.
/// Every argument is widened to one machine word and the target is called
/// through a word-only function type, which the supported C ABIs pass
/// identically to the narrower integer types.
#[derive(Debug, Default)]
pub struct StackBackend;

fn unsupported(what: &str) -> AlienError {
    AlienError::invalid(format!("{what} not supported by the stack backend."))
}

fn check_kind(kind: &NativeKind) -> Result<()> {
    match kind {
        NativeKind::F32 | NativeKind::F64 => Err(unsupported("Floating point values are")),
        NativeKind::Struct(_) => Err(unsupported("Structs passed by value are")),
        _ => Ok(()),
    }
}

struct WordStack {
    ret: NativeKind,
    words: Vec<u64>,
}

type W = u64;

/// Calls `$func` as a word-only `extern "C"` function returning `$ret`.
macro_rules! word_call {
    ($func:expr, $w:expr, $ret:ty) => {
        match $w.len() {
            0 => std::mem::transmute::<usize, extern "C" fn() -> $ret>($func)(),
            1 => std::mem::transmute::<usize, extern "C" fn(W) -> $ret>($func)($w[0]),
            2 => std::mem::transmute::<usize, extern "C" fn(W, W) -> $ret>($func)($w[0], $w[1]),
            3 => std::mem::transmute::<usize, extern "C" fn(W, W, W) -> $ret>($func)(
                $w[0], $w[1], $w[2],
            ),
            4 => std::mem::transmute::<usize, extern "C" fn(W, W, W, W) -> $ret>($func)(
                $w[0], $w[1], $w[2], $w[3],
            ),
            5 => std::mem::transmute::<usize, extern "C" fn(W, W, W, W, W) -> $ret>($func)(
                $w[0], $w[1], $w[2], $w[3], $w[4],
            ),
            6 => std::mem::transmute::<usize, extern "C" fn(W, W, W, W, W, W) -> $ret>($func)(
                $w[0], $w[1], $w[2], $w[3], $w[4], $w[5],
            ),
            7 => std::mem::transmute::<usize, extern "C" fn(W, W, W, W, W, W, W) -> $ret>(
                $func,
            )($w[0], $w[1], $w[2], $w[3], $w[4], $w[5], $w[6]),
            8 => std::mem::transmute::<usize, extern "C" fn(W, W, W, W, W, W, W, W) -> $ret>(
                $func,
            )($w[0], $w[1], $w[2], $w[3], $w[4], $w[5], $w[6], $w[7]),
            n => unreachable!("{n} words pushed"),
        }
    };
}

impl CallStack for WordStack {
    fn reset(&mut self) {
        self.words.clear();
    }

    unsafe fn push(&mut self, kind: &NativeKind, value: *const u8) -> Result<()> {
        check_kind(kind)?;
        if self.words.len() == MAX_WORDS {
            return Err(unsupported("More than 8 arguments are"));
        }
        self.words.push(unsafe { kind.read_word(value) });
        Ok(())
    }

    unsafe fn invoke(&mut self, func: usize, ret: *mut u8) -> Result<io::Error> {
        let w = &self.words;
        log::trace!("stack call {func:#x} with {} words", w.len());
        // SAFETY: the caller guarantees `func` takes these integer words.
        if matches!(self.ret, NativeKind::Void) {
            unsafe { word_call!(func, w, ()) };
            return Ok(io::Error::last_os_error());
        }
        let result = unsafe { word_call!(func, w, W) };
        let os_error = io::Error::last_os_error();
        unsafe { self.ret.write_word(ret, result) };
        Ok(os_error)
    }
}

impl NativeCallBackend for StackBackend {
    fn name(&self) -> &'static str {
        "stack"
    }

    fn supports_struct_byval(&self) -> bool {
        false
    }

    fn supports_callbacks(&self) -> bool {
        false
    }

    fn supports_varargs(&self) -> bool {
        false
    }

    fn begin(
        &self,
        _conv: CallConvention,
        ret: &NativeKind,
        fixed: Option<usize>,
    ) -> Result<Box<dyn CallStack>> {
        if fixed.is_some() {
            return Err(unsupported("Variadic calls are"));
        }
        check_kind(ret)?;
        Ok(Box::new(WordStack {
            ret: ret.clone(),
            words: Vec::with_capacity(MAX_WORDS),
        }))
    }

    fn create_closure(
        &self,
        _sig: ClosureSignature,
        _handler: Arc<dyn ClosureHandler>,
    ) -> Result<Box<dyn NativeClosure>> {
        Err(unsupported("Callbacks are"))
    }
}
