//! Native call backends.
//!
//! The dispatcher only talks to [`NativeCallBackend`]: it opens a
//! [`CallStack`], pushes each argument in positional order and invokes the
//! target. Backends differ in what they can express, which the parser
//! queries up front so unsupported declarations fail at definition time.

mod ffi;
mod stack;

use std::{
    hash::{Hash, Hasher},
    io,
    sync::Arc,
};

pub use self::{ffi::LibffiBackend, stack::StackBackend};
use crate::{
    BackendKind, Result,
    base_type::BaseType,
    prototype::CallConvention,
    structs::StructDescriptor,
    types::{TypeDescriptor, TypeTag},
};

/// Machine level shape of one argument or return value.
#[derive(Debug, Clone)]
pub enum NativeKind {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
    Struct(Arc<StructDescriptor>),
}

impl PartialEq for NativeKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Struct(a), Self::Struct(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for NativeKind {}

impl Hash for NativeKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        if let Self::Struct(sd) = self {
            sd.name.hash(state);
            sd.size.hash(state);
        }
    }
}

impl NativeKind {
    fn integer(size: usize, signed: bool) -> Self {
        match (size, signed) {
            (1, true) => Self::I8,
            (1, false) => Self::U8,
            (2, true) => Self::I16,
            (2, false) => Self::U16,
            (4, true) => Self::I32,
            (4, false) => Self::U32,
            (8, true) => Self::I64,
            (8, false) => Self::U64,
            _ => unreachable!("no {size} byte integer type"),
        }
    }

    /// Kind of a value of type `ty` as passed by value. Arrays travel as
    /// pointers.
    pub fn of(ty: &TypeDescriptor) -> Self {
        if ty.count.is_array() {
            Self::Pointer
        } else {
            Self::of_element(ty)
        }
    }

    /// Kind of one element of `ty`.
    pub fn of_element(ty: &TypeDescriptor) -> Self {
        match ty.base {
            BaseType::Void => Self::Void,
            b if b.is_integer() => Self::integer(b.size(), b.is_signed()),
            BaseType::Float => Self::F32,
            BaseType::Double => Self::F64,
            BaseType::Struct => match &ty.tag {
                TypeTag::Struct(sd) => Self::Struct(sd.clone()),
                _ => unreachable!("struct type without descriptor"),
            },
            _ => Self::Pointer,
        }
    }

    /// Promotion applied to variadic arguments.
    pub fn promoted(self) -> Self {
        match self {
            Self::I8 | Self::I16 => Self::I32,
            Self::U8 | Self::U16 => Self::U32,
            Self::F32 => Self::F64,
            other => other,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Void => 0,
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => size_of::<usize>(),
            Self::Struct(sd) => sd.size,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Reads a value of this kind as a sign or zero extended word.
    ///
    /// # Safety
    /// `src` must be valid for reads of `self.size()` bytes.
    pub(crate) unsafe fn read_word(&self, src: *const u8) -> u64 {
        use std::ptr::read_unaligned as rd;
        unsafe {
            match self {
                Self::I8 => rd(src as *const i8) as i64 as u64,
                Self::U8 => rd(src) as u64,
                Self::I16 => rd(src as *const i16) as i64 as u64,
                Self::U16 => rd(src as *const u16) as u64,
                Self::I32 => rd(src as *const i32) as i64 as u64,
                Self::U32 => rd(src as *const u32) as u64,
                Self::I64 | Self::U64 => rd(src as *const u64),
                Self::Pointer => rd(src as *const usize) as u64,
                Self::F32 => rd(src as *const u32) as u64,
                Self::F64 => rd(src as *const u64),
                Self::Void | Self::Struct(_) => 0,
            }
        }
    }

    /// Writes the low bytes of `word` as a value of this kind.
    ///
    /// # Safety
    /// `dest` must be valid for writes of `self.size()` bytes.
    pub(crate) unsafe fn write_word(&self, dest: *mut u8, word: u64) {
        use std::ptr::write_unaligned as wr;
        unsafe {
            match self {
                Self::I8 | Self::U8 => wr(dest, word as u8),
                Self::I16 | Self::U16 => wr(dest as *mut u16, word as u16),
                Self::I32 | Self::U32 | Self::F32 => wr(dest as *mut u32, word as u32),
                Self::I64 | Self::U64 | Self::F64 => wr(dest as *mut u64, word),
                Self::Pointer => wr(dest as *mut usize, word as usize),
                Self::Void | Self::Struct(_) => {}
            }
        }
    }
}

/// Arguments pushed for one call, in positional order.
pub trait CallStack {
    /// Drops every pushed argument so binding can be replayed.
    fn reset(&mut self);

    /// Pushes one argument. The backend copies the value out of `value`
    /// immediately.
    ///
    /// # Safety
    /// `value` must be valid for reads of `kind.size()` bytes.
    unsafe fn push(&mut self, kind: &NativeKind, value: *const u8) -> Result<()>;

    /// Calls `func` with the pushed arguments and writes the return value
    /// to `ret`, which must hold at least the return kind's size. Returns
    /// the OS error state read as soon as `func` returned.
    ///
    /// # Safety
    /// `func` must be a function with the described signature.
    unsafe fn invoke(&mut self, func: usize, ret: *mut u8) -> Result<io::Error>;
}

/// Signature of a native entry point created for a callback.
#[derive(Debug, Clone)]
pub struct ClosureSignature {
    pub conv: CallConvention,
    pub ret: NativeKind,
    pub args: Vec<NativeKind>,
}

/// Receives calls made through a [`NativeClosure`]. `args` point at each
/// argument value and `ret` at storage for the return kind.
pub trait ClosureHandler: Send + Sync {
    fn invoke(&self, args: &[*const u8], ret: *mut u8);
}

/// Native code address that forwards to a [`ClosureHandler`] until
/// dropped.
pub trait NativeClosure: Send + Sync {
    fn code(&self) -> usize;
}

pub trait NativeCallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_struct_byval(&self) -> bool;

    fn supports_callbacks(&self) -> bool;

    fn supports_varargs(&self) -> bool;

    /// Starts a call returning `ret`. `fixed` is the number of fixed
    /// parameters for variadic calls.
    fn begin(
        &self,
        conv: CallConvention,
        ret: &NativeKind,
        fixed: Option<usize>,
    ) -> Result<Box<dyn CallStack>>;

    fn create_closure(
        &self,
        sig: ClosureSignature,
        handler: Arc<dyn ClosureHandler>,
    ) -> Result<Box<dyn NativeClosure>>;
}

pub fn create(kind: BackendKind) -> Box<dyn NativeCallBackend> {
    match kind {
        BackendKind::Libffi => Box::new(LibffiBackend::new()),
        BackendKind::Stack => Box::new(StackBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_trip_with_extension() {
        let v: i16 = -3;
        let word = unsafe { NativeKind::I16.read_word((&v as *const i16).cast()) };
        assert_eq!(word as i64, -3);
        let mut out = 0u32;
        unsafe { NativeKind::U32.write_word((&mut out as *mut u32).cast(), u64::MAX) };
        assert_eq!(out, u32::MAX);
    }

    #[test]
    fn variadic_promotion() {
        assert_eq!(NativeKind::F32.promoted(), NativeKind::F64);
        assert_eq!(NativeKind::U8.promoted(), NativeKind::U32);
        assert_eq!(NativeKind::I64.promoted(), NativeKind::I64);
    }
}
