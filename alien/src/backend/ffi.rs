use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::c_void,
    io, ptr,
    rc::Rc,
    sync::Arc,
};

use libffi::{
    middle::{Cif, CodePtr, Type},
    raw,
};

use super::{CallStack, ClosureHandler, ClosureSignature, NativeCallBackend, NativeClosure, NativeKind};
use crate::{
    AlienError, Result,
    base_type::BaseType,
    prototype::CallConvention,
    structs::StructDescriptor,
    types::ArraySize,
};

thread_local! {
    static CIF_CACHE: RefCell<HashMap<CifCacheKey, Rc<Cif>>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CifCacheKey {
    conv: CallConvention,
    ret: NativeKind,
    args: Vec<NativeKind>,
    fixed: Option<usize>,
}

fn cached_cif(key: CifCacheKey) -> Result<Rc<Cif>> {
    CIF_CACHE.with(|cache| {
        if let Some(cif) = cache.borrow().get(&key) {
            return Ok(cif.clone());
        }
        let cif = Rc::new(build_cif(&key.conv, &key.ret, &key.args, key.fixed)?);
        cache.borrow_mut().insert(key, cif.clone());
        Ok(cif)
    })
}

#[cfg(all(windows, target_arch = "x86"))]
fn abi_for(conv: CallConvention) -> raw::ffi_abi {
    match conv {
        CallConvention::Default => raw::ffi_abi_FFI_DEFAULT_ABI,
        CallConvention::Stdcall => raw::ffi_abi_FFI_STDCALL,
    }
}

#[cfg(not(all(windows, target_arch = "x86")))]
fn abi_for(_conv: CallConvention) -> raw::ffi_abi {
    raw::ffi_abi_FFI_DEFAULT_ABI
}

fn build_cif(
    conv: &CallConvention,
    ret: &NativeKind,
    args: &[NativeKind],
    fixed: Option<usize>,
) -> Result<Cif> {
    let arg_types = args.iter().map(ffi_type).collect::<Result<Vec<_>>>()?;
    let ret_type = ffi_type(ret)?;
    let mut cif = match fixed {
        Some(n) => Cif::new_variadic(arg_types, n, ret_type),
        None => Cif::new(arg_types, ret_type),
    };
    cif.set_abi(abi_for(*conv));
    Ok(cif)
}

fn ffi_type(kind: &NativeKind) -> Result<Type> {
    Ok(match kind {
        NativeKind::Void => Type::void(),
        NativeKind::I8 => Type::i8(),
        NativeKind::U8 => Type::u8(),
        NativeKind::I16 => Type::i16(),
        NativeKind::U16 => Type::u16(),
        NativeKind::I32 => Type::i32(),
        NativeKind::U32 => Type::u32(),
        NativeKind::I64 => Type::i64(),
        NativeKind::U64 => Type::u64(),
        NativeKind::F32 => Type::f32(),
        NativeKind::F64 => Type::f64(),
        NativeKind::Pointer => Type::pointer(),
        NativeKind::Struct(sd) => struct_type(sd)?,
    })
}

fn unsigned_unit(size: usize) -> Type {
    match size {
        1 => Type::u8(),
        2 => Type::u16(),
        4 => Type::u32(),
        _ => Type::u64(),
    }
}

/// libffi description of a struct passed by value. The layout libffi
/// computes must agree with ours, which rules out packed structs.
fn struct_type(sd: &StructDescriptor) -> Result<Type> {
    let unsupported = |why: &str| {
        AlienError::invalid(format!(
            "Struct \"{}\" cannot be passed by value: {why}.",
            sd.name
        ))
    };
    if sd.variable_size {
        return Err(unsupported("variable size"));
    }
    if sd.is_union {
        // A union is classified as a run of its alignment sized units.
        let unit = sd.alignment.min(8);
        let elems = vec![unsigned_unit(unit); sd.size / unit];
        return Ok(Type::structure(elems));
    }
    let mut elems = Vec::new();
    let mut field_starts = Vec::with_capacity(sd.fields.len());
    for field in &sd.fields {
        let ty = &field.ta.ty;
        let elem = match ty.base {
            BaseType::Chars | BaseType::Bytes => Type::u8(),
            BaseType::WinChars => Type::u16(),
            BaseType::UniChars => Type::u32(),
            _ => ffi_type(&NativeKind::of_element(ty))?,
        };
        let count = match &ty.count {
            ArraySize::Fixed(n) => *n,
            ArraySize::Scalar => 1,
            ArraySize::Dynamic(_) => return Err(unsupported("variable size")),
        };
        field_starts.push(elems.len());
        elems.extend(std::iter::repeat_n(elem, count));
    }
    let mut offsets = vec![0usize; elems.len().max(1)];
    let ty = Type::structure(elems);
    let status = unsafe {
        raw::ffi_get_struct_offsets(raw::ffi_abi_FFI_DEFAULT_ABI, ty.as_raw_ptr(), offsets.as_mut_ptr())
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(unsupported("layout could not be computed"));
    }
    let size = unsafe { (*ty.as_raw_ptr()).size };
    let matches = size == sd.size
        && sd
            .fields
            .iter()
            .zip(&field_starts)
            .all(|(f, &start)| offsets[start] == f.offset);
    if !matches {
        return Err(unsupported("packed layout"));
    }
    Ok(ty)
}

/// Full featured backend built on libffi call interfaces, cached per
/// thread by signature.
#[derive(Debug, Default)]
pub struct LibffiBackend;

impl LibffiBackend {
    pub fn new() -> Self {
        Self
    }
}

struct LibffiStack {
    conv: CallConvention,
    ret: NativeKind,
    fixed: Option<usize>,
    kinds: Vec<NativeKind>,
    values: Vec<Box<[u64]>>,
}

impl CallStack for LibffiStack {
    fn reset(&mut self) {
        self.kinds.clear();
        self.values.clear();
    }

    unsafe fn push(&mut self, kind: &NativeKind, value: *const u8) -> Result<()> {
        let size = kind.size();
        let mut slot = vec![0u64; size.div_ceil(8).max(1)].into_boxed_slice();
        unsafe { ptr::copy_nonoverlapping(value, slot.as_mut_ptr().cast::<u8>(), size) };
        self.kinds.push(kind.clone());
        self.values.push(slot);
        Ok(())
    }

    unsafe fn invoke(&mut self, func: usize, ret: *mut u8) -> Result<io::Error> {
        let cif = cached_cif(CifCacheKey {
            conv: self.conv,
            ret: self.ret.clone(),
            args: self.kinds.clone(),
            fixed: self.fixed,
        })?;
        let mut raw_args: Vec<*mut c_void> = self
            .values
            .iter_mut()
            .map(|v| v.as_mut_ptr().cast())
            .collect();
        // Small integer results are widened to a full ffi_arg.
        let ret_size = self.ret.size().max(size_of::<raw::ffi_arg>());
        let mut ret_buf = vec![0u64; ret_size.div_ceil(8)];
        let code = CodePtr(func as *mut c_void);
        let os_error = unsafe {
            raw::ffi_call(
                cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                ret_buf.as_mut_ptr().cast(),
                raw_args.as_mut_ptr(),
            );
            io::Error::last_os_error()
        };
        match &self.ret {
            NativeKind::Void => {}
            NativeKind::I8
            | NativeKind::U8
            | NativeKind::I16
            | NativeKind::U16
            | NativeKind::I32
            | NativeKind::U32 => unsafe {
                let word = ptr::read(ret_buf.as_ptr().cast::<raw::ffi_arg>()) as u64;
                self.ret.write_word(ret, word);
            },
            other => unsafe {
                ptr::copy_nonoverlapping(ret_buf.as_ptr().cast::<u8>(), ret, other.size());
            },
        }
        Ok(os_error)
    }
}

struct ClosureData {
    handler: Arc<dyn ClosureHandler>,
    ret: NativeKind,
    nargs: usize,
}

unsafe extern "C" fn closure_trampoline(
    _cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let data = unsafe { &*(userdata as *const ClosureData) };
    let argv: Vec<*const u8> = (0..data.nargs)
        .map(|i| unsafe { *args.add(i) as *const u8 })
        .collect();
    let mut slot = [0u64; 2];
    data.handler.invoke(&argv, slot.as_mut_ptr().cast());
    unsafe {
        match &data.ret {
            NativeKind::Void => {}
            NativeKind::I8
            | NativeKind::U8
            | NativeKind::I16
            | NativeKind::U16
            | NativeKind::I32
            | NativeKind::U32 => {
                let word = data.ret.read_word(slot.as_ptr().cast());
                ptr::write(ret as *mut raw::ffi_arg, word as raw::ffi_arg);
            }
            other => {
                ptr::copy_nonoverlapping(slot.as_ptr().cast::<u8>(), ret.cast::<u8>(), other.size())
            }
        }
    }
}

struct LibffiClosure {
    closure: *mut raw::ffi_closure,
    code: usize,
    // Both must outlive the closure.
    _cif: Box<Cif>,
    _data: Box<ClosureData>,
}

// The closure memory is only written during creation and freed on drop.
unsafe impl Send for LibffiClosure {}
unsafe impl Sync for LibffiClosure {}

impl NativeClosure for LibffiClosure {
    fn code(&self) -> usize {
        self.code
    }
}

impl Drop for LibffiClosure {
    fn drop(&mut self) {
        unsafe { raw::ffi_closure_free(self.closure.cast()) };
    }
}

impl NativeCallBackend for LibffiBackend {
    fn name(&self) -> &'static str {
        "libffi"
    }

    fn supports_struct_byval(&self) -> bool {
        true
    }

    fn supports_callbacks(&self) -> bool {
        true
    }

    fn supports_varargs(&self) -> bool {
        true
    }

    fn begin(
        &self,
        conv: CallConvention,
        ret: &NativeKind,
        fixed: Option<usize>,
    ) -> Result<Box<dyn CallStack>> {
        if let NativeKind::Struct(sd) = ret {
            // Validates the layout before any argument is converted.
            struct_type(sd)?;
        }
        Ok(Box::new(LibffiStack {
            conv,
            ret: ret.clone(),
            fixed,
            kinds: Vec::new(),
            values: Vec::new(),
        }))
    }

    fn create_closure(
        &self,
        sig: ClosureSignature,
        handler: Arc<dyn ClosureHandler>,
    ) -> Result<Box<dyn NativeClosure>> {
        let cif = Box::new(build_cif(&sig.conv, &sig.ret, &sig.args, None)?);
        let data = Box::new(ClosureData {
            handler,
            ret: sig.ret.clone(),
            nargs: sig.args.len(),
        });
        let mut code: *mut c_void = ptr::null_mut();
        let closure = unsafe { raw::ffi_closure_alloc(size_of::<raw::ffi_closure>(), &mut code) }
            as *mut raw::ffi_closure;
        if closure.is_null() {
            return Err(AlienError::allocation("Could not allocate callback closure."));
        }
        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                cif.as_raw_ptr(),
                Some(closure_trampoline),
                (&*data as *const ClosureData).cast_mut().cast(),
                code,
            )
        };
        if status != raw::ffi_status_FFI_OK {
            unsafe { raw::ffi_closure_free(closure.cast()) };
            return Err(AlienError::allocation("Could not prepare callback closure."));
        }
        log::trace!("created closure at {code:p} with {} args", sig.args.len());
        Ok(Box::new(LibffiClosure {
            closure,
            code: code as usize,
            _cif: cif,
            _data: data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn mix(a: i8, b: f64, c: u16) -> f64 {
        a as f64 * b + c as f64
    }

    extern "C" fn negate(x: i16) -> i16 {
        -x
    }

    fn call(ret: NativeKind, args: &[(NativeKind, &[u8])], func: usize) -> [u8; 16] {
        let backend = LibffiBackend::new();
        let mut stack = backend.begin(CallConvention::Default, &ret, None).unwrap();
        for (kind, bytes) in args {
            unsafe { stack.push(kind, bytes.as_ptr()).unwrap() };
        }
        let mut out = [0u8; 16];
        unsafe { stack.invoke(func, out.as_mut_ptr()).unwrap() };
        out
    }

    #[test]
    fn calls_mixed_signatures() {
        let out = call(
            NativeKind::F64,
            &[
                (NativeKind::I8, &(-2i8).to_ne_bytes()),
                (NativeKind::F64, &1.5f64.to_ne_bytes()),
                (NativeKind::U16, &10u16.to_ne_bytes()),
            ],
            mix as usize,
        );
        assert_eq!(f64::from_ne_bytes(out[..8].try_into().unwrap()), 7.0);
        let out = call(NativeKind::I16, &[(NativeKind::I16, &5i16.to_ne_bytes())], negate as usize);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), -5);
    }

    #[repr(C)]
    struct Pair {
        a: i32,
        b: i32,
    }

    extern "C" fn cross(p: Pair, q: Pair) -> i32 {
        p.a * q.b - p.b * q.a
    }

    #[test]
    fn struct_arguments_share_a_cached_interface() {
        let ctx = crate::Context::default();
        let sd = ctx
            .define_struct("Pair", &crate::Value::from("a int b int"), crate::StructOptions::default())
            .unwrap();
        let pair = |a: i32, b: i32| {
            let mut bytes = a.to_ne_bytes().to_vec();
            bytes.extend(b.to_ne_bytes());
            bytes
        };
        let kind = NativeKind::Struct(sd);
        let (p, q) = (pair(2, 3), pair(5, 7));
        let args = [(kind.clone(), p.as_slice()), (kind.clone(), q.as_slice())];
        let out = call(NativeKind::I32, &args, cross as usize);
        assert_eq!(i32::from_ne_bytes([out[0], out[1], out[2], out[3]]), -1);
        let args = [(kind.clone(), q.as_slice()), (kind.clone(), p.as_slice())];
        let out = call(NativeKind::I32, &args, cross as usize);
        assert_eq!(i32::from_ne_bytes([out[0], out[1], out[2], out[3]]), 1);

        let key = CifCacheKey {
            conv: CallConvention::Default,
            ret: NativeKind::I32,
            args: vec![kind.clone(), kind],
            fixed: None,
        };
        let first = cached_cif(key.clone()).unwrap();
        assert!(Rc::ptr_eq(&first, &cached_cif(key).unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn reports_errno_from_the_call() {
        let backend = LibffiBackend::new();
        let mut stack = backend.begin(CallConvention::Default, &NativeKind::I32, None).unwrap();
        unsafe { stack.push(&NativeKind::I32, (-1i32).to_ne_bytes().as_ptr()).unwrap() };
        let mut out = [0u8; 16];
        let os_error = unsafe { stack.invoke(libc::close as usize, out.as_mut_ptr()).unwrap() };
        assert_eq!(i32::from_ne_bytes([out[0], out[1], out[2], out[3]]), -1);
        assert_eq!(os_error.raw_os_error(), Some(libc::EBADF));
    }

    struct Doubler;

    impl ClosureHandler for Doubler {
        fn invoke(&self, args: &[*const u8], ret: *mut u8) {
            let x = unsafe { ptr::read_unaligned(args[0] as *const i32) };
            unsafe { ptr::write_unaligned(ret as *mut i32, x * 2) };
        }
    }

    #[test]
    fn closures_call_back_into_rust() {
        let backend = LibffiBackend::new();
        let closure = backend
            .create_closure(
                ClosureSignature {
                    conv: CallConvention::Default,
                    ret: NativeKind::I32,
                    args: vec![NativeKind::I32],
                },
                Arc::new(Doubler),
            )
            .unwrap();
        let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(closure.code()) };
        assert_eq!(f(21), 42);
    }
}
