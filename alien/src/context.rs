use std::{
    ops::Deref,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    alias::AliasTable,
    arena::Arena,
    backend::{self, NativeCallBackend},
    callback::CallbackTable,
    encoding::{Encoding, EncodingPolicy},
    enums::EnumTable,
    host::Host,
    pointer::PointerRegistry,
    prototype::PrototypeTable,
    structs::StructTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Full libffi backend: floats, by-value structs, varargs and
    /// callbacks.
    #[default]
    Libffi,
    /// Word based invoker for integer and pointer signatures only.
    Stack,
}

#[derive(Debug, Clone)]
pub struct ContextCreateInfo {
    pub backend: BackendKind,
    pub encoding_policy: EncodingPolicy,
    /// Size of each arena chunk.
    pub arena_size: usize,
    /// Encoding used by `string` and `chars` without an explicit tag.
    pub system_encoding: Encoding,
}

impl Default for ContextCreateInfo {
    fn default() -> Self {
        Self {
            backend: BackendKind::Libffi,
            encoding_policy: EncodingPolicy::Strict,
            arena_size: 64 * 1024,
            system_encoding: Encoding::UTF8,
        }
    }
}

/// Interpreter wide state. None of the locks are held while native code or
/// a host command runs.
pub struct ContextShared {
    pub info: ContextCreateInfo,
    pub host: Host,
    pub(crate) backend: Box<dyn NativeCallBackend>,
    pub(crate) aliases: AliasTable,
    pub(crate) enums: EnumTable,
    pub(crate) structs: StructTable,
    pub(crate) prototypes: PrototypeTable,
    pub(crate) pointers: PointerRegistry,
    pub(crate) arena: Mutex<Arena>,
    pub(crate) callbacks: CallbackTable,
}

/// Handle to one interpreter's FFI state. Cloning is cheap.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextShared>,
}

impl Context {
    pub fn new(info: ContextCreateInfo) -> Self {
        log::debug!("creating context with {:?} backend", info.backend);
        let shared = ContextShared {
            backend: backend::create(info.backend),
            host: Host::new(),
            aliases: AliasTable::default(),
            enums: EnumTable::default(),
            structs: StructTable::default(),
            prototypes: PrototypeTable::default(),
            pointers: PointerRegistry::default(),
            arena: Mutex::new(Arena::new(info.arena_size)),
            callbacks: CallbackTable::default(),
            info,
        };
        Self {
            inner: Arc::new(shared),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextShared> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ContextShared>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn backend(&self) -> &dyn NativeCallBackend {
        self.inner.backend.as_ref()
    }

    pub fn encoding_policy(&self) -> EncodingPolicy {
        self.inner.info.encoding_policy
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextCreateInfo::default())
    }
}

impl Deref for Context {
    type Target = ContextShared;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
