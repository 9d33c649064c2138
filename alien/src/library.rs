//! Shared libraries and host commands bound to their functions.

use std::{ffi::c_void, path::Path, sync::Arc};

use crate::{
    AlienError, Command, Context, Result, Value,
    prototype::{CallConvention, FunctionPrototype},
};

/// A loaded shared library. Commands bound to its functions keep it
/// loaded.
pub struct Library {
    inner: libloading::Library,
    path: String,
}

impl Library {
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        // SAFETY: running library initialisers is inherent to loading
        let inner = unsafe { libloading::Library::new(path) }.map_err(|e| {
            AlienError::not_found("Library", &format!("{} ({e})", path.display()))
        })?;
        log::debug!("loaded library {}", path.display());
        Ok(Arc::new(Self {
            inner,
            path: path.display().to_string(),
        }))
    }

    /// The running executable and the libraries it links.
    #[cfg(unix)]
    pub fn this() -> Result<Arc<Self>> {
        let inner = libloading::os::unix::Library::this().into();
        Ok(Arc::new(Self {
            inner,
            path: String::new(),
        }))
    }

    #[cfg(windows)]
    pub fn this() -> Result<Arc<Self>> {
        let inner = libloading::os::windows::Library::this()
            .map_err(|e| AlienError::not_found("Library", &e.to_string()))?
            .into();
        Ok(Arc::new(Self {
            inner,
            path: String::new(),
        }))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of an exported symbol.
    pub fn symbol(&self, name: &str) -> Result<usize> {
        // SAFETY: the symbol is only read as an address
        let sym = unsafe { self.inner.get::<*mut c_void>(name.as_bytes()) }.map_err(|_| {
            AlienError::not_found("Symbol", name)
        })?;
        let address = *sym as usize;
        log::trace!("resolved {name} in \"{}\" at {address:#x}", self.path);
        Ok(address)
    }
}

impl Context {
    fn bind_command(
        &self,
        cmd_name: &str,
        proto: FunctionPrototype,
        address: usize,
        library: Option<Arc<Library>>,
    ) -> String {
        let proto = Arc::new(proto);
        let command: Command = Arc::new(move |ctx: &Context, args: &[Value]| {
            let _loaded = &library;
            ctx.call_function(&proto, address, args)
        });
        self.host.register(cmd_name, command)
    }

    /// Creates a host command calling `symbol` from `library`. Returns the
    /// qualified command name.
    pub fn define_function(
        &self,
        library: &Arc<Library>,
        symbol: &str,
        cmd_name: Option<&str>,
        ret: &Value,
        params: &Value,
        conv: CallConvention,
    ) -> Result<String> {
        let cmd_name = cmd_name.unwrap_or(symbol);
        let proto = self.build_prototype(cmd_name, ret, params, conv)?;
        let address = library.symbol(symbol)?;
        Ok(self.bind_command(cmd_name, proto, address, Some(library.clone())))
    }

    /// Like [`Context::define_function`] with a cached prototype.
    pub fn define_function_with_prototype(
        &self,
        library: &Arc<Library>,
        symbol: &str,
        cmd_name: Option<&str>,
        proto_name: &str,
    ) -> Result<String> {
        let proto = (*self.prototypes.lookup(proto_name)?).clone();
        let address = library.symbol(symbol)?;
        Ok(self.bind_command(cmd_name.unwrap_or(symbol), proto, address, Some(library.clone())))
    }

    /// Creates a host command calling the function at `address`.
    pub fn define_function_at(
        &self,
        cmd_name: &str,
        address: usize,
        ret: &Value,
        params: &Value,
        conv: CallConvention,
    ) -> Result<String> {
        if address == 0 {
            return Err(AlienError::null_not_allowed());
        }
        let proto = self.build_prototype(cmd_name, ret, params, conv)?;
        Ok(self.bind_command(cmd_name, proto, address, None))
    }

    /// Calls through a function pointer whose tag names a prototype.
    pub fn call_pointer(&self, fnptr: &Value, args: &[Value]) -> Result<Value> {
        let ptr = fnptr.as_pointer()?;
        if ptr.is_null() {
            return Err(AlienError::null_not_allowed());
        }
        let Some(tag) = ptr.tag.as_deref() else {
            return Err(AlienError::invalid_value(
                "Function pointer has no prototype tag.",
                fnptr,
            ));
        };
        let proto = self.prototypes.lookup(tag)?;
        self.call_function(&proto, ptr.address, args)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn binds_libc_functions() {
        let ctx = Context::default();
        let libc = Library::this().unwrap();
        let name = ctx
            .define_function(
                &libc,
                "strlen",
                None,
                &Value::from("ulong"),
                &Value::from("s string"),
                CallConvention::Default,
            )
            .unwrap();
        assert_eq!(name, "::strlen");
        let len = ctx.invoke(&Value::from("strlen"), &[Value::from("hello")]).unwrap();
        assert_eq!(len, Value::Int(5));
        assert_eq!(libc.symbol("no_such_symbol_here").unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(
            Library::load("/nonexistent/libnothing.so").err().map(|e| e.code),
            Some(ErrorCode::NotFound)
        );
    }
}
