mod alias;
mod arena;
mod attrs;
mod backend;
mod base_type;
mod call;
mod callback;
mod codec;
mod context;
mod encoding;
mod enums;
mod error;
mod host;
mod library;
mod memory;
mod pointer;
mod prototype;
mod structs;
mod types;
mod value;

pub use arena::{ARENA_ALIGN, Arena, ArenaFrame, FrameHandle};
pub use attrs::{AttrFlags, ParseMode};
pub use backend::{
    CallStack, ClosureHandler, ClosureSignature, LibffiBackend, NativeCallBackend,
    NativeClosure, NativeKind, StackBackend,
};
pub use base_type::BaseType;
pub use context::{BackendKind, Context, ContextCreateInfo, ContextShared};
pub use encoding::{Encoding, EncodingPolicy};
pub use enums::EnumDef;
pub use error::{AlienError, ErrorCode, Result};
pub use host::{Command, Host};
pub use library::Library;
pub use pointer::PointerKind;
pub use prototype::{CallConvention, FunctionPrototype, Param};
pub use structs::{Field, StructDescriptor, StructOptions};
pub use types::{ArraySize, ModeValue, TypeAndAttrs, TypeDescriptor, TypeTag};
pub use value::{PointerValue, Value, parse_list};
