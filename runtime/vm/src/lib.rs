//! # S-VM: Cross-Module Execution Core
//!
//! S-VM is the call layer shared by every module kind that runs under a
//! Splax OS program: bytecode modules, native host modules and proxies for
//! code living elsewhere. Modules never see each other's internals; they
//! exchange calls as packed argument and result buffers described by a
//! compact calling-convention string.
//!
//! ## Design Philosophy
//!
//! - **One Call Format**: every boundary crossing uses the same byte layout
//! - **Explicit Ownership**: references in buffers are counted tokens
//! - **Resumable Calls**: a call may suspend and continue on the same stack
//! - **Deferred Debug Info**: source locations are resolved cheaply and
//!   formatted only on demand
//!
//! ## Calling Conventions
//!
//! `0<arguments>_<results>` with one code per value:
//!
//! - `i` / `I`: 32-bit / 64-bit integer
//! - `f` / `F`: 32-bit / 64-bit float
//! - `r`: reference
//! - `C ... D`: variadic span of tuples, prefixed by an `i32` count
//! - `v`: no values
//!
//! `0iCiD_rr` takes an integer and a span of integers and returns two
//! references.
//!
//! ## Example
//!
//! ```ignore
//! let mut context = Context::new(VmConfig::default());
//! context.register_modules(&[math])?;
//!
//! let add = context.resolve_function("math.add")?;
//! let mut stack = Stack::new(&mut context);
//! let mut invocation = Invocation::new(add, vec![Value::I32(2), Value::I32(3)])?;
//! invocation.begin(&mut stack)?;
//! let results = invocation.into_results()?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod call;
pub mod cconv;
pub mod context;
pub mod error;
pub mod function;
pub mod module;
pub mod native;
pub mod source;
pub mod stack;
pub mod value;

pub use call::{CallStatus, FunctionCall, Invocation};
pub use cconv::{
    check_signature_compatible, compute_cconv_fragment_size, count_arguments_and_results,
    get_cconv_fragments, is_variadic_cconv, CConvCode, FunctionSignature, SegmentSizeList,
    ValueType,
};
pub use context::Context;
pub use error::{ErrorCategory, VmError};
pub use function::{Function, FunctionDescriptor, Linkage, ModuleSignature, ReflectionAttr};
pub use module::{Module, ModuleInterface, ModuleState, Signal, MODULE_INTERFACE_VERSION};
pub use native::{NativeCall, NativeFunction, NativeHandler, NativeModuleBuilder};
pub use source::{SourceLocation, SourceLocationFormatFlags};
pub use stack::{ExecutionResult, Stack, StackFrame, StackStatus, WaitHandle, YieldReason};
pub use value::{Value, VmRef};

/// S-VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum modules registered in one context
    pub max_modules: usize,
    /// Maximum frames on one stack
    pub max_stack_depth: usize,
    /// Largest result buffer a call may request (bytes)
    pub max_result_buffer: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_modules: 256,
            max_stack_depth: 128,
            max_result_buffer: 16 * 1024 * 1024, // 16 MB
        }
    }
}
