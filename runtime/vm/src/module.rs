//! # Module Interface
//!
//! A module is any unit that exposes callable functions: an interpreted
//! bytecode module, a set of native functions, or a proxy for the host.
//! Every kind implements [`ModuleInterface`]; callers only ever see the
//! [`Module`] handle wrapping it.
//!
//! ## Lifecycle
//!
//! ```text
//! constructed --initialize--> initialized --clone--> retained --last drop--> destroyed
//! ```
//!
//! The handle is atomically reference counted. The implementation's
//! [`ModuleInterface::destroy`] hook runs exactly once, when the last handle
//! (including those held by [`Function`]s) goes away.
//!
//! ## Threading
//!
//! Metadata operations (name, signature, lookups, source locations) take
//! `&self` and must be safe from any thread. Operations on a
//! [`ModuleState`] take it by `&mut`, so only one caller drives a given
//! state at a time.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use crate::call::FunctionCall;
use crate::cconv::FunctionSignature;
use crate::error::VmError;
use crate::function::{Function, FunctionDescriptor, Linkage, ModuleSignature, ReflectionAttr};
use crate::source::{SourceLocation, SourceLocationFormatFlags};
use crate::stack::{ExecutionResult, Stack, StackFrame};

/// Interface version implementations are built against.
pub const MODULE_INTERFACE_VERSION: u32 = 0;

/// Per-instantiation module storage (globals, import bindings, ...).
///
/// Thread-compatible: owned by one context and driven by one stack at a time.
pub type ModuleState = dyn Any + Send;

/// Lifecycle notifications a host broadcasts to every registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[non_exhaustive]
pub enum Signal {
    /// Program is resuming; modules may reallocate pools and caches.
    /// Delivered in registration order.
    Resume = 0,
    /// Program is suspending; drop transient memory.
    /// Delivered in reverse registration order.
    Suspend = 1,
    /// Drop everything possible, even if expensive to rebuild.
    /// Delivered in reverse registration order.
    LowMemory = 2,
}

impl Signal {
    pub fn from_raw(code: u32) -> Result<Self, VmError> {
        match code {
            0 => Ok(Self::Resume),
            1 => Ok(Self::Suspend),
            2 => Ok(Self::LowMemory),
            _ => Err(VmError::UnknownSignal(code)),
        }
    }

    /// True if the signal walks modules last-registered first.
    pub fn walks_in_reverse(&self) -> bool {
        !matches!(self, Self::Resume)
    }
}

/// Operations every module implementation provides.
pub trait ModuleInterface: Send + Sync {
    /// Interface version this implementation was written against.
    fn interface_version(&self) -> u32 {
        MODULE_INTERFACE_VERSION
    }

    /// Runs once when the last reference to the module is released.
    fn destroy(&mut self) {}

    /// Name used during import resolution.
    fn name(&self) -> &str;

    fn signature(&self) -> ModuleSignature;

    /// Describes the function at `ordinal`. Must be constant time.
    fn get_function(
        &self,
        linkage: Linkage,
        ordinal: u16,
    ) -> Result<FunctionDescriptor<'_>, VmError>;

    /// Finds the ordinal of a function by name. May scan linearly.
    fn lookup_function(&self, linkage: Linkage, name: &str) -> Result<u16, VmError>;

    /// Gets a function reflection attribute by index.
    fn get_function_reflection_attr(
        &self,
        _linkage: Linkage,
        _ordinal: u16,
        _index: usize,
    ) -> Result<ReflectionAttr<'_>, VmError> {
        Err(VmError::NotFound)
    }

    /// Gets a module-level reflection attribute by index.
    fn get_module_reflection_attr(&self, _index: usize) -> Result<ReflectionAttr<'_>, VmError> {
        Err(VmError::NotFound)
    }

    /// Maps a frame owned by this module to two words of locator data.
    /// Formatting is deferred to [`ModuleInterface::format_source_location`].
    fn resolve_source_location(&self, _frame: &StackFrame) -> Result<[u64; 2], VmError> {
        Err(VmError::Unavailable)
    }

    /// Formats locator data previously produced by this module.
    fn format_source_location(
        &self,
        _data: [u64; 2],
        _flags: SourceLocationFormatFlags,
        _out: &mut String,
    ) -> Result<(), VmError> {
        Err(VmError::Unavailable)
    }

    fn alloc_state(&self) -> Result<Box<ModuleState>, VmError>;

    fn free_state(&self, state: Box<ModuleState>) {
        drop(state);
    }

    /// Binds import `ordinal` in `state` to `function`. Implementations check
    /// `signature` against the signature they expect for the import.
    fn resolve_import(
        &self,
        state: &mut ModuleState,
        ordinal: u16,
        function: &Function,
        signature: FunctionSignature<'_>,
    ) -> Result<(), VmError>;

    /// Delivers a signal. Signals a module does not care about are ignored.
    fn notify(&self, _state: &mut ModuleState, _signal: Signal) -> Result<(), VmError> {
        Ok(())
    }

    /// Starts executing `call`. May return a suspended result, after which
    /// the caller resumes through [`ModuleInterface::resume_call`].
    fn begin_call(
        &self,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
    ) -> Result<ExecutionResult, VmError>;

    /// Continues a previously suspended call on the same stack.
    fn resume_call(
        &self,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
    ) -> Result<ExecutionResult, VmError>;
}

struct ModuleInner {
    interface: Box<dyn ModuleInterface>,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        log::debug!("[vm] destroying module '{}'", self.interface.name());
        self.interface.destroy();
    }
}

/// Shared handle to a module implementation.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    /// Binds an implementation to a new handle with a reference count of one.
    pub fn initialize(interface: Box<dyn ModuleInterface>) -> Result<Self, VmError> {
        let version = interface.interface_version();
        if version != MODULE_INTERFACE_VERSION {
            return Err(VmError::InterfaceVersionMismatch(version));
        }
        log::debug!(
            "[vm] initialized module '{}' ({:?})",
            interface.name(),
            interface.signature()
        );
        Ok(Self {
            inner: Arc::new(ModuleInner { interface }),
        })
    }

    /// Retains another handle to the module.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Releases this handle. The module is destroyed with the last one.
    pub fn release(self) {}

    /// Current number of handles, including those held by functions.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn interface(&self) -> &dyn ModuleInterface {
        &*self.inner.interface
    }

    pub fn name(&self) -> &str {
        self.interface().name()
    }

    pub fn signature(&self) -> ModuleSignature {
        self.interface().signature()
    }

    pub fn function_descriptor(
        &self,
        linkage: Linkage,
        ordinal: u16,
    ) -> Result<FunctionDescriptor<'_>, VmError> {
        self.interface().get_function(linkage, ordinal)
    }

    /// Looks up a function by ordinal. Constant time.
    pub fn lookup_function_by_ordinal(
        &self,
        linkage: Linkage,
        ordinal: u16,
    ) -> Result<Function, VmError> {
        let descriptor = self.interface().get_function(linkage, ordinal)?;
        Ok(Function::new(self.clone(), descriptor.linkage, ordinal))
    }

    /// Looks up a function by name. May scan; cache the result.
    pub fn lookup_function_by_name(&self, linkage: Linkage, name: &str) -> Result<Function, VmError> {
        let ordinal = self.interface().lookup_function(linkage, name)?;
        self.lookup_function_by_ordinal(linkage, ordinal)
    }

    pub fn function_reflection_attr(
        &self,
        linkage: Linkage,
        ordinal: u16,
        index: usize,
    ) -> Result<ReflectionAttr<'_>, VmError> {
        self.interface().get_function_reflection_attr(linkage, ordinal, index)
    }

    /// Gets a module reflection attribute by index.
    pub fn reflection_attr_at(&self, index: usize) -> Result<ReflectionAttr<'_>, VmError> {
        self.interface().get_module_reflection_attr(index)
    }

    /// Gets the value of module reflection attribute `key`, or "".
    pub fn reflection_attr(&self, key: &str) -> &str {
        let mut index = 0;
        while let Ok(attr) = self.reflection_attr_at(index) {
            if attr.key == key {
                return attr.value;
            }
            index += 1;
        }
        ""
    }

    /// Resolves `frame` to a deferred source location.
    pub fn resolve_source_location(&self, frame: &StackFrame) -> Result<SourceLocation, VmError> {
        let data = self.interface().resolve_source_location(frame)?;
        Ok(SourceLocation::new(self.clone(), data))
    }

    pub fn alloc_state(&self) -> Result<Box<ModuleState>, VmError> {
        self.interface().alloc_state()
    }

    pub fn free_state(&self, state: Box<ModuleState>) {
        self.interface().free_state(state)
    }

    pub fn resolve_import(
        &self,
        state: &mut ModuleState,
        ordinal: u16,
        function: &Function,
        signature: FunctionSignature<'_>,
    ) -> Result<(), VmError> {
        self.interface().resolve_import(state, ordinal, function, signature)
    }

    pub fn notify(&self, state: &mut ModuleState, signal: Signal) -> Result<(), VmError> {
        self.interface().notify(state, signal)
    }

    pub fn begin_call(
        &self,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
    ) -> Result<ExecutionResult, VmError> {
        log::trace!("[vm] begin {}.{}", self.name(), call.function().name());
        self.interface().begin_call(stack, call)
    }

    pub fn resume_call(
        &self,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
    ) -> Result<ExecutionResult, VmError> {
        log::trace!("[vm] resume {}.{}", self.name(), call.function().name());
        self.interface().resume_call(stack, call)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
