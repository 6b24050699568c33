//! # Native Modules
//!
//! Host functions exposed to the VM as a regular module. A native module
//! declares its exports (name, calling convention, handler) and the imports
//! it needs from other modules, then participates in registration, import
//! binding, signals and calls like any other module kind.
//!
//! ## Example
//!
//! ```ignore
//! fn add(call: &mut NativeCall<'_, '_>) -> Result<ExecutionResult, VmError> {
//!     let args = call.arguments()?;
//!     let sum = args[0].as_i32().unwrap_or(0) + args[1].as_i32().unwrap_or(0);
//!     call.set_results(vec![Value::I32(sum)])?;
//!     Ok(ExecutionResult::Completed)
//! }
//!
//! let math = NativeModuleBuilder::new("math")
//!     .export(NativeFunction::new("add", "0ii_i", add))
//!     .build()?;
//! ```
//!
//! ## Suspension
//!
//! A handler may return [`ExecutionResult::Suspended`]. Its frame stays on
//! the stack and the handler runs again on resume with
//! [`NativeCall::is_resume`] set. The frame's scratch word
//! ([`NativeCall::frame_data`]) survives in between.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::any::Any;
use core::fmt::Write;

use spin::RwLock;

use crate::call::FunctionCall;
use crate::cconv::{check_signature_compatible, FunctionSignature, ParsedSignature, SegmentSizeList};
use crate::error::VmError;
use crate::function::{Function, FunctionDescriptor, Linkage, ModuleSignature, ReflectionAttr};
use crate::module::{Module, ModuleInterface, ModuleState, Signal};
use crate::source::SourceLocationFormatFlags;
use crate::stack::{ExecutionResult, Stack, StackFrame};
use crate::value::Value;

/// Host function body.
pub type NativeHandler = fn(&mut NativeCall<'_, '_>) -> Result<ExecutionResult, VmError>;

type StateFactory = Box<dyn Fn() -> Result<Box<dyn Any + Send>, VmError> + Send + Sync>;
type SignalHook = Box<dyn Fn(&mut (dyn Any + Send), Signal) -> Result<(), VmError> + Send + Sync>;

/// An exported host function.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub cconv: &'static str,
    pub handler: NativeHandler,
    pub attrs: &'static [(&'static str, &'static str)],
}

impl NativeFunction {
    pub const fn new(name: &'static str, cconv: &'static str, handler: NativeHandler) -> Self {
        Self {
            name,
            cconv,
            handler,
            attrs: &[],
        }
    }

    pub const fn with_attrs(mut self, attrs: &'static [(&'static str, &'static str)]) -> Self {
        self.attrs = attrs;
        self
    }
}

/// A function the module needs from another module, by `module.function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeImport {
    pub name: &'static str,
    /// Expected signature. Empty accepts any target.
    pub cconv: &'static str,
    pub optional: bool,
}

/// Builds a native [`Module`].
pub struct NativeModuleBuilder {
    name: &'static str,
    imports: Vec<NativeImport>,
    exports: Vec<NativeFunction>,
    attrs: Vec<(&'static str, &'static str)>,
    state_factory: Option<StateFactory>,
    signal_hook: Option<SignalHook>,
}

impl NativeModuleBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            imports: Vec::new(),
            exports: Vec::new(),
            attrs: Vec::new(),
            state_factory: None,
            signal_hook: None,
        }
    }

    /// Declares a required import.
    pub fn import(mut self, name: &'static str, cconv: &'static str) -> Self {
        self.imports.push(NativeImport {
            name,
            cconv,
            optional: false,
        });
        self
    }

    /// Declares an import the module can run without.
    pub fn optional_import(mut self, name: &'static str, cconv: &'static str) -> Self {
        self.imports.push(NativeImport {
            name,
            cconv,
            optional: true,
        });
        self
    }

    pub fn export(mut self, function: NativeFunction) -> Self {
        self.exports.push(function);
        self
    }

    /// Adds a module-level reflection attribute.
    pub fn attr(mut self, key: &'static str, value: &'static str) -> Self {
        self.attrs.push((key, value));
        self
    }

    /// Sets how per-context state is created. Defaults to `()`.
    pub fn state<T, F>(mut self, factory: F) -> Self
    where
        T: Any + Send,
        F: Fn() -> Result<T, VmError> + Send + Sync + 'static,
    {
        self.state_factory = Some(Box::new(move || {
            factory().map(|state| Box::new(state) as Box<dyn Any + Send>)
        }));
        self
    }

    /// Sets the handler for broadcast signals. Defaults to ignoring them.
    pub fn on_signal<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut (dyn Any + Send), Signal) -> Result<(), VmError> + Send + Sync + 'static,
    {
        self.signal_hook = Some(Box::new(hook));
        self
    }

    /// Validates every calling convention and initializes the module.
    pub fn build(self) -> Result<Module, VmError> {
        let cconvs = self
            .imports
            .iter()
            .map(|i| i.cconv)
            .chain(self.exports.iter().map(|e| e.cconv));
        for cconv in cconvs {
            ParsedSignature::parse(&FunctionSignature::new(cconv))?;
        }
        if self.imports.len() > u16::MAX as usize || self.exports.len() > u16::MAX as usize {
            return Err(VmError::ResourceExhausted);
        }

        Module::initialize(Box::new(NativeModule {
            name: self.name,
            imports: self.imports,
            exports: self.exports,
            attrs: self.attrs,
            state_factory: self.state_factory,
            signal_hook: self.signal_hook,
            lookup_cache: RwLock::new(BTreeMap::new()),
        }))
    }
}

struct NativeState {
    imports: Vec<Option<Function>>,
    data: Box<dyn Any + Send>,
}

struct NativeModule {
    name: &'static str,
    imports: Vec<NativeImport>,
    exports: Vec<NativeFunction>,
    attrs: Vec<(&'static str, &'static str)>,
    state_factory: Option<StateFactory>,
    signal_hook: Option<SignalHook>,
    /// Export name to ordinal, filled on first lookup.
    lookup_cache: RwLock<BTreeMap<String, u16>>,
}

impl NativeModule {
    fn export(&self, ordinal: u16) -> Result<&NativeFunction, VmError> {
        self.exports
            .get(ordinal as usize)
            .ok_or(VmError::IndexOutOfRange)
    }

    fn native_state(state: &mut ModuleState) -> Result<&mut NativeState, VmError> {
        state
            .downcast_mut::<NativeState>()
            .ok_or(VmError::InvalidState)
    }

    fn handler(&self, function: &Function) -> Result<NativeHandler, VmError> {
        if function.linkage() != Linkage::Export {
            return Err(VmError::NotFound);
        }
        Ok(self.export(function.ordinal())?.handler)
    }

    /// Runs the handler over the frame already on top of `stack`.
    fn run(
        &self,
        handler: NativeHandler,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
        resumed: bool,
    ) -> Result<ExecutionResult, VmError> {
        let result = handler(&mut NativeCall {
            stack: &mut *stack,
            call: &mut *call,
            resumed,
        });
        if !matches!(result, Ok(ExecutionResult::Suspended(_))) {
            stack.pop_frame();
        }
        result
    }
}

impl ModuleInterface for NativeModule {
    fn name(&self) -> &str {
        self.name
    }

    fn signature(&self) -> ModuleSignature {
        ModuleSignature {
            import_function_count: self.imports.len(),
            export_function_count: self.exports.len(),
            internal_function_count: 0,
        }
    }

    fn get_function(
        &self,
        linkage: Linkage,
        ordinal: u16,
    ) -> Result<FunctionDescriptor<'_>, VmError> {
        match linkage {
            Linkage::Import | Linkage::ImportOptional => {
                let import = self
                    .imports
                    .get(ordinal as usize)
                    .ok_or(VmError::IndexOutOfRange)?;
                Ok(FunctionDescriptor {
                    linkage: if import.optional {
                        Linkage::ImportOptional
                    } else {
                        Linkage::Import
                    },
                    name: import.name,
                    signature: FunctionSignature::new(import.cconv),
                })
            }
            Linkage::Export => {
                let export = self.export(ordinal)?;
                Ok(FunctionDescriptor {
                    linkage,
                    name: export.name,
                    signature: FunctionSignature::new(export.cconv),
                })
            }
            Linkage::Internal => Err(VmError::IndexOutOfRange),
        }
    }

    fn lookup_function(&self, linkage: Linkage, name: &str) -> Result<u16, VmError> {
        if linkage.is_import() {
            return self
                .imports
                .iter()
                .position(|i| i.name == name)
                .map(|i| i as u16)
                .ok_or(VmError::NotFound);
        }
        if linkage != Linkage::Export {
            return Err(VmError::NotFound);
        }

        if let Some(ordinal) = self.lookup_cache.read().get(name) {
            return Ok(*ordinal);
        }
        let ordinal = self
            .exports
            .iter()
            .position(|e| e.name == name)
            .ok_or(VmError::NotFound)? as u16;
        self.lookup_cache.write().insert(name.to_string(), ordinal);
        Ok(ordinal)
    }

    fn get_function_reflection_attr(
        &self,
        linkage: Linkage,
        ordinal: u16,
        index: usize,
    ) -> Result<ReflectionAttr<'_>, VmError> {
        if linkage != Linkage::Export {
            return Err(VmError::NotFound);
        }
        let &(key, value) = self
            .export(ordinal)?
            .attrs
            .get(index)
            .ok_or(VmError::NotFound)?;
        Ok(ReflectionAttr { key, value })
    }

    fn get_module_reflection_attr(&self, index: usize) -> Result<ReflectionAttr<'_>, VmError> {
        let &(key, value) = self.attrs.get(index).ok_or(VmError::NotFound)?;
        Ok(ReflectionAttr { key, value })
    }

    fn resolve_source_location(&self, frame: &StackFrame) -> Result<[u64; 2], VmError> {
        let function = frame.function();
        if function.linkage() != Linkage::Export {
            return Err(VmError::Unavailable);
        }
        self.export(function.ordinal())?;
        Ok([function.ordinal() as u64, frame.pc()])
    }

    fn format_source_location(
        &self,
        data: [u64; 2],
        _flags: SourceLocationFormatFlags,
        out: &mut String,
    ) -> Result<(), VmError> {
        let ordinal = u16::try_from(data[0]).map_err(|_| VmError::Unavailable)?;
        let export = self.export(ordinal).map_err(|_| VmError::Unavailable)?;
        let _ = write!(
            out,
            "{}.{}@native+{:#x}\n    in host handler ({})",
            self.name, export.name, data[1], export.cconv
        );
        Ok(())
    }

    fn alloc_state(&self) -> Result<Box<ModuleState>, VmError> {
        let mut imports = Vec::new();
        imports
            .try_reserve_exact(self.imports.len())
            .map_err(|_| VmError::ResourceExhausted)?;
        imports.resize(self.imports.len(), None);

        let data = match &self.state_factory {
            Some(factory) => factory()?,
            None => Box::new(()),
        };
        Ok(Box::new(NativeState { imports, data }))
    }

    fn resolve_import(
        &self,
        state: &mut ModuleState,
        ordinal: u16,
        function: &Function,
        signature: FunctionSignature<'_>,
    ) -> Result<(), VmError> {
        let import = self
            .imports
            .get(ordinal as usize)
            .ok_or(VmError::IndexOutOfRange)?;
        check_signature_compatible(&FunctionSignature::new(import.cconv), &signature)?;

        let slot = Self::native_state(state)?
            .imports
            .get_mut(ordinal as usize)
            .ok_or(VmError::IndexOutOfRange)?;
        *slot = Some(function.clone());
        Ok(())
    }

    fn notify(&self, state: &mut ModuleState, signal: Signal) -> Result<(), VmError> {
        match &self.signal_hook {
            Some(hook) => hook(&mut *Self::native_state(state)?.data, signal),
            None => Ok(()),
        }
    }

    fn begin_call(
        &self,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
    ) -> Result<ExecutionResult, VmError> {
        let handler = self.handler(call.function())?;
        stack.push_frame(call.function().clone())?;
        self.run(handler, stack, call, false)
    }

    fn resume_call(
        &self,
        stack: &mut Stack<'_>,
        call: &mut FunctionCall,
    ) -> Result<ExecutionResult, VmError> {
        let on_top = stack
            .top_frame()
            .map_or(false, |frame| frame.function() == call.function());
        if !on_top {
            return Err(VmError::InvalidState);
        }
        let handler = self.handler(call.function())?;
        self.run(handler, stack, call, true)
    }
}

/// What a handler sees of the call it is running.
pub struct NativeCall<'a, 'c> {
    stack: &'a mut Stack<'c>,
    call: &'a mut FunctionCall,
    resumed: bool,
}

impl<'a, 'c> NativeCall<'a, 'c> {
    /// True when running again after a suspension.
    pub fn is_resume(&self) -> bool {
        self.resumed
    }

    pub fn function(&self) -> &Function {
        self.call.function()
    }

    /// Decoded arguments. References are new tokens owned by the handler.
    pub fn arguments(&self) -> Result<Vec<Value>, VmError> {
        self.call.decode_arguments()
    }

    pub fn set_results(&mut self, values: Vec<Value>) -> Result<(), VmError> {
        self.call.write_results(values)
    }

    pub fn stack(&mut self) -> &mut Stack<'c> {
        self.stack
    }

    fn native_state(&mut self) -> Result<&mut NativeState, VmError> {
        let module = self.call.function().module().cloned().ok_or(VmError::NotFound)?;
        let state = self
            .stack
            .module_state_mut(&module)
            .ok_or(VmError::NotFound)?;
        NativeModule::native_state(state)
    }

    /// The module's per-context state, as created by its state factory.
    pub fn state<T: Any>(&mut self) -> Result<&mut T, VmError> {
        self.native_state()?
            .data
            .downcast_mut::<T>()
            .ok_or(VmError::TypeMismatch)
    }

    /// Scratch word of the handler's frame. Preserved across suspension.
    pub fn frame_data(&mut self) -> Result<&mut u64, VmError> {
        self.stack
            .top_frame_mut()
            .map(StackFrame::data_mut)
            .ok_or(VmError::InvalidState)
    }

    /// Records a program counter for backtraces.
    pub fn set_pc(&mut self, pc: u64) {
        if let Some(frame) = self.stack.top_frame_mut() {
            frame.set_pc(pc);
        }
    }

    /// Whether import `ordinal` was bound during registration.
    pub fn has_import(&mut self, ordinal: u16) -> bool {
        self.import(ordinal).is_ok()
    }

    fn import(&mut self, ordinal: u16) -> Result<Function, VmError> {
        self.native_state()?
            .imports
            .get(ordinal as usize)
            .ok_or(VmError::IndexOutOfRange)?
            .clone()
            .ok_or(VmError::NotFound)
    }

    /// Calls import `ordinal` to completion on the current stack.
    ///
    /// Fails with [`VmError::NotFound`] for an unbound optional import and
    /// with [`VmError::InvalidState`] if the callee tries to suspend. Imports
    /// with variadic results need [`Self::call_import_with_result_segments`].
    pub fn call_import(&mut self, ordinal: u16, arguments: Vec<Value>) -> Result<Vec<Value>, VmError> {
        self.call_import_with_result_segments(ordinal, arguments, &SegmentSizeList::new())
    }

    /// Like [`Self::call_import`], sizing each result span with the matching
    /// entry of `result_segments`.
    pub fn call_import_with_result_segments(
        &mut self,
        ordinal: u16,
        arguments: Vec<Value>,
        result_segments: &SegmentSizeList,
    ) -> Result<Vec<Value>, VmError> {
        let function = self.import(ordinal)?;
        let mut call = FunctionCall::new(function, arguments, result_segments)?;
        if !self.stack.begin_call(&mut call)?.is_completed() {
            return Err(VmError::InvalidState);
        }
        call.take_results()
    }
}
