//! # Execution Stacks
//!
//! A [`Stack`] carries the frames of one thread of VM execution across
//! modules. Calls enter through [`Stack::begin_call`] and either complete
//! or suspend. A suspended call keeps its frames on the stack and resumes
//! with [`Stack::resume_call`] on the same stack; it must not be resumed
//! anywhere else.
//!
//! ## States
//!
//! ```text
//!   Idle --begin--> Running --completed--> Idle
//!                      |
//!                  suspended
//!                      v
//!                  Suspended --resume--> Running
//! ```
//!
//! Only the outermost call may suspend. A nested call that suspends fails
//! the whole call with [`VmError::InvalidState`].

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::call::FunctionCall;
use crate::context::Context;
use crate::error::VmError;
use crate::function::Function;
use crate::module::{Module, ModuleState};
use crate::source::SourceLocationFormatFlags;

/// One activation record.
#[derive(Debug, Clone)]
pub struct StackFrame {
    function: Function,
    pc: u64,
    data: u64,
}

impl StackFrame {
    pub fn new(function: Function) -> Self {
        Self {
            function,
            pc: 0,
            data: 0,
        }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Module-defined program counter.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Scratch word owned by the frame's module.
    pub fn data(&self) -> u64 {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut u64 {
        &mut self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    Idle,
    Running,
    Suspended,
}

/// Opaque host handle a suspended call is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitHandle(pub u64);

/// Why a call gave up control.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum YieldReason {
    /// Cooperative yield; resume whenever convenient.
    Yield,
    /// Resume once any of the handles is signaled.
    Await(Vec<WaitHandle>),
    /// Stopped at a breakpoint.
    Break,
}

/// Outcome of beginning or resuming a call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutionResult {
    /// Results are in the call's result buffer.
    Completed,
    /// Execution stopped and must be resumed on the same stack.
    Suspended(YieldReason),
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn yield_reason(&self) -> Option<&YieldReason> {
        match self {
            Self::Suspended(reason) => Some(reason),
            Self::Completed => None,
        }
    }
}

/// Frames of one execution thread, bound to the context that owns the
/// module states.
pub struct Stack<'c> {
    context: &'c mut Context,
    frames: Vec<StackFrame>,
    max_depth: usize,
    status: StackStatus,
    suspended: Option<Function>,
}

impl<'c> Stack<'c> {
    pub fn new(context: &'c mut Context) -> Self {
        let max_depth = context.config().max_stack_depth;
        Self {
            context,
            frames: Vec::new(),
            max_depth,
            status: StackStatus::Idle,
            suspended: None,
        }
    }

    pub fn status(&self) -> StackStatus {
        self.status
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frames, outermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn top_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    /// Pushes a frame for `function`.
    pub fn push_frame(&mut self, function: Function) -> Result<&mut StackFrame, VmError> {
        if self.frames.len() >= self.max_depth {
            log::warn!("[vm] stack overflow at depth {}", self.frames.len());
            return Err(VmError::ResourceExhausted);
        }
        self.frames.push(StackFrame::new(function));
        self.frames.last_mut().ok_or(VmError::InvalidState)
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    pub fn context(&self) -> &Context {
        self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        self.context
    }

    /// State the context holds for `module`.
    pub fn module_state_mut(&mut self, module: &Module) -> Option<&mut ModuleState> {
        self.context.module_state_mut(module)
    }

    /// Begins `call` on this stack.
    ///
    /// The result buffer is released and zeroed first. On error every frame
    /// pushed by this call is popped.
    pub fn begin_call(&mut self, call: &mut FunctionCall) -> Result<ExecutionResult, VmError> {
        if self.status == StackStatus::Suspended {
            return Err(VmError::InvalidState);
        }
        if call.results().len() > self.context.config().max_result_buffer {
            return Err(VmError::ResourceExhausted);
        }
        let module = call.function().module().cloned().ok_or(VmError::NotFound)?;
        call.reset_results();

        let entry_depth = self.frames.len();
        let outermost = self.status == StackStatus::Idle;
        self.status = StackStatus::Running;

        let result = module.begin_call(self, call);
        self.finish_step(result, entry_depth, outermost, call)
    }

    /// Resumes the suspended outermost call.
    pub fn resume_call(&mut self, call: &mut FunctionCall) -> Result<ExecutionResult, VmError> {
        if self.status != StackStatus::Suspended {
            return Err(VmError::InvalidState);
        }
        if self.suspended.as_ref() != Some(call.function()) {
            return Err(VmError::InvalidState);
        }
        let module = call.function().module().cloned().ok_or(VmError::NotFound)?;
        self.status = StackStatus::Running;
        self.suspended = None;

        let result = module.resume_call(self, call);
        self.finish_step(result, 0, true, call)
    }

    fn finish_step(
        &mut self,
        result: Result<ExecutionResult, VmError>,
        entry_depth: usize,
        outermost: bool,
        call: &FunctionCall,
    ) -> Result<ExecutionResult, VmError> {
        match result {
            Ok(ExecutionResult::Suspended(reason)) if outermost => {
                self.status = StackStatus::Suspended;
                self.suspended = Some(call.function().clone());
                Ok(ExecutionResult::Suspended(reason))
            }
            Ok(ExecutionResult::Suspended(_)) => {
                log::warn!(
                    "[vm] nested call {} suspended; only the outermost call may yield",
                    call.function().name()
                );
                self.frames.truncate(entry_depth);
                Err(VmError::InvalidState)
            }
            other => {
                self.frames.truncate(entry_depth);
                if outermost {
                    self.status = StackStatus::Idle;
                }
                other
            }
        }
    }

    /// Appends a backtrace, innermost frame first.
    ///
    /// With [`SourceLocationFormatFlags::SINGLE_LINE`] only the innermost
    /// frame is written.
    pub fn format_backtrace(
        &self,
        flags: SourceLocationFormatFlags,
        out: &mut String,
    ) -> Result<(), VmError> {
        let single = flags.contains(SourceLocationFormatFlags::SINGLE_LINE);
        for (i, frame) in self.frames.iter().rev().enumerate() {
            if i > 0 {
                if single {
                    break;
                }
                out.push('\n');
            }
            let _ = write!(out, "[{}] ", i);

            let function = frame.function();
            let Some(module) = function.module() else {
                out.push_str("<null>");
                continue;
            };
            let formatted = module
                .resolve_source_location(frame)
                .and_then(|location| location.format(flags, out));
            match formatted {
                Ok(()) => {}
                Err(VmError::Unavailable) => {
                    let _ = write!(out, "{}.{}", module.name(), function.name());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
