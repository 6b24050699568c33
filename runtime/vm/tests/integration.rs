//! # S-VM Integration Tests
//!
//! Drives native modules through contexts and stacks:
//! - Import binding across modules, required and optional
//! - Cross-module calls and recursion limits
//! - Suspension, resumption and signals delivered in between
//! - Reference ownership through call buffers
//! - Backtraces across module kinds

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use splax_vm::{
    compute_cconv_fragment_size, CallStatus, Context, ExecutionResult, Function, FunctionCall,
    FunctionDescriptor, FunctionSignature, Invocation, Linkage, Module, ModuleInterface,
    ModuleSignature, ModuleState, NativeCall, NativeFunction, NativeModuleBuilder,
    SegmentSizeList, Signal, SourceLocationFormatFlags, Stack, StackStatus, Value, VmConfig,
    VmError, VmRef, WaitHandle, YieldReason,
};

type CallResult = Result<ExecutionResult, VmError>;

fn int_arg(call: &NativeCall<'_, '_>, index: usize) -> Result<i32, VmError> {
    call.arguments()?
        .get(index)
        .and_then(Value::as_i32)
        .ok_or(VmError::TypeMismatch)
}

// =============================================================================
// Test modules
// =============================================================================

fn add(call: &mut NativeCall<'_, '_>) -> CallResult {
    let sum = int_arg(call, 0)?.wrapping_add(int_arg(call, 1)?);
    call.set_results(vec![Value::I32(sum)])?;
    Ok(ExecutionResult::Completed)
}

fn sum_pairs(call: &mut NativeCall<'_, '_>) -> CallResult {
    let args = call.arguments()?;
    let mut total = args[0].as_i32().unwrap_or(0) + args[1].as_i32().unwrap_or(0);
    for pair in args[2].as_span().ok_or(VmError::TypeMismatch)? {
        total += pair.iter().filter_map(Value::as_i32).sum::<i32>();
    }
    call.set_results(vec![Value::I32(total)])?;
    Ok(ExecutionResult::Completed)
}

fn echo(call: &mut NativeCall<'_, '_>) -> CallResult {
    let args = call.arguments()?;
    call.set_results(args)?;
    Ok(ExecutionResult::Completed)
}

fn math_module() -> Module {
    NativeModuleBuilder::new("math")
        .export(NativeFunction::new("add", "0ii_i", add))
        .export(NativeFunction::new("sum_pairs", "0iiCiiD_i", sum_pairs))
        .export(NativeFunction::new("echo", "0r_r", echo))
        .build()
        .unwrap()
}

fn dispatch(call: &mut NativeCall<'_, '_>) -> CallResult {
    let x = int_arg(call, 0)?;
    call.set_results(vec![Value::I32(x * 10)])?;
    Ok(ExecutionResult::Completed)
}

fn gpu_module() -> Module {
    NativeModuleBuilder::new("gpu")
        .export(NativeFunction::new("dispatch", "0i_i", dispatch))
        .build()
        .unwrap()
}

/// `run(x) = add(x, 1) + (gpu present ? dispatch(...) : 100)`
fn run(call: &mut NativeCall<'_, '_>) -> CallResult {
    let x = int_arg(call, 0)?;
    let y = call.call_import(0, vec![Value::I32(x), Value::I32(1)])?[0]
        .as_i32()
        .ok_or(VmError::TypeMismatch)?;
    let bonus = if call.has_import(1) {
        call.call_import(1, vec![Value::I32(y)])?[0]
            .as_i32()
            .ok_or(VmError::TypeMismatch)?
    } else {
        100
    };
    call.set_results(vec![Value::I32(y + bonus)])?;
    Ok(ExecutionResult::Completed)
}

fn app_module() -> Module {
    NativeModuleBuilder::new("app")
        .import("math.add", "0ii_i")
        .optional_import("gpu.dispatch", "0i_i")
        .export(NativeFunction::new("run", "0i_i", run))
        .build()
        .unwrap()
}

fn call_i32(stack: &mut Stack<'_>, function: &Function, arg: i32) -> Result<i32, VmError> {
    let mut invocation = Invocation::new(function.clone(), vec![Value::I32(arg)])?;
    invocation.begin(stack)?;
    invocation.into_results()?[0]
        .as_i32()
        .ok_or(VmError::TypeMismatch)
}

// =============================================================================
// Import binding
// =============================================================================

#[test]
fn test_cross_module_call() {
    let mut context = Context::new(VmConfig::default());
    // Importer first: imports resolve once the whole batch has state.
    context
        .register_modules(&[app_module(), math_module()])
        .unwrap();
    let run = context.resolve_function("app.run").unwrap();

    let mut stack = Stack::new(&mut context);
    assert_eq!(call_i32(&mut stack, &run, 5), Ok(106));
    assert_eq!(stack.depth(), 0);
    assert_eq!(stack.status(), StackStatus::Idle);
}

#[test]
fn test_optional_import_bound_when_present() {
    let mut context = Context::new(VmConfig::default());
    context
        .register_modules(&[math_module(), gpu_module(), app_module()])
        .unwrap();
    let run = context.resolve_function("app.run").unwrap();

    let mut stack = Stack::new(&mut context);
    assert_eq!(call_i32(&mut stack, &run, 5), Ok(66));
}

#[test]
fn test_missing_required_import_rolls_back() {
    let mut context = Context::new(VmConfig::default());
    let result = context.register_modules(&[gpu_module(), app_module()]);
    assert_eq!(result, Err(VmError::NotFound));
    assert_eq!(context.module_count(), 0);
    assert_eq!(context.resolve_function("gpu.dispatch").err(), Some(VmError::NotFound));
}

#[test]
fn test_incompatible_import_rejected() {
    let strict = NativeModuleBuilder::new("strict")
        .import("math.add", "0i_i")
        .build()
        .unwrap();
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[math_module()]).unwrap();

    assert_eq!(
        context.register_modules(&[strict]),
        Err(VmError::IncompatibleSignature)
    );
    assert_eq!(context.module_count(), 1);
}

#[test]
fn test_untyped_import_accepts_any_signature() {
    let loose = NativeModuleBuilder::new("loose")
        .import("math.sum_pairs", "")
        .build()
        .unwrap();
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[math_module(), loose]).unwrap();
    assert_eq!(context.module_count(), 2);
}

#[test]
fn test_duplicate_registration_skipped() {
    let math = math_module();
    let mut context = Context::new(VmConfig::default());
    context
        .register_modules(&[math.clone(), math.clone()])
        .unwrap();
    context.register_modules(&[math.clone()]).unwrap();
    assert_eq!(context.module_count(), 1);
    assert_eq!(context.modules().next().map(Module::name), Some("math"));
}

#[test]
fn test_module_limit() {
    let mut context = Context::new(VmConfig {
        max_modules: 1,
        ..VmConfig::default()
    });
    assert_eq!(
        context.register_modules(&[math_module(), gpu_module()]),
        Err(VmError::ResourceExhausted)
    );
    assert_eq!(context.module_count(), 0);
}

// =============================================================================
// Calls
// =============================================================================

#[test]
fn test_variadic_arguments_sized_exactly() {
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[math_module()]).unwrap();
    let f = context.resolve_function("math.sum_pairs").unwrap();

    let span = Value::Span(vec![
        vec![Value::I32(3), Value::I32(4)],
        vec![Value::I32(5), Value::I32(6)],
    ]);
    let call = FunctionCall::new(
        f.clone(),
        vec![Value::I32(1), Value::I32(2), span.clone()],
        &SegmentSizeList::new(),
    )
    .unwrap();
    let expected = compute_cconv_fragment_size("iiCiiD", &SegmentSizeList::from_sizes(&[2])).unwrap();
    assert_eq!(expected, 28);
    assert_eq!(call.arguments().len(), expected);
    assert_eq!(call.results().len(), 4);
    drop(call);

    let mut stack = Stack::new(&mut context);
    let mut invocation = Invocation::new(f, vec![Value::I32(1), Value::I32(2), span]).unwrap();
    assert_eq!(invocation.begin(&mut stack), Ok(ExecutionResult::Completed));
    assert_eq!(invocation.into_results(), Ok(vec![Value::I32(21)]));
}

#[test]
fn test_wrong_argument_types_rejected_before_call() {
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[math_module()]).unwrap();
    let add = context.resolve_function("math.add").unwrap();

    let result = Invocation::new(add, vec![Value::I32(1), Value::F32(2.0)]);
    assert_eq!(result.err(), Some(VmError::TypeMismatch));
}

fn recurse(call: &mut NativeCall<'_, '_>) -> CallResult {
    let n = int_arg(call, 0)?;
    let depth = if n == 0 {
        0
    } else {
        call.call_import(0, vec![Value::I32(n - 1)])?[0]
            .as_i32()
            .ok_or(VmError::TypeMismatch)?
            + 1
    };
    call.set_results(vec![Value::I32(depth)])?;
    Ok(ExecutionResult::Completed)
}

#[test]
fn test_recursion_limited_by_stack_depth() {
    let module = NativeModuleBuilder::new("loop")
        .import("loop.recurse", "0i_i")
        .export(NativeFunction::new("recurse", "0i_i", recurse))
        .build()
        .unwrap();
    let mut context = Context::new(VmConfig {
        max_stack_depth: 8,
        ..VmConfig::default()
    });
    context.register_modules(&[module]).unwrap();
    let f = context.resolve_function("loop.recurse").unwrap();

    let mut stack = Stack::new(&mut context);
    assert_eq!(call_i32(&mut stack, &f, 7), Ok(7));

    let mut invocation = Invocation::new(f, vec![Value::I32(8)]).unwrap();
    assert_eq!(invocation.begin(&mut stack), Err(VmError::ResourceExhausted));
    assert_eq!(invocation.status(), CallStatus::Failed);
    assert_eq!(invocation.into_results(), Err(VmError::InvalidState));
    assert_eq!(stack.depth(), 0);
    assert_eq!(stack.status(), StackStatus::Idle);
}

fn range(call: &mut NativeCall<'_, '_>) -> CallResult {
    let n = int_arg(call, 0)?;
    call.set_results(vec![Value::Span((0..n).map(|i| vec![Value::I32(i)]).collect())])?;
    Ok(ExecutionResult::Completed)
}

/// Sums `range(n)`, sizing the result span from `n`.
fn total(call: &mut NativeCall<'_, '_>) -> CallResult {
    let n = int_arg(call, 0)?;
    let segments = SegmentSizeList::from_sizes(&[n as u16]);
    let results = call.call_import_with_result_segments(0, vec![Value::I32(n)], &segments)?;
    let sum = results[0]
        .as_span()
        .ok_or(VmError::TypeMismatch)?
        .iter()
        .filter_map(|tuple| tuple[0].as_i32())
        .sum();
    call.set_results(vec![Value::I32(sum)])?;
    Ok(ExecutionResult::Completed)
}

fn total_unsized(call: &mut NativeCall<'_, '_>) -> CallResult {
    let n = int_arg(call, 0)?;
    call.call_import(0, vec![Value::I32(n)])?;
    call.set_results(vec![Value::I32(0)])?;
    Ok(ExecutionResult::Completed)
}

#[test]
fn test_import_with_variadic_results() {
    let seq = NativeModuleBuilder::new("seq")
        .export(NativeFunction::new("range", "0i_CiD", range))
        .build()
        .unwrap();
    let user = NativeModuleBuilder::new("user")
        .import("seq.range", "0i_CiD")
        .export(NativeFunction::new("total", "0i_i", total))
        .export(NativeFunction::new("total_unsized", "0i_i", total_unsized))
        .build()
        .unwrap();

    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[seq, user]).unwrap();
    let total = context.resolve_function("user.total").unwrap();
    let total_unsized = context.resolve_function("user.total_unsized").unwrap();

    let mut stack = Stack::new(&mut context);
    assert_eq!(call_i32(&mut stack, &total, 4), Ok(6));
    assert_eq!(call_i32(&mut stack, &total, 0), Ok(0));
    assert_eq!(
        call_i32(&mut stack, &total_unsized, 4),
        Err(VmError::SegmentListTooShort)
    );
    assert_eq!(stack.depth(), 0);
    assert_eq!(stack.status(), StackStatus::Idle);
}

// =============================================================================
// Reference ownership
// =============================================================================

struct Tracked(Arc<AtomicUsize>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_ref_round_trip_through_call() {
    let drops = Arc::new(AtomicUsize::new(0));
    let keep = VmRef::new("tracked", Tracked(Arc::clone(&drops)));

    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[math_module()]).unwrap();
    let echo = context.resolve_function("math.echo").unwrap();

    let mut stack = Stack::new(&mut context);
    let mut invocation = Invocation::new(echo, vec![Value::from(keep.retain())]).unwrap();
    invocation.begin(&mut stack).unwrap();
    let results = invocation.into_results().unwrap();

    assert_eq!(results[0].as_vm_ref(), Some(&keep));
    assert_eq!(keep.ref_count(), 2);
    drop(results);
    assert_eq!(keep.ref_count(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(keep);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_release_is_idempotent() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[math_module()]).unwrap();
    let echo = context.resolve_function("math.echo").unwrap();

    let r = VmRef::new("tracked", Tracked(Arc::clone(&drops)));
    let mut call = FunctionCall::new(echo.clone(), vec![Value::from(r)], &SegmentSizeList::new())
        .unwrap();

    // A malformed signature leaves both buffers alone.
    let before = call.arguments().to_vec();
    assert_eq!(
        call.release(&FunctionSignature::new("9i_")),
        Err(VmError::MalformedSignature)
    );
    assert_eq!(call.arguments(), &before[..]);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    call.release(&echo.signature()).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    call.release(&echo.signature()).unwrap();
    drop(call);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

fn discard(_call: &mut NativeCall<'_, '_>) -> CallResult {
    Ok(ExecutionResult::Completed)
}

#[test]
fn test_release_with_other_signature_rejected() {
    let drops = Arc::new(AtomicUsize::new(0));
    let sink = NativeModuleBuilder::new("sink")
        .export(NativeFunction::new("discard", "0I", discard))
        .build()
        .unwrap();
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[sink, math_module()]).unwrap();
    let discard = context.resolve_function("sink.discard").unwrap();
    let echo = context.resolve_function("math.echo").unwrap();

    // An integer slot is never read back as a ref.
    let mut call = FunctionCall::new(
        discard.clone(),
        vec![Value::I64(0x4141_4141)],
        &SegmentSizeList::new(),
    )
    .unwrap();
    let before = call.arguments().to_vec();
    assert_eq!(
        call.release(&FunctionSignature::new("0r")),
        Err(VmError::IncompatibleSignature)
    );
    assert_eq!(call.arguments(), &before[..]);
    call.release(&discard.signature()).unwrap();
    assert_eq!(call.arguments(), &before[..]);

    // A ref slot is not skipped either.
    let r = VmRef::new("tracked", Tracked(Arc::clone(&drops)));
    let mut call = FunctionCall::new(echo.clone(), vec![Value::from(r)], &SegmentSizeList::new())
        .unwrap();
    assert_eq!(
        call.release(&FunctionSignature::new("0I_I")),
        Err(VmError::IncompatibleSignature)
    );
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(call);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

fn reject(_call: &mut NativeCall<'_, '_>) -> CallResult {
    Err(VmError::Aborted("rejected".into()))
}

#[test]
fn test_failed_call_releases_buffers() {
    let drops = Arc::new(AtomicUsize::new(0));
    let gate = NativeModuleBuilder::new("gate")
        .export(NativeFunction::new("reject", "0r_r", reject))
        .build()
        .unwrap();
    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[gate]).unwrap();
    let reject = context.resolve_function("gate.reject").unwrap();

    let r = VmRef::new("tracked", Tracked(Arc::clone(&drops)));
    let mut stack = Stack::new(&mut context);
    let mut invocation = Invocation::new(reject, vec![Value::from(r)]).unwrap();
    assert_eq!(
        invocation.begin(&mut stack),
        Err(VmError::Aborted("rejected".into()))
    );
    assert_eq!(invocation.status(), CallStatus::Failed);
    assert!(invocation.call().arguments().iter().all(|&b| b == 0));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    drop(invocation);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Suspension and signals
// =============================================================================

fn wait(call: &mut NativeCall<'_, '_>) -> CallResult {
    if !call.is_resume() {
        let x = int_arg(call, 0)?;
        *call.frame_data()? = x as u64;
        call.set_pc(1);
        return Ok(ExecutionResult::Suspended(YieldReason::Await(vec![
            WaitHandle(x as u64),
        ])));
    }
    let x = *call.frame_data()? as i32;
    call.set_results(vec![Value::I32(x * 2)])?;
    Ok(ExecutionResult::Completed)
}

fn recorder(name: &'static str, log: &Arc<Mutex<Vec<(&'static str, Signal)>>>) -> Module {
    let log = Arc::clone(log);
    NativeModuleBuilder::new(name)
        .on_signal(move |_, signal| {
            log.lock().unwrap().push((name, signal));
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn test_signal_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut context = Context::new(VmConfig::default());
    context
        .register_modules(&[recorder("a", &log), recorder("b", &log), recorder("c", &log)])
        .unwrap();

    let names = |log: &Arc<Mutex<Vec<(&'static str, Signal)>>>| -> Vec<&'static str> {
        log.lock().unwrap().drain(..).map(|(n, _)| n).collect()
    };

    context.notify(Signal::Resume).unwrap();
    assert_eq!(names(&log), ["a", "b", "c"]);
    context.notify(Signal::Suspend).unwrap();
    assert_eq!(names(&log), ["c", "b", "a"]);
    context.notify_raw(2).unwrap();
    assert_eq!(names(&log), ["c", "b", "a"]);

    assert_eq!(context.notify_raw(9), Err(VmError::UnknownSignal(9)));
    assert!(names(&log).is_empty());
}

#[test]
fn test_signal_failure_during_suspended_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sched_log = Arc::clone(&log);
    let sched = NativeModuleBuilder::new("sched")
        .export(NativeFunction::new("wait", "0i_i", wait))
        .on_signal(move |_, signal| {
            sched_log.lock().unwrap().push(signal);
            Ok(())
        })
        .build()
        .unwrap();
    let cache = NativeModuleBuilder::new("cache")
        .on_signal(|_, signal| {
            if signal == Signal::LowMemory {
                return Err(VmError::Aborted("pool in use".into()));
            }
            Ok(())
        })
        .build()
        .unwrap();

    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[sched, cache]).unwrap();
    let f = context.resolve_function("sched.wait").unwrap();

    let mut stack = Stack::new(&mut context);
    let mut invocation = Invocation::new(f.clone(), vec![Value::I32(21)]).unwrap();
    assert_eq!(
        invocation.begin(&mut stack),
        Ok(ExecutionResult::Suspended(YieldReason::Await(vec![WaitHandle(21)])))
    );
    assert_eq!(invocation.status(), CallStatus::Suspended);
    assert_eq!(stack.status(), StackStatus::Suspended);
    assert_eq!(stack.depth(), 1);

    // A suspended stack only takes the matching resume.
    let mut other = Invocation::new(f, vec![Value::I32(1)]).unwrap();
    assert_eq!(other.begin(&mut stack), Err(VmError::InvalidState));

    // "cache" is notified first and fails; "sched" never sees the signal.
    assert_eq!(
        stack.context_mut().notify(Signal::LowMemory),
        Err(VmError::Aborted("pool in use".into()))
    );
    assert!(log.lock().unwrap().is_empty());
    stack.context_mut().notify(Signal::Suspend).unwrap();
    assert_eq!(*log.lock().unwrap(), [Signal::Suspend]);

    assert_eq!(invocation.resume(&mut stack), Ok(ExecutionResult::Completed));
    assert_eq!(stack.status(), StackStatus::Idle);
    assert_eq!(stack.depth(), 0);
    assert_eq!(invocation.into_results(), Ok(vec![Value::I32(42)]));
}

// =============================================================================
// Backtraces
// =============================================================================

static TRACES: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// A module kind with no debug information.
struct RemoteModule;

impl ModuleInterface for RemoteModule {
    fn name(&self) -> &str {
        "remote"
    }

    fn signature(&self) -> ModuleSignature {
        ModuleSignature {
            export_function_count: 1,
            ..ModuleSignature::default()
        }
    }

    fn get_function(&self, linkage: Linkage, ordinal: u16) -> Result<FunctionDescriptor<'_>, VmError> {
        if linkage != Linkage::Export || ordinal != 0 {
            return Err(VmError::IndexOutOfRange);
        }
        Ok(FunctionDescriptor {
            linkage,
            name: "ping",
            signature: FunctionSignature::new("0_v"),
        })
    }

    fn lookup_function(&self, linkage: Linkage, name: &str) -> Result<u16, VmError> {
        match (linkage, name) {
            (Linkage::Export, "ping") => Ok(0),
            _ => Err(VmError::NotFound),
        }
    }

    fn alloc_state(&self) -> Result<Box<ModuleState>, VmError> {
        Ok(Box::new(()))
    }

    fn resolve_import(
        &self,
        _state: &mut ModuleState,
        _ordinal: u16,
        _function: &Function,
        _signature: FunctionSignature<'_>,
    ) -> Result<(), VmError> {
        Err(VmError::IndexOutOfRange)
    }

    fn begin_call(&self, stack: &mut Stack<'_>, call: &mut FunctionCall) -> CallResult {
        stack.push_frame(call.function().clone())?;
        let mut traces = TRACES.lock().unwrap();
        for flags in [
            SourceLocationFormatFlags::empty(),
            SourceLocationFormatFlags::SINGLE_LINE,
        ] {
            let mut out = String::new();
            stack.format_backtrace(flags, &mut out)?;
            traces.push(out);
        }
        stack.pop_frame();
        Ok(ExecutionResult::Completed)
    }

    fn resume_call(&self, _stack: &mut Stack<'_>, _call: &mut FunctionCall) -> CallResult {
        Err(VmError::InvalidState)
    }
}

fn outer_run(call: &mut NativeCall<'_, '_>) -> CallResult {
    call.set_pc(7);
    call.call_import(0, vec![])?;
    Ok(ExecutionResult::Completed)
}

#[test]
fn test_backtrace_across_module_kinds() {
    let remote = Module::initialize(Box::new(RemoteModule)).unwrap();
    let outer = NativeModuleBuilder::new("outer")
        .import("remote.ping", "0_v")
        .export(NativeFunction::new("run", "0_v", outer_run))
        .build()
        .unwrap();

    let mut context = Context::new(VmConfig::default());
    context.register_modules(&[remote, outer]).unwrap();
    let run = context.resolve_function("outer.run").unwrap();

    let mut stack = Stack::new(&mut context);
    let mut invocation = Invocation::new(run, vec![]).unwrap();
    assert_eq!(invocation.begin(&mut stack), Ok(ExecutionResult::Completed));

    let traces = TRACES.lock().unwrap();
    assert_eq!(
        traces[0],
        "[0] remote.ping\n[1] outer.run@native+0x7\n    in host handler (0_v)"
    );
    assert_eq!(traces[1], "[0] remote.ping");
}

// =============================================================================
// Sharing
// =============================================================================

fn bump(call: &mut NativeCall<'_, '_>) -> CallResult {
    let counter = call.state::<i32>()?;
    *counter += 1;
    let value = *counter;
    call.set_results(vec![Value::I32(value)])?;
    Ok(ExecutionResult::Completed)
}

#[test]
fn test_module_shared_across_contexts() {
    let counter = NativeModuleBuilder::new("counter")
        .export(NativeFunction::new("bump", "0_i", bump))
        .state(|| Ok(0i32))
        .build()
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let module = counter.retain();
            thread::spawn(move || {
                let mut context = Context::new(VmConfig::default());
                context.register_modules(&[module]).unwrap();
                let f = context.resolve_function("counter.bump").unwrap();
                let mut stack = Stack::new(&mut context);
                let mut last = 0;
                for _ in 0..50 {
                    let mut invocation = Invocation::new(f.clone(), vec![]).unwrap();
                    invocation.begin(&mut stack).unwrap();
                    last = invocation.into_results().unwrap()[0].as_i32().unwrap();
                }
                last
            })
        })
        .collect();

    for handle in handles {
        // Each context owns its own state.
        assert_eq!(handle.join().unwrap(), 50);
    }
    assert_eq!(counter.ref_count(), 1);
}
