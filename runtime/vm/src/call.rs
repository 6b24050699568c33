//! # Call Marshaling
//!
//! Arguments and results cross module boundaries as packed little-endian
//! byte buffers laid out by the callee's calling convention. This lets
//! modules with different internal representations (virtual registers,
//! machine registers, host values) call each other through one format.
//!
//! For `(i32, tuple<ref, i32>..., i32)`:
//!
//! ```text
//!  4b  i32
//!  4b  tuple count
//!      repeated:
//!        8b  ref
//!        4b  i32
//!  4b  i32
//! ```
//!
//! ## Ownership
//!
//! - References in the argument buffer belong to the caller. A callee that
//!   keeps one past the call retains its own token.
//! - References in the result buffer are retained for the caller, which
//!   must move them out or release them.
//! - [`FunctionCall::release`] drops every reference left in either buffer
//!   and zeroes the slot, so running it again is harmless.

use alloc::vec::Vec;

use crate::cconv::{
    Fragment, FragmentItem, FunctionSignature, ParsedSignature, SegmentSizeList, ValueType,
    SPAN_COUNT_SIZE,
};
use crate::error::VmError;
use crate::function::Function;
use crate::stack::{ExecutionResult, Stack};
use crate::value::{Value, VmRef};

// =============================================================================
// Buffer encoding
// =============================================================================

/// Computes the span element counts `values` needs and checks every value
/// against the slot type the fragment declares.
pub fn segment_sizes(fragment: &Fragment, values: &[Value]) -> Result<SegmentSizeList, VmError> {
    if values.len() != fragment.len() {
        return Err(VmError::TypeMismatch);
    }

    let mut segments = SegmentSizeList::new();
    for (item, value) in fragment.items().iter().zip(values) {
        match (item, value) {
            (FragmentItem::Scalar(ty), v) => {
                if v.value_type() != Some(*ty) {
                    return Err(VmError::TypeMismatch);
                }
            }
            (FragmentItem::Span(types), Value::Span(tuples)) => {
                let count = u16::try_from(tuples.len()).map_err(|_| VmError::ResourceExhausted)?;
                for tuple in tuples {
                    if tuple.len() != types.len() {
                        return Err(VmError::TypeMismatch);
                    }
                    for (ty, v) in types.iter().zip(tuple) {
                        if v.value_type() != Some(*ty) {
                            return Err(VmError::TypeMismatch);
                        }
                    }
                }
                segments.push(count);
            }
            _ => return Err(VmError::TypeMismatch),
        }
    }
    Ok(segments)
}

/// Marshals `values` into a new buffer sized exactly for `fragment`.
///
/// All values are validated before the buffer is allocated. References are
/// moved into the buffer.
pub fn marshal(fragment: &Fragment, values: Vec<Value>) -> Result<Vec<u8>, VmError> {
    let segments = segment_sizes(fragment, &values)?;
    let size = fragment.required_size(&segments)?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| VmError::ResourceExhausted)?;
    buf.resize(size, 0);
    encode_into(values, &mut buf);
    Ok(buf)
}

/// Writes pre-validated values at the start of `buf`.
fn encode_into(values: Vec<Value>, buf: &mut [u8]) {
    let mut offset = 0;
    for value in values {
        match value {
            Value::Span(tuples) => {
                offset = put(buf, offset, &(tuples.len() as u32).to_le_bytes());
                for tuple in tuples {
                    for v in tuple {
                        offset = write_slot(buf, offset, v);
                    }
                }
            }
            v => offset = write_slot(buf, offset, v),
        }
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) -> usize {
    let end = offset + bytes.len();
    buf[offset..end].copy_from_slice(bytes);
    end
}

fn write_slot(buf: &mut [u8], offset: usize, value: Value) -> usize {
    match value {
        Value::I32(v) => put(buf, offset, &v.to_le_bytes()),
        Value::I64(v) => put(buf, offset, &v.to_le_bytes()),
        Value::F32(v) => put(buf, offset, &v.to_bits().to_le_bytes()),
        Value::F64(v) => put(buf, offset, &v.to_bits().to_le_bytes()),
        Value::Ref(r) => {
            let raw = r.map(VmRef::into_raw).unwrap_or(0);
            put(buf, offset, &raw.to_le_bytes())
        }
        // Spans never nest; rejected by `segment_sizes`.
        Value::Span(_) => offset,
    }
}

struct SlotReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> SlotReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], VmError> {
        let end = self.offset + N;
        let bytes = self.buf.get(self.offset..end).ok_or(VmError::BufferTooSmall)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.offset = end;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32, VmError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn read(&mut self, ty: ValueType) -> Result<Value, VmError> {
        Ok(match ty {
            ValueType::I32 => Value::I32(i32::from_le_bytes(self.take::<4>()?)),
            ValueType::I64 => Value::I64(i64::from_le_bytes(self.take::<8>()?)),
            ValueType::F32 => Value::F32(f32::from_bits(u32::from_le_bytes(self.take::<4>()?))),
            ValueType::F64 => Value::F64(f64::from_bits(u64::from_le_bytes(self.take::<8>()?))),
            ValueType::Ref => {
                let raw = u64::from_le_bytes(self.take::<8>()?);
                // SAFETY: decoding only runs on `FunctionCall` buffers, written
                // by `encode_into` or vouched for by `from_raw_buffers`, and
                // always with the fragment that laid them out. A non-zero ref
                // slot holds a live token owned by the buffer.
                Value::Ref(unsafe { VmRef::clone_raw(raw) })
            }
        })
    }
}

/// Reads the values of `fragment` from `buf`, retaining a new token for
/// every reference. Span counts come from the buffer's count prefixes.
pub(crate) fn decode(fragment: &Fragment, buf: &[u8]) -> Result<Vec<Value>, VmError> {
    let mut reader = SlotReader::new(buf);
    let mut values = Vec::with_capacity(fragment.len());

    for item in fragment.items() {
        match item {
            FragmentItem::Scalar(ty) => values.push(reader.read(*ty)?),
            FragmentItem::Span(types) => {
                let count = reader.read_u32()? as usize;
                if count > u16::MAX as usize {
                    return Err(VmError::ResourceExhausted);
                }
                let needed = count
                    .checked_mul(item.element_size())
                    .ok_or(VmError::BufferTooSmall)?;
                if needed > reader.remaining() {
                    return Err(VmError::BufferTooSmall);
                }
                let mut tuples = Vec::with_capacity(count);
                for _ in 0..count {
                    let tuple = types
                        .iter()
                        .map(|ty| reader.read(*ty))
                        .collect::<Result<Vec<_>, _>>()?;
                    tuples.push(tuple);
                }
                values.push(Value::Span(tuples));
            }
        }
    }
    Ok(values)
}

/// Moves the values of `fragment` out of `buf`, leaving its ref slots null.
pub(crate) fn take(fragment: &Fragment, buf: &mut [u8]) -> Result<Vec<Value>, VmError> {
    let values = decode(fragment, buf)?;
    release_fragment(fragment, buf);
    Ok(values)
}

/// Offsets of every ref slot in `buf`. Stops at the first slot that does
/// not fit so truncated buffers are never read past their end. Spans
/// without refs are skipped in one step whatever their count says.
fn ref_slot_offsets(fragment: &Fragment, buf: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = 0usize;

    'walk: for item in fragment.items() {
        match item {
            FragmentItem::Scalar(ty) => {
                if offset + ty.slot_size() > buf.len() {
                    break 'walk;
                }
                if *ty == ValueType::Ref {
                    offsets.push(offset);
                }
                offset += ty.slot_size();
            }
            FragmentItem::Span(types) => {
                let Some(prefix) = buf.get(offset..offset + SPAN_COUNT_SIZE) else {
                    break 'walk;
                };
                let mut count = [0u8; 4];
                count.copy_from_slice(prefix);
                offset += SPAN_COUNT_SIZE;
                let count = u32::from_le_bytes(count) as usize;
                if !types.contains(&ValueType::Ref) {
                    match count
                        .checked_mul(item.element_size())
                        .and_then(|len| offset.checked_add(len))
                    {
                        Some(end) if end <= buf.len() => offset = end,
                        _ => break 'walk,
                    }
                    continue;
                }
                // Every element holds a ref slot, so the walk ends at the
                // buffer end after at most `len / 8` elements.
                for _ in 0..count {
                    for ty in types {
                        if offset + ty.slot_size() > buf.len() {
                            break 'walk;
                        }
                        if *ty == ValueType::Ref {
                            offsets.push(offset);
                        }
                        offset += ty.slot_size();
                    }
                }
            }
        }
    }
    offsets
}

/// Releases every reference in `buf` and nulls its slot.
pub(crate) fn release_fragment(fragment: &Fragment, buf: &mut [u8]) {
    for offset in ref_slot_offsets(fragment, buf) {
        let slot = &mut buf[offset..offset + 8];
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slot);
        slot.fill(0);
        // SAFETY: see `SlotReader::read`; zeroing first means the token is
        // taken back exactly once.
        drop(unsafe { VmRef::from_raw(u64::from_le_bytes(raw)) });
    }
}

// =============================================================================
// Function calls
// =============================================================================

/// Argument and result buffers for one invocation of a function.
///
/// The argument buffer is only read while the call begins. The result
/// buffer stays valid across the begin and every resume. Dropping the call
/// releases whatever references are still in either buffer.
pub struct FunctionCall {
    function: Function,
    signature: ParsedSignature,
    arguments: Vec<u8>,
    results: Vec<u8>,
}

impl FunctionCall {
    /// Marshals `arguments` for `function` and allocates a zeroed result
    /// buffer sized with `result_segments`.
    ///
    /// The signature is validated before any buffer is created.
    pub fn new(
        function: Function,
        arguments: Vec<Value>,
        result_segments: &SegmentSizeList,
    ) -> Result<Self, VmError> {
        let parsed = ParsedSignature::parse(&function.signature())?;
        let result_size = parsed.results.required_size(result_segments)?;
        let arguments = marshal(&parsed.arguments, arguments)?;

        let mut results = Vec::new();
        results
            .try_reserve_exact(result_size)
            .map_err(|_| VmError::ResourceExhausted)?;
        results.resize(result_size, 0);

        Ok(Self {
            function,
            signature: parsed,
            arguments,
            results,
        })
    }

    /// Builds a call around buffers produced elsewhere, e.g. deserialized
    /// from another address space.
    ///
    /// # Safety
    ///
    /// Both buffers must be laid out by the function's signature, and every
    /// ref slot in them must be zero or hold a token that the buffers own.
    pub unsafe fn from_raw_buffers(
        function: Function,
        arguments: Vec<u8>,
        results: Vec<u8>,
    ) -> Result<Self, VmError> {
        let signature = ParsedSignature::parse(&function.signature())?;
        Ok(Self {
            function,
            signature,
            arguments,
            results,
        })
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn arguments(&self) -> &[u8] {
        &self.arguments
    }

    pub fn results(&self) -> &[u8] {
        &self.results
    }

    /// Reads the arguments. The callee gets its own token for every
    /// reference.
    pub fn decode_arguments(&self) -> Result<Vec<Value>, VmError> {
        decode(&self.signature.arguments, &self.arguments)
    }

    /// Writes the call results, replacing anything written before.
    pub fn write_results(&mut self, values: Vec<Value>) -> Result<(), VmError> {
        let segments = segment_sizes(&self.signature.results, &values)?;
        if self.signature.results.required_size(&segments)? > self.results.len() {
            return Err(VmError::BufferTooSmall);
        }
        release_fragment(&self.signature.results, &mut self.results);
        self.results.fill(0);
        encode_into(values, &mut self.results);
        Ok(())
    }

    /// Moves the results out of the result buffer.
    pub fn take_results(&mut self) -> Result<Vec<Value>, VmError> {
        take(&self.signature.results, &mut self.results)
    }

    /// Releases any references left in the argument and result buffers.
    ///
    /// Only needed on failure paths: callers otherwise move results out.
    /// `signature` must match the function's own signature. A malformed
    /// signature fails with `MalformedSignature` and any other one with
    /// `IncompatibleSignature`, both without touching either buffer.
    pub fn release(&mut self, signature: &FunctionSignature<'_>) -> Result<(), VmError> {
        let parsed = ParsedSignature::parse(signature)?;
        if parsed != self.signature {
            return Err(VmError::IncompatibleSignature);
        }
        self.release_buffers();
        Ok(())
    }

    fn release_buffers(&mut self) {
        release_fragment(&self.signature.arguments, &mut self.arguments);
        release_fragment(&self.signature.results, &mut self.results);
    }

    /// Releases and zeroes the result buffer before a call begins.
    pub(crate) fn reset_results(&mut self) {
        release_fragment(&self.signature.results, &mut self.results);
        self.results.fill(0);
    }
}

impl Drop for FunctionCall {
    fn drop(&mut self) {
        self.release_buffers();
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// Where an [`Invocation`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Marshaled, not started.
    Pending,
    /// Yielded; waiting for a resume on the same stack.
    Suspended,
    Completed,
    /// Begin or resume failed; buffers were released.
    Failed,
}

/// Drives one call from marshaled arguments to unmarshaled results.
pub struct Invocation {
    call: FunctionCall,
    status: CallStatus,
}

impl Invocation {
    /// Prepares a call to a function without variadic results.
    pub fn new(function: Function, arguments: Vec<Value>) -> Result<Self, VmError> {
        Self::with_result_segments(function, arguments, &SegmentSizeList::new())
    }

    pub fn with_result_segments(
        function: Function,
        arguments: Vec<Value>,
        result_segments: &SegmentSizeList,
    ) -> Result<Self, VmError> {
        Ok(Self {
            call: FunctionCall::new(function, arguments, result_segments)?,
            status: CallStatus::Pending,
        })
    }

    pub fn function(&self) -> &Function {
        self.call.function()
    }

    pub fn call(&self) -> &FunctionCall {
        &self.call
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Begins the call on `stack`.
    pub fn begin(&mut self, stack: &mut Stack<'_>) -> Result<ExecutionResult, VmError> {
        if self.status != CallStatus::Pending {
            return Err(VmError::InvalidState);
        }
        let result = stack.begin_call(&mut self.call);
        self.settle(result)
    }

    /// Resumes a suspended call. Must use the stack it suspended on.
    pub fn resume(&mut self, stack: &mut Stack<'_>) -> Result<ExecutionResult, VmError> {
        if self.status != CallStatus::Suspended {
            return Err(VmError::InvalidState);
        }
        let result = stack.resume_call(&mut self.call);
        self.settle(result)
    }

    fn settle(
        &mut self,
        result: Result<ExecutionResult, VmError>,
    ) -> Result<ExecutionResult, VmError> {
        match result {
            Ok(r) => {
                self.status = if r.is_completed() {
                    CallStatus::Completed
                } else {
                    CallStatus::Suspended
                };
                Ok(r)
            }
            Err(e) => {
                self.status = CallStatus::Failed;
                self.call.release_buffers();
                Err(e)
            }
        }
    }

    /// Moves the results out of a completed call.
    pub fn into_results(mut self) -> Result<Vec<Value>, VmError> {
        if self.status != CallStatus::Completed {
            return Err(VmError::InvalidState);
        }
        self.call.take_results()
    }
}
