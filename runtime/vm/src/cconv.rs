//! # Calling Convention Codec
//!
//! Every function crossing a module boundary declares its arguments and
//! results with a compact ASCII calling convention (cconv) string:
//!
//! ```text
//! '0'            version marker (only version 0 is recognized)
//! codes...       argument fragment
//! '_'            separator, optional when there are no results
//! codes...       result fragment
//! ```
//!
//! | code | type | slot |
//! |------|------|------|
//! | `i` | 32-bit integer | 4 bytes |
//! | `I` | 64-bit integer | 8 bytes |
//! | `f` | 32-bit float | 4 bytes |
//! | `F` | 64-bit float | 8 bytes |
//! | `r` | reference | [`REF_SLOT_SIZE`] bytes |
//! | `C`..`D` | variadic span of tuples | 4-byte count + count * tuple |
//! | `v` | void, no slot | 0 |
//!
//! Examples:
//!
//! ```text
//! ``          -> arguments = ``,     results = ``
//! `0v_ir`     -> arguments = ``,     results = `ir`
//! `0iCiD_rr`  -> arguments = `iCiD`, results = `rr`
//! `0iiCiiD_i` -> (i32, i32, tuple<i32, i32>...) -> i32
//! ```
//!
//! Buffers built from a fragment are packed little-endian with no padding, so
//! they can be serialized and replayed in another address space as long as
//! they carry no references.

use alloc::vec::Vec;

use crate::error::VmError;

/// Version 0 marker.
pub const CCONV_VERSION_0: u8 = b'0';

/// Separator between the argument and result fragments.
pub const CCONV_SEPARATOR: u8 = b'_';

/// Size of the count prefix written before every variadic span.
pub const SPAN_COUNT_SIZE: usize = 4;

/// Size of one reference slot. Fixed at 8 bytes on every target so buffer
/// layout does not depend on the pointer width.
pub const REF_SLOT_SIZE: usize = 8;

/// Raw calling convention codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CConvCode {
    Void = b'v',
    I32 = b'i',
    I64 = b'I',
    F32 = b'f',
    F64 = b'F',
    Ref = b'r',
    SpanStart = b'C',
    SpanEnd = b'D',
}

impl CConvCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'v' => Some(Self::Void),
            b'i' => Some(Self::I32),
            b'I' => Some(Self::I64),
            b'f' => Some(Self::F32),
            b'F' => Some(Self::F64),
            b'r' => Some(Self::Ref),
            b'C' => Some(Self::SpanStart),
            b'D' => Some(Self::SpanEnd),
            _ => None,
        }
    }
}

/// Types that occupy a slot in a marshaled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    Ref,
}

impl ValueType {
    /// Maps a slot code to its type. Void and span brackets have no slot.
    pub fn from_code(code: CConvCode) -> Option<Self> {
        match code {
            CConvCode::I32 => Some(Self::I32),
            CConvCode::I64 => Some(Self::I64),
            CConvCode::F32 => Some(Self::F32),
            CConvCode::F64 => Some(Self::F64),
            CConvCode::Ref => Some(Self::Ref),
            _ => None,
        }
    }

    /// Gets the cconv code for this type.
    pub fn code(&self) -> CConvCode {
        match self {
            Self::I32 => CConvCode::I32,
            Self::I64 => CConvCode::I64,
            Self::F32 => CConvCode::F32,
            Self::F64 => CConvCode::F64,
            Self::Ref => CConvCode::Ref,
        }
    }

    /// Bytes occupied in a buffer.
    pub const fn slot_size(&self) -> usize {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
            Self::Ref => REF_SLOT_SIZE,
        }
    }
}

/// Describes the expected calling convention of a function.
///
/// The string is borrowed from the module that declared it and stays valid
/// for as long as the module is alive. An empty string means `() -> ()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionSignature<'a> {
    pub calling_convention: &'a str,
}

impl<'a> FunctionSignature<'a> {
    pub const fn new(calling_convention: &'a str) -> Self {
        Self { calling_convention }
    }

    /// Signature of a function that takes and returns nothing.
    pub const fn empty() -> Self {
        Self { calling_convention: "" }
    }
}

/// Element counts for variadic spans, one entry per span in fragment order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSizeList {
    sizes: Vec<u16>,
}

impl SegmentSizeList {
    /// Creates an empty list, valid for fragments without spans.
    pub fn new() -> Self {
        Self { sizes: Vec::new() }
    }

    pub fn from_sizes(sizes: &[u16]) -> Self {
        Self { sizes: sizes.to_vec() }
    }

    pub fn push(&mut self, count: u16) {
        self.sizes.push(count);
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Gets the count of the span at `index`.
    pub fn get(&self, index: usize) -> Option<u16> {
        self.sizes.get(index).copied()
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.sizes
    }
}

/// One top-level entry of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentItem {
    Scalar(ValueType),
    /// Variadic span; holds the tuple element types.
    Span(Vec<ValueType>),
}

impl FragmentItem {
    /// Size of one tuple of a span, or of the scalar slot.
    pub fn element_size(&self) -> usize {
        match self {
            Self::Scalar(ty) => ty.slot_size(),
            Self::Span(types) => types.iter().map(|t| t.slot_size()).sum(),
        }
    }
}

/// A validated cconv fragment.
///
/// Sizing, counting, marshaling and release all walk this same item list so
/// they cannot disagree on the layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    items: Vec<FragmentItem>,
}

impl Fragment {
    /// Parses a fragment such as `iICriDr`.
    ///
    /// `v` is only accepted as the whole fragment, meaning no values.
    pub fn parse(fragment: &str) -> Result<Self, VmError> {
        let mut items = Vec::new();
        let mut span: Option<Vec<ValueType>> = None;

        for &b in strip_void(fragment).as_bytes() {
            let code = CConvCode::from_u8(b).ok_or(VmError::MalformedFragment)?;
            match code {
                CConvCode::Void => return Err(VmError::MalformedFragment),
                CConvCode::SpanStart => {
                    // Spans do not nest.
                    if span.is_some() {
                        return Err(VmError::MalformedFragment);
                    }
                    span = Some(Vec::new());
                }
                CConvCode::SpanEnd => {
                    let types = span.take().ok_or(VmError::MalformedFragment)?;
                    items.push(FragmentItem::Span(types));
                }
                _ => {
                    let ty = ValueType::from_code(code).ok_or(VmError::MalformedFragment)?;
                    match span.as_mut() {
                        Some(types) => types.push(ty),
                        None => items.push(FragmentItem::Scalar(ty)),
                    }
                }
            }
        }

        if span.is_some() {
            return Err(VmError::MalformedFragment);
        }
        Ok(Self { items })
    }

    pub fn items(&self) -> &[FragmentItem] {
        &self.items
    }

    /// Number of top-level values; each span counts once.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of variadic spans.
    pub fn span_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, FragmentItem::Span(_)))
            .count()
    }

    pub fn is_variadic(&self) -> bool {
        self.span_count() > 0
    }

    /// Bytes needed to hold this fragment, given the span element counts.
    pub fn required_size(&self, segments: &SegmentSizeList) -> Result<usize, VmError> {
        let mut required = 0usize;
        let mut segment = 0usize;

        for item in &self.items {
            match item {
                FragmentItem::Scalar(ty) => required += ty.slot_size(),
                FragmentItem::Span(_) => {
                    let count = segments.get(segment).ok_or(VmError::SegmentListTooShort)?;
                    segment += 1;
                    required += SPAN_COUNT_SIZE + count as usize * item.element_size();
                }
            }
        }

        Ok(required)
    }
}

/// Both fragments of a signature, parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSignature {
    pub arguments: Fragment,
    pub results: Fragment,
}

impl ParsedSignature {
    /// Parses a full signature. Any fragment error is reported as a
    /// malformed signature.
    pub fn parse(signature: &FunctionSignature<'_>) -> Result<Self, VmError> {
        let (arguments, results) = get_cconv_fragments(signature)?;
        Ok(Self {
            arguments: Fragment::parse(arguments).map_err(|_| VmError::MalformedSignature)?,
            results: Fragment::parse(results).map_err(|_| VmError::MalformedSignature)?,
        })
    }
}

/// Splits a signature into its argument and result fragments.
///
/// Either fragment may be empty. A `v` fragment is returned as empty.
pub fn get_cconv_fragments<'a>(
    signature: &FunctionSignature<'a>,
) -> Result<(&'a str, &'a str), VmError> {
    let cconv = signature.calling_convention;
    match cconv.as_bytes().first() {
        None => return Ok(("", "")),
        Some(&CCONV_VERSION_0) => {}
        Some(_) => return Err(VmError::MalformedSignature),
    }

    let body = &cconv[1..];
    let (arguments, results) = match body.bytes().position(|b| b == CCONV_SEPARATOR) {
        Some(split) => (&body[..split], &body[split + 1..]),
        None => (body, ""),
    };

    Ok((strip_void(arguments), strip_void(results)))
}

fn strip_void(fragment: &str) -> &str {
    if fragment.as_bytes() == [CConvCode::Void as u8] {
        ""
    } else {
        fragment
    }
}

/// Returns true if the fragment contains a variadic span.
pub fn is_variadic_cconv(fragment: &str) -> bool {
    fragment.as_bytes().contains(&(CConvCode::SpanStart as u8))
}

/// Counts top-level arguments and results; each span counts as one.
pub fn count_arguments_and_results(
    signature: &FunctionSignature<'_>,
) -> Result<(usize, usize), VmError> {
    let parsed = ParsedSignature::parse(signature)?;
    Ok((parsed.arguments.len(), parsed.results.len()))
}

/// Bytes required to store a fragment such as `iICriDr`.
///
/// `segment_size_list` holds one element count per variadic span, in order.
pub fn compute_cconv_fragment_size(
    fragment: &str,
    segment_size_list: &SegmentSizeList,
) -> Result<usize, VmError> {
    Fragment::parse(fragment)?.required_size(segment_size_list)
}

/// Checks that an import's actual signature matches what the importer was
/// built against. An importer without a declared signature accepts anything.
pub fn check_signature_compatible(
    expected: &FunctionSignature<'_>,
    actual: &FunctionSignature<'_>,
) -> Result<(), VmError> {
    if expected.calling_convention.is_empty() {
        return Ok(());
    }
    let expected = ParsedSignature::parse(expected)?;
    let actual = ParsedSignature::parse(actual)?;
    if expected != actual {
        return Err(VmError::IncompatibleSignature);
    }
    Ok(())
}
