//! VM values and the reference ownership token.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

use crate::cconv::ValueType;

struct RefObject {
    type_name: &'static str,
    object: Box<dyn Any + Send + Sync>,
}

/// A reference-counted VM value.
///
/// The core treats this as an opaque ownership token: cloning retains,
/// dropping releases. The object is destroyed with the last token.
/// Inside a marshaled buffer a reference occupies one 8-byte slot holding
/// the token (zero for null).
pub struct VmRef {
    inner: Arc<RefObject>,
}

impl VmRef {
    /// Wraps `object` in a new reference with a count of one.
    pub fn new<T: Any + Send + Sync>(type_name: &'static str, object: T) -> Self {
        Self {
            inner: Arc::new(RefObject {
                type_name,
                object: Box::new(object),
            }),
        }
    }

    /// Name of the type registered for this reference.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.object.downcast_ref::<T>()
    }

    /// Retains another token for the same object.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Releases this token.
    pub fn release(self) {}

    /// Current number of live tokens.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Converts into the raw slot encoding, transferring ownership into it.
    pub(crate) fn into_raw(self) -> u64 {
        Arc::into_raw(self.inner) as usize as u64
    }

    /// Takes ownership back from a raw slot.
    ///
    /// # Safety
    ///
    /// `raw` must be zero or a value produced by [`VmRef::into_raw`] that has
    /// not been taken back yet.
    pub(crate) unsafe fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(Self {
            inner: Arc::from_raw(raw as usize as *const RefObject),
        })
    }

    /// Retains a new token from a raw slot, leaving the slot's token in place.
    ///
    /// # Safety
    ///
    /// Same requirements as [`VmRef::from_raw`].
    pub(crate) unsafe fn clone_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        let ptr = raw as usize as *const RefObject;
        Arc::increment_strong_count(ptr);
        Some(Self {
            inner: Arc::from_raw(ptr),
        })
    }
}

impl Clone for VmRef {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for VmRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmRef")
            .field("type_name", &self.type_name())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Host-side view of one marshaled value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(Option<VmRef>),
    /// Variadic span: one inner list per tuple.
    Span(Vec<Vec<Value>>),
}

impl Value {
    /// Slot type, or `None` for spans.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Self::I32(_) => Some(ValueType::I32),
            Self::I64(_) => Some(ValueType::I64),
            Self::F32(_) => Some(ValueType::F32),
            Self::F64(_) => Some(ValueType::F64),
            Self::Ref(_) => Some(ValueType::Ref),
            Self::Span(_) => None,
        }
    }

    pub fn null_ref() -> Self {
        Self::Ref(None)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vm_ref(&self) -> Option<&VmRef> {
        match self {
            Self::Ref(Some(r)) => Some(r),
            _ => None,
        }
    }

    pub fn as_span(&self) -> Option<&[Vec<Value>]> {
        match self {
            Self::Span(tuples) => Some(tuples),
            _ => None,
        }
    }
}

impl From<VmRef> for Value {
    fn from(r: VmRef) -> Self {
        Self::Ref(Some(r))
    }
}
