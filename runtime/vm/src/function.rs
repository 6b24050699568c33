//! Function references and module descriptors.

use core::fmt;

use crate::cconv::FunctionSignature;
use crate::error::VmError;
use crate::module::Module;

/// Role of a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u16)]
pub enum Linkage {
    /// Internal to the module; may have no reflection information.
    #[default]
    Internal = 0,
    /// Imported from another module.
    Import = 1,
    /// Exported by the module.
    Export = 2,
    /// Imported from another module that may be unavailable.
    ImportOptional = 3,
}

impl Linkage {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Internal),
            1 => Some(Self::Import),
            2 => Some(Self::Export),
            3 => Some(Self::ImportOptional),
            _ => None,
        }
    }

    /// Both import kinds share one ordinal space.
    pub fn is_import(&self) -> bool {
        matches!(self, Self::Import | Self::ImportOptional)
    }
}

/// Import, export and internal function counts of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleSignature {
    pub import_function_count: usize,
    pub export_function_count: usize,
    /// Only non-zero when the module carries debug information.
    pub internal_function_count: usize,
}

impl ModuleSignature {
    /// Number of ordinals valid for `linkage`.
    pub fn function_count(&self, linkage: Linkage) -> usize {
        match linkage {
            Linkage::Import | Linkage::ImportOptional => self.import_function_count,
            Linkage::Export => self.export_function_count,
            Linkage::Internal => self.internal_function_count,
        }
    }
}

/// A key/value reflection attribute. Borrowed from the owning module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectionAttr<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

/// What a module reports about one of its functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDescriptor<'a> {
    /// Actual linkage; imports report [`Linkage::ImportOptional`] when the
    /// module can run without them.
    pub linkage: Linkage,
    pub name: &'a str,
    pub signature: FunctionSignature<'a>,
}

/// A reference to a callable function.
///
/// Holds a counted reference to its module, so the module outlives every
/// non-null function pointing into it. Kept to at most three words since
/// functions are stored directly in stack frames.
#[derive(Clone, Default)]
pub struct Function {
    module: Option<Module>,
    linkage: Linkage,
    ordinal: u16,
}

const _: () = assert!(core::mem::size_of::<Function>() <= 3 * core::mem::size_of::<usize>());

impl Function {
    pub(crate) fn new(module: Module, linkage: Linkage, ordinal: u16) -> Self {
        Self {
            module: Some(module),
            linkage,
            ordinal,
        }
    }

    /// A function that does not exist.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.module.is_none()
    }

    pub fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn ordinal(&self) -> u16 {
        self.ordinal
    }

    fn descriptor(&self) -> Option<FunctionDescriptor<'_>> {
        let module = self.module.as_ref()?;
        module.function_descriptor(self.linkage, self.ordinal).ok()
    }

    /// Name of the function, or the empty string if not available.
    pub fn name(&self) -> &str {
        self.descriptor().map(|d| d.name).unwrap_or("")
    }

    /// Signature of the function, empty if no reflection data exists.
    pub fn signature(&self) -> FunctionSignature<'_> {
        self.descriptor()
            .map(|d| d.signature)
            .unwrap_or_else(FunctionSignature::empty)
    }

    /// Gets the reflection attribute at `index`.
    ///
    /// Fails with [`VmError::NotFound`] once `index` reaches the number of
    /// attributes.
    pub fn reflection_attr_at(&self, index: usize) -> Result<ReflectionAttr<'_>, VmError> {
        let module = self.module.as_ref().ok_or(VmError::NotFound)?;
        module.function_reflection_attr(self.linkage, self.ordinal, index)
    }

    /// Gets the value for reflection attribute `key`, or the empty string.
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
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        let same_module = match (&self.module, &other.module) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        same_module && self.linkage == other.linkage && self.ordinal == other.ordinal
    }
}

impl Eq for Function {}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => f
                .debug_struct("Function")
                .field("module", &module.name())
                .field("linkage", &self.linkage)
                .field("ordinal", &self.ordinal)
                .finish(),
            None => f.write_str("Function(null)"),
        }
    }
}
