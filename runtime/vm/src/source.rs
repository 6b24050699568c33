//! Deferred source locations.
//!
//! Resolving a frame only captures two words of module-defined data; nothing
//! is formatted until someone asks. The data is opaque: a byte offset, a hash
//! code or a native program counter are all valid, so never assume
//! `offset + 1` is the next byte.

use alloc::string::String;
use core::fmt;

use crate::error::VmError;
use crate::module::Module;

bitflags::bitflags! {
    /// Controls how source locations are formatted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SourceLocationFormatFlags: u32 {
        /// Only format a single line (no `\n`), even if a full backtrace or
        /// multi-line location is available.
        const SINGLE_LINE = 1 << 0;
    }
}

/// A resolved but not yet formatted location.
#[derive(Clone)]
pub struct SourceLocation {
    module: Module,
    data: [u64; 2],
}

impl SourceLocation {
    pub(crate) fn new(module: Module, data: [u64; 2]) -> Self {
        Self { module, data }
    }

    /// Module that produced the location and knows how to format it.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Module-defined locator words.
    pub fn data(&self) -> [u64; 2] {
        self.data
    }

    /// Appends the location to `out`.
    pub fn format(&self, flags: SourceLocationFormatFlags, out: &mut String) -> Result<(), VmError> {
        let start = out.len();
        self.module
            .interface()
            .format_source_location(self.data, flags, out)?;

        if flags.contains(SourceLocationFormatFlags::SINGLE_LINE) {
            if let Some(newline) = out[start..].find('\n') {
                out.truncate(start + newline);
            }
        }
        Ok(())
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.format(SourceLocationFormatFlags::empty(), &mut s)
            .map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl fmt::Debug for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceLocation")
            .field("module", &self.module.name())
            .field("data", &self.data)
            .finish()
    }
}
