//! Module registration, import binding and signal broadcast.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::VmError;
use crate::function::{Function, Linkage};
use crate::module::{Module, ModuleState, Signal};
use crate::VmConfig;

struct ContextEntry {
    module: Module,
    state: Box<ModuleState>,
}

/// Set of modules sharing one execution environment.
///
/// Owns one state per registered module. Stacks borrow the context for the
/// duration of their calls.
pub struct Context {
    config: VmConfig,
    entries: Vec<ContextEntry>,
}

impl Context {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Registered modules in registration order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.entries.iter().map(|e| &e.module)
    }

    pub fn module_count(&self) -> usize {
        self.entries.len()
    }

    /// Registers `modules` and binds their imports.
    ///
    /// Imports resolve against every registered module, the batch included.
    /// Modules that are already registered are skipped. On failure nothing
    /// from the batch stays registered.
    pub fn register_modules(&mut self, modules: &[Module]) -> Result<(), VmError> {
        let first_new = self.entries.len();

        let mut fresh: Vec<&Module> = Vec::new();
        for module in modules {
            let known = self.entries.iter().any(|e| e.module.ptr_eq(module))
                || fresh.iter().any(|m| m.ptr_eq(module));
            if !known {
                fresh.push(module);
            }
        }
        if first_new + fresh.len() > self.config.max_modules {
            log::warn!(
                "[vm] context full: {} + {} modules exceeds {}",
                first_new,
                fresh.len(),
                self.config.max_modules
            );
            return Err(VmError::ResourceExhausted);
        }

        for module in fresh {
            match module.alloc_state() {
                Ok(state) => self.entries.push(ContextEntry {
                    module: module.clone(),
                    state,
                }),
                Err(e) => {
                    self.rollback(first_new);
                    return Err(e);
                }
            }
        }

        for index in first_new..self.entries.len() {
            if let Err(e) = self.resolve_imports(index) {
                self.rollback(first_new);
                return Err(e);
            }
        }

        log::debug!(
            "[vm] registered {} module(s), {} total",
            self.entries.len() - first_new,
            self.entries.len()
        );
        Ok(())
    }

    fn resolve_imports(&mut self, index: usize) -> Result<(), VmError> {
        let module = self.entries[index].module.clone();
        let count = module.signature().import_function_count;

        for ordinal in 0..count {
            let ordinal = u16::try_from(ordinal).map_err(|_| VmError::IndexOutOfRange)?;
            let descriptor = module.function_descriptor(Linkage::Import, ordinal)?;

            let target = match self.resolve_function(descriptor.name) {
                Ok(target) => target,
                Err(VmError::NotFound) if descriptor.linkage == Linkage::ImportOptional => {
                    log::debug!(
                        "[vm] {}: optional import {} left unbound",
                        module.name(),
                        descriptor.name
                    );
                    continue;
                }
                Err(e) => {
                    log::warn!(
                        "[vm] {}: import {} not resolved: {}",
                        module.name(),
                        descriptor.name,
                        e
                    );
                    return Err(e);
                }
            };

            let state = &mut *self.entries[index].state;
            module
                .resolve_import(state, ordinal, &target, target.signature())
                .map_err(|e| {
                    log::warn!(
                        "[vm] {}: import {} rejected: {}",
                        module.name(),
                        descriptor.name,
                        e
                    );
                    e
                })?;
            log::debug!("[vm] {}: bound import {}", module.name(), descriptor.name);
        }
        Ok(())
    }

    /// Drops entries from `first` onward, freeing states newest first.
    fn rollback(&mut self, first: usize) {
        while self.entries.len() > first {
            if let Some(entry) = self.entries.pop() {
                entry.module.free_state(entry.state);
            }
        }
    }

    /// Finds an export by its fully qualified `module.function` name.
    /// Later registrations shadow earlier ones.
    pub fn resolve_function(&self, full_name: &str) -> Result<Function, VmError> {
        let (module_name, function_name) = full_name.split_once('.').ok_or(VmError::NotFound)?;
        self.entries
            .iter()
            .rev()
            .filter(|e| e.module.name() == module_name)
            .find_map(|e| {
                e.module
                    .lookup_function_by_name(Linkage::Export, function_name)
                    .ok()
            })
            .ok_or(VmError::NotFound)
    }

    /// State held for `module`, if registered here.
    pub fn module_state_mut(&mut self, module: &Module) -> Option<&mut ModuleState> {
        self.entries
            .iter_mut()
            .find(|e| e.module.ptr_eq(module))
            .map(|e| &mut *e.state)
    }

    /// Broadcasts `signal` to every module.
    ///
    /// [`Signal::Resume`] goes in registration order, every other signal in
    /// reverse. Delivery stops at the first failure, which is returned as
    /// is. Modules that were already notified are not rolled back.
    pub fn notify(&mut self, signal: Signal) -> Result<(), VmError> {
        log::debug!("[vm] broadcasting {:?} to {} module(s)", signal, self.entries.len());

        let deliver = |entry: &mut ContextEntry| {
            entry.module.notify(&mut *entry.state, signal).map_err(|e| {
                log::warn!("[vm] {} failed {:?}: {}", entry.module.name(), signal, e);
                e
            })
        };

        if signal.walks_in_reverse() {
            self.entries.iter_mut().rev().try_for_each(deliver)
        } else {
            self.entries.iter_mut().try_for_each(deliver)
        }
    }

    /// Broadcasts a signal given by its raw code.
    pub fn notify_raw(&mut self, code: u32) -> Result<(), VmError> {
        self.notify(Signal::from_raw(code)?)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.rollback(0);
    }
}
