//! # Runtime Module
//!
//! The shared registry every script links against: the native function table
//! and the interned string table.
//!
//! A [`Runtime`] is shared behind an `Arc` by any number of execution states,
//! possibly on different threads. Native registration takes the write side of
//! an `RwLock`; string interning locks a `Mutex` only for strings too long to
//! be stored inline.

use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{ExecResult, LinkError, LinkResult};
use crate::instruction::BX_UNSIGNED_MAX;
use crate::value::InternedString;
use crate::vm::ExecState;

/// A native function callback. Arguments and the return slot are accessed
/// through the [`ExecState`].
pub type NativeFunction = fn(&mut ExecState) -> ExecResult<()>;

/// Most native functions a runtime can hold; addresses must fit in `Bx`.
pub const MAX_NATIVE_FUNCTIONS: usize = BX_UNSIGNED_MAX as usize + 1;

struct NativeEntry {
    name: Arc<str>,
    callback: NativeFunction,
}

#[derive(Default)]
struct NativeTable {
    functions: Vec<NativeEntry>,
    lookup: FxHashMap<Arc<str>, u32>,
}

/// Native function table plus string interning, shared by every script.
#[derive(Default)]
pub struct Runtime {
    natives: RwLock<NativeTable>,
    strings: Mutex<FxHashSet<Arc<str>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // NATIVE FUNCTIONS
    // -------------------------------------------------------------------------

    /// Registers `callback` under `name` and returns its address.
    ///
    /// Registering an existing name replaces the callback and keeps the
    /// address, so scripts already linked against it stay valid.
    pub fn link_native_function(&self, name: &str, callback: NativeFunction) -> LinkResult<u32> {
        if name.is_empty() {
            return Err(LinkError::InvalidNativeFunctionName(name.to_string()));
        }

        let mut table = self.natives.write().unwrap_or_else(|e| e.into_inner());

        if let Some(&address) = table.lookup.get(name) {
            if let Some(entry) = table.functions.get_mut(address as usize) {
                entry.callback = callback;
            }
            debug!(name, address, "native function replaced");
            return Ok(address);
        }

        if table.functions.len() >= MAX_NATIVE_FUNCTIONS {
            return Err(LinkError::TooManyNativeFunctions);
        }
        table
            .functions
            .try_reserve(1)
            .map_err(|_| LinkError::OutOfMemory)?;

        let address = table.functions.len() as u32;
        let name: Arc<str> = Arc::from(name);
        table.functions.push(NativeEntry {
            name: Arc::clone(&name),
            callback,
        });
        table.lookup.insert(name, address);
        debug!(address, "native function registered");
        Ok(address)
    }

    pub fn native_function_address(&self, name: &str) -> Option<u32> {
        let table = self.natives.read().unwrap_or_else(|e| e.into_inner());
        table.lookup.get(name).copied()
    }

    pub fn native_function(&self, address: u32) -> LinkResult<NativeFunction> {
        let table = self.natives.read().unwrap_or_else(|e| e.into_inner());
        table
            .functions
            .get(address as usize)
            .map(|entry| entry.callback)
            .ok_or(LinkError::InvalidNativeFunctionAddress(address))
    }

    pub fn native_function_name(&self, address: u32) -> Option<Arc<str>> {
        let table = self.natives.read().unwrap_or_else(|e| e.into_inner());
        table
            .functions
            .get(address as usize)
            .map(|entry| Arc::clone(&entry.name))
    }

    pub fn native_function_count(&self) -> usize {
        let table = self.natives.read().unwrap_or_else(|e| e.into_inner());
        table.functions.len()
    }

    // -------------------------------------------------------------------------
    // STRING INTERNING
    // -------------------------------------------------------------------------

    /// Interns `s`. Short strings are stored inline; longer ones share one
    /// allocation per distinct content.
    pub fn intern(&self, s: &str) -> InternedString {
        if let Some(mini) = InternedString::mini(s) {
            return mini;
        }

        let mut strings = self.strings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = strings.get(s) {
            return InternedString::Shared(Arc::clone(existing));
        }
        let shared: Arc<str> = Arc::from(s);
        strings.insert(Arc::clone(&shared));
        InternedString::Shared(shared)
    }

    /// Number of shared strings currently in the table.
    pub fn interned_count(&self) -> usize {
        self.strings.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops table entries no value references any more.
    pub fn purge_strings(&self) -> usize {
        let mut strings = self.strings.lock().unwrap_or_else(|e| e.into_inner());
        let before = strings.len();
        strings.retain(|s| Arc::strong_count(s) > 1);
        let purged = before - strings.len();
        debug!(purged, "interned strings purged");
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut ExecState) -> ExecResult<()> {
        Ok(())
    }

    #[test]
    fn relinking_keeps_address() {
        let rt = Runtime::new();
        let a = rt.link_native_function("a", noop).unwrap();
        let b = rt.link_native_function("b", noop).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(rt.link_native_function("a", noop).unwrap(), 0);
        assert_eq!(rt.native_function_count(), 2);
        assert_eq!(rt.native_function_address("b"), Some(1));
    }

    #[test]
    fn empty_name_rejected() {
        let rt = Runtime::new();
        assert!(matches!(
            rt.link_native_function("", noop),
            Err(LinkError::InvalidNativeFunctionName(_))
        ));
        assert!(matches!(
            rt.native_function(7),
            Err(LinkError::InvalidNativeFunctionAddress(7))
        ));
    }

    #[test]
    fn long_strings_are_shared() {
        let rt = Runtime::new();
        let short = rt.intern("abc");
        assert!(short.is_mini());
        assert_eq!(rt.interned_count(), 0);

        let a = rt.intern("a longer string");
        let b = rt.intern("a longer string");
        assert!(a.ptr_eq(&b));
        assert_eq!(rt.interned_count(), 1);

        drop(a);
        assert_eq!(rt.purge_strings(), 0);
        drop(b);
        assert_eq!(rt.purge_strings(), 1);
    }
}
