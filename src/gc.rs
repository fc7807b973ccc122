//! # GC Module
//!
//! Reference-counted heap objects: arrays, objects and coroutines.
//!
//! ## Design Notes
//! - [`Gc<T>`] is the only way to hold a heap object. Each clone is one
//!   strong reference; dropping the last one frees the object at once and
//!   recursively releases whatever it contains.
//! - [`GcHeap`] keeps a `Weak` registry of everything it allocated. It never
//!   keeps objects alive; it counts them, prunes dead entries when collecting
//!   and audits for reference cycles, which refcounting alone cannot free.
//! - The registry is also pruned during allocation once it doubles past the
//!   live count seen at the last prune, so it stays proportional to the
//!   live set.
//! - Allocation failure (or hitting the configured object cap) triggers one
//!   collection and one retry before reporting `OutOfMemory`.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{ExecError, ExecResult};
use crate::value::{InternedString, Value};

// -----------------------------------------------------------------------------
// GC HANDLE
// -----------------------------------------------------------------------------

/// Owning, shared handle to a heap object.
pub struct Gc<T>(Rc<RefCell<T>>);

impl<T> Gc<T> {
    fn new(value: T) -> Self {
        Gc(Rc::new(RefCell::new(value)))
    }

    #[inline]
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    #[inline]
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    /// Number of live references (registers, containers, frames) to the object.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Gc<T>) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable identity of the object while it is alive.
    #[inline]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> Weak<RefCell<T>> {
        Rc::downgrade(&self.0)
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        Gc(Rc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:#x}, rc={})", self.addr(), self.ref_count())
    }
}

// -----------------------------------------------------------------------------
// ARRAY
// -----------------------------------------------------------------------------

/// Fixed-length register array.
#[derive(Default)]
pub struct Array {
    registers: Vec<Value>,
}

impl Array {
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.registers.get(index)
    }

    /// Replaces slot `index`, returning the previous value.
    pub fn replace(&mut self, index: usize, value: Value) -> ExecResult<Value> {
        let slot = self
            .registers
            .get_mut(index)
            .ok_or(ExecError::IndexOutOfBounds)?;
        Ok(std::mem::replace(slot, value))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.registers.iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.registers
    }
}

// -----------------------------------------------------------------------------
// OBJECT
// -----------------------------------------------------------------------------

/// String-keyed map over a growable slot buffer. Removed slots are recycled.
#[derive(Default)]
pub struct Object {
    lookup: FxHashMap<InternedString, usize>,
    slots: Vec<Value>,
    free: Vec<usize>,
}

impl Object {
    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn get(&self, key: &InternedString) -> Option<&Value> {
        self.lookup.get(key).and_then(|&slot| self.slots.get(slot))
    }

    pub fn set(&mut self, key: InternedString, value: Value) -> ExecResult<()> {
        if let Some(&slot) = self.lookup.get(&key) {
            let target = self
                .slots
                .get_mut(slot)
                .ok_or(ExecError::InternalBufferOverrun)?;
            *target = value;
            return Ok(());
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                let target = self
                    .slots
                    .get_mut(slot)
                    .ok_or(ExecError::InternalBufferOverrun)?;
                *target = value;
                slot
            }
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| ExecError::OutOfMemory)?;
                self.slots.push(value);
                self.slots.len() - 1
            }
        };

        self.lookup
            .try_reserve(1)
            .map_err(|_| ExecError::OutOfMemory)?;
        self.lookup.insert(key, slot);
        Ok(())
    }

    /// Removes `key`, returning its value and recycling the slot.
    pub fn remove(&mut self, key: &InternedString) -> Option<Value> {
        let slot = self.lookup.remove(key)?;
        let value = self.slots.get_mut(slot).map(std::mem::take);
        self.free.push(slot);
        value
    }

    /// Slots ever allocated, including recycled ones.
    pub fn capacity_used(&self) -> usize {
        self.slots.len()
    }

    /// Key/value pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&InternedString, &Value)> {
        let mut entries: Vec<(&InternedString, usize)> =
            self.lookup.iter().map(|(k, &slot)| (k, slot)).collect();
        entries.sort_by_key(|&(_, slot)| slot);
        entries
            .into_iter()
            .filter_map(move |(k, slot)| self.slots.get(slot).map(|v| (k, v)))
    }

    fn values(&self) -> impl Iterator<Item = &Value> {
        self.lookup.values().filter_map(move |&slot| self.slots.get(slot))
    }
}

// -----------------------------------------------------------------------------
// COROUTINE
// -----------------------------------------------------------------------------

/// A script function call that survives its `Return` until exhausted.
pub struct Coroutine {
    function: u32,
    pub(crate) registers: Vec<Value>,
    pub(crate) resume_at: Option<usize>,
    pub(crate) num_args: usize,
}

impl Coroutine {
    pub fn new(function: u32) -> Self {
        Self {
            function,
            registers: Vec::new(),
            resume_at: None,
            num_args: 0,
        }
    }

    /// Script function address this coroutine runs.
    pub fn function(&self) -> u32 {
        self.function
    }

    /// Instruction the next resume continues from, `None` if not started.
    pub fn resume_at(&self) -> Option<usize> {
        self.resume_at
    }

    pub fn is_started(&self) -> bool {
        self.resume_at.is_some()
    }

    /// Arguments the current run was started with.
    pub fn num_args(&self) -> usize {
        self.num_args
    }
}

// -----------------------------------------------------------------------------
// HEAP REGISTRY
// -----------------------------------------------------------------------------

enum HeapEntry {
    Array(Weak<RefCell<Array>>),
    Object(Weak<RefCell<Object>>),
    Coroutine(Weak<RefCell<Coroutine>>),
}

impl HeapEntry {
    fn is_live(&self) -> bool {
        match self {
            HeapEntry::Array(w) => w.strong_count() > 0,
            HeapEntry::Object(w) => w.strong_count() > 0,
            HeapEntry::Coroutine(w) => w.strong_count() > 0,
        }
    }
}

/// Snapshot produced by [`GcHeap::audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapAudit {
    pub arrays: usize,
    pub objects: usize,
    pub coroutines: usize,
    /// Live objects not reachable from any reference outside the heap.
    /// These are leaked reference cycles.
    pub unreachable: usize,
}

impl HeapAudit {
    pub fn live(&self) -> usize {
        self.arrays + self.objects + self.coroutines
    }
}

/// Tracks every object an execution state allocated.
pub struct GcHeap {
    entries: Vec<HeapEntry>,
    limit: Option<usize>,
    /// Registry length that triggers the next prune.
    prune_at: usize,
}

/// Smallest registry that is ever pruned during allocation.
const MIN_PRUNE: usize = 64;

impl GcHeap {
    /// `limit` caps the number of live objects; `None` is unbounded.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            limit,
            prune_at: MIN_PRUNE,
        }
    }

    pub fn alloc_array(&mut self, len: usize) -> ExecResult<Gc<Array>> {
        let registers = self.with_retry(|| {
            let mut registers = Vec::new();
            registers.try_reserve_exact(len).ok()?;
            registers.resize_with(len, Value::default);
            Some(registers)
        })?;
        self.track_array(registers)
    }

    /// Allocates an array holding `values`.
    pub fn alloc_array_from(&mut self, values: Vec<Value>) -> ExecResult<Gc<Array>> {
        self.with_retry(|| Some(()))?;
        self.track_array(values)
    }

    pub fn alloc_object(&mut self) -> ExecResult<Gc<Object>> {
        self.with_retry(|| Some(()))?;
        let gc = Gc::new(Object::default());
        self.entries.push(HeapEntry::Object(gc.downgrade()));
        Ok(gc)
    }

    pub fn alloc_coroutine(&mut self, coroutine: Coroutine) -> ExecResult<Gc<Coroutine>> {
        self.with_retry(|| Some(()))?;
        let gc = Gc::new(coroutine);
        self.entries.push(HeapEntry::Coroutine(gc.downgrade()));
        Ok(gc)
    }

    fn track_array(&mut self, registers: Vec<Value>) -> ExecResult<Gc<Array>> {
        let gc = Gc::new(Array { registers });
        self.entries.push(HeapEntry::Array(gc.downgrade()));
        Ok(gc)
    }

    /// Runs `alloc` once; on failure (or when at the object cap, or when the
    /// registry cannot grow) collects and tries once more.
    fn with_retry<R>(&mut self, mut alloc: impl FnMut() -> Option<R>) -> ExecResult<R> {
        if self.entries.len() >= self.prune_at {
            self.prune();
        }
        if let Some(result) = self.try_alloc(&mut alloc) {
            return Ok(result);
        }
        self.collect();
        self.try_alloc(&mut alloc).ok_or(ExecError::OutOfMemory)
    }

    fn try_alloc<R>(&mut self, alloc: &mut impl FnMut() -> Option<R>) -> Option<R> {
        if self
            .limit
            .is_some_and(|limit| self.entries.len() >= limit && self.live() >= limit)
        {
            return None;
        }
        self.entries.try_reserve(1).ok()?;
        alloc()
    }

    /// Drops registry entries whose objects have been freed.
    /// Returns the number of entries removed.
    pub fn collect(&mut self) -> usize {
        let freed = self.prune();
        debug!(freed, live = self.entries.len(), "gc collect");
        freed
    }

    fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(HeapEntry::is_live);
        self.prune_at = (self.entries.len() * 2).max(MIN_PRUNE);
        before - self.entries.len()
    }

    /// Registry entries, including ones whose objects are already freed.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Number of objects still alive.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    /// Counts live objects and finds the ones only kept alive by cycles.
    ///
    /// An object is externally referenced when its strong count exceeds the
    /// references held by other live heap objects; everything reachable from
    /// such roots is live, the rest is leaked.
    pub fn audit(&self) -> HeapAudit {
        let mut audit = HeapAudit::default();
        let mut nodes: Vec<Value> = Vec::new();
        for entry in &self.entries {
            match entry {
                HeapEntry::Array(w) => {
                    if let Some(rc) = w.upgrade() {
                        audit.arrays += 1;
                        nodes.push(Value::Array(Gc(rc)));
                    }
                }
                HeapEntry::Object(w) => {
                    if let Some(rc) = w.upgrade() {
                        audit.objects += 1;
                        nodes.push(Value::Object(Gc(rc)));
                    }
                }
                HeapEntry::Coroutine(w) => {
                    if let Some(rc) = w.upgrade() {
                        audit.coroutines += 1;
                        nodes.push(Value::Coroutine(Gc(rc)));
                    }
                }
            }
        }

        let index: FxHashMap<usize, usize> = nodes
            .iter()
            .enumerate()
            .filter_map(|(i, v)| gc_addr(v).map(|addr| (addr, i)))
            .collect();

        let mut internal = vec![0usize; nodes.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for_each_child(node, |child| {
                if let Some(&j) = gc_addr(child).and_then(|addr| index.get(&addr)) {
                    internal[j] += 1;
                    edges[i].push(j);
                }
            });
        }

        // The audit's own upgraded handle accounts for one strong reference.
        let mut reached: FxHashSet<usize> = FxHashSet::default();
        let mut stack: Vec<usize> = (0..nodes.len())
            .filter(|&i| gc_ref_count(&nodes[i]).saturating_sub(1) > internal[i])
            .collect();
        while let Some(i) = stack.pop() {
            if reached.insert(i) {
                stack.extend(edges[i].iter().copied());
            }
        }

        audit.unreachable = nodes.len() - reached.len();
        audit
    }
}

fn gc_addr(value: &Value) -> Option<usize> {
    match value {
        Value::Array(gc) => Some(gc.addr()),
        Value::Object(gc) => Some(gc.addr()),
        Value::Coroutine(gc) => Some(gc.addr()),
        _ => None,
    }
}

fn gc_ref_count(value: &Value) -> usize {
    match value {
        Value::Array(gc) => gc.ref_count(),
        Value::Object(gc) => gc.ref_count(),
        Value::Coroutine(gc) => gc.ref_count(),
        _ => 0,
    }
}

/// Visits values directly held by a heap object. Objects that are mutably
/// borrowed at the time are skipped.
fn for_each_child(node: &Value, mut visit: impl FnMut(&Value)) {
    match node {
        Value::Array(gc) => {
            if let Ok(array) = gc.0.try_borrow() {
                array.iter().for_each(&mut visit);
            }
        }
        Value::Object(gc) => {
            if let Ok(object) = gc.0.try_borrow() {
                object.values().for_each(&mut visit);
            }
        }
        Value::Coroutine(gc) => {
            if let Ok(co) = gc.0.try_borrow() {
                co.registers.iter().for_each(&mut visit);
            }
        }
        _ => {}
    }
}
