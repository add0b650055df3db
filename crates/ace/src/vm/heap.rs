//! The garbage-collected heap.
//!
//! Cells live in a slab addressed by [`HeapId`]; freed slots recycle through
//! a free list. Collection is a single mark-and-sweep pass driven by the VM,
//! which supplies the roots (thread stacks, registers, static memory). Mark
//! bits are cleared at the next cycle's entry, not at sweep time, so the
//! sweep never re-walks surviving cells.

use ahash::AHashMap;

use crate::{config::VmConfig, vm::value::Value};

/// Index of a cell in the heap slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// How an event-array entry matches a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The entry fires when the key equals the probe value.
    Exact,
    /// The entry fires for every probe.
    Any,
}

/// One ⟨match-mode, key, handler⟩ triple of an event array.
#[derive(Debug, Clone, Copy)]
pub struct EventEntry {
    pub mode: MatchMode,
    pub key: Value,
    pub handler: Value,
}

/// An object instance: layout from its static type-info plus the member
/// cells and a hash-bucketed name index. The prototype lives in the member
/// slot named `$proto`.
#[derive(Debug, Clone)]
pub struct ObjectData {
    /// Static-object id of the type-info this object was built from.
    pub type_id: u16,
    pub members: Vec<Value>,
    /// Member-name hash -> member index, built at allocation from the
    /// type-info's member names.
    pub name_index: AHashMap<u32, u8>,
}

impl ObjectData {
    /// Member slot for a name hash.
    #[must_use]
    pub fn member_by_hash(&self, hash: u32) -> Option<u8> {
        self.name_index.get(&hash).copied()
    }
}

/// The payload of a heap cell.
#[derive(Debug, Clone)]
pub enum HeapData {
    /// An immutable string.
    Str(Box<str>),
    Array(Vec<Value>),
    /// A view into a backing array: `[start, end)`.
    Slice {
        array: HeapId,
        start: usize,
        end: usize,
    },
    Object(ObjectData),
    EventArray(Vec<EventEntry>),
    /// Opaque host data; the host keys its own side table with the handle.
    UserData {
        tag: u32,
        handle: u64,
    },
}

impl HeapData {
    /// Kind name used in diagnostics and `typeof`.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "String",
            Self::Array(_) => "Array",
            Self::Slice { .. } => "Array",
            Self::Object(_) => "Object",
            Self::EventArray(_) => "EventArray",
            Self::UserData { .. } => "UserData",
        }
    }
}

#[derive(Debug)]
struct HeapCell {
    data: HeapData,
    marked: bool,
}

fn push_child(worklist: &mut Vec<HeapId>, value: &Value) {
    if let Value::HeapPtr(child) = value {
        worklist.push(*child);
    }
}

fn push_children(worklist: &mut Vec<HeapId>, values: &[Value]) {
    for value in values {
        push_child(worklist, value);
    }
}

/// Allocation failure: the heap is at its hard limit even after collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOverflow;

/// The heap: a slab of cells plus the GC threshold state.
#[derive(Debug)]
pub struct Heap {
    cells: Vec<Option<HeapCell>>,
    free: Vec<u32>,
    live: usize,
    threshold: usize,
    threshold_min: usize,
    threshold_max: usize,
    threshold_mul: usize,
}

impl Heap {
    #[must_use]
    pub fn new(config: &VmConfig) -> Self {
        Self {
            cells: Vec::new(),
            free: Vec::new(),
            live: 0,
            threshold: config.gc_threshold_min,
            threshold_min: config.gc_threshold_min,
            threshold_max: config.gc_threshold_max,
            threshold_mul: config.gc_threshold_mul,
        }
    }

    /// Number of live cells.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live
    }

    /// True when the next allocation should run a collection first.
    #[must_use]
    pub fn should_gc(&self) -> bool {
        self.live >= self.threshold
    }

    /// Allocates a cell. The caller runs GC beforehand when [`should_gc`]
    /// reports pressure; if the heap is still at its hard limit the
    /// allocation fails and the VM turns that into a runtime exception.
    ///
    /// [`should_gc`]: Self::should_gc
    pub fn alloc(&mut self, data: HeapData) -> Result<HeapId, HeapOverflow> {
        if self.live >= self.threshold_max {
            return Err(HeapOverflow);
        }
        self.live += 1;
        let cell = HeapCell { data, marked: false };
        match self.free.pop() {
            Some(index) => {
                self.cells[index as usize] = Some(cell);
                Ok(HeapId(index))
            }
            None => {
                let index = u32::try_from(self.cells.len()).expect("heap slab fits u32");
                self.cells.push(Some(cell));
                Ok(HeapId(index))
            }
        }
    }

    /// Reads a cell. Panics on a dangling id: the heap owns every cell it
    /// allocates and no id survives a failed sweep.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.cells[id.0 as usize].as_ref().expect("dangling heap id").data
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.cells[id.0 as usize].as_mut().expect("dangling heap id").data
    }

    /// Runs one mark-and-sweep cycle over the given roots. Returns the live
    /// counts before and after.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) -> (usize, usize) {
        let before = self.live;

        // Clear marks from the previous cycle.
        for cell in self.cells.iter_mut().flatten() {
            cell.marked = false;
        }

        // Mark: every reachable cell is visited exactly once per cycle.
        let mut worklist: Vec<HeapId> = roots
            .into_iter()
            .filter_map(|value| match value {
                Value::HeapPtr(id) => Some(id),
                _ => None,
            })
            .collect();
        while let Some(id) = worklist.pop() {
            let cell = self.cells[id.0 as usize].as_mut().expect("rooted cell is allocated");
            if cell.marked {
                continue;
            }
            cell.marked = true;
            match &cell.data {
                HeapData::Str(_) | HeapData::UserData { .. } => {}
                HeapData::Array(items) => push_children(&mut worklist, items),
                HeapData::Slice { array, .. } => worklist.push(*array),
                HeapData::Object(object) => push_children(&mut worklist, &object.members),
                HeapData::EventArray(entries) => {
                    for entry in entries {
                        push_child(&mut worklist, &entry.key);
                        push_child(&mut worklist, &entry.handler);
                    }
                }
            }
        }

        // Sweep: unlink unmarked cells. Marks stay set for the survivors and
        // are cleared on the next cycle's entry.
        for (index, slot) in self.cells.iter_mut().enumerate() {
            if let Some(cell) = slot {
                if !cell.marked {
                    *slot = None;
                    self.free.push(u32::try_from(index).expect("heap slab fits u32"));
                    self.live -= 1;
                }
            }
        }

        // Grow the threshold geometrically while pressure remains.
        if self.live >= self.threshold {
            self.threshold = (self.threshold * self.threshold_mul).min(self.threshold_max);
        } else {
            self.threshold = self.threshold.max(self.threshold_min);
        }

        (before, self.live)
    }

    /// True if the id refers to a live cell. Test-support only.
    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.cells
            .get(id.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn heap() -> Heap {
        Heap::new(&VmConfig::default())
    }

    #[test]
    fn alloc_and_read() {
        let mut heap = heap();
        let id = heap.alloc(HeapData::Str("hi".into())).expect("allocation");
        match heap.get(id) {
            HeapData::Str(s) => assert_eq!(s.as_ref(), "hi"),
            other => panic!("unexpected cell {other:?}"),
        }
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn unreachable_cells_are_swept() {
        let mut heap = heap();
        let kept = heap.alloc(HeapData::Str("kept".into())).expect("allocation");
        let dropped = heap.alloc(HeapData::Str("dropped".into())).expect("allocation");
        let (before, after) = heap.collect([Value::HeapPtr(kept)]);
        assert_eq!(before, 2);
        assert_eq!(after, 1);
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
    }

    #[test]
    fn reachability_recurses_through_containers() {
        let mut heap = heap();
        let inner = heap.alloc(HeapData::Str("inner".into())).expect("allocation");
        let array = heap
            .alloc(HeapData::Array(vec![Value::HeapPtr(inner), Value::I32(1)]))
            .expect("allocation");
        let slice = heap
            .alloc(HeapData::Slice {
                array,
                start: 0,
                end: 1,
            })
            .expect("allocation");
        heap.collect([Value::HeapPtr(slice)]);
        assert!(heap.is_live(inner));
        assert!(heap.is_live(array));
        assert!(heap.is_live(slice));
    }

    #[test]
    fn freed_slots_recycle() {
        let mut heap = heap();
        let a = heap.alloc(HeapData::Str("a".into())).expect("allocation");
        heap.collect(Vec::new());
        assert!(!heap.is_live(a));
        let b = heap.alloc(HeapData::Str("b".into())).expect("allocation");
        assert_eq!(a, b);
    }

    #[test]
    fn threshold_grows_geometrically_under_pressure() {
        let config = VmConfig {
            gc_threshold_min: 2,
            gc_threshold_max: 8,
            ..VmConfig::default()
        };
        let mut heap = Heap::new(&config);
        let mut roots = Vec::new();
        for i in 0..4 {
            let id = heap.alloc(HeapData::Array(vec![Value::I32(i)])).expect("allocation");
            roots.push(Value::HeapPtr(id));
        }
        assert!(heap.should_gc());
        heap.collect(roots.clone());
        // Everything survived, so the threshold doubled.
        assert!(!heap.should_gc());
    }

    #[test]
    fn hard_limit_fails_allocation() {
        let config = VmConfig {
            gc_threshold_min: 1,
            gc_threshold_max: 2,
            ..VmConfig::default()
        };
        let mut heap = Heap::new(&config);
        heap.alloc(HeapData::Str("a".into())).expect("allocation");
        heap.alloc(HeapData::Str("b".into())).expect("allocation");
        assert_eq!(heap.alloc(HeapData::Str("c".into())), Err(HeapOverflow));
    }
}
