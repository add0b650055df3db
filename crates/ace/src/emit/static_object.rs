//! Static objects: deduplicated compile-time constants addressable by a
//! stable id at runtime.
//!
//! Strings and type-infos deduplicate by value: registering a value-equal
//! entry returns the prior id. Labels and functions are identity objects
//! whose code positions are patched in while the IR is lowered.

use ahash::AHashMap;
use bitflags::bitflags;

/// Stable index into the static-object table. Encoded as a two-byte
/// immediate in `LOAD_STATIC` and `NEW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticObjectId(pub u16);

bitflags! {
    /// Flag byte of a static function entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u8 {
        /// The trailing parameter collects extra arguments into an array.
        const VARIADIC = 1 << 0;
        /// `addr` is a native-registry index, not a code position.
        const NATIVE = 1 << 1;
    }
}

/// A static function descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticFunction {
    /// Absolute code position of the body, or the native-registry index when
    /// `flags` carries `NATIVE`.
    pub addr: u32,
    pub nargs: u8,
    pub flags: FunctionFlags,
}

/// A static type descriptor: layout information consumed by `NEW`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticTypeInfo {
    pub name: Box<str>,
    /// Ordered member names, `$proto` included.
    pub members: Vec<Box<str>>,
}

/// One entry of the static-object table.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticObject {
    /// An absolute code position, used for catch targets.
    Label { position: u32 },
    String(Box<str>),
    Function(StaticFunction),
    TypeInfo(StaticTypeInfo),
}

/// The static-object table of a compilation.
#[derive(Debug, Default)]
pub struct StaticObjectTable {
    entries: Vec<StaticObject>,
    strings: AHashMap<Box<str>, StaticObjectId>,
    type_infos: AHashMap<StaticTypeInfo, StaticObjectId>,
}

impl StaticObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, entry: StaticObject) -> StaticObjectId {
        let id = StaticObjectId(u16::try_from(self.entries.len()).expect("static table fits u16"));
        self.entries.push(entry);
        id
    }

    /// Registers a string, returning the existing id for a value-equal entry.
    pub fn register_string(&mut self, value: &str) -> StaticObjectId {
        if let Some(&id) = self.strings.get(value) {
            return id;
        }
        let boxed: Box<str> = value.into();
        let id = self.push(StaticObject::String(boxed.clone()));
        self.strings.insert(boxed, id);
        id
    }

    /// Registers a type descriptor, returning the existing id for a
    /// value-equal entry.
    pub fn register_type_info(&mut self, info: StaticTypeInfo) -> StaticObjectId {
        if let Some(&id) = self.type_infos.get(&info) {
            return id;
        }
        let id = self.push(StaticObject::TypeInfo(info.clone()));
        self.type_infos.insert(info, id);
        id
    }

    /// Registers a function whose address is patched during lowering.
    pub fn register_function(&mut self, nargs: u8, flags: FunctionFlags) -> StaticObjectId {
        self.push(StaticObject::Function(StaticFunction { addr: 0, nargs, flags }))
    }

    /// Registers a native function entry with its registry index as address.
    pub fn register_native(&mut self, native_index: u32, nargs: u8, variadic: bool) -> StaticObjectId {
        let mut flags = FunctionFlags::NATIVE;
        if variadic {
            flags |= FunctionFlags::VARIADIC;
        }
        self.push(StaticObject::Function(StaticFunction {
            addr: native_index,
            nargs,
            flags,
        }))
    }

    /// Registers a label whose position is patched during lowering.
    pub fn register_label(&mut self) -> StaticObjectId {
        self.push(StaticObject::Label { position: 0 })
    }

    /// Writes the resolved code position into a label or function entry.
    pub fn patch_position(&mut self, id: StaticObjectId, position: u32) {
        match &mut self.entries[id.0 as usize] {
            StaticObject::Label { position: p } => *p = position,
            StaticObject::Function(f) => f.addr = position,
            other => panic!("cannot patch a position into {other:?}"),
        }
    }

    #[must_use]
    pub fn get(&self, id: StaticObjectId) -> &StaticObject {
        &self.entries[id.0 as usize]
    }

    #[must_use]
    pub fn entries(&self) -> &[StaticObject] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn strings_dedup_by_value() {
        let mut table = StaticObjectTable::new();
        let a = table.register_string("hello");
        let b = table.register_string("hello");
        let c = table.register_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn type_infos_dedup_by_value() {
        let mut table = StaticObjectTable::new();
        let info = StaticTypeInfo {
            name: "Point".into(),
            members: vec!["x".into(), "y".into(), "$proto".into()],
        };
        let a = table.register_type_info(info.clone());
        let b = table.register_type_info(info);
        assert_eq!(a, b);
    }

    #[test]
    fn functions_patch_their_address() {
        let mut table = StaticObjectTable::new();
        let id = table.register_function(2, FunctionFlags::empty());
        table.patch_position(id, 0x1234);
        let StaticObject::Function(f) = table.get(id) else {
            panic!("expected function entry");
        };
        assert_eq!(f.addr, 0x1234);
        assert_eq!(f.nargs, 2);
    }
}
