//! The portable program data: every named object in the program plus,
//! per routine, its quad instruction stream. This is the contract
//! between a language front end and the code generators.

mod inst;
mod object;

pub use inst::{Block, Op, OpClass, Quad};
pub use object::{Array, Kind, Object, Prime, Routine, StorageClass, StructDef, StructInst, Width};

use derive_more::{Deref, DerefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("an object named {0} already exists")]
    DuplicateName(String),
    #[error("no object named {0}")]
    NotFound(String),
    #[error("the object has no name")]
    Unnamed,
    #[error("{field} is already set")]
    AlreadySet { field: &'static str },
    #[error("a count cannot be zero")]
    ZeroCount,
    #[error("{name} cannot be stored as {sclass}")]
    InvalidStorageClass { name: String, sclass: StorageClass },
    #[error("{name} is not a {expected}")]
    BadCast { name: String, expected: &'static str },
}

/// A stable index into the program's object arena. Handles never dangle:
/// only dead temps are ever removed, together with every instruction
/// that mentioned them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Handle(usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Default, Deref, DerefMut)]
struct NameIndex(BTreeMap<String, Handle>);

/// The program-wide object store. Owns every object; everything else
/// refers to them by `Handle`. Iteration follows insertion order and
/// stays stable across removals.
#[derive(Default)]
pub struct Ppd {
    arena: Vec<Option<Object>>,
    index: NameIndex,
}

impl Ppd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named object. Anonymous objects are rejected; so are
    /// second objects with a name already taken.
    pub fn add(&mut self, object: Object) -> Result<Handle> {
        if !object.is_named() {
            return Err(Error::Unnamed);
        }
        if self.index.contains_key(object.name()) {
            return Err(Error::DuplicateName(object.name().into()));
        }
        let handle = Handle(self.arena.len());
        self.index.insert(object.name().into(), handle);
        self.arena.push(Some(object));
        Ok(handle)
    }

    pub fn find(&self, name: &str) -> Result<Handle> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(name.into()))
    }

    pub fn get(&self, handle: Handle) -> &Object {
        match &self.arena[handle.0] {
            Some(obj) => obj,
            None => panic!("dangling object handle {handle}"),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Object {
        match &mut self.arena[handle.0] {
            Some(obj) => obj,
            None => panic!("dangling object handle {handle}"),
        }
    }

    /// Drop an object. Used by the liveness pass, and only to discard
    /// temps it has proven dead.
    pub fn remove(&mut self, name: &str) -> Result<Object> {
        let handle = self
            .index
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.into()))?;
        Ok(self.arena[handle.0]
            .take()
            .unwrap_or_else(|| panic!("index entry for {name} pointed at an empty slot")))
    }

    /// All live objects, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Object)> {
        self.arena
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|obj| (Handle(i), obj)))
    }

    /// Snapshot of the live handles, for passes that need to mutate
    /// while walking.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Human-readable dump of the whole container, for the debug trace
    /// file.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        for (handle, obj) in self.iter() {
            writeln!(
                out,
                "{handle}\t{:<8}{:<12}sz {:#x}\t{}",
                obj.sclass().to_string(),
                kind_tag(obj.kind()),
                obj.size(),
                obj.name(),
            )?;
            if let Kind::Routine(r) = obj.kind() {
                for quad in &r.code {
                    writeln!(out, "\t{quad}")?;
                }
                for (i, block) in r.blocks.iter().enumerate() {
                    writeln!(out, "    block {i}")?;
                    for quad in block.iter() {
                        writeln!(out, "\t{quad}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn kind_tag(kind: &Kind) -> &'static str {
    match kind {
        Kind::Prime(_) => "prime",
        Kind::Array(_) => "array",
        Kind::StructDef(_) => "struct_def",
        Kind::StructInst(_) => "struct_inst",
        Kind::Routine(_) => "routine",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prime(name: &str) -> Object {
        Object::new(name, StorageClass::Private, Kind::Prime(Prime::new())).unwrap()
    }

    #[test]
    fn add_then_find() {
        let mut ppd = Ppd::new();
        let h = ppd.add(prime("a")).unwrap();
        assert_eq!(ppd.find("a").unwrap(), h);
        assert_eq!(ppd.get(h).name(), "a");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut ppd = Ppd::new();
        ppd.add(prime("a")).unwrap();
        assert!(matches!(
            ppd.add(prime("a")),
            Err(Error::DuplicateName(n)) if n == "a"
        ));
    }

    #[test]
    fn anonymous_objects_are_rejected() {
        let mut ppd = Ppd::new();
        let anon = Object::anon(Kind::Prime(Prime::new()));
        assert!(matches!(ppd.add(anon), Err(Error::Unnamed)));
    }

    #[test]
    fn find_missing_is_an_error() {
        let ppd = Ppd::new();
        assert!(matches!(ppd.find("ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut ppd = Ppd::new();
        for name in ["zz", "aa", "mm"] {
            ppd.add(prime(name)).unwrap();
        }
        let order: Vec<&str> = ppd.iter().map(|(_, o)| o.name()).collect();
        assert_eq!(order, ["zz", "aa", "mm"]);
    }

    #[test]
    fn removal_keeps_the_order_of_the_rest() {
        let mut ppd = Ppd::new();
        for name in ["a", "b", "c"] {
            ppd.add(prime(name)).unwrap();
        }
        ppd.remove("b").unwrap();
        let order: Vec<&str> = ppd.iter().map(|(_, o)| o.name()).collect();
        assert_eq!(order, ["a", "c"]);
        assert!(matches!(ppd.remove("b"), Err(Error::NotFound(_))));
    }

    #[test]
    fn handles_survive_removal() {
        let mut ppd = Ppd::new();
        ppd.add(prime("a")).unwrap();
        let b = ppd.add(prime("b")).unwrap();
        ppd.remove("a").unwrap();
        assert_eq!(ppd.get(b).name(), "b");
    }
}
