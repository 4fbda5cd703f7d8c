//! The register descriptor: which object each physical register holds,
//! and whether the register holds its value or its address.

use super::super::x86::Reg;
use ir::Handle;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Content {
    /// The register holds the object's value.
    Val,
    /// The register holds the object's address.
    Ref,
}

#[derive(Debug, Default)]
pub struct RegDesc {
    slots: [Option<(Handle, Content)>; Reg::COUNT],
}

impl RegDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_all(&mut self) {
        self.slots = [None; Reg::COUNT];
    }

    pub fn clear(&mut self, reg: Reg) {
        self.slots[reg.idx()] = None;
    }

    pub fn set_val(&mut self, reg: Reg, obj: Handle) {
        self.slots[reg.idx()] = Some((obj, Content::Val));
    }

    pub fn set_ref(&mut self, reg: Reg, obj: Handle) {
        self.slots[reg.idx()] = Some((obj, Content::Ref));
    }

    pub fn find_val(&self, obj: Handle) -> Option<Reg> {
        self.find(obj, Content::Val)
    }

    pub fn find_ref(&self, obj: Handle) -> Option<Reg> {
        self.find(obj, Content::Ref)
    }

    fn find(&self, obj: Handle, content: Content) -> Option<Reg> {
        Reg::ALL
            .into_iter()
            .find(|r| self.slots[r.idx()] == Some((obj, content)))
    }

    pub fn is_empty(&self, reg: Reg) -> bool {
        self.slots[reg.idx()].is_none()
    }

    pub fn occupant(&self, reg: Reg) -> Option<(Handle, Content)> {
        self.slots[reg.idx()]
    }

    pub fn xchg(&mut self, a: Reg, b: Reg) {
        self.slots.swap(a.idx(), b.idx());
    }
}
