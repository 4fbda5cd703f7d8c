use crate::{Error, Handle, Result};
use std::fmt;

/// Where an object's storage lives, and therefore how the emitter reaches it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageClass {
    /// Static storage, visible to this module only.
    Private,
    /// Static storage, exported.
    Public,
    /// Static storage defined elsewhere.
    Extern,
    /// An automatic variable in the current activation record.
    Stack,
    /// A formal parameter of the enclosing routine.
    Param,
    /// A structure member; its offset stands in for an address.
    Member,
    /// A compiler generated temporary. Single definition, single use.
    Temp,
    /// A compile-time constant. An immediate.
    Const,
}

impl StorageClass {
    /// Static data lives in the data section under its own label.
    pub const fn is_static(self) -> bool {
        matches!(self, Self::Private | Self::Public | Self::Extern)
    }

    /// True when the object has a home location a register can be
    /// written back to.
    pub const fn is_memory_backed(self) -> bool {
        matches!(
            self,
            Self::Private | Self::Public | Self::Extern | Self::Stack | Self::Param
        )
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::Extern => "extern",
            Self::Stack => "stack",
            Self::Param => "param",
            Self::Member => "member",
            Self::Temp => "temp",
            Self::Const => "const",
        })
    }
}

/// Symbolic size class of a prime. Machine bytes are not known until the
/// layout pass maps these against a processor mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Width {
    Byte,
    Byte2,
    Byte4,
    Byte8,
    /// The natural word of the target.
    Word,
    /// Wide enough to hold an address.
    Ptr,
    /// The widest integer the target supports.
    Max,
}

/// A scalar datum.
///
/// The width is set exactly once and the signedness at most once; a
/// prime is unsigned unless told otherwise. `value` doubles as the
/// initialiser for static primes and the value of constants.
#[derive(Debug, Default)]
pub struct Prime {
    width: Option<Width>,
    sign: Option<bool>,
    value: u64,
}

impl Prime {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn width(&self) -> Option<Width> {
        self.width
    }

    pub fn set_width(&mut self, width: Width) -> Result<()> {
        if self.width.is_some() {
            return Err(Error::AlreadySet { field: "width" });
        }
        self.width = Some(width);
        Ok(())
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self.sign, Some(true))
    }

    pub fn set_signed(&mut self) -> Result<()> {
        if self.sign.is_some() {
            return Err(Error::AlreadySet { field: "signedness" });
        }
        self.sign = Some(true);
        Ok(())
    }

    pub const fn value(&self) -> u64 {
        self.value
    }

    pub fn set_value(&mut self, value: u64) {
        self.value = value;
    }
}

/// A homogeneous sequence of an anonymous element object.
///
/// The element is owned inline and never registered with the container;
/// only the array itself has a name.
#[derive(Debug)]
pub struct Array {
    count: u64,
    child: Box<Object>,
    init: Option<Vec<u8>>,
}

impl Array {
    pub fn new(child: Object, count: u64) -> Result<Self> {
        if count == 0 {
            return Err(Error::ZeroCount);
        }
        if child.is_routine() {
            return Err(Error::BadCast {
                name: child.name().into(),
                expected: "data object",
            });
        }
        Ok(Self {
            count,
            child: Box::new(child),
            init: None,
        })
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    pub fn child(&self) -> &Object {
        &self.child
    }

    pub fn child_mut(&mut self) -> &mut Object {
        &mut self.child
    }

    /// Borrow the element out by value, for passes that need the
    /// container free while they size it. Pair with `put_child`.
    pub fn take_child(&mut self) -> Object {
        std::mem::replace(&mut self.child, Object::anon(Kind::Prime(Prime::new())))
    }

    pub fn put_child(&mut self, child: Object) {
        self.child = Box::new(child);
    }

    pub fn init(&self) -> Option<&[u8]> {
        self.init.as_deref()
    }

    pub fn set_init(&mut self, bytes: Vec<u8>) {
        self.init = Some(bytes);
    }
}

/// A structure layout: an ordered list of named members, each a
/// container object of class `Member`. Order is significant; the layout
/// pass turns it into offsets.
#[derive(Debug, Default)]
pub struct StructDef {
    members: Vec<Handle>,
}

impl StructDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, member: Handle) {
        self.members.push(member);
    }

    pub fn members(&self) -> &[Handle] {
        &self.members
    }
}

/// A piece of storage shaped like some `StructDef`, referenced by name.
#[derive(Debug)]
pub struct StructInst {
    layout: String,
}

impl StructInst {
    pub fn new(layout: &str) -> Self {
        Self {
            layout: layout.into(),
        }
    }

    pub fn layout(&self) -> &str {
        &self.layout
    }
}

/// A function body.
///
/// The front end fills `code` with a linear quad stream; the block
/// former drains it into `blocks`. Parameters and automatics are
/// container objects listed here in declaration order.
#[derive(Debug, Default)]
pub struct Routine {
    pub code: Vec<crate::Quad>,
    pub blocks: Vec<crate::Block>,
    pub params: Vec<Handle>,
    pub autos: Vec<Handle>,
    /// Peak number of temps live at once; sizes the spill region.
    pub concurrent_temps: usize,
    /// Byte size of the automatic-variable region, set by layout.
    pub auto_size: usize,
}

impl Routine {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The variant payload of an object.
#[derive(Debug)]
pub enum Kind {
    Prime(Prime),
    Array(Array),
    StructDef(StructDef),
    StructInst(StructInst),
    Routine(Routine),
}

impl Kind {
    const fn tag(&self) -> &'static str {
        match self {
            Self::Prime(_) => "prime",
            Self::Array(_) => "array",
            Self::StructDef(_) => "struct definition",
            Self::StructInst(_) => "struct instance",
            Self::Routine(_) => "routine",
        }
    }
}

/// Anything with a name: data or code. The header carries the facts
/// every pass needs; the `Kind` payload carries the rest.
#[derive(Debug)]
pub struct Object {
    name: String,
    sclass: StorageClass,
    /// Computed byte size. Zero until the layout pass runs; routines
    /// stay zero.
    size: usize,
    /// Member offset from the parent, auto offset within the frame, or
    /// parameter ordinal, by storage class. Temps get spill slots from
    /// the emitter instead of an offset here.
    offset: usize,
    /// Liveness scratch, only meaningful during and after the liveness
    /// pass.
    live: bool,
    kind: Kind,
}

impl Object {
    /// A named object. The name is fixed for the object's whole life.
    pub fn new(name: &str, sclass: StorageClass, kind: Kind) -> Result<Self> {
        if matches!(kind, Kind::Routine(_))
            && !matches!(sclass, StorageClass::Private | StorageClass::Public)
        {
            return Err(Error::InvalidStorageClass {
                name: name.into(),
                sclass,
            });
        }
        Ok(Self {
            name: name.into(),
            sclass,
            size: 0,
            offset: 0,
            live: false,
            kind,
        })
    }

    /// An anonymous object, usable only as an array element.
    pub fn anon(kind: Kind) -> Self {
        Self {
            name: String::new(),
            sclass: StorageClass::Member,
            size: 0,
            offset: 0,
            live: false,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    pub const fn sclass(&self) -> StorageClass {
        self.sclass
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, bytes: usize) {
        self.size = bytes;
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub const fn live(&self) -> bool {
        self.live
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    pub const fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut Kind {
        &mut self.kind
    }

    pub const fn is_routine(&self) -> bool {
        matches!(self.kind, Kind::Routine(_))
    }

    /// Static data gets a declaration in the data section; routines and
    /// everything stack- or register-resident do not.
    pub const fn is_static_data(&self) -> bool {
        matches!(self.sclass, StorageClass::Private | StorageClass::Public)
            && !self.is_routine()
    }

    pub fn as_prime(&self) -> Result<&Prime> {
        match &self.kind {
            Kind::Prime(p) => Ok(p),
            k => Err(self.cast_err(k, "prime")),
        }
    }

    pub fn as_prime_mut(&mut self) -> Result<&mut Prime> {
        match &mut self.kind {
            Kind::Prime(p) => Ok(p),
            _ => Err(Error::BadCast {
                name: self.name.clone(),
                expected: "prime",
            }),
        }
    }

    pub fn as_array(&self) -> Result<&Array> {
        match &self.kind {
            Kind::Array(a) => Ok(a),
            k => Err(self.cast_err(k, "array")),
        }
    }

    pub fn as_array_mut(&mut self) -> Result<&mut Array> {
        match &mut self.kind {
            Kind::Array(a) => Ok(a),
            _ => Err(Error::BadCast {
                name: self.name.clone(),
                expected: "array",
            }),
        }
    }

    pub fn as_struct_def(&self) -> Result<&StructDef> {
        match &self.kind {
            Kind::StructDef(s) => Ok(s),
            k => Err(self.cast_err(k, "struct definition")),
        }
    }

    pub fn as_struct_inst(&self) -> Result<&StructInst> {
        match &self.kind {
            Kind::StructInst(s) => Ok(s),
            k => Err(self.cast_err(k, "struct instance")),
        }
    }

    pub fn as_routine(&self) -> Result<&Routine> {
        match &self.kind {
            Kind::Routine(r) => Ok(r),
            k => Err(self.cast_err(k, "routine")),
        }
    }

    pub fn as_routine_mut(&mut self) -> Result<&mut Routine> {
        match &mut self.kind {
            Kind::Routine(r) => Ok(r),
            _ => Err(Error::BadCast {
                name: self.name.clone(),
                expected: "routine",
            }),
        }
    }

    fn cast_err(&self, got: &Kind, expected: &'static str) -> Error {
        log::error!("{}: expected a {expected}, found a {}", self.name, got.tag());
        Error::BadCast {
            name: self.name.clone(),
            expected,
        }
    }
}
