//! Byte sizes and offsets for every data object.
//!
//! Runs in two stages. `compute` walks the whole container and settles
//! sizes, struct member offsets, parameter ordinals and automatic
//! offsets; it writes nothing, so a width that cannot be represented in
//! the chosen mode aborts the compilation before the output file has a
//! single byte in it. `declare` then writes one `struc` directive per
//! structure definition, each followed by an assembler-side check that
//! NASM agrees with the computed size.

use crate::codegen::x86::X86Mode;
use crate::{Error, Result};
use ir::{Handle, Kind, Object, Ppd, Width};
use std::io::Write;

/// Map a symbolic width onto machine bytes.
pub fn width_bytes(width: Width, mode: X86Mode, name: &str) -> Result<usize> {
    match width {
        Width::Byte => Ok(1),
        Width::Byte2 => Ok(2),
        Width::Byte4 => Ok(4),
        Width::Byte8 => match mode {
            X86Mode::Long => Ok(8),
            _ => Err(Error::InvalidWidth {
                name: name.into(),
                width,
                mode,
            }),
        },
        Width::Word | Width::Ptr | Width::Max => Ok(mode.ptr_bytes()),
    }
}

/// Size and offset every object in the container. Idempotent: a second
/// run finds every size already settled.
pub fn compute(prog: &mut Ppd, mode: X86Mode) -> Result<()> {
    for handle in prog.handles() {
        size_of(prog, handle, mode)?;
        if prog.get(handle).is_routine() {
            layout_routine(prog, handle, mode)?;
        }
    }
    Ok(())
}

/// Alignment demanded by a member of `size` bytes: natural alignment,
/// capped at the pointer size.
const fn alignment(size: usize, ptr: usize) -> usize {
    if size > ptr {
        ptr
    } else {
        size
    }
}

fn pad_to(offset: usize, align: usize) -> usize {
    match offset % align {
        0 => 0,
        rem => align - rem,
    }
}

/// What a size computation has to do next; splitting the decision from
/// the work keeps the container borrows short.
enum Plan {
    Prime(Width),
    Array,
    Def(Vec<Handle>),
    Inst(String),
    Routine,
}

fn size_of(prog: &mut Ppd, handle: Handle, mode: X86Mode) -> Result<usize> {
    if prog.get(handle).size() != 0 {
        return Ok(prog.get(handle).size());
    }
    let name = prog.get(handle).name().to_string();
    let plan = match prog.get(handle).kind() {
        Kind::Prime(p) => Plan::Prime(p.width().ok_or_else(|| Error::NoWidth(name.clone()))?),
        Kind::Array(_) => Plan::Array,
        Kind::StructDef(def) => Plan::Def(def.members().to_vec()),
        Kind::StructInst(inst) => Plan::Inst(inst.layout().to_string()),
        Kind::Routine(_) => Plan::Routine,
    };

    let bytes = match plan {
        Plan::Prime(width) => width_bytes(width, mode, &name)?,
        Plan::Array => {
            // The element is owned inline; borrow it out while the
            // container is needed for a possible struct lookup.
            let mut child = prog.get_mut(handle).as_array_mut()?.take_child();
            let child_size = size_of_inline(&mut child, prog, mode)?;
            let arr = prog.get_mut(handle).as_array_mut()?;
            let total = child_size * arr.count() as usize;
            arr.put_child(child);
            if let Some(init) = prog.get(handle).as_array()?.init() {
                if init.len() > total {
                    return Err(Error::OversizedInit(name));
                }
            }
            total
        }
        Plan::Def(members) => layout_members(prog, &members, mode, name)?,
        Plan::Inst(layout) => {
            let layout = prog.find(&layout)?;
            size_of(prog, layout, mode)?
        }
        Plan::Routine => return Ok(0),
    };
    prog.get_mut(handle).set_size(bytes);
    Ok(bytes)
}

/// Size an object that lives outside the container (an array element).
fn size_of_inline(obj: &mut Object, prog: &mut Ppd, mode: X86Mode) -> Result<usize> {
    if obj.size() != 0 {
        return Ok(obj.size());
    }
    let plan = match obj.kind() {
        Kind::Prime(p) => {
            Plan::Prime(p.width().ok_or_else(|| Error::NoWidth("array element".into()))?)
        }
        Kind::Array(_) => Plan::Array,
        Kind::StructInst(inst) => Plan::Inst(inst.layout().to_string()),
        Kind::StructDef(_) | Kind::Routine(_) => {
            return Err(Error::Ir(ir::Error::BadCast {
                name: "array element".into(),
                expected: "data object",
            }))
        }
    };
    let bytes = match plan {
        Plan::Prime(width) => width_bytes(width, mode, "array element")?,
        Plan::Array => {
            let mut child = obj.as_array_mut()?.take_child();
            let child_size = size_of_inline(&mut child, prog, mode)?;
            let arr = obj.as_array_mut()?;
            arr.put_child(child);
            child_size * arr.count() as usize
        }
        Plan::Inst(layout) => {
            let layout = prog.find(&layout)?;
            size_of(prog, layout, mode)?
        }
        Plan::Def(_) | Plan::Routine => unreachable!(),
    };
    obj.set_size(bytes);
    Ok(bytes)
}

/// Assign offsets to an ordered member list and return the total size.
fn layout_members(
    prog: &mut Ppd,
    members: &[Handle],
    mode: X86Mode,
    owner: String,
) -> Result<usize> {
    let ptr = mode.ptr_bytes();
    let mut offset = 0usize;
    for &member in members {
        let size = size_of(prog, member, mode)?;
        if size == 0 {
            prog.get_mut(member).set_offset(offset);
            continue;
        }
        let pad = pad_to(offset, alignment(size, ptr));
        if pad != 0 {
            log::warn!(
                "{owner}: {pad} byte(s) of padding before {}",
                prog.get(member).name()
            );
        }
        offset += pad;
        prog.get_mut(member).set_offset(offset);
        offset += size;
    }
    Ok(offset)
}

fn layout_routine(prog: &mut Ppd, handle: Handle, mode: X86Mode) -> Result<()> {
    let r = prog.get(handle).as_routine()?;
    let params: Vec<Handle> = r.params.clone();
    let autos: Vec<Handle> = r.autos.clone();

    // Parameters live in caller-pushed slots of one pointer width each;
    // the ordinal is all the emitter needs.
    for (ordinal, &param) in params.iter().enumerate() {
        size_of(prog, param, mode)?;
        prog.get_mut(param).set_offset(ordinal);
    }

    let auto_size = layout_members(prog, &autos, mode, prog.get(handle).name().to_string())?;
    prog.get_mut(handle).as_routine_mut()?.auto_size = auto_size;
    Ok(())
}

/// Write the structure layout directives.
pub fn declare(out: &mut dyn Write, prog: &Ppd, _mode: X86Mode) -> Result<()> {
    for (_, obj) in prog.iter() {
        let Kind::StructDef(def) = obj.kind() else {
            continue;
        };
        writeln!(out, "\nstruc {}", obj.name())?;
        let mut offset = 0usize;
        for &member in def.members() {
            let m = prog.get(member);
            if m.offset() > offset {
                writeln!(out, "\tresb {:#x}", m.offset() - offset)?;
            }
            writeln!(out, ".{}:\tresb {:#x}", short_name(m.name()), m.size())?;
            offset = m.offset() + m.size();
        }
        writeln!(out, "endstruc")?;
        // Let the assembler second the arithmetic.
        writeln!(out, "%if ({:#x} != {}_size)", obj.size(), obj.name())?;
        writeln!(out, "%error \"{} layout disagrees with the assembler\"", obj.name())?;
        writeln!(out, "%endif")?;
    }
    Ok(())
}

/// Struct members are registered under their full dotted name; the
/// struc directive wants the local part.
fn short_name(full: &str) -> &str {
    full.rsplit('.').next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{Array, Prime, StorageClass, StructDef, StructInst};

    fn prime_obj(name: &str, sclass: StorageClass, width: Width) -> Object {
        let mut p = Prime::new();
        p.set_width(width).unwrap();
        Object::new(name, sclass, Kind::Prime(p)).unwrap()
    }

    fn anon_prime(width: Width) -> Object {
        let mut p = Prime::new();
        p.set_width(width).unwrap();
        Object::anon(Kind::Prime(p))
    }

    /// struct S { a: byte; b: byte4; c: byte } in protected mode:
    /// a at 0, b at 4, c at 8, nine bytes total, no tail padding.
    #[test]
    fn struct_offsets_under_natural_alignment() {
        let mut prog = Ppd::new();
        let a = prog
            .add(prime_obj("S.a", StorageClass::Member, Width::Byte))
            .unwrap();
        let b = prog
            .add(prime_obj("S.b", StorageClass::Member, Width::Byte4))
            .unwrap();
        let c = prog
            .add(prime_obj("S.c", StorageClass::Member, Width::Byte))
            .unwrap();
        let mut def = StructDef::new();
        def.add_member(a);
        def.add_member(b);
        def.add_member(c);
        let s = prog
            .add(Object::new("S", StorageClass::Private, Kind::StructDef(def)).unwrap())
            .unwrap();

        compute(&mut prog, X86Mode::Protected).unwrap();
        assert_eq!(prog.get(a).offset(), 0);
        assert_eq!(prog.get(b).offset(), 4);
        assert_eq!(prog.get(c).offset(), 8);
        assert_eq!(prog.get(s).size(), 9);
    }

    #[test]
    fn wide_members_align_to_the_pointer() {
        let mut prog = Ppd::new();
        let a = prog
            .add(prime_obj("T.a", StorageClass::Member, Width::Byte))
            .unwrap();
        let big = Object::new(
            "T.big",
            StorageClass::Member,
            Kind::Array(Array::new(anon_prime(Width::Byte4), 4).unwrap()),
        )
        .unwrap();
        let big = prog.add(big).unwrap();
        let mut def = StructDef::new();
        def.add_member(a);
        def.add_member(big);
        let t = prog
            .add(Object::new("T", StorageClass::Private, Kind::StructDef(def)).unwrap())
            .unwrap();

        compute(&mut prog, X86Mode::Protected).unwrap();
        // sixteen bytes of array align to the four-byte pointer
        assert_eq!(prog.get(big).offset(), 4);
        assert_eq!(prog.get(t).size(), 20);
    }

    #[test]
    fn byte8_is_rejected_in_protected_mode() {
        let mut prog = Ppd::new();
        prog.add(prime_obj("x", StorageClass::Private, Width::Byte8))
            .unwrap();
        assert!(matches!(
            compute(&mut prog, X86Mode::Protected),
            Err(Error::InvalidWidth { .. })
        ));
        assert!(compute(&mut prog, X86Mode::Long).is_ok());
    }

    #[test]
    fn word_and_ptr_follow_the_mode() {
        let mut prog = Ppd::new();
        let w = prog
            .add(prime_obj("w", StorageClass::Private, Width::Word))
            .unwrap();
        compute(&mut prog, X86Mode::Long).unwrap();
        assert_eq!(prog.get(w).size(), 8);

        let mut prog = Ppd::new();
        let w = prog
            .add(prime_obj("w", StorageClass::Private, Width::Word))
            .unwrap();
        compute(&mut prog, X86Mode::Protected).unwrap();
        assert_eq!(prog.get(w).size(), 4);
    }

    #[test]
    fn arrays_multiply_their_element() {
        let mut prog = Ppd::new();
        let arr = Object::new(
            "arr",
            StorageClass::Private,
            Kind::Array(Array::new(anon_prime(Width::Byte4), 4).unwrap()),
        )
        .unwrap();
        let arr = prog.add(arr).unwrap();
        compute(&mut prog, X86Mode::Protected).unwrap();
        assert_eq!(prog.get(arr).size(), 16);
    }

    #[test]
    fn oversized_initialisers_are_rejected() {
        let mut prog = Ppd::new();
        let mut arr = Array::new(anon_prime(Width::Byte), 2).unwrap();
        arr.set_init(vec![1, 2, 3]);
        prog.add(Object::new("arr", StorageClass::Private, Kind::Array(arr)).unwrap())
            .unwrap();
        assert!(matches!(
            compute(&mut prog, X86Mode::Protected),
            Err(Error::OversizedInit(_))
        ));
    }

    #[test]
    fn instances_take_the_layout_size() {
        let mut prog = Ppd::new();
        let a = prog
            .add(prime_obj("S.a", StorageClass::Member, Width::Byte4))
            .unwrap();
        let mut def = StructDef::new();
        def.add_member(a);
        prog.add(Object::new("S", StorageClass::Private, Kind::StructDef(def)).unwrap())
            .unwrap();
        let inst = prog
            .add(
                Object::new(
                    "s0",
                    StorageClass::Private,
                    Kind::StructInst(StructInst::new("S")),
                )
                .unwrap(),
            )
            .unwrap();
        compute(&mut prog, X86Mode::Protected).unwrap();
        assert_eq!(prog.get(inst).size(), 4);
    }

    #[test]
    fn compute_twice_settles_identically() {
        let mut prog = Ppd::new();
        let a = prog
            .add(prime_obj("S.a", StorageClass::Member, Width::Byte))
            .unwrap();
        let b = prog
            .add(prime_obj("S.b", StorageClass::Member, Width::Byte4))
            .unwrap();
        let mut def = StructDef::new();
        def.add_member(a);
        def.add_member(b);
        let s = prog
            .add(Object::new("S", StorageClass::Private, Kind::StructDef(def)).unwrap())
            .unwrap();
        compute(&mut prog, X86Mode::Protected).unwrap();
        let first = (prog.get(a).offset(), prog.get(b).offset(), prog.get(s).size());
        compute(&mut prog, X86Mode::Protected).unwrap();
        let second = (prog.get(a).offset(), prog.get(b).offset(), prog.get(s).size());
        assert_eq!(first, second);
    }

    #[test]
    fn struc_directive_carries_the_sanity_check() {
        let mut prog = Ppd::new();
        let a = prog
            .add(prime_obj("S.a", StorageClass::Member, Width::Byte))
            .unwrap();
        let b = prog
            .add(prime_obj("S.b", StorageClass::Member, Width::Byte4))
            .unwrap();
        let mut def = StructDef::new();
        def.add_member(a);
        def.add_member(b);
        prog.add(Object::new("S", StorageClass::Private, Kind::StructDef(def)).unwrap())
            .unwrap();
        compute(&mut prog, X86Mode::Protected).unwrap();

        let mut out = Vec::new();
        declare(&mut out, &prog, X86Mode::Protected).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("struc S"));
        assert!(text.contains(".a:\tresb 0x1"));
        assert!(text.contains("\tresb 0x3"), "padding before the byte4 member");
        assert!(text.contains(".b:\tresb 0x4"));
        assert!(text.contains("endstruc"));
        assert!(text.contains("%if (0x8 != S_size)"));
        assert!(text.contains("%error"));
    }
}
