//! Lowers annotated quads to x86 assembler text.
//!
//! The selection scheme is greedy and block-local. Every result is
//! produced in the accumulator; temps are single-use, so when a result
//! is not consumed by the very next quad it is either stashed (temps)
//! or written back to its home (everything else). A register
//! descriptor remembers what each register holds so reloads can be
//! skipped, and everything memory-backed is flushed before control can
//! leave the block.

pub mod reg;

use crate::codegen::layout_pass::width_bytes;
use crate::codegen::x86::{CondCode, Reg, RegWidth, X86Mode};
use crate::{Error, Result};
use ir::{Handle, Kind, Op, Ppd, Quad, StorageClass};
use reg::{Content, RegDesc};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::mem;

/// Registers the emitter may park a stashed temp in. The accumulator,
/// counter, data and index registers are working registers and get
/// clobbered freely.
const CACHE_REGS_PROTECTED: &[Reg] = &[Reg::B];
const CACHE_REGS_LONG: &[Reg] = &[
    Reg::B,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Write the visibility directives, the data section and the code
/// section, in that order.
pub fn emit<W: Write>(out: &mut W, prog: &mut Ppd, mode: X86Mode) -> Result<()> {
    visibility(out, prog)?;
    data_section(out, prog, mode)?;
    code_section(out, prog, mode)
}

fn visibility<W: Write>(out: &mut W, prog: &Ppd) -> Result<()> {
    writeln!(out)?;
    for (_, obj) in prog.iter() {
        match obj.sclass() {
            StorageClass::Public => writeln!(out, "global {}", obj.name())?,
            StorageClass::Extern => writeln!(out, "extern {}", obj.name())?,
            _ => {}
        }
    }
    Ok(())
}

fn data_section<W: Write>(out: &mut W, prog: &Ppd, mode: X86Mode) -> Result<()> {
    writeln!(out, "\nsection .data")?;
    writeln!(out, "align {:#x}", mode.ptr_bytes())?;

    for (_, obj) in prog.iter() {
        if !obj.is_static_data() {
            continue;
        }
        match obj.kind() {
            Kind::Prime(p) => {
                let width = RegWidth::from_bytes(obj.size())
                    .ok_or_else(|| Error::Unsized(obj.name().into()))?;
                writeln!(out, "{}:\t{} {:#x}", obj.name(), width.directive(), p.value())?;
            }
            Kind::Array(a) => match a.init() {
                Some(bytes) => {
                    write!(out, "{}:\tdb ", obj.name())?;
                    for (i, byte) in bytes.iter().enumerate() {
                        if i != 0 {
                            write!(out, ", ")?;
                        }
                        if byte.is_ascii_graphic() && *byte != b'\'' {
                            write!(out, "'{}'", *byte as char)?;
                        } else {
                            write!(out, "{byte:#x}")?;
                        }
                    }
                    writeln!(out)?;
                    if bytes.len() < obj.size() {
                        writeln!(out, "\tresb {:#x}", obj.size() - bytes.len())?;
                    }
                }
                None => writeln!(out, "{}:\tresb {:#x}", obj.name(), obj.size())?,
            },
            Kind::StructInst(_) => {
                writeln!(out, "{}:\tresb {:#x}", obj.name(), obj.size())?;
            }
            Kind::StructDef(_) | Kind::Routine(_) => {}
        }
    }
    Ok(())
}

fn code_section<W: Write>(out: &mut W, prog: &mut Ppd, mode: X86Mode) -> Result<()> {
    writeln!(out, "\nsection .code")?;
    writeln!(out, "align {:#x}", mode.ptr_bytes())?;

    let routines: Vec<Handle> = prog
        .iter()
        .filter(|(_, o)| o.is_routine())
        .map(|(h, _)| h)
        .collect();
    for routine in routines {
        Emitter::new(out, prog, mode).routine(routine)?;
    }
    Ok(())
}

/// A resolved source operand, ready to be printed.
enum Operand {
    Reg(Reg, RegWidth),
    Imm(u64),
    Mem(String, RegWidth),
}

impl Operand {
    /// Rendered with an explicit size keyword, for positions where no
    /// register fixes the operation width.
    fn sized(&self) -> String {
        match self {
            Self::Mem(text, width) => format!("{} {text}", width.keyword()),
            _ => format!("{self}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Reg(r, w) => f.write_str(r.name(*w)),
            Self::Imm(v) => write!(f, "{v:#x}"),
            Self::Mem(text, _) => f.write_str(text),
        }
    }
}

/// Per-routine emission state. Cleared for every routine; the register
/// descriptor additionally resets at block boundaries.
struct Emitter<'a, W: Write> {
    out: &'a mut W,
    prog: &'a mut Ppd,
    mode: X86Mode,
    rd: RegDesc,
    /// Registers holding a result that memory has not seen yet.
    dirty: [bool; Reg::COUNT],
    routine_name: String,
    frame: usize,
    param_bytes: usize,
    /// Offset of the spill region within the frame.
    temp_base: usize,
    /// Spill slots currently holding a stashed temp.
    spilled: HashMap<Handle, usize>,
    free_slots: Vec<usize>,
    next_slot: usize,
}

impl<'a, W: Write> Emitter<'a, W> {
    fn new(out: &'a mut W, prog: &'a mut Ppd, mode: X86Mode) -> Self {
        Self {
            out,
            prog,
            mode,
            rd: RegDesc::new(),
            dirty: [false; Reg::COUNT],
            routine_name: String::new(),
            frame: 0,
            param_bytes: 0,
            temp_base: 0,
            spilled: HashMap::new(),
            free_slots: Vec::new(),
            next_slot: 0,
        }
    }

    fn routine(mut self, handle: Handle) -> Result<()> {
        let ptr = self.mode.ptr_bytes();
        self.routine_name = self.prog.get(handle).name().to_string();
        log::trace!("emitting routine {}", self.routine_name);

        let r = self.prog.get_mut(handle).as_routine_mut()?;
        self.param_bytes = r.params.len() * ptr;
        self.temp_base = r.auto_size.next_multiple_of(ptr);
        self.frame = self.temp_base + r.concurrent_temps * ptr;
        let blocks = mem::take(&mut r.blocks);

        self.rd.clear_all();
        writeln!(self.out, "\n{}:", self.routine_name)?;
        writeln!(self.out, "\tenter {:#x}, 0x0", self.frame)?;

        for block in &blocks {
            self.block(block)?;
        }

        // In case control can fall off the end without an explicit
        // return.
        if !blocks
            .last()
            .and_then(|b| b.last())
            .is_some_and(|q| q.op == Op::Rtrn)
        {
            self.epilogue()?;
        }

        self.prog.get_mut(handle).as_routine_mut()?.blocks = blocks;
        Ok(())
    }

    fn block(&mut self, block: &ir::Block) -> Result<()> {
        if block.is_empty() {
            return Err(Error::EmptyBlock(self.routine_name.clone()));
        }
        for quad in block.iter() {
            self.inst(quad)?;
        }
        // Values must be back in memory before control can leave.
        if !block.last().is_some_and(|q| q.op.is_terminator()) {
            self.flush()?;
        }
        // Spill slots stay: a call result may be read in the next block.
        self.rd.clear_all();
        self.dirty = [false; Reg::COUNT];
        Ok(())
    }

    fn inst(&mut self, quad: &Quad) -> Result<()> {
        match quad.op {
            Op::Nop | Op::Proc => Ok(()),

            Op::Lbl => {
                let name = self.prog.get(self.left(quad)?).name().to_string();
                writeln!(self.out, "{name}:")?;
                Ok(())
            }
            Op::Jmp => {
                self.flush()?;
                let target = self.prog.get(self.left(quad)?).name().to_string();
                writeln!(self.out, "\tjmp {target}")?;
                Ok(())
            }
            Op::Jz => self.jz(quad),
            Op::Loop => self.loop_back(quad),
            Op::Call => self.call(quad),
            Op::Rtrn => {
                self.flush()?;
                if let Some(value) = quad.left {
                    self.load(Reg::A, value)?;
                }
                self.epilogue()
            }
            Op::Parm => self.parm(quad),

            Op::Ass => self.ass(quad),
            Op::Cpy => self.ass(quad),
            Op::Inc => self.unary(quad, "inc"),
            Op::Dec => self.unary(quad, "dec"),
            Op::Neg => self.unary(quad, "neg"),
            Op::Not => self.unary(quad, "not"),
            Op::Inv => self.inv(quad),
            Op::Sz => self.sz(quad),
            Op::Ref => self.reference(quad),
            Op::Dref => self.dref(quad),

            Op::Add => self.binary(quad, "add"),
            Op::Sub => self.binary(quad, "sub"),
            Op::Band | Op::And => self.binary(quad, "and"),
            Op::Bor | Op::Or => self.binary(quad, "or"),
            Op::Xor => self.binary(quad, "xor"),
            Op::Lsh | Op::Rsh | Op::Rol | Op::Ror => self.shift(quad),
            Op::Mul => self.mul(quad),
            Op::Div => self.division(quad, false),
            Op::Mod => self.division(quad, true),

            Op::Eq | Op::Neq | Op::Lt | Op::Gt | Op::Lte | Op::Gte => self.relational(quad),
        }
    }

    /**************************** OPERANDS ****************************/

    fn left(&self, quad: &Quad) -> Result<Handle> {
        quad.left.ok_or(Error::UnknownOpcode {
            pass: "emitter",
            op: quad.op,
        })
    }

    fn result(&self, quad: &Quad) -> Result<Handle> {
        quad.result.ok_or(Error::UnknownOpcode {
            pass: "emitter",
            op: quad.op,
        })
    }

    fn right(&self, quad: &Quad) -> Result<Handle> {
        quad.right.ok_or(Error::UnknownOpcode {
            pass: "emitter",
            op: quad.op,
        })
    }

    /// Machine width of a prime operand.
    fn width_of(&self, h: Handle) -> Result<RegWidth> {
        let obj = self.prog.get(h);
        let width = obj
            .as_prime()?
            .width()
            .ok_or_else(|| Error::NoWidth(obj.name().into()))?;
        let bytes = width_bytes(width, self.mode, obj.name())?;
        RegWidth::from_bytes(bytes).ok_or_else(|| Error::Unsized(obj.name().into()))
    }

    fn is_signed(&self, h: Handle) -> bool {
        self.prog
            .get(h)
            .as_prime()
            .map(|p| p.is_signed())
            .unwrap_or(false)
    }

    /// The effective-address expression of an object's home, without
    /// the brackets.
    fn addr_expr(&self, h: Handle) -> Result<String> {
        let obj = self.prog.get(h);
        let bp = Reg::Bp.name(self.mode.reg_width());
        let ptr = self.mode.ptr_bytes();
        match obj.sclass() {
            StorageClass::Private | StorageClass::Public | StorageClass::Extern => {
                Ok(obj.name().into())
            }
            StorageClass::Stack => Ok(format!("{bp}-{:#x}+{:#x}", self.frame, obj.offset())),
            StorageClass::Param => Ok(format!(
                "{bp}+{:#x}+{:#x}*{ptr:#x}",
                2 * ptr,
                obj.offset()
            )),
            StorageClass::Temp => {
                let slot = self.spilled.get(&h).ok_or_else(|| {
                    Error::Internal(format!("temp {} has no register and no slot", obj.name()))
                })?;
                Ok(format!(
                    "{bp}-{:#x}+{:#x}",
                    self.frame,
                    self.temp_base + slot * ptr
                ))
            }
            StorageClass::Member | StorageClass::Const => Err(Error::Ir(ir::Error::BadCast {
                name: obj.name().into(),
                expected: "addressable object",
            })),
        }
    }

    fn home(&self, h: Handle) -> Result<String> {
        Ok(format!("[{}]", self.addr_expr(h)?))
    }

    /// Resolve a source operand: a cached value, a cached reference, an
    /// immediate, or the operand's home in memory.
    fn value_operand(&mut self, h: Handle) -> Result<Operand> {
        let width = self.width_of(h)?;
        if let Some(r) = self.rd.find_val(h) {
            return Ok(Operand::Reg(r, width));
        }
        if let Some(r) = self.rd.find_ref(h) {
            return Ok(Operand::Mem(
                format!("[{}]", r.name(self.mode.reg_width())),
                width,
            ));
        }
        if self.prog.get(h).sclass() == StorageClass::Const {
            return Ok(Operand::Imm(self.prog.get(h).as_prime()?.value()));
        }
        if self.prog.get(h).sclass() == StorageClass::Member {
            // A member stands for its offset within the parent.
            return Ok(Operand::Imm(self.prog.get(h).offset() as u64));
        }
        if self.prog.get(h).sclass() == StorageClass::Temp {
            // Read straight from the spill slot; the single use frees it.
            let text = self.home(h)?;
            if let Some(slot) = self.spilled.remove(&h) {
                self.free_slots.push(slot);
            }
            return Ok(Operand::Mem(text, width));
        }
        Ok(Operand::Mem(self.home(h)?, width))
    }

    /************************* LOAD / STASH / STORE *******************/

    /// Make `reg` hold `src` as a value.
    fn load(&mut self, reg: Reg, src: Handle) -> Result<()> {
        if self.rd.find_val(src) == Some(reg) {
            return Ok(());
        }
        if let Some(other) = self.rd.find_val(src) {
            let w = self.mode.reg_width();
            writeln!(self.out, "\txchg {}, {}", reg.name(w), other.name(w))?;
            self.rd.xchg(reg, other);
            self.dirty.swap(reg.idx(), other.idx());
            return Ok(());
        }

        self.stash(reg)?;
        let width = self.width_of(src)?;
        match self.prog.get(src).sclass() {
            StorageClass::Const => {
                let value = self.prog.get(src).as_prime()?.value();
                writeln!(self.out, "\tmov {}, {value:#x}", reg.name(width))?;
            }
            StorageClass::Temp => {
                let home = self.home(src)?;
                writeln!(self.out, "\tmov {}, {home}", reg.name(width))?;
                // The slot is free again: temps are read exactly once.
                if let Some(slot) = self.spilled.remove(&src) {
                    self.free_slots.push(slot);
                }
            }
            _ => {
                if let Some(r) = self.rd.find_ref(src) {
                    writeln!(
                        self.out,
                        "\tmov {}, [{}]",
                        reg.name(width),
                        r.name(self.mode.reg_width())
                    )?;
                } else {
                    let home = self.home(src)?;
                    writeln!(self.out, "\tmov {}, {home}", reg.name(width))?;
                }
            }
        }
        self.rd.set_val(reg, src);
        self.dirty[reg.idx()] = false;
        Ok(())
    }

    /// Get the current occupant of `reg` out of harm's way. Only a temp
    /// needs rescuing; anything else either lives in memory already or
    /// is a reference that can be recomputed.
    fn stash(&mut self, reg: Reg) -> Result<()> {
        let Some((h, content)) = self.rd.occupant(reg) else {
            return Ok(());
        };
        if content == Content::Ref || self.prog.get(h).sclass() != StorageClass::Temp {
            self.rd.clear(reg);
            self.dirty[reg.idx()] = false;
            return Ok(());
        }
        if let Some(free) = self.free_cache_reg() {
            let w = self.mode.reg_width();
            writeln!(self.out, "\tmov {}, {}", free.name(w), reg.name(w))?;
            self.rd.set_val(free, h);
            self.dirty[free.idx()] = self.dirty[reg.idx()];
        } else {
            self.spill_to_slot(reg, h)?;
        }
        self.rd.clear(reg);
        self.dirty[reg.idx()] = false;
        Ok(())
    }

    fn spill_to_slot(&mut self, reg: Reg, temp: Handle) -> Result<()> {
        let slot = self.free_slots.pop().unwrap_or_else(|| {
            let s = self.next_slot;
            self.next_slot += 1;
            s
        });
        self.spilled.insert(temp, slot);
        let width = self.width_of(temp)?;
        let home = self.home(temp)?;
        writeln!(self.out, "\tmov {home}, {}", reg.name(width))?;
        Ok(())
    }

    fn free_cache_reg(&self) -> Option<Reg> {
        let candidates = match self.mode {
            X86Mode::Long => CACHE_REGS_LONG,
            _ => CACHE_REGS_PROTECTED,
        };
        candidates.iter().copied().find(|r| self.rd.is_empty(*r))
    }

    /// Write a register's value back to its home, if it has one and
    /// memory is stale. The descriptor is left alone.
    fn store(&mut self, reg: Reg) -> Result<()> {
        let Some((h, Content::Val)) = self.rd.occupant(reg) else {
            return Ok(());
        };
        if !self.dirty[reg.idx()] || !self.prog.get(h).sclass().is_memory_backed() {
            return Ok(());
        }
        let width = self.width_of(h)?;
        let home = self.home(h)?;
        writeln!(self.out, "\tmov {home}, {}", reg.name(width))?;
        self.dirty[reg.idx()] = false;
        Ok(())
    }

    /// Put every live value somewhere that survives the block: homes
    /// for memory-backed objects, spill slots for loose temps.
    fn flush(&mut self) -> Result<()> {
        for reg in Reg::ALL {
            let Some((h, Content::Val)) = self.rd.occupant(reg) else {
                continue;
            };
            if self.prog.get(h).sclass() == StorageClass::Temp {
                if !self.spilled.contains_key(&h) {
                    self.spill_to_slot(reg, h)?;
                }
                self.rd.clear(reg);
                self.dirty[reg.idx()] = false;
            } else {
                self.store(reg)?;
            }
        }
        Ok(())
    }

    /// The common tail of every result-producing quad: the value sits
    /// in `reg`. When nothing reads it next, temps are stashed and
    /// everything else goes home.
    fn finish_result(&mut self, quad: &Quad, reg: Reg) -> Result<()> {
        let result = self.result(quad)?;
        self.rd.set_val(reg, result);
        self.dirty[reg.idx()] = true;
        if quad.used_next {
            return Ok(());
        }
        if self.prog.get(result).sclass() == StorageClass::Temp {
            self.stash(reg)?;
        } else {
            self.store(reg)?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<()> {
        writeln!(self.out, "\tleave")?;
        writeln!(self.out, "\tret {:#x}", self.param_bytes)?;
        Ok(())
    }

    /*************************** INSTRUCTIONS *************************/
    // Alphabetical, flow control last.

    /// Copy a value into a new home. Primes move through the
    /// accumulator; aggregates are copied bytewise.
    fn ass(&mut self, quad: &Quad) -> Result<()> {
        let dest = self.result(quad)?;
        let src = self.left(quad)?;

        let dest_is_prime = matches!(self.prog.get(dest).kind(), Kind::Prime(_));
        let src_is_prime = matches!(self.prog.get(src).kind(), Kind::Prime(_));
        if dest_is_prime && src_is_prime {
            let (ds, ss) = (self.prog.get(dest).size(), self.prog.get(src).size());
            if ds != ss {
                log::warn!(
                    "{}: assigning {ss} byte(s) of {} into {ds}",
                    self.routine_name,
                    self.prog.get(src).name()
                );
            }
            if self.is_signed(dest) != self.is_signed(src) {
                log::warn!(
                    "{}: assignment of {} changes signedness",
                    self.routine_name,
                    self.prog.get(src).name()
                );
            }
            self.load(Reg::A, src)?;
            return self.finish_result(quad, Reg::A);
        }
        self.block_copy(dest, src)
    }

    /// Bytewise aggregate copy. Short blocks are unrolled through the
    /// accumulator; longer ones use the string-move primitive.
    fn block_copy(&mut self, dest: Handle, src: Handle) -> Result<()> {
        let size = self.prog.get(dest).size();
        if size == 0 {
            return Err(Error::Unsized(self.prog.get(dest).name().into()));
        }
        if self.prog.get(src).size() != size {
            log::warn!(
                "{}: copying between {} and {} of different sizes",
                self.routine_name,
                self.prog.get(src).name(),
                self.prog.get(dest).name()
            );
        }
        let ptr = self.mode.ptr_bytes();
        let w = self.mode.reg_width();

        self.stash(Reg::Si)?;
        self.stash(Reg::Di)?;
        let src_addr = self.addr_expr(src)?;
        let dest_addr = self.addr_expr(dest)?;
        writeln!(self.out, "\tlea {}, [{src_addr}]", Reg::Si.name(w))?;
        writeln!(self.out, "\tlea {}, [{dest_addr}]", Reg::Di.name(w))?;
        self.rd.set_ref(Reg::Si, src);
        self.rd.set_ref(Reg::Di, dest);

        if size <= 2 * ptr {
            self.stash(Reg::A)?;
            let mut done = 0usize;
            while done < size {
                let chunk = RegWidth::from_bytes((size - done).min(ptr))
                    .unwrap_or(RegWidth::Byte);
                let a = Reg::A.name(chunk);
                writeln!(self.out, "\tmov {a}, [{}+{done:#x}]", Reg::Si.name(w))?;
                writeln!(self.out, "\tmov [{}+{done:#x}], {a}", Reg::Di.name(w))?;
                done += chunk.bytes();
            }
            self.rd.clear(Reg::A);
        } else {
            self.stash(Reg::C)?;
            writeln!(self.out, "\tmov {}, {size:#x}", Reg::C.name(w))?;
            writeln!(self.out, "\tcld")?;
            writeln!(self.out, "\trep movsb")?;
            // The string move walked all three registers off the data.
            self.rd.clear(Reg::Si);
            self.rd.clear(Reg::Di);
            self.rd.clear(Reg::C);
        }
        Ok(())
    }

    /// The shared pattern for two-operand arithmetic and logic: left
    /// into the accumulator, right resolved in place, result recorded
    /// as the accumulator.
    fn binary(&mut self, quad: &Quad, mnemonic: &str) -> Result<()> {
        let left = self.left(quad)?;
        self.load(Reg::A, left)?;
        let rhs = self.value_operand(self.right(quad)?)?;
        let w = self.width_of(left)?;
        writeln!(self.out, "\t{mnemonic} {}, {rhs}", Reg::A.name(w))?;
        self.finish_result(quad, Reg::A)
    }

    fn division(&mut self, quad: &Quad, want_remainder: bool) -> Result<()> {
        let left = self.left(quad)?;
        let right = self.right(quad)?;
        let signed = self.is_signed(left) || self.is_signed(right);

        self.stash(Reg::D)?;
        self.load(Reg::A, left)?;
        let w = self.width_of(left)?;

        // An immediate divisor has to take the counter register first.
        let divisor = match self.value_operand(right)? {
            Operand::Imm(_) => {
                self.load(Reg::C, right)?;
                Operand::Reg(Reg::C, w)
            }
            other => other,
        };

        if signed {
            writeln!(
                self.out,
                "\t{}",
                match w {
                    RegWidth::Byte => "cbw",
                    RegWidth::Word => "cwd",
                    RegWidth::Dword => "cdq",
                    RegWidth::Qword => "cqo",
                }
            )?;
            writeln!(self.out, "\tidiv {}", divisor.sized())?;
        } else {
            match w {
                RegWidth::Byte => writeln!(self.out, "\txor ah, ah")?,
                _ => writeln!(self.out, "\txor {d}, {d}", d = Reg::D.name(w))?,
            }
            writeln!(self.out, "\tdiv {}", divisor.sized())?;
        }

        if want_remainder {
            match w {
                RegWidth::Byte => writeln!(self.out, "\tmov al, ah")?,
                _ => writeln!(self.out, "\tmov {}, {}", Reg::A.name(w), Reg::D.name(w))?,
            }
        }
        self.rd.clear(Reg::D);
        self.rd.clear(Reg::A);
        self.finish_result(quad, Reg::A)
    }

    /// Dereference: the pointer comes into the accumulator and is
    /// replaced by what it points at.
    fn dref(&mut self, quad: &Quad) -> Result<()> {
        let pointer = self.left(quad)?;
        self.load(Reg::A, pointer)?;
        let rw = self.width_of(self.result(quad)?)?;
        writeln!(
            self.out,
            "\tmov {}, [{}]",
            Reg::A.name(rw),
            Reg::A.name(self.mode.reg_width())
        )?;
        self.rd.clear(Reg::A);
        self.finish_result(quad, Reg::A)
    }

    /// Logical not: 1 exactly when the operand is zero.
    fn inv(&mut self, quad: &Quad) -> Result<()> {
        let left = self.left(quad)?;
        self.load(Reg::A, left)?;
        let w = self.width_of(left)?;
        let a = Reg::A.name(w);
        writeln!(self.out, "\tcmp {a}, 0x0")?;
        writeln!(self.out, "\tmov {a}, 0x0")?;
        writeln!(self.out, "\tsete {}", Reg::A.name(RegWidth::Byte))?;
        self.rd.clear(Reg::A);
        self.finish_result(quad, Reg::A)
    }

    fn mul(&mut self, quad: &Quad) -> Result<()> {
        let left = self.left(quad)?;
        let right = self.right(quad)?;
        let signed = self.is_signed(left) || self.is_signed(right);

        // The widening multiply writes the data register too.
        self.stash(Reg::D)?;
        self.load(Reg::A, left)?;
        let w = self.width_of(left)?;
        let rhs = match self.value_operand(right)? {
            Operand::Imm(_) => {
                self.load(Reg::C, right)?;
                Operand::Reg(Reg::C, w)
            }
            other => other,
        };
        // The overflow flag is the machine's report; nothing checks it.
        writeln!(
            self.out,
            "\t{} {}",
            if signed { "imul" } else { "mul" },
            rhs.sized()
        )?;
        self.rd.clear(Reg::D);
        self.rd.clear(Reg::A);
        self.finish_result(quad, Reg::A)
    }

    /// Address of an object, optionally displaced by a member or scaled
    /// by an array index. Lands in the source-index register.
    fn reference(&mut self, quad: &Quad) -> Result<()> {
        let obj = self.left(quad)?;
        let w = self.mode.reg_width();

        // A register already holding the object's address beats
        // recomputing it.
        let cached = self.rd.find_ref(obj);
        self.stash(Reg::Si)?;
        let base = match cached {
            Some(r) if r != Reg::Si => r.name(w).to_string(),
            _ => self.addr_expr(obj)?,
        };

        match quad.right {
            None => {
                writeln!(self.out, "\tlea {}, [{base}]", Reg::Si.name(w))?;
            }
            Some(idx) if self.prog.get(idx).sclass() == StorageClass::Member => {
                let off = self.prog.get(idx).offset();
                writeln!(self.out, "\tlea {}, [{base}+{off:#x}]", Reg::Si.name(w))?;
            }
            Some(idx) => {
                let elem = self.prog.get(obj).as_array()?.child().size();
                if elem == 0 {
                    return Err(Error::Unsized(self.prog.get(obj).name().into()));
                }
                if self.prog.get(idx).sclass() == StorageClass::Const {
                    let disp = self.prog.get(idx).as_prime()?.value() as usize * elem;
                    writeln!(self.out, "\tlea {}, [{base}+{disp:#x}]", Reg::Si.name(w))?;
                } else {
                    let idx_reg = match self.rd.find_val(idx) {
                        Some(r) if r != Reg::Si => r,
                        _ => {
                            self.load(Reg::C, idx)?;
                            Reg::C
                        }
                    };
                    if matches!(elem, 1 | 2 | 4 | 8) {
                        writeln!(
                            self.out,
                            "\tlea {}, [{base}+{}*{elem:#x}]",
                            Reg::Si.name(w),
                            idx_reg.name(w)
                        )?;
                    } else {
                        // No address scale for this element size; do
                        // the multiply first.
                        self.load(Reg::C, idx)?;
                        writeln!(
                            self.out,
                            "\timul {c}, {c}, {elem:#x}",
                            c = Reg::C.name(w)
                        )?;
                        self.rd.clear(Reg::C);
                        writeln!(
                            self.out,
                            "\tlea {}, [{base}+{}]",
                            Reg::Si.name(w),
                            Reg::C.name(w)
                        )?;
                    }
                }
            }
        }
        self.finish_result(quad, Reg::Si)
    }

    fn relational(&mut self, quad: &Quad) -> Result<()> {
        let left = self.left(quad)?;
        let right = self.right(quad)?;
        let signed = self.is_signed(left) || self.is_signed(right);
        let cc = match (quad.op, signed) {
            (Op::Eq, _) => CondCode::E,
            (Op::Neq, _) => CondCode::Ne,
            (Op::Lt, true) => CondCode::L,
            (Op::Lt, false) => CondCode::B,
            (Op::Lte, true) => CondCode::Le,
            (Op::Lte, false) => CondCode::Be,
            (Op::Gt, true) => CondCode::G,
            (Op::Gt, false) => CondCode::A,
            (Op::Gte, true) => CondCode::Ge,
            (Op::Gte, false) => CondCode::Ae,
            (op, _) => {
                return Err(Error::UnknownOpcode {
                    pass: "emitter",
                    op,
                })
            }
        };

        self.load(Reg::A, left)?;
        let rhs = self.value_operand(right)?;
        let w = self.width_of(left)?;
        writeln!(self.out, "\tcmp {}, {rhs}", Reg::A.name(w))?;

        let rw = self.width_of(self.result(quad)?)?;
        writeln!(self.out, "\tmov {}, 0x0", Reg::A.name(rw))?;
        writeln!(self.out, "\tset{cc} {}", Reg::A.name(RegWidth::Byte))?;
        self.rd.clear(Reg::A);
        self.finish_result(quad, Reg::A)
    }

    fn shift(&mut self, quad: &Quad) -> Result<()> {
        let left = self.left(quad)?;
        let right = self.right(quad)?;
        let mnemonic = match quad.op {
            Op::Lsh => "shl",
            Op::Rsh => {
                if self.is_signed(left) {
                    "sar"
                } else {
                    "shr"
                }
            }
            Op::Rol => "rol",
            Op::Ror => "ror",
            op => {
                return Err(Error::UnknownOpcode {
                    pass: "emitter",
                    op,
                })
            }
        };

        self.load(Reg::A, left)?;
        let w = self.width_of(left)?;
        if self.prog.get(right).sclass() == StorageClass::Const {
            let count = self.prog.get(right).as_prime()?.value();
            writeln!(self.out, "\t{mnemonic} {}, {count:#x}", Reg::A.name(w))?;
        } else {
            self.load(Reg::C, right)?;
            writeln!(
                self.out,
                "\t{mnemonic} {}, {}",
                Reg::A.name(w),
                Reg::C.name(RegWidth::Byte)
            )?;
        }
        self.finish_result(quad, Reg::A)
    }

    /// Compile-time size of an object, zero-extended into the
    /// accumulator.
    fn sz(&mut self, quad: &Quad) -> Result<()> {
        let obj = self.left(quad)?;
        let size = self.prog.get(obj).size();
        if size == 0 {
            return Err(Error::Unsized(self.prog.get(obj).name().into()));
        }
        self.stash(Reg::A)?;
        writeln!(
            self.out,
            "\tmov {}, {size:#x}",
            Reg::A.name(self.mode.reg_width())
        )?;
        self.finish_result(quad, Reg::A)
    }

    /// The unaries that operate on the accumulator in place.
    fn unary(&mut self, quad: &Quad, mnemonic: &str) -> Result<()> {
        let left = self.left(quad)?;
        self.load(Reg::A, left)?;
        let w = self.width_of(left)?;
        writeln!(self.out, "\t{mnemonic} {}", Reg::A.name(w))?;
        self.finish_result(quad, Reg::A)
    }

    /***************************** FLOW *******************************/

    fn call(&mut self, quad: &Quad) -> Result<()> {
        // Parameters were pushed by the preceding parm quads.
        self.flush()?;
        let target = self.prog.get(self.left(quad)?).name().to_string();
        writeln!(self.out, "\tcall {target}")?;
        // The callee answers in the accumulator and promises nothing
        // about the rest.
        self.rd.clear_all();
        self.dirty = [false; Reg::COUNT];
        if let Some(result) = quad.result {
            self.rd.set_val(Reg::A, result);
            self.dirty[Reg::A.idx()] = true;
            // The call closes this block, so the result cannot ride a
            // register into the next one.
            if self.prog.get(result).sclass() == StorageClass::Temp {
                self.spill_to_slot(Reg::A, result)?;
                self.rd.clear(Reg::A);
                self.dirty[Reg::A.idx()] = false;
            } else {
                self.store(Reg::A)?;
            }
        }
        Ok(())
    }

    /// The machine loop: the count comes into the counter register,
    /// which the instruction decrements and tests.
    fn loop_back(&mut self, quad: &Quad) -> Result<()> {
        self.flush()?;
        let count = self.left(quad)?;
        let target = self.prog.get(self.right(quad)?).name().to_string();
        self.load(Reg::C, count)?;
        writeln!(self.out, "\tloop {target}")?;
        Ok(())
    }

    fn jz(&mut self, quad: &Quad) -> Result<()> {
        self.flush()?;
        let condition = self.left(quad)?;
        let target = self.prog.get(self.right(quad)?).name().to_string();

        match self.value_operand(condition)? {
            Operand::Reg(r, w) => {
                writeln!(self.out, "\ttest {r}, {r}", r = r.name(w))?;
            }
            Operand::Imm(_) => {
                self.load(Reg::A, condition)?;
                let w = self.width_of(condition)?;
                writeln!(self.out, "\ttest {a}, {a}", a = Reg::A.name(w))?;
            }
            operand @ Operand::Mem(..) => {
                writeln!(self.out, "\tcmp {}, 0x0", operand.sized())?;
            }
        }
        writeln!(self.out, "\tjz {target}")?;
        Ok(())
    }

    fn parm(&mut self, quad: &Quad) -> Result<()> {
        let value = self.left(quad)?;
        let w = self.mode.reg_width();
        match self.value_operand(value)? {
            Operand::Imm(v) => writeln!(self.out, "\tpush {v:#x}")?,
            Operand::Reg(r, _) => writeln!(self.out, "\tpush {}", r.name(w))?,
            Operand::Mem(..) => {
                self.load(Reg::A, value)?;
                writeln!(self.out, "\tpush {}", Reg::A.name(w))?;
            }
        }
        Ok(())
    }
}
