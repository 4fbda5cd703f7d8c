//! End-to-end runs of the whole back end: container in, assembler out.

use mplc::codegen::{self, X86Mode};
use mplc::Error;
use ir::{Array, Kind, Object, Op, Ppd, Prime, Quad, Routine, StorageClass, StructDef, Width};

fn prime(prog: &mut Ppd, name: &str, sclass: StorageClass, width: Width, value: u64) -> ir::Handle {
    let mut p = Prime::new();
    p.set_width(width).unwrap();
    p.set_value(value);
    prog.add(Object::new(name, sclass, Kind::Prime(p)).unwrap())
        .unwrap()
}

fn label(prog: &mut Ppd, name: &str) -> ir::Handle {
    prog.add(Object::new(name, StorageClass::Private, Kind::Prime(Prime::new())).unwrap())
        .unwrap()
}

fn routine(prog: &mut Ppd, name: &str, code: Vec<Quad>) -> ir::Handle {
    let mut r = Routine::new();
    r.code = code;
    prog.add(Object::new(name, StorageClass::Public, Kind::Routine(r)).unwrap())
        .unwrap()
}

fn generate(prog: &mut Ppd, mode: X86Mode) -> String {
    let mut out = Vec::new();
    codegen::x86(&mut out, prog, mode).unwrap();
    String::from_utf8(out).unwrap()
}

/// A module with a struct, static data and a counting loop, compiled
/// for protected mode.
#[test]
fn counting_loop_module() {
    let mut prog = Ppd::new();

    // struct S { a: byte; b: byte4; c: byte }
    let ma = prime(&mut prog, "S.a", StorageClass::Member, Width::Byte, 0);
    let mb = prime(&mut prog, "S.b", StorageClass::Member, Width::Byte4, 0);
    let mc = prime(&mut prog, "S.c", StorageClass::Member, Width::Byte, 0);
    let mut def = StructDef::new();
    def.add_member(ma);
    def.add_member(mb);
    def.add_member(mc);
    prog.add(Object::new("S", StorageClass::Private, Kind::StructDef(def)).unwrap())
        .unwrap();
    let s0 = prog
        .add(
            Object::new(
                "s0",
                StorageClass::Private,
                Kind::StructInst(ir::StructInst::new("S")),
            )
            .unwrap(),
        )
        .unwrap();

    // msg: db 'h', 'i', 0x0
    let mut elem = Prime::new();
    elem.set_width(Width::Byte).unwrap();
    let mut msg = Array::new(Object::anon(Kind::Prime(elem)), 3).unwrap();
    msg.set_init(b"hi\0".to_vec());
    prog.add(Object::new("msg", StorageClass::Public, Kind::Array(msg)).unwrap())
        .unwrap();

    let counter = prime(&mut prog, "counter", StorageClass::Private, Width::Byte4, 5);
    let zero = prime(&mut prog, "zero", StorageClass::Const, Width::Byte4, 0);
    let sval = prime(&mut prog, "sval", StorageClass::Private, Width::Word, 0);
    let tsz = prime(&mut prog, "tsz", StorageClass::Temp, Width::Word, 0);
    let t1 = prime(&mut prog, "t1", StorageClass::Temp, Width::Byte4, 0);
    let top = label(&mut prog, "top");
    let done = label(&mut prog, "done");

    routine(
        &mut prog,
        "main",
        vec![
            Quad::unary(Op::Sz, tsz, s0),
            Quad::unary(Op::Ass, sval, tsz),
            Quad::src(Op::Lbl, top),
            Quad::binary(Op::Eq, t1, counter, zero),
            Quad::new(Op::Jz, None, Some(t1), Some(done)),
            Quad::unary(Op::Dec, counter, counter),
            Quad::src(Op::Jmp, top),
            Quad::src(Op::Lbl, done),
            Quad::src(Op::Rtrn, counter),
        ],
    );

    let text = generate(&mut prog, X86Mode::Protected);

    // Section order: layout directives, visibility, data, code, trailer.
    let struc = text.find("struc S").unwrap();
    let vis = text.find("global msg").unwrap();
    let data = text.find("section .data").unwrap();
    let code = text.find("section .code").unwrap();
    let end = text.find("; End of MPL generated file").unwrap();
    assert!(struc < vis && vis < data && data < code && code < end);

    // Struct layout and its assembler-side check.
    assert!(text.contains("%if (0x9 != S_size)"));
    assert!(text.contains("s0:\tresb 0x9"));

    // Static data.
    assert!(text.contains("msg:\tdb 'h', 'i', 0x0"));
    assert!(text.contains("counter:\tdd 0x5"));

    // The size quad folded to a compile-time constant.
    assert!(text.contains("\tmov eax, 0x9"));
    assert!(text.contains("\tmov [sval], eax"));

    // The loop skeleton.
    assert!(text.contains("top:"));
    assert!(text.contains("\tjz done"));
    assert!(text.contains("\tdec eax"));
    assert!(text.contains("\tmov [counter], eax"));
    assert!(text.contains("\tjmp top"));
    assert!(text.contains("done:"));
    assert!(text.contains("\tret 0x0"));
}

/// Long mode moves a byte8 through the full-width accumulator.
#[test]
fn long_mode_quadwords() {
    let mut prog = Ppd::new();
    let g = prime(&mut prog, "g", StorageClass::Public, Width::Byte8, 0);
    let h = prime(&mut prog, "h", StorageClass::Public, Width::Byte8, 0x10);
    routine(
        &mut prog,
        "main",
        vec![
            Quad::unary(Op::Ass, g, h),
            Quad::new(Op::Rtrn, None, None, None),
        ],
    );

    let text = generate(&mut prog, X86Mode::Long);
    assert!(text.contains("bits 64"));
    assert!(text.contains("g:\tdq 0x0"));
    assert!(text.contains("h:\tdq 0x10"));
    assert!(text.contains("\tmov rax, [h]"));
    assert!(text.contains("\tmov [g], rax"));
}

/// A byte8 in protected mode fails hard, before any output.
#[test]
fn byte8_in_protected_mode_writes_nothing() {
    let mut prog = Ppd::new();
    let wide = prime(&mut prog, "wide", StorageClass::Private, Width::Byte8, 0);
    routine(&mut prog, "main", vec![Quad::src(Op::Rtrn, wide)]);

    let mut out = Vec::new();
    let err = codegen::x86(&mut out, &mut prog, X86Mode::Protected);
    assert!(matches!(err, Err(Error::InvalidWidth { .. })));
    assert!(out.is_empty());
}

/// Calling across routines: pushes, the call, and the callee's
/// unloading return.
#[test]
fn cross_routine_call() {
    let mut prog = Ppd::new();
    let p1 = prime(&mut prog, "p1", StorageClass::Param, Width::Byte4, 0);
    let one = prime(&mut prog, "one", StorageClass::Const, Width::Byte4, 1);
    let tf = prime(&mut prog, "tf", StorageClass::Temp, Width::Byte4, 0);
    let f = routine(
        &mut prog,
        "bump",
        vec![Quad::binary(Op::Add, tf, p1, one), Quad::src(Op::Rtrn, tf)],
    );
    prog.get_mut(f).as_routine_mut().unwrap().params = vec![p1];

    let x = prime(&mut prog, "x", StorageClass::Private, Width::Byte4, 0);
    let r = prime(&mut prog, "r", StorageClass::Private, Width::Byte4, 0);
    let tr = prime(&mut prog, "tr", StorageClass::Temp, Width::Byte4, 0);
    routine(
        &mut prog,
        "main",
        vec![
            Quad::src(Op::Parm, x),
            Quad::new(Op::Call, Some(tr), Some(f), None),
            Quad::unary(Op::Ass, r, tr),
            Quad::new(Op::Rtrn, None, None, None),
        ],
    );

    let text = generate(&mut prog, X86Mode::Protected);
    // Caller side.
    assert!(text.contains("\tmov eax, [x]"));
    assert!(text.contains("\tpush eax"));
    assert!(text.contains("\tcall bump"));
    assert!(text.contains("\tmov [r], eax"));
    // Callee side: the parameter slot and the unloading return.
    assert!(text.contains("[ebp+0x8+0x0*0x4]"));
    assert!(text.contains("\tret 0x4"));
}
