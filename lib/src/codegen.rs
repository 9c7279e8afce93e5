/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Instruction selection: tiles canonical IR trees with x86-64 instructions,
//! maximal munch style.
//!
//! Each statement is matched top-down against the patterns below, most
//! specific first, and each expression yields the temporary holding its
//! value.  The frame pointer is virtual: any reference to it becomes an
//! offset from the stack pointer plus the frame-size symbol, which the
//! assembler resolves once the final frame size is known.

use log::{debug, log_enabled, trace, Level};

use crate::assem::Instr;
use crate::data_structures::{Temp, TempGen};
use crate::frame::Frame;
use crate::tree::{BinOp, Exp, Stm};

/// Accumulates the instructions selected for one function.
pub struct Codegen<'a, F: Frame> {
  frame: &'a F,
  gen: &'a mut TempGen,
  instrs: Vec<Instr>,
}

impl<'a, F: Frame> Codegen<'a, F> {
  pub fn new(frame: &'a F, gen: &'a mut TempGen) -> Self {
    Self { frame, gen, instrs: vec![] }
  }

  pub fn finish(self) -> Vec<Instr> {
    self.instrs
  }

  fn emit(&mut self, instr: Instr) {
    trace!("    emit {:?}", instr);
    self.instrs.push(instr);
  }

  fn fp(&self) -> Temp {
    self.frame.frame_pointer()
  }
  fn sp(&self) -> Temp {
    self.frame.stack_pointer()
  }
  fn fs(&self) -> String {
    self.frame.frame_size_symbol()
  }

  fn is_fp(&self, e: &Exp) -> bool {
    match e {
      Exp::Temp(t) => *t == self.fp(),
      _ => false,
    }
  }

  //===========================================================================
  // Statements

  pub fn munch_stm(&mut self, stm: &Stm) {
    match stm {
      Stm::Seq(..) => panic!("munch_stm: Seq in a canonical tree"),
      Stm::Label(l) => self.emit(Instr::label(l.clone())),
      Stm::Jump(Exp::Name(l), _) => {
        self.emit(Instr::jump("jmp `j0".to_string(), l.clone()))
      }
      Stm::Jump(e, _) => panic!("munch_stm: computed jump to {:?}", e),
      Stm::CJump { op, left, right, t, f: _ } => {
        let l = self.munch_exp(left);
        let r = self.munch_exp(right);
        self.emit(Instr::oper("cmpq `s0, `s1".to_string(), &[], &[r, l]));
        // The false label follows immediately.
        self.emit(Instr::cond_jump(
          format!("{} `j0", op.jump_mnemonic()),
          vec![t.clone()],
        ));
      }
      Stm::Move(Exp::Mem(addr), src) => self.munch_store(addr, src),
      Stm::Move(Exp::Temp(t), src) => {
        if *t == self.fp() {
          panic!("munch_stm: assignment to the frame pointer");
        }
        let s = self.munch_exp(src);
        self.emit(Instr::mov(*t, s));
      }
      Stm::Move(dst, _) => panic!("munch_stm: bad move destination {:?}", dst),
      Stm::Exp(e) => {
        self.munch_exp(e);
      }
    }
  }

  fn munch_store(&mut self, addr: &Exp, src: &Exp) {
    // movq s0, (c+fs)(%rsp)
    if let Some((base, c)) = split_offset(addr) {
      if self.is_fp(base) {
        let s = self.munch_exp(src);
        let sp = self.sp();
        let assem = format!("movq `s0, ({}+{})(`s1)", c, self.fs());
        self.emit(Instr::oper(assem, &[], &[s, sp]));
        return;
      }
      // movq s0, c(s1)
      let s = self.munch_exp(src);
      let b = self.munch_exp(base);
      self.emit(Instr::oper(format!("movq `s0, {}(`s1)", c), &[], &[s, b]));
      return;
    }
    // movq $c, (s0)
    if let Exp::Const(c) = src {
      let a = self.munch_exp(addr);
      self.emit(Instr::oper(format!("movq ${}, (`s0)", c), &[], &[a]));
      return;
    }
    // movq s0, (s1)
    let s = self.munch_exp(src);
    let a = self.munch_exp(addr);
    self.emit(Instr::oper("movq `s0, (`s1)".to_string(), &[], &[s, a]));
  }

  //===========================================================================
  // Expressions

  pub fn munch_exp(&mut self, e: &Exp) -> Temp {
    match e {
      Exp::Temp(t) => {
        if *t != self.fp() {
          return *t;
        }
        let d = self.gen.new_temp();
        let sp = self.sp();
        let assem = format!("leaq {}(`s0), `d0", self.fs());
        self.emit(Instr::oper(assem, &[d], &[sp]));
        d
      }
      Exp::Const(c) => {
        let d = self.gen.new_temp();
        self.emit(Instr::oper(format!("movq ${}, `d0", c), &[d], &[]));
        d
      }
      Exp::Name(l) => {
        let d = self.gen.new_temp();
        self.emit(Instr::oper(format!("leaq {}(%rip), `d0", l), &[d], &[]));
        d
      }
      Exp::Mem(addr) => self.munch_load(addr),
      Exp::BinOp(op, l, r) => self.munch_binop(e, *op, l, r),
      Exp::Call(f, args) => match &**f {
        Exp::Name(name) => self.munch_call(name.name(), args),
        other => panic!("munch_exp: indirect call through {:?}", other),
      },
      Exp::ESeq(..) => panic!("munch_exp: ESeq in a canonical tree"),
    }
  }

  fn munch_load(&mut self, addr: &Exp) -> Temp {
    // movq (c+fs)(%rsp), d0
    if let Some((base, c)) = split_offset(addr) {
      let d = self.gen.new_temp();
      if self.is_fp(base) {
        let sp = self.sp();
        let assem = format!("movq ({}+{})(`s0), `d0", c, self.fs());
        self.emit(Instr::oper(assem, &[d], &[sp]));
      } else {
        // movq c(s0), d0
        let b = self.munch_exp(base);
        self.emit(Instr::oper(format!("movq {}(`s0), `d0", c), &[d], &[b]));
      }
      return d;
    }
    // movq (s0,s1), d0
    if let Exp::BinOp(BinOp::Plus, a, b) = addr {
      let ta = self.munch_exp(a);
      let tb = self.munch_exp(b);
      let d = self.gen.new_temp();
      self.emit(Instr::oper("movq (`s0,`s1), `d0".to_string(), &[d], &[ta, tb]));
      return d;
    }
    // movq (s0), d0
    let a = self.munch_exp(addr);
    let d = self.gen.new_temp();
    self.emit(Instr::oper("movq (`s0), `d0".to_string(), &[d], &[a]));
    d
  }

  fn munch_binop(&mut self, e: &Exp, op: BinOp, l: &Exp, r: &Exp) -> Temp {
    // leaq c(s0), d0
    if let Some((base, c)) = split_offset(e) {
      let d = self.gen.new_temp();
      if self.is_fp(base) {
        let sp = self.sp();
        let assem = format!("leaq ({}+{})(`s0), `d0", c, self.fs());
        self.emit(Instr::oper(assem, &[d], &[sp]));
      } else {
        let b = self.munch_exp(base);
        self.emit(Instr::oper(format!("leaq {}(`s0), `d0", c), &[d], &[b]));
      }
      return d;
    }
    let tl = self.munch_exp(l);
    let tr = self.munch_exp(r);
    let d = self.gen.new_temp();
    if op == BinOp::Div {
      let (rax, rdx) = self.frame.division_registers();
      self.emit(Instr::mov(rax, tl));
      self.emit(Instr::oper("cqto".to_string(), &[rax, rdx], &[rax]));
      self.emit(Instr::oper(
        "idivq `s0".to_string(),
        &[rax, rdx],
        &[tr, rax, rdx],
      ));
      self.emit(Instr::mov(d, rax));
      return d;
    }
    let mnemonic = match op {
      BinOp::Plus => "addq",
      BinOp::Minus => "subq",
      BinOp::Mul => "imulq",
      BinOp::And => "andq",
      BinOp::Or => "orq",
      BinOp::Xor => "xorq",
      BinOp::Div => unreachable!(),
    };
    self.emit(Instr::mov(d, tl));
    self.emit(Instr::oper(format!("{} `s0, `d0", mnemonic), &[d], &[tr, d]));
    d
  }

  fn munch_call(&mut self, name: &str, args: &[Exp]) -> Temp {
    // Evaluate everything first, so that no argument computation can clobber
    // a parameter register that has already been filled.
    let arg_temps: Vec<Temp> = args.iter().map(|a| self.munch_exp(a)).collect();
    let params: Vec<Temp> = self.frame.parameter_registers().to_vec();
    let num_reg_args = arg_temps.len().min(params.len());
    let num_stack_args = arg_temps.len() - num_reg_args;
    let sp = self.sp();
    let word = self.frame.word_size();

    for (param, t) in params.iter().zip(arg_temps.iter()) {
      self.emit(Instr::mov(*param, *t));
    }
    // Pushes come last, so nothing addressed from the stack pointer is
    // selected while they are outstanding.  Last stack argument first, so
    // the first one ends up next to the return address.
    for t in arg_temps[num_reg_args..].iter().rev() {
      self.emit(Instr::stack_adjust(
        "pushq `s0".to_string(),
        &[sp],
        &[*t, sp],
        word,
      ));
    }
    let clobbers: Vec<Temp> = self.frame.caller_saved_registers().to_vec();
    self.emit(Instr::call(
      format!("callq {}", name),
      &clobbers,
      &params[..num_reg_args],
    ));
    if num_stack_args > 0 {
      let bytes = num_stack_args as i32 * word;
      self.emit(Instr::stack_adjust(
        format!("addq ${}, `d0", bytes),
        &[sp],
        &[sp],
        -bytes,
      ));
    }
    let d = self.gen.new_temp();
    let rv = self.frame.return_value();
    self.emit(Instr::mov(d, rv));
    d
  }
}

/// Recognize `x + c`, `c + x` and `x - c`, returning `x` and the signed
/// offset.  `x - i32::MIN` has no such offset.
fn split_offset(e: &Exp) -> Option<(&Exp, i32)> {
  match e {
    Exp::BinOp(BinOp::Plus, l, r) => match (&**l, &**r) {
      (x, Exp::Const(k)) => Some((x, *k)),
      (Exp::Const(k), x) => Some((x, *k)),
      _ => None,
    },
    Exp::BinOp(BinOp::Minus, x, c) => match **c {
      Exp::Const(k) => k.checked_neg().map(|k| (&**x, k)),
      _ => None,
    },
    _ => None,
  }
}

/// Select instructions for a whole function body: the callee-saved register
/// saves, the statements, the restores and the return sink.
pub fn codegen<F: Frame>(
  frame: &mut F, stms: &[Stm], gen: &mut TempGen,
) -> Vec<Instr> {
  debug!("codegen: begin {}", frame.name());
  let mut instrs = frame.on_function_enter(gen);
  {
    let mut cg = Codegen::new(&*frame, gen);
    for stm in stms {
      cg.munch_stm(stm);
    }
    instrs.extend(cg.finish());
  }
  instrs.extend(frame.on_function_return());
  instrs.push(frame.return_sink());
  if log_enabled!(Level::Debug) {
    for instr in &instrs {
      debug!("{:?}", instr);
    }
  }
  debug!("codegen: end {} ({} instrs)", frame.name(), instrs.len());
  instrs
}

#[cfg(test)]
mod test_codegen {
  use super::*;
  use crate::frame::{X64Frame, X64Regs};
  use crate::tree::{self, RelOp};
  use std::rc::Rc;

  fn setup() -> (TempGen, X64Frame) {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    let frame = X64Frame::new(gen.named_label("f"), &[], regs, &mut gen);
    (gen, frame)
  }

  fn select(frame: &X64Frame, gen: &mut TempGen, stms: &[Stm]) -> Vec<String> {
    let mut cg = Codegen::new(frame, gen);
    for s in stms {
      cg.munch_stm(s);
    }
    let regs = frame.regs().clone();
    cg.finish()
      .iter()
      .map(|i| {
        i.format(|t| match regs.name(t) {
          Some(n) => n.to_string(),
          None => format!("{:?}", t),
        })
      })
      .collect()
  }

  #[test]
  fn plus_const_becomes_one_leaq() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let sums = vec![
      tree::binop(BinOp::Plus, Exp::Temp(a), Exp::Const(3)),
      tree::binop(BinOp::Plus, Exp::Const(3), Exp::Temp(a)),
    ];
    for sum in sums {
      let out = select(&frame, &mut gen, &[tree::mov(Exp::Temp(b), sum)]);
      let leaqs: Vec<&String> =
        out.iter().filter(|s| s.starts_with("leaq")).collect();
      assert_eq!(leaqs.len(), 1);
      assert!(leaqs[0].starts_with(&format!("leaq 3({:?})", a)));
      assert!(out.iter().all(|s| !s.starts_with("addq")));
    }
  }

  #[test]
  fn minus_const_negates_offset() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let out = select(
      &frame,
      &mut gen,
      &[Stm::Exp(tree::binop(BinOp::Minus, Exp::Temp(a), Exp::Const(5)))],
    );
    assert_eq!(out.len(), 1);
    assert!(out[0].starts_with(&format!("leaq -5({:?})", a)));
  }

  #[test]
  fn minus_min_const_is_a_subtraction() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let diff = tree::binop(BinOp::Minus, Exp::Temp(a), Exp::Const(i32::MIN));
    let out = select(&frame, &mut gen, &[Stm::Exp(diff.clone())]);
    assert!(out.iter().all(|s| !s.starts_with("leaq")));
    assert!(out[0].starts_with("movq $-2147483648, "));
    assert!(out.last().unwrap().starts_with("subq "));

    let out = select(&frame, &mut gen, &[Stm::Exp(tree::mem(diff))]);
    assert!(out.iter().all(|s| !s.starts_with("leaq")));
    assert!(out.iter().any(|s| s.starts_with("subq ")));
    assert!(out.last().unwrap().starts_with("movq (t"));
  }

  #[test]
  fn seven_args_push_one_and_release() {
    let (mut gen, frame) = setup();
    let args = (0..7).map(|i| Exp::Const(i)).collect();
    let f = gen.named_label("seven");
    let out = select(&frame, &mut gen, &[Stm::Exp(tree::call(f, args))]);
    let pushes = out.iter().filter(|s| s.starts_with("pushq")).count();
    assert_eq!(pushes, 1);
    let call_ix = out.iter().position(|s| s == "callq seven").unwrap();
    assert!(out[call_ix - 1].starts_with("pushq "));
    assert_eq!(out[call_ix + 1], "addq $8, %rsp");
    assert_eq!(out.iter().filter(|s| s.starts_with("addq")).count(), 1);
    // All six parameter registers are filled before the call.
    for r in &["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"] {
      assert!(out[..call_ix].iter().any(|s| s.ends_with(&format!(", {}", r))));
    }
  }

  #[test]
  fn call_defs_and_uses() {
    let (mut gen, frame) = setup();
    let f = gen.named_label("two");
    let mut cg = Codegen::new(&frame, &mut gen);
    cg.munch_exp(&tree::call(f, vec![Exp::Const(1), Exp::Const(2)]));
    let instrs = cg.finish();
    let call = instrs
      .iter()
      .find(|i| i.flow() == crate::assem::ControlFlow::Call)
      .unwrap();
    assert_eq!(call.defs(), frame.caller_saved_registers());
    assert_eq!(call.uses(), &frame.parameter_registers()[..2]);
  }

  #[test]
  fn frame_accesses_use_stack_pointer() {
    let (mut gen, frame) = setup();
    let fp = frame.frame_pointer();
    let slot = tree::mem(tree::binop(BinOp::Plus, Exp::Temp(fp), Exp::Const(-8)));
    let out = select(
      &frame,
      &mut gen,
      &[tree::mov(slot.clone(), Exp::Const(1)), Stm::Exp(slot), Stm::Exp(Exp::Temp(fp))],
    );
    assert!(out[1].starts_with("movq %r") || out[1].starts_with("movq t"));
    assert!(out[1].ends_with(", (-8+f_fs)(%rsp)"));
    assert!(out[2].starts_with("movq (-8+f_fs)(%rsp), "));
    assert!(out[3].starts_with("leaq f_fs(%rsp), "));
  }

  #[test]
  fn division_uses_rax_and_rdx() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let out = select(
      &frame,
      &mut gen,
      &[Stm::Exp(tree::binop(BinOp::Div, Exp::Temp(a), Exp::Temp(b)))],
    );
    assert_eq!(out[0], format!("movq {:?}, %rax", a));
    assert_eq!(out[1], "cqto");
    assert_eq!(out[2], format!("idivq {:?}", b));
    assert!(out[3].starts_with("movq %rax, "));
  }

  #[test]
  fn cjump_compares_right_then_left() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let t = gen.new_label();
    let f = gen.new_label();
    let out = select(
      &frame,
      &mut gen,
      &[
        tree::cjump(RelOp::Lt, Exp::Temp(a), Exp::Temp(b), t.clone(), f.clone()),
        Stm::Label(f),
      ],
    );
    assert_eq!(out[0], format!("cmpq {:?}, {:?}", b, a));
    assert_eq!(out[1], format!("jl {}", t));
  }

  #[test]
  fn selection_is_deterministic() {
    let build = || {
      let (mut gen, mut frame) = setup();
      let a = gen.new_temp();
      let stms = vec![
        tree::mov(Exp::Temp(a), Exp::Const(4)),
        tree::mov(
          Exp::Temp(a),
          tree::binop(BinOp::Mul, Exp::Temp(a), Exp::Temp(a)),
        ),
      ];
      let instrs = codegen(&mut frame, &stms, &mut gen);
      instrs.iter().map(|i| format!("{:?}", i)).collect::<Vec<_>>()
    };
    assert_eq!(build(), build());
  }

  #[test]
  #[should_panic]
  fn eseq_is_rejected() {
    let (mut gen, frame) = setup();
    let mut cg = Codegen::new(&frame, &mut gen);
    cg.munch_exp(&Exp::ESeq(
      Box::new(Stm::Exp(Exp::Const(0))),
      Box::new(Exp::Const(1)),
    ));
  }
}
