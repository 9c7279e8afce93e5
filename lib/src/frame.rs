/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The target's frame and ABI model: register identities, the calling
//! convention, frame slot allocation and the procedure entry/exit hooks.
//!
//! Everything the instruction selector and the register allocator need to
//! know about the machine goes through the `Frame` trait; `X64Frame` is the
//! x86-64 implementation.

use log::debug;

use std::rc::Rc;

use crate::assem::Instr;
use crate::data_structures::{Label, Map, Temp, TempGen};
use crate::tree::{self, BinOp, Exp, Stm};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Where a variable (or a spilled temporary) lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Access {
  /// Byte offset from the frame pointer.
  InFrame(i32),
  InReg(Temp),
}

impl Access {
  /// The tree that reads or writes this access, given the frame pointer.
  pub fn exp(&self, fp: Temp) -> Exp {
    match self {
      Access::InFrame(offset) => tree::mem(tree::binop(
        BinOp::Plus,
        Exp::Temp(fp),
        Exp::Const(*offset),
      )),
      Access::InReg(t) => Exp::Temp(*t),
    }
  }
}

/// A trait defined by the target to describe its frame layout and register
/// file to the instruction selector and the register allocator.
pub trait Frame {
  /// The function's entry label.
  fn name(&self) -> &Label;

  // ---------------
  // Register roles
  // ---------------

  /// The virtual frame pointer.  It is never used as an operand directly:
  /// the selector rewrites it to the stack pointer plus the frame size.
  fn frame_pointer(&self) -> Temp;
  fn stack_pointer(&self) -> Temp;
  fn return_value(&self) -> Temp;
  /// A reserved register kept live at function exit.
  fn zero_register(&self) -> Temp;
  fn parameter_registers(&self) -> &[Temp];
  /// Registers a call may overwrite.
  fn caller_saved_registers(&self) -> &[Temp];
  /// Registers a function must give back unchanged.
  fn callee_saved_registers(&self) -> &[Temp];
  /// Colors available to the register allocator, in order of preference.
  fn allocatable_registers(&self) -> &[Temp];
  /// (dividend/quotient, sign-extension/remainder).
  fn division_registers(&self) -> (Temp, Temp);
  /// Registers reserved for spill code: sources to reload into, and the
  /// single destination register to compute into before storing.
  fn spill_scratch_registers(&self) -> (&[Temp], Temp);

  /// True if |t| is one of the machine's registers.
  fn is_register(&self, t: Temp) -> bool;
  fn register_name(&self, t: Temp) -> Option<&str>;

  // ---------------
  // Layout
  // ---------------

  fn word_size(&self) -> i32;

  /// Allocate |bytes| of local storage, in the frame if |in_frame|, else in a
  /// fresh temporary.
  fn allocate_slot(
    &mut self, bytes: i32, in_frame: bool, gen: &mut TempGen,
  ) -> Access;

  /// Bytes allocated so far.  Only ever grows.
  fn size(&self) -> i32;

  /// Assembler symbol standing for the final frame size.
  fn frame_size_symbol(&self) -> String;

  // ---------------
  // Code generation hooks
  // ---------------

  /// A call to a runtime routine.
  fn external_call(&self, name: Label, args: Vec<Exp>) -> Exp;

  /// Instructions placed at function entry.  Saves the callee-saved
  /// registers into fresh temporaries.
  fn on_function_enter(&mut self, gen: &mut TempGen) -> Vec<Instr>;

  /// Instructions placed before the return sink.  Restores what
  /// `on_function_enter` saved.
  fn on_function_return(&self) -> Vec<Instr>;

  /// An instruction that does nothing but keep the registers that must be
  /// live at exit alive.
  fn return_sink(&self) -> Instr;

  /// Generate a reload of frame slot |offset| into |to_reg|.
  fn gen_reload(&self, offset: i32, to_reg: Temp) -> Instr;

  /// Generate a store of |from_reg| into frame slot |offset|.
  fn gen_spill(&self, from_reg: Temp, offset: i32) -> Instr;

  /// Wrap an allocated body with the prologue and epilogue.
  fn finalize(&self, body: Vec<Instr>) -> Proc;
}

//=============================================================================
// The x86-64 register file

pub const X64_REG_NAMES: [&str; 16] = [
  "%rax", "%rbx", "%rcx", "%rdx", "%rsi", "%rdi", "%rbp", "%rsp", "%r8", "%r9",
  "%r10", "%r11", "%r12", "%r13", "%r14", "%r15",
];

// Indices into X64_REG_NAMES.
const RAX: usize = 0;
const RBX: usize = 1;
const RCX: usize = 2;
const RDX: usize = 3;
const RSI: usize = 4;
const RDI: usize = 5;
const RBP: usize = 6;
const RSP: usize = 7;
const R8: usize = 8;
const R9: usize = 9;
const R10: usize = 10;
const R11: usize = 11;
const R12: usize = 12;
const R13: usize = 13;
const R14: usize = 14;
const R15: usize = 15;

const PARAM_REGS: [usize; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const CALLER_SAVED: [usize; 9] = [RAX, RDI, RSI, RDX, RCX, R8, R9, R10, R11];
// r14 is saved first: it is the spill destination scratch, and the other saves
// may need it once their save temporaries get spilled.
const CALLEE_SAVED: [usize; 5] = [R14, RBX, RBP, R12, R13];
const ALLOCATABLE: [usize; 9] = [RAX, RBX, RCX, RDX, RSI, RDI, RBP, R8, R9];
const SPILL_SRC: [usize; 4] = [R10, R11, R12, R13];
const SPILL_DST: usize = R14;
const ZERO: usize = R15;

/// The sixteen x86-64 registers, as temporaries.
#[derive(Clone, Debug)]
pub struct X64Regs {
  regs: Vec<Temp>,
  names: Map<Temp, &'static str>,
  params: Vec<Temp>,
  caller_saved: Vec<Temp>,
  callee_saved: Vec<Temp>,
  allocatable: Vec<Temp>,
  spill_src: Vec<Temp>,
}

impl X64Regs {
  /// Create the register file.  Must be the first thing to take temporaries
  /// from |gen|, so that registers get the lowest numbers.
  pub fn new(gen: &mut TempGen) -> Self {
    Self::with_budget(gen, ALLOCATABLE.len())
  }

  /// Like `new`, but only the first |budget| allocatable registers are handed
  /// to the colorer.
  pub fn with_budget(gen: &mut TempGen, budget: usize) -> Self {
    assert!(gen.num_temps() == 0, "registers must be created first");
    assert!(budget >= 1 && budget <= ALLOCATABLE.len());
    let regs: Vec<Temp> = (0..X64_REG_NAMES.len()).map(|_| gen.new_temp()).collect();
    let mut names = Map::default();
    for (t, name) in regs.iter().zip(X64_REG_NAMES.iter()) {
      names.insert(*t, *name);
    }
    let pick = |ixs: &[usize]| ixs.iter().map(|i| regs[*i]).collect::<Vec<_>>();
    let params = pick(&PARAM_REGS);
    let caller_saved = pick(&CALLER_SAVED);
    let callee_saved = pick(&CALLEE_SAVED);
    let allocatable = pick(&ALLOCATABLE[..budget]);
    let spill_src = pick(&SPILL_SRC);
    Self { regs, names, params, caller_saved, callee_saved, allocatable, spill_src }
  }

  pub fn rax(&self) -> Temp {
    self.regs[RAX]
  }
  pub fn rsp(&self) -> Temp {
    self.regs[RSP]
  }
  pub fn all(&self) -> &[Temp] {
    &self.regs
  }
  pub fn name(&self, t: Temp) -> Option<&'static str> {
    self.names.get(&t).copied()
  }
  pub fn is_register(&self, t: Temp) -> bool {
    t.get_usize() < self.regs.len() && self.regs[t.get_usize()] == t
  }
  pub fn lookup(&self, name: &str) -> Option<Temp> {
    X64_REG_NAMES.iter().position(|n| *n == name).map(|i| self.regs[i])
  }
}

//=============================================================================
// Procedures and fragments

/// A fully allocated procedure, ready to print.
#[derive(Clone, Debug)]
pub struct Proc {
  pub name: Label,
  pub frame_size: i32,
  pub prologue: Vec<String>,
  pub body: Vec<Instr>,
  pub epilogue: Vec<String>,
  register_names: Map<Temp, &'static str>,
}

impl Proc {
  pub fn render(&self) -> String {
    let mut res = String::new();
    for line in &self.prologue {
      res.push_str(line);
      res.push('\n');
    }
    for instr in &self.body {
      let text = instr.format(|t| match self.register_names.get(&t) {
        Some(name) => name.to_string(),
        None => format!("{:?}", t),
      });
      // The return sink has no text.
      if text.is_empty() {
        continue;
      }
      match instr {
        Instr::Label { .. } => res.push_str(&text),
        _ => {
          res.push_str("        ");
          res.push_str(&text);
        }
      }
      res.push('\n');
    }
    for line in &self.epilogue {
      res.push_str(line);
      res.push('\n');
    }
    res
  }
}

/// A unit of output: either a procedure awaiting code generation or a string
/// literal.
pub enum Frag<F: Frame> {
  Proc { body: Vec<Stm>, frame: F },
  String { label: Label, value: String },
}

//=============================================================================
// The x86-64 frame

pub const X64_WORD_SIZE: i32 = 8;

#[derive(Clone, Debug)]
pub struct X64Frame {
  name: Label,
  regs: Rc<X64Regs>,
  formals: Vec<Access>,
  view_shift: Vec<Stm>,
  size: i32,
  // (register, temporary holding its value on entry)
  saved: Vec<(Temp, Temp)>,
}

impl X64Frame {
  /// Make a frame for function |name| whose formals escape as indicated.
  /// Escaping formals live in the frame, the others in fresh temporaries.
  pub fn new(
    name: Label, escapes: &[bool], regs: Rc<X64Regs>, gen: &mut TempGen,
  ) -> Self {
    let mut frame = Self {
      name,
      regs,
      formals: vec![],
      view_shift: vec![],
      size: 0,
      saved: vec![],
    };
    let fp = frame.frame_pointer();
    // Stack-passed arguments sit above the return address, which is where
    // the frame pointer points.
    let mut incoming_offset = X64_WORD_SIZE;
    for (i, escape) in escapes.iter().enumerate() {
      let access = frame.allocate_slot(X64_WORD_SIZE, *escape, gen);
      let incoming = if i < frame.regs.params.len() {
        Exp::Temp(frame.regs.params[i])
      } else {
        let e = Access::InFrame(incoming_offset).exp(fp);
        incoming_offset += X64_WORD_SIZE;
        e
      };
      frame.view_shift.push(tree::mov(access.exp(fp), incoming));
      frame.formals.push(access);
    }
    frame
  }

  pub fn formals(&self) -> &[Access] {
    &self.formals
  }

  pub fn regs(&self) -> &Rc<X64Regs> {
    &self.regs
  }

  /// Prepend the view shift to |body| and move |result|, if any, into the
  /// return-value register.
  pub fn proc_entry_exit1(
    &self, body: Vec<Stm>, result: Option<Exp>,
  ) -> Vec<Stm> {
    let mut stms = self.view_shift.clone();
    stms.extend(body);
    if let Some(e) = result {
      stms.push(tree::mov(Exp::Temp(self.return_value()), e));
    }
    stms
  }
}

impl Frame for X64Frame {
  fn name(&self) -> &Label {
    &self.name
  }

  fn frame_pointer(&self) -> Temp {
    self.regs.regs[RBP]
  }
  fn stack_pointer(&self) -> Temp {
    self.regs.regs[RSP]
  }
  fn return_value(&self) -> Temp {
    self.regs.regs[RAX]
  }
  fn zero_register(&self) -> Temp {
    self.regs.regs[ZERO]
  }
  fn parameter_registers(&self) -> &[Temp] {
    &self.regs.params
  }
  fn caller_saved_registers(&self) -> &[Temp] {
    &self.regs.caller_saved
  }
  fn callee_saved_registers(&self) -> &[Temp] {
    &self.regs.callee_saved
  }
  fn allocatable_registers(&self) -> &[Temp] {
    &self.regs.allocatable
  }
  fn division_registers(&self) -> (Temp, Temp) {
    (self.regs.regs[RAX], self.regs.regs[RDX])
  }
  fn spill_scratch_registers(&self) -> (&[Temp], Temp) {
    (&self.regs.spill_src, self.regs.regs[SPILL_DST])
  }

  fn is_register(&self, t: Temp) -> bool {
    self.regs.is_register(t)
  }
  fn register_name(&self, t: Temp) -> Option<&str> {
    self.regs.name(t)
  }

  fn word_size(&self) -> i32 {
    X64_WORD_SIZE
  }

  fn allocate_slot(
    &mut self, bytes: i32, in_frame: bool, gen: &mut TempGen,
  ) -> Access {
    if in_frame {
      self.size += bytes;
      debug!("{}: frame slot at {}, size now {}", self.name, -self.size, self.size);
      Access::InFrame(-self.size)
    } else {
      Access::InReg(gen.new_temp())
    }
  }

  fn size(&self) -> i32 {
    self.size
  }

  fn frame_size_symbol(&self) -> String {
    format!("{}_fs", self.name.name())
  }

  fn external_call(&self, name: Label, args: Vec<Exp>) -> Exp {
    tree::call(name, args)
  }

  fn on_function_enter(&mut self, gen: &mut TempGen) -> Vec<Instr> {
    let mut instrs = vec![];
    self.saved.clear();
    for r in self.regs.callee_saved.iter() {
      let t = gen.new_temp();
      self.saved.push((*r, t));
      instrs.push(Instr::mov(t, *r));
    }
    instrs
  }

  fn on_function_return(&self) -> Vec<Instr> {
    self.saved.iter().map(|(r, t)| Instr::mov(*r, *t)).collect()
  }

  fn return_sink(&self) -> Instr {
    let mut src = vec![self.zero_register(), self.return_value()];
    src.extend(self.regs.callee_saved.iter().copied());
    Instr::oper("".to_string(), &[], &src)
  }

  fn gen_reload(&self, offset: i32, to_reg: Temp) -> Instr {
    Instr::oper(
      format!("movq ({}+{})(`s0), `d0", offset, self.frame_size_symbol()),
      &[to_reg],
      &[self.stack_pointer()],
    )
  }

  fn gen_spill(&self, from_reg: Temp, offset: i32) -> Instr {
    Instr::oper(
      format!("movq `s0, ({}+{})(`s1)", offset, self.frame_size_symbol()),
      &[],
      &[from_reg, self.stack_pointer()],
    )
  }

  fn finalize(&self, body: Vec<Instr>) -> Proc {
    let fs = self.frame_size_symbol();
    let prologue = vec![
      format!(".set {}, {}", fs, self.size),
      "        .text".to_string(),
      format!("        .globl {}", self.name),
      format!("{}:", self.name),
      format!("        subq ${}, %rsp", fs),
    ];
    let epilogue =
      vec![format!("        addq ${}, %rsp", fs), "        ret".to_string()];
    Proc {
      name: self.name.clone(),
      frame_size: self.size,
      prologue,
      body,
      epilogue,
      register_names: self.regs.names.clone(),
    }
  }
}

#[cfg(test)]
mod test_frame {
  use super::*;

  #[test]
  fn registers_come_first() {
    let mut gen = TempGen::new();
    let regs = X64Regs::new(&mut gen);
    assert_eq!(gen.num_temps(), 16);
    assert_eq!(regs.name(regs.rax()), Some("%rax"));
    assert_eq!(regs.lookup("%r14"), Some(regs.all()[14]));
    assert!(regs.is_register(regs.rsp()));
    let t = gen.new_temp();
    assert!(!regs.is_register(t));
  }

  #[test]
  fn budget_restricts_allocatable() {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::with_budget(&mut gen, 3));
    let frame = X64Frame::new(gen.named_label("f"), &[], regs.clone(), &mut gen);
    assert_eq!(frame.allocatable_registers().len(), 3);
    assert!(!frame.allocatable_registers().contains(&frame.stack_pointer()));
  }

  #[test]
  fn formals_and_slots() {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    let escapes = [true, false, false, false, false, false, false, true];
    let mut frame = X64Frame::new(gen.named_label("g"), &escapes, regs, &mut gen);
    assert_eq!(frame.formals()[0], Access::InFrame(-8));
    assert_eq!(frame.formals()[7], Access::InFrame(-16));
    match frame.formals()[1] {
      Access::InReg(_) => {}
      _ => panic!("non-escaping formal should be in a register"),
    }
    assert_eq!(frame.size(), 16);
    assert_eq!(frame.allocate_slot(8, true, &mut gen), Access::InFrame(-24));
    assert_eq!(frame.size(), 24);
    // The 7th and 8th formals come from the caller's stack.
    let fp = frame.frame_pointer();
    let stms = frame.proc_entry_exit1(vec![], Some(Exp::Const(0)));
    assert_eq!(stms.len(), 9);
    assert_eq!(
      stms[6],
      tree::mov(frame.formals()[6].exp(fp), Access::InFrame(8).exp(fp))
    );
    assert_eq!(
      stms[7],
      tree::mov(frame.formals()[7].exp(fp), Access::InFrame(16).exp(fp))
    );
  }

  #[test]
  fn enter_and_return_are_paired() {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    let mut frame = X64Frame::new(gen.named_label("h"), &[], regs, &mut gen);
    let enter = frame.on_function_enter(&mut gen);
    let ret = frame.on_function_return();
    assert_eq!(enter.len(), frame.callee_saved_registers().len());
    for (e, r) in enter.iter().zip(ret.iter()) {
      assert_eq!(e.defs(), r.uses());
      assert_eq!(e.uses(), r.defs());
    }
    let sink = frame.return_sink();
    assert!(sink.uses().contains(&frame.return_value()));
    assert!(sink.defs().is_empty());
    let proc = frame.finalize(vec![sink]);
    assert_eq!(proc.prologue[0], ".set h_fs, 0");
    assert!(proc.render().contains("subq $h_fs, %rsp"));
  }
}
