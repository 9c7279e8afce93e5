/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! An interpreter for the backend's output, so that a program can be run both
//! on the selected instructions (with unlimited temporaries) and on the
//! allocated ones, and the two runs compared.
//!
//! Instructions are executed by reading their templates: the mnemonic picks
//! the operation and the `` `s<i> ``/`` `d<i> ``/`` `j<i> `` placeholders are
//! resolved through the instruction's temp and label lists.  Only the shapes
//! the instruction selector and the spiller emit are understood.

use rustc_hash::FxHashMap;

use tigerback::{BinOp, CompiledProgram, Instr, RelOp, Temp};

//=============================================================================
// Machine constants

const STACK_TOP: i64 = 0x7fff_0000;
const DATA_BASE: i64 = 0x0800_0000;
const HEAP_BASE: i64 = 0x1000_0000;
const RETURN_MARK: i64 = 0x5eed_0000;
// Left in the caller-saved registers by runtime calls.
const POISON: i64 = 0x0bad_0bad_0bad_0bad;
const MAX_STEPS: usize = 10_000_000;

const PARAM_REGS: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];
const CLOBBERED_REGS: [&str; 8] =
  ["%rcx", "%rdx", "%rsi", "%rdi", "%r8", "%r9", "%r10", "%r11"];
const PRESERVED_REGS: [&str; 7] =
  ["%rbx", "%rbp", "%rsp", "%r12", "%r13", "%r14", "%r15"];

pub const ENTRY_POINT: &str = "tigermain";

//=============================================================================
// Interpreter state

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStage {
  BeforeRegalloc,
  AfterRegalloc,
}

#[derive(Debug)]
pub struct RunResult {
  pub num_steps: usize,
  pub stdout: String,
  pub ret_value: i64,
}

// An instruction operand, with placeholders resolved.
#[derive(Debug)]
enum Operand {
  Imm(i64),
  Reg(Temp),
  Mem { disp: i64, base: Temp, index: Option<Temp> },
  // A `label(%rip)` address.
  Abs(i64),
  Target(String),
}

enum Next {
  Fallthrough,
  Jump(String),
  Call(String),
}

struct Activation {
  proc_ix: usize,
  pc: usize,
  // Temporaries are private to each activation.
  temps: FxHashMap<Temp, i64>,
  // Preserved registers on entry, checked again on return.
  saved: Vec<(Temp, i64)>,
}

struct IState<'a> {
  program: &'a CompiledProgram,
  run_stage: RunStage,
  labels: Vec<FxHashMap<String, usize>>,
  symbols: FxHashMap<String, i64>,
  strings: FxHashMap<i64, String>,
  regs: FxHashMap<Temp, i64>,
  mem: FxHashMap<i64, i64>,
  heap_top: i64,
  // Operands of the last compare, as (left, right).
  flags: (i64, i64),
  stack: Vec<Activation>,
  stdout: String,
  rsp: Temp,
  rax: Temp,
  n_insns: usize,
}

impl<'a> IState<'a> {
  fn new(program: &'a CompiledProgram, run_stage: RunStage) -> Self {
    let mut state = IState {
      program,
      run_stage,
      labels: vec![],
      symbols: FxHashMap::default(),
      strings: FxHashMap::default(),
      regs: FxHashMap::default(),
      mem: FxHashMap::default(),
      heap_top: HEAP_BASE,
      flags: (0, 0),
      stack: vec![],
      stdout: String::new(),
      rsp: program.regs.rsp(),
      rax: program.regs.rax(),
      n_insns: 0,
    };
    for ix in 0..program.procs.len() {
      let mut labels = FxHashMap::default();
      for (pc, instr) in state.code(ix).iter().enumerate() {
        if let Instr::Label { label, .. } = instr {
          labels.insert(label.name().to_string(), pc);
        }
      }
      state.labels.push(labels);
      let proc = &program.procs[ix].proc;
      state.symbols.insert(format!("{}_fs", proc.name.name()), proc.frame_size as i64);
    }
    // Strings are a length word followed by the characters; only the length
    // is in memory, the text is kept aside for `print`.
    for (i, (label, value)) in program.strings.iter().enumerate() {
      let addr = DATA_BASE + 16 * i as i64;
      state.symbols.insert(label.name().to_string(), addr);
      state.strings.insert(addr, value.clone());
      state.mem.insert(addr, value.len() as i64);
    }
    for r in program.regs.all() {
      state.regs.insert(*r, 0);
    }
    state.regs.insert(state.rsp, STACK_TOP);
    state
  }

  fn code(&self, proc_ix: usize) -> &'a [Instr] {
    let program: &'a CompiledProgram = self.program;
    match self.run_stage {
      RunStage::BeforeRegalloc => &program.procs[proc_ix].unallocated,
      RunStage::AfterRegalloc => &program.procs[proc_ix].proc.body,
    }
  }

  fn proc_index(&self, name: &str) -> Option<usize> {
    self.program.procs.iter().position(|p| p.proc.name.name() == name)
  }

  fn reg(&self, name: &str) -> Result<Temp, String> {
    self.program.regs.lookup(name).ok_or_else(|| format!("no register {}", name))
  }

  fn top_mut(&mut self) -> Result<&mut Activation, String> {
    self.stack.last_mut().ok_or_else(|| "empty call stack".to_string())
  }

  //---------------------------------------------------------------------------
  // Registers, temporaries and memory

  fn get_temp(&self, t: Temp) -> Result<i64, String> {
    if self.program.regs.is_register(t) {
      return Ok(self.regs.get(&t).copied().unwrap_or(0));
    }
    if self.run_stage == RunStage::AfterRegalloc {
      return Err(format!("read of temporary {:?} after allocation", t));
    }
    self
      .stack
      .last()
      .and_then(|act| act.temps.get(&t).copied())
      .ok_or_else(|| format!("read of undefined temporary {:?}", t))
  }

  fn set_temp(&mut self, t: Temp, val: i64) -> Result<(), String> {
    if self.program.regs.is_register(t) {
      self.regs.insert(t, val);
      return Ok(());
    }
    if self.run_stage == RunStage::AfterRegalloc {
      return Err(format!("write of temporary {:?} after allocation", t));
    }
    self.top_mut()?.temps.insert(t, val);
    Ok(())
  }

  fn get_mem(&self, addr: i64) -> Result<i64, String> {
    self
      .mem
      .get(&addr)
      .copied()
      .ok_or_else(|| format!("read of uninitialized memory at {:#x}", addr))
  }

  fn set_mem(&mut self, addr: i64, val: i64) {
    self.mem.insert(addr, val);
  }

  fn symbol(&self, name: &str) -> Result<i64, String> {
    self.symbols.get(name).copied().ok_or_else(|| format!("unknown symbol {}", name))
  }

  fn push(&mut self, val: i64) -> Result<(), String> {
    let sp = self.get_temp(self.rsp)? - 8;
    self.set_temp(self.rsp, sp)?;
    self.set_mem(sp, val);
    Ok(())
  }

  fn alloc(&mut self, bytes: i64, init: i64) -> Result<i64, String> {
    if bytes < 0 {
      return Err(format!("negative allocation size {}", bytes));
    }
    let addr = self.heap_top;
    let words = (bytes + 7) / 8;
    for i in 0..words {
      self.set_mem(addr + 8 * i, init);
    }
    self.heap_top += 8 * words.max(1);
    Ok(addr)
  }

  //---------------------------------------------------------------------------
  // Operand decoding

  fn placeholder(&self, text: &str, instr: &Instr) -> Result<Operand, String> {
    let bad = || format!("bad placeholder `{}` in {:?}", text, instr);
    let kind = text.as_bytes().get(1).copied().ok_or_else(bad)?;
    let n: usize = text[2..].parse().map_err(|_| bad())?;
    match kind {
      b's' => instr.uses().get(n).map(|t| Operand::Reg(*t)).ok_or_else(bad),
      b'd' => instr.defs().get(n).map(|t| Operand::Reg(*t)).ok_or_else(bad),
      b'j' => instr
        .jump_targets()
        .get(n)
        .map(|l| Operand::Target(l.name().to_string()))
        .ok_or_else(bad),
      _ => Err(bad()),
    }
  }

  fn base_reg(&self, text: &str, instr: &Instr) -> Result<Temp, String> {
    match self.placeholder(text.trim(), instr)? {
      Operand::Reg(t) => Ok(t),
      other => Err(format!("bad address register {:?} in {:?}", other, instr)),
    }
  }

  // A displacement: empty, a number, a symbol, or `(a+b)` of those.
  fn displacement(&self, text: &str) -> Result<i64, String> {
    let text = text.trim();
    let inner = if text.starts_with('(') && text.ends_with(')') {
      &text[1..text.len() - 1]
    } else {
      text
    };
    if inner.is_empty() {
      return Ok(0);
    }
    let mut sum = 0i64;
    for term in inner.split('+') {
      let term = term.trim();
      let val = match term.parse::<i64>() {
        Ok(n) => n,
        Err(_) => self.symbol(term)?,
      };
      sum = sum.wrapping_add(val);
    }
    Ok(sum)
  }

  fn operand(&self, text: &str, instr: &Instr) -> Result<Operand, String> {
    let text = text.trim();
    if let Some(imm) = text.strip_prefix('$') {
      return Ok(Operand::Imm(self.displacement(imm)?));
    }
    if text.starts_with('`') {
      return self.placeholder(text, instr);
    }
    if text.ends_with(')') {
      let open = matching_open(text)
        .ok_or_else(|| format!("unbalanced operand {} in {:?}", text, instr))?;
      let (disp, inner) = (&text[..open], &text[open + 1..text.len() - 1]);
      if inner == "%rip" {
        return Ok(Operand::Abs(self.symbol(disp.trim())?));
      }
      let mut parts = inner.split(',');
      let base = self.base_reg(parts.next().unwrap_or(""), instr)?;
      let index = match parts.next() {
        Some(p) => Some(self.base_reg(p, instr)?),
        None => None,
      };
      return Ok(Operand::Mem { disp: self.displacement(disp)?, base, index });
    }
    Ok(Operand::Target(text.to_string()))
  }

  fn address(&self, op: &Operand) -> Result<i64, String> {
    match op {
      Operand::Mem { disp, base, index } => {
        let mut addr = disp.wrapping_add(self.get_temp(*base)?);
        if let Some(ix) = index {
          addr = addr.wrapping_add(self.get_temp(*ix)?);
        }
        Ok(addr)
      }
      Operand::Abs(addr) => Ok(*addr),
      other => Err(format!("{:?} has no address", other)),
    }
  }

  fn read(&self, op: &Operand) -> Result<i64, String> {
    match op {
      Operand::Imm(v) => Ok(*v),
      Operand::Reg(t) => self.get_temp(*t),
      Operand::Mem { .. } | Operand::Abs(_) => self.get_mem(self.address(op)?),
      Operand::Target(l) => Err(format!("cannot read label {}", l)),
    }
  }

  fn write(&mut self, op: &Operand, val: i64) -> Result<(), String> {
    match op {
      Operand::Reg(t) => self.set_temp(*t, val),
      Operand::Mem { .. } | Operand::Abs(_) => {
        let addr = self.address(op)?;
        self.set_mem(addr, val);
        Ok(())
      }
      other => Err(format!("cannot write {:?}", other)),
    }
  }

  //---------------------------------------------------------------------------
  // Execution

  fn step(&mut self, instr: &Instr) -> Result<Next, String> {
    match instr {
      Instr::Label { .. } => Ok(Next::Fallthrough),
      Instr::Move { dst, src, .. } => {
        let val = self.get_temp(*src)?;
        self.set_temp(*dst, val)?;
        Ok(Next::Fallthrough)
      }
      Instr::Oper { assem, .. } => self.step_oper(assem, instr),
    }
  }

  fn step_oper(&mut self, assem: &str, instr: &Instr) -> Result<Next, String> {
    let assem = assem.trim();
    let (mnemonic, rest) = match assem.find(' ') {
      Some(i) => (&assem[..i], &assem[i + 1..]),
      None => (assem, ""),
    };
    let mut ops = vec![];
    for text in split_operands(rest) {
      ops.push(self.operand(text, instr)?);
    }

    if let Some(op) = arith_op(mnemonic) {
      if let [src, dst] = ops.as_slice() {
        let (l, r) = (self.read(dst)?, self.read(src)?);
        let val = op.calc(l, r).ok_or_else(|| format!("cannot execute {}", assem))?;
        self.write(dst, val)?;
        return Ok(Next::Fallthrough);
      }
    }

    match (mnemonic, ops.as_slice()) {
      ("", []) => {}
      ("movq", [src, dst]) => {
        let val = self.read(src)?;
        self.write(dst, val)?;
      }
      ("leaq", [src, dst]) => {
        let val = self.address(src)?;
        self.write(dst, val)?;
      }
      ("cmpq", [right, left]) => {
        self.flags = (self.read(left)?, self.read(right)?);
      }
      ("jmp", [Operand::Target(l)]) => return Ok(Next::Jump(l.clone())),
      ("cqto", []) => {
        let (q, r) = (instr.defs()[0], instr.defs()[1]);
        let val = self.get_temp(instr.uses()[0])?;
        self.set_temp(q, val)?;
        self.set_temp(r, if val < 0 { -1 } else { 0 })?;
      }
      ("idivq", [divisor]) => {
        let d = self.read(divisor)?;
        let n = self.get_temp(instr.uses()[1])?;
        let q = BinOp::Div.calc(n, d).ok_or_else(|| "division by zero".to_string())?;
        self.set_temp(instr.defs()[0], q)?;
        self.set_temp(instr.defs()[1], n.wrapping_rem(d))?;
      }
      ("pushq", [src]) => {
        let val = self.read(src)?;
        self.push(val)?;
      }
      ("callq", [Operand::Target(f)]) => return Ok(Next::Call(f.clone())),
      (m, [Operand::Target(l)]) => match RelOp::from_jump_mnemonic(m) {
        Some(op) if op.holds(self.flags.0, self.flags.1) => {
          return Ok(Next::Jump(l.clone()))
        }
        Some(_) => {}
        None => return Err(format!("cannot execute {}", assem)),
      },
      _ => return Err(format!("cannot execute {}", assem)),
    }
    Ok(Next::Fallthrough)
  }

  fn enter(&mut self, proc_ix: usize) -> Result<(), String> {
    let depth = self.stack.len() as i64;
    self.push(RETURN_MARK + depth)?;
    let mut saved = vec![];
    for name in PRESERVED_REGS.iter() {
      let r = self.reg(name)?;
      saved.push((r, self.get_temp(r)?));
    }
    let fs = self.program.procs[proc_ix].proc.frame_size as i64;
    let sp = self.get_temp(self.rsp)? - fs;
    self.set_temp(self.rsp, sp)?;
    self.stack.push(Activation { proc_ix, pc: 0, temps: FxHashMap::default(), saved });
    Ok(())
  }

  fn leave(&mut self) -> Result<(), String> {
    let (proc_ix, saved) = match self.stack.last() {
      Some(act) => (act.proc_ix, act.saved.clone()),
      None => return Err("empty call stack".to_string()),
    };
    let program: &'a CompiledProgram = self.program;
    let proc = &program.procs[proc_ix].proc;
    let sp = self.get_temp(self.rsp)? + proc.frame_size as i64;
    self.set_temp(self.rsp, sp)?;
    for (r, val) in saved {
      if self.get_temp(r)? != val {
        return Err(format!(
          "{} does not preserve {}",
          proc.name,
          program.regs.name(r).unwrap_or("?")
        ));
      }
    }
    let expected = RETURN_MARK + self.stack.len() as i64 - 1;
    if self.get_mem(sp)? != expected {
      return Err(format!("{} overwrote its return address", proc.name));
    }
    self.set_temp(self.rsp, sp + 8)?;
    self.stack.pop();
    Ok(())
  }

  fn call_runtime(&mut self, name: &str) -> Result<(), String> {
    let mut args = vec![];
    for r in PARAM_REGS.iter() {
      let r = self.reg(r)?;
      args.push(self.get_temp(r)?);
    }
    let ret = match name {
      "printi" => {
        self.stdout += &format!("{}\n", args[0]);
        0
      }
      "print" => {
        let text = self
          .strings
          .get(&args[0])
          .cloned()
          .ok_or_else(|| format!("print of non-string {:#x}", args[0]))?;
        self.stdout += &text;
        0
      }
      "allocRecord" => self.alloc(args[0], 0)?,
      "initArray" => self.alloc(args[0].wrapping_mul(8), args[1])?,
      _ => return Err(format!("call to unknown function {}", name)),
    };
    for r in CLOBBERED_REGS.iter() {
      let r = self.reg(r)?;
      self.set_temp(r, POISON)?;
    }
    self.set_temp(self.rax, ret)
  }

  fn run(&mut self, entry: &str) -> Result<i64, String> {
    let ix =
      self.proc_index(entry).ok_or_else(|| format!("no function named {}", entry))?;
    self.enter(ix)?;
    loop {
      if self.n_insns >= MAX_STEPS {
        return Err("step limit exceeded".to_string());
      }
      let (proc_ix, pc) = match self.stack.last() {
        Some(act) => (act.proc_ix, act.pc),
        None => return Err("empty call stack".to_string()),
      };
      let code = self.code(proc_ix);
      if pc >= code.len() {
        self.leave()?;
        if self.stack.is_empty() {
          return self.get_temp(self.rax);
        }
        continue;
      }
      self.n_insns += 1;
      match self.step(&code[pc])? {
        Next::Fallthrough => self.top_mut()?.pc += 1,
        Next::Jump(l) => {
          let target = self.labels[proc_ix]
            .get(&l)
            .copied()
            .ok_or_else(|| format!("jump to unknown label {}", l))?;
          self.top_mut()?.pc = target;
        }
        Next::Call(f) => {
          self.top_mut()?.pc += 1;
          match self.proc_index(&f) {
            Some(callee) => self.enter(callee)?,
            None => self.call_runtime(&f)?,
          }
        }
      }
    }
  }
}

fn arith_op(mnemonic: &str) -> Option<BinOp> {
  Some(match mnemonic {
    "addq" => BinOp::Plus,
    "subq" => BinOp::Minus,
    "imulq" => BinOp::Mul,
    "andq" => BinOp::And,
    "orq" => BinOp::Or,
    "xorq" => BinOp::Xor,
    _ => return None,
  })
}

// Split at the commas that are not inside parentheses.
fn split_operands(text: &str) -> Vec<&str> {
  let mut res = vec![];
  let mut depth = 0;
  let mut start = 0;
  for (i, c) in text.char_indices() {
    match c {
      '(' => depth += 1,
      ')' => depth -= 1,
      ',' if depth == 0 => {
        res.push(text[start..i].trim());
        start = i + 1;
      }
      _ => {}
    }
  }
  let last = text[start..].trim();
  if !last.is_empty() {
    res.push(last);
  }
  res
}

// The position of the `(` matching the final `)`.
fn matching_open(text: &str) -> Option<usize> {
  let mut depth = 0;
  for (i, c) in text.char_indices().rev() {
    match c {
      ')' => depth += 1,
      '(' => {
        depth -= 1;
        if depth == 0 {
          return Some(i);
        }
      }
      _ => {}
    }
  }
  None
}

/// Run the program from `tigermain`, on the instructions of |run_stage|.
pub fn run_program(
  program: &CompiledProgram, who: &str, run_stage: RunStage,
) -> Result<RunResult, String> {
  println!("");
  println!("Running stage '{}': entry '{}'", who, ENTRY_POINT);

  let mut istate = IState::new(program, run_stage);
  let ret = istate.run(ENTRY_POINT);

  println!("Running stage '{}': done.  {} insns", who, istate.n_insns);

  let ret_value = ret?;
  Ok(RunResult { num_steps: istate.n_insns, stdout: istate.stdout, ret_value })
}

/// Panic unless both runs agree.
pub fn check_results(
  before_regalloc_result: Result<RunResult, String>,
  after_regalloc_result: Result<RunResult, String>,
) {
  match before_regalloc_result {
    Ok(before_regalloc_result) => {
      let after_regalloc_result = after_regalloc_result
        .unwrap_or_else(|err| panic!("code after regalloc failed: {}", err));

      assert_eq!(
        before_regalloc_result.ret_value, after_regalloc_result.ret_value,
        "Incorrect interpreter result: expected {:?}, observed {:?}",
        before_regalloc_result.ret_value, after_regalloc_result.ret_value
      );

      assert_eq!(
        before_regalloc_result.stdout, after_regalloc_result.stdout,
        r#"Different stdout values before/after regalloc:
- before:
{}
-after:
{}
        "#,
        before_regalloc_result.stdout, after_regalloc_result.stdout
      );
    }

    Err(err) => {
      assert_eq!(Some(err), after_regalloc_result.err());
    }
  }
}
