/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the backend: options, errors, the
//! register allocation driver and whole-program compilation.

use log::{debug, info, log_enabled, Level};

use std::fmt;
use std::rc::Rc;

use crate::assem::Instr;
use crate::checker::{check_assignment, check_coloring, CheckerErrors};
use crate::codegen::codegen;
use crate::color::{color, ColorResult};
use crate::flowgraph::FlowGraph;
use crate::inst_stream::{apply_mapping, rewrite_spills};
use crate::liveness::{compute_liveness, InterferenceGraph};

pub use crate::assem::{ControlFlow, TempVec};
pub use crate::data_structures::{
  InstIx, Label, Map, NodeIx, Set, Temp, TempGen, TypedIxVec,
};
pub use crate::flowgraph::AnalysisError;
pub use crate::frame::{Access, Frag, Frame, Proc, X64Frame, X64Regs};
pub use crate::tree::{BinOp, Exp, RelOp, Stm};

//=============================================================================
// Options

/// Allocator configuration.
#[derive(Clone, Debug)]
pub struct Options {
  /// Verify the final assignment with the checker.
  pub run_checker: bool,
  /// Give up after this many coloring rounds.
  pub max_rounds: u32,
}

impl Default for Options {
  fn default() -> Self {
    Self { run_checker: false, max_rounds: 64 }
  }
}

//=============================================================================
// Errors

#[derive(Clone, Debug)]
pub enum RegAllocError {
  /// The instruction stream was malformed.
  Analysis(AnalysisError),
  /// The checker rejected the result.
  Checker(CheckerErrors),
  /// An instruction needs more spill scratch registers than the frame has.
  OutOfScratchRegisters(String),
  /// Spilling did not converge within the configured number of rounds.
  TooManySpillRounds(u32),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::Analysis(e) => {
        write!(fmt, "analysis error: {}", e.to_string())
      }
      RegAllocError::Checker(e) => write!(fmt, "checker error: {}", e),
      RegAllocError::OutOfScratchRegisters(i) => {
        write!(fmt, "out of spill scratch registers at: {}", i.trim())
      }
      RegAllocError::TooManySpillRounds(n) => {
        write!(fmt, "no coloring found after {} rounds", n)
      }
    }
  }
}

//=============================================================================
// The allocation driver

/// The result of register allocation.
pub struct RegAllocResult {
  /// The instructions, with machine registers only, and same-register moves
  /// removed.
  pub instrs: Vec<Instr>,
  /// The assignment, for every temporary of the last round.
  pub mapping: Map<Temp, Temp>,
  /// Temporaries spilled, over all rounds, in spill order.
  pub spilled: Vec<Temp>,
  /// Coloring rounds run, including the successful one.
  pub num_rounds: u32,
  /// Moves removed because both sides got the same register.
  pub num_moves_removed: usize,
}

/// Allocate registers for one function's instructions.  Spill slots are
/// taken from |frame|, so its size may grow.
#[inline(never)]
pub fn allocate_registers<F: Frame>(
  instrs: Vec<Instr>, frame: &mut F, gen: &mut TempGen, opts: &Options,
) -> Result<RegAllocResult, RegAllocError> {
  info!("allocate_registers: begin {}", frame.name());
  let mut instrs = instrs;
  let mut slots = Map::default();
  let mut spilled = vec![];

  for round in 1..=opts.max_rounds {
    debug!("");
    debug!("allocate_registers: round {}", round);
    let g = FlowGraph::build(&instrs).map_err(RegAllocError::Analysis)?;
    if log_enabled!(Level::Debug) {
      debug!("{}", g.to_dot(&instrs));
    }
    let live = compute_liveness(&g);
    let (ig, mut moves) = InterferenceGraph::build(&g, &live, frame);
    if log_enabled!(Level::Debug) {
      debug!("{}", ig.to_dot(&moves));
    }

    match color(&ig, &mut moves, frame) {
      ColorResult::Spilled(ts) => {
        instrs = rewrite_spills(instrs, &ts, &mut slots, frame, gen)?;
        spilled.extend(ts);
      }
      ColorResult::Colored(mapping) => {
        if log_enabled!(Level::Debug) {
          let mut temps: Vec<&Temp> = mapping.keys().collect();
          temps.sort();
          for t in temps {
            let name = frame.register_name(mapping[t]).unwrap_or("??");
            debug!("allocate_registers: {:?} -> {}", t, name);
          }
        }
        if opts.run_checker {
          check_coloring(&ig, &mapping, frame).map_err(RegAllocError::Checker)?;
          check_assignment(&instrs, &mapping, frame)
            .map_err(RegAllocError::Checker)?;
        }
        let (instrs, num_moves_removed) = apply_mapping(instrs, &mapping);
        info!(
          "allocate_registers: end {}, {} rounds, {} spilled, frame size {}",
          frame.name(),
          round,
          spilled.len(),
          frame.size()
        );
        return Ok(RegAllocResult {
          instrs,
          mapping,
          spilled,
          num_rounds: round,
          num_moves_removed,
        });
      }
    }
  }

  Err(RegAllocError::TooManySpillRounds(opts.max_rounds))
}

/// Select and allocate one function, returning it wrapped in its prologue and
/// epilogue, together with the instructions as they were before allocation.
pub fn compile_proc<F: Frame>(
  frame: &mut F, body: &[Stm], gen: &mut TempGen, opts: &Options,
) -> Result<(Proc, Vec<Instr>, RegAllocResult), RegAllocError> {
  let unallocated = codegen(frame, body, gen);
  let result = allocate_registers(unallocated.clone(), frame, gen, opts)?;
  let proc = frame.finalize(result.instrs.clone());
  Ok((proc, unallocated, result))
}

//=============================================================================
// Whole programs

/// One allocated function.
pub struct CompiledProc {
  pub proc: Proc,
  /// The selected instructions, still in terms of temporaries.
  pub unallocated: Vec<Instr>,
  pub spilled: Vec<Temp>,
  pub num_rounds: u32,
}

pub struct CompiledProgram {
  pub procs: Vec<CompiledProc>,
  pub strings: Vec<(Label, String)>,
  pub regs: Rc<X64Regs>,
}

impl CompiledProgram {
  /// The whole program as assembly text.
  pub fn render(&self) -> String {
    let mut res = String::new();
    for p in &self.procs {
      res += &p.proc.render();
      res += "\n";
    }
    if !self.strings.is_empty() {
      res += "        .section .rodata\n";
      for (label, value) in &self.strings {
        res += &format!("{}:\n        .quad {}\n", label, value.len());
        res += &format!("        .string \"{}\"\n", value.escape_default());
      }
    }
    res
  }

  pub fn find_proc(&self, name: &str) -> Option<&CompiledProc> {
    self.procs.iter().find(|p| p.proc.name.name() == name)
  }
}

/// All the state of one compilation: the temporary and label counters, the
/// register file, and the fragments produced so far.
pub struct Compilation {
  pub gen: TempGen,
  regs: Rc<X64Regs>,
  frags: Vec<Frag<X64Frame>>,
}

impl Compilation {
  pub fn new() -> Self {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    Self { gen, regs, frags: vec![] }
  }

  /// Like `new`, but the colorer only gets |budget| registers.
  pub fn with_budget(budget: usize) -> Self {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::with_budget(&mut gen, budget));
    Self { gen, regs, frags: vec![] }
  }

  pub fn regs(&self) -> &Rc<X64Regs> {
    &self.regs
  }

  pub fn new_frame(&mut self, name: &str, escapes: &[bool]) -> X64Frame {
    let label = self.gen.named_label(name);
    X64Frame::new(label, escapes, self.regs.clone(), &mut self.gen)
  }

  pub fn add_proc(&mut self, frame: X64Frame, body: Vec<Stm>) {
    self.frags.push(Frag::Proc { body, frame });
  }

  /// Add a string literal, returning its label.
  pub fn add_string(&mut self, value: &str) -> Label {
    let label = self.gen.new_label();
    self.frags.push(Frag::String { label: label.clone(), value: value.to_string() });
    label
  }

  /// Generate code for every fragment.
  pub fn compile(mut self, opts: &Options) -> Result<CompiledProgram, RegAllocError> {
    let mut procs = vec![];
    let mut strings = vec![];
    for frag in std::mem::take(&mut self.frags) {
      match frag {
        Frag::Proc { body, mut frame } => {
          let (proc, unallocated, result) =
            compile_proc(&mut frame, &body, &mut self.gen, opts)?;
          procs.push(CompiledProc {
            proc,
            unallocated,
            spilled: result.spilled,
            num_rounds: result.num_rounds,
          });
        }
        Frag::String { label, value } => strings.push((label, value)),
      }
    }
    Ok(CompiledProgram { procs, strings, regs: self.regs })
  }
}

impl Default for Compilation {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod test_interface {
  use super::*;
  use crate::tree::{self, BinOp};

  // A function with |n| values that are all live at once.
  fn pressure(comp: &mut Compilation, n: usize) -> (X64Frame, Vec<Stm>) {
    let frame = comp.new_frame("pressure", &[]);
    let ts: Vec<Temp> = (0..n).map(|_| comp.gen.new_temp()).collect();
    let mut body = vec![];
    for (i, t) in ts.iter().enumerate() {
      body.push(tree::mov(Exp::Temp(*t), Exp::Const(i as i32 + 1)));
    }
    let mut sum = Exp::Temp(ts[0]);
    for t in &ts[1..] {
      sum = tree::binop(BinOp::Plus, sum, Exp::Temp(*t));
    }
    let body = frame.proc_entry_exit1(body, Some(sum));
    (frame, body)
  }

  #[test]
  fn allocation_spills_under_pressure_and_checks() {
    let mut comp = Compilation::with_budget(3);
    let (mut frame, body) = pressure(&mut comp, 8);
    let opts = Options { run_checker: true, ..Options::default() };
    let (proc, _, result) =
      compile_proc(&mut frame, &body, &mut comp.gen, &opts).unwrap();
    assert!(!result.spilled.is_empty());
    assert!(result.num_rounds >= 2);
    assert!(proc.frame_size >= 8 * result.spilled.len() as i32);
    for instr in &proc.body {
      for t in instr.defs().iter().chain(instr.uses().iter()) {
        assert!(comp.regs().is_register(*t));
      }
      if let Instr::Move { src, dst, .. } = instr {
        assert_ne!(src, dst);
      }
    }
  }

  #[test]
  fn spilled_temps_never_come_back() {
    let mut comp = Compilation::with_budget(2);
    let (mut frame, body) = pressure(&mut comp, 6);
    let opts = Options { run_checker: true, ..Options::default() };
    let (_, unallocated, result) =
      compile_proc(&mut frame, &body, &mut comp.gen, &opts).unwrap();
    let mut seen = Set::empty();
    for t in &result.spilled {
      assert!(!seen.contains(*t), "{:?} spilled twice", t);
      seen.insert(*t);
    }
    for t in &result.spilled {
      assert!(!result.mapping.contains_key(t));
      assert!(unallocated.iter().any(|i| i.uses().contains(t) || i.defs().contains(t)));
    }
  }

  #[test]
  fn round_limit_is_reported() {
    let mut comp = Compilation::with_budget(1);
    let (mut frame, body) = pressure(&mut comp, 6);
    let opts = Options { run_checker: false, max_rounds: 1 };
    match compile_proc(&mut frame, &body, &mut comp.gen, &opts) {
      Err(RegAllocError::TooManySpillRounds(1)) => {}
      Err(e) => panic!("unexpected error {}", e),
      Ok(_) => panic!("expected the round limit to be hit"),
    }
  }

  #[test]
  fn undefined_labels_are_reported() {
    let mut comp = Compilation::new();
    let mut frame = comp.new_frame("broken", &[]);
    let nowhere = comp.gen.new_label();
    let body = vec![tree::jump(nowhere)];
    match compile_proc(&mut frame, &body, &mut comp.gen, &Options::default()) {
      Err(RegAllocError::Analysis(AnalysisError::UndefinedLabel { .. })) => {}
      _ => panic!("expected an analysis error"),
    }
  }

  #[test]
  fn whole_program_renders() {
    let mut comp = Compilation::new();
    let hello = comp.add_string("hello\n");
    let frame = comp.new_frame("tigermain", &[]);
    let print = comp.gen.named_label("print");
    let body = frame.proc_entry_exit1(
      vec![Stm::Exp(tree::call(print, vec![Exp::Name(hello.clone())]))],
      Some(Exp::Const(0)),
    );
    comp.add_proc(frame, body);
    let program = comp.compile(&Options { run_checker: true, ..Options::default() }).unwrap();
    let text = program.render();
    assert!(text.contains(".set tigermain_fs, 0"));
    assert!(text.contains("callq print"));
    assert!(text.contains(&format!("leaq {}(%rip), ", hello)));
    assert!(text.contains(".string \"hello\\n\""));
    assert!(program.find_proc("tigermain").is_some());
  }
}
