/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies that a register assignment preserves the dataflow of the
//! temporary-based code it was computed for.
//!
//! The basic idea is that we track, for every machine register, the set of
//! temporaries whose current value it holds.  The analysis runs over the
//! instruction stream that was colored, reading each temporary through the
//! assignment, so a move whose source and destination got the same register
//! is just a move that copies a register onto itself.
//!
//!   - at function entry, each register r holds { r }
//!
//!   - a def of t into register R:      remove t everywhere; R := { t }
//!
//!   - a move t := s, with s in R_s:    remove t everywhere;
//!                                      R_t := R_s + { t }
//!
//!   - at a join point, the sets of each register are intersected
//!
//! Then every use of a temporary t, assigned to register R, must find t in
//! R's set.  Any failure means some other value overwrote t while it was
//! still needed, i.e. the assignment is wrong.
//!
//! Two temporaries sharing a register is fine as long as their values never
//! need to coexist, which is exactly what the check above observes.  The
//! checker does not look inside memory: spill slots are trusted.

use log::debug;

use std::fmt;

use crate::assem::Instr;
use crate::data_structures::{InstIx, Map, Set, Temp, TypedIxVec};
use crate::flowgraph::FlowGraph;
use crate::frame::Frame;
use crate::liveness::InterferenceGraph;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
  /// A temporary in the stream has no register.
  UnmappedTemp { temp: Temp },
  /// A temporary was mapped to something that is not a machine register.
  NotARegister { temp: Temp, reg: Temp },
  /// At |at|, |temp| is read from |reg|, which no longer holds it.
  MissingValue { at: InstIx, temp: Temp, reg: Temp },
  /// Two interfering temporaries share |reg|.
  ConflictingColors { a: Temp, b: Temp, reg: Temp },
}

/// A list of errors, all found in one checking pass.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

impl fmt::Display for CheckerErrors {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{} checker error(s):", self.errors.len())?;
    for e in &self.errors {
      write!(fmt, " {:?};", e)?;
    }
    Ok(())
  }
}

//=============================================================================
// Abstract state

/// For each register, the temporaries whose value it holds.  A register with
/// no entry holds nothing known.
#[derive(Clone, Debug)]
struct CheckerState {
  reg_values: Map<Temp, Set<Temp>>,
}

impl CheckerState {
  fn entry(regs: &[Temp]) -> Self {
    let mut reg_values = Map::default();
    for r in regs {
      reg_values.insert(*r, Set::unit(*r));
    }
    Self { reg_values }
  }

  /// Merge this checker state with another at a CFG join-point.
  fn meet_with(&mut self, other: &CheckerState) -> bool {
    let mut changed = false;
    let empty = Set::empty();
    for (r, vals) in self.reg_values.iter_mut() {
      let theirs = other.reg_values.get(r).unwrap_or(&empty);
      let before = vals.card();
      let kept: Vec<Temp> =
        vals.to_vec().into_iter().filter(|t| theirs.contains(*t)).collect();
      *vals = Set::from_vec(kept);
      changed |= vals.card() != before;
    }
    changed
  }

  fn holds(&self, reg: Temp, t: Temp) -> bool {
    match self.reg_values.get(&reg) {
      Some(vals) => vals.contains(t),
      None => false,
    }
  }

  fn forget(&mut self, t: Temp) {
    for vals in self.reg_values.values_mut() {
      vals.delete(t);
    }
  }

  fn process_def(&mut self, t: Temp, reg: Temp) {
    self.forget(t);
    self.reg_values.insert(reg, Set::unit(t));
  }

  fn process_move(&mut self, dst: Temp, dst_reg: Temp, src_reg: Temp) {
    let mut vals = match self.reg_values.get(&src_reg) {
      Some(vals) => vals.clone(),
      None => Set::empty(),
    };
    self.forget(dst);
    vals.delete(dst);
    vals.insert(dst);
    self.reg_values.insert(dst_reg, vals);
  }
}

//=============================================================================
// The checker

struct CheckerContext<'a, F: Frame> {
  frame: &'a F,
  mapping: &'a Map<Temp, Temp>,
}

impl<'a, F: Frame> CheckerContext<'a, F> {
  fn reg_of(&self, t: Temp) -> Option<Temp> {
    if self.frame.is_register(t) {
      Some(t)
    } else {
      self.mapping.get(&t).copied()
    }
  }

  fn transfer(&self, instr: &Instr, state: &mut CheckerState) {
    match instr {
      Instr::Label { .. } => {}
      Instr::Move { dst, src, .. } => {
        if let (Some(dr), Some(sr)) = (self.reg_of(*dst), self.reg_of(*src)) {
          state.process_move(*dst, dr, sr);
        }
      }
      Instr::Oper { dst, .. } => {
        for d in dst.iter() {
          if let Some(dr) = self.reg_of(*d) {
            state.process_def(*d, dr);
          }
        }
      }
    }
  }
}

/// Check that |mapping| is a sound register assignment for |instrs|.
#[inline(never)]
pub fn check_assignment<F: Frame>(
  instrs: &[Instr], mapping: &Map<Temp, Temp>, frame: &F,
) -> Result<(), CheckerErrors> {
  debug!("check_assignment: begin");
  let mut errors = vec![];

  // Everything must be mapped, and only to machine registers.  Coalescing
  // with a precolored temp can legitimately pick one outside the
  // allocatable set.
  let mut regs = Set::empty();
  for instr in instrs {
    for t in instr.defs().iter().chain(instr.uses().iter()) {
      if frame.is_register(*t) {
        regs.insert(*t);
        continue;
      }
      match mapping.get(t) {
        None => errors.push(CheckerError::UnmappedTemp { temp: *t }),
        Some(r) => {
          if !frame.is_register(*r) {
            errors.push(CheckerError::NotARegister { temp: *t, reg: *r });
          }
          regs.insert(*r);
        }
      }
    }
  }
  if !errors.is_empty() {
    errors.sort_by_key(|e| format!("{:?}", e));
    errors.dedup();
    return Err(CheckerErrors { errors });
  }

  let g = match FlowGraph::build(instrs) {
    Ok(g) => g,
    // The allocator never gets this far with a malformed stream.
    Err(e) => panic!("check_assignment: {}", e.to_string()),
  };
  let ctx = CheckerContext { frame, mapping };
  let n = g.num_nodes();

  // Forward dataflow to a fixpoint.  None means "not reached yet".
  let mut entry_states = TypedIxVec::<InstIx, Option<CheckerState>>::new();
  entry_states.resize(n, None);
  if n > 0 {
    entry_states[InstIx::new(0)] = Some(CheckerState::entry(&regs.to_vec()));
  }
  let mut work: Vec<InstIx> = (0..n).rev().map(InstIx::new).collect();
  let mut queued = vec![true; n as usize];
  while let Some(iix) = work.pop() {
    queued[iix.get() as usize] = false;
    let mut state = match &entry_states[iix] {
      Some(s) => s.clone(),
      None => continue,
    };
    ctx.transfer(&instrs[iix.get() as usize], &mut state);
    for s in g.succs(iix) {
      let changed = if let Some(existing) = entry_states[*s].as_mut() {
        existing.meet_with(&state)
      } else {
        entry_states[*s] = Some(state.clone());
        true
      };
      if changed && !queued[s.get() as usize] {
        queued[s.get() as usize] = true;
        work.push(*s);
      }
    }
  }

  for iix in InstIx::new(0).dotdot(InstIx::new(n)) {
    let state = match &entry_states[iix] {
      Some(s) => s,
      // Unreachable code.
      None => continue,
    };
    for u in g.uses(iix) {
      if let Some(r) = ctx.reg_of(*u) {
        if !state.holds(r, *u) {
          errors.push(CheckerError::MissingValue { at: iix, temp: *u, reg: r });
        }
      }
    }
  }

  debug!("check_assignment: end, {} errors", errors.len());
  if errors.is_empty() {
    Ok(())
  } else {
    Err(CheckerErrors { errors })
  }
}

/// Check that no two interfering nodes of |graph| share a register.
pub fn check_coloring<F: Frame>(
  graph: &InterferenceGraph, mapping: &Map<Temp, Temp>, frame: &F,
) -> Result<(), CheckerErrors> {
  let color_of = |t: Temp| {
    if frame.is_register(t) {
      Some(t)
    } else {
      mapping.get(&t).copied()
    }
  };
  let mut errors = vec![];
  for n in graph.nodes() {
    let a = graph.temp(n);
    let ca = match color_of(a) {
      Some(c) => c,
      None => {
        errors.push(CheckerError::UnmappedTemp { temp: a });
        continue;
      }
    };
    for m in graph.adjacent(n).to_vec() {
      let b = graph.temp(m);
      if n < m && color_of(b) == Some(ca) {
        errors.push(CheckerError::ConflictingColors { a, b, reg: ca });
      }
    }
  }
  if errors.is_empty() {
    Ok(())
  } else {
    Err(CheckerErrors { errors })
  }
}

#[cfg(test)]
mod test_checker {
  use super::*;
  use crate::data_structures::TempGen;
  use crate::frame::{X64Frame, X64Regs};
  use std::rc::Rc;

  fn setup() -> (TempGen, X64Frame) {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    let frame = X64Frame::new(gen.named_label("f"), &[], regs, &mut gen);
    (gen, frame)
  }

  #[test]
  fn accepts_shared_register_for_copies() {
    let (mut gen, frame) = setup();
    let rax = frame.return_value();
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::mov(b, a),
      Instr::oper("".into(), &[], &[a, b]),
    ];
    let mut mapping = Map::default();
    mapping.insert(a, rax);
    mapping.insert(b, rax);
    assert!(check_assignment(&instrs, &mapping, &frame).is_ok());
  }

  #[test]
  fn rejects_clobbered_value() {
    let (mut gen, frame) = setup();
    let rax = frame.return_value();
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::oper("movq $2, `d0".into(), &[b], &[]),
      Instr::oper("".into(), &[], &[a, b]),
    ];
    let mut mapping = Map::default();
    mapping.insert(a, rax);
    mapping.insert(b, rax);
    let errs = check_assignment(&instrs, &mapping, &frame).unwrap_err();
    assert_eq!(
      errs.errors,
      vec![CheckerError::MissingValue { at: InstIx::new(2), temp: a, reg: rax }]
    );
  }

  #[test]
  fn rejects_value_lost_on_one_path() {
    let (mut gen, frame) = setup();
    let rax = frame.return_value();
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let skip = gen.new_label();
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::cond_jump("je `j0".into(), vec![skip.clone()]),
      Instr::oper("movq $2, `d0".into(), &[b], &[]),
      Instr::label(skip),
      Instr::oper("".into(), &[], &[a]),
    ];
    let mut mapping = Map::default();
    mapping.insert(a, rax);
    mapping.insert(b, rax);
    assert!(check_assignment(&instrs, &mapping, &frame).is_err());
  }

  #[test]
  fn rejects_unmapped_temps() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let instrs = vec![Instr::oper("".into(), &[], &[a])];
    let errs = check_assignment(&instrs, &Map::default(), &frame).unwrap_err();
    assert_eq!(errs.errors, vec![CheckerError::UnmappedTemp { temp: a }]);
    assert!(errs.to_string().starts_with("1 checker error(s)"));
  }

  #[test]
  fn accepts_register_outside_allocatable_set() {
    let (mut gen, frame) = setup();
    let r14 = frame.callee_saved_registers()[0];
    assert!(!frame.allocatable_registers().contains(&r14));
    let a = gen.new_temp();
    let instrs = vec![Instr::mov(a, r14), Instr::mov(r14, a)];
    let mut mapping = Map::default();
    mapping.insert(a, r14);
    assert!(check_assignment(&instrs, &mapping, &frame).is_ok());
  }

  #[test]
  fn rejects_mapping_to_a_temp() {
    let (mut gen, frame) = setup();
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let instrs = vec![Instr::oper("".into(), &[], &[a])];
    let mut mapping = Map::default();
    mapping.insert(a, b);
    let errs = check_assignment(&instrs, &mapping, &frame).unwrap_err();
    assert_eq!(errs.errors, vec![CheckerError::NotARegister { temp: a, reg: b }]);
  }
}
