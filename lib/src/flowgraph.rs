/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Control flow graph over an instruction list, one node per instruction.

use log::debug;
use smallvec::SmallVec;

use crate::assem::{ControlFlow, Instr, TempVec};
use crate::data_structures::{InstIx, Label, Map, Temp, TypedIxVec};

//=============================================================================
// Analysis errors

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisError {
  /// A jump names a label that no instruction defines.
  UndefinedLabel { label: Label, at: InstIx },

  /// The same label is defined by two instructions.
  DuplicateLabel { label: Label, first: InstIx, second: InstIx },
}

impl ToString for AnalysisError {
  fn to_string(&self) -> String {
    match self {
      AnalysisError::UndefinedLabel { label, at } => {
        format!("jump at {:?} to undefined label {}", at, label)
      }
      AnalysisError::DuplicateLabel { label, first, second } => format!(
        "label {} defined twice, at {:?} and {:?}",
        label, first, second
      ),
    }
  }
}

//=============================================================================
// The flow graph

pub struct FlowGraph {
  succs: TypedIxVec<InstIx, SmallVec<[InstIx; 2]>>,
  preds: TypedIxVec<InstIx, SmallVec<[InstIx; 4]>>,
  defs: TypedIxVec<InstIx, TempVec>,
  uses: TypedIxVec<InstIx, TempVec>,
  is_move: TypedIxVec<InstIx, bool>,
}

impl FlowGraph {
  /// Build the graph: a fall-through edge from each instruction to the next
  /// unless the former is an unconditional jump, plus an edge from every jump
  /// to each of its targets.
  #[inline(never)]
  pub fn build(instrs: &[Instr]) -> Result<Self, AnalysisError> {
    debug!("");
    debug!("FlowGraph::build: begin ({} instrs)", instrs.len());
    let n = instrs.len() as u32;
    let mut succs = TypedIxVec::<InstIx, SmallVec<[InstIx; 2]>>::new();
    let mut preds = TypedIxVec::<InstIx, SmallVec<[InstIx; 4]>>::new();
    succs.resize(n, SmallVec::new());
    preds.resize(n, SmallVec::new());

    let mut defs = TypedIxVec::new();
    let mut uses = TypedIxVec::new();
    let mut is_move = TypedIxVec::new();
    let mut label_map = Map::<Label, InstIx>::default();

    for (i, instr) in instrs.iter().enumerate() {
      let iix = InstIx::new(i as u32);
      defs.push(TempVec::from_slice(instr.defs()));
      uses.push(TempVec::from_slice(instr.uses()));
      is_move.push(instr.is_move());
      if let Instr::Label { label, .. } = instr {
        if let Some(first) = label_map.insert(label.clone(), iix) {
          return Err(AnalysisError::DuplicateLabel {
            label: label.clone(),
            first,
            second: iix,
          });
        }
      }
      if i > 0 && instrs[i - 1].flow() != ControlFlow::Jump {
        add_edge(&mut succs, &mut preds, iix.minus(1), iix);
      }
    }

    for (i, instr) in instrs.iter().enumerate() {
      let iix = InstIx::new(i as u32);
      match instr.flow() {
        ControlFlow::Jump | ControlFlow::CondJump => {
          for target in instr.jump_targets() {
            match label_map.get(target) {
              Some(tix) => add_edge(&mut succs, &mut preds, iix, *tix),
              None => {
                return Err(AnalysisError::UndefinedLabel {
                  label: target.clone(),
                  at: iix,
                })
              }
            }
          }
        }
        ControlFlow::Fallthrough | ControlFlow::Call => {}
      }
    }

    debug!("FlowGraph::build: end");
    Ok(Self { succs, preds, defs, uses, is_move })
  }

  pub fn num_nodes(&self) -> u32 {
    self.defs.len()
  }
  pub fn succs(&self, iix: InstIx) -> &[InstIx] {
    &self.succs[iix]
  }
  pub fn preds(&self, iix: InstIx) -> &[InstIx] {
    &self.preds[iix]
  }
  pub fn defs(&self, iix: InstIx) -> &[Temp] {
    &self.defs[iix]
  }
  pub fn uses(&self, iix: InstIx) -> &[Temp] {
    &self.uses[iix]
  }
  pub fn is_move(&self, iix: InstIx) -> bool {
    self.is_move[iix]
  }

  /// Graphviz rendering, for debugging.
  pub fn to_dot(&self, instrs: &[Instr]) -> String {
    let mut res = "digraph flow {\n".to_string();
    for iix in InstIx::new(0).dotdot(InstIx::new(self.num_nodes())) {
      let text = format!("{:?}", instrs[iix.get() as usize]).replace('"', "'");
      res += &format!("  {:?} [label=\"{:?}: {}\"];\n", iix, iix, text.trim());
      for s in self.succs(iix) {
        res += &format!("  {:?} -> {:?};\n", iix, s);
      }
    }
    res + "}\n"
  }
}

fn add_edge(
  succs: &mut TypedIxVec<InstIx, SmallVec<[InstIx; 2]>>,
  preds: &mut TypedIxVec<InstIx, SmallVec<[InstIx; 4]>>, from: InstIx,
  to: InstIx,
) {
  if !succs[from].contains(&to) {
    succs[from].push(to);
    preds[to].push(from);
  }
}

#[cfg(test)]
mod test_flowgraph {
  use super::*;
  use crate::data_structures::TempGen;

  #[test]
  fn edges_follow_control_flow() {
    let mut gen = TempGen::new();
    let a = gen.new_temp();
    let top = gen.new_label();
    let out = gen.new_label();
    let instrs = vec![
      Instr::label(top.clone()),                             // 0
      Instr::oper("cmpq `s0, `s1".into(), &[], &[a, a]),     // 1
      Instr::cond_jump("je `j0".into(), vec![out.clone()]),  // 2
      Instr::oper("addq $1, `d0".into(), &[a], &[a]),        // 3
      Instr::jump("jmp `j0".into(), top),                    // 4
      Instr::label(out),                                     // 5
      Instr::mov(a, a),                                      // 6
    ];
    let g = FlowGraph::build(&instrs).unwrap();
    assert_eq!(g.num_nodes(), 7);
    assert_eq!(g.succs(InstIx::new(2)), &[InstIx::new(3), InstIx::new(5)]);
    assert_eq!(g.succs(InstIx::new(4)), &[InstIx::new(0)]);
    assert_eq!(g.preds(InstIx::new(5)), &[InstIx::new(2)]);
    assert_eq!(g.preds(InstIx::new(0)), &[InstIx::new(4)]);
    assert!(g.succs(InstIx::new(6)).is_empty());
    assert!(g.is_move(InstIx::new(6)));
    assert!(!g.is_move(InstIx::new(3)));
    assert!(g.defs(InstIx::new(0)).is_empty());
    assert!(g.to_dot(&instrs).contains("i4 -> i0"));
  }

  #[test]
  fn jump_to_next_is_a_single_edge() {
    let mut gen = TempGen::new();
    let l = gen.new_label();
    let instrs =
      vec![Instr::cond_jump("jne `j0".into(), vec![l.clone()]), Instr::label(l)];
    let g = FlowGraph::build(&instrs).unwrap();
    assert_eq!(g.succs(InstIx::new(0)), &[InstIx::new(1)]);
  }

  #[test]
  fn malformed_streams_are_rejected() {
    let mut gen = TempGen::new();
    let l = gen.new_label();
    let m = gen.new_label();
    let undefined = vec![Instr::jump("jmp `j0".into(), m.clone())];
    assert_eq!(
      FlowGraph::build(&undefined).err(),
      Some(AnalysisError::UndefinedLabel { label: m, at: InstIx::new(0) })
    );
    let twice = vec![Instr::label(l.clone()), Instr::label(l.clone())];
    match FlowGraph::build(&twice) {
      Err(e @ AnalysisError::DuplicateLabel { .. }) => {
        assert!(e.to_string().contains("defined twice"))
      }
      _ => panic!("duplicate label not detected"),
    }
  }
}
