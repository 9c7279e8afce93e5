/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Liveness analysis over the flow graph, and construction of the
//! interference graph and move list from its results.

use log::{debug, log_enabled, Level};

use crate::data_structures::{
  InstIx, Map, NodeIx, Set, Temp, TypedIxVec,
};
use crate::flowgraph::FlowGraph;
use crate::frame::Frame;

//=============================================================================
// Computation of live-in and live-out sets

pub struct Liveness {
  pub live_in: TypedIxVec<InstIx, Set<Temp>>,
  pub live_out: TypedIxVec<InstIx, Set<Temp>>,
  /// How many passes over the graph changed at least one set.
  pub num_changing_passes: u32,
}

/// Iterate to the fixpoint of
///
///   in[n]  = use[n] + (out[n] - def[n])
///   out[n] = union of in[s] over successors s
///
/// Nodes are visited last to first, so a graph without back edges settles in
/// a single changing pass.
#[inline(never)]
pub fn compute_liveness(g: &FlowGraph) -> Liveness {
  debug!("");
  debug!("compute_liveness: begin");
  let n = g.num_nodes();
  let empty = Set::<Temp>::empty();
  let mut live_in = TypedIxVec::<InstIx, Set<Temp>>::new();
  let mut live_out = TypedIxVec::<InstIx, Set<Temp>>::new();
  live_in.resize(n, empty.clone());
  live_out.resize(n, empty);

  let mut num_changing_passes = 0;
  loop {
    let mut changed = false;
    for i in (0..n).rev() {
      let iix = InstIx::new(i);
      let old_card = live_in[iix].card();
      for u in g.uses(iix) {
        live_in[iix].insert(*u);
      }
      let mut through = live_out[iix].clone();
      for d in g.defs(iix) {
        through.delete(*d);
      }
      live_in[iix].union(&through);
      if live_in[iix].card() != old_card {
        changed = true;
      }
      // Sets only grow, so comparing cardinalities is enough.
      for p in g.preds(iix) {
        let old_card = live_out[*p].card();
        let new_in = live_in[iix].clone();
        live_out[*p].union(&new_in);
        if live_out[*p].card() != old_card {
          changed = true;
        }
      }
    }
    if !changed {
      break;
    }
    num_changing_passes += 1;
  }

  debug!("compute_liveness: end, {} changing passes", num_changing_passes);
  Liveness { live_in, live_out, num_changing_passes }
}

//=============================================================================
// Interference graph

/// A move instruction between two graph nodes, as seen by the colorer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveEdge {
  pub src: NodeIx,
  pub dst: NodeIx,
  /// Cleared once the move has been coalesced or found redundant.
  pub valid: bool,
  /// Set once the colorer has given up on coalescing it.
  pub frozen: bool,
}

impl MoveEdge {
  pub fn is_active(&self) -> bool {
    self.valid && !self.frozen
  }
}

#[derive(Clone)]
pub struct InterferenceGraph {
  temps: TypedIxVec<NodeIx, Temp>,
  node_of: Map<Temp, NodeIx>,
  precolored: TypedIxVec<NodeIx, bool>,
  adj: TypedIxVec<NodeIx, Set<NodeIx>>,
  // Number of defs plus uses of each node's temporary.
  occurrences: TypedIxVec<NodeIx, u32>,
}

impl InterferenceGraph {
  /// Build the graph from liveness results.  Every temporary defined or used
  /// somewhere gets a node, except the stack pointer.  Machine registers are
  /// precolored, and precolored nodes never get edges between themselves.
  #[inline(never)]
  pub fn build<F: Frame>(
    g: &FlowGraph, live: &Liveness, frame: &F,
  ) -> (InterferenceGraph, Vec<MoveEdge>) {
    debug!("");
    debug!("InterferenceGraph::build: begin");
    let sp = frame.stack_pointer();
    let mut ig = InterferenceGraph {
      temps: TypedIxVec::new(),
      node_of: Map::default(),
      precolored: TypedIxVec::new(),
      adj: TypedIxVec::new(),
      occurrences: TypedIxVec::new(),
    };

    // Nodes, in order of first appearance.
    for iix in InstIx::new(0).dotdot(InstIx::new(g.num_nodes())) {
      for t in g.defs(iix).iter().chain(g.uses(iix).iter()) {
        if *t == sp {
          continue;
        }
        let nix = ig.add_node(*t, frame.is_register(*t));
        ig.occurrences[nix] += 1;
      }
    }

    let mut moves = vec![];
    for iix in InstIx::new(0).dotdot(InstIx::new(g.num_nodes())) {
      let move_src = if g.is_move(iix) { Some(g.uses(iix)[0]) } else { None };
      for d in g.defs(iix) {
        if *d == sp {
          continue;
        }
        let dn = ig.node_of[d];
        for t in live.live_out[iix].iter() {
          if *t == *d || *t == sp || Some(*t) == move_src {
            continue;
          }
          let tn = ig.node_of[t];
          ig.add_edge(dn, tn);
        }
      }
      if let Some(s) = move_src {
        let d = g.defs(iix)[0];
        if s != sp && d != sp {
          moves.push(MoveEdge {
            src: ig.node_of[&s],
            dst: ig.node_of[&d],
            valid: true,
            frozen: false,
          });
        }
      }
    }

    if log_enabled!(Level::Debug) {
      debug!(
        "InterferenceGraph::build: {} nodes, {} moves",
        ig.num_nodes(),
        moves.len()
      );
      for n in ig.nodes() {
        debug!("  {:?} {:?} -- {:?}", n, ig.temp(n), ig.adj[n]);
      }
    }
    debug!("InterferenceGraph::build: end");
    (ig, moves)
  }

  fn add_node(&mut self, t: Temp, precolored: bool) -> NodeIx {
    if let Some(n) = self.node_of.get(&t) {
      return *n;
    }
    let n = NodeIx::new(self.temps.len());
    self.temps.push(t);
    self.precolored.push(precolored);
    self.adj.push(Set::empty());
    self.occurrences.push(0);
    self.node_of.insert(t, n);
    n
  }

  fn add_edge(&mut self, a: NodeIx, b: NodeIx) {
    if a == b || (self.precolored[a] && self.precolored[b]) {
      return;
    }
    self.adj[a].insert(b);
    self.adj[b].insert(a);
  }

  pub fn num_nodes(&self) -> u32 {
    self.temps.len()
  }
  pub fn nodes(&self) -> crate::data_structures::Range<NodeIx> {
    NodeIx::new(0).dotdot(NodeIx::new(self.num_nodes()))
  }
  pub fn temp(&self, n: NodeIx) -> Temp {
    self.temps[n]
  }
  pub fn node(&self, t: Temp) -> Option<NodeIx> {
    self.node_of.get(&t).copied()
  }
  pub fn is_precolored(&self, n: NodeIx) -> bool {
    self.precolored[n]
  }
  pub fn adjacent(&self, n: NodeIx) -> &Set<NodeIx> {
    &self.adj[n]
  }
  pub fn degree(&self, n: NodeIx) -> usize {
    self.adj[n].card()
  }
  pub fn interferes(&self, a: NodeIx, b: NodeIx) -> bool {
    self.adj[a].contains(b)
  }
  pub fn occurrences(&self, n: NodeIx) -> u32 {
    self.occurrences[n]
  }

  /// Graphviz rendering, for debugging.  Moves are drawn dashed.
  pub fn to_dot(&self, moves: &[MoveEdge]) -> String {
    let mut res = "graph interference {\n".to_string();
    for n in self.nodes() {
      let shape = if self.precolored[n] { "box" } else { "ellipse" };
      res += &format!("  {:?} [label=\"{:?}\" shape={}];\n", n, self.temps[n], shape);
      for m in self.adj[n].to_vec() {
        if n < m {
          res += &format!("  {:?} -- {:?};\n", n, m);
        }
      }
    }
    for mv in moves {
      res += &format!("  {:?} -- {:?} [style=dashed];\n", mv.src, mv.dst);
    }
    res + "}\n"
  }
}

#[cfg(test)]
mod test_liveness {
  use super::*;
  use crate::assem::Instr;
  use crate::data_structures::TempGen;
  use crate::frame::{X64Frame, X64Regs};
  use std::rc::Rc;

  fn setup() -> (TempGen, X64Frame) {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    let frame = X64Frame::new(gen.named_label("f"), &[], regs, &mut gen);
    (gen, frame)
  }

  fn check_sound(g: &FlowGraph, live: &Liveness) {
    for iix in InstIx::new(0).dotdot(InstIx::new(g.num_nodes())) {
      for u in g.uses(iix) {
        assert!(live.live_in[iix].contains(*u));
      }
      let mut out = Set::empty();
      for s in g.succs(iix) {
        out.union(&live.live_in[*s]);
      }
      assert!(out.equals(&live.live_out[iix]));
      let mut expect_in = live.live_out[iix].clone();
      for d in g.defs(iix) {
        expect_in.delete(*d);
      }
      for u in g.uses(iix) {
        expect_in.insert(*u);
      }
      assert!(expect_in.equals(&live.live_in[iix]));
    }
  }

  #[test]
  fn straight_line_converges_in_one_pass() {
    let (mut gen, _frame) = setup();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let c = gen.new_temp();
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::oper("movq $2, `d0".into(), &[b], &[]),
      Instr::mov(c, a),
      Instr::oper("addq `s0, `d0".into(), &[c], &[b, c]),
      Instr::oper("".into(), &[], &[c]),
    ];
    let g = FlowGraph::build(&instrs).unwrap();
    let live = compute_liveness(&g);
    assert_eq!(live.num_changing_passes, 1);
    check_sound(&g, &live);
    assert!(live.live_in[InstIx::new(0)].is_empty());
    assert_eq!(live.live_out[InstIx::new(1)].to_vec(), vec![a, b]);
  }

  #[test]
  fn loops_need_more_passes_and_stay_sound() {
    let (mut gen, _frame) = setup();
    let i = gen.new_temp();
    let s = gen.new_temp();
    let top = gen.new_label();
    let done = gen.new_label();
    let instrs = vec![
      Instr::oper("movq $0, `d0".into(), &[s], &[]),
      Instr::label(top.clone()),
      Instr::oper("cmpq `s0, `s1".into(), &[], &[i, s]),
      Instr::cond_jump("je `j0".into(), vec![done.clone()]),
      Instr::oper("addq `s0, `d0".into(), &[s], &[i, s]),
      Instr::jump("jmp `j0".into(), top),
      Instr::label(done),
      Instr::oper("".into(), &[], &[s]),
    ];
    let g = FlowGraph::build(&instrs).unwrap();
    let live = compute_liveness(&g);
    assert!(live.num_changing_passes >= 1);
    check_sound(&g, &live);
    // i is live around the whole loop, and at entry.
    assert!(live.live_in[InstIx::new(0)].contains(i));
    assert!(live.live_out[InstIx::new(5)].contains(i));
  }

  #[test]
  fn interference_is_symmetric_and_skips_move_source() {
    let (mut gen, frame) = setup();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let c = gen.new_temp();
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::mov(b, a),
      Instr::oper("movq $2, `d0".into(), &[c], &[]),
      Instr::oper("".into(), &[], &[a, b, c]),
    ];
    let g = FlowGraph::build(&instrs).unwrap();
    let live = compute_liveness(&g);
    let (ig, moves) = InterferenceGraph::build(&g, &live, &frame);
    let (na, nb, nc) = (ig.node(a).unwrap(), ig.node(b).unwrap(), ig.node(c).unwrap());
    // b := a does not make them interfere, but both are live across c's def.
    assert!(!ig.interferes(na, nb));
    assert!(ig.interferes(nc, na) && ig.interferes(na, nc));
    assert!(ig.interferes(nc, nb) && ig.interferes(nb, nc));
    for n in ig.nodes() {
      for m in ig.adjacent(n).iter() {
        assert!(ig.adjacent(*m).contains(n));
      }
    }
    assert_eq!(moves, vec![MoveEdge { src: na, dst: nb, valid: true, frozen: false }]);
    assert_eq!(ig.occurrences(na), 3);
  }

  #[test]
  fn stack_pointer_and_register_pairs_are_excluded() {
    let (mut gen, frame) = setup();
    let sp = frame.stack_pointer();
    let rax = frame.return_value();
    let (_, rdx) = frame.division_registers();
    let a = gen.new_temp();
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[rdx], &[]),
      Instr::oper("movq (`s0), `d0".into(), &[a], &[sp]),
      Instr::oper("movq $2, `d0".into(), &[rax], &[]),
      Instr::oper("".into(), &[], &[rax, rdx, a, sp]),
    ];
    let g = FlowGraph::build(&instrs).unwrap();
    let live = compute_liveness(&g);
    let (ig, _) = InterferenceGraph::build(&g, &live, &frame);
    assert!(ig.node(sp).is_none());
    let (nrax, nrdx, na) =
      (ig.node(rax).unwrap(), ig.node(rdx).unwrap(), ig.node(a).unwrap());
    assert!(ig.is_precolored(nrax) && !ig.is_precolored(na));
    assert!(!ig.interferes(nrax, nrdx));
    assert!(ig.interferes(nrax, na));
    assert!(ig.interferes(nrdx, na));
  }
}
