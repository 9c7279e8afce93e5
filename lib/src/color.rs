/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Iterated register coalescing: graph coloring with simplify, conservative
//! coalescing, freeze and optimistic spilling.
//!
//! The colorer works on a copy of the interference graph (the "working
//! graph") from which nodes are removed as they are simplified, spilled or
//! merged away.  The graph it was given stays untouched; select replays the
//! merges on a fresh copy of it, so every popped node sees all of its
//! original neighbors.
//!
//! Precolored nodes are never removed and never change color.  A coalesced
//! node's representative is found through the union-find alias map; a
//! precolored node is always the representative of any class it joins.

use log::{debug, log_enabled, trace, Level};

use crate::data_structures::{Map, NodeIx, Set, Temp, TypedIxVec};
use crate::frame::Frame;
use crate::liveness::{InterferenceGraph, MoveEdge};
use crate::trees_maps_sets::UnionFind;

/// Result of one coloring attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColorResult {
  /// Every temporary in the graph, mapped to a machine register.
  Colored(Map<Temp, Temp>),
  /// Temporaries that could not be colored.  Never empty.
  Spilled(Vec<Temp>),
}

struct Colorer<'a> {
  graph: &'a InterferenceGraph,
  allocatable: &'a [Temp],
  k: usize,

  // The working graph.
  adj: TypedIxVec<NodeIx, Set<NodeIx>>,
  present: TypedIxVec<NodeIx, bool>,

  moves: &'a mut [MoveEdge],
  aliases: UnionFind<NodeIx>,
  // (src, dst) in the order they happened.
  merges: Vec<(NodeIx, NodeIx)>,
  // Defs plus uses, summed over each class.
  occurrences: TypedIxVec<NodeIx, u32>,

  stack: Vec<NodeIx>,
}

impl<'a> Colorer<'a> {
  fn new(
    graph: &'a InterferenceGraph, moves: &'a mut [MoveEdge],
    allocatable: &'a [Temp],
  ) -> Self {
    let n = graph.num_nodes();
    let mut adj = TypedIxVec::new();
    let mut present = TypedIxVec::new();
    let mut occurrences = TypedIxVec::new();
    for nix in graph.nodes() {
      adj.push(graph.adjacent(nix).clone());
      present.push(true);
      occurrences.push(graph.occurrences(nix));
    }
    Self {
      graph,
      allocatable,
      k: allocatable.len(),
      adj,
      present,
      moves,
      aliases: UnionFind::new(n as usize),
      merges: vec![],
      occurrences,
      stack: vec![],
    }
  }

  fn degree(&self, n: NodeIx) -> usize {
    self.adj[n].card()
  }

  fn is_precolored(&self, n: NodeIx) -> bool {
    self.graph.is_precolored(n)
  }

  fn remove_node(&mut self, n: NodeIx) {
    for m in self.adj[n].to_vec() {
      self.adj[m].delete(n);
    }
    self.adj[n] = Set::empty();
    self.present[n] = false;
  }

  /// Representatives that are an endpoint of some active move.
  fn move_related(&mut self) -> Set<NodeIx> {
    let mut res = Set::empty();
    for i in 0..self.moves.len() {
      if self.moves[i].is_active() {
        let s = self.aliases.find(self.moves[i].src);
        let d = self.aliases.find(self.moves[i].dst);
        res.insert(s);
        res.insert(d);
      }
    }
    res
  }

  fn has_uncolored_nodes(&self) -> bool {
    self.graph.nodes().into_iter().any(|n| self.present[n] && !self.is_precolored(n))
  }

  //===========================================================================
  // Simplify

  fn simplify(&mut self) {
    loop {
      let related = self.move_related();
      let mut removed_any = false;
      for n in self.graph.nodes() {
        if !self.present[n]
          || self.is_precolored(n)
          || self.degree(n) >= self.k
          || related.contains(n)
        {
          continue;
        }
        trace!("simplify: push {:?} ({:?})", n, self.graph.temp(n));
        self.stack.push(n);
        self.remove_node(n);
        removed_any = true;
      }
      if !removed_any {
        break;
      }
    }
  }

  //===========================================================================
  // Coalesce

  /// Briggs: the merged node has fewer than K neighbors.
  fn briggs_ok(&self, a: NodeIx, b: NodeIx) -> bool {
    let mut union = self.adj[a].clone();
    union.union(&self.adj[b]);
    union.card() < self.k
  }

  /// George, for merging virtual |v| into precolored |p|: every neighbor of
  /// |v| is precolored, already a neighbor of |p|, or of low degree.
  fn george_ok(&self, v: NodeIx, p: NodeIx) -> bool {
    self.adj[v].iter().all(|t| {
      self.is_precolored(*t) || self.degree(*t) < self.k || self.adj[*t].contains(p)
    })
  }

  fn merge(&mut self, src: NodeIx, dst: NodeIx) {
    debug!(
      "coalesce: {:?} ({:?}) into {:?} ({:?})",
      src,
      self.graph.temp(src),
      dst,
      self.graph.temp(dst)
    );
    for t in self.adj[src].to_vec() {
      if t == dst || (self.is_precolored(t) && self.is_precolored(dst)) {
        continue;
      }
      self.adj[t].insert(dst);
      self.adj[dst].insert(t);
    }
    self.remove_node(src);
    self.aliases.union_into(src, dst);
    self.merges.push((src, dst));
    let extra = self.occurrences[src];
    self.occurrences[dst] += extra;
  }

  /// Try each active move once.  Returns true if some node was merged.
  fn coalesce(&mut self) -> bool {
    for i in 0..self.moves.len() {
      if !self.moves[i].is_active() {
        continue;
      }
      let s = self.aliases.find(self.moves[i].src);
      let d = self.aliases.find(self.moves[i].dst);
      if s == d {
        self.moves[i].valid = false;
        continue;
      }
      if self.adj[s].contains(d) {
        continue;
      }
      let (s_pre, d_pre) = (self.is_precolored(s), self.is_precolored(d));
      if s_pre && d_pre {
        continue;
      }
      let (src, dst) = if s_pre {
        (d, s)
      } else if d_pre {
        (s, d)
      } else if self.graph.temp(s) > self.graph.temp(d) {
        (s, d)
      } else {
        (d, s)
      };
      let ok = if self.is_precolored(dst) {
        self.george_ok(src, dst)
      } else {
        self.briggs_ok(src, dst)
      };
      if ok {
        self.merge(src, dst);
        self.moves[i].valid = false;
        return true;
      }
    }
    false
  }

  //===========================================================================
  // Freeze

  fn freeze(&mut self) -> bool {
    let mut best: Option<(usize, usize)> = None;
    for i in 0..self.moves.len() {
      if !self.moves[i].is_active() {
        continue;
      }
      let s = self.aliases.find(self.moves[i].src);
      let d = self.aliases.find(self.moves[i].dst);
      let sum = self.degree(s) + self.degree(d);
      match best {
        Some((_, best_sum)) if best_sum <= sum => {}
        _ => best = Some((i, sum)),
      }
    }
    let i = match best {
      None => return false,
      Some((i, _)) => i,
    };
    let s = self.aliases.find(self.moves[i].src);
    let d = self.aliases.find(self.moves[i].dst);
    trace!("freeze: move {:?} -> {:?}", self.moves[i].src, self.moves[i].dst);
    self.moves[i].frozen = true;
    // And the same move in the other direction, if there is one.
    for j in 0..self.moves.len() {
      if !self.moves[j].is_active() {
        continue;
      }
      let s2 = self.aliases.find(self.moves[j].src);
      let d2 = self.aliases.find(self.moves[j].dst);
      if s2 == d && d2 == s {
        self.moves[j].frozen = true;
      }
    }
    true
  }

  //===========================================================================
  // Potential spill

  fn potential_spill(&mut self) -> bool {
    let related = self.move_related();
    let mut best: Option<NodeIx> = None;
    for n in self.graph.nodes() {
      if !self.present[n]
        || self.is_precolored(n)
        || related.contains(n)
        || self.degree(n) == 0
      {
        continue;
      }
      best = match best {
        None => Some(n),
        Some(b) => {
          // occ(n)/deg(n) < occ(b)/deg(b), without division.
          let lhs = self.occurrences[n] as u64 * self.degree(b) as u64;
          let rhs = self.occurrences[b] as u64 * self.degree(n) as u64;
          if lhs < rhs {
            Some(n)
          } else {
            Some(b)
          }
        }
      };
    }
    match best {
      None => false,
      Some(n) => {
        debug!("potential spill: {:?} ({:?})", n, self.graph.temp(n));
        self.stack.push(n);
        self.remove_node(n);
        true
      }
    }
  }

  //===========================================================================
  // Select

  fn select(&mut self) -> ColorResult {
    let mut sel_adj = TypedIxVec::<NodeIx, Set<NodeIx>>::new();
    for n in self.graph.nodes() {
      sel_adj.push(self.graph.adjacent(n).clone());
    }
    for (src, dst) in self.merges.iter() {
      for t in sel_adj[*src].to_vec() {
        if t != *dst {
          sel_adj[t].insert(*dst);
          sel_adj[*dst].insert(t);
        }
      }
    }

    let mut colors = TypedIxVec::<NodeIx, Option<Temp>>::new();
    for n in self.graph.nodes() {
      if self.is_precolored(n) {
        colors.push(Some(self.graph.temp(n)));
      } else {
        colors.push(None);
      }
    }

    let mut spilled = vec![];
    let mut spilled_nodes = Set::<NodeIx>::empty();
    while let Some(n) = self.stack.pop() {
      let mut ok: Vec<Temp> = self.allocatable.to_vec();
      for t in sel_adj[n].iter() {
        let r = self.aliases.find(*t);
        if let Some(c) = colors[r] {
          ok.retain(|reg| *reg != c);
        }
      }
      if ok.is_empty() {
        debug!("select: actual spill {:?} ({:?})", n, self.graph.temp(n));
        spilled.push(self.graph.temp(n));
        spilled_nodes.insert(n);
      } else {
        trace!("select: {:?} gets {:?}", n, ok[0]);
        colors[n] = Some(ok[0]);
      }
    }

    // Every representative must have ended up colored or spilled.
    for n in self.graph.nodes() {
      let r = self.aliases.find(n);
      if colors[r].is_none() && !spilled_nodes.contains(r) {
        panic!(
          "select: {:?} ({:?}) was neither colored nor spilled",
          r,
          self.graph.temp(r)
        );
      }
    }

    if !spilled.is_empty() {
      spilled.sort_unstable();
      return ColorResult::Spilled(spilled);
    }
    let mut mapping = Map::default();
    for n in self.graph.nodes() {
      let r = self.aliases.find(n);
      if let Some(c) = colors[r] {
        mapping.insert(self.graph.temp(n), c);
      }
    }
    ColorResult::Colored(mapping)
  }

  fn run(&mut self) -> ColorResult {
    while self.has_uncolored_nodes() {
      self.simplify();
      if self.coalesce() {
        continue;
      }
      if self.freeze() {
        continue;
      }
      if self.potential_spill() {
        continue;
      }
      if self.has_uncolored_nodes() {
        panic!("color: no transition applies, but nodes remain");
      }
    }
    debug!(
      "color: {} merges, {} nodes on the stack",
      self.aliases.num_merges(),
      self.stack.len()
    );
    self.select()
  }
}

/// Color |graph| with the frame's allocatable registers.  The move list is
/// updated in place: coalesced moves become invalid, given-up ones frozen.
#[inline(never)]
pub fn color<F: Frame>(
  graph: &InterferenceGraph, moves: &mut [MoveEdge], frame: &F,
) -> ColorResult {
  debug!("");
  debug!(
    "color: begin, {} nodes, {} moves, K = {}",
    graph.num_nodes(),
    moves.len(),
    frame.allocatable_registers().len()
  );
  let mut colorer = Colorer::new(graph, moves, frame.allocatable_registers());
  let result = colorer.run();
  if log_enabled!(Level::Debug) {
    match &result {
      ColorResult::Spilled(ts) => debug!("color: end, spilling {:?}", ts),
      ColorResult::Colored(m) => debug!("color: end, {} temps colored", m.len()),
    }
  }
  result
}

#[cfg(test)]
mod test_color {
  use super::*;
  use crate::assem::Instr;
  use crate::data_structures::TempGen;
  use crate::flowgraph::FlowGraph;
  use crate::frame::{X64Frame, X64Regs};
  use crate::liveness::compute_liveness;
  use std::rc::Rc;

  fn setup(budget: usize) -> (TempGen, X64Frame) {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::with_budget(&mut gen, budget));
    let frame = X64Frame::new(gen.named_label("f"), &[], regs, &mut gen);
    (gen, frame)
  }

  fn analyze(
    instrs: &[Instr], frame: &X64Frame,
  ) -> (InterferenceGraph, Vec<MoveEdge>) {
    let g = FlowGraph::build(instrs).unwrap();
    let live = compute_liveness(&g);
    InterferenceGraph::build(&g, &live, frame)
  }

  fn def(t: Temp) -> Instr {
    Instr::oper("movq $1, `d0".into(), &[t], &[])
  }
  fn use_all(ts: &[Temp]) -> Instr {
    Instr::oper("".into(), &[], ts)
  }

  fn check_valid(ig: &InterferenceGraph, mapping: &Map<Temp, Temp>, frame: &X64Frame) {
    let color_of = |t: Temp| if frame.is_register(t) { t } else { mapping[&t] };
    for n in ig.nodes() {
      for m in ig.adjacent(n).iter() {
        assert_ne!(color_of(ig.temp(n)), color_of(ig.temp(*m)));
      }
    }
  }

  #[test]
  fn triangle_with_two_colors_spills() {
    let (mut gen, frame) = setup(2);
    let (a, b, c) = (gen.new_temp(), gen.new_temp(), gen.new_temp());
    let instrs = vec![def(a), def(b), def(c), use_all(&[a, b, c])];
    let (ig, mut moves) = analyze(&instrs, &frame);
    match color(&ig, &mut moves, &frame) {
      ColorResult::Spilled(ts) => {
        assert!(!ts.is_empty());
        assert!(ts.iter().all(|t| [a, b, c].contains(t)));
      }
      other => panic!("expected a spill, got {:?}", other),
    }
  }

  #[test]
  fn triangle_with_three_colors_fits() {
    let (mut gen, frame) = setup(3);
    let (a, b, c) = (gen.new_temp(), gen.new_temp(), gen.new_temp());
    let instrs = vec![def(a), def(b), def(c), use_all(&[a, b, c])];
    let (ig, mut moves) = analyze(&instrs, &frame);
    match color(&ig, &mut moves, &frame) {
      ColorResult::Colored(m) => check_valid(&ig, &m, &frame),
      other => panic!("expected a coloring, got {:?}", other),
    }
  }

  #[test]
  fn move_related_pair_is_coalesced() {
    let (mut gen, frame) = setup(9);
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let instrs = vec![def(a), Instr::mov(b, a), use_all(&[b])];
    let (ig, mut moves) = analyze(&instrs, &frame);
    assert_eq!(moves.len(), 1);
    match color(&ig, &mut moves, &frame) {
      ColorResult::Colored(m) => {
        assert_eq!(m[&a], m[&b]);
        assert!(!moves[0].valid);
      }
      other => panic!("expected a coloring, got {:?}", other),
    }
  }

  #[test]
  fn interfering_move_is_not_coalesced() {
    let (mut gen, frame) = setup(9);
    let (a, b) = (gen.new_temp(), gen.new_temp());
    // b := a, then a is redefined while b is still live.
    let instrs = vec![
      def(a),
      Instr::mov(b, a),
      Instr::oper("addq $1, `d0".into(), &[a], &[a]),
      use_all(&[a, b]),
    ];
    let (ig, mut moves) = analyze(&instrs, &frame);
    let (na, nb) = (ig.node(a).unwrap(), ig.node(b).unwrap());
    assert!(ig.interferes(na, nb));
    match color(&ig, &mut moves, &frame) {
      ColorResult::Colored(m) => {
        assert_ne!(m[&a], m[&b]);
        check_valid(&ig, &m, &frame);
        assert!(moves[0].valid && moves[0].frozen);
      }
      other => panic!("expected a coloring, got {:?}", other),
    }
  }

  #[test]
  fn move_into_register_coalesces_with_it() {
    let (mut gen, frame) = setup(9);
    let rax = frame.return_value();
    let a = gen.new_temp();
    let instrs = vec![def(a), Instr::mov(rax, a), use_all(&[rax])];
    let (ig, mut moves) = analyze(&instrs, &frame);
    match color(&ig, &mut moves, &frame) {
      ColorResult::Colored(m) => {
        assert_eq!(m[&a], rax);
        assert_eq!(m[&rax], rax);
      }
      other => panic!("expected a coloring, got {:?}", other),
    }
  }

  #[test]
  fn registers_live_across_a_call_are_avoided() {
    let (mut gen, frame) = setup(9);
    let a = gen.new_temp();
    let clobbers = frame.caller_saved_registers().to_vec();
    let instrs = vec![
      def(a),
      Instr::call("callq g".into(), &clobbers, &[]),
      use_all(&[a]),
    ];
    let (ig, mut moves) = analyze(&instrs, &frame);
    match color(&ig, &mut moves, &frame) {
      ColorResult::Colored(m) => {
        assert!(!clobbers.contains(&m[&a]));
        check_valid(&ig, &m, &frame);
      }
      other => panic!("expected a coloring, got {:?}", other),
    }
  }

  #[test]
  fn many_temps_color_validly() {
    let (mut gen, frame) = setup(4);
    let ts: Vec<Temp> = (0..12).map(|_| gen.new_temp()).collect();
    let mut instrs = vec![];
    // A sliding window of three live temps, plus some moves between them.
    for i in 0..ts.len() {
      instrs.push(def(ts[i]));
      if i >= 3 {
        instrs.push(use_all(&[ts[i - 3]]));
      }
      if i >= 1 && i % 3 == 0 {
        instrs.push(Instr::mov(ts[i - 1], ts[i]));
      }
    }
    instrs.push(use_all(&ts[ts.len() - 3..]));
    let (ig, mut moves) = analyze(&instrs, &frame);
    match color(&ig, &mut moves, &frame) {
      ColorResult::Colored(m) => check_valid(&ig, &m, &frame),
      ColorResult::Spilled(ts) => assert!(!ts.is_empty()),
    }
  }
}
