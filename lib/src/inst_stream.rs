/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Edits to the instruction stream made by the allocator: spill code
//! insertion between coloring rounds, and the final register substitution
//! with removal of moves that became no-ops.

use log::{debug, trace};
use smallvec::SmallVec;

use crate::assem::Instr;
use crate::data_structures::{Map, Set, Temp, TempGen};
use crate::frame::{Access, Frame};
use crate::interface::RegAllocError;

//=============================================================================
// Spill rewriting

/// Give each of |spilled| a frame slot (reusing the one from an earlier
/// round, if any), then reload it into a scratch register before every use
/// and store it back after every def.  The spilled temporaries disappear from
/// the stream entirely; only machine registers replace them.
///
/// Slots are addressed from the stack pointer, so spill code placed while
/// call arguments are pushed is offset by the bytes outstanding at that
/// point.
#[inline(never)]
pub(crate) fn rewrite_spills<F: Frame>(
  instrs: Vec<Instr>, spilled: &[Temp], slots: &mut Map<Temp, i32>,
  frame: &mut F, gen: &mut TempGen,
) -> Result<Vec<Instr>, RegAllocError> {
  debug!("rewrite_spills: begin, spilling {:?}", spilled);
  let word = frame.word_size();
  let mut spilled_set = Set::empty();
  for t in spilled {
    spilled_set.insert(*t);
    if !slots.contains_key(t) {
      let offset = match frame.allocate_slot(word, true, gen) {
        Access::InFrame(offset) => offset,
        Access::InReg(r) => panic!("rewrite_spills: slot for {:?} got {:?}", t, r),
      };
      slots.insert(*t, offset);
    }
  }

  let (src_scratch, dst_scratch) = frame.spill_scratch_registers();
  let src_scratch: SmallVec<[Temp; 4]> = SmallVec::from_slice(src_scratch);

  let mut res = Vec::with_capacity(instrs.len());
  let mut num_reloads = 0;
  let mut num_spills = 0;
  let mut pushed = 0;
  for mut instr in instrs {
    let pushed_before = pushed;
    pushed += instr.stack_delta();
    let mut spilled_defs: SmallVec<[Temp; 2]> = SmallVec::new();
    for d in instr.defs() {
      if spilled_set.contains(*d) && !spilled_defs.contains(d) {
        spilled_defs.push(*d);
      }
    }
    let mut spilled_uses: SmallVec<[Temp; 4]> = SmallVec::new();
    for u in instr.uses() {
      if spilled_set.contains(*u) && !spilled_uses.contains(u) {
        spilled_uses.push(*u);
      }
    }
    if spilled_defs.is_empty() && spilled_uses.is_empty() {
      res.push(instr);
      continue;
    }
    if spilled_defs.len() > 1 {
      return Err(RegAllocError::OutOfScratchRegisters(format!("{:?}", instr)));
    }

    let mut scratch_of = Map::<Temp, Temp>::default();
    for d in &spilled_defs {
      scratch_of.insert(*d, dst_scratch);
    }
    let mut next_src = 0;
    for u in &spilled_uses {
      if scratch_of.contains_key(u) {
        // Used and defined by the same instruction: load into the def's
        // scratch, so the store after picks up the result.
        continue;
      }
      if next_src >= src_scratch.len() {
        return Err(RegAllocError::OutOfScratchRegisters(format!("{:?}", instr)));
      }
      scratch_of.insert(*u, src_scratch[next_src]);
      next_src += 1;
    }

    for u in &spilled_uses {
      res.push(frame.gen_reload(slots[u] + pushed_before, scratch_of[u]));
      num_reloads += 1;
    }
    trace!("rewrite_spills: {:?}", instr);
    instr.map_temps(|t| scratch_of.get(&t).copied().unwrap_or(t));
    res.push(instr);
    for d in &spilled_defs {
      res.push(frame.gen_spill(scratch_of[d], slots[d] + pushed));
      num_spills += 1;
    }
  }

  debug!(
    "rewrite_spills: end, {} reloads, {} spills, frame size {}",
    num_reloads,
    num_spills,
    frame.size()
  );
  Ok(res)
}

//=============================================================================
// Final substitution

/// Replace every temporary by its register, then drop the moves whose source
/// and destination ended up the same.  Returns the new stream and the number
/// of moves removed.
#[inline(never)]
pub(crate) fn apply_mapping(
  instrs: Vec<Instr>, mapping: &Map<Temp, Temp>,
) -> (Vec<Instr>, usize) {
  let mut res = Vec::with_capacity(instrs.len());
  let mut num_removed = 0;
  for mut instr in instrs {
    instr.map_temps(|t| mapping.get(&t).copied().unwrap_or(t));
    if let Instr::Move { src, dst, .. } = &instr {
      if src == dst {
        num_removed += 1;
        continue;
      }
    }
    res.push(instr);
  }
  debug!("apply_mapping: removed {} redundant moves", num_removed);
  (res, num_removed)
}

#[cfg(test)]
mod test_inst_stream {
  use super::*;
  use crate::frame::{X64Frame, X64Regs};
  use std::rc::Rc;

  fn setup() -> (TempGen, X64Frame) {
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::new(&mut gen));
    let frame = X64Frame::new(gen.named_label("f"), &[], regs, &mut gen);
    (gen, frame)
  }

  #[test]
  fn spilled_temps_are_reloaded_and_stored() {
    let (mut gen, mut frame) = setup();
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::oper("addq `s0, `d0".into(), &[b], &[a, b]),
    ];
    let mut slots = Map::default();
    let out =
      rewrite_spills(instrs, &[a, b], &mut slots, &mut frame, &mut gen).unwrap();
    let (src_scratch, dst_scratch) = frame.spill_scratch_registers();
    // def a; store a; reload a; reload b; add; store b
    assert_eq!(out.len(), 6);
    assert_eq!(out[0].defs(), &[dst_scratch]);
    assert_eq!(out[1].uses()[0], dst_scratch);
    assert_eq!(out[2].defs(), &[src_scratch[0]]);
    assert_eq!(out[3].defs(), &[dst_scratch]);
    assert_eq!(out[4].uses(), &[src_scratch[0], dst_scratch]);
    assert_eq!(out[4].defs(), &[dst_scratch]);
    assert_eq!(out[5].uses()[0], dst_scratch);
    for i in &out {
      assert!(!i.defs().contains(&a) && !i.uses().contains(&a));
      assert!(!i.defs().contains(&b) && !i.uses().contains(&b));
    }
    assert_eq!(slots.len(), 2);
    assert_eq!(frame.size(), 16);
  }

  #[test]
  fn spill_code_between_push_and_call_is_offset() {
    let (mut gen, mut frame) = setup();
    let (a, b, c) = (gen.new_temp(), gen.new_temp(), gen.new_temp());
    let sp = frame.stack_pointer();
    let rdi = frame.parameter_registers()[0];
    let instrs = vec![
      Instr::oper("movq $7, `d0".into(), &[b], &[]),
      Instr::stack_adjust("pushq `s0".into(), &[sp], &[c, sp], 8),
      Instr::stack_adjust("pushq `s0".into(), &[sp], &[a, sp], 8),
      Instr::mov(rdi, b),
      Instr::call("callq g".into(), &[], &[rdi]),
      Instr::stack_adjust("addq $16, `d0".into(), &[sp], &[sp], -16),
      Instr::oper("".into(), &[], &[b]),
    ];
    let mut slots = Map::default();
    let out =
      rewrite_spills(instrs, &[b, c], &mut slots, &mut frame, &mut gen).unwrap();
    assert_eq!((slots[&b], slots[&c]), (-8, -16));
    let text: Vec<String> = out.iter().map(|i| format!("{:?}", i)).collect();
    // Store of b, then c reloaded before anything is pushed.
    assert!(text[1].contains("(-8+f_fs)("));
    assert!(text[2].contains("(-16+f_fs)("));
    assert!(text[3].contains("pushq"));
    assert!(text[4].contains("pushq"));
    // Two words are outstanding when b is reloaded for the move.
    assert!(text[5].contains("(8+f_fs)("));
    assert!(out[6].is_move());
    assert!(text[7].contains("callq g"));
    assert!(text[8].contains("addq $16"));
    assert!(text[9].contains("(-8+f_fs)("));
    assert_eq!(out.len(), 11);
  }

  #[test]
  fn slots_are_reused_across_rounds() {
    let (mut gen, mut frame) = setup();
    let a = gen.new_temp();
    let mut slots = Map::default();
    let instrs = vec![Instr::oper("".into(), &[], &[a])];
    rewrite_spills(instrs.clone(), &[a], &mut slots, &mut frame, &mut gen)
      .unwrap();
    rewrite_spills(instrs, &[a], &mut slots, &mut frame, &mut gen).unwrap();
    assert_eq!(frame.size(), 8);
  }

  #[test]
  fn two_spilled_defs_are_an_error() {
    let (mut gen, mut frame) = setup();
    let (a, b) = (gen.new_temp(), gen.new_temp());
    let instrs = vec![Instr::oper("cqto".into(), &[a, b], &[])];
    let mut slots = Map::default();
    match rewrite_spills(instrs, &[a, b], &mut slots, &mut frame, &mut gen) {
      Err(RegAllocError::OutOfScratchRegisters(_)) => {}
      _ => panic!("expected OutOfScratchRegisters"),
    }
  }

  #[test]
  fn same_register_moves_are_removed() {
    let (mut gen, frame) = setup();
    let rax = frame.return_value();
    let (a, b, c) = (gen.new_temp(), gen.new_temp(), gen.new_temp());
    let mut mapping = Map::default();
    mapping.insert(a, rax);
    mapping.insert(b, rax);
    mapping.insert(c, frame.callee_saved_registers()[1]);
    let instrs = vec![
      Instr::oper("movq $1, `d0".into(), &[a], &[]),
      Instr::mov(b, a),
      Instr::mov(c, b),
      Instr::oper("".into(), &[], &[c]),
    ];
    let (out, removed) = apply_mapping(instrs, &mapping);
    assert_eq!(removed, 1);
    assert_eq!(out.len(), 3);
    for i in &out {
      if let Instr::Move { src, dst, .. } = i {
        assert_ne!(src, dst);
      }
    }
  }
}
