/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Target instructions, as produced by the instruction selector and consumed
//! by the flow graph builder and the register allocator.
//!
//! An instruction's text is a template: `` `s<i> `` stands for the i-th
//! source temporary, `` `d<i> `` for the i-th destination and `` `j<i> `` for
//! the i-th jump target.  Only `format` looks inside the template; everything
//! else works off the explicit temp lists and the control-flow tag.

use smallvec::SmallVec;

use std::fmt;

use crate::data_structures::{Label, Temp};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

pub type TempVec = SmallVec<[Temp; 4]>;

/// How control leaves an instruction.  Set by whoever builds the instruction,
/// never recovered from its text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ControlFlow {
  Fallthrough,
  /// Unconditional: never falls through.
  Jump,
  /// Conditional: falls through or goes to one of the targets.
  CondJump,
  /// Returns to the following instruction.
  Call,
}

#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Instr {
  Oper {
    assem: String,
    dst: TempVec,
    src: TempVec,
    jumps: Vec<Label>,
    flow: ControlFlow,
    /// Bytes this instruction pushes onto the stack; negative when it
    /// releases them.
    stack: i32,
  },
  Label {
    assem: String,
    label: Label,
  },
  Move {
    assem: String,
    dst: Temp,
    src: Temp,
  },
}

impl Instr {
  pub fn oper(assem: String, dst: &[Temp], src: &[Temp]) -> Instr {
    Instr::Oper {
      assem,
      dst: SmallVec::from_slice(dst),
      src: SmallVec::from_slice(src),
      jumps: vec![],
      flow: ControlFlow::Fallthrough,
      stack: 0,
    }
  }

  pub fn call(assem: String, dst: &[Temp], src: &[Temp]) -> Instr {
    Instr::Oper {
      assem,
      dst: SmallVec::from_slice(dst),
      src: SmallVec::from_slice(src),
      jumps: vec![],
      flow: ControlFlow::Call,
      stack: 0,
    }
  }

  /// An instruction that moves the stack pointer by |bytes| while outgoing
  /// call arguments are on the stack.
  pub fn stack_adjust(
    assem: String, dst: &[Temp], src: &[Temp], bytes: i32,
  ) -> Instr {
    Instr::Oper {
      assem,
      dst: SmallVec::from_slice(dst),
      src: SmallVec::from_slice(src),
      jumps: vec![],
      flow: ControlFlow::Fallthrough,
      stack: bytes,
    }
  }

  pub fn jump(assem: String, target: Label) -> Instr {
    Instr::Oper {
      assem,
      dst: SmallVec::new(),
      src: SmallVec::new(),
      jumps: vec![target],
      flow: ControlFlow::Jump,
      stack: 0,
    }
  }

  pub fn cond_jump(assem: String, targets: Vec<Label>) -> Instr {
    Instr::Oper {
      assem,
      dst: SmallVec::new(),
      src: SmallVec::new(),
      jumps: targets,
      flow: ControlFlow::CondJump,
      stack: 0,
    }
  }

  pub fn label(label: Label) -> Instr {
    Instr::Label { assem: format!("{}:", label.name()), label }
  }

  pub fn mov(dst: Temp, src: Temp) -> Instr {
    Instr::Move { assem: "movq `s0, `d0".to_string(), dst, src }
  }

  pub fn defs(&self) -> &[Temp] {
    match self {
      Instr::Oper { dst, .. } => &dst[..],
      Instr::Move { dst, .. } => std::slice::from_ref(dst),
      Instr::Label { .. } => &[],
    }
  }

  pub fn uses(&self) -> &[Temp] {
    match self {
      Instr::Oper { src, .. } => &src[..],
      Instr::Move { src, .. } => std::slice::from_ref(src),
      Instr::Label { .. } => &[],
    }
  }

  pub fn is_move(&self) -> bool {
    match self {
      Instr::Move { .. } => true,
      _ => false,
    }
  }

  pub fn flow(&self) -> ControlFlow {
    match self {
      Instr::Oper { flow, .. } => *flow,
      _ => ControlFlow::Fallthrough,
    }
  }

  pub fn stack_delta(&self) -> i32 {
    match self {
      Instr::Oper { stack, .. } => *stack,
      _ => 0,
    }
  }

  pub fn jump_targets(&self) -> &[Label] {
    match self {
      Instr::Oper { jumps, .. } => &jumps[..],
      _ => &[],
    }
  }

  /// Rewrite every temporary mentioned by this instruction.
  pub fn map_temps<F: FnMut(Temp) -> Temp>(&mut self, mut f: F) {
    match self {
      Instr::Oper { dst, src, .. } => {
        for t in dst.iter_mut() {
          *t = f(*t);
        }
        for t in src.iter_mut() {
          *t = f(*t);
        }
      }
      Instr::Move { dst, src, .. } => {
        *dst = f(*dst);
        *src = f(*src);
      }
      Instr::Label { .. } => {}
    }
  }

  /// Expand the template, naming temporaries with |name|.
  pub fn format<F: Fn(Temp) -> String>(&self, name: F) -> String {
    let (assem, dst, src, jumps) = match self {
      Instr::Label { assem, .. } => return assem.clone(),
      Instr::Oper { assem, dst, src, jumps, .. } => {
        (assem, &dst[..], &src[..], &jumps[..])
      }
      Instr::Move { assem, dst, src } => (
        assem,
        std::slice::from_ref(dst),
        std::slice::from_ref(src),
        &[][..],
      ),
    };
    let mut res = String::with_capacity(assem.len() + 8);
    let bytes = assem.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
      if bytes[i] == b'`' && i + 1 < bytes.len() {
        let kind = bytes[i + 1];
        let mut j = i + 2;
        let mut n = 0usize;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
          n = n * 10 + (bytes[j] - b'0') as usize;
          j += 1;
        }
        if j > i + 2 {
          match kind {
            b's' => {
              res.push_str(&name(src[n]));
              i = j;
              continue;
            }
            b'd' => {
              res.push_str(&name(dst[n]));
              i = j;
              continue;
            }
            b'j' => {
              res.push_str(jumps[n].name());
              i = j;
              continue;
            }
            _ => {}
          }
        }
      }
      res.push(bytes[i] as char);
      i += 1;
    }
    res
  }
}

impl fmt::Debug for Instr {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let text = self.format(|t| format!("{:?}", t));
    match self {
      Instr::Label { .. } => write!(fmt, "{}", text),
      _ => write!(fmt, "    {}", text),
    }
  }
}

#[cfg(test)]
mod test_assem {
  use super::*;
  use crate::data_structures::TempGen;

  #[test]
  fn format_expands_placeholders() {
    let mut gen = TempGen::new();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let l = gen.new_label();
    let i = Instr::oper("movq (`s0,`s1), `d0".to_string(), &[a], &[b, a]);
    assert_eq!(i.format(|t| format!("{:?}", t)), "movq (t1,t0), t0");
    let j = Instr::jump("jmp `j0".to_string(), l.clone());
    assert_eq!(j.format(|t| format!("{:?}", t)), "jmp L0");
    assert_eq!(j.flow(), ControlFlow::Jump);
    assert_eq!(format!("{:?}", Instr::label(l)), "L0:");
  }

  #[test]
  fn move_defs_and_uses() {
    let mut gen = TempGen::new();
    let a = gen.new_temp();
    let b = gen.new_temp();
    let mut m = Instr::mov(a, b);
    assert!(m.is_move());
    assert_eq!(m.defs(), &[a]);
    assert_eq!(m.uses(), &[b]);
    m.map_temps(|_| a);
    assert_eq!(m.uses(), &[a]);
    assert_eq!(m.format(|t| format!("{:?}", t)), "movq t0, t0");
  }
}
