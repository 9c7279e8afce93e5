/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The intermediate representation handed over by the front end.
//!
//! Trees arrive in canonical form: no `Seq` or `ESeq` nodes remain, calls
//! only appear directly under `Exp` or as the source of a `Move` into a
//! temporary, and every `CJump` is immediately followed by its false label.
//! The backend never mutates these trees.

use crate::data_structures::{Label, Temp};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum BinOp {
  Plus,
  Minus,
  Mul,
  Div,
  And,
  Or,
  Xor,
}

impl BinOp {
  /// Evaluate |self| on two machine words, with x86-64 semantics.  Division
  /// by zero yields None.
  pub fn calc(self, a: i64, b: i64) -> Option<i64> {
    Some(match self {
      BinOp::Plus => a.wrapping_add(b),
      BinOp::Minus => a.wrapping_sub(b),
      BinOp::Mul => a.wrapping_mul(b),
      BinOp::Div => {
        if b == 0 {
          return None;
        }
        a.wrapping_div(b)
      }
      BinOp::And => a & b,
      BinOp::Or => a | b,
      BinOp::Xor => a ^ b,
    })
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RelOp {
  Eq,
  Ne,
  Lt,
  Gt,
  Le,
  Ge,
  Ult,
  Ule,
  Ugt,
  Uge,
}

impl RelOp {
  /// The conditional jump that branches when |self| holds after
  /// `cmpq right, left`.
  pub fn jump_mnemonic(self) -> &'static str {
    match self {
      RelOp::Eq => "je",
      RelOp::Ne => "jne",
      RelOp::Lt => "jl",
      RelOp::Gt => "jg",
      RelOp::Le => "jle",
      RelOp::Ge => "jge",
      RelOp::Ult => "jb",
      RelOp::Ule => "jbe",
      RelOp::Ugt => "ja",
      RelOp::Uge => "jae",
    }
  }

  pub fn from_jump_mnemonic(s: &str) -> Option<RelOp> {
    Some(match s {
      "je" => RelOp::Eq,
      "jne" => RelOp::Ne,
      "jl" => RelOp::Lt,
      "jg" => RelOp::Gt,
      "jle" => RelOp::Le,
      "jge" => RelOp::Ge,
      "jb" => RelOp::Ult,
      "jbe" => RelOp::Ule,
      "ja" => RelOp::Ugt,
      "jae" => RelOp::Uge,
      _ => return None,
    })
  }

  pub fn negate(self) -> RelOp {
    match self {
      RelOp::Eq => RelOp::Ne,
      RelOp::Ne => RelOp::Eq,
      RelOp::Lt => RelOp::Ge,
      RelOp::Gt => RelOp::Le,
      RelOp::Le => RelOp::Gt,
      RelOp::Ge => RelOp::Lt,
      RelOp::Ult => RelOp::Uge,
      RelOp::Ule => RelOp::Ugt,
      RelOp::Ugt => RelOp::Ule,
      RelOp::Uge => RelOp::Ult,
    }
  }

  pub fn holds(self, left: i64, right: i64) -> bool {
    let (ul, ur) = (left as u64, right as u64);
    match self {
      RelOp::Eq => left == right,
      RelOp::Ne => left != right,
      RelOp::Lt => left < right,
      RelOp::Gt => left > right,
      RelOp::Le => left <= right,
      RelOp::Ge => left >= right,
      RelOp::Ult => ul < ur,
      RelOp::Ule => ul <= ur,
      RelOp::Ugt => ul > ur,
      RelOp::Uge => ul >= ur,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Stm {
  Seq(Box<Stm>, Box<Stm>),
  Label(Label),
  /// Jump to the address computed by the expression.  The list holds every
  /// label the jump may reach.
  Jump(Exp, Vec<Label>),
  CJump { op: RelOp, left: Exp, right: Exp, t: Label, f: Label },
  /// `Move(dst, src)`: dst is either `Temp` or `Mem`.
  Move(Exp, Exp),
  Exp(Exp),
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Exp {
  BinOp(BinOp, Box<Exp>, Box<Exp>),
  Mem(Box<Exp>),
  Temp(Temp),
  ESeq(Box<Stm>, Box<Exp>),
  Name(Label),
  Const(i32),
  Call(Box<Exp>, Vec<Exp>),
}

// Constructors, to keep tree-building code readable.

pub fn binop(op: BinOp, l: Exp, r: Exp) -> Exp {
  Exp::BinOp(op, Box::new(l), Box::new(r))
}
pub fn mem(e: Exp) -> Exp {
  Exp::Mem(Box::new(e))
}
pub fn call(f: Label, args: Vec<Exp>) -> Exp {
  Exp::Call(Box::new(Exp::Name(f)), args)
}
pub fn mov(dst: Exp, src: Exp) -> Stm {
  Stm::Move(dst, src)
}
pub fn jump(l: Label) -> Stm {
  Stm::Jump(Exp::Name(l.clone()), vec![l])
}
pub fn cjump(op: RelOp, left: Exp, right: Exp, t: Label, f: Label) -> Stm {
  Stm::CJump { op, left, right, t, f }
}

#[test]
fn test_relops() {
  for op in &[
    RelOp::Eq,
    RelOp::Ne,
    RelOp::Lt,
    RelOp::Gt,
    RelOp::Le,
    RelOp::Ge,
    RelOp::Ult,
    RelOp::Ule,
    RelOp::Ugt,
    RelOp::Uge,
  ] {
    assert_eq!(RelOp::from_jump_mnemonic(op.jump_mnemonic()), Some(*op));
    for (a, b) in &[(-1i64, 2i64), (3, 3), (5, -7)] {
      assert_eq!(op.holds(*a, *b), !op.negate().holds(*a, *b));
    }
  }
  assert!(RelOp::Ult.holds(1, -1));
  assert!(RelOp::Lt.holds(-1, 1));
}

#[test]
fn test_binop_calc() {
  assert_eq!(BinOp::Div.calc(7, 0), None);
  assert_eq!(BinOp::Div.calc(-7, 2), Some(-3));
  assert_eq!(BinOp::Minus.calc(2, 5), Some(-3));
}
