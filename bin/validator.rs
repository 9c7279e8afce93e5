/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checks that a function body is in the canonical form the instruction
//! selector expects, so that test and fuzz inputs fail here with a readable
//! message instead of deep inside the backend.

use tigerback::{Exp, Label, Set, Stm};

use std::collections::HashSet;

pub struct Context<'b> {
  name: &'b str,
  defined: HashSet<String>,
  targets: Vec<Label>,
}

impl<'b> Context<'b> {
  fn new(name: &'b str) -> Self {
    Self { name, defined: HashSet::new(), targets: vec![] }
  }

  fn fail<T>(&self, what: String) -> Result<T, String> {
    Err(format!("{}: {}", self.name, what))
  }

  // |e| may contain calls only if |call_ok|, and only at its root.
  fn check_exp(&self, e: &Exp, call_ok: bool) -> Result<(), String> {
    match e {
      Exp::Const(_) | Exp::Temp(_) | Exp::Name(_) => Ok(()),
      Exp::BinOp(_, l, r) => {
        self.check_exp(l, false)?;
        self.check_exp(r, false)
      }
      Exp::Mem(a) => self.check_exp(a, false),
      Exp::ESeq(..) => self.fail(format!("ESeq in {:?}", e)),
      Exp::Call(f, args) => {
        if !call_ok {
          return self.fail(format!("nested call {:?}", e));
        }
        match &**f {
          Exp::Name(_) => {}
          other => return self.fail(format!("call of non-label {:?}", other)),
        }
        for a in args {
          self.check_exp(a, false)?;
        }
        Ok(())
      }
    }
  }

  fn check_stm(&mut self, stm: &Stm, next: Option<&Stm>) -> Result<(), String> {
    match stm {
      Stm::Seq(..) => self.fail(format!("Seq {:?}", stm)),
      Stm::Label(l) => {
        if !self.defined.insert(l.name().to_string()) {
          return self.fail(format!("label {} defined twice", l));
        }
        Ok(())
      }
      Stm::Jump(e, targets) => {
        match e {
          Exp::Name(l) if targets.contains(l) => {}
          _ => return self.fail(format!("unsupported jump {:?}", stm)),
        }
        self.targets.extend(targets.iter().cloned());
        Ok(())
      }
      Stm::CJump { left, right, t, f, .. } => {
        self.check_exp(left, false)?;
        self.check_exp(right, false)?;
        match next {
          Some(Stm::Label(l)) if l == f => {}
          _ => return self.fail(format!("{:?} not followed by its false label", stm)),
        }
        self.targets.push(t.clone());
        Ok(())
      }
      Stm::Move(dst, src) => {
        match dst {
          Exp::Temp(_) => self.check_exp(src, true),
          Exp::Mem(a) => {
            self.check_exp(a, false)?;
            self.check_exp(src, false)
          }
          _ => self.fail(format!("move to {:?}", dst)),
        }
      }
      Stm::Exp(e) => self.check_exp(e, true),
    }
  }
}

/// Validate the body of function |name|.
pub fn validate(name: &str, stms: &[Stm]) -> Result<(), String> {
  let mut cx = Context::new(name);
  for (i, stm) in stms.iter().enumerate() {
    cx.check_stm(stm, stms.get(i + 1))?;
  }
  let targets: Set<&str> =
    Set::from_vec(cx.targets.iter().map(|l| l.name()).collect());
  for l in targets.to_vec() {
    if !cx.defined.contains(l) {
      return cx.fail(format!("jump to undefined label {}", l));
    }
  }
  Ok(())
}

#[cfg(test)]
mod test_validator {
  use super::*;
  use tigerback::tree::{self, BinOp, RelOp};
  use tigerback::TempGen;

  #[test]
  fn canonical_body_passes() {
    let mut gen = TempGen::new();
    let (t, f) = (gen.new_label(), gen.new_label());
    let a = gen.new_temp();
    let printi = gen.named_label("printi");
    let body = vec![
      tree::mov(Exp::Temp(a), Exp::Const(1)),
      tree::cjump(RelOp::Lt, Exp::Temp(a), Exp::Const(2), t.clone(), f.clone()),
      Stm::Label(f),
      tree::mov(Exp::Temp(a), tree::call(printi, vec![Exp::Temp(a)])),
      Stm::Label(t),
    ];
    assert_eq!(validate("ok", &body), Ok(()));
  }

  #[test]
  fn nested_calls_are_rejected() {
    let mut gen = TempGen::new();
    let f = gen.named_label("f");
    let inner = tree::call(f.clone(), vec![]);
    let body = vec![Stm::Exp(tree::binop(BinOp::Plus, inner, Exp::Const(1)))];
    assert!(validate("bad", &body).is_err());
  }

  #[test]
  fn cjump_needs_its_false_label_next() {
    let mut gen = TempGen::new();
    let (t, f) = (gen.new_label(), gen.new_label());
    let body = vec![
      tree::cjump(RelOp::Eq, Exp::Const(0), Exp::Const(0), t.clone(), f.clone()),
      Stm::Label(t),
      Stm::Label(f),
    ];
    assert!(validate("bad", &body).is_err());
  }

  #[test]
  fn undefined_targets_are_rejected() {
    let mut gen = TempGen::new();
    let body = vec![tree::jump(gen.new_label())];
    assert!(validate("bad", &body).is_err());
  }
}
