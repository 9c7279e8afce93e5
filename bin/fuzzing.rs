/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implements fuzzing primitives: random canonical programs, for differential
//! runs before and after allocation, and random instruction streams, for
//! exercising the colorer on its own.

use arbitrary::{Arbitrary, Result, Unstructured};

use std::fmt;
use std::rc::Rc;

use tigerback::tree::{self, BinOp, RelOp};
use tigerback::{
  Compilation, Exp, Frame, Instr, Label, Stm, Temp, TempGen, X64Frame,
  X64Regs,
};

/// Number of allocatable registers on x86-64.
pub const NUM_ALLOCATABLE: usize = 9;

const MAX_STMS: usize = 64;
const MAX_DEPTH: u8 = 2;
const MAX_EXP_DEPTH: u8 = 3;
const NUM_HELPER_ARGS: usize = 8;

fn pick_ix(u: &mut Unstructured, n: usize) -> Result<usize> {
  Ok(u8::arbitrary(u)? as usize % n)
}

//=============================================================================
// Random programs

struct FuzzingEnv<'c> {
  comp: &'c mut Compilation,
  helper: Label,
  slots: Vec<Exp>,
  /// Temporaries that are defined on every path reaching the current point.
  defined: Vec<Temp>,
  /// Loop counters, which may be read but not written.
  counters: Vec<Temp>,
  num_stms: usize,
}

impl<'c> FuzzingEnv<'c> {
  fn small_const(&self, u: &mut Unstructured) -> Result<i32> {
    Ok(i32::from(i8::arbitrary(u)?))
  }

  fn binop(&self, u: &mut Unstructured) -> Result<BinOp> {
    Ok(match u8::arbitrary(u)? % 6 {
      0 => BinOp::Plus,
      1 => BinOp::Minus,
      2 => BinOp::Mul,
      3 => BinOp::And,
      4 => BinOp::Or,
      _ => BinOp::Xor,
    })
  }

  fn relop(&self, u: &mut Unstructured) -> Result<RelOp> {
    Ok(match u8::arbitrary(u)? % 10 {
      0 => RelOp::Eq,
      1 => RelOp::Ne,
      2 => RelOp::Lt,
      3 => RelOp::Gt,
      4 => RelOp::Le,
      5 => RelOp::Ge,
      6 => RelOp::Ult,
      7 => RelOp::Ule,
      8 => RelOp::Ugt,
      _ => RelOp::Uge,
    })
  }

  fn pick<T: Copy>(&self, u: &mut Unstructured, from: &[T]) -> Result<T> {
    Ok(from[pick_ix(u, from.len())?])
  }

  fn exp(&self, u: &mut Unstructured, depth: u8) -> Result<Exp> {
    let leaf = depth >= MAX_EXP_DEPTH;
    let readable: Vec<Temp> =
      self.defined.iter().chain(self.counters.iter()).copied().collect();
    let choice = u8::arbitrary(u)? % if leaf { 3 } else { 6 };
    Ok(match choice {
      0 => Exp::Const(self.small_const(u)?),
      1 | 2 if !readable.is_empty() => Exp::Temp(self.pick(u, &readable)?),
      1 | 2 => Exp::Const(self.small_const(u)?),
      3 => {
        let op = self.binop(u)?;
        tree::binop(op, self.exp(u, depth + 1)?, self.exp(u, depth + 1)?)
      }
      4 => {
        // Never divide by zero.
        let mut divisor = self.small_const(u)?;
        if divisor == 0 {
          divisor = 1;
        }
        tree::binop(BinOp::Div, self.exp(u, depth + 1)?, Exp::Const(divisor))
      }
      _ if !self.slots.is_empty() => {
        self.slots[pick_ix(u, self.slots.len())?].clone()
      }
      _ => Exp::Const(self.small_const(u)?),
    })
  }

  fn assign(&mut self, u: &mut Unstructured, src: Exp) -> Result<Stm> {
    let fresh = self.defined.is_empty() || bool::arbitrary(u)?;
    let dst = if fresh {
      let t = self.comp.gen.new_temp();
      self.defined.push(t);
      t
    } else {
      self.pick(u, &self.defined)?
    };
    Ok(tree::mov(Exp::Temp(dst), src))
  }

  fn stms(&mut self, u: &mut Unstructured, depth: u8, out: &mut Vec<Stm>) -> Result<()> {
    let n = 1 + u8::arbitrary(u)? as usize % 8;
    for _ in 0..n {
      if self.num_stms >= MAX_STMS {
        break;
      }
      self.num_stms += 1;
      self.stm(u, depth, out)?;
    }
    Ok(())
  }

  fn stm(&mut self, u: &mut Unstructured, depth: u8, out: &mut Vec<Stm>) -> Result<()> {
    let nested = depth < MAX_DEPTH;
    match u8::arbitrary(u)? % if nested { 7 } else { 5 } {
      0 | 1 => {
        let src = self.exp(u, 0)?;
        out.push(self.assign(u, src)?);
      }
      2 if !self.slots.is_empty() => {
        let ix = pick_ix(u, self.slots.len())?;
        let src = self.exp(u, 0)?;
        out.push(tree::mov(self.slots[ix].clone(), src));
      }
      2 | 3 => {
        let printi = self.comp.gen.named_label("printi");
        out.push(Stm::Exp(tree::call(printi, vec![self.exp(u, 0)?])));
      }
      4 => {
        let mut args = vec![];
        for _ in 0..NUM_HELPER_ARGS {
          args.push(self.exp(u, 1)?);
        }
        let call = tree::call(self.helper.clone(), args);
        out.push(self.assign(u, call)?);
      }
      5 => {
        // if left op right then <stms>
        let (join, then) = (self.comp.gen.new_label(), self.comp.gen.new_label());
        let (op, l, r) = (self.relop(u)?, self.exp(u, 0)?, self.exp(u, 0)?);
        out.push(tree::cjump(op, l, r, join.clone(), then.clone()));
        out.push(Stm::Label(then));
        let before = self.defined.len();
        self.stms(u, depth + 1, out)?;
        self.defined.truncate(before);
        out.push(Stm::Label(join));
      }
      _ => {
        // for i := 0 to n - 1 do <stms>
        let i = self.comp.gen.new_temp();
        let n = 1 + u8::arbitrary(u)? as i32 % 6;
        let g = &mut self.comp.gen;
        let (top, body, done) = (g.new_label(), g.new_label(), g.new_label());
        out.push(tree::mov(Exp::Temp(i), Exp::Const(0)));
        out.push(Stm::Label(top.clone()));
        out.push(tree::cjump(
          RelOp::Ge,
          Exp::Temp(i),
          Exp::Const(n),
          done.clone(),
          body.clone(),
        ));
        out.push(Stm::Label(body));
        let before = self.defined.len();
        self.counters.push(i);
        self.stms(u, depth + 1, out)?;
        self.counters.pop();
        self.defined.truncate(before);
        out.push(tree::mov(
          Exp::Temp(i),
          tree::binop(BinOp::Plus, Exp::Temp(i), Exp::Const(1)),
        ));
        out.push(tree::jump(top));
        out.push(Stm::Label(done));
      }
    }
    Ok(())
  }
}

/// A whole program: `tigermain` plus one helper that takes enough arguments
/// to need the stack.
pub struct FuzzProgram {
  pub budget: usize,
  pub bodies: Vec<(String, Vec<Stm>)>,
  comp: Compilation,
}

impl FuzzProgram {
  pub fn into_compilation(self) -> Compilation {
    self.comp
  }
}

impl fmt::Debug for FuzzProgram {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    writeln!(fmt, "budget {}", self.budget)?;
    for (name, body) in &self.bodies {
      writeln!(fmt, "{}:", name)?;
      for stm in body {
        writeln!(fmt, "  {:?}", stm)?;
      }
    }
    Ok(())
  }
}

impl<'a> Arbitrary<'a> for FuzzProgram {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<FuzzProgram> {
    let budget = 2 + u8::arbitrary(u)? as usize % (NUM_ALLOCATABLE - 1);
    let mut comp = Compilation::with_budget(budget);
    let mut bodies = vec![];

    // The helper mixes its arguments; some of them escape.
    let mut escapes = [false; NUM_HELPER_ARGS];
    for e in escapes.iter_mut() {
      *e = bool::arbitrary(u)?;
    }
    let frame = comp.new_frame("helper", &escapes);
    let fp = frame.frame_pointer();
    let mut result = Exp::Const(0);
    for (i, formal) in frame.formals().iter().enumerate() {
      let op = if i % 2 == 0 { BinOp::Plus } else { BinOp::Minus };
      result = tree::binop(op, result, formal.exp(fp));
    }
    let helper = frame.name().clone();
    let body = frame.proc_entry_exit1(vec![], Some(result));
    bodies.push(("helper".to_string(), body.clone()));
    comp.add_proc(frame, body);

    let mut frame = comp.new_frame("tigermain", &[]);
    let fp = frame.frame_pointer();
    let mut init = vec![];
    let mut slots = vec![];
    for k in 0..u8::arbitrary(u)? % 4 {
      let slot = frame.allocate_slot(8, true, &mut comp.gen).exp(fp);
      init.push(tree::mov(slot.clone(), Exp::Const(i32::from(k))));
      slots.push(slot);
    }
    let mut env = FuzzingEnv {
      comp: &mut comp,
      helper,
      slots,
      defined: vec![],
      counters: vec![],
      num_stms: 0,
    };
    let mut main_body = init;
    env.stms(u, 0, &mut main_body)?;
    let result = env.exp(u, 0)?;
    let body = frame.proc_entry_exit1(main_body, Some(result));
    bodies.push(("tigermain".to_string(), body.clone()));
    comp.add_proc(frame, body);

    Ok(FuzzProgram { budget, bodies, comp })
  }
}

//=============================================================================
// Random instruction streams

/// A function's worth of selected instructions over a handful of temporaries
/// and machine registers, not necessarily meaningful as a program.
#[derive(Debug)]
pub struct FuzzInstrs {
  pub frame: X64Frame,
  pub instrs: Vec<Instr>,
}

impl<'a> Arbitrary<'a> for FuzzInstrs {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<FuzzInstrs> {
    let budget = 1 + u8::arbitrary(u)? as usize % NUM_ALLOCATABLE;
    let mut gen = TempGen::new();
    let regs = Rc::new(X64Regs::with_budget(&mut gen, budget));
    let mut frame = X64Frame::new(gen.named_label("fuzz"), &[], regs, &mut gen);

    let num_temps = 1 + u8::arbitrary(u)? as usize % 24;
    let mut temps: Vec<Temp> = (0..num_temps).map(|_| gen.new_temp()).collect();
    // Some precolored operands too.
    temps.push(frame.return_value());
    temps.extend(frame.parameter_registers()[..2].iter().copied());
    let labels: Vec<Label> = (0..u8::arbitrary(u)? % 4).map(|_| gen.new_label()).collect();
    let mut placed = vec![false; labels.len()];

    let mut instrs = frame.on_function_enter(&mut gen);
    let num_instrs = 1 + u8::arbitrary(u)? as usize % 64;
    for _ in 0..num_instrs {
      let kind = u8::arbitrary(u)? % 6;
      let instr = match kind {
        0 | 1 => {
          let d = temps[pick_ix(u, temps.len())?];
          let mut src = vec![];
          for _ in 0..pick_ix(u, 3)? {
            src.push(temps[pick_ix(u, temps.len())?]);
          }
          Instr::oper("op".to_string(), &[d], &src)
        }
        2 => {
          let (d, s) = (temps[pick_ix(u, temps.len())?], temps[pick_ix(u, temps.len())?]);
          Instr::mov(d, s)
        }
        3 => {
          let n = pick_ix(u, 3)?;
          Instr::call(
            "callq f".to_string(),
            frame.caller_saved_registers(),
            &frame.parameter_registers()[..n],
          )
        }
        _ if labels.is_empty() => continue,
        4 => {
          let l = labels[pick_ix(u, labels.len())?].clone();
          Instr::cond_jump("jl `j0".to_string(), vec![l])
        }
        _ => {
          let ix = pick_ix(u, labels.len())?;
          if placed[ix] {
            let l = labels[ix].clone();
            Instr::jump("jmp `j0".to_string(), l)
          } else {
            placed[ix] = true;
            Instr::label(labels[ix].clone())
          }
        }
      };
      instrs.push(instr);
    }
    for (ix, l) in labels.iter().enumerate() {
      if !placed[ix] {
        instrs.push(Instr::label(l.clone()));
      }
    }
    instrs.extend(frame.on_function_return());
    instrs.push(frame.return_sink());
    Ok(FuzzInstrs { frame, instrs })
  }
}
