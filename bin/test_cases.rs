/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test programs, written directly as canonical trees.  Every program has a
//! `tigermain`; most print something and all return a value, so that runs
//! before and after allocation can be compared.

use tigerback::tree::{self, BinOp, RelOp};
use tigerback::{Compilation, Exp, Frame, Stm, Temp, X64Frame};

use crate::validator::validate;

//=============================================================================
// Tree-building shorthands

fn t(x: Temp) -> Exp {
  Exp::Temp(x)
}
fn c(n: i32) -> Exp {
  Exp::Const(n)
}
fn add(l: Exp, r: Exp) -> Exp {
  tree::binop(BinOp::Plus, l, r)
}
fn sub(l: Exp, r: Exp) -> Exp {
  tree::binop(BinOp::Minus, l, r)
}
fn mul(l: Exp, r: Exp) -> Exp {
  tree::binop(BinOp::Mul, l, r)
}
fn div(l: Exp, r: Exp) -> Exp {
  tree::binop(BinOp::Div, l, r)
}
fn set(x: Temp, e: Exp) -> Stm {
  tree::mov(t(x), e)
}
fn printi(comp: &Compilation, frame: &X64Frame, e: Exp) -> Stm {
  Stm::Exp(frame.external_call(comp.gen.named_label("printi"), vec![e]))
}

// Validate and register a function.
fn finish(
  comp: &mut Compilation, frame: X64Frame, body: Vec<Stm>, result: Exp,
) {
  let body = frame.proc_entry_exit1(body, Some(result));
  if let Err(msg) = validate(frame.name().name(), &body) {
    panic!("malformed test program: {}", msg);
  }
  comp.add_proc(frame, body);
}

// `while i < n do body; i := i + 1`, with |i| starting at 0.
fn counted_loop(
  comp: &mut Compilation, i: Temp, n: Exp, body: Vec<Stm>,
) -> Vec<Stm> {
  let (top, next, done) =
    (comp.gen.new_label(), comp.gen.new_label(), comp.gen.new_label());
  let mut stms = vec![
    set(i, c(0)),
    Stm::Label(top.clone()),
    tree::cjump(RelOp::Ge, t(i), n, done.clone(), next.clone()),
    Stm::Label(next),
  ];
  stms.extend(body);
  stms.push(set(i, add(t(i), c(1))));
  stms.push(tree::jump(top));
  stms.push(Stm::Label(done));
  stms
}

//=============================================================================
// The programs

fn straight_line(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let g = &mut comp.gen;
  let (a, b, x, d, e) =
    (g.new_temp(), g.new_temp(), g.new_temp(), g.new_temp(), g.new_temp());
  let body = vec![
    set(a, c(3)),
    set(b, add(t(a), c(3))),
    set(x, mul(t(a), t(b))),
    set(d, sub(t(x), c(4))),
    set(e, div(t(d), c(2))),
    printi(comp, &frame, t(d)),
  ];
  finish(comp, frame, body, add(t(d), t(e)));
}

fn loop_sum(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let (i, s) = (comp.gen.new_temp(), comp.gen.new_temp());
  let mut body = vec![set(s, c(0))];
  body.extend(counted_loop(comp, i, c(11), vec![set(s, add(t(s), t(i)))]));
  body.push(printi(comp, &frame, t(s)));
  finish(comp, frame, body, t(s));
}

fn fib_iter(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let g = &mut comp.gen;
  let (i, a, b, tmp) = (g.new_temp(), g.new_temp(), g.new_temp(), g.new_temp());
  let mut body = vec![set(a, c(0)), set(b, c(1))];
  body.extend(counted_loop(
    comp,
    i,
    c(20),
    vec![set(tmp, add(t(a), t(b))), set(a, t(b)), set(b, t(tmp))],
  ));
  body.push(printi(comp, &frame, t(a)));
  finish(comp, frame, body, t(a));
}

fn division(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let g = &mut comp.gen;
  let (a, b, q, r) = (g.new_temp(), g.new_temp(), g.new_temp(), g.new_temp());
  let body = vec![
    set(a, c(100)),
    set(b, c(7)),
    set(q, div(t(a), t(b))),
    set(r, div(c(-100), t(b))),
    printi(comp, &frame, t(q)),
    printi(comp, &frame, t(r)),
  ];
  finish(comp, frame, body, sub(t(a), mul(t(q), t(b))));
}

// Returns a + 2b + 3c + ... + 7g; the last argument arrives on the stack.
fn call7(comp: &mut Compilation) {
  let frame = comp.new_frame("sum7", &[false; 7]);
  let fp = frame.frame_pointer();
  let mut sum = frame.formals()[0].exp(fp);
  for (k, f) in frame.formals().iter().enumerate().skip(1) {
    sum = add(sum, mul(c(k as i32 + 1), f.exp(fp)));
  }
  let sum7 = frame.name().clone();
  finish(comp, frame, vec![], sum);

  let frame = comp.new_frame("tigermain", &[]);
  let r = comp.gen.new_temp();
  let args = (1..=7).map(c).collect();
  let body =
    vec![set(r, tree::call(sum7, args)), printi(comp, &frame, t(r))];
  finish(comp, frame, body, t(r));
}

// An escaping formal and a local, both in the frame.
fn frame_locals(comp: &mut Compilation) {
  let mut frame = comp.new_frame("locals", &[true, false]);
  let fp = frame.frame_pointer();
  let local = frame.allocate_slot(8, true, &mut comp.gen);
  let (x, y) = (frame.formals()[0].exp(fp), frame.formals()[1].exp(fp));
  let body = vec![
    tree::mov(local.exp(fp), mul(x.clone(), c(2))),
    tree::mov(x.clone(), add(x.clone(), y)),
  ];
  let locals = frame.name().clone();
  finish(comp, frame, body, add(local.exp(fp), x));

  let frame = comp.new_frame("tigermain", &[]);
  let r = comp.gen.new_temp();
  let body = vec![
    set(r, tree::call(locals, vec![c(5), c(7)])),
    printi(comp, &frame, t(r)),
  ];
  finish(comp, frame, body, t(r));
}

// Recursive factorial, with a value live across the recursive call.
fn fact(comp: &mut Compilation) {
  let frame = comp.new_frame("fact", &[false]);
  let fp = frame.frame_pointer();
  let n = frame.formals()[0].exp(fp);
  let fact = frame.name().clone();
  let g = &mut comp.gen;
  let (r, sub_r) = (g.new_temp(), g.new_temp());
  let (base, rec, done) = (g.new_label(), g.new_label(), g.new_label());
  let body = vec![
    tree::cjump(RelOp::Le, n.clone(), c(1), base.clone(), rec.clone()),
    Stm::Label(rec),
    set(sub_r, tree::call(fact.clone(), vec![sub(n.clone(), c(1))])),
    set(r, mul(n, t(sub_r))),
    tree::jump(done.clone()),
    Stm::Label(base),
    set(r, c(1)),
    Stm::Label(done),
  ];
  finish(comp, frame, body, t(r));

  let frame = comp.new_frame("tigermain", &[]);
  let g = &mut comp.gen;
  let (k, x) = (g.new_temp(), g.new_temp());
  let body = vec![
    set(k, c(77)),
    set(x, tree::call(fact, vec![c(10)])),
    printi(comp, &frame, t(x)),
  ];
  finish(comp, frame, body, add(t(x), t(k)));
}

// More values live at once than there are registers.
fn high_pressure(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let vs: Vec<Temp> = (0..14).map(|_| comp.gen.new_temp()).collect();
  let s = comp.gen.new_temp();
  let mut body = vec![];
  for (i, v) in vs.iter().enumerate() {
    body.push(set(*v, add(mul(c(i as i32), c(3)), c(1))));
  }
  body.push(set(s, c(0)));
  for v in vs.iter().rev() {
    body.push(set(s, add(t(s), t(*v))));
  }
  body.push(printi(comp, &frame, t(s)));
  let result = add(t(s), add(mul(t(vs[0]), t(vs[13])), mul(t(vs[5]), t(vs[6]))));
  finish(comp, frame, body, result);
}

// Values live across runtime calls, which clobber the caller-saved registers.
fn live_across_call(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let vs: Vec<Temp> = (0..8).map(|_| comp.gen.new_temp()).collect();
  let mut body = vec![];
  for (i, v) in vs.iter().enumerate() {
    body.push(set(*v, c(10 * i as i32 + 1)));
    body.push(printi(comp, &frame, t(*v)));
  }
  let mut sum = t(vs[0]);
  for v in &vs[1..] {
    sum = add(sum, t(*v));
  }
  finish(comp, frame, body, sum);
}

fn strings(comp: &mut Compilation) {
  let hello = comp.add_string("hello, world\n");
  let frame = comp.new_frame("tigermain", &[]);
  let print = comp.gen.named_label("print");
  let body = vec![
    Stm::Exp(frame.external_call(print, vec![Exp::Name(hello)])),
    printi(comp, &frame, c(42)),
  ];
  finish(comp, frame, body, c(0));
}

// An array of squares and a record, on the heap.
fn arrays(comp: &mut Compilation) {
  let frame = comp.new_frame("tigermain", &[]);
  let init_array = comp.gen.named_label("initArray");
  let alloc_record = comp.gen.named_label("allocRecord");
  let g = &mut comp.gen;
  let (arr, rec, i, j, s) =
    (g.new_temp(), g.new_temp(), g.new_temp(), g.new_temp(), g.new_temp());
  let elem = |k: Temp| tree::mem(add(t(arr), mul(t(k), c(8))));
  let mut body =
    vec![set(arr, frame.external_call(init_array, vec![c(10), c(0)]))];
  body.extend(counted_loop(
    comp,
    i,
    c(10),
    vec![tree::mov(elem(i), mul(t(i), t(i)))],
  ));
  body.push(set(s, c(0)));
  body.extend(counted_loop(comp, j, c(10), vec![set(s, add(t(s), elem(j)))]));
  body.push(printi(comp, &frame, t(s)));
  body.push(set(rec, frame.external_call(alloc_record, vec![c(16)])));
  body.push(tree::mov(tree::mem(t(rec)), c(5)));
  body.push(tree::mov(tree::mem(add(t(rec), c(8))), c(6)));
  let result = add(
    t(s),
    mul(tree::mem(t(rec)), tree::mem(add(t(rec), c(8)))),
  );
  finish(comp, frame, body, result);
}

//=============================================================================
// Lookup

type Builder = fn(&mut Compilation);

const ALL_PROGRAMS: [(&str, Builder); 11] = [
  ("straight_line", straight_line),
  ("loop_sum", loop_sum),
  ("fib_iter", fib_iter),
  ("division", division),
  ("call7", call7),
  ("frame_locals", frame_locals),
  ("fact", fact),
  ("high_pressure", high_pressure),
  ("live_across_call", live_across_call),
  ("strings", strings),
  ("arrays", arrays),
];

pub fn all_names() -> Vec<String> {
  ALL_PROGRAMS.iter().map(|(name, _)| name.to_string()).collect()
}

/// Build program |name| for a backend with |budget| allocatable registers,
/// or return the names of all the programs.
pub fn find_program(name: &str, budget: usize) -> Result<Compilation, Vec<String>> {
  match ALL_PROGRAMS.iter().find(|(n, _)| *n == name) {
    Some((_, build)) => {
      let mut comp = Compilation::with_budget(budget);
      build(&mut comp);
      Ok(comp)
    }
    None => Err(all_names()),
  }
}
