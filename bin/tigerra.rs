/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

mod fuzzing;
mod test_cases;
mod test_framework;
mod validator;

use tigerback::{Options, RegAllocError};
use test_framework::{check_results, run_program, RunStage};

use clap;
use log::{self, error, info};
use pretty_env_logger;

const NUM_ALLOCATABLE: usize = 9;

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("tigerra")
    .about("a driver for testing the Tiger backend's register allocator")
    .arg(
      clap::Arg::with_name("test")
        .short('t')
        .takes_value(true)
        .required(true)
        .help("test case name"),
    )
    .arg(
      clap::Arg::with_name("budget")
        .short('k')
        .takes_value(true)
        .help("number of allocatable registers, 1 to 9 (9 if not set)"),
    )
    .arg(
      clap::Arg::with_name("checker")
        .short('c')
        .help("verify the allocation with the checker"),
    )
    .arg(
      clap::Arg::with_name("rounds")
        .short('r')
        .takes_value(true)
        .help("maximum number of coloring rounds (64 if not set)"),
    );
  let matches = app.get_matches();

  let budget = match matches.value_of("budget").map(|s| s.parse::<usize>()) {
    None => NUM_ALLOCATABLE,
    Some(Ok(k)) if k >= 1 && k <= NUM_ALLOCATABLE => k,
    Some(_) => {
      println!("invalid budget: must be between 1 and {}", NUM_ALLOCATABLE);
      return;
    }
  };

  let mut opts = Options::default();
  opts.run_checker = matches.is_present("checker");
  if let Some(rounds) = matches.value_of("rounds") {
    match rounds.parse::<u32>() {
      Ok(n) if n >= 1 => opts.max_rounds = n,
      _ => {
        println!("invalid number of rounds: {}", rounds);
        return;
      }
    }
  }

  let name = matches.value_of("test").unwrap();
  let comp = match test_cases::find_program(name, budget) {
    Ok(comp) => comp,
    Err(available_names) => {
      error!("can't find program with name '{}'", name);
      println!("available program names are:");
      for name in available_names {
        println!("     {}", name);
      }
      return;
    }
  };

  info!("Allocating with {} registers", budget);
  let program = match comp.compile(&opts) {
    Err(e) => {
      println!("allocation failed: {}", e);
      if let RegAllocError::Checker(errors) = &e {
        for err in &errors.errors {
          println!("  {:?}", err);
        }
      }
      return;
    }
    Ok(p) => p,
  };

  for p in &program.procs {
    println!("");
    println!("{} before allocation:", p.proc.name);
    for instr in &p.unallocated {
      println!("  {:?}", instr);
    }
    println!(
      "{}: {} rounds, spilled {:?}, frame size {}",
      p.proc.name, p.num_rounds, p.spilled, p.proc.frame_size
    );
  }
  println!("");
  print!("{}", program.render());

  let before_regalloc_result =
    run_program(&program, "Before allocation", RunStage::BeforeRegalloc);
  let after_regalloc_result =
    run_program(&program, "After allocation", RunStage::AfterRegalloc);

  println!("");

  check_results(before_regalloc_result, after_regalloc_result);
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use crate::test_framework::RunResult;

  pub fn run_both(
    name: &str, budget: usize,
  ) -> (Result<RunResult, String>, Result<RunResult, String>) {
    let _ = pretty_env_logger::try_init();
    let comp = test_cases::find_program(name, budget).unwrap();
    let opts = Options { run_checker: true, ..Options::default() };
    let program = comp.compile(&opts).unwrap_or_else(|err| {
      panic!("allocation failed: {}", err);
    });
    print!("{}", program.render());
    let before = run_program(&program, "Before allocation", RunStage::BeforeRegalloc);
    let after = run_program(&program, "After allocation", RunStage::AfterRegalloc);
    (before, after)
  }

  pub fn check_program(name: &str, budget: usize) {
    let (before, after) = run_both(name, budget);
    check_results(before, after);
  }

  /// Check the result and output of |name| as well as agreement between the
  /// two runs.
  pub fn check_output(name: &str, budget: usize, ret_value: i64, stdout: &str) {
    let (before, after) = run_both(name, budget);
    let result = before.as_ref().unwrap_or_else(|err| panic!("run failed: {}", err));
    assert_eq!(result.ret_value, ret_value);
    assert_eq!(result.stdout, stdout);
    check_results(before, after);
  }
}

#[test]
fn straight_line() {
  test_utils::check_output("straight_line", 9, 21, "14\n");
  for k in 1..9 {
    test_utils::check_program("straight_line", k);
  }
}

#[test]
fn loop_sum() {
  test_utils::check_output("loop_sum", 9, 55, "55\n");
  for k in 2..9 {
    test_utils::check_program("loop_sum", k);
  }
}

#[test]
fn fib_iter() {
  test_utils::check_output("fib_iter", 9, 6765, "6765\n");
  for k in 2..9 {
    test_utils::check_program("fib_iter", k);
  }
}

#[test]
fn division() {
  test_utils::check_output("division", 9, 2, "14\n-14\n");
  for k in 2..9 {
    test_utils::check_program("division", k);
  }
}

#[test]
fn call7() {
  test_utils::check_output("call7", 9, 140, "140\n");
  for k in 2..9 {
    test_utils::check_program("call7", k);
  }
}

#[test]
fn frame_locals() {
  test_utils::check_output("frame_locals", 9, 22, "22\n");
  test_utils::check_program("frame_locals", 3);
}

#[test]
fn fact() {
  test_utils::check_output("fact", 9, 3628877, "3628800\n");
  for k in 2..9 {
    test_utils::check_program("fact", k);
  }
}

#[test]
fn high_pressure() {
  // 14 values 1, 4, .., 40 summed, plus 1 * 40 + 16 * 19.
  test_utils::check_output("high_pressure", 9, 287 + 40 + 304, "287\n");
  for k in 2..9 {
    test_utils::check_program("high_pressure", k);
  }
}

#[test]
fn live_across_call() {
  test_utils::check_output(
    "live_across_call",
    9,
    288,
    "1\n11\n21\n31\n41\n51\n61\n71\n",
  );
  test_utils::check_program("live_across_call", 2);
}

#[test]
fn strings() {
  test_utils::check_output("strings", 9, 0, "hello, world\n42\n");
}

#[test]
fn arrays() {
  test_utils::check_output("arrays", 9, 315, "285\n");
  for k in 2..9 {
    test_utils::check_program("arrays", k);
  }
}

#[test]
fn unknown_programs_list_the_others() {
  match test_cases::find_program("no_such_program", 9) {
    Err(names) => assert!(names.contains(&"fact".to_string())),
    Ok(_) => panic!("found a program that does not exist"),
  }
}
