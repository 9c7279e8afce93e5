#![no_main]
use libfuzzer_sys::fuzz_target;

use tigerra::fuzzing::FuzzProgram;
use tigerra::test_framework::{check_results, run_program, RunStage};
use tigerra::validator;
use tigerback::{Options, RegAllocError};

static mut COUNTER_GEN: usize = 0;
static mut COUNTER_OK: usize = 0;

fuzz_target!(|prog: FuzzProgram| {
    let (num_gen, num_ok) = unsafe {
        COUNTER_GEN += 1;
        (COUNTER_GEN, COUNTER_OK)
    };

    println!(
        "=== status: #ok/#total: {}/{} == {} ",
        num_ok,
        num_gen,
        100.0 * (num_ok as f64) / (num_gen as f64)
    );

    for (name, body) in &prog.bodies {
        if let Err(msg) = validator::validate(name, body) {
            panic!("differential.rs: generated a malformed program: {}", msg);
        }
    }

    let opts = Options { run_checker: true, ..Options::default() };
    let budget = prog.budget;
    let rendered = format!("{:?}", prog);
    let program = match prog.into_compilation().compile(&opts) {
        Ok(program) => {
            unsafe {
                COUNTER_OK += 1;
            }
            program
        }
        Err(err) => {
            if let RegAllocError::Checker(_) = &err {
                println!("{}", rendered);
                panic!("differential.rs: checker error with {} registers: {}", budget, err);
            }
            println!("allocation error: {}", err);
            return;
        }
    };

    let before = run_program(&program, "Before allocation", RunStage::BeforeRegalloc);
    let after = run_program(&program, "After allocation", RunStage::AfterRegalloc);
    check_results(before, after);
});
