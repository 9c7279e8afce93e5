#![no_main]
use libfuzzer_sys::fuzz_target;

use tigerra::fuzzing::FuzzInstrs;
use tigerback::checker::check_coloring;
use tigerback::color::{color, ColorResult};
use tigerback::flowgraph::FlowGraph;
use tigerback::liveness::{compute_liveness, InterferenceGraph};
use tigerback::Frame;

fuzz_target!(|input: FuzzInstrs| {
    let g = match FlowGraph::build(&input.instrs) {
        Ok(g) => g,
        Err(err) => {
            println!("analysis error: {}", err.to_string());
            return;
        }
    };
    let live = compute_liveness(&g);
    let (ig, mut moves) = InterferenceGraph::build(&g, &live, &input.frame);

    match color(&ig, &mut moves, &input.frame) {
        ColorResult::Colored(mapping) => {
            if let Err(errors) = check_coloring(&ig, &mapping, &input.frame) {
                panic!("color.rs: bad coloring: {}", errors);
            }
            for (t, r) in mapping.iter() {
                assert!(input.frame.is_register(*r), "{:?} mapped to {:?}", t, r);
            }
        }
        ColorResult::Spilled(temps) => {
            assert!(!temps.is_empty());
            for t in &temps {
                assert!(!input.frame.is_register(*t), "spilled a register: {:?}", t);
            }
        }
    }
});
