/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the Tiger x86-64 backend: instruction
//! selection and graph-coloring register allocation.

// Make the analysis modules public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod flowgraph;
#[cfg(not(feature = "fuzzing"))]
mod flowgraph;
#[cfg(feature = "fuzzing")]
pub mod liveness;
#[cfg(not(feature = "fuzzing"))]
mod liveness;
#[cfg(feature = "fuzzing")]
pub mod color;
#[cfg(not(feature = "fuzzing"))]
mod color;
#[cfg(feature = "fuzzing")]
pub mod checker;
#[cfg(not(feature = "fuzzing"))]
mod checker;

mod assem;
mod codegen;
mod data_structures;
mod frame;
mod inst_stream;
mod interface;
mod trees_maps_sets;
pub mod tree;

pub use crate::assem::Instr;
pub use crate::checker::{CheckerError, CheckerErrors};
pub use crate::codegen::{codegen, Codegen};
pub use crate::interface::*;
