//! ROPForge - Automatic ROP Chain Compilation
//!
//! This library compiles a semantic goal, written in a small
//! intermediate language, into an executable return-oriented-programming
//! chain against a database of gadgets harvested from a target binary.
//!
//! # Features
//!
//! - **Gadget Semantic Lifting**: raw gadget bytes are decoded, lifted
//!   to a typed IR, and symbolically executed into per-gadget semantics
//! - **Typed Gadget Database**: multi-key indices answer exact and
//!   free-parameter queries, best gadget first
//! - **Strategy Engine**: per-instruction strategy graphs, rewrite
//!   rules, constraint-aware selection and interference-free scheduling
//! - **Constraint Support**: bad bytes, preserved registers, memory
//!   dereference safety, with typed failure reports
//! - **Two Architectures**: x86 and x86-64
//!
//! # Quick Start
//!
//! ```rust
//! use ropforge::{
//!     compile, Arch, ArchKind, CompileOptions, CompileOutcome, Constraint, GadgetDb,
//!     RawGadget,
//! };
//!
//! let arch = Arch::new(ArchKind::X64);
//! let mut db = GadgetDb::new();
//! db.analyse_raw_gadgets(
//!     &arch,
//!     &ropforge::BuiltinDecoder,
//!     &[RawGadget { addr: 0x400410, bytes: vec![0x58, 0xc3], bin_num: 0 }],
//! );
//!
//! let outcome = compile(
//!     &arch,
//!     &db,
//!     "rax = 0x42",
//!     &Constraint::new(),
//!     &CompileOptions::default(),
//! )
//! .unwrap();
//! match outcome {
//!     CompileOutcome::Chain(chain) => println!("{}", chain.dump_pretty()),
//!     CompileOutcome::Failed(record) => eprintln!("no chain: {record:?}"),
//!     CompileOutcome::Cancelled => eprintln!("cancelled"),
//! }
//! ```
//!
//! # Pipeline
//!
//! Data flows strictly bottom-up: expressions and conditions, the IR
//! symbolic executor, the per-architecture instruction lifter, the
//! gadget analyser, the database, the IL front-end, and finally the
//! strategy engine that emits chains.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod arch;
pub mod chain;
pub mod compiler;
pub mod constraint;
pub mod db;
pub mod error;
pub mod expr;
pub mod gadget;
pub mod il;
pub mod ir;
pub mod systems;

pub use arch::decode::{BuiltinDecoder, Decode, DecodedInstr};
pub use arch::{Arch, ArchKind};
pub use chain::{ChainItem, RopChain};
pub use compiler::{
    Abi, CancelFlag, CompileOptions, CompileOutcome, RopCompiler, StrategyGraph,
};
pub use constraint::{BadBytes, Constraint, FailRecord, KeepRegs, MemSafety};
pub use db::GadgetDb;
pub use error::{Result, RopError};
pub use gadget::{BranchKind, Gadget, GadgetId, RawGadget, RegSet};
pub use il::{IlInstruction, IlKind};
pub use systems::System;

/// Compile an IL program against a gadget database.
///
/// Convenience wrapper around [`RopCompiler`]. Input errors (bad IL,
/// unknown registers or syscalls) surface as [`RopError`]; an exhausted
/// search is the [`CompileOutcome::Failed`] value, not an error.
pub fn compile(
    arch: &Arch,
    db: &GadgetDb,
    program: &str,
    constraint: &Constraint,
    options: &CompileOptions,
) -> Result<CompileOutcome> {
    RopCompiler::new(arch, db).compile(program, constraint, options)
}

/// Get version information for this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
