//! Embr: a small dynamically typed scripting language.
//!
//! The pipeline is a single-pass Pratt compiler that emits bytecode straight
//! into a [`chunk::Chunk`], and a stack VM that executes it. There is no AST.

pub mod chunk;
pub mod compiler;
pub mod dis;
pub mod error;
pub mod lexer;
pub mod opcode;
pub mod value;
pub mod vm;

pub use error::EmbrError;
pub use vm::{Host, Vm};
