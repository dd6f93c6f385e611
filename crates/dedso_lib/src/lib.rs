pub mod ast;
pub mod builder;
pub mod codegen;
pub mod decode;
pub mod disasm;
pub mod flow;
pub mod loader;
pub mod opcode;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::ast::Node;
pub use crate::decode::{Instruction, decode};
pub use crate::loader::{DSO_VERSION, DsoFile, load};
pub use crate::opcode::{Opcode, OpcodeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Source,
    Disasm,
    Ast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    /// Decode files whose version word differs from [`DSO_VERSION`] instead of rejecting them.
    pub allow_version_mismatch: bool,
    pub opcodes: OpcodeTable,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Source,
            allow_version_mismatch: false,
            opcodes: OpcodeTable::tge(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DsoError {
    #[error("unexpected end of input")]
    Eof,

    #[error("unsupported DSO version: {0} (expected {DSO_VERSION})")]
    InvalidVersion(u32),

    #[error("invalid string table offset: {0}")]
    InvalidStringOffset(u32),

    #[error("invalid float table index: {0}")]
    InvalidFloatIndex(u32),

    #[error("identifier patch at ip={ip} is outside the code ({code_len} words)")]
    InvalidIdentifierPatch { ip: u32, code_len: usize },

    #[error("invalid opcode table: {0}")]
    OpcodeTable(String),

    #[error("invalid opcode {word} at {addr}")]
    InvalidOpcode { addr: u32, word: u32 },

    #[error("truncated {opcode} at {addr}")]
    TruncatedOperand { addr: u32, opcode: Opcode },

    #[error("unresolved identifier operand at ip={ip} (instruction at {addr})")]
    UnresolvedIdentifier { addr: u32, ip: u32 },

    #[error("invalid call type {value} at {addr}")]
    InvalidCallType { addr: u32, value: u32 },

    #[error("invalid append character {value} at {addr}")]
    InvalidAppendChar { addr: u32, value: u32 },

    #[error("branch at {addr} targets {target}, which is not an instruction")]
    BranchTargetMissing { addr: u32, target: u32 },

    #[error("block [{start}, {end}] overlaps its enclosing block ending at {enclosing_end}")]
    OverlappingBlocks { start: u32, end: u32, enclosing_end: u32 },

    #[error("unbalanced block nesting ({open} blocks still open)")]
    UnbalancedBlocks { open: usize },

    #[error("{opcode} at {addr}: stack underflow")]
    StackUnderflow { addr: u32, opcode: Opcode },

    #[error("{opcode} at {addr}: expected {expected}, found {found}")]
    UnexpectedOperand { addr: u32, opcode: Opcode, expected: &'static str, found: &'static str },

    #[error("{opcode} at {addr}: no open argument frame")]
    FrameUnderflow { addr: u32, opcode: Opcode },

    #[error("nested function declaration at {addr}")]
    NestedFunction { addr: u32 },

    #[error("function body ending at {end} is still inside a nested block at {addr}")]
    UnbalancedFunction { addr: u32, end: u32 },

    #[error("object declaration depth underflow at {addr}")]
    ObjectDepthUnderflow { addr: u32 },

    #[error("{depth} object declarations left open at end of stream")]
    UnterminatedObject { depth: usize },

    #[error("string accumulator left open at {addr}")]
    UnclosedAccumulator { addr: u32 },

    #[error("unstructured branch at {addr}")]
    UnstructuredBranch { addr: u32 },

    #[error("{kind} cannot be printed as an expression")]
    StatementInExpression { kind: &'static str },

    #[error("float constant {0} has no script literal")]
    NonFiniteFloat(f64),

    #[error("failed to serialize syntax tree: {0}")]
    Serialize(String),
}

/// Recovers statements from a decoded instruction stream.
pub fn decompile_instructions(instrs: &[Instruction]) -> Result<Vec<Node>, DsoError> {
    let tree = flow::analyze(instrs)?;
    builder::build(instrs, &tree)
}

pub fn decompile_with_options(bytes: &[u8], options: &DecompileOptions) -> Result<String, DsoError> {
    let file = load(bytes)?;
    if file.version != DSO_VERSION {
        if !options.allow_version_mismatch {
            return Err(DsoError::InvalidVersion(file.version));
        }
        log::warn!("DSO version {} differs from {}, decoding anyway", file.version, DSO_VERSION);
    }

    let instrs = decode(&file, &options.opcodes)?;
    match options.mode {
        DecompileMode::Source => {
            let nodes = decompile_instructions(&instrs)?;
            let mut out = codegen::CodeWriter::new();
            codegen::generate_into(&nodes, &mut out)?;
            Ok(out.finish())
        }
        DecompileMode::Disasm => {
            let tree = flow::analyze(&instrs)?;
            Ok(disasm::disassemble(&instrs, &tree, &file.line_breaks))
        }
        DecompileMode::Ast => {
            let nodes = decompile_instructions(&instrs)?;
            serde_json::to_string_pretty(&nodes).map_err(|e| DsoError::Serialize(e.to_string()))
        }
    }
}

pub fn decompile(bytes: &[u8]) -> Result<String, DsoError> {
    decompile_with_options(bytes, &DecompileOptions::default())
}
