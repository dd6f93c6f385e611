use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DsoError;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    FUNC_DECL,
    CREATE_OBJECT,
    ADD_OBJECT,
    END_OBJECT,
    JMPIFFNOT,
    JMPIFNOT,
    JMPIFF,
    JMPIF,
    JMPIFNOT_NP,
    JMPIF_NP,
    JMP,
    RETURN,
    CMPEQ,
    CMPGR,
    CMPGE,
    CMPLT,
    CMPLE,
    CMPNE,
    XOR,
    MOD,
    BITAND,
    BITOR,
    NOT,
    NOTF,
    ONESCOMPLEMENT,
    SHR,
    SHL,
    AND,
    OR,
    ADD,
    SUB,
    MUL,
    DIV,
    NEG,
    SETCURVAR,
    SETCURVAR_CREATE,
    SETCURVAR_ARRAY,
    SETCURVAR_ARRAY_CREATE,
    LOADVAR_UINT,
    LOADVAR_FLT,
    LOADVAR_STR,
    SAVEVAR_UINT,
    SAVEVAR_FLT,
    SAVEVAR_STR,
    SETCUROBJECT,
    SETCUROBJECT_NEW,
    SETCURFIELD,
    SETCURFIELD_ARRAY,
    LOADFIELD_UINT,
    LOADFIELD_FLT,
    LOADFIELD_STR,
    SAVEFIELD_UINT,
    SAVEFIELD_FLT,
    SAVEFIELD_STR,
    STR_TO_UINT,
    STR_TO_FLT,
    STR_TO_NONE,
    FLT_TO_UINT,
    FLT_TO_STR,
    FLT_TO_NONE,
    UINT_TO_FLT,
    UINT_TO_STR,
    UINT_TO_NONE,
    LOADIMMED_UINT,
    LOADIMMED_FLT,
    TAG_TO_STR,
    LOADIMMED_STR,
    LOADIMMED_IDENT,
    CALLFUNC_RESOLVE,
    CALLFUNC,
    ADVANCE_STR,
    ADVANCE_STR_APPENDCHAR,
    ADVANCE_STR_COMMA,
    ADVANCE_STR_NUL,
    REWIND_STR,
    TERMINATE_REWIND_STR,
    COMPARE_STR,
    PUSH,
    PUSH_FRAME,
    BREAK,
    INVALID,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OP_{:?}", self)
    }
}

/// Numbering used by the stock Torque Game Engine 1.x compiler.
static TGE_OPCODES: &[Opcode] = &[
    Opcode::FUNC_DECL,
    Opcode::CREATE_OBJECT,
    Opcode::ADD_OBJECT,
    Opcode::END_OBJECT,
    Opcode::JMPIFFNOT,
    Opcode::JMPIFNOT,
    Opcode::JMPIFF,
    Opcode::JMPIF,
    Opcode::JMPIFNOT_NP,
    Opcode::JMPIF_NP,
    Opcode::JMP,
    Opcode::RETURN,
    Opcode::CMPEQ,
    Opcode::CMPGR,
    Opcode::CMPGE,
    Opcode::CMPLT,
    Opcode::CMPLE,
    Opcode::CMPNE,
    Opcode::XOR,
    Opcode::MOD,
    Opcode::BITAND,
    Opcode::BITOR,
    Opcode::NOT,
    Opcode::NOTF,
    Opcode::ONESCOMPLEMENT,
    Opcode::SHR,
    Opcode::SHL,
    Opcode::AND,
    Opcode::OR,
    Opcode::ADD,
    Opcode::SUB,
    Opcode::MUL,
    Opcode::DIV,
    Opcode::NEG,
    Opcode::SETCURVAR,
    Opcode::SETCURVAR_CREATE,
    Opcode::SETCURVAR_ARRAY,
    Opcode::SETCURVAR_ARRAY_CREATE,
    Opcode::LOADVAR_UINT,
    Opcode::LOADVAR_FLT,
    Opcode::LOADVAR_STR,
    Opcode::SAVEVAR_UINT,
    Opcode::SAVEVAR_FLT,
    Opcode::SAVEVAR_STR,
    Opcode::SETCUROBJECT,
    Opcode::SETCUROBJECT_NEW,
    Opcode::SETCURFIELD,
    Opcode::SETCURFIELD_ARRAY,
    Opcode::LOADFIELD_UINT,
    Opcode::LOADFIELD_FLT,
    Opcode::LOADFIELD_STR,
    Opcode::SAVEFIELD_UINT,
    Opcode::SAVEFIELD_FLT,
    Opcode::SAVEFIELD_STR,
    Opcode::STR_TO_UINT,
    Opcode::STR_TO_FLT,
    Opcode::STR_TO_NONE,
    Opcode::FLT_TO_UINT,
    Opcode::FLT_TO_STR,
    Opcode::FLT_TO_NONE,
    Opcode::UINT_TO_FLT,
    Opcode::UINT_TO_STR,
    Opcode::UINT_TO_NONE,
    Opcode::LOADIMMED_UINT,
    Opcode::LOADIMMED_FLT,
    Opcode::TAG_TO_STR,
    Opcode::LOADIMMED_STR,
    Opcode::LOADIMMED_IDENT,
    Opcode::CALLFUNC_RESOLVE,
    Opcode::CALLFUNC,
    Opcode::ADVANCE_STR,
    Opcode::ADVANCE_STR_APPENDCHAR,
    Opcode::ADVANCE_STR_COMMA,
    Opcode::ADVANCE_STR_NUL,
    Opcode::REWIND_STR,
    Opcode::TERMINATE_REWIND_STR,
    Opcode::COMPARE_STR,
    Opcode::PUSH,
    Opcode::PUSH_FRAME,
    Opcode::BREAK,
    Opcode::INVALID,
];

/// Maps numeric opcodes to instruction kinds.
///
/// Engines and games shuffle the numbering, so a table can be loaded from a
/// JSON array of opcode names given in numeric order, e.g.
/// `["FUNC_DECL", "CREATE_OBJECT", ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpcodeTable {
    opcodes: Vec<Opcode>,
}

impl OpcodeTable {
    pub fn tge() -> Self {
        Self { opcodes: TGE_OPCODES.to_vec() }
    }

    pub fn from_json(json: &str) -> Result<Self, DsoError> {
        let table: OpcodeTable = serde_json::from_str(json).map_err(|e| DsoError::OpcodeTable(e.to_string()))?;
        if table.opcodes.is_empty() {
            return Err(DsoError::OpcodeTable("opcode table is empty".into()));
        }
        Ok(table)
    }

    pub fn lookup(&self, word: u32) -> Option<Opcode> {
        self.opcodes.get(word as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::tge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tge_numbering() {
        let t = OpcodeTable::tge();
        assert_eq!(t.lookup(0), Some(Opcode::FUNC_DECL));
        assert_eq!(t.lookup(10), Some(Opcode::JMP));
        assert_eq!(t.lookup(69), Some(Opcode::CALLFUNC));
        assert_eq!(t.lookup(78), Some(Opcode::PUSH_FRAME));
        assert_eq!(t.lookup(81), None);
    }

    #[test]
    fn custom_table_from_json() {
        let t = OpcodeTable::from_json(r#"["RETURN", "JMP", "PUSH"]"#).unwrap();
        assert_eq!(t.lookup(0), Some(Opcode::RETURN));
        assert_eq!(t.lookup(2), Some(Opcode::PUSH));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn bad_json_table_is_rejected() {
        assert!(matches!(OpcodeTable::from_json(r#"["NOT_AN_OPCODE"]"#), Err(DsoError::OpcodeTable(_))));
        assert!(matches!(OpcodeTable::from_json("[]"), Err(DsoError::OpcodeTable(_))));
    }

    #[test]
    fn display_uses_op_prefix() {
        assert_eq!(Opcode::JMPIFNOT_NP.to_string(), "OP_JMPIFNOT_NP");
    }
}
