use serde::{Deserialize, Serialize};

use crate::ast::{BinaryOp, CallType, UnaryOp};
use crate::loader::{DsoFile, StringTable};
use crate::opcode::{Opcode, OpcodeTable};
use crate::DsoError;

/// The VM's three native value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmType {
    Uint,
    Float,
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JumpKind {
    Always,
    IfNot,
    IfFloatNot,
    If,
    IfFloat,
    IfNotNp,
    IfNp,
}

impl JumpKind {
    pub fn is_conditional(self) -> bool {
        self != JumpKind::Always
    }

    /// `&&` / `||` markers that leave the tested value on the stack.
    pub fn is_short_circuit(self) -> bool {
        matches!(self, JumpKind::IfNotNp | JumpKind::IfNp)
    }

    pub fn jumps_when_true(self) -> bool {
        matches!(self, JumpKind::If | JumpKind::IfFloat | JumpKind::IfNp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstructionKind {
    FuncDecl {
        name: String,
        namespace: Option<String>,
        package: Option<String>,
        has_body: bool,
        end: u32,
        args: Vec<String>,
    },
    CreateObject {
        parent: Option<String>,
        is_datablock: bool,
        fail_jump: u32,
    },
    AddObject {
        place_at_root: bool,
    },
    EndObject {
        place_at_root: bool,
    },
    Jump {
        kind: JumpKind,
        target: u32,
    },
    Return {
        returns_value: bool,
    },
    Binary(BinaryOp),
    Unary(UnaryOp),
    SetCurVar {
        name: String,
        create: bool,
    },
    SetCurVarArray {
        create: bool,
    },
    LoadVar(VmType),
    SaveVar(VmType),
    SetCurObject,
    SetCurObjectNew,
    SetCurField {
        name: String,
    },
    SetCurFieldArray,
    LoadField(VmType),
    SaveField(VmType),
    Convert {
        from: VmType,
        to: Option<VmType>,
    },
    LoadImmedUint(u32),
    LoadImmedFloat(f64),
    LoadImmedStr(String),
    LoadImmedIdent(String),
    TagToStr(String),
    CallFunc {
        name: String,
        namespace: Option<String>,
        call_type: CallType,
        resolve: bool,
    },
    AdvanceStr,
    AdvanceStrAppendChar(char),
    AdvanceStrComma,
    AdvanceStrNul,
    RewindStr,
    TerminateRewindStr,
    CompareStr,
    Push,
    PushFrame,
    DebugBreak,
}

impl InstructionKind {
    /// Leaves a string on the VM's string stack.
    fn leaves_string(&self) -> bool {
        matches!(
            self,
            InstructionKind::LoadVar(VmType::Str)
                | InstructionKind::LoadField(VmType::Str)
                | InstructionKind::SaveVar(VmType::Str)
                | InstructionKind::SaveField(VmType::Str)
                | InstructionKind::LoadImmedStr(_)
                | InstructionKind::LoadImmedIdent(_)
                | InstructionKind::TagToStr(_)
                | InstructionKind::CallFunc { .. }
                | InstructionKind::Convert { to: Some(VmType::Str), .. }
                | InstructionKind::RewindStr
                | InstructionKind::TerminateRewindStr
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub addr: u32,
    pub size: u32,
    pub opcode: Opcode,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn next_addr(&self) -> u32 {
        self.addr + self.size
    }

    pub fn jump(&self) -> Option<(JumpKind, u32)> {
        match self.kind {
            InstructionKind::Jump { kind, target } => Some((kind, target)),
            _ => None,
        }
    }
}

struct Decoder<'a> {
    file: &'a DsoFile,
    ip: u32,
    addr: u32,
    opcode: Opcode,
    function_end: Option<u32>,
}

impl<'a> Decoder<'a> {
    fn word(&mut self) -> Result<u32, DsoError> {
        let w = self
            .file
            .code
            .get(self.ip as usize)
            .copied()
            .ok_or(DsoError::TruncatedOperand { addr: self.addr, opcode: self.opcode })?;
        self.ip += 1;
        Ok(w)
    }

    fn flag(&mut self) -> Result<bool, DsoError> {
        Ok(self.word()? != 0)
    }

    fn ident(&mut self) -> Result<Option<String>, DsoError> {
        let ip = self.ip;
        let w = self.word()?;
        match self.file.identifiers.get(&ip) {
            Some(name) => Ok(Some(name.clone())),
            None if w == 0 => Ok(None),
            None => Err(DsoError::UnresolvedIdentifier { addr: self.addr, ip }),
        }
    }

    fn required_ident(&mut self) -> Result<String, DsoError> {
        let ip = self.ip;
        self.ident()?.ok_or(DsoError::UnresolvedIdentifier { addr: self.addr, ip })
    }

    fn in_function(&self) -> bool {
        self.function_end.is_some()
    }

    fn strings(&self) -> &'a StringTable {
        if self.in_function() {
            &self.file.function_strings
        } else {
            &self.file.global_strings
        }
    }

    fn string(&mut self) -> Result<String, DsoError> {
        let offset = self.word()?;
        self.strings().get(offset).ok_or(DsoError::InvalidStringOffset(offset))
    }

    fn float(&mut self) -> Result<f64, DsoError> {
        let idx = self.word()?;
        let table = if self.in_function() { &self.file.function_floats } else { &self.file.global_floats };
        table.get(idx as usize).copied().ok_or(DsoError::InvalidFloatIndex(idx))
    }

    fn call_type(&mut self) -> Result<CallType, DsoError> {
        match self.word()? {
            0 => Ok(CallType::Function),
            1 => Ok(CallType::Method),
            2 => Ok(CallType::Parent),
            v => Err(DsoError::InvalidCallType { addr: self.addr, value: v }),
        }
    }

    fn jump(&mut self, kind: JumpKind) -> Result<InstructionKind, DsoError> {
        Ok(InstructionKind::Jump { kind, target: self.word()? })
    }

    fn operands(&mut self, live_string: bool) -> Result<InstructionKind, DsoError> {
        use InstructionKind as K;

        Ok(match self.opcode {
            Opcode::FUNC_DECL => {
                let name = self.required_ident()?;
                let namespace = self.ident()?;
                let package = self.ident()?;
                let has_body = self.flag()?;
                let end = self.word()?;
                let argc = self.word()?;
                let mut args = Vec::with_capacity(argc.min(64) as usize);
                for _ in 0..argc {
                    args.push(self.required_ident()?);
                }
                K::FuncDecl { name, namespace, package, has_body, end, args }
            }
            Opcode::CREATE_OBJECT => K::CreateObject {
                parent: self.ident()?,
                is_datablock: self.flag()?,
                fail_jump: self.word()?,
            },
            Opcode::ADD_OBJECT => K::AddObject { place_at_root: self.flag()? },
            Opcode::END_OBJECT => K::EndObject { place_at_root: self.flag()? },
            Opcode::JMPIFFNOT => self.jump(JumpKind::IfFloatNot)?,
            Opcode::JMPIFNOT => self.jump(JumpKind::IfNot)?,
            Opcode::JMPIFF => self.jump(JumpKind::IfFloat)?,
            Opcode::JMPIF => self.jump(JumpKind::If)?,
            Opcode::JMPIFNOT_NP => self.jump(JumpKind::IfNotNp)?,
            Opcode::JMPIF_NP => self.jump(JumpKind::IfNp)?,
            Opcode::JMP => self.jump(JumpKind::Always)?,
            Opcode::RETURN => K::Return { returns_value: live_string },
            Opcode::CMPEQ => K::Binary(BinaryOp::Equal),
            Opcode::CMPGR => K::Binary(BinaryOp::Greater),
            Opcode::CMPGE => K::Binary(BinaryOp::GreaterEqual),
            Opcode::CMPLT => K::Binary(BinaryOp::Less),
            Opcode::CMPLE => K::Binary(BinaryOp::LessEqual),
            Opcode::CMPNE => K::Binary(BinaryOp::NotEqual),
            Opcode::XOR => K::Binary(BinaryOp::Xor),
            Opcode::MOD => K::Binary(BinaryOp::Mod),
            Opcode::BITAND => K::Binary(BinaryOp::BitAnd),
            Opcode::BITOR => K::Binary(BinaryOp::BitOr),
            Opcode::NOT | Opcode::NOTF => K::Unary(UnaryOp::Not),
            Opcode::ONESCOMPLEMENT => K::Unary(UnaryOp::Complement),
            Opcode::SHR => K::Binary(BinaryOp::Shr),
            Opcode::SHL => K::Binary(BinaryOp::Shl),
            Opcode::AND => K::Binary(BinaryOp::And),
            Opcode::OR => K::Binary(BinaryOp::Or),
            Opcode::ADD => K::Binary(BinaryOp::Add),
            Opcode::SUB => K::Binary(BinaryOp::Sub),
            Opcode::MUL => K::Binary(BinaryOp::Mul),
            Opcode::DIV => K::Binary(BinaryOp::Div),
            Opcode::NEG => K::Unary(UnaryOp::Neg),
            Opcode::SETCURVAR => K::SetCurVar { name: self.required_ident()?, create: false },
            Opcode::SETCURVAR_CREATE => K::SetCurVar { name: self.required_ident()?, create: true },
            Opcode::SETCURVAR_ARRAY => K::SetCurVarArray { create: false },
            Opcode::SETCURVAR_ARRAY_CREATE => K::SetCurVarArray { create: true },
            Opcode::LOADVAR_UINT => K::LoadVar(VmType::Uint),
            Opcode::LOADVAR_FLT => K::LoadVar(VmType::Float),
            Opcode::LOADVAR_STR => K::LoadVar(VmType::Str),
            Opcode::SAVEVAR_UINT => K::SaveVar(VmType::Uint),
            Opcode::SAVEVAR_FLT => K::SaveVar(VmType::Float),
            Opcode::SAVEVAR_STR => K::SaveVar(VmType::Str),
            Opcode::SETCUROBJECT => K::SetCurObject,
            Opcode::SETCUROBJECT_NEW => K::SetCurObjectNew,
            Opcode::SETCURFIELD => K::SetCurField { name: self.required_ident()? },
            Opcode::SETCURFIELD_ARRAY => K::SetCurFieldArray,
            Opcode::LOADFIELD_UINT => K::LoadField(VmType::Uint),
            Opcode::LOADFIELD_FLT => K::LoadField(VmType::Float),
            Opcode::LOADFIELD_STR => K::LoadField(VmType::Str),
            Opcode::SAVEFIELD_UINT => K::SaveField(VmType::Uint),
            Opcode::SAVEFIELD_FLT => K::SaveField(VmType::Float),
            Opcode::SAVEFIELD_STR => K::SaveField(VmType::Str),
            Opcode::STR_TO_UINT => K::Convert { from: VmType::Str, to: Some(VmType::Uint) },
            Opcode::STR_TO_FLT => K::Convert { from: VmType::Str, to: Some(VmType::Float) },
            Opcode::STR_TO_NONE => K::Convert { from: VmType::Str, to: None },
            Opcode::FLT_TO_UINT => K::Convert { from: VmType::Float, to: Some(VmType::Uint) },
            Opcode::FLT_TO_STR => K::Convert { from: VmType::Float, to: Some(VmType::Str) },
            Opcode::FLT_TO_NONE => K::Convert { from: VmType::Float, to: None },
            Opcode::UINT_TO_FLT => K::Convert { from: VmType::Uint, to: Some(VmType::Float) },
            Opcode::UINT_TO_STR => K::Convert { from: VmType::Uint, to: Some(VmType::Str) },
            Opcode::UINT_TO_NONE => K::Convert { from: VmType::Uint, to: None },
            Opcode::LOADIMMED_UINT => K::LoadImmedUint(self.word()?),
            Opcode::LOADIMMED_FLT => K::LoadImmedFloat(self.float()?),
            Opcode::TAG_TO_STR => {
                let s = self.string()?;
                // Tagged strings are stored behind a one byte marker.
                K::TagToStr(s.strip_prefix('\u{1}').map(str::to_string).unwrap_or(s))
            }
            Opcode::LOADIMMED_STR => K::LoadImmedStr(self.string()?),
            Opcode::LOADIMMED_IDENT => K::LoadImmedIdent(self.required_ident()?),
            Opcode::CALLFUNC_RESOLVE | Opcode::CALLFUNC => {
                let name = self.required_ident()?;
                let namespace = self.ident()?;
                let call_type = self.call_type()?;
                K::CallFunc { name, namespace, call_type, resolve: self.opcode == Opcode::CALLFUNC_RESOLVE }
            }
            Opcode::ADVANCE_STR => K::AdvanceStr,
            Opcode::ADVANCE_STR_APPENDCHAR => {
                let w = self.word()?;
                let c = char::from_u32(w).ok_or(DsoError::InvalidAppendChar { addr: self.addr, value: w })?;
                K::AdvanceStrAppendChar(c)
            }
            Opcode::ADVANCE_STR_COMMA => K::AdvanceStrComma,
            Opcode::ADVANCE_STR_NUL => K::AdvanceStrNul,
            Opcode::REWIND_STR => K::RewindStr,
            Opcode::TERMINATE_REWIND_STR => K::TerminateRewindStr,
            Opcode::COMPARE_STR => K::CompareStr,
            Opcode::PUSH => K::Push,
            Opcode::PUSH_FRAME => K::PushFrame,
            Opcode::BREAK => K::DebugBreak,
            Opcode::INVALID => return Err(DsoError::InvalidOpcode { addr: self.addr, word: self.file.code[self.addr as usize] }),
        })
    }
}

pub fn decode(file: &DsoFile, table: &OpcodeTable) -> Result<Vec<Instruction>, DsoError> {
    let mut d = Decoder { file, ip: 0, addr: 0, opcode: Opcode::INVALID, function_end: None };
    let mut out: Vec<Instruction> = Vec::new();
    let mut live_string = false;

    while (d.ip as usize) < file.code.len() {
        if d.function_end.is_some_and(|end| d.ip >= end) {
            d.function_end = None;
        }
        d.addr = d.ip;
        let word = file.code[d.ip as usize];
        d.opcode = table.lookup(word).ok_or(DsoError::InvalidOpcode { addr: d.addr, word })?;
        d.ip += 1;

        let kind = d.operands(live_string)?;
        if let InstructionKind::FuncDecl { has_body: true, end, .. } = &kind {
            d.function_end = Some(*end);
        }
        live_string = kind.leaves_string();

        out.push(Instruction { addr: d.addr, size: d.ip - d.addr, opcode: d.opcode, kind });
    }

    log::debug!("decoded {} instructions from {} code words", out.len(), file.code.len());
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::loader::{self, DSO_VERSION};
    use crate::loader::tests::DsoBytes;

    /// Opcode numbers in the stock table.
    pub(crate) fn op(o: Opcode) -> u32 {
        let t = OpcodeTable::tge();
        (0..t.len() as u32).find(|&w| t.lookup(w) == Some(o)).unwrap()
    }

    #[test]
    fn function_body_reads_function_tables() {
        // function foo(%a) { return "in"; }  "out";
        let code = vec![
            op(Opcode::FUNC_DECL), 0, 0, 0, 1, 11, 1, 0,
            op(Opcode::LOADIMMED_STR), 0,
            op(Opcode::RETURN),
            op(Opcode::LOADIMMED_STR), 0,
            op(Opcode::LOADIMMED_FLT), 0,
        ];
        let bytes = DsoBytes {
            version: DSO_VERSION,
            global_strings: b"foo\0%a\0".to_vec(),
            global_floats: vec![4.5],
            function_strings: b"in\0".to_vec(),
            code,
            identifiers: vec![(0, vec![1]), (4, vec![7])],
            ..Default::default()
        }
        .to_bytes();
        let file = loader::load(&bytes).unwrap();
        let ins = decode(&file, &OpcodeTable::tge()).unwrap();

        assert_eq!(ins.len(), 5);
        assert_eq!(
            ins[0].kind,
            InstructionKind::FuncDecl {
                name: "foo".into(),
                namespace: None,
                package: None,
                has_body: true,
                end: 11,
                args: vec!["%a".into()],
            }
        );
        assert_eq!(ins[0].size, 8);
        assert_eq!(ins[1].kind, InstructionKind::LoadImmedStr("in".into()));
        assert_eq!(ins[2].kind, InstructionKind::Return { returns_value: true });
        assert_eq!(ins[3].addr, 11);
        assert_eq!(ins[3].kind, InstructionKind::LoadImmedStr("foo".into()));
        assert_eq!(ins[4].kind, InstructionKind::LoadImmedFloat(4.5));
    }

    #[test]
    fn return_without_live_string_has_no_value() {
        let code = vec![op(Opcode::LOADIMMED_UINT), 3, op(Opcode::UINT_TO_NONE), op(Opcode::RETURN)];
        let file = loader::load(&DsoBytes { version: DSO_VERSION, code, ..Default::default() }.to_bytes()).unwrap();
        let ins = decode(&file, &OpcodeTable::tge()).unwrap();
        assert_eq!(ins[2].kind, InstructionKind::Return { returns_value: false });
    }

    #[test]
    fn string_stores_leave_a_return_value() {
        for store in [Opcode::SAVEVAR_STR, Opcode::SAVEFIELD_STR, Opcode::TERMINATE_REWIND_STR] {
            let code = vec![op(store), op(Opcode::RETURN)];
            let file = loader::load(&DsoBytes { version: DSO_VERSION, code, ..Default::default() }.to_bytes()).unwrap();
            let ins = decode(&file, &OpcodeTable::tge()).unwrap();
            assert_eq!(ins[1].kind, InstructionKind::Return { returns_value: true }, "after {store:?}");
        }
    }

    #[test]
    fn call_operands() {
        let code = vec![op(Opcode::CALLFUNC), 0, 0, 1];
        let file = loader::load(
            &DsoBytes {
                version: DSO_VERSION,
                global_strings: b"schedule\0".to_vec(),
                code,
                identifiers: vec![(0, vec![1])],
                ..Default::default()
            }
            .to_bytes(),
        )
        .unwrap();
        let ins = decode(&file, &OpcodeTable::tge()).unwrap();
        assert_eq!(
            ins[0].kind,
            InstructionKind::CallFunc {
                name: "schedule".into(),
                namespace: None,
                call_type: CallType::Method,
                resolve: false,
            }
        );
    }

    #[test]
    fn truncated_operand_is_an_error() {
        let code = vec![op(Opcode::JMP)];
        let file = loader::load(&DsoBytes { version: DSO_VERSION, code, ..Default::default() }.to_bytes()).unwrap();
        assert!(matches!(
            decode(&file, &OpcodeTable::tge()),
            Err(DsoError::TruncatedOperand { addr: 0, opcode: Opcode::JMP })
        ));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let file = loader::load(&DsoBytes { version: DSO_VERSION, code: vec![200], ..Default::default() }.to_bytes()).unwrap();
        assert!(matches!(decode(&file, &OpcodeTable::tge()), Err(DsoError::InvalidOpcode { addr: 0, word: 200 })));
    }
}
