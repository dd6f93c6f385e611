use std::collections::HashMap;
use std::fmt::Write;

use crate::ast::CallType;
use crate::decode::{Instruction, InstructionKind};
use crate::flow::{BlockKind, BranchKind, ControlFlowTree};

fn operands(kind: &InstructionKind) -> String {
    use InstructionKind as K;

    match kind {
        K::FuncDecl { name, namespace, package, has_body, end, args } => {
            let mut s = match namespace {
                Some(ns) => format!("{ns}::{name}"),
                None => name.clone(),
            };
            let _ = write!(s, "({})", args.join(", "));
            if let Some(p) = package {
                let _ = write!(s, " package={p}");
            }
            if *has_body {
                let _ = write!(s, " end={end}");
            }
            s
        }
        K::CreateObject { parent, is_datablock, fail_jump } => format!(
            "parent={} datablock={} fail={}",
            parent.as_deref().unwrap_or("-"),
            is_datablock,
            fail_jump
        ),
        K::AddObject { place_at_root } | K::EndObject { place_at_root } => format!("root={place_at_root}"),
        K::Jump { target, .. } => target.to_string(),
        K::SetCurVar { name, .. } | K::SetCurField { name } => name.clone(),
        K::LoadImmedUint(v) => v.to_string(),
        K::LoadImmedFloat(v) => v.to_string(),
        K::LoadImmedStr(s) => format!("{s:?}"),
        K::LoadImmedIdent(s) => s.clone(),
        K::TagToStr(s) => format!("'{s}'"),
        K::CallFunc { name, namespace, call_type, .. } => {
            let kind = match call_type {
                CallType::Function => "function",
                CallType::Method => "method",
                CallType::Parent => "parent",
            };
            match namespace {
                Some(ns) => format!("{ns}::{name} ({kind})"),
                None => format!("{name} ({kind})"),
            }
        }
        K::AdvanceStrAppendChar(c) => format!("{c:?}"),
        K::Return { returns_value: true } => "value".into(),
        _ => String::new(),
    }
}

/// Instruction listing annotated with block boundaries, branch classes and
/// source line markers.
pub fn disassemble(instrs: &[Instruction], tree: &ControlFlowTree, line_breaks: &[(u32, u32)]) -> String {
    let lines: HashMap<u32, u32> = line_breaks.iter().map(|&(line, ip)| (ip, line)).collect();
    let mut out = String::new();

    for ins in instrs {
        for &id in tree.blocks_at(ins.addr) {
            let block = tree.block(id);
            let label = match block.kind {
                BlockKind::Root => continue,
                BlockKind::Conditional => "conditional",
                BlockKind::Loop => "loop",
            };
            let _ = write!(out, "      ; {label} [{}, {}]", block.start, block.end);
            if let Some(cp) = block.continue_point {
                let _ = write!(out, " continue={cp}");
            }
            out.push('\n');
        }

        let _ = write!(out, "{:05} {:<24}", ins.addr, ins.opcode.to_string());
        let ops = operands(&ins.kind);
        if !ops.is_empty() {
            let _ = write!(out, " {ops}");
        }
        if let Some(branch) = tree.branch(ins.addr) {
            let class = match branch.kind {
                BranchKind::Else => "else",
                BranchKind::Continue => "continue",
                BranchKind::Break => "break",
            };
            let _ = write!(out, "       ; {class}");
        }
        if let Some(line) = lines.get(&ins.addr) {
            let _ = write!(out, "       ; line {line}");
        }
        out.push('\n');
    }
    out
}
