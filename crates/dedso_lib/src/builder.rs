use crate::ast::{BinaryOp, Constant, Join, LoopKind, Node, ObjectDeclaration, StringOp, UnaryOp, STATEMENT};
use crate::decode::{Instruction, InstructionKind};
use crate::flow::{BlockId, BlockKind, BranchKind, ControlFlowBranch, ControlFlowTree};
use crate::DsoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccumulatorKind {
    Concat(Join),
    Comma,
    Compare,
}

/// Left half of a string operation opened by one of the `ADVANCE_STR` family.
#[derive(Debug)]
struct Accumulator {
    left: Node,
    kind: AccumulatorKind,
}

#[derive(Debug)]
enum Operand {
    Node(Node),
    Accumulator(Accumulator),
}

#[derive(Debug, Default)]
struct Scope {
    operands: Vec<Operand>,
}

#[derive(Debug)]
struct FunctionContext {
    name: String,
    namespace: Option<String>,
    package: Option<String>,
    args: Vec<String>,
    end: u32,
    depth: usize,
}

/// Where the next `SETCURFIELD` takes its object from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldTarget {
    None,
    Popped,
    NewObject,
}

/// A `&&` / `||` marker waiting for its right operand to be complete.
struct PendingLogic<'a> {
    target: u32,
    op: BinaryOp,
    ins: &'a Instruction,
}

struct LoopParts {
    condition: Node,
    body: Vec<Node>,
    end: Vec<Node>,
    next: usize,
}

impl LoopParts {
    fn into_do_while(self) -> Node {
        let mut body = self.body;
        body.extend(self.end);
        Node::Loop { kind: LoopKind::DoWhile, init: None, condition: Box::new(self.condition), end: None, body }
    }
}

fn underflow(ins: &Instruction) -> DsoError {
    DsoError::StackUnderflow { addr: ins.addr, opcode: ins.opcode }
}

fn unexpected(ins: &Instruction, expected: &'static str, found: &'static str) -> DsoError {
    DsoError::UnexpectedOperand { addr: ins.addr, opcode: ins.opcode, expected, found }
}

fn frame_underflow(ins: &Instruction) -> DsoError {
    DsoError::FrameUnderflow { addr: ins.addr, opcode: ins.opcode }
}

/// An `if`/`else` whose branches each left exactly one value is a `?:`.
/// Any other statement cannot be used as a value.
fn into_expression(node: Node) -> Result<Node, &'static str> {
    match node {
        Node::If { condition, then_body, else_body } => {
            match (<[Node; 1]>::try_from(then_body), <[Node; 1]>::try_from(else_body)) {
                (Ok([then_value]), Ok([else_value])) => Ok(Node::Conditional {
                    condition,
                    then_value: Box::new(into_expression(then_value)?),
                    else_value: Box::new(into_expression(else_value)?),
                }),
                _ => Err("if"),
            }
        }
        node if node.precedence() == STATEMENT => Err(node.kind_name()),
        node => Ok(node),
    }
}

struct Builder<'a> {
    instrs: &'a [Instruction],
    tree: &'a ControlFlowTree,
    current: Scope,
    saved: Vec<Scope>,
    frames: Vec<Vec<Node>>,
    function: Option<FunctionContext>,
    object_depth: usize,
    field_target: FieldTarget,
    pending_logic: Vec<PendingLogic<'a>>,
}

impl<'a> Builder<'a> {
    fn new(instrs: &'a [Instruction], tree: &'a ControlFlowTree) -> Self {
        Self {
            instrs,
            tree,
            current: Scope::default(),
            saved: Vec::new(),
            frames: Vec::new(),
            function: None,
            object_depth: 0,
            field_target: FieldTarget::None,
            pending_logic: Vec::new(),
        }
    }

    fn push(&mut self, node: Node) {
        self.current.operands.push(Operand::Node(node));
    }

    fn pop(&mut self, ins: &Instruction) -> Result<Operand, DsoError> {
        self.current.operands.pop().ok_or_else(|| underflow(ins))
    }

    /// Pops an operand for use as a value.
    fn pop_node(&mut self, ins: &Instruction) -> Result<Node, DsoError> {
        match self.pop(ins)? {
            Operand::Node(node) => into_expression(node).map_err(|found| unexpected(ins, "expression", found)),
            Operand::Accumulator(_) => Err(unexpected(ins, "expression", "string accumulator")),
        }
    }

    fn pop_accumulator(&mut self, ins: &Instruction) -> Result<Accumulator, DsoError> {
        match self.pop(ins)? {
            Operand::Accumulator(acc) => Ok(acc),
            Operand::Node(node) => Err(unexpected(ins, "string accumulator", node.kind_name())),
        }
    }

    fn last_node(&self) -> Option<&Node> {
        match self.current.operands.last() {
            Some(Operand::Node(node)) => Some(node),
            _ => None,
        }
    }

    fn open_scope(&mut self) {
        let outer = std::mem::take(&mut self.current);
        self.saved.push(outer);
    }

    /// Closes the innermost scope, returning its contents as statements.
    fn close_scope(&mut self, addr: u32) -> Result<Vec<Node>, DsoError> {
        let outer = self.saved.pop().ok_or(DsoError::UnstructuredBranch { addr })?;
        let inner = std::mem::replace(&mut self.current, outer);
        into_statements(inner, addr)
    }

    fn walk(&mut self, block: BlockId, mut idx: usize, stop: u32) -> Result<usize, DsoError> {
        let instrs = self.instrs;
        let tree = self.tree;

        while let Some(ins) = instrs.get(idx) {
            if ins.addr >= stop {
                break;
            }
            self.close_function(ins.addr)?;
            self.fold_logic(ins.addr)?;

            if let Some(child) = tree.child_at(block, ins.addr) {
                idx = self.child(child, idx)?;
                continue;
            }
            if let Some(branch) = tree.block(block).branches.get(&ins.addr) {
                self.branch(ins, branch)?;
            } else {
                self.instruction(ins)?;
            }
            idx += 1;
        }
        Ok(idx)
    }

    fn child(&mut self, id: BlockId, idx: usize) -> Result<usize, DsoError> {
        match self.tree.block(id).kind {
            BlockKind::Conditional => self.conditional(id, idx),
            BlockKind::Loop => {
                let parts = self.loop_parts(id, idx)?;
                let next = parts.next;
                self.push(parts.into_do_while());
                Ok(next)
            }
            BlockKind::Root => Err(DsoError::UnstructuredBranch { addr: self.tree.block(id).start }),
        }
    }

    fn branch(&mut self, ins: &Instruction, branch: &ControlFlowBranch) -> Result<(), DsoError> {
        match branch.kind {
            BranchKind::Break => self.push(Node::Break),
            BranchKind::Continue => self.push(Node::Continue),
            BranchKind::Else => return Err(DsoError::UnstructuredBranch { addr: ins.addr }),
        }
        Ok(())
    }

    fn conditional(&mut self, id: BlockId, idx: usize) -> Result<usize, DsoError> {
        let instrs = self.instrs;
        let tree = self.tree;
        let block = tree.block(id);
        let ins = &instrs[idx];
        let Some((kind, _)) = ins.jump() else {
            return Err(DsoError::UnstructuredBranch { addr: ins.addr });
        };
        let condition = self.pop_node(ins)?;
        // The jump skips the body, so the body runs when it is not taken.
        let condition = if kind.jumps_when_true() { condition.negate() } else { condition };

        if let Some(lp) = self.guarded_loop(id, idx) {
            return self.guarded_loop_statement(condition, lp, idx + 1);
        }

        let else_branch = block.branches.get(&block.end).filter(|b| b.kind == BranchKind::Else);
        let then_stop = if else_branch.is_some() { block.end } else { block.end.saturating_add(1) };

        self.open_scope();
        let mut next = self.walk(id, idx + 1, then_stop)?;
        let then_body = self.close_scope(block.end)?;

        let mut else_body = Vec::new();
        if let Some(branch) = else_branch {
            if instrs.get(next).map(|i| i.addr) != Some(branch.start) {
                return Err(DsoError::UnstructuredBranch { addr: branch.start });
            }
            let parent = block.parent.ok_or(DsoError::UnstructuredBranch { addr: branch.start })?;
            // The else body never runs into the parent's own back branch or else jump.
            let p = tree.block(parent);
            let parent_stop = match p.kind {
                BlockKind::Loop => p.end,
                _ if p.branches.get(&p.end).is_some_and(|b| b.kind == BranchKind::Else) => p.end,
                _ => p.end.saturating_add(1),
            };
            self.open_scope();
            next = self.walk(parent, next + 1, branch.target.min(parent_stop))?;
            else_body = self.close_scope(branch.start)?;
        }

        self.push(Node::If { condition: Box::new(condition), then_body, else_body });
        Ok(next)
    }

    /// A loop that starts right after this conditional and shares its end is
    /// the body of a `while` or `for`.
    fn guarded_loop(&self, id: BlockId, idx: usize) -> Option<BlockId> {
        let block = self.tree.block(id);
        let body_start = self.instrs.get(idx + 1)?.addr;
        block.children.iter().copied().find(|&c| {
            let c = self.tree.block(c);
            c.kind == BlockKind::Loop && c.start == body_start && c.end == block.end
        })
    }

    fn guarded_loop_statement(&mut self, guard: Node, lp: BlockId, idx: usize) -> Result<usize, DsoError> {
        let parts = self.loop_parts(lp, idx)?;
        if parts.condition != guard {
            let next = parts.next;
            let body = vec![parts.into_do_while()];
            self.push(Node::If { condition: Box::new(guard), then_body: body, else_body: Vec::new() });
            return Ok(next);
        }

        let LoopParts { condition, mut body, mut end, next } = parts;
        let node = if end.len() == 1 && end[0].precedence() != STATEMENT {
            let init = self.take_for_init(&condition);
            Node::Loop {
                kind: LoopKind::For,
                init: init.map(Box::new),
                condition: Box::new(condition),
                end: end.pop().map(Box::new),
                body,
            }
        } else {
            body.append(&mut end);
            Node::Loop { kind: LoopKind::While, init: None, condition: Box::new(condition), end: None, body }
        };
        self.push(node);
        Ok(next)
    }

    /// Pulls the preceding assignment into a `for` header when the loop
    /// condition reads what it assigns.
    fn take_for_init(&mut self, condition: &Node) -> Option<Node> {
        let Some(Node::Assignment { target, .. }) = self.last_node() else {
            return None;
        };
        if !condition.contains(target) {
            return None;
        }
        match self.current.operands.pop() {
            Some(Operand::Node(node)) => Some(node),
            _ => None,
        }
    }

    fn loop_parts(&mut self, id: BlockId, idx: usize) -> Result<LoopParts, DsoError> {
        let instrs = self.instrs;
        let tree = self.tree;
        let block = tree.block(id);
        // A continue point inside a nested block cannot split the body.
        let split = block.continue_point.filter(|&cp| {
            cp > block.start
                && cp <= block.end
                && !block.children.iter().any(|&c| {
                    let c = tree.block(c);
                    c.start < cp && cp <= c.end
                })
        });

        self.open_scope();
        let mut next = self.walk(id, idx, split.unwrap_or(block.end))?;
        let mut body = Vec::new();
        if split.is_some() {
            body = self.close_scope(block.end)?;
            self.open_scope();
            next = self.walk(id, next, block.end)?;
        }

        let ins = instrs
            .get(next)
            .filter(|i| i.addr == block.end)
            .ok_or(DsoError::UnstructuredBranch { addr: block.end })?;
        let Some((kind, _)) = ins.jump() else {
            return Err(DsoError::UnstructuredBranch { addr: ins.addr });
        };
        self.fold_logic(ins.addr)?;
        let condition = self.pop_node(ins)?;
        let rest = self.close_scope(ins.addr)?;
        let condition = if kind.jumps_when_true() { condition } else { condition.negate() };

        let (body, end) = if split.is_some() { (body, rest) } else { (rest, Vec::new()) };
        Ok(LoopParts { condition, body, end, next: next + 1 })
    }

    fn fold_logic(&mut self, addr: u32) -> Result<(), DsoError> {
        while self.pending_logic.last().is_some_and(|p| p.target <= addr) {
            let Some(p) = self.pending_logic.pop() else { break };
            let right = self.pop_node(p.ins)?;
            let left = self.pop_node(p.ins)?;
            self.push(Node::binary(p.op, left, right));
        }
        Ok(())
    }

    fn close_function(&mut self, addr: u32) -> Result<(), DsoError> {
        let Some(ctx) = &self.function else {
            return Ok(());
        };
        if addr < ctx.end {
            return Ok(());
        }
        if self.saved.len() != ctx.depth + 1 {
            return Err(DsoError::UnbalancedFunction { addr, end: ctx.end });
        }
        let Some(ctx) = self.function.take() else {
            return Ok(());
        };
        let body = self.close_scope(addr)?;
        self.push(Node::FunctionDeclaration {
            name: ctx.name,
            namespace: ctx.namespace,
            package: ctx.package,
            args: ctx.args,
            body,
        });
        Ok(())
    }

    fn instruction(&mut self, ins: &'a Instruction) -> Result<(), DsoError> {
        use InstructionKind as K;

        match &ins.kind {
            K::FuncDecl { name, namespace, package, has_body, end, args } => {
                if self.function.is_some() {
                    return Err(DsoError::NestedFunction { addr: ins.addr });
                }
                if !*has_body {
                    self.push(Node::FunctionDeclaration {
                        name: name.clone(),
                        namespace: namespace.clone(),
                        package: package.clone(),
                        args: args.clone(),
                        body: Vec::new(),
                    });
                    return Ok(());
                }
                self.function = Some(FunctionContext {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    package: package.clone(),
                    args: args.clone(),
                    end: *end,
                    depth: self.saved.len(),
                });
                self.open_scope();
            }
            K::CreateObject { parent, is_datablock, .. } => self.create_object(ins, parent.clone(), *is_datablock)?,
            K::AddObject { place_at_root } => self.add_object(ins, *place_at_root)?,
            K::EndObject { .. } => self.end_object(ins)?,
            K::Jump { kind, target } if kind.is_short_circuit() => {
                let op = if kind.jumps_when_true() { BinaryOp::Or } else { BinaryOp::And };
                self.pending_logic.push(PendingLogic { target: *target, op, ins });
            }
            K::Jump { .. } => return Err(DsoError::UnstructuredBranch { addr: ins.addr }),
            K::Return { returns_value } => {
                let value = if *returns_value { Some(Box::new(self.pop_node(ins)?)) } else { None };
                self.push(Node::Return(value));
            }
            K::Binary(op) => {
                let right = self.pop_node(ins)?;
                let left = self.pop_node(ins)?;
                self.push(Node::binary(*op, left, right));
            }
            K::Unary(op) => {
                let operand = self.pop_node(ins)?;
                let node = if *op == UnaryOp::Not && matches!(operand, Node::BinaryString { .. }) {
                    operand.negate()
                } else {
                    Node::Unary { op: *op, operand: Box::new(operand) }
                };
                self.push(node);
            }
            K::SetCurVar { name, .. } => self.push(Node::variable(name.clone())),
            K::SetCurVarArray { .. } => self.variable_array(ins)?,
            K::LoadVar(_) | K::LoadField(_) | K::Convert { .. } | K::DebugBreak => {}
            K::SaveVar(_) => self.assignment(ins, false)?,
            K::SaveField(_) => self.assignment(ins, true)?,
            K::SetCurObject => self.field_target = FieldTarget::Popped,
            K::SetCurObjectNew => self.field_target = FieldTarget::NewObject,
            K::SetCurField { name } => {
                let object = match std::mem::replace(&mut self.field_target, FieldTarget::None) {
                    FieldTarget::Popped => Some(Box::new(self.pop_node(ins)?)),
                    FieldTarget::NewObject | FieldTarget::None => None,
                };
                self.push(Node::Field { object, name: name.clone(), index: None });
            }
            K::SetCurFieldArray => {
                let index = self.pop_node(ins)?;
                match self.pop_node(ins)? {
                    Node::Field { object, name, index: None } => {
                        self.push(Node::Field { object, name, index: Some(Box::new(index)) })
                    }
                    other => return Err(unexpected(ins, "field", other.kind_name())),
                }
            }
            K::LoadImmedUint(v) => self.push(Node::uint(*v)),
            K::LoadImmedFloat(v) => self.push(Node::float(*v)),
            K::LoadImmedStr(s) => self.push(Node::string(s.clone())),
            K::LoadImmedIdent(s) => self.push(Node::Constant(Constant::Ident(s.clone()))),
            K::TagToStr(s) => self.push(Node::Constant(Constant::Tagged(s.clone()))),
            K::CallFunc { name, namespace, call_type, .. } => {
                let args = self.frames.pop().ok_or_else(|| frame_underflow(ins))?;
                self.push(Node::FunctionCall {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    call_type: *call_type,
                    args,
                });
            }
            K::AdvanceStr => self.advance(ins, AccumulatorKind::Concat(Join::Plain))?,
            K::AdvanceStrAppendChar(c) => {
                let join = Join::from_char(*c).ok_or(DsoError::InvalidAppendChar { addr: ins.addr, value: *c as u32 })?;
                self.advance(ins, AccumulatorKind::Concat(join))?;
            }
            K::AdvanceStrComma => self.advance(ins, AccumulatorKind::Comma)?,
            K::AdvanceStrNul => self.advance(ins, AccumulatorKind::Compare)?,
            K::RewindStr => {
                let right = Box::new(self.pop_node(ins)?);
                let acc = self.pop_accumulator(ins)?;
                let left = Box::new(acc.left);
                let node = match acc.kind {
                    AccumulatorKind::Concat(join) => Node::Concat { join, left, right },
                    AccumulatorKind::Comma => Node::CommaConcat { left, right },
                    AccumulatorKind::Compare => return Err(unexpected(ins, "concatenation", "string comparison")),
                };
                self.push(node);
            }
            K::TerminateRewindStr => {
                let top = match self.pop(ins)? {
                    Operand::Accumulator(acc) => {
                        self.push(acc.left);
                        return Ok(());
                    }
                    Operand::Node(node) => node,
                };
                let acc = self.pop_accumulator(ins)?;
                self.push(top);
                self.push(acc.left);
            }
            K::CompareStr => {
                let right = Box::new(self.pop_node(ins)?);
                let acc = self.pop_accumulator(ins)?;
                if acc.kind != AccumulatorKind::Compare {
                    return Err(unexpected(ins, "string comparison", "concatenation"));
                }
                self.push(Node::BinaryString { op: StringOp::Equal, left: Box::new(acc.left), right });
            }
            K::Push => {
                let value = self.pop_node(ins)?;
                self.frames.last_mut().ok_or_else(|| frame_underflow(ins))?.push(value);
            }
            K::PushFrame => self.frames.push(Vec::new()),
        }
        Ok(())
    }

    fn advance(&mut self, ins: &Instruction, kind: AccumulatorKind) -> Result<(), DsoError> {
        let left = self.pop_node(ins)?;
        self.current.operands.push(Operand::Accumulator(Accumulator { left, kind }));
        Ok(())
    }

    fn variable_array(&mut self, ins: &Instruction) -> Result<(), DsoError> {
        // `$name[idx]` is usually compiled as the string `"$name" @ idx`.
        let index = match self.pop_node(ins)? {
            Node::Concat { join: Join::Plain, left, right } => match *left {
                Node::Constant(Constant::Str(name) | Constant::Ident(name)) => {
                    self.push(Node::Variable { name, index: Some(right) });
                    return Ok(());
                }
                left => Node::Concat { join: Join::Plain, left: Box::new(left), right },
            },
            other => other,
        };
        match self.pop_node(ins)? {
            Node::Variable { name, index: None } => {
                self.push(Node::Variable { name, index: Some(Box::new(index)) });
                Ok(())
            }
            other => Err(unexpected(ins, "variable", other.kind_name())),
        }
    }

    fn assignment(&mut self, ins: &Instruction, field: bool) -> Result<(), DsoError> {
        let target = self.pop_node(ins)?;
        match (&target, field) {
            (Node::Variable { .. }, false) | (Node::Field { .. }, true) => {}
            (other, false) => return Err(unexpected(ins, "variable", other.kind_name())),
            (other, true) => return Err(unexpected(ins, "field", other.kind_name())),
        }
        let value = self.pop_node(ins)?;
        let node = match value {
            Node::Binary { op, left, right } if op.is_compound() && *left == target => {
                Node::Assignment { target: Box::new(target), op: Some(op), value: right }
            }
            value => Node::Assignment { target: Box::new(target), op: None, value: Box::new(value) },
        };
        self.push(node);
        Ok(())
    }

    fn create_object(&mut self, ins: &Instruction, parent: Option<String>, is_datablock: bool) -> Result<(), DsoError> {
        let mut frame = self.frames.pop().ok_or_else(|| frame_underflow(ins))?.into_iter();
        let class = frame.next().ok_or_else(|| underflow(ins))?;
        let name = frame.next().filter(|n| !matches!(n, Node::Constant(Constant::Str(s)) if s.is_empty()));
        let args: Vec<Node> = frame.collect();

        self.push(Node::ObjectDeclaration(ObjectDeclaration {
            class: Box::new(class),
            name: name.map(Box::new),
            parent,
            is_datablock,
            args,
            fields: Vec::new(),
            children: Vec::new(),
            depth: self.object_depth,
        }));
        self.object_depth += 1;
        Ok(())
    }

    fn pop_object(&mut self, ins: &Instruction, depth: usize) -> Result<ObjectDeclaration, DsoError> {
        match self.pop_node(ins)? {
            Node::ObjectDeclaration(o) if o.depth == depth => Ok(o),
            other => Err(unexpected(ins, "object declaration", other.kind_name())),
        }
    }

    fn add_object(&mut self, ins: &Instruction, place_at_root: bool) -> Result<(), DsoError> {
        let depth = self.object_depth.checked_sub(1).ok_or(DsoError::ObjectDepthUnderflow { addr: ins.addr })?;

        let mut fields = Vec::new();
        loop {
            let is_field = matches!(
                self.last_node(),
                Some(Node::Assignment { target, .. }) if matches!(**target, Node::Field { object: None, .. })
            );
            if !is_field {
                break;
            }
            fields.push(self.pop_node(ins)?);
        }
        fields.reverse();

        let mut object = self.pop_object(ins, depth)?;
        object.fields = fields;
        if place_at_root {
            // Placeholder pushed before a top level declaration.
            match self.pop_node(ins)? {
                Node::Constant(Constant::Uint(0)) => {}
                other => return Err(unexpected(ins, "root placeholder", other.kind_name())),
            }
        }
        self.push(Node::ObjectDeclaration(object));
        Ok(())
    }

    fn end_object(&mut self, ins: &Instruction) -> Result<(), DsoError> {
        self.object_depth = self.object_depth.checked_sub(1).ok_or(DsoError::ObjectDepthUnderflow { addr: ins.addr })?;
        let depth = self.object_depth;

        let mut children = Vec::new();
        loop {
            let is_child = matches!(self.last_node(), Some(Node::ObjectDeclaration(o)) if o.depth == depth + 1);
            if !is_child {
                break;
            }
            children.push(self.pop_node(ins)?);
        }
        children.reverse();

        let mut object = self.pop_object(ins, depth)?;
        object.children = children;
        self.push(Node::ObjectDeclaration(object));
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Node>, DsoError> {
        let last = self.instrs.last().map(|ins| ins.addr).unwrap_or(0);
        self.close_function(u32::MAX)?;
        if !self.saved.is_empty() {
            return Err(DsoError::UnstructuredBranch { addr: last });
        }
        if self.object_depth != 0 {
            return Err(DsoError::UnterminatedObject { depth: self.object_depth });
        }
        if !self.frames.is_empty() {
            log::warn!("{} argument frames left open at end of stream", self.frames.len());
        }
        if !self.pending_logic.is_empty() {
            log::warn!("{} short-circuit jumps never reached their target", self.pending_logic.len());
        }
        let nodes = into_statements(self.current, last)?;
        Ok(group_packages(nodes))
    }
}

fn into_statements(scope: Scope, addr: u32) -> Result<Vec<Node>, DsoError> {
    scope
        .operands
        .into_iter()
        .map(|op| match op {
            Operand::Node(node) => Ok(node),
            Operand::Accumulator(_) => Err(DsoError::UnclosedAccumulator { addr }),
        })
        .collect()
}

/// Folds runs of functions declared in the same package into one block.
fn group_packages(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for node in nodes {
        let package = match &node {
            Node::FunctionDeclaration { package: Some(p), .. } => p.clone(),
            _ => {
                out.push(node);
                continue;
            }
        };
        if let Some(Node::Package { name, functions }) = out.last_mut() {
            if *name == package {
                functions.push(node);
                continue;
            }
        }
        out.push(Node::Package { name: package, functions: vec![node] });
    }
    out
}

/// Rebuilds the statement tree of an instruction stream from its control flow.
pub fn build(instrs: &[Instruction], tree: &ControlFlowTree) -> Result<Vec<Node>, DsoError> {
    let mut b = Builder::new(instrs, tree);
    let next = b.walk(tree.root(), 0, u32::MAX)?;
    if next != instrs.len() {
        let addr = instrs.get(next).map(|ins| ins.addr).unwrap_or(0);
        return Err(DsoError::UnstructuredBranch { addr });
    }
    let nodes = b.finish()?;
    log::debug!("built {} top level statements", nodes.len());
    Ok(nodes)
}
