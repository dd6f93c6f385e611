use crate::ast::{BinaryOp, CallType, Constant, LoopKind, Node, ObjectDeclaration, UnaryOp, CONDITIONAL, UNARY};
use crate::DsoError;

pub const INDENT: &str = "   ";

/// Token sink that tracks brace depth and indents each new line.
#[derive(Debug)]
pub struct CodeWriter {
    tokens: Vec<String>,
    depth: usize,
    at_line_start: bool,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self { tokens: Vec::new(), depth: 0, at_line_start: true }
    }

    pub fn write(&mut self, token: &str) {
        if token == "}" {
            self.depth = self.depth.saturating_sub(1);
        }
        if self.at_line_start && token != "\n" {
            for _ in 0..self.depth {
                self.tokens.push(INDENT.to_string());
            }
        }
        self.tokens.push(token.to_string());
        self.at_line_start = token == "\n";
        if token == "{" {
            self.depth += 1;
        }
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }

    pub fn finish(self) -> String {
        self.tokens.concat()
    }
}

impl Default for CodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// String constant that can be written without quotes.
fn bare_identifier(node: &Node) -> Option<&str> {
    match node {
        Node::Constant(c) => c.as_str().filter(|s| is_identifier(s)),
        _ => None,
    }
}

fn escape(s: &str, quote: char) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || (0x7f..0x100).contains(&(c as u32)) => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn constant(c: &Constant) -> Result<String, DsoError> {
    Ok(match c {
        Constant::Uint(v) => v.to_string(),
        Constant::Float(v) if !v.is_finite() => return Err(DsoError::NonFiniteFloat(*v)),
        Constant::Float(v) => v.to_string(),
        Constant::Str(s) => escape(s, '"'),
        Constant::Ident(s) => s.clone(),
        Constant::Tagged(s) => escape(s, '\''),
    })
}

struct Generator<'w> {
    out: &'w mut CodeWriter,
    /// First node that could not be printed.
    error: Option<DsoError>,
}

impl Generator<'_> {
    fn fail(&mut self, e: DsoError) {
        self.error.get_or_insert(e);
    }

    fn w(&mut self, token: &str) {
        self.out.write(token);
    }

    fn sp(&mut self) {
        self.w(" ");
    }

    fn nl(&mut self) {
        self.w("\n");
    }

    fn statements(&mut self, nodes: &[Node]) {
        for node in nodes {
            self.statement(node);
        }
    }

    fn block(&mut self, body: &[Node]) {
        self.w("{");
        self.nl();
        self.statements(body);
        self.w("}");
        self.nl();
    }

    fn statement(&mut self, node: &Node) {
        match node {
            Node::Return(value) => {
                self.w("return");
                if let Some(v) = value {
                    self.sp();
                    self.expression(v);
                }
                self.w(";");
                self.nl();
            }
            Node::Break => {
                self.w("break");
                self.w(";");
                self.nl();
            }
            Node::Continue => {
                self.w("continue");
                self.w(";");
                self.nl();
            }
            Node::If { condition, then_body, else_body } => self.if_statement(condition, then_body, else_body),
            Node::Loop { kind, init, condition, end, body } => match kind {
                LoopKind::While => {
                    self.w("while");
                    self.sp();
                    self.w("(");
                    self.expression(condition);
                    self.w(")");
                    self.nl();
                    self.block(body);
                }
                LoopKind::For => {
                    self.w("for");
                    self.sp();
                    self.w("(");
                    if let Some(init) = init {
                        self.expression(init);
                    }
                    self.w(";");
                    self.sp();
                    self.expression(condition);
                    self.w(";");
                    self.sp();
                    if let Some(end) = end {
                        self.expression(end);
                    }
                    self.w(")");
                    self.nl();
                    self.block(body);
                }
                LoopKind::DoWhile => {
                    self.w("do");
                    self.nl();
                    self.block(body);
                    self.w("while");
                    self.sp();
                    self.w("(");
                    self.expression(condition);
                    self.w(")");
                    self.w(";");
                    self.nl();
                }
            },
            Node::FunctionDeclaration { name, namespace, args, body, .. } => {
                self.w("function");
                self.sp();
                if let Some(ns) = namespace {
                    self.w(ns);
                    self.w("::");
                }
                self.w(name);
                self.w("(");
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.w(",");
                        self.sp();
                    }
                    self.w(arg);
                }
                self.w(")");
                self.nl();
                self.block(body);
            }
            Node::Package { name, functions } => {
                self.w("package");
                self.sp();
                self.w(name);
                self.nl();
                self.w("{");
                self.nl();
                for (i, f) in functions.iter().enumerate() {
                    if i > 0 {
                        self.nl();
                    }
                    self.statement(f);
                }
                self.w("}");
                self.w(";");
                self.nl();
            }
            other => {
                self.expression(other);
                self.w(";");
                self.nl();
            }
        }
    }

    fn if_statement(&mut self, condition: &Node, then_body: &[Node], else_body: &[Node]) {
        self.w("if");
        self.sp();
        self.w("(");
        self.expression(condition);
        self.w(")");
        self.nl();
        self.block(then_body);
        if else_body.is_empty() {
            return;
        }
        self.w("else");
        if let [Node::If { condition, then_body, else_body }] = else_body {
            self.sp();
            self.if_statement(condition, then_body, else_body);
        } else {
            self.nl();
            self.block(else_body);
        }
    }

    fn wrapped(&mut self, node: &Node, wrap: bool) {
        if wrap {
            self.w("(");
            self.expression(node);
            self.w(")");
        } else {
            self.expression(node);
        }
    }

    /// Child of a binary-like `parent`; `right` selects the right-hand side.
    fn operand(&mut self, parent: &Node, child: &Node, right: bool) {
        let (p, c) = (parent.precedence(), child.precedence());
        let wrap = c > p || (c == p && right && !child.associates_with(parent));
        self.wrapped(child, wrap);
    }

    fn infix(&mut self, parent: &Node, left: &Node, token: &str, right: &Node) {
        self.operand(parent, left, false);
        self.sp();
        self.w(token);
        self.sp();
        self.operand(parent, right, true);
    }

    fn expression(&mut self, node: &Node) {
        match node {
            Node::Constant(c) => match constant(c) {
                Ok(text) => self.w(&text),
                Err(e) => self.fail(e),
            },
            Node::Variable { name, index } => {
                self.w(name);
                if let Some(index) = index {
                    self.w("[");
                    self.expression(index);
                    self.w("]");
                }
            }
            Node::Field { object, name, index } => {
                if let Some(object) = object {
                    self.operand(node, object, false);
                    self.w(".");
                }
                self.w(name);
                if let Some(index) = index {
                    self.w("[");
                    self.expression(index);
                    self.w("]");
                }
            }
            Node::Unary { op, operand } => {
                self.w(op.token());
                let nested = matches!(**operand, Node::Unary { .. })
                    || matches!(**operand, Node::Constant(Constant::Float(v)) if v < 0.0 && *op == UnaryOp::Neg);
                self.wrapped(operand, operand.precedence() > UNARY || nested);
            }
            Node::Binary { op, left, right } => self.infix(node, left, op.token(), right),
            Node::BinaryString { op, left, right } => self.infix(node, left, op.token(), right),
            Node::Concat { join, left, right } => self.infix(node, left, join.token(), right),
            Node::CommaConcat { left, right } => {
                self.operand(node, left, false);
                self.w(",");
                self.sp();
                self.operand(node, right, true);
            }
            Node::Conditional { condition, then_value, else_value } => {
                self.wrapped(condition, condition.precedence() >= CONDITIONAL);
                self.sp();
                self.w("?");
                self.sp();
                self.wrapped(then_value, then_value.precedence() > CONDITIONAL);
                self.sp();
                self.w(":");
                self.sp();
                self.wrapped(else_value, else_value.precedence() > CONDITIONAL);
            }
            Node::Assignment { target, .. } => self.assignment(node, target),
            Node::FunctionCall { name, namespace, call_type, args } => {
                let args: &[Node] = match call_type {
                    CallType::Method => match args.split_first() {
                        Some((receiver, rest)) => {
                            self.operand(node, receiver, false);
                            self.w(".");
                            rest
                        }
                        None => args,
                    },
                    CallType::Parent => {
                        self.w("Parent");
                        self.w("::");
                        args
                    }
                    CallType::Function => {
                        if let Some(ns) = namespace {
                            self.w(ns);
                            self.w("::");
                        }
                        args
                    }
                };
                self.w(name);
                self.arguments(args);
            }
            Node::ObjectDeclaration(o) => self.object(o),
            Node::Return(_)
            | Node::If { .. }
            | Node::Loop { .. }
            | Node::Break
            | Node::Continue
            | Node::FunctionDeclaration { .. }
            | Node::Package { .. } => self.fail(DsoError::StatementInExpression { kind: node.kind_name() }),
        }
    }

    fn arguments(&mut self, args: &[Node]) {
        self.w("(");
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.w(",");
                self.sp();
            }
            self.expression(arg);
        }
        self.w(")");
    }

    fn assignment(&mut self, node: &Node, target: &Node) {
        self.expression(target);
        match node.compound() {
            Some((BinaryOp::Add, v)) if matches!(v, Node::Constant(c) if c.is_one()) => self.w("++"),
            Some((BinaryOp::Sub, v)) if matches!(v, Node::Constant(c) if c.is_one()) => self.w("--"),
            Some((op, v)) => {
                self.sp();
                self.w(&format!("{}=", op.token()));
                self.sp();
                self.assigned_value(v);
            }
            None => {
                self.sp();
                self.w("=");
                self.sp();
                if let Node::Assignment { value, .. } = node {
                    self.assigned_value(value);
                }
            }
        }
    }

    fn assigned_value(&mut self, value: &Node) {
        self.wrapped(value, value.compound().is_some());
    }

    fn object(&mut self, o: &ObjectDeclaration) {
        self.w(if o.is_datablock { "datablock" } else { "new" });
        self.sp();
        match bare_identifier(&o.class) {
            Some(class) => self.w(class),
            None => self.wrapped(&o.class, true),
        }
        self.w("(");
        match o.name.as_deref() {
            Some(name) => match bare_identifier(name) {
                Some(s) => self.w(s),
                None => self.expression(name),
            },
            None if !o.args.is_empty() => self.w("\"\""),
            None => {}
        }
        if let Some(parent) = &o.parent {
            self.sp();
            self.w(":");
            self.sp();
            self.w(parent);
        }
        for arg in &o.args {
            self.w(",");
            self.sp();
            self.expression(arg);
        }
        self.w(")");

        if o.fields.is_empty() && o.children.is_empty() {
            return;
        }
        self.nl();
        self.w("{");
        self.nl();
        self.statements(&o.fields);
        self.statements(&o.children);
        self.w("}");
    }
}

/// Renders `nodes` into `out` as top level script statements.
pub fn generate_into(nodes: &[Node], out: &mut CodeWriter) -> Result<(), DsoError> {
    let mut g = Generator { out, error: None };
    for (i, node) in nodes.iter().enumerate() {
        let spaced = |n: &Node| matches!(n, Node::FunctionDeclaration { .. } | Node::Package { .. });
        if i > 0 && (spaced(node) || spaced(&nodes[i - 1])) {
            g.nl();
        }
        g.statement(node);
    }
    match g.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub fn generate(nodes: &[Node]) -> Result<Vec<String>, DsoError> {
    let mut out = CodeWriter::new();
    generate_into(nodes, &mut out)?;
    Ok(out.into_tokens())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Join;

    fn significant(tokens: &[String]) -> Vec<&str> {
        tokens.iter().map(String::as_str).filter(|t| !t.trim().is_empty()).collect()
    }

    fn expr_tokens(node: Node) -> Vec<String> {
        let mut out = CodeWriter::new();
        Generator { out: &mut out, error: None }.expression(&node);
        out.into_tokens()
    }

    fn source(nodes: &[Node]) -> String {
        generate(nodes).unwrap().concat()
    }

    #[test]
    fn lower_precedence_child_is_wrapped() {
        let node = Node::binary(
            BinaryOp::Mul,
            Node::binary(BinaryOp::Add, Node::float(1.0), Node::float(2.0)),
            Node::float(3.0),
        );
        assert_eq!(significant(&expr_tokens(node)), vec!["(", "1", "+", "2", ")", "*", "3"]);
    }

    #[test]
    fn right_operand_of_non_associative_op_is_wrapped() {
        let node = Node::binary(
            BinaryOp::Sub,
            Node::variable("%a"),
            Node::binary(BinaryOp::Sub, Node::variable("%b"), Node::variable("%c")),
        );
        assert_eq!(expr_tokens(node).concat(), "%a - (%b - %c)");

        let node = Node::binary(
            BinaryOp::Add,
            Node::variable("%a"),
            Node::binary(BinaryOp::Add, Node::variable("%b"), Node::variable("%c")),
        );
        assert_eq!(expr_tokens(node).concat(), "%a + %b + %c");
    }

    #[test]
    fn increment_from_desugared_compound() {
        let x = Node::variable("x");
        let node = Node::Assignment {
            target: Box::new(x.clone()),
            op: None,
            value: Box::new(Node::binary(BinaryOp::Add, x, Node::float(1.0))),
        };
        assert_eq!(significant(&expr_tokens(node)), vec!["x", "++"]);
    }

    #[test]
    fn compound_assignment_with_operator_token() {
        let node = Node::Assignment {
            target: Box::new(Node::variable("%x")),
            op: Some(BinaryOp::Mul),
            value: Box::new(Node::uint(4)),
        };
        assert_eq!(expr_tokens(node).concat(), "%x *= 4");
    }

    #[test]
    fn concat_joins_and_string_escapes() {
        let node = Node::Concat {
            join: Join::Space,
            left: Box::new(Node::variable("%a")),
            right: Box::new(Node::string("say \"hi\"\n")),
        };
        assert_eq!(expr_tokens(node).concat(), r#"%a SPC "say \"hi\"\n""#);
    }

    #[test]
    fn method_and_parent_calls() {
        let method = Node::FunctionCall {
            name: "setName".into(),
            namespace: None,
            call_type: CallType::Method,
            args: vec![Node::variable("%obj"), Node::string("x")],
        };
        assert_eq!(expr_tokens(method).concat(), r#"%obj.setName("x")"#);

        let parent = Node::FunctionCall {
            name: "onAdd".into(),
            namespace: Some("Foo".into()),
            call_type: CallType::Parent,
            args: vec![Node::variable("%this")],
        };
        assert_eq!(expr_tokens(parent).concat(), "Parent::onAdd(%this)");
    }

    #[test]
    fn nested_blocks_are_indented() {
        let nodes = vec![Node::FunctionDeclaration {
            name: "f".into(),
            namespace: Some("Foo".into()),
            package: None,
            args: vec!["%this".into(), "%n".into()],
            body: vec![Node::Loop {
                kind: LoopKind::While,
                init: None,
                condition: Box::new(Node::variable("%n")),
                end: None,
                body: vec![Node::If {
                    condition: Box::new(Node::variable("%x")),
                    then_body: vec![Node::Break],
                    else_body: vec![Node::Continue],
                }],
            }],
        }];
        let expected = "\
function Foo::f(%this, %n)
{
   while (%n)
   {
      if (%x)
      {
         break;
      }
      else
      {
         continue;
      }
   }
}
";
        assert_eq!(source(&nodes), expected);
    }

    #[test]
    fn else_if_chains() {
        let nodes = vec![Node::If {
            condition: Box::new(Node::variable("%a")),
            then_body: vec![Node::Return(None)],
            else_body: vec![Node::If {
                condition: Box::new(Node::variable("%b")),
                then_body: vec![Node::Return(Some(Box::new(Node::uint(1))))],
                else_body: vec![],
            }],
        }];
        assert_eq!(source(&nodes), "if (%a)\n{\n   return;\n}\nelse if (%b)\n{\n   return 1;\n}\n");
    }

    #[test]
    fn for_and_do_while_headers() {
        let i = Node::variable("%i");
        let nodes = vec![
            Node::Loop {
                kind: LoopKind::For,
                init: Some(Box::new(Node::Assignment {
                    target: Box::new(i.clone()),
                    op: None,
                    value: Box::new(Node::uint(0)),
                })),
                condition: Box::new(Node::binary(BinaryOp::Less, i.clone(), Node::uint(3))),
                end: Some(Box::new(Node::Assignment {
                    target: Box::new(i.clone()),
                    op: Some(BinaryOp::Add),
                    value: Box::new(Node::uint(1)),
                })),
                body: vec![],
            },
            Node::Loop {
                kind: LoopKind::DoWhile,
                init: None,
                condition: Box::new(i.clone()),
                end: None,
                body: vec![Node::Assignment { target: Box::new(i), op: Some(BinaryOp::Sub), value: Box::new(Node::uint(1)) }],
            },
        ];
        assert_eq!(
            source(&nodes),
            "for (%i = 0; %i < 3; %i++)\n{\n}\ndo\n{\n   %i--;\n}\nwhile (%i);\n"
        );
    }

    #[test]
    fn object_with_fields_and_children() {
        let child = ObjectDeclaration {
            class: Box::new(Node::Constant(Constant::Ident("SimObject".into()))),
            name: Some(Box::new(Node::string("Child"))),
            parent: None,
            is_datablock: false,
            args: vec![],
            fields: vec![],
            children: vec![],
            depth: 1,
        };
        let root = ObjectDeclaration {
            class: Box::new(Node::Constant(Constant::Ident("ItemData".into()))),
            name: Some(Box::new(Node::string("Gem"))),
            parent: Some("BaseGem".into()),
            is_datablock: true,
            args: vec![],
            fields: vec![Node::Assignment {
                target: Box::new(Node::Field { object: None, name: "skin".into(), index: Some(Box::new(Node::uint(0))) }),
                op: None,
                value: Box::new(Node::string("red")),
            }],
            children: vec![Node::ObjectDeclaration(child)],
            depth: 0,
        };
        let expected = "\
datablock ItemData(Gem : BaseGem)
{
   skin[0] = \"red\";
   new SimObject(Child);
};
";
        assert_eq!(source(&[Node::ObjectDeclaration(root)]), expected);
    }

    #[test]
    fn functions_are_separated_by_blank_lines() {
        let f = |name: &str| Node::FunctionDeclaration {
            name: name.into(),
            namespace: None,
            package: Some("P".into()),
            args: vec![],
            body: vec![],
        };
        let nodes = vec![Node::Package { name: "P".into(), functions: vec![f("a"), f("b")] }];
        assert_eq!(
            source(&nodes),
            "package P\n{\n   function a()\n   {\n   }\n\n   function b()\n   {\n   }\n};\n"
        );
    }

    #[test]
    fn negation_of_unary_is_parenthesized() {
        let node = Node::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(Node::Unary { op: UnaryOp::Neg, operand: Box::new(Node::variable("%x")) }),
        };
        assert_eq!(expr_tokens(node).concat(), "-(-%x)");
        let node = Node::Unary { op: UnaryOp::Not, operand: Box::new(Node::binary(BinaryOp::And, Node::variable("%a"), Node::variable("%b"))) };
        assert_eq!(expr_tokens(node).concat(), "!(%a && %b)");
    }

    #[test]
    fn conditional_expression_nests_to_the_right() {
        let inner = Node::Conditional {
            condition: Box::new(Node::variable("%b")),
            then_value: Box::new(Node::uint(2)),
            else_value: Box::new(Node::uint(3)),
        };
        let node = Node::Assignment {
            target: Box::new(Node::variable("%x")),
            op: None,
            value: Box::new(Node::Conditional {
                condition: Box::new(Node::binary(BinaryOp::Or, Node::variable("%a"), Node::variable("%c"))),
                then_value: Box::new(Node::uint(1)),
                else_value: Box::new(inner.clone()),
            }),
        };
        assert_eq!(expr_tokens(node).concat(), "%x = %a || %c ? 1 : %b ? 2 : 3");

        let sum = Node::binary(BinaryOp::Add, inner, Node::uint(1));
        assert_eq!(expr_tokens(sum).concat(), "(%b ? 2 : 3) + 1");
    }

    #[test]
    fn statement_in_expression_position_is_an_error() {
        let node = Node::Assignment {
            target: Box::new(Node::variable("%x")),
            op: None,
            value: Box::new(Node::If { condition: Box::new(Node::variable("%c")), then_body: vec![], else_body: vec![] }),
        };
        assert!(matches!(generate(&[node]), Err(DsoError::StatementInExpression { kind: "if" })));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let nodes = [Node::Return(Some(Box::new(Node::float(f64::INFINITY))))];
        assert!(matches!(generate(&nodes), Err(DsoError::NonFiniteFloat(v)) if v.is_infinite()));
        assert_eq!(source(&[Node::Return(Some(Box::new(Node::float(0.5))))]), "return 0.5;\n");
    }

    #[test]
    fn tagged_strings_use_single_quotes() {
        assert_eq!(expr_tokens(Node::Constant(Constant::Tagged("it's".into()))).concat(), r"'it\'s'");
    }
}
