use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    NotEqual,
    Xor,
    Mod,
    BitAnd,
    BitOr,
    Shr,
    Shl,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn token(self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Xor => "^",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::Shr => ">>",
            BinaryOp::Shl => "<<",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Shl | BinaryOp::Shr => 5,
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => 7,
            BinaryOp::Equal | BinaryOp::NotEqual => 8,
            BinaryOp::BitAnd => 9,
            BinaryOp::Xor => 10,
            BinaryOp::BitOr => 11,
            BinaryOp::And => 12,
            BinaryOp::Or => 13,
        }
    }

    /// `a op (b op c)` reads the same as `a op b op c`.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::Xor
        )
    }

    /// Operators with an `op=` assignment form.
    pub fn is_compound(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::Xor
                | BinaryOp::Shl
                | BinaryOp::Shr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Complement,
    Neg,
}

impl UnaryOp {
    pub fn token(self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Complement => "~",
            UnaryOp::Neg => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StringOp {
    Equal,
    NotEqual,
}

impl StringOp {
    pub fn token(self) -> &'static str {
        match self {
            StringOp::Equal => "$=",
            StringOp::NotEqual => "!$=",
        }
    }
}

/// How the two halves of a string concatenation are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Join {
    Plain,
    Space,
    Tab,
    NewLine,
}

impl Join {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            ' ' => Some(Join::Space),
            '\t' => Some(Join::Tab),
            '\n' => Some(Join::NewLine),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Join::Plain => "@",
            Join::Space => "SPC",
            Join::Tab => "TAB",
            Join::NewLine => "NL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    Function,
    Method,
    Parent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopKind {
    While,
    For,
    DoWhile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    Uint(u32),
    Float(f64),
    Str(String),
    Ident(String),
    Tagged(String),
}

impl Constant {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) | Constant::Ident(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_one(&self) -> bool {
        match self {
            Constant::Uint(v) => *v == 1,
            Constant::Float(v) => *v == 1.0,
            _ => false,
        }
    }
}

// Floats compare by bit pattern so trees stay `Eq` + `Hash`.
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Uint(a), Constant::Uint(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Ident(a), Constant::Ident(b)) => a == b,
            (Constant::Tagged(a), Constant::Tagged(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Constant::Uint(v) => v.hash(state),
            Constant::Float(v) => v.to_bits().hash(state),
            Constant::Str(s) | Constant::Ident(s) | Constant::Tagged(s) => s.hash(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectDeclaration {
    pub class: Box<Node>,
    pub name: Option<Box<Node>>,
    pub parent: Option<String>,
    pub is_datablock: bool,
    pub args: Vec<Node>,
    pub fields: Vec<Node>,
    pub children: Vec<Node>,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Node {
    Return(Option<Box<Node>>),
    If {
        condition: Box<Node>,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Loop {
        kind: LoopKind,
        init: Option<Box<Node>>,
        condition: Box<Node>,
        end: Option<Box<Node>>,
        body: Vec<Node>,
    },
    Break,
    Continue,
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    BinaryString {
        op: StringOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Concat {
        join: Join,
        left: Box<Node>,
        right: Box<Node>,
    },
    CommaConcat {
        left: Box<Node>,
        right: Box<Node>,
    },
    Conditional {
        condition: Box<Node>,
        then_value: Box<Node>,
        else_value: Box<Node>,
    },
    Field {
        object: Option<Box<Node>>,
        name: String,
        index: Option<Box<Node>>,
    },
    Variable {
        name: String,
        index: Option<Box<Node>>,
    },
    Constant(Constant),
    Assignment {
        target: Box<Node>,
        op: Option<BinaryOp>,
        value: Box<Node>,
    },
    ObjectDeclaration(ObjectDeclaration),
    FunctionCall {
        name: String,
        namespace: Option<String>,
        call_type: CallType,
        args: Vec<Node>,
    },
    FunctionDeclaration {
        name: String,
        namespace: Option<String>,
        package: Option<String>,
        args: Vec<String>,
        body: Vec<Node>,
    },
    Package {
        name: String,
        functions: Vec<Node>,
    },
}

pub const PRIMARY: u8 = 0;
pub const MEMBER: u8 = 1;
pub const UNARY: u8 = 2;
pub const CONCAT: u8 = 6;
pub const CONDITIONAL: u8 = 14;
pub const ASSIGNMENT: u8 = 15;
pub const COMMA: u8 = 16;
pub const STATEMENT: u8 = u8::MAX;

impl Node {
    pub fn variable(name: impl Into<String>) -> Self {
        Node::Variable { name: name.into(), index: None }
    }

    pub fn uint(v: u32) -> Self {
        Node::Constant(Constant::Uint(v))
    }

    pub fn float(v: f64) -> Self {
        Node::Constant(Constant::Float(v))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Node::Constant(Constant::Str(s.into()))
    }

    pub fn binary(op: BinaryOp, left: Node, right: Node) -> Self {
        Node::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Return(_) => "return",
            Node::If { .. } => "if",
            Node::Loop { .. } => "loop",
            Node::Break => "break",
            Node::Continue => "continue",
            Node::Unary { .. } => "unary expression",
            Node::Binary { .. } => "binary expression",
            Node::BinaryString { .. } => "string comparison",
            Node::Concat { .. } => "concatenation",
            Node::CommaConcat { .. } => "comma concatenation",
            Node::Conditional { .. } => "conditional expression",
            Node::Field { .. } => "field",
            Node::Variable { .. } => "variable",
            Node::Constant(_) => "constant",
            Node::Assignment { .. } => "assignment",
            Node::ObjectDeclaration(_) => "object declaration",
            Node::FunctionCall { .. } => "function call",
            Node::FunctionDeclaration { .. } => "function declaration",
            Node::Package { .. } => "package",
        }
    }

    /// Binding strength; lower binds tighter.
    pub fn precedence(&self) -> u8 {
        match self {
            Node::Constant(_) | Node::Variable { .. } | Node::ObjectDeclaration(_) => PRIMARY,
            Node::Field { .. } => MEMBER,
            Node::FunctionCall { call_type, .. } => match call_type {
                CallType::Method => MEMBER,
                _ => PRIMARY,
            },
            Node::Unary { .. } => UNARY,
            Node::Binary { op, .. } => op.precedence(),
            Node::BinaryString { .. } | Node::Concat { .. } => CONCAT,
            Node::Conditional { .. } => CONDITIONAL,
            Node::Assignment { .. } => ASSIGNMENT,
            Node::CommaConcat { .. } => COMMA,
            Node::Return(_)
            | Node::If { .. }
            | Node::Loop { .. }
            | Node::Break
            | Node::Continue
            | Node::FunctionDeclaration { .. }
            | Node::Package { .. } => STATEMENT,
        }
    }

    /// Whether `self` can sit as the right operand of `parent` at equal
    /// precedence without changing meaning.
    pub fn associates_with(&self, parent: &Node) -> bool {
        match (self, parent) {
            (Node::Concat { .. }, Node::Concat { .. }) => true,
            (Node::Field { .. } | Node::FunctionCall { .. }, Node::Field { .. } | Node::FunctionCall { .. }) => true,
            (Node::Binary { op: a, .. }, Node::Binary { op: b, .. }) => a == b && a.is_associative(),
            _ => false,
        }
    }

    /// Compound form of an assignment: an explicit operator, or a value of
    /// the shape `target op rhs`.
    pub fn compound(&self) -> Option<(BinaryOp, &Node)> {
        let Node::Assignment { target, op, value } = self else {
            return None;
        };
        if let Some(op) = op {
            return Some((*op, value.as_ref()));
        }
        match value.as_ref() {
            Node::Binary { op, left, right } if op.is_compound() && left == target => Some((*op, right.as_ref())),
            _ => None,
        }
    }

    /// Direct sub-expressions and statements, in source order.
    pub fn children(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = Vec::new();
        match self {
            Node::Return(value) => out.extend(value.as_deref()),
            Node::If { condition, then_body, else_body } => {
                out.push(condition);
                out.extend(then_body);
                out.extend(else_body);
            }
            Node::Loop { init, condition, end, body, .. } => {
                out.extend(init.as_deref());
                out.push(condition);
                out.extend(end.as_deref());
                out.extend(body);
            }
            Node::Break | Node::Continue | Node::Constant(_) => {}
            Node::Unary { operand, .. } => out.push(operand),
            Node::Binary { left, right, .. }
            | Node::BinaryString { left, right, .. }
            | Node::Concat { left, right, .. }
            | Node::CommaConcat { left, right } => {
                out.push(left);
                out.push(right);
            }
            Node::Conditional { condition, then_value, else_value } => {
                out.push(condition);
                out.push(then_value);
                out.push(else_value);
            }
            Node::Field { object, index, .. } => {
                out.extend(object.as_deref());
                out.extend(index.as_deref());
            }
            Node::Variable { index, .. } => out.extend(index.as_deref()),
            Node::Assignment { target, value, .. } => {
                out.push(target);
                out.push(value);
            }
            Node::ObjectDeclaration(o) => {
                out.push(&o.class);
                out.extend(o.name.as_deref());
                out.extend(&o.args);
                out.extend(&o.fields);
                out.extend(&o.children);
            }
            Node::FunctionCall { args, .. } => out.extend(args),
            Node::FunctionDeclaration { body, .. } => out.extend(body),
            Node::Package { functions, .. } => out.extend(functions),
        }
        out
    }

    pub fn contains(&self, needle: &Node) -> bool {
        self == needle || self.children().into_iter().any(|c| c.contains(needle))
    }

    /// Logical negation, folding double negation and string comparisons.
    pub fn negate(self) -> Node {
        match self {
            Node::Unary { op: UnaryOp::Not, operand } => *operand,
            Node::BinaryString { op, left, right } => Node::BinaryString {
                op: match op {
                    StringOp::Equal => StringOp::NotEqual,
                    StringOp::NotEqual => StringOp::Equal,
                },
                left,
                right,
            },
            other => Node::Unary { op: UnaryOp::Not, operand: Box::new(other) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn float_constants_are_hashable() {
        let mut set = HashSet::new();
        set.insert(Node::float(1.5));
        set.insert(Node::float(1.5));
        set.insert(Node::uint(1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn compound_detects_desugared_form() {
        let x = Node::variable("%x");
        let a = Node::Assignment {
            target: Box::new(x.clone()),
            op: None,
            value: Box::new(Node::binary(BinaryOp::Sub, x.clone(), Node::uint(2))),
        };
        assert_eq!(a.compound(), Some((BinaryOp::Sub, &Node::uint(2))));

        let plain = Node::Assignment {
            target: Box::new(x.clone()),
            op: None,
            value: Box::new(Node::binary(BinaryOp::Sub, Node::uint(2), x)),
        };
        assert_eq!(plain.compound(), None);
    }

    #[test]
    fn negate_folds() {
        let c = Node::variable("%c");
        assert_eq!(c.clone().negate().negate(), c);

        let eq = Node::BinaryString {
            op: StringOp::Equal,
            left: Box::new(Node::variable("%a")),
            right: Box::new(Node::string("b")),
        };
        assert!(matches!(eq.negate(), Node::BinaryString { op: StringOp::NotEqual, .. }));
    }

    #[test]
    fn chained_concat_associates() {
        let c = Node::Concat {
            join: Join::Space,
            left: Box::new(Node::string("a")),
            right: Box::new(Node::string("b")),
        };
        assert!(c.associates_with(&c));
        let sub = Node::binary(BinaryOp::Sub, Node::uint(1), Node::uint(2));
        assert!(!sub.associates_with(&sub));
    }
}
