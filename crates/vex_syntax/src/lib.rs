use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn join(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Location {
    /// 1-based line.
    pub line: usize,
    /// 0-based column, counted in characters.
    pub column: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Source {
    contents: String,
    line_offsets: Vec<usize>,
}

impl Source {
    pub fn new(contents: impl Into<String>) -> Self {
        let mut source = Source {
            contents: contents.into(),
            line_offsets: Vec::new(),
        };
        source.update_offsets();
        source
    }

    pub fn content(&self) -> &str {
        &self.contents
    }

    /// Byte offset where the 1-indexed line begins, if the line exists.
    fn line_offset(&self, line: usize) -> Option<usize> {
        if line == 0 || line > self.line_offsets.len() {
            return None;
        }
        Some(self.line_offsets[line - 1])
    }

    pub fn snippet(&self, line: usize) -> Option<&str> {
        let start = self.line_offset(line)?;
        let end = self
            .line_offset(line + 1)
            .map(|next| next - 1)
            .unwrap_or(self.contents.len());
        Some(&self.contents[start..end])
    }

    pub fn location(&self, offset: usize) -> Location {
        let offset = offset.min(self.contents.len());
        let line = match self.line_offsets.binary_search(&offset) {
            Ok(index) => index + 1,
            Err(index) => index,
        };
        let line_start = self.line_offsets[line - 1];
        let column = self.contents[line_start..offset].chars().count();
        Location { line, column }
    }

    // Line offsets are computed up front as they are referred to frequently.
    fn update_offsets(&mut self) {
        self.line_offsets.clear();
        self.line_offsets.push(0);
        for (index, byte) in self.contents.bytes().enumerate() {
            if byte == b'\n' {
                self.line_offsets.push(index + 1);
            }
        }
    }
}

impl serde::Serialize for Source {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.contents)
    }
}

impl<'de> serde::Deserialize<'de> for Source {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let contents = String::deserialize(deserializer)?;
        Ok(Source::new(contents))
    }
}

/// The single error type of the pipeline. Parse, check, compile, and runtime
/// failures all carry a message and the span of the offending token; binding
/// against a [`Source`] fills in the rendered location and snippet.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Error {
    pub message: String,
    #[serde(skip)]
    pub span: Span,
    pub line: usize,
    pub column: usize,
    pub snippet: String,
}

impl Error {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Error {
            message: message.into(),
            span,
            line: 0,
            column: 0,
            snippet: String::new(),
        }
    }

    pub fn bind(mut self, source: &Source) -> Self {
        let location = source.location(self.span.start);
        self.line = location.line;
        self.column = location.column;
        self.snippet = source
            .snippet(location.line)
            .unwrap_or_default()
            .replace('\t', " ");
        self
    }

    fn is_bound(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_bound() {
            return write!(f, "{}", self.message);
        }
        write!(f, "{} ({}:{})", self.message, self.line, self.column)?;
        if !self.snippet.is_empty() {
            write!(f, "\n | {}", self.snippet)?;
            write!(f, "\n | ")?;
            for _ in 0..self.column.min(self.snippet.chars().count()) {
                write!(f, ".")?;
            }
            write!(f, "^")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Declared parameter and return kinds of host callables. `Any` skips
/// coercion entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Any,
    Bool,
    Int,
    Float,
    String,
}

/// A host callable with its declared signature. The VM truncates surplus
/// arguments to fixed-arity callables and coerces every argument (and every
/// element of a variadic tail) to the declared kind before invoking.
pub struct FuncDef {
    pub params: Vec<Kind>,
    pub variadic: Option<Kind>,
    pub ret: Kind,
    pub func: Box<dyn Fn(&[Value]) -> Result<Value, String>>,
}

impl FuncDef {
    pub fn fixed(
        params: Vec<Kind>,
        func: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) -> Self {
        FuncDef {
            params,
            variadic: None,
            ret: Kind::Any,
            func: Box::new(func),
        }
    }

    pub fn variadic(
        params: Vec<Kind>,
        tail: Kind,
        func: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) -> Self {
        FuncDef {
            params,
            variadic: Some(tail),
            ret: Kind::Any,
            func: Box::new(func),
        }
    }

    pub fn returning(mut self, ret: Kind) -> Self {
        self.ret = ret;
        self
    }

    /// The statically detectable "generic variadic" shape: no declared
    /// fixed parameters and an `Any` tail. Calls to such functions skip
    /// argument coercion.
    pub fn is_generic_variadic(&self) -> bool {
        self.params.is_empty() && self.variadic == Some(Kind::Any)
    }
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDef")
            .field("params", &self.params)
            .field("variadic", &self.variadic)
            .field("ret", &self.ret)
            .finish_non_exhaustive()
    }
}

/// A call record stored in a program's constant pool: callee name plus the
/// number of arguments present on the stack.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Call {
    pub name: String,
    pub arity: usize,
}

/// Host capability carrier. A type implementing `Object` can publish
/// record-style fields, answer dynamic property lookups, unwrap itself at
/// operator sites, and dispatch methods.
///
/// The default implementations opt out of every capability; implementers
/// override the subset they support. `as_any` supplies the shape identity
/// used by the VM's field cache.
pub trait Object {
    fn type_name(&self) -> &'static str {
        "object"
    }

    /// Published field names, in declaration order. The published name is
    /// the name used inside expressions (lower-camel-case by convention).
    fn fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn field(&self, _index: usize) -> Value {
        Value::Nil
    }

    /// Names of fields whose record fields are promoted into this record's
    /// namespace, in the manner of embedded records.
    fn embedded(&self) -> &'static [&'static str] {
        &[]
    }

    /// Property-provider capability: dynamic named member access.
    fn fetch_property(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Value-provider capability: the operand this object stands for when
    /// it participates in an operator or comparison. Never consulted when
    /// the object is the base of a further property access.
    fn get_value(&self) -> Option<Value> {
        None
    }

    fn call_method(&self, _name: &str, _args: &[Value]) -> Option<Result<Value, String>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Rc<String>),
    Array(Rc<Vec<Value>>),
    Map(Rc<IndexMap<String, Value>>),
    IntSet(Rc<BTreeSet<i64>>),
    Regex(Rc<Regex>),
    Call(Rc<Call>),
    Func(Rc<FuncDef>),
    Object(Rc<dyn Object>),
}

impl Value {
    pub fn string(value: impl Into<String>) -> Value {
        Value::String(Rc::new(value.into()))
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Rc::new(values))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Rc::new(entries))
    }

    pub fn func(def: FuncDef) -> Value {
        Value::Func(Rc::new(def))
    }

    pub fn object(object: impl Object + 'static) -> Value {
        Value::Object(Rc::new(object))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::IntSet(_) => "set",
            Value::Regex(_) => "regex",
            Value::Call(_) => "call",
            Value::Func(_) => "func",
            Value::Object(object) => object.type_name(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::IntSet(a), Value::IntSet(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => a.as_str() == b.as_str(),
            (Value::Call(a), Value::Call(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(value) => write!(f, "{value:?}"),
            Value::Func(_) => write!(f, "<func>"),
            Value::Object(object) => write!(f, "<{}>", object.type_name()),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value}"),
            Value::Array(values) => {
                write!(f, "[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            Value::IntSet(set) => {
                write!(f, "{{")?;
                for (index, value) in set.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "}}")
            }
            Value::Regex(regex) => write!(f, "/{}/", regex.as_str()),
            Value::Call(call) => write!(f, "{}/{}", call.name, call.arity),
            Value::Func(_) => write!(f, "<func>"),
            Value::Object(object) => write!(f, "<{}>", object.type_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Value {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::string(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Value {
        Value::array(values)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Value {
        Value::map(entries)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Any,
    Nil,
    Bool,
    Int,
    Float,
    String,
    Array(Box<Type>),
    Map(Box<Type>),
    Func(Rc<FuncType>),
    Record(Rc<RecordType>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub variadic: Option<Type>,
    pub ret: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordType {
    pub name: String,
    pub fields: IndexMap<String, Type>,
    pub embedded: Vec<String>,
}

impl RecordType {
    pub fn new(name: impl Into<String>) -> Self {
        RecordType {
            name: name.into(),
            fields: IndexMap::new(),
            embedded: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    pub fn embed(mut self, name: impl Into<String>, record: Rc<RecordType>) -> Self {
        let name = name.into();
        self.embedded.push(name.clone());
        self.fields.insert(name, Type::Record(record));
        self
    }
}

impl Type {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Any)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Type::Any)
    }

    /// The numeric promotion result of two operand types: int stays int,
    /// any float operand promotes to float, dynamic stays dynamic.
    pub fn promote(&self, other: &Type) -> Option<Type> {
        match (self, other) {
            (Type::Int, Type::Int) => Some(Type::Int),
            (Type::Int, Type::Float) | (Type::Float, Type::Int) | (Type::Float, Type::Float) => {
                Some(Type::Float)
            }
            (Type::Any, other) | (other, Type::Any) if other.is_numeric() => Some(Type::Any),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "any"),
            Type::Nil => write!(f, "nil"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float64"),
            Type::String => write!(f, "string"),
            Type::Array(elem) => write!(f, "array of {elem}"),
            Type::Map(value) => write!(f, "map of {value}"),
            Type::Func(_) => write!(f, "func"),
            Type::Record(record) => write!(f, "{}", record.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Not => "not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Range,
    In,
    Contains,
    StartsWith,
    EndsWith,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Range => "..",
            BinaryOp::In => "in",
            BinaryOp::Contains => "contains",
            BinaryOp::StartsWith => "startsWith",
            BinaryOp::EndsWith => "endsWith",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub ty: Option<Type>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Identifier(String),
    /// Opaque pre-computed value. Introduced only by the optimizer.
    Constant(Value),
    Unary {
        op: UnaryOp,
        node: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Matches {
        left: Box<Node>,
        right: Box<Node>,
        regex: Option<Rc<Regex>>,
    },
    /// An access chain containing optional (`?.`) segments; nil at an
    /// optional segment short-circuits the whole chain to nil.
    Chain {
        node: Box<Node>,
    },
    Property {
        node: Box<Node>,
        property: String,
        optional: bool,
    },
    Index {
        node: Box<Node>,
        index: Box<Node>,
    },
    Slice {
        node: Box<Node>,
        from: Option<Box<Node>>,
        to: Option<Box<Node>>,
    },
    Method {
        node: Box<Node>,
        method: String,
        args: Vec<Node>,
    },
    Call {
        name: String,
        args: Vec<Node>,
    },
    Builtin {
        name: String,
        args: Vec<Node>,
    },
    Closure {
        node: Box<Node>,
    },
    /// The `#` placeholder for the current element inside a closure.
    Pointer,
    Conditional {
        cond: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    Array {
        nodes: Vec<Node>,
    },
    Map {
        pairs: Vec<(String, Node)>,
    },
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Node {
            kind,
            span,
            ty: None,
        }
    }

    /// Compact structural rendering used by tests and debugging.
    pub fn dump(&self) -> String {
        match &self.kind {
            NodeKind::Nil => "nil".to_string(),
            NodeKind::Bool(value) => value.to_string(),
            NodeKind::Int(value) => value.to_string(),
            NodeKind::Float(value) => value.to_string(),
            NodeKind::Str(value) => format!("{value:?}"),
            NodeKind::Identifier(name) => name.clone(),
            NodeKind::Constant(value) => format!("Constant({value})"),
            NodeKind::Unary { op, node } => format!("({} {})", op.symbol(), node.dump()),
            NodeKind::Binary { op, left, right } => {
                format!("({} {} {})", left.dump(), op.symbol(), right.dump())
            }
            NodeKind::Matches { left, right, .. } => {
                format!("({} matches {})", left.dump(), right.dump())
            }
            NodeKind::Chain { node } => format!("Chain({})", node.dump()),
            NodeKind::Property {
                node,
                property,
                optional,
            } => {
                let dot = if *optional { "?." } else { "." };
                format!("{}{dot}{property}", node.dump())
            }
            NodeKind::Index { node, index } => format!("{}[{}]", node.dump(), index.dump()),
            NodeKind::Slice { node, from, to } => format!(
                "{}[{}:{}]",
                node.dump(),
                from.as_ref().map(|n| n.dump()).unwrap_or_default(),
                to.as_ref().map(|n| n.dump()).unwrap_or_default(),
            ),
            NodeKind::Method { node, method, args } => {
                format!("{}.{method}({})", node.dump(), dump_list(args))
            }
            NodeKind::Call { name, args } => format!("{name}({})", dump_list(args)),
            NodeKind::Builtin { name, args } => format!("{name}({})", dump_list(args)),
            NodeKind::Closure { node } => format!("{{{}}}", node.dump()),
            NodeKind::Pointer => "#".to_string(),
            NodeKind::Conditional {
                cond,
                then,
                otherwise,
            } => format!(
                "({} ? {} : {})",
                cond.dump(),
                then.dump(),
                otherwise.dump()
            ),
            NodeKind::Array { nodes } => format!("[{}]", dump_list(nodes)),
            NodeKind::Map { pairs } => {
                let entries = pairs
                    .iter()
                    .map(|(key, value)| format!("{key}: {}", value.dump()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{entries}}}")
            }
        }
    }
}

fn dump_list(nodes: &[Node]) -> String {
    nodes
        .iter()
        .map(Node::dump)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Mutable AST visitor. `walk` calls `enter` before and `exit` after a
/// node's children; either callback may replace `*node` in place, which is
/// how hosts patch the tree between checking and optimization.
pub trait Visitor {
    fn enter(&mut self, _node: &mut Node) {}
    fn exit(&mut self, _node: &mut Node) {}
}

pub fn walk(node: &mut Node, visitor: &mut dyn Visitor) {
    visitor.enter(node);
    match &mut node.kind {
        NodeKind::Nil
        | NodeKind::Bool(_)
        | NodeKind::Int(_)
        | NodeKind::Float(_)
        | NodeKind::Str(_)
        | NodeKind::Identifier(_)
        | NodeKind::Constant(_)
        | NodeKind::Pointer => {}
        NodeKind::Unary { node: child, .. }
        | NodeKind::Chain { node: child }
        | NodeKind::Closure { node: child } => walk(child, visitor),
        NodeKind::Binary { left, right, .. } | NodeKind::Matches { left, right, .. } => {
            walk(left, visitor);
            walk(right, visitor);
        }
        NodeKind::Property { node: child, .. } => walk(child, visitor),
        NodeKind::Index { node: child, index } => {
            walk(child, visitor);
            walk(index, visitor);
        }
        NodeKind::Slice {
            node: child,
            from,
            to,
        } => {
            walk(child, visitor);
            if let Some(from) = from {
                walk(from, visitor);
            }
            if let Some(to) = to {
                walk(to, visitor);
            }
        }
        NodeKind::Method {
            node: child, args, ..
        } => {
            walk(child, visitor);
            for arg in args {
                walk(arg, visitor);
            }
        }
        NodeKind::Call { args, .. } | NodeKind::Builtin { args, .. } => {
            for arg in args {
                walk(arg, visitor);
            }
        }
        NodeKind::Conditional {
            cond,
            then,
            otherwise,
        } => {
            walk(cond, visitor);
            walk(then, visitor);
            walk(otherwise, visitor);
        }
        NodeKind::Array { nodes } => {
            for node in nodes {
                walk(node, visitor);
            }
        }
        NodeKind::Map { pairs } => {
            for (_, value) in pairs {
                walk(value, visitor);
            }
        }
    }
    visitor.exit(node);
}
