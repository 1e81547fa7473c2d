use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use regex::Regex;
use vex_check::{resolve_field, Config, Expect, BUILTIN_GLOBALS};
use vex_syntax::{
    BinaryOp, Call, Error, FuncDef, Kind, Node, NodeKind, Source, Span, Type, UnaryOp, Value,
};

/// Default memory budget in slots, counted by constructed sequence and map
/// sizes. The optimizer uses the same bound when materializing ranges.
pub const MEMORY_BUDGET: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Push,
    Pop,
    Rot,
    Fetch,
    FetchMap,
    True,
    False,
    Nil,
    Negate,
    Not,
    Equal,
    EqualInt,
    EqualString,
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    JumpIfNil,
    JumpBackward,
    In,
    Less,
    More,
    LessOrEqual,
    MoreOrEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Exponent,
    Range,
    Matches,
    MatchesConst,
    Contains,
    StartsWith,
    EndsWith,
    Index,
    Slice,
    Property,
    Call,
    CallFast,
    Method,
    Array,
    Map,
    Len,
    Cast,
    Store,
    Load,
    Inc,
    Begin,
    End,
}

const OPCODES: [Opcode; 50] = [
    Opcode::Push,
    Opcode::Pop,
    Opcode::Rot,
    Opcode::Fetch,
    Opcode::FetchMap,
    Opcode::True,
    Opcode::False,
    Opcode::Nil,
    Opcode::Negate,
    Opcode::Not,
    Opcode::Equal,
    Opcode::EqualInt,
    Opcode::EqualString,
    Opcode::Jump,
    Opcode::JumpIfTrue,
    Opcode::JumpIfFalse,
    Opcode::JumpIfNil,
    Opcode::JumpBackward,
    Opcode::In,
    Opcode::Less,
    Opcode::More,
    Opcode::LessOrEqual,
    Opcode::MoreOrEqual,
    Opcode::Add,
    Opcode::Subtract,
    Opcode::Multiply,
    Opcode::Divide,
    Opcode::Modulo,
    Opcode::Exponent,
    Opcode::Range,
    Opcode::Matches,
    Opcode::MatchesConst,
    Opcode::Contains,
    Opcode::StartsWith,
    Opcode::EndsWith,
    Opcode::Index,
    Opcode::Slice,
    Opcode::Property,
    Opcode::Call,
    Opcode::CallFast,
    Opcode::Method,
    Opcode::Array,
    Opcode::Map,
    Opcode::Len,
    Opcode::Cast,
    Opcode::Store,
    Opcode::Load,
    Opcode::Inc,
    Opcode::Begin,
    Opcode::End,
];

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        OPCODES.get(byte as usize).copied()
    }

    /// Whether the opcode is followed by a little-endian u16 argument.
    pub fn has_arg(&self) -> bool {
        matches!(
            self,
            Opcode::Push
                | Opcode::Fetch
                | Opcode::FetchMap
                | Opcode::Jump
                | Opcode::JumpIfTrue
                | Opcode::JumpIfFalse
                | Opcode::JumpIfNil
                | Opcode::JumpBackward
                | Opcode::MatchesConst
                | Opcode::Property
                | Opcode::Call
                | Opcode::CallFast
                | Opcode::Method
                | Opcode::Cast
                | Opcode::Store
                | Opcode::Load
                | Opcode::Inc
        )
    }
}

/// A compiled expression: constants pool, flat bytecode, one source span per
/// bytecode offset, and the source itself for error rendering. Immutable
/// after compilation.
#[derive(Debug)]
pub struct Program {
    pub source: Source,
    pub constants: Vec<Value>,
    pub bytecode: Vec<u8>,
    pub spans: Vec<Span>,
}

impl Program {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut ip = 0;
        while ip < self.bytecode.len() {
            let Some(op) = Opcode::from_byte(self.bytecode[ip]) else {
                out.push_str(&format!("{ip:04} <bad opcode {:#x}>\n", self.bytecode[ip]));
                ip += 1;
                continue;
            };
            if op.has_arg() && ip + 2 < self.bytecode.len() {
                let arg =
                    u16::from_le_bytes([self.bytecode[ip + 1], self.bytecode[ip + 2]]) as usize;
                match op {
                    Opcode::Push
                    | Opcode::Fetch
                    | Opcode::FetchMap
                    | Opcode::MatchesConst
                    | Opcode::Property
                    | Opcode::Call
                    | Opcode::CallFast
                    | Opcode::Method
                    | Opcode::Store
                    | Opcode::Load
                    | Opcode::Inc => {
                        let constant = self
                            .constants
                            .get(arg)
                            .map(|value| format!("{value:?}"))
                            .unwrap_or_else(|| "?".to_string());
                        out.push_str(&format!("{ip:04} {op:?} {constant}\n"));
                    }
                    _ => out.push_str(&format!("{ip:04} {op:?} {arg}\n")),
                }
                ip += 3;
            } else {
                out.push_str(&format!("{ip:04} {op:?}\n"));
                ip += 1;
            }
        }
        out
    }
}

// Self-describing serialization bridge: each constant carries a tag, regex
// constants serialize as their pattern, and call records keep name/arity.
// Function and object constants cannot appear in compiled programs.
#[derive(serde::Serialize, serde::Deserialize)]
enum ConstantRepr {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<ConstantRepr>),
    Map(Vec<(String, ConstantRepr)>),
    Regex(String),
    IntSet(Vec<i64>),
    Call { name: String, arity: usize },
}

fn constant_repr(value: &Value) -> Result<ConstantRepr, String> {
    Ok(match value {
        Value::Nil => ConstantRepr::Nil,
        Value::Bool(value) => ConstantRepr::Bool(*value),
        Value::Int(value) => ConstantRepr::Int(*value),
        Value::Float(value) => ConstantRepr::Float(*value),
        Value::String(value) => ConstantRepr::Str(value.as_ref().clone()),
        Value::Array(values) => ConstantRepr::Array(
            values
                .iter()
                .map(constant_repr)
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => ConstantRepr::Map(
            entries
                .iter()
                .map(|(key, value)| Ok((key.clone(), constant_repr(value)?)))
                .collect::<Result<_, String>>()?,
        ),
        Value::Regex(regex) => ConstantRepr::Regex(regex.as_str().to_string()),
        Value::IntSet(set) => ConstantRepr::IntSet(set.iter().copied().collect()),
        Value::Call(call) => ConstantRepr::Call {
            name: call.name.clone(),
            arity: call.arity,
        },
        other => return Err(format!("cannot serialize {} constant", other.type_name())),
    })
}

fn constant_value(repr: ConstantRepr) -> Result<Value, String> {
    Ok(match repr {
        ConstantRepr::Nil => Value::Nil,
        ConstantRepr::Bool(value) => Value::Bool(value),
        ConstantRepr::Int(value) => Value::Int(value),
        ConstantRepr::Float(value) => Value::Float(value),
        ConstantRepr::Str(value) => Value::string(value),
        ConstantRepr::Array(values) => Value::array(
            values
                .into_iter()
                .map(constant_value)
                .collect::<Result<_, _>>()?,
        ),
        ConstantRepr::Map(entries) => {
            let mut map = IndexMap::new();
            for (key, value) in entries {
                map.insert(key, constant_value(value)?);
            }
            Value::map(map)
        }
        ConstantRepr::Regex(pattern) => Value::Regex(Rc::new(
            Regex::new(&pattern).map_err(|err| err.to_string())?,
        )),
        ConstantRepr::IntSet(values) => Value::IntSet(Rc::new(values.into_iter().collect())),
        ConstantRepr::Call { name, arity } => Value::Call(Rc::new(Call { name, arity })),
    })
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ProgramRepr {
    source: Source,
    constants: Vec<ConstantRepr>,
    bytecode: Vec<u8>,
    spans: Vec<Span>,
}

impl serde::Serialize for Program {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let constants = self
            .constants
            .iter()
            .map(constant_repr)
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::ser::Error::custom)?;
        ProgramRepr {
            source: self.source.clone(),
            constants,
            bytecode: self.bytecode.clone(),
            spans: self.spans.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Program {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = ProgramRepr::deserialize(deserializer)?;
        let constants = repr
            .constants
            .into_iter()
            .map(constant_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::de::Error::custom)?;
        Ok(Program {
            source: repr.source,
            constants,
            bytecode: repr.bytecode,
            spans: repr.spans,
        })
    }
}

/// Lower a checked (and optionally patched/optimized) tree to bytecode.
pub fn compile(node: &Node, source: Source, config: Option<&Config>) -> Result<Program, Error> {
    let mut compiler = Compiler {
        config,
        constants: Vec::new(),
        bytecode: Vec::new(),
        spans: Vec::new(),
        chains: Vec::new(),
    };
    compiler.compile(node)?;
    if let Some(config) = config {
        match config.expect {
            Some(Expect::Int64) => {
                compiler.emit_arg(Opcode::Cast, 0, node.span);
            }
            Some(Expect::Float64) => {
                compiler.emit_arg(Opcode::Cast, 1, node.span);
            }
            _ => {}
        }
    }
    Ok(Program {
        source,
        constants: compiler.constants,
        bytecode: compiler.bytecode,
        spans: compiler.spans,
    })
}

struct Compiler<'a> {
    config: Option<&'a Config>,
    constants: Vec<Value>,
    bytecode: Vec<u8>,
    spans: Vec<Span>,
    /// Pending nil-propagation jumps, one frame per open Chain node.
    chains: Vec<Vec<usize>>,
}

impl<'a> Compiler<'a> {
    fn emit(&mut self, op: Opcode, span: Span) -> usize {
        let pos = self.bytecode.len();
        self.bytecode.push(op as u8);
        self.spans.push(span);
        pos
    }

    fn emit_arg(&mut self, op: Opcode, arg: u16, span: Span) -> usize {
        let pos = self.emit(op, span);
        let bytes = arg.to_le_bytes();
        self.bytecode.push(bytes[0]);
        self.bytecode.push(bytes[1]);
        self.spans.push(span);
        self.spans.push(span);
        pos
    }

    fn add_constant(&mut self, value: Value, span: Span) -> Result<u16, Error> {
        if let Some(index) = self.constants.iter().position(|existing| existing == &value) {
            return Ok(index as u16);
        }
        let index = self.constants.len();
        if index > u16::MAX as usize {
            return Err(Error::new("constant pool overflow", span));
        }
        self.constants.push(value);
        Ok(index as u16)
    }

    fn emit_constant(&mut self, op: Opcode, value: Value, span: Span) -> Result<usize, Error> {
        let index = self.add_constant(value, span)?;
        Ok(self.emit_arg(op, index, span))
    }

    /// Emit a forward jump with a placeholder offset; `patch_jump` later
    /// points it at the current position.
    fn emit_jump(&mut self, op: Opcode, span: Span) -> usize {
        self.emit_arg(op, 0, span)
    }

    fn patch_jump(&mut self, pos: usize) {
        let target = self.bytecode.len();
        let offset = (target - (pos + 3)) as u16;
        let bytes = offset.to_le_bytes();
        self.bytecode[pos + 1] = bytes[0];
        self.bytecode[pos + 2] = bytes[1];
    }

    fn emit_jump_backward(&mut self, target: usize, span: Span) {
        let pos = self.emit_arg(Opcode::JumpBackward, 0, span);
        let offset = ((pos + 3) - target) as u16;
        let bytes = offset.to_le_bytes();
        self.bytecode[pos + 1] = bytes[0];
        self.bytecode[pos + 2] = bytes[1];
    }

    fn compile(&mut self, node: &Node) -> Result<(), Error> {
        let span = node.span;
        match &node.kind {
            NodeKind::Nil => {
                self.emit(Opcode::Nil, span);
            }
            NodeKind::Bool(true) => {
                self.emit(Opcode::True, span);
            }
            NodeKind::Bool(false) => {
                self.emit(Opcode::False, span);
            }
            NodeKind::Int(value) => {
                self.emit_constant(Opcode::Push, Value::Int(*value), span)?;
            }
            NodeKind::Float(value) => {
                self.emit_constant(Opcode::Push, Value::Float(*value), span)?;
            }
            NodeKind::Str(value) => {
                self.emit_constant(Opcode::Push, Value::string(value.clone()), span)?;
            }
            NodeKind::Constant(value) => {
                self.emit_constant(Opcode::Push, value.clone(), span)?;
            }
            NodeKind::Identifier(name) => {
                let op = if self.fetches_from_map(name) {
                    Opcode::FetchMap
                } else {
                    Opcode::Fetch
                };
                self.emit_constant(op, Value::string(name.clone()), span)?;
            }
            NodeKind::Unary { op, node: child } => {
                self.compile(child)?;
                match op {
                    UnaryOp::Neg => {
                        self.emit(Opcode::Negate, span);
                    }
                    UnaryOp::Pos => {}
                    UnaryOp::Not => {
                        self.emit(Opcode::Not, span);
                    }
                }
            }
            NodeKind::Binary { op, left, right } => self.binary(*op, left, right, span)?,
            NodeKind::Matches { left, right, regex } => {
                self.compile(left)?;
                if let Some(regex) = regex {
                    self.emit_constant(Opcode::MatchesConst, Value::Regex(regex.clone()), span)?;
                } else {
                    self.compile(right)?;
                    self.emit(Opcode::Matches, span);
                }
            }
            NodeKind::Chain { node: inner } => {
                self.chains.push(Vec::new());
                self.compile(inner)?;
                for pos in self.chains.pop().unwrap_or_default() {
                    self.patch_jump(pos);
                }
            }
            NodeKind::Property {
                node: base,
                property,
                optional,
            } => {
                self.compile(base)?;
                let skip = if *optional {
                    Some(self.emit_jump(Opcode::JumpIfNil, span))
                } else {
                    None
                };
                self.emit_constant(Opcode::Property, Value::string(property.clone()), span)?;
                if let Some(pos) = skip {
                    match self.chains.last_mut() {
                        Some(frame) => frame.push(pos),
                        None => self.patch_jump(pos),
                    }
                }
            }
            NodeKind::Index { node: base, index } => {
                self.compile(base)?;
                self.compile(index)?;
                self.emit(Opcode::Index, span);
            }
            NodeKind::Slice {
                node: base,
                from,
                to,
            } => {
                // The VM pops from, to, then the value itself.
                self.compile(base)?;
                match to {
                    Some(to) => self.compile(to)?,
                    None => {
                        self.emit(Opcode::Len, span);
                    }
                }
                match from {
                    Some(from) => self.compile(from)?,
                    None => {
                        self.emit_constant(Opcode::Push, Value::Int(0), span)?;
                    }
                }
                self.emit(Opcode::Slice, span);
            }
            NodeKind::Method {
                node: receiver,
                method,
                args,
            } => {
                self.compile(receiver)?;
                for arg in args {
                    self.compile(arg)?;
                }
                let call = Value::Call(Rc::new(Call {
                    name: method.clone(),
                    arity: args.len(),
                }));
                self.emit_constant(Opcode::Method, call, span)?;
            }
            NodeKind::Call { name, args } => {
                for arg in args {
                    self.compile(arg)?;
                }
                let op = if self.calls_fast(name) {
                    Opcode::CallFast
                } else {
                    Opcode::Call
                };
                let call = Value::Call(Rc::new(Call {
                    name: name.clone(),
                    arity: args.len(),
                }));
                self.emit_constant(op, call, span)?;
            }
            NodeKind::Builtin { name, args } => self.builtin(name, args, span)?,
            NodeKind::Closure { node: body } => self.compile(body)?,
            NodeKind::Pointer => {
                self.emit_constant(Opcode::Load, Value::string("array"), span)?;
                self.emit_constant(Opcode::Load, Value::string("i"), span)?;
                self.emit(Opcode::Index, span);
            }
            NodeKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.compile(cond)?;
                let to_else = self.emit_jump(Opcode::JumpIfFalse, span);
                self.emit(Opcode::Pop, span);
                self.compile(then)?;
                let to_end = self.emit_jump(Opcode::Jump, span);
                self.patch_jump(to_else);
                self.emit(Opcode::Pop, span);
                self.compile(otherwise)?;
                self.patch_jump(to_end);
            }
            NodeKind::Array { nodes } => {
                for node in nodes {
                    self.compile(node)?;
                }
                self.emit_constant(Opcode::Push, Value::Int(nodes.len() as i64), span)?;
                self.emit(Opcode::Array, span);
            }
            NodeKind::Map { pairs } => {
                for (key, value) in pairs {
                    self.emit_constant(Opcode::Push, Value::string(key.clone()), span)?;
                    self.compile(value)?;
                }
                self.emit_constant(Opcode::Push, Value::Int(pairs.len() as i64), span)?;
                self.emit(Opcode::Map, span);
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, left: &Node, right: &Node, span: Span) -> Result<(), Error> {
        match op {
            BinaryOp::And => {
                self.compile(left)?;
                let end = self.emit_jump(Opcode::JumpIfFalse, span);
                self.emit(Opcode::Pop, span);
                self.compile(right)?;
                self.patch_jump(end);
                return Ok(());
            }
            BinaryOp::Or => {
                self.compile(left)?;
                let end = self.emit_jump(Opcode::JumpIfTrue, span);
                self.emit(Opcode::Pop, span);
                self.compile(right)?;
                self.patch_jump(end);
                return Ok(());
            }
            _ => {}
        }
        self.compile(left)?;
        self.compile(right)?;
        match op {
            BinaryOp::Eq => {
                self.emit(self.equality_op(left, right), span);
            }
            BinaryOp::Ne => {
                self.emit(self.equality_op(left, right), span);
                self.emit(Opcode::Not, span);
            }
            BinaryOp::Lt => {
                self.emit(Opcode::Less, span);
            }
            BinaryOp::Gt => {
                self.emit(Opcode::More, span);
            }
            BinaryOp::Le => {
                self.emit(Opcode::LessOrEqual, span);
            }
            BinaryOp::Ge => {
                self.emit(Opcode::MoreOrEqual, span);
            }
            BinaryOp::Add => {
                self.emit(Opcode::Add, span);
            }
            BinaryOp::Sub => {
                self.emit(Opcode::Subtract, span);
            }
            BinaryOp::Mul => {
                self.emit(Opcode::Multiply, span);
            }
            BinaryOp::Div => {
                self.emit(Opcode::Divide, span);
            }
            BinaryOp::Mod => {
                self.emit(Opcode::Modulo, span);
            }
            BinaryOp::Pow => {
                self.emit(Opcode::Exponent, span);
            }
            BinaryOp::Range => {
                self.emit(Opcode::Range, span);
            }
            BinaryOp::In => {
                self.emit(Opcode::In, span);
            }
            BinaryOp::Contains => {
                self.emit(Opcode::Contains, span);
            }
            BinaryOp::StartsWith => {
                self.emit(Opcode::StartsWith, span);
            }
            BinaryOp::EndsWith => {
                self.emit(Opcode::EndsWith, span);
            }
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        }
        Ok(())
    }

    // Specialized equality when the checker resolved both operand types.
    fn equality_op(&self, left: &Node, right: &Node) -> Opcode {
        match (&left.ty, &right.ty) {
            (Some(Type::Int), Some(Type::Int)) => Opcode::EqualInt,
            (Some(Type::String), Some(Type::String)) => Opcode::EqualString,
            _ => Opcode::Equal,
        }
    }

    fn fetches_from_map(&self, name: &str) -> bool {
        let Some(config) = self.config else {
            return false;
        };
        if !config.map_env {
            return false;
        }
        if let Some(shape) = &config.shape {
            if shape.fields.contains_key(name) {
                return true;
            }
        }
        config.allow_undefined && !BUILTIN_GLOBALS.contains(&name)
    }

    fn calls_fast(&self, name: &str) -> bool {
        let Some(shape) = self.config.and_then(|config| config.shape.as_ref()) else {
            return false;
        };
        match resolve_field(shape, name) {
            Ok(Some(Type::Func(func))) => {
                func.params.is_empty() && func.variadic == Some(Type::Any)
            }
            _ => false,
        }
    }

    fn scope_constant(&mut self, op: Opcode, name: &str, span: Span) -> Result<(), Error> {
        self.emit_constant(op, Value::string(name), span)?;
        Ok(())
    }

    /// Shared comprehension loop: stores the sequence, its length, and the
    /// index in the scope, then runs `body` once per element. Returns after
    /// emitting the loop-exit Pop of the condition value.
    fn emit_loop(
        &mut self,
        span: Span,
        body: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.emit(Opcode::Len, span);
        self.scope_constant(Opcode::Store, "size", span)?;
        self.scope_constant(Opcode::Store, "array", span)?;
        self.emit_constant(Opcode::Push, Value::Int(0), span)?;
        self.scope_constant(Opcode::Store, "i", span)?;
        let cond = self.bytecode.len();
        self.scope_constant(Opcode::Load, "i", span)?;
        self.scope_constant(Opcode::Load, "size", span)?;
        self.emit(Opcode::Less, span);
        let exit = self.emit_jump(Opcode::JumpIfFalse, span);
        self.emit(Opcode::Pop, span);
        body(self)?;
        self.scope_constant(Opcode::Inc, "i", span)?;
        self.emit_jump_backward(cond, span);
        self.patch_jump(exit);
        self.emit(Opcode::Pop, span);
        Ok(())
    }

    fn builtin(&mut self, name: &str, args: &[Node], span: Span) -> Result<(), Error> {
        if name == "len" {
            let arg = args
                .first()
                .ok_or_else(|| Error::new("invalid number of arguments to len", span))?;
            self.compile(arg)?;
            self.emit(Opcode::Len, span);
            self.emit(Opcode::Rot, span);
            self.emit(Opcode::Pop, span);
            return Ok(());
        }
        let [seq, closure] = args else {
            return Err(Error::new(
                format!("invalid number of arguments to {name}"),
                span,
            ));
        };
        self.compile(seq)?;
        self.emit(Opcode::Begin, span);
        match name {
            "all" => {
                let mut brk = 0;
                self.emit_loop(span, |c| {
                    c.compile(closure)?;
                    brk = c.emit_jump(Opcode::JumpIfFalse, span);
                    c.emit(Opcode::Pop, span);
                    Ok(())
                })?;
                self.emit(Opcode::True, span);
                self.patch_jump(brk);
            }
            "none" => {
                let mut brk = 0;
                self.emit_loop(span, |c| {
                    c.compile(closure)?;
                    c.emit(Opcode::Not, span);
                    brk = c.emit_jump(Opcode::JumpIfFalse, span);
                    c.emit(Opcode::Pop, span);
                    Ok(())
                })?;
                self.emit(Opcode::True, span);
                self.patch_jump(brk);
            }
            "any" => {
                let mut brk = 0;
                self.emit_loop(span, |c| {
                    c.compile(closure)?;
                    brk = c.emit_jump(Opcode::JumpIfTrue, span);
                    c.emit(Opcode::Pop, span);
                    Ok(())
                })?;
                self.emit(Opcode::False, span);
                self.patch_jump(brk);
            }
            "one" => {
                self.emit_constant(Opcode::Push, Value::Int(0), span)?;
                self.scope_constant(Opcode::Store, "count", span)?;
                self.emit_loop(span, |c| {
                    c.compile(closure)?;
                    let skip = c.emit_jump(Opcode::JumpIfFalse, span);
                    c.scope_constant(Opcode::Inc, "count", span)?;
                    c.patch_jump(skip);
                    c.emit(Opcode::Pop, span);
                    Ok(())
                })?;
                self.scope_constant(Opcode::Load, "count", span)?;
                self.emit_constant(Opcode::Push, Value::Int(1), span)?;
                self.emit(Opcode::EqualInt, span);
            }
            "count" => {
                self.emit_constant(Opcode::Push, Value::Int(0), span)?;
                self.scope_constant(Opcode::Store, "count", span)?;
                self.emit_loop(span, |c| {
                    c.compile(closure)?;
                    let skip = c.emit_jump(Opcode::JumpIfFalse, span);
                    c.scope_constant(Opcode::Inc, "count", span)?;
                    c.patch_jump(skip);
                    c.emit(Opcode::Pop, span);
                    Ok(())
                })?;
                self.scope_constant(Opcode::Load, "count", span)?;
            }
            "filter" => {
                self.emit_constant(Opcode::Push, Value::Int(0), span)?;
                self.scope_constant(Opcode::Store, "count", span)?;
                self.emit_loop(span, |c| {
                    c.compile(closure)?;
                    let skip = c.emit_jump(Opcode::JumpIfFalse, span);
                    c.emit(Opcode::Pop, span);
                    c.scope_constant(Opcode::Load, "array", span)?;
                    c.scope_constant(Opcode::Load, "i", span)?;
                    c.emit(Opcode::Index, span);
                    c.scope_constant(Opcode::Inc, "count", span)?;
                    let cont = c.emit_jump(Opcode::Jump, span);
                    c.patch_jump(skip);
                    c.emit(Opcode::Pop, span);
                    c.patch_jump(cont);
                    Ok(())
                })?;
                self.scope_constant(Opcode::Load, "count", span)?;
                self.emit(Opcode::Array, span);
            }
            "map" => {
                self.emit_loop(span, |c| c.compile(closure))?;
                self.scope_constant(Opcode::Load, "size", span)?;
                self.emit(Opcode::Array, span);
            }
            other => {
                return Err(Error::new(format!("unknown builtin {other}"), span));
            }
        }
        self.emit(Opcode::End, span);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime operators. Numeric operands promote int x float to float, integer
// arithmetic wraps, and every failure reports the operand types.

fn mismatched(op: &str, a: &Value, b: &Value) -> String {
    format!(
        "invalid operation: {op} (mismatched types {} and {})",
        a.type_name(),
        b.type_name()
    )
}

fn add(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::String(a), Value::String(b)) => Ok(Value::string(format!("{a}{b}"))),
        (a, b) => Err(mismatched("+", &a, &b)),
    }
}

fn subtract(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 - b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (a, b) => Err(mismatched("-", &a, &b)),
    }
}

fn multiply(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 * b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a * b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
        (a, b) => Err(mismatched("*", &a, &b)),
    }
}

fn divide(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err("integer divide by zero".to_string()),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 / b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (a, b) => Err(mismatched("/", &a, &b)),
    }
}

fn modulo(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err("integer divide by zero".to_string()),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(b))),
        (a, b) => Err(mismatched("%", &a, &b)),
    }
}

fn exponent(a: Value, b: Value) -> Result<Value, String> {
    let base = match &a {
        Value::Int(value) => *value as f64,
        Value::Float(value) => *value,
        _ => return Err(mismatched("**", &a, &b)),
    };
    let power = match &b {
        Value::Int(value) => *value as f64,
        Value::Float(value) => *value,
        _ => return Err(mismatched("**", &a, &b)),
    };
    Ok(Value::Float(base.powf(power)))
}

fn negate(value: Value) -> Result<Value, String> {
    match value {
        Value::Int(value) => Ok(Value::Int(value.wrapping_neg())),
        Value::Float(value) => Ok(Value::Float(-value)),
        other => Err(format!("cannot negate {}", other.type_name())),
    }
}

/// Equality with numeric promotion at the top level; composite values
/// compare structurally.
fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        (a, b) => a == b,
    }
}

fn compare(op: &str, a: Value, b: Value) -> Result<Option<std::cmp::Ordering>, String> {
    match (&a, &b) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
        (Value::Int(a), Value::Float(b)) => Ok((*a as f64).partial_cmp(b)),
        (Value::Float(a), Value::Int(b)) => Ok(a.partial_cmp(&(*b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(a.partial_cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        _ => Err(mismatched(op, &a, &b)),
    }
}

fn object_has(object: &dyn vex_syntax::Object, name: &str) -> bool {
    if object.fields().contains(&name) {
        return true;
    }
    for embedded in object.embedded() {
        if let Some(index) = object.fields().iter().position(|field| field == embedded) {
            if let Value::Object(inner) = object.field(index) {
                if object_has(inner.as_ref(), name) {
                    return true;
                }
            }
        }
    }
    object.fetch_property(name).is_some()
}

fn value_in(a: &Value, b: &Value) -> Result<bool, String> {
    match b {
        Value::Array(values) => Ok(values.iter().any(|value| equal(a, value))),
        Value::IntSet(set) => match a {
            Value::Int(value) => Ok(set.contains(value)),
            _ => Err(mismatched("in", a, b)),
        },
        Value::Map(entries) => match a {
            Value::String(key) => Ok(entries.contains_key(key.as_str())),
            _ => Err(mismatched("in", a, b)),
        },
        Value::Object(object) => match a {
            Value::String(name) => Ok(object_has(object.as_ref(), name)),
            _ => Err(mismatched("in", a, b)),
        },
        _ => Err(format!("operator in not defined on {}", b.type_name())),
    }
}

fn length(value: &Value) -> Result<i64, String> {
    match value {
        Value::Array(values) => Ok(values.len() as i64),
        Value::Map(entries) => Ok(entries.len() as i64),
        Value::String(value) => Ok(value.chars().count() as i64),
        other => Err(format!("invalid argument for len (type {})", other.type_name())),
    }
}

fn as_index(value: &Value) -> Result<usize, String> {
    match value {
        Value::Int(index) if *index >= 0 => Ok(*index as usize),
        Value::Int(index) => Err(format!("negative index: {index}")),
        other => Err(format!("non-integer index ({})", other.type_name())),
    }
}

/// Slice with clamped bounds: `to` clamps to the length, `from` clamps to
/// `to`, so out-of-range slices come back empty instead of failing.
fn slice_value(node: Value, from: Value, to: Value) -> Result<Value, String> {
    let from = as_index(&from)?;
    let to = as_index(&to)?;
    match node {
        Value::Array(values) => {
            let to = to.min(values.len());
            let from = from.min(to);
            Ok(Value::array(values[from..to].to_vec()))
        }
        Value::String(value) => {
            let chars: Vec<char> = value.chars().collect();
            let to = to.min(chars.len());
            let from = from.min(to);
            Ok(Value::string(chars[from..to].iter().collect::<String>()))
        }
        other => Err(format!("cannot slice {}", other.type_name())),
    }
}

fn to_int64(value: Value) -> Result<i64, String> {
    match value {
        Value::Int(value) => Ok(value),
        Value::Float(value) => Ok(value as i64),
        other => Err(format!("cannot cast {} to int64", other.type_name())),
    }
}

fn to_float64(value: Value) -> Result<f64, String> {
    match value {
        Value::Int(value) => Ok(value as f64),
        Value::Float(value) => Ok(value),
        other => Err(format!("cannot cast {} to float64", other.type_name())),
    }
}

// ---------------------------------------------------------------------------
// Call marshaling: truncate surplus arguments to fixed-arity callees, coerce
// every argument to its declared kind, and convert host panics into runtime
// errors at the call boundary.

fn coerce(value: Value, kind: Kind) -> Result<Value, String> {
    match kind {
        Kind::Any => Ok(value),
        Kind::Int => Ok(Value::Int(to_int64(value)?)),
        Kind::Float => Ok(Value::Float(to_float64(value)?)),
        Kind::String => match value {
            Value::String(_) => Ok(value),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                Ok(Value::string(value.to_string()))
            }
            other => Err(format!("cannot use {} as string argument", other.type_name())),
        },
        Kind::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(format!("cannot use {} as bool argument", other.type_name())),
        },
    }
}

pub fn call_func_def(def: &FuncDef, mut args: Vec<Value>) -> Result<Value, String> {
    if def.variadic.is_none() {
        args.truncate(def.params.len());
    }
    if args.len() < def.params.len() {
        return Err("not enough arguments".to_string());
    }
    for (index, kind) in def.params.iter().enumerate() {
        let value = std::mem::replace(&mut args[index], Value::Nil);
        args[index] = coerce(value, *kind)?;
    }
    if let Some(tail) = def.variadic {
        for index in def.params.len()..args.len() {
            let value = std::mem::replace(&mut args[index], Value::Nil);
            args[index] = coerce(value, tail)?;
        }
    }
    invoke(def, &args)
}

fn invoke(def: &FuncDef, args: &[Value]) -> Result<Value, String> {
    match catch_unwind(AssertUnwindSafe(|| (def.func)(args))) {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "host function panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Textual number trimming for the parseInt/parseFloat builtins and the
// tolerant Math argument coercion.

pub fn int_out_of_any(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(value) => Ok(*value),
        Value::Float(value) => Ok(*value as i64),
        Value::String(value) => trim_int(value),
        Value::Nil => Err("cannot convert nil to number".to_string()),
        other => Err(format!("cannot convert {} to number", other.type_name())),
    }
}

pub fn float_out_of_any(value: &Value) -> Result<f64, String> {
    match value {
        Value::Int(value) => Ok(*value as f64),
        Value::Float(value) => Ok(*value),
        Value::String(value) => trim_float(value),
        Value::Nil => Err("cannot convert nil to number".to_string()),
        other => Err(format!("cannot convert {} to number", other.type_name())),
    }
}

fn trim_int(text: &str) -> Result<i64, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut start = 0;
    let mut end = chars.len();
    let mut started = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !c.is_ascii_digit() {
            if started {
                end = i;
                break;
            }
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            if c == '+' || c == '-' {
                started = true;
                start = i;
                i += 1;
                continue;
            }
            return Err(format!("cannot trim an integer out of string {text:?}"));
        }
        if !started {
            started = true;
            start = i;
        }
        i += 1;
    }
    if !started {
        return Err(format!("cannot trim an integer out of string {text:?}"));
    }
    chars[start..end]
        .iter()
        .collect::<String>()
        .parse::<i64>()
        .map_err(|_| format!("cannot trim an integer out of string {text:?}"))
}

fn trim_float(text: &str) -> Result<f64, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut start = 0;
    let mut end = chars.len();
    let mut started = false;
    let mut dotted = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !c.is_ascii_digit() {
            if started {
                if c == '.' && !dotted {
                    dotted = true;
                    i += 1;
                    continue;
                }
                end = i;
                break;
            }
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            if c == '.' {
                started = true;
                dotted = true;
                start = i;
                i += 1;
                continue;
            }
            if c == '+' || c == '-' {
                started = true;
                start = i;
                i += 1;
                continue;
            }
            return Err(format!("cannot trim a float out of string {text:?}"));
        }
        if !started {
            started = true;
            start = i;
        }
        i += 1;
    }
    if !started {
        return Err(format!("cannot trim a float out of string {text:?}"));
    }
    chars[start..end]
        .iter()
        .collect::<String>()
        .parse::<f64>()
        .map_err(|_| format!("cannot trim a float out of string {text:?}"))
}

// ---------------------------------------------------------------------------
// Builtin tables. Looked up after the environment, so hosts may shadow any
// of them per call. Fixed-arity Math functions deliberately tolerate surplus
// arguments and string-coercible numbers.

fn float_arg(args: &[Value], index: usize) -> Result<f64, String> {
    match args.get(index) {
        Some(value) => float_out_of_any(value),
        None => Err("cannot convert nil to number".to_string()),
    }
}

fn math1(f: fn(f64) -> f64) -> Value {
    Value::func(FuncDef::variadic(Vec::new(), Kind::Any, move |args| {
        Ok(Value::Float(f(float_arg(args, 0)?)))
    }))
}

fn math2(f: fn(f64, f64) -> f64) -> Value {
    Value::func(FuncDef::variadic(Vec::new(), Kind::Any, move |args| {
        Ok(Value::Float(f(float_arg(args, 0)?, float_arg(args, 1)?)))
    }))
}

fn math_fold(init: f64, f: fn(f64, f64) -> f64) -> Value {
    Value::func(FuncDef::variadic(Vec::new(), Kind::Any, move |args| {
        let mut acc = init;
        for value in args {
            acc = f(acc, float_out_of_any(value)?);
        }
        Ok(Value::Float(acc))
    }))
}

fn mix_seed(seed: u64) -> u64 {
    let mut value = seed ^ 0x9E37_79B9_7F4A_7C15;
    value ^= value >> 12;
    value ^= value << 25;
    value ^= value >> 27;
    value.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

fn math_object() -> Value {
    let mut math = IndexMap::new();
    math.insert("abs".to_string(), math1(f64::abs));
    math.insert("ceil".to_string(), math1(f64::ceil));
    math.insert("floor".to_string(), math1(f64::floor));
    math.insert("round".to_string(), math1(f64::round));
    math.insert("trunc".to_string(), math1(f64::trunc));
    math.insert("sqrt".to_string(), math1(f64::sqrt));
    math.insert("cbrt".to_string(), math1(f64::cbrt));
    math.insert("exp".to_string(), math1(f64::exp));
    math.insert("expm1".to_string(), math1(f64::exp_m1));
    math.insert("sin".to_string(), math1(f64::sin));
    math.insert("cos".to_string(), math1(f64::cos));
    math.insert("tan".to_string(), math1(f64::tan));
    math.insert("asin".to_string(), math1(f64::asin));
    math.insert("acos".to_string(), math1(f64::acos));
    math.insert("atan".to_string(), math1(f64::atan));
    math.insert("sinh".to_string(), math1(f64::sinh));
    math.insert("cosh".to_string(), math1(f64::cosh));
    math.insert("tanh".to_string(), math1(f64::tanh));
    math.insert("asinh".to_string(), math1(f64::asinh));
    math.insert("acosh".to_string(), math1(f64::acosh));
    math.insert("atanh".to_string(), math1(f64::atanh));
    math.insert("log".to_string(), math1(f64::ln));
    math.insert("log2".to_string(), math1(f64::log2));
    math.insert("log10".to_string(), math1(f64::log10));
    math.insert("log1p".to_string(), math1(f64::ln_1p));
    math.insert(
        "sign".to_string(),
        math1(|x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                x
            }
        }),
    );
    math.insert("pow".to_string(), math2(f64::powf));
    math.insert("atan2".to_string(), math2(f64::atan2));
    math.insert(
        "hypot".to_string(),
        Value::func(FuncDef::variadic(Vec::new(), Kind::Any, |args| {
            let mut sum = 0.0;
            for value in args {
                let x = float_out_of_any(value)?;
                sum += x * x;
            }
            Ok(Value::Float(sum.sqrt()))
        })),
    );
    math.insert("max".to_string(), math_fold(f64::NEG_INFINITY, f64::max));
    math.insert("min".to_string(), math_fold(f64::INFINITY, f64::min));
    math.insert(
        "random".to_string(),
        Value::func(FuncDef::variadic(Vec::new(), Kind::Any, |_args| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|err| err.to_string())?;
            let mixed = mix_seed(now.as_nanos() as u64);
            Ok(Value::Float((mixed >> 11) as f64 / (1u64 << 53) as f64))
        })),
    );
    math.insert("E".to_string(), Value::Float(std::f64::consts::E));
    math.insert("PI".to_string(), Value::Float(std::f64::consts::PI));
    math.insert("LN2".to_string(), Value::Float(std::f64::consts::LN_2));
    math.insert("LN10".to_string(), Value::Float(std::f64::consts::LN_10));
    math.insert("LOG2E".to_string(), Value::Float(std::f64::consts::LOG2_E));
    math.insert("LOG10E".to_string(), Value::Float(std::f64::consts::LOG10_E));
    math.insert(
        "SQRT1_2".to_string(),
        Value::Float(std::f64::consts::FRAC_1_SQRT_2),
    );
    math.insert("SQRT2".to_string(), Value::Float(std::f64::consts::SQRT_2));
    Value::map(math)
}

fn date_object() -> Value {
    let mut date = IndexMap::new();
    date.insert(
        "now".to_string(),
        Value::func(FuncDef::variadic(Vec::new(), Kind::Any, |_args| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|err| err.to_string())?;
            Ok(Value::Int(now.as_secs() as i64))
        })),
    );
    Value::map(date)
}

fn builtin_objects() -> IndexMap<String, Value> {
    let mut objects = IndexMap::new();
    objects.insert("Math".to_string(), math_object());
    objects.insert("Date".to_string(), date_object());
    objects
}

fn builtin_funcs() -> IndexMap<String, Value> {
    let mut funcs = IndexMap::new();
    funcs.insert(
        "parseInt".to_string(),
        Value::func(FuncDef::variadic(Vec::new(), Kind::Any, |args| {
            if args.is_empty() {
                return Ok(Value::Nil);
            }
            let number = int_out_of_any(&args[0])?;
            let radix = if args.len() >= 2 {
                int_out_of_any(&args[1])?
            } else {
                10
            };
            if !(2..=36).contains(&radix) {
                return Err(format!("invalid radix {radix}"));
            }
            // The textually trimmed integer is re-read with its decimal
            // digits interpreted in the given radix: parseInt("10", 16)
            // yields 16.
            i64::from_str_radix(&number.to_string(), radix as u32)
                .map(Value::Int)
                .map_err(|err| err.to_string())
        })),
    );
    funcs.insert(
        "parseFloat".to_string(),
        Value::func(FuncDef::variadic(Vec::new(), Kind::Any, |args| {
            if args.is_empty() {
                return Ok(Value::Nil);
            }
            float_out_of_any(&args[0]).map(Value::Float)
        })),
    );
    funcs
}

// ---------------------------------------------------------------------------
// Optimizer: pure AST-to-AST rewrites applied to a fix-point.

/// Rewrites: constant folding over unary/binary/matches nodes, `in` over an
/// all-integer array into set membership, `in` over a literal range into a
/// double comparison, literal ranges within the memory budget into constant
/// sequences, and const-expr calls with constant arguments into their
/// results (failures surface as compile errors at the call site).
pub fn optimize(node: &mut Node, config: Option<&Config>) -> Result<(), Error> {
    loop {
        let mut changed = false;
        fold(node, config, &mut changed)?;
        if !changed {
            return Ok(());
        }
    }
}

fn literal_value(node: &Node) -> Option<Value> {
    match &node.kind {
        NodeKind::Nil => Some(Value::Nil),
        NodeKind::Bool(value) => Some(Value::Bool(*value)),
        NodeKind::Int(value) => Some(Value::Int(*value)),
        NodeKind::Float(value) => Some(Value::Float(*value)),
        NodeKind::Str(value) => Some(Value::string(value.clone())),
        NodeKind::Constant(value) => Some(value.clone()),
        NodeKind::Array { nodes } => nodes
            .iter()
            .map(literal_value)
            .collect::<Option<Vec<_>>>()
            .map(Value::array),
        _ => None,
    }
}

fn int_literal(node: &Node) -> Option<i64> {
    match &node.kind {
        NodeKind::Int(value) => Some(*value),
        NodeKind::Constant(Value::Int(value)) => Some(*value),
        _ => None,
    }
}

fn fold(node: &mut Node, config: Option<&Config>, changed: &mut bool) -> Result<(), Error> {
    // Membership rewrites look at the unfolded right-hand shape, so `in`
    // folds its children by hand before the generic pass would.
    if let NodeKind::Binary {
        op: BinaryOp::In,
        left,
        right,
    } = &mut node.kind
    {
        fold(left, config, changed)?;
        match &mut right.kind {
            NodeKind::Binary {
                op: BinaryOp::Range,
                left: low,
                right: high,
            } => {
                fold(low, config, changed)?;
                fold(high, config, changed)?;
                if let (Some(low), Some(high)) = (int_literal(low), int_literal(high)) {
                    let span = node.span;
                    let subject = left.as_ref().clone();
                    let ge = Node::new(
                        NodeKind::Binary {
                            op: BinaryOp::Ge,
                            left: Box::new(subject.clone()),
                            right: Box::new(Node::new(NodeKind::Int(low), span)),
                        },
                        span,
                    );
                    let le = Node::new(
                        NodeKind::Binary {
                            op: BinaryOp::Le,
                            left: Box::new(subject),
                            right: Box::new(Node::new(NodeKind::Int(high), span)),
                        },
                        span,
                    );
                    node.kind = NodeKind::Binary {
                        op: BinaryOp::And,
                        left: Box::new(ge),
                        right: Box::new(le),
                    };
                    *changed = true;
                    return Ok(());
                }
            }
            NodeKind::Array { nodes } => {
                for element in nodes.iter_mut() {
                    fold(element, config, changed)?;
                }
                if !nodes.is_empty()
                    && nodes
                        .iter()
                        .all(|element| matches!(element.kind, NodeKind::Int(_)))
                {
                    let set = nodes
                        .iter()
                        .filter_map(int_literal)
                        .collect::<std::collections::BTreeSet<i64>>();
                    right.kind = NodeKind::Constant(Value::IntSet(Rc::new(set)));
                    *changed = true;
                }
            }
            _ => fold(right, config, changed)?,
        }
        return Ok(());
    }

    fold_children(node, config, changed)?;

    let span = node.span;
    match &node.kind {
        NodeKind::Unary { op, node: child } => {
            if let Some(value) = literal_value(child) {
                let folded = match op {
                    UnaryOp::Neg => negate(value).ok(),
                    UnaryOp::Pos => match value {
                        Value::Int(_) | Value::Float(_) => Some(value),
                        _ => None,
                    },
                    UnaryOp::Not => match value {
                        Value::Bool(value) => Some(Value::Bool(!value)),
                        _ => None,
                    },
                };
                if let Some(folded) = folded {
                    node.kind = constant_kind(folded);
                    *changed = true;
                }
            }
        }
        NodeKind::Binary { op, left, right } => {
            let op = *op;
            if op == BinaryOp::Range {
                if let (Some(low), Some(high)) = (int_literal(left), int_literal(right)) {
                    let size = if high >= low {
                        high as i128 - low as i128 + 1
                    } else {
                        0
                    };
                    if size <= MEMORY_BUDGET as i128 {
                        let values = (low..=high).map(Value::Int).collect::<Vec<_>>();
                        node.kind = NodeKind::Constant(Value::array(values));
                        *changed = true;
                    }
                }
            } else if let (Some(a), Some(b)) = (literal_value(left), literal_value(right)) {
                if let Some(folded) = fold_binary(op, a, b) {
                    node.kind = constant_kind(folded);
                    *changed = true;
                }
            }
        }
        NodeKind::Matches { left, right, regex } => {
            if let (Some(Value::String(subject)), Some(Value::String(pattern))) =
                (literal_value(left), literal_value(right))
            {
                let matched = match regex {
                    Some(regex) => regex.is_match(&subject),
                    None => Regex::new(&pattern)
                        .map_err(|err| Error::new(err.to_string(), span))?
                        .is_match(&subject),
                };
                node.kind = NodeKind::Bool(matched);
                *changed = true;
            }
        }
        NodeKind::Array { nodes } => {
            if let Some(values) = nodes
                .iter()
                .map(literal_value)
                .collect::<Option<Vec<_>>>()
            {
                node.kind = NodeKind::Constant(Value::array(values));
                *changed = true;
            }
        }
        NodeKind::Call { name, args } => {
            let Some(config) = config else {
                return Ok(());
            };
            if !config.const_fns.contains(name) {
                return Ok(());
            }
            let Some(values) = args
                .iter()
                .map(literal_value)
                .collect::<Option<Vec<Value>>>()
            else {
                return Ok(());
            };
            let def = const_fn_target(config, name)
                .ok_or_else(|| Error::new(format!("const-expr `{name}` does not name a function"), span))?;
            let result = call_func_def(&def, values).map_err(|message| Error::new(message, span))?;
            node.kind = constant_kind(result);
            *changed = true;
        }
        _ => {}
    }
    Ok(())
}

// Literal kinds fold back into literal nodes so later passes keep matching
// on them; everything else becomes an opaque Constant.
fn constant_kind(value: Value) -> NodeKind {
    match value {
        Value::Nil => NodeKind::Nil,
        Value::Bool(value) => NodeKind::Bool(value),
        Value::Int(value) => NodeKind::Int(value),
        Value::Float(value) => NodeKind::Float(value),
        Value::String(value) => NodeKind::Str(value.as_ref().clone()),
        other => NodeKind::Constant(other),
    }
}

fn fold_binary(op: BinaryOp, a: Value, b: Value) -> Option<Value> {
    match op {
        BinaryOp::Add => add(a, b).ok(),
        BinaryOp::Sub => subtract(a, b).ok(),
        BinaryOp::Mul => multiply(a, b).ok(),
        BinaryOp::Div => divide(a, b).ok(),
        BinaryOp::Mod => modulo(a, b).ok(),
        BinaryOp::Pow => exponent(a, b).ok(),
        BinaryOp::Eq => Some(Value::Bool(equal(&a, &b))),
        BinaryOp::Ne => Some(Value::Bool(!equal(&a, &b))),
        BinaryOp::Lt => compare("<", a, b)
            .ok()
            .map(|ord| Value::Bool(matches!(ord, Some(std::cmp::Ordering::Less)))),
        BinaryOp::Le => compare("<=", a, b).ok().map(|ord| {
            Value::Bool(matches!(
                ord,
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            ))
        }),
        BinaryOp::Gt => compare(">", a, b)
            .ok()
            .map(|ord| Value::Bool(matches!(ord, Some(std::cmp::Ordering::Greater)))),
        BinaryOp::Ge => compare(">=", a, b).ok().map(|ord| {
            Value::Bool(matches!(
                ord,
                Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
            ))
        }),
        BinaryOp::And => match (a, b) {
            (Value::Bool(a), Value::Bool(b)) => Some(Value::Bool(a && b)),
            _ => None,
        },
        BinaryOp::Or => match (a, b) {
            (Value::Bool(a), Value::Bool(b)) => Some(Value::Bool(a || b)),
            _ => None,
        },
        BinaryOp::Contains => match (a, b) {
            (Value::String(a), Value::String(b)) => Some(Value::Bool(a.contains(b.as_str()))),
            _ => None,
        },
        BinaryOp::StartsWith => match (a, b) {
            (Value::String(a), Value::String(b)) => Some(Value::Bool(a.starts_with(b.as_str()))),
            _ => None,
        },
        BinaryOp::EndsWith => match (a, b) {
            (Value::String(a), Value::String(b)) => Some(Value::Bool(a.ends_with(b.as_str()))),
            _ => None,
        },
        BinaryOp::Range | BinaryOp::In => None,
    }
}

fn const_fn_target(config: &Config, name: &str) -> Option<Rc<FuncDef>> {
    match config.env.as_ref()? {
        Value::Map(entries) => match entries.get(name) {
            Some(Value::Func(def)) => Some(def.clone()),
            _ => None,
        },
        Value::Object(object) => {
            let index = object.fields().iter().position(|field| *field == name)?;
            match object.field(index) {
                Value::Func(def) => Some(def),
                _ => None,
            }
        }
        _ => None,
    }
}

fn fold_children(node: &mut Node, config: Option<&Config>, changed: &mut bool) -> Result<(), Error> {
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
        | NodeKind::Closure { node: child } => fold(child, config, changed)?,
        NodeKind::Binary { left, right, .. } | NodeKind::Matches { left, right, .. } => {
            fold(left, config, changed)?;
            fold(right, config, changed)?;
        }
        NodeKind::Property { node: child, .. } => fold(child, config, changed)?,
        NodeKind::Index { node: child, index } => {
            fold(child, config, changed)?;
            fold(index, config, changed)?;
        }
        NodeKind::Slice {
            node: child,
            from,
            to,
        } => {
            fold(child, config, changed)?;
            if let Some(from) = from {
                fold(from, config, changed)?;
            }
            if let Some(to) = to {
                fold(to, config, changed)?;
            }
        }
        NodeKind::Method {
            node: child, args, ..
        } => {
            fold(child, config, changed)?;
            for arg in args {
                fold(arg, config, changed)?;
            }
        }
        NodeKind::Call { args, .. } | NodeKind::Builtin { args, .. } => {
            for arg in args {
                fold(arg, config, changed)?;
            }
        }
        NodeKind::Conditional {
            cond,
            then,
            otherwise,
        } => {
            fold(cond, config, changed)?;
            fold(then, config, changed)?;
            fold(otherwise, config, changed)?;
        }
        NodeKind::Array { nodes } => {
            for node in nodes {
                fold(node, config, changed)?;
            }
        }
        NodeKind::Map { pairs } => {
            for (_, value) in pairs {
                fold(value, config, changed)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The virtual machine: a single dispatch loop over bytecode offsets, with a
// last-executed pointer mapping failures back to source spans. A Vm owns a
// mutable stack, comprehension scopes, and the field cache; it is exclusive
// to one caller at a time but reusable (and cheaper) across runs.

/// Invoked between every instruction when installed; blocking inside the
/// hook is the single-step suspension point.
pub trait StepHook {
    fn before_op(&mut self, ip: usize, op: Opcode);
}

type Scope = HashMap<String, Value>;

pub struct Vm {
    stack: Vec<Value>,
    scopes: Vec<Scope>,
    memory: usize,
    memory_budget: usize,
    /// Published-field slots per host object shape, built lazily on first
    /// access and reused across runs.
    field_cache: HashMap<TypeId, HashMap<String, usize>>,
    step_hook: Option<Box<dyn StepHook>>,
    builtin_objects: IndexMap<String, Value>,
    builtin_funcs: IndexMap<String, Value>,
}

/// One-shot convenience around a fresh [`Vm`].
pub fn run(program: &Program, env: &Value) -> Result<Value, Error> {
    Vm::new().run(program, env)
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            stack: Vec::with_capacity(2),
            scopes: Vec::new(),
            memory: 0,
            memory_budget: MEMORY_BUDGET,
            field_cache: HashMap::new(),
            step_hook: None,
            builtin_objects: builtin_objects(),
            builtin_funcs: builtin_funcs(),
        }
    }

    pub fn set_memory_budget(&mut self, budget: usize) {
        self.memory_budget = budget;
    }

    pub fn set_step_hook(&mut self, hook: Box<dyn StepHook>) {
        self.step_hook = Some(hook);
    }

    pub fn run(&mut self, program: &Program, env: &Value) -> Result<Value, Error> {
        self.stack.clear();
        self.scopes.clear();
        self.memory = 0;
        let mut ip = 0;
        let mut pp = 0;
        match self.dispatch(program, env, &mut ip, &mut pp) {
            Ok(value) => Ok(value),
            Err(message) => {
                let span = program.spans.get(pp).copied().unwrap_or_default();
                Err(Error::new(message, span).bind(&program.source))
            }
        }
    }

    fn dispatch(
        &mut self,
        program: &Program,
        env: &Value,
        ip: &mut usize,
        pp: &mut usize,
    ) -> Result<Value, String> {
        while *ip < program.bytecode.len() {
            *pp = *ip;
            let byte = program.bytecode[*pp];
            let op = Opcode::from_byte(byte)
                .ok_or_else(|| format!("unknown bytecode {byte:#x}"))?;
            if let Some(hook) = self.step_hook.as_mut() {
                hook.before_op(*pp, op);
            }
            *ip += 1;
            match op {
                Opcode::Push => {
                    let value = self.constant(program, ip)?;
                    self.push(value);
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::Rot => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(b);
                    self.push(a);
                }
                Opcode::Fetch => {
                    let name = self.constant_str(program, ip)?;
                    let value = self.fetch_env(env, &name)?;
                    self.push(value);
                }
                Opcode::FetchMap => {
                    let name = self.constant_str(program, ip)?;
                    let Value::Map(entries) = env else {
                        return Err("environment is not a map".to_string());
                    };
                    let value = entries.get(name.as_str()).cloned().unwrap_or(Value::Nil);
                    self.push(value);
                }
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Nil => self.push(Value::Nil),
                Opcode::Negate => {
                    let value = negate(self.pop_operand()?)?;
                    self.push(value);
                }
                Opcode::Not => {
                    let value = self.pop_bool()?;
                    self.push(Value::Bool(!value));
                }
                Opcode::Equal => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    self.push(Value::Bool(equal(&a, &b)));
                }
                Opcode::EqualInt => {
                    let b = self.pop_int()?;
                    let a = self.pop_int()?;
                    self.push(Value::Bool(a == b));
                }
                Opcode::EqualString => {
                    let b = self.pop_str()?;
                    let a = self.pop_str()?;
                    self.push(Value::Bool(a == b));
                }
                Opcode::Jump => {
                    let offset = self.arg(program, ip)?;
                    *ip += offset as usize;
                }
                Opcode::JumpIfTrue => {
                    let offset = self.arg(program, ip)?;
                    if self.current_bool()? {
                        *ip += offset as usize;
                    }
                }
                Opcode::JumpIfFalse => {
                    let offset = self.arg(program, ip)?;
                    if !self.current_bool()? {
                        *ip += offset as usize;
                    }
                }
                Opcode::JumpIfNil => {
                    let offset = self.arg(program, ip)?;
                    if self.current()?.is_nil() {
                        *ip += offset as usize;
                    }
                }
                Opcode::JumpBackward => {
                    let offset = self.arg(program, ip)?;
                    *ip -= offset as usize;
                }
                Opcode::In => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    self.push(Value::Bool(value_in(&a, &b)?));
                }
                Opcode::Less => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let ord = compare("<", a, b)?;
                    self.push(Value::Bool(matches!(ord, Some(std::cmp::Ordering::Less))));
                }
                Opcode::More => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let ord = compare(">", a, b)?;
                    self.push(Value::Bool(matches!(
                        ord,
                        Some(std::cmp::Ordering::Greater)
                    )));
                }
                Opcode::LessOrEqual => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let ord = compare("<=", a, b)?;
                    self.push(Value::Bool(matches!(
                        ord,
                        Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                    )));
                }
                Opcode::MoreOrEqual => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let ord = compare(">=", a, b)?;
                    self.push(Value::Bool(matches!(
                        ord,
                        Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                    )));
                }
                Opcode::Add => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = add(a, b)?;
                    self.push(value);
                }
                Opcode::Subtract => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = subtract(a, b)?;
                    self.push(value);
                }
                Opcode::Multiply => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = multiply(a, b)?;
                    self.push(value);
                }
                Opcode::Divide => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = divide(a, b)?;
                    self.push(value);
                }
                Opcode::Modulo => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = modulo(a, b)?;
                    self.push(value);
                }
                Opcode::Exponent => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = exponent(a, b)?;
                    self.push(value);
                }
                Opcode::Range => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let (Value::Int(low), Value::Int(high)) = (&a, &b) else {
                        return Err(mismatched("..", &a, &b));
                    };
                    let (low, high) = (*low, *high);
                    let size = if high >= low {
                        high as i128 - low as i128 + 1
                    } else {
                        0
                    };
                    // The budget is enforced before the sequence exists.
                    if self.memory as i128 + size >= self.memory_budget as i128 {
                        return Err("memory budget exceeded".to_string());
                    }
                    let values = (low..=high).map(Value::Int).collect::<Vec<_>>();
                    self.memory += size as usize;
                    self.push(Value::array(values));
                }
                Opcode::Matches => {
                    let pattern = self.pop_str()?;
                    let subject = self.pop_str()?;
                    let regex = Regex::new(&pattern).map_err(|err| err.to_string())?;
                    self.push(Value::Bool(regex.is_match(&subject)));
                }
                Opcode::MatchesConst => {
                    let regex = self.constant(program, ip)?;
                    let Value::Regex(regex) = regex else {
                        return Err("matches constant is not a pattern".to_string());
                    };
                    let subject = self.pop_str()?;
                    self.push(Value::Bool(regex.is_match(&subject)));
                }
                Opcode::Contains => {
                    let b = self.pop_str()?;
                    let a = self.pop_str()?;
                    self.push(Value::Bool(a.contains(b.as_str())));
                }
                Opcode::StartsWith => {
                    let b = self.pop_str()?;
                    let a = self.pop_str()?;
                    self.push(Value::Bool(a.starts_with(b.as_str())));
                }
                Opcode::EndsWith => {
                    let b = self.pop_str()?;
                    let a = self.pop_str()?;
                    self.push(Value::Bool(a.ends_with(b.as_str())));
                }
                Opcode::Index => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let value = self.fetch_value(a, b)?;
                    self.push(value);
                }
                Opcode::Slice => {
                    let from = self.pop_operand()?;
                    let to = self.pop_operand()?;
                    let node = self.pop_operand()?;
                    let value = slice_value(node, from, to)?;
                    self.push(value);
                }
                Opcode::Property => {
                    let name = self.constant_str(program, ip)?;
                    // The chain base is popped raw: a value provider keeps
                    // exposing its own properties until it becomes an
                    // operand.
                    let base = self.pop()?;
                    let value = self.fetch_value(base, Value::String(name))?;
                    self.push(value);
                }
                Opcode::Call | Opcode::CallFast => {
                    let call = self.constant_call(program, ip)?;
                    let args = self.pop_args(call.arity)?;
                    let value =
                        self.call_named(env, &call.name, args, op == Opcode::CallFast)?;
                    self.push(value);
                }
                Opcode::Method => {
                    let call = self.constant_call(program, ip)?;
                    let args = self.pop_args(call.arity)?;
                    let receiver = self.pop()?;
                    let value = self.call_named(&receiver, &call.name, args, false)?;
                    self.push(value);
                }
                Opcode::Array => {
                    let size = self.pop_int()? as usize;
                    let mut values = vec![Value::Nil; size];
                    for index in (0..size).rev() {
                        values[index] = self.pop_operand()?;
                    }
                    self.push(Value::array(values));
                    self.memory += size;
                    if self.memory >= self.memory_budget {
                        return Err("memory budget exceeded".to_string());
                    }
                }
                Opcode::Map => {
                    let size = self.pop_int()? as usize;
                    let mut pairs = Vec::with_capacity(size);
                    for _ in 0..size {
                        let value = self.pop_operand()?;
                        let key = self.pop_str()?;
                        pairs.push((key, value));
                    }
                    pairs.reverse();
                    let mut entries = IndexMap::with_capacity(size);
                    for (key, value) in pairs {
                        entries.insert(key.as_ref().clone(), value);
                    }
                    self.push(Value::map(entries));
                    self.memory += size;
                    if self.memory >= self.memory_budget {
                        return Err("memory budget exceeded".to_string());
                    }
                }
                Opcode::Len => {
                    let len = length(self.current()?)?;
                    self.push(Value::Int(len));
                }
                Opcode::Cast => {
                    let which = self.arg(program, ip)?;
                    let value = self.pop_operand()?;
                    match which {
                        0 => {
                            let value = to_int64(value)?;
                            self.push(Value::Int(value));
                        }
                        1 => {
                            let value = to_float64(value)?;
                            self.push(Value::Float(value));
                        }
                        other => return Err(format!("unknown cast {other}")),
                    }
                }
                Opcode::Store => {
                    let name = self.constant_str(program, ip)?;
                    let value = self.pop_operand()?;
                    self.scope_mut()?.insert(name.as_ref().clone(), value);
                }
                Opcode::Load => {
                    let name = self.constant_str(program, ip)?;
                    let value = self
                        .scope()?
                        .get(name.as_str())
                        .cloned()
                        .ok_or_else(|| format!("undefined scope variable {name}"))?;
                    self.push(value);
                }
                Opcode::Inc => {
                    let name = self.constant_str(program, ip)?;
                    match self.scope_mut()?.get_mut(name.as_str()) {
                        Some(Value::Int(value)) => *value = value.wrapping_add(1),
                        _ => return Err(format!("cannot increment scope variable {name}")),
                    }
                }
                Opcode::Begin => self.scopes.push(Scope::new()),
                Opcode::End => {
                    self.scopes.pop();
                }
            }
        }
        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, String> {
        self.stack.pop().ok_or_else(|| "stack underflow".to_string())
    }

    /// Pop for use as an operand: a value provider is transparently
    /// unwrapped (but never when the value is a chain base).
    fn pop_operand(&mut self) -> Result<Value, String> {
        let mut value = self.pop()?;
        loop {
            let Value::Object(object) = &value else {
                return Ok(value);
            };
            match object.get_value() {
                Some(inner) => value = inner,
                None => return Ok(value),
            }
        }
    }

    fn pop_bool(&mut self) -> Result<bool, String> {
        match self.pop_operand()? {
            Value::Bool(value) => Ok(value),
            other => Err(format!("expected bool on stack, got {}", other.type_name())),
        }
    }

    fn pop_int(&mut self) -> Result<i64, String> {
        match self.pop_operand()? {
            Value::Int(value) => Ok(value),
            other => Err(format!("expected int on stack, got {}", other.type_name())),
        }
    }

    fn pop_str(&mut self) -> Result<Rc<String>, String> {
        match self.pop_operand()? {
            Value::String(value) => Ok(value),
            other => Err(format!(
                "expected string on stack, got {}",
                other.type_name()
            )),
        }
    }

    fn pop_args(&mut self, arity: usize) -> Result<Vec<Value>, String> {
        let mut args = vec![Value::Nil; arity];
        for index in (0..arity).rev() {
            args[index] = self.pop_operand()?;
        }
        Ok(args)
    }

    fn current(&self) -> Result<&Value, String> {
        self.stack.last().ok_or_else(|| "stack underflow".to_string())
    }

    fn current_bool(&self) -> Result<bool, String> {
        match self.current()? {
            Value::Bool(value) => Ok(*value),
            other => Err(format!(
                "expected bool on stack, got {}",
                other.type_name()
            )),
        }
    }

    fn arg(&self, program: &Program, ip: &mut usize) -> Result<u16, String> {
        let bytes = program
            .bytecode
            .get(*ip..*ip + 2)
            .ok_or_else(|| "truncated bytecode".to_string())?;
        *ip += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn constant(&self, program: &Program, ip: &mut usize) -> Result<Value, String> {
        let index = self.arg(program, ip)? as usize;
        program
            .constants
            .get(index)
            .cloned()
            .ok_or_else(|| format!("invalid constant index {index}"))
    }

    fn constant_str(&self, program: &Program, ip: &mut usize) -> Result<Rc<String>, String> {
        match self.constant(program, ip)? {
            Value::String(value) => Ok(value),
            other => Err(format!("expected string constant, got {}", other.type_name())),
        }
    }

    fn constant_call(&self, program: &Program, ip: &mut usize) -> Result<Rc<Call>, String> {
        match self.constant(program, ip)? {
            Value::Call(call) => Ok(call),
            other => Err(format!("expected call constant, got {}", other.type_name())),
        }
    }

    fn scope(&self) -> Result<&Scope, String> {
        self.scopes.last().ok_or_else(|| "no scope".to_string())
    }

    fn scope_mut(&mut self) -> Result<&mut Scope, String> {
        self.scopes.last_mut().ok_or_else(|| "no scope".to_string())
    }

    /// Identifier resolution: the environment first (map entry, dynamic
    /// property, published field), then the builtin object and function
    /// tables.
    fn fetch_env(&mut self, env: &Value, name: &str) -> Result<Value, String> {
        match env {
            Value::Map(entries) => {
                if let Some(value) = entries.get(name) {
                    return Ok(value.clone());
                }
            }
            Value::Object(object) => {
                if let Some(value) = object.fetch_property(name) {
                    return Ok(value);
                }
                if let Some(value) = self.object_field(object.as_ref(), name) {
                    return Ok(value);
                }
            }
            _ => {}
        }
        if let Some(value) = self.builtin_objects.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.builtin_funcs.get(name) {
            return Ok(value.clone());
        }
        Err(format!("cannot fetch {name} from {}", env.type_name()))
    }

    /// Published-field lookup with the per-shape slot cache, traversing
    /// embedded records on a miss.
    fn object_field(&mut self, object: &dyn vex_syntax::Object, name: &str) -> Option<Value> {
        let shape = object.as_any().type_id();
        if let Some(slots) = self.field_cache.get(&shape) {
            if let Some(&index) = slots.get(name) {
                return Some(object.field(index));
            }
        }
        if let Some(index) = object.fields().iter().position(|field| *field == name) {
            self.field_cache
                .entry(shape)
                .or_default()
                .insert(name.to_string(), index);
            return Some(object.field(index));
        }
        for embedded in object.embedded() {
            if let Some(index) = object.fields().iter().position(|field| field == embedded) {
                if let Value::Object(inner) = object.field(index) {
                    if let Some(value) = self.object_field(inner.as_ref(), name) {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    /// Shared property/index resolution over sequences, strings, maps, and
    /// host objects.
    fn fetch_value(&mut self, holder: Value, key: Value) -> Result<Value, String> {
        match (&holder, &key) {
            (Value::Array(values), key) => {
                let index = as_index(key)?;
                values.get(index).cloned().ok_or_else(|| {
                    format!("index out of range: {index} (array length {})", values.len())
                })
            }
            (Value::String(value), Value::Int(_)) => {
                let index = as_index(&key)?;
                value
                    .chars()
                    .nth(index)
                    .map(|c| Value::string(c.to_string()))
                    .ok_or_else(|| {
                        format!(
                            "index out of range: {index} (string length {})",
                            value.chars().count()
                        )
                    })
            }
            (Value::Map(entries), Value::String(name)) => entries
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| format!("cannot fetch {name} from map")),
            (Value::Object(object), Value::String(name)) => {
                if let Some(value) = object.fetch_property(name) {
                    return Ok(value);
                }
                if let Some(value) = self.object_field(object.as_ref(), name) {
                    return Ok(value);
                }
                Err(format!("cannot fetch {name} from {}", object.type_name()))
            }
            (holder, key) => Err(format!("cannot fetch {key} from {}", holder.type_name())),
        }
    }

    /// Call dispatch: methods on the holder first, then function-valued
    /// members, then the builtin function table. `fast` skips argument
    /// coercion for declared generic-variadic callables.
    fn call_named(
        &mut self,
        holder: &Value,
        name: &str,
        args: Vec<Value>,
        fast: bool,
    ) -> Result<Value, String> {
        if let Value::Object(object) = holder {
            match catch_unwind(AssertUnwindSafe(|| object.call_method(name, &args))) {
                Ok(Some(result)) => return result,
                Ok(None) => {}
                Err(panic) => return Err(panic_message(panic)),
            }
        }
        let member = match holder {
            Value::Map(entries) => entries.get(name).cloned(),
            Value::Object(object) => self.object_field(object.as_ref(), name),
            _ => None,
        };
        let def = match member {
            Some(Value::Func(def)) => def,
            Some(other) => {
                return Err(format!(
                    "{name} is not a function (got {})",
                    other.type_name()
                ))
            }
            None => match self.builtin_funcs.get(name) {
                Some(Value::Func(def)) => def.clone(),
                _ => {
                    return Err(format!(
                        "cannot fetch {name} from {}",
                        holder.type_name()
                    ))
                }
            },
        };
        if fast {
            invoke(&def, &args)
        } else {
            call_func_def(&def, args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use vex_parser::parse;

    fn run_src(source: &str, env: &Value, optimized: bool) -> Result<Value, Error> {
        let mut node = parse(source)?;
        if optimized {
            optimize(&mut node, None)?;
        }
        let program = compile(&node, Source::new(source), None)?;
        Vm::new().run(&program, env)
    }

    fn eval(source: &str, env: &Value) -> Result<Value, Error> {
        run_src(source, env, true)
    }

    fn func_fixed(
        params: Vec<Kind>,
        f: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) -> Value {
        Value::func(FuncDef::fixed(params, f))
    }

    fn test_env() -> Value {
        let mut entries = IndexMap::new();
        entries.insert(
            "array".to_string(),
            Value::array((1..=5).map(Value::Int).collect()),
        );
        entries.insert("string".to_string(), Value::string("string"));
        entries.insert("max".to_string(), Value::Int(50));
        entries.insert(
            "sum".to_string(),
            func_fixed(vec![Kind::Any], |args| {
                let Some(Value::Array(values)) = args.first() else {
                    return Err("sum takes an array".to_string());
                };
                let mut total = 0i64;
                for value in values.iter() {
                    match value {
                        Value::Int(value) => total += value,
                        other => return Err(format!("sum of {}", other.type_name())),
                    }
                }
                Ok(Value::Int(total))
            }),
        );
        entries.insert(
            "inc".to_string(),
            func_fixed(vec![Kind::Int], |args| match args[0] {
                Value::Int(value) => Ok(Value::Int(value + 1)),
                _ => Err("inc takes an int".to_string()),
            }),
        );
        Value::map(entries)
    }

    #[test]
    fn compiles_short_circuit_jumps() {
        let node = parse("true && true || true").unwrap();
        let program = compile(&node, Source::new("true && true || true"), None).unwrap();
        assert_eq!(
            program.bytecode,
            vec![
                Opcode::True as u8,
                Opcode::JumpIfFalse as u8,
                2,
                0,
                Opcode::Pop as u8,
                Opcode::True as u8,
                Opcode::JumpIfTrue as u8,
                2,
                0,
                Opcode::Pop as u8,
                Opcode::True as u8,
            ]
        );
    }

    #[test]
    fn compiles_literals_to_the_pool() {
        let node = parse("65535").unwrap();
        let program = compile(&node, Source::new("65535"), None).unwrap();
        assert_eq!(program.bytecode, vec![Opcode::Push as u8, 0, 0]);
        assert_eq!(program.constants, vec![Value::Int(65535)]);

        let node = parse(".5").unwrap();
        let program = compile(&node, Source::new(".5"), None).unwrap();
        assert_eq!(program.bytecode, vec![Opcode::Push as u8, 0, 0]);
        assert_eq!(program.constants, vec![Value::Float(0.5)]);
    }

    #[test]
    fn compiles_identifiers_to_fetch() {
        let node = parse("Name").unwrap();
        let program = compile(&node, Source::new("Name"), None).unwrap();
        assert_eq!(program.bytecode, vec![Opcode::Fetch as u8, 0, 0]);
        assert_eq!(program.constants, vec![Value::string("Name")]);
    }

    #[test]
    fn constant_pool_deduplicates() {
        let node = parse(r#""string" == "string""#).unwrap();
        let program = compile(&node, Source::new(r#""string" == "string""#), None).unwrap();
        assert_eq!(
            program.bytecode,
            vec![
                Opcode::Push as u8,
                0,
                0,
                Opcode::Push as u8,
                0,
                0,
                Opcode::Equal as u8,
            ]
        );
        assert_eq!(program.constants.len(), 1);
    }

    #[test]
    fn compiles_unary_negate_without_optimizer() {
        let node = parse("-1").unwrap();
        let program = compile(&node, Source::new("-1"), None).unwrap();
        assert_eq!(
            program.bytecode,
            vec![Opcode::Push as u8, 0, 0, Opcode::Negate as u8]
        );
        assert_eq!(program.constants, vec![Value::Int(1)]);
    }

    #[test]
    fn compiles_cast_for_expected_float() {
        let mut config = Config::new();
        config.expect = Some(Expect::Float64);
        let node = parse("1").unwrap();
        let program = compile(&node, Source::new("1"), Some(&config)).unwrap();
        assert_eq!(
            program.bytecode,
            vec![Opcode::Push as u8, 0, 0, Opcode::Cast as u8, 1, 0]
        );
    }

    #[test]
    fn constant_pool_overflow_fails() {
        let mut compiler = Compiler {
            config: None,
            constants: Vec::new(),
            bytecode: Vec::new(),
            spans: Vec::new(),
            chains: Vec::new(),
        };
        for i in 0..=u16::MAX as i64 {
            compiler.constants.push(Value::Int(i));
        }
        let err = compiler
            .add_constant(Value::string("overflow"), Span::default())
            .unwrap_err();
        assert_eq!(err.message, "constant pool overflow");
    }

    #[test]
    fn optimizer_folds_constants() {
        let mut node = parse("[1, 2, 3][5*5-25]").unwrap();
        optimize(&mut node, None).unwrap();
        assert_eq!(node.dump(), "Constant([1, 2, 3])[0]");
    }

    #[test]
    fn optimizer_rewrites_in_array_to_set() {
        let mut node = parse("v in [1, 2, 3]").unwrap();
        optimize(&mut node, None).unwrap();
        assert_eq!(node.dump(), "(v in Constant({1, 2, 3}))");
    }

    #[test]
    fn optimizer_rewrites_in_range_to_comparisons() {
        let mut node = parse("age in 18..31").unwrap();
        optimize(&mut node, None).unwrap();
        assert_eq!(node.dump(), "((age >= 18) and (age <= 31))");
    }

    #[test]
    fn optimizer_materializes_constant_ranges() {
        let mut node = parse("-1..1").unwrap();
        optimize(&mut node, None).unwrap();
        assert_eq!(node.dump(), "Constant([-1, 0, 1])");
    }

    #[test]
    fn optimizer_keeps_oversized_ranges() {
        let mut node = parse("0..2000000").unwrap();
        optimize(&mut node, None).unwrap();
        assert_eq!(node.dump(), "(0 .. 2000000)");
    }

    #[test]
    fn optimizer_evaluates_const_expr_calls() {
        let calls = Rc::new(Cell::new(0));
        let recorded = calls.clone();
        let mut entries = IndexMap::new();
        entries.insert(
            "double".to_string(),
            func_fixed(vec![Kind::Int], move |args| {
                recorded.set(recorded.get() + 1);
                match args[0] {
                    Value::Int(value) => Ok(Value::Int(value * 2)),
                    _ => Err("double takes an int".to_string()),
                }
            }),
        );
        entries.insert("dyn".to_string(), Value::Int(0));
        let env = Value::map(entries);
        let mut config = Config::from_env(&env);
        config.const_expr("double");

        let mut node = parse("[double(2+3), double(dyn)]").unwrap();
        optimize(&mut node, Some(&config)).unwrap();
        assert_eq!(node.dump(), "[10, double(dyn)]");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn const_expr_failure_is_a_compile_error() {
        let mut entries = IndexMap::new();
        entries.insert(
            "boom".to_string(),
            func_fixed(vec![], |_| Err("boom failed".to_string())),
        );
        let env = Value::map(entries);
        let mut config = Config::from_env(&env);
        config.const_expr("boom");

        let mut node = parse("boom()").unwrap();
        let err = optimize(&mut node, Some(&config)).unwrap_err();
        assert_eq!(err.message, "boom failed");
        assert_eq!(err.span, node.span);
    }

    #[test]
    fn evaluates_expression_table() {
        let env = test_env();
        let cases: Vec<(&str, Value)> = vec![
            ("1", Value::Int(1)),
            ("-.5", Value::Float(-0.5)),
            ("true && false || false", Value::Bool(false)),
            (r#""a" != "b""#, Value::Bool(true)),
            ("8 % 3", Value::Int(2)),
            ("2 ** 8", Value::Float(256.0)),
            ("-(2-5)**3-2/(+4-3)+-2", Value::Float(23.0)),
            (r#""hello" + " " + "world""#, Value::string("hello world")),
            ("0 in -1..1 and 1 in 1..1", Value::Bool(true)),
            ("1 in [1, 2, 3]", Value::Bool(true)),
            (r#""foo" in {foo: 0, bar: 1}"#, Value::Bool(true)),
            (r#""str" matches "s.+""#, Value::Bool(true)),
            (r#""foobar" contains "bar""#, Value::Bool(true)),
            (r#""foobar" startsWith "foo""#, Value::Bool(true)),
            (r#""foobar" endsWith "bar""#, Value::Bool(true)),
            ("(0..10)[5]", Value::Int(5)),
            ("len([1, 2, 3])", Value::Int(3)),
            (r#"len("hello, world")"#, Value::Int(12)),
            ("len({a: 1, b: 2, c: 2})", Value::Int(3)),
            ("(true ? 0+1 : 2+3) + (false ? -1 : -2)", Value::Int(-1)),
            (
                "filter(1..9, {# > 7})",
                Value::array(vec![Value::Int(8), Value::Int(9)]),
            ),
            (
                "map(1..3, {# * #})",
                Value::array(vec![Value::Int(1), Value::Int(4), Value::Int(9)]),
            ),
            ("all(1..3, {# > 0})", Value::Bool(true)),
            ("none(1..3, {# == 0})", Value::Bool(true)),
            ("any([1, 1, 0, 1], {# == 0})", Value::Bool(true)),
            (
                "one([1, 1, 0, 1], {# == 0}) and not one([1, 0, 0, 1], {# == 0})",
                Value::Bool(true),
            ),
            ("count(1..30, {# % 3 == 0})", Value::Int(10)),
            (r#""a" < "b""#, Value::Bool(true)),
            ("array[0] + array[1]", Value::Int(3)),
            ("array[1:2]", Value::array(vec![Value::Int(2)])),
            ("array[0:5] == array", Value::Bool(true)),
            ("array[:] == array", Value::Bool(true)),
            ("string[:3]", Value::string("str")),
            ("string[3:9]", Value::string("ing")),
            ("string[7:9]", Value::string("")),
            ("nil == nil", Value::Bool(true)),
            (
                r#"0 == nil || "str" == nil || true == nil"#,
                Value::Bool(false),
            ),
            ("1 == 1.0", Value::Bool(true)),
            (
                "9223372036854775807 + 1",
                Value::Int(i64::MIN),
            ),
            ("1.0 / 0 > 100", Value::Bool(true)),
            ("sum(array)", Value::Int(15)),
            ("inc(array[0] + array[1])", Value::Int(4)),
        ];
        for (source, want) in cases {
            let optimized = run_src(source, &env, true).expect(source);
            assert_eq!(optimized, want, "optimized: {source}");
            let raw = run_src(source, &env, false).expect(source);
            assert_eq!(raw, want, "unoptimized: {source}");
        }
    }

    #[test]
    fn empty_sequence_boundaries() {
        let env = Value::map(IndexMap::new());
        assert_eq!(eval("len([])", &env).unwrap(), Value::Int(0));
        assert_eq!(eval("all([], {# > 0})", &env).unwrap(), Value::Bool(true));
        assert_eq!(eval("any([], {# > 0})", &env).unwrap(), Value::Bool(false));
        assert_eq!(eval("one([], {# > 0})", &env).unwrap(), Value::Bool(false));
        assert_eq!(
            eval("filter([], {# > 0})", &env).unwrap(),
            Value::array(Vec::new())
        );
        assert_eq!(
            eval("map([], {# + 1})", &env).unwrap(),
            Value::array(Vec::new())
        );
    }

    #[test]
    fn runtime_error_reports_operator_location() {
        let err = eval("map(1..3, {1 / (# - 3)})", &Value::Nil).unwrap_err();
        assert_eq!(err.message, "integer divide by zero");
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 14);
        let rendered = format!(
            "integer divide by zero (1:14)\n | map(1..3, {{1 / (# - 3)}})\n | {}^",
            ".".repeat(14)
        );
        assert_eq!(err.to_string(), rendered);
    }

    #[test]
    fn short_circuit_skips_the_right_operand() {
        let calls = Rc::new(Cell::new(0));
        let recorded = calls.clone();
        let mut entries = IndexMap::new();
        entries.insert(
            "boom".to_string(),
            func_fixed(vec![], move |_| {
                recorded.set(recorded.get() + 1);
                Ok(Value::Bool(true))
            }),
        );
        let env = Value::map(entries);

        assert_eq!(eval("false && boom()", &env).unwrap(), Value::Bool(false));
        assert_eq!(calls.get(), 0);
        assert_eq!(eval("true || boom()", &env).unwrap(), Value::Bool(true));
        assert_eq!(calls.get(), 0);
        assert_eq!(eval("true && boom()", &env).unwrap(), Value::Bool(true));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn memory_budget_bounds_ranges_and_arrays() {
        let err = eval("1..1000000", &Value::Nil).unwrap_err();
        assert_eq!(err.message, "memory budget exceeded");

        let mut vm = Vm::new();
        vm.set_memory_budget(10);
        let node = parse("1..100").unwrap();
        let program = compile(&node, Source::new("1..100"), None).unwrap();
        let err = vm.run(&program, &Value::Nil).unwrap_err();
        assert_eq!(err.message, "memory budget exceeded");
    }

    #[test]
    fn surplus_arguments_truncate_for_fixed_arity() {
        let mut entries = IndexMap::new();
        entries.insert(
            "add".to_string(),
            func_fixed(vec![Kind::Int, Kind::Int], |args| {
                match (&args[0], &args[1]) {
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
                    _ => Err("add takes ints".to_string()),
                }
            }),
        );
        entries.insert(
            "vsum".to_string(),
            Value::func(FuncDef::variadic(Vec::new(), Kind::Int, |args| {
                let mut total = 0i64;
                for value in args {
                    match value {
                        Value::Int(value) => total += value,
                        _ => return Err("vsum takes ints".to_string()),
                    }
                }
                Ok(Value::Int(total))
            })),
        );
        entries.insert(
            "half".to_string(),
            func_fixed(vec![Kind::Float], |args| match args[0] {
                Value::Float(value) => Ok(Value::Float(value / 2.0)),
                _ => Err("half takes a float".to_string()),
            }),
        );
        let env = Value::map(entries);

        assert_eq!(eval("add(10, 5, 999)", &env).unwrap(), Value::Int(15));
        assert_eq!(eval("vsum(1, 2, 3, 4, 5, 6)", &env).unwrap(), Value::Int(21));
        assert_eq!(eval("half(3)", &env).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn generic_variadic_callables_compile_to_call_fast() {
        let mut entries = IndexMap::new();
        entries.insert(
            "concat".to_string(),
            Value::func(FuncDef::variadic(Vec::new(), Kind::Any, |args| {
                let mut out = String::new();
                for value in args {
                    out.push_str(&value.to_string());
                }
                Ok(Value::string(out))
            })),
        );
        let env = Value::map(entries);
        let config = Config::from_env(&env);

        let node = parse(r#"concat("a", 1, [])"#).unwrap();
        let program = compile(&node, Source::new(r#"concat("a", 1, [])"#), Some(&config)).unwrap();
        assert!(program.bytecode.contains(&(Opcode::CallFast as u8)));
        assert_eq!(
            Vm::new().run(&program, &env).unwrap(),
            Value::string("a1[]")
        );
    }

    #[test]
    fn host_panics_become_runtime_errors() {
        let mut entries = IndexMap::new();
        entries.insert(
            "explode".to_string(),
            func_fixed(vec![], |_| panic!("kaboom")),
        );
        let env = Value::map(entries);
        let err = eval("explode()", &env).unwrap_err();
        assert_eq!(err.message, "kaboom");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn builtin_functions_and_objects() {
        let env = Value::Nil;
        let cases: Vec<(&str, Value)> = vec![
            (r#"parseInt("10", 16)"#, Value::Int(16)),
            (r#"parseInt("10")"#, Value::Int(10)),
            (r#"parseInt("10", 16, 1, 1, "2", "3")"#, Value::Int(16)),
            (r#"parseInt("  -42abc")"#, Value::Int(-42)),
            (r#"parseFloat(".5")"#, Value::Float(0.5)),
            (r#"parseFloat(" 12.12.12 hey", 1, 3, 5)"#, Value::Float(12.12)),
            (r#"parseFloat(12.1, "ignored")"#, Value::Float(12.1)),
            ("Math.pow(2, 3, 4, 5)", Value::Float(8.0)),
            ("Math.trunc(11.22)", Value::Float(11.0)),
            ("Math.ceil(3.2)", Value::Float(4.0)),
            (
                r#"Math.ceil("0.95", "surplus", "ignored", 3)"#,
                Value::Float(1.0),
            ),
            ("Math.abs(4.5) + Math.abs(-.5)", Value::Float(5.0)),
            ("Math.cbrt(-64)", Value::Float(-4.0)),
            ("Math.atanh(1)", Value::Float(f64::INFINITY)),
            ("Math.max(0, 1, 2, 7, 6)", Value::Float(7.0)),
            ("Math.min(3, 1, 2)", Value::Float(1.0)),
            ("Math.hypot(3, 4)", Value::Float(5.0)),
            ("Math.PI > 3 && Math.E < 3", Value::Bool(true)),
            ("Date.now() > 0", Value::Bool(true)),
            ("Math.random() >= 0 && Math.random() < 1", Value::Bool(true)),
        ];
        for (source, want) in cases {
            assert_eq!(eval(source, &env).expect(source), want, "{source}");
        }

        assert!(eval(r#"parseInt("zzz")"#, &env).is_err());
    }

    #[test]
    fn environment_shadows_builtin_objects() {
        let mut date = IndexMap::new();
        date.insert(
            "now".to_string(),
            func_fixed(vec![], |_| Ok(Value::string("test"))),
        );
        let mut entries = IndexMap::new();
        entries.insert("Date".to_string(), Value::map(date));
        let env = Value::map(entries);
        assert_eq!(
            eval(r#"Date.now() == "test""#, &env).unwrap(),
            Value::Bool(true)
        );
    }

    struct Apple;
    impl vex_syntax::Object for Apple {
        fn type_name(&self) -> &'static str {
            "apple"
        }
        fn get_value(&self) -> Option<Value> {
            Some(Value::Int(11))
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Item;
    impl vex_syntax::Object for Item {
        fn type_name(&self) -> &'static str {
            "item"
        }
        fn fetch_property(&self, _name: &str) -> Option<Value> {
            Some(Value::object(Apple))
        }
        fn get_value(&self) -> Option<Value> {
            Some(Value::string("bypassed for chain bases"))
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Tracking;
    impl vex_syntax::Object for Tracking {
        fn type_name(&self) -> &'static str {
            "tracking"
        }
        fn fetch_property(&self, _name: &str) -> Option<Value> {
            Some(Value::object(Item))
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Opaque;
    impl vex_syntax::Object for Opaque {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn property_providers_chain_and_value_providers_unwrap() {
        let mut entries = IndexMap::new();
        entries.insert("tracking".to_string(), Value::object(Tracking));
        entries.insert("plain".to_string(), Value::object(Opaque));
        let env = Value::map(entries);

        // apple unwraps to 11 at the comparison, not along the chain.
        assert_eq!(
            eval("tracking.item.apple < 10", &env).unwrap(),
            Value::Bool(false)
        );
        let err = eval("plain.level < 10", &env).unwrap_err();
        assert!(err.message.contains("cannot fetch level"));
    }

    struct Ticket {
        price: i64,
    }
    impl vex_syntax::Object for Ticket {
        fn type_name(&self) -> &'static str {
            "ticket"
        }
        fn fields(&self) -> &'static [&'static str] {
            &["price"]
        }
        fn field(&self, index: usize) -> Value {
            match index {
                0 => Value::Int(self.price),
                _ => Value::Nil,
            }
        }
        fn call_method(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
            match name {
                "string" => Some(Ok(Value::string(format!("${}", self.price)))),
                "priceDiv" => Some(match args.first() {
                    Some(Value::Int(by)) if *by != 0 => Ok(Value::Int(self.price / by)),
                    _ => Err("priceDiv takes a non-zero int".to_string()),
                }),
                _ => None,
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn object_fields_methods_and_membership() {
        let mut entries = IndexMap::new();
        entries.insert("ticket".to_string(), Value::object(Ticket { price: 100 }));
        let env = Value::map(entries);

        assert_eq!(eval("ticket.price", &env).unwrap(), Value::Int(100));
        assert_eq!(
            eval("ticket.string()", &env).unwrap(),
            Value::string("$100")
        );
        assert_eq!(eval("ticket.priceDiv(25)", &env).unwrap(), Value::Int(4));
        assert_eq!(
            eval(r#""price" in ticket && !("weight" in ticket)"#, &env).unwrap(),
            Value::Bool(true)
        );
    }

    struct Meta;
    impl vex_syntax::Object for Meta {
        fn type_name(&self) -> &'static str {
            "meta"
        }
        fn fields(&self) -> &'static [&'static str] {
            &["tags"]
        }
        fn field(&self, index: usize) -> Value {
            match index {
                0 => {
                    let mut tags = IndexMap::new();
                    tags.insert("foo".to_string(), Value::string("bar"));
                    Value::map(tags)
                }
                _ => Value::Nil,
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Segment {
        origin: &'static str,
    }
    impl vex_syntax::Object for Segment {
        fn type_name(&self) -> &'static str {
            "segment"
        }
        fn fields(&self) -> &'static [&'static str] {
            &["origin"]
        }
        fn field(&self, index: usize) -> Value {
            match index {
                0 => Value::string(self.origin),
                _ => Value::Nil,
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Passengers {
        adults: i64,
    }
    impl vex_syntax::Object for Passengers {
        fn type_name(&self) -> &'static str {
            "passengers"
        }
        fn fields(&self) -> &'static [&'static str] {
            &["adults"]
        }
        fn field(&self, index: usize) -> Value {
            match index {
                0 => Value::Int(self.adults),
                _ => Value::Nil,
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct FlightEnv;
    impl vex_syntax::Object for FlightEnv {
        fn type_name(&self) -> &'static str {
            "env"
        }
        fn fields(&self) -> &'static [&'static str] {
            &["meta", "segments", "passengers"]
        }
        fn embedded(&self) -> &'static [&'static str] {
            &["meta"]
        }
        fn field(&self, index: usize) -> Value {
            match index {
                0 => Value::object(Meta),
                1 => Value::array(vec![
                    Value::object(Segment { origin: "MOW" }),
                    Value::object(Segment { origin: "MOW" }),
                ]),
                2 => Value::object(Passengers { adults: 2 }),
                _ => Value::Nil,
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn struct_environment_with_promoted_fields_and_cache_reuse() {
        let env = Value::object(FlightEnv);
        let source = r#"all(segments, {.origin == "MOW"}) && passengers.adults > 0 && tags["foo"] startsWith "bar""#;
        let mut node = parse(source).unwrap();
        optimize(&mut node, None).unwrap();
        let program = compile(&node, Source::new(source), None).unwrap();

        let mut vm = Vm::new();
        assert_eq!(vm.run(&program, &env).unwrap(), Value::Bool(true));
        assert!(!vm.field_cache.is_empty());
        // Second run against the same shape reuses the cached slots.
        assert_eq!(vm.run(&program, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn optional_chains_propagate_nil() {
        let mut inner = IndexMap::new();
        inner.insert("b".to_string(), Value::Int(1));
        let mut entries = IndexMap::new();
        entries.insert("a".to_string(), Value::map(inner));
        entries.insert("missing".to_string(), Value::Nil);
        let env = Value::map(entries);

        assert_eq!(eval("a?.b", &env).unwrap(), Value::Int(1));
        assert_eq!(eval("missing?.b", &env).unwrap(), Value::Nil);
        assert_eq!(eval("missing?.b.c", &env).unwrap(), Value::Nil);
    }

    #[test]
    fn programs_round_trip_through_bytes() {
        let env = test_env();
        let source = "filter(1..100, {# > max})";
        let mut node = parse(source).unwrap();
        optimize(&mut node, None).unwrap();
        let program = compile(&node, Source::new(source), None).unwrap();

        let bytes = program.to_bytes().unwrap();
        let restored = Program::from_bytes(&bytes).unwrap();
        let before = Vm::new().run(&program, &env).unwrap();
        let after = Vm::new().run(&restored, &env).unwrap();
        assert_eq!(before, after);
        match &after {
            Value::Array(values) => {
                assert_eq!(values.len(), 50);
                assert_eq!(values[0], Value::Int(51));
                assert_eq!(values[49], Value::Int(100));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn regex_constants_round_trip() {
        let mut entries = IndexMap::new();
        entries.insert("name".to_string(), Value::string("abc"));
        let env = Value::map(entries);
        let source = r#"name matches "^a""#;
        let mut node = parse(source).unwrap();
        optimize(&mut node, None).unwrap();
        let program = compile(&node, Source::new(source), None).unwrap();

        let restored = Program::from_bytes(&program.to_bytes().unwrap()).unwrap();
        assert_eq!(Vm::new().run(&restored, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn function_constants_do_not_serialize() {
        let program = Program {
            source: Source::new("f()"),
            constants: vec![Value::func(FuncDef::fixed(vec![], |_| Ok(Value::Nil)))],
            bytecode: Vec::new(),
            spans: Vec::new(),
        };
        assert!(program.to_bytes().is_err());
    }

    struct Recorder(Rc<RefCell<Vec<(usize, Opcode)>>>);
    impl StepHook for Recorder {
        fn before_op(&mut self, ip: usize, op: Opcode) {
            self.0.borrow_mut().push((ip, op));
        }
    }

    #[test]
    fn step_hook_sees_every_instruction() {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let node = parse("1 + 2").unwrap();
        let program = compile(&node, Source::new("1 + 2"), None).unwrap();

        let mut vm = Vm::new();
        vm.set_step_hook(Box::new(Recorder(steps.clone())));
        assert_eq!(vm.run(&program, &Value::Nil).unwrap(), Value::Int(3));
        let steps = steps.borrow();
        assert_eq!(
            steps
                .iter()
                .map(|(_, op)| *op)
                .collect::<Vec<_>>(),
            vec![Opcode::Push, Opcode::Push, Opcode::Add]
        );
    }
}
