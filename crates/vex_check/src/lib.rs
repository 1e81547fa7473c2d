use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use vex_syntax::{
    BinaryOp, Error, FuncType, Kind, Node, NodeKind, RecordType, Span, Type, UnaryOp, Value,
};

/// Global names resolved from the builtin tables when the environment does
/// not shadow them.
pub const BUILTIN_GLOBALS: &[&str] = &["Math", "Date", "parseInt", "parseFloat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Bool,
    Int64,
    Float64,
}

/// Compile-time configuration: the type environment, operator overloads,
/// const-expr registrations, and the expected result type.
#[derive(Default)]
pub struct Config {
    /// Structural shape of the environment; `None` means fully dynamic.
    pub shape: Option<Rc<RecordType>>,
    /// The environment is a plain map of values, so identifier fetches can
    /// index it directly.
    pub map_env: bool,
    pub allow_undefined: bool,
    /// Operator symbol to ordered overload candidates; the first candidate
    /// whose signature matches the operand types wins.
    pub operators: IndexMap<String, Vec<String>>,
    pub const_fns: HashSet<String>,
    pub expect: Option<Expect>,
    /// Sample environment retained for const-expr evaluation.
    pub env: Option<Value>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Derive the type environment from a sample environment value, the way
    /// hosts usually configure type checking.
    pub fn from_env(env: &Value) -> Self {
        let mut config = Config::new();
        config.env = Some(env.clone());
        match env {
            Value::Map(entries) => {
                let mut record = RecordType::new("env");
                for (name, value) in entries.iter() {
                    record = record.field(name.clone(), type_of_value(value));
                }
                config.shape = Some(Rc::new(record));
                config.map_env = true;
            }
            Value::Object(object) => {
                if let Type::Record(record) = object_shape(object.as_ref()) {
                    config.shape = Some(record);
                }
            }
            _ => {}
        }
        config
    }

    pub fn from_record(record: Rc<RecordType>) -> Self {
        Config {
            shape: Some(record),
            ..Config::new()
        }
    }

    pub fn operator(&mut self, symbol: &str, candidates: &[&str]) {
        self.operators
            .entry(symbol.to_string())
            .or_default()
            .extend(candidates.iter().map(|name| name.to_string()));
    }

    pub fn const_expr(&mut self, name: &str) {
        self.const_fns.insert(name.to_string());
    }
}

/// The static type of a runtime value, used when deriving environment
/// shapes from samples.
pub fn type_of_value(value: &Value) -> Type {
    match value {
        Value::Nil => Type::Any,
        Value::Bool(_) => Type::Bool,
        Value::Int(_) => Type::Int,
        Value::Float(_) => Type::Float,
        Value::String(_) => Type::String,
        Value::Array(values) => Type::Array(Box::new(unify(values.iter().map(type_of_value)))),
        Value::Map(entries) => Type::Map(Box::new(unify(
            entries.values().map(type_of_value),
        ))),
        Value::IntSet(_) => Type::Array(Box::new(Type::Int)),
        Value::Regex(_) => Type::String,
        Value::Call(_) => Type::Any,
        Value::Func(def) => Type::Func(Rc::new(FuncType {
            params: def.params.iter().map(|kind| kind_type(*kind)).collect(),
            variadic: def.variadic.map(kind_type),
            ret: kind_type(def.ret),
        })),
        Value::Object(object) => object_shape(object.as_ref()),
    }
}

fn object_shape(object: &dyn vex_syntax::Object) -> Type {
    let names = object.fields();
    // An object publishing no fields resolves everything dynamically
    // (property providers).
    if names.is_empty() {
        return Type::Any;
    }
    let mut record = RecordType::new("env");
    for (index, name) in names.iter().enumerate() {
        let value = object.field(index);
        let ty = type_of_value(&value);
        if object.embedded().contains(name) {
            if let Type::Record(inner) = &ty {
                record = record.embed(name.to_string(), inner.clone());
                continue;
            }
        }
        record = record.field(name.to_string(), ty);
    }
    Type::Record(Rc::new(record))
}

pub fn kind_type(kind: Kind) -> Type {
    match kind {
        Kind::Any => Type::Any,
        Kind::Bool => Type::Bool,
        Kind::Int => Type::Int,
        Kind::Float => Type::Float,
        Kind::String => Type::String,
    }
}

fn unify(types: impl Iterator<Item = Type>) -> Type {
    let mut unified: Option<Type> = None;
    for ty in types {
        unified = match unified {
            None => Some(ty),
            Some(prev) if prev == ty => Some(prev),
            Some(_) => return Type::Any,
        };
    }
    unified.unwrap_or(Type::Any)
}

/// Walk the tree bottom-up, annotate every node with its resolved type,
/// rewrite overloaded operators into named calls, and enforce the expected
/// result type. The first error wins.
pub fn check(node: &mut Node, config: &Config) -> Result<Type, Error> {
    validate_const_fns(config)?;
    let mut checker = Checker {
        config,
        pointers: Vec::new(),
    };
    let ty = checker.check(node)?;
    match config.expect {
        Some(Expect::Bool) if !matches!(ty, Type::Bool | Type::Any) => Err(Error::new(
            format!("expected bool, but got {ty}"),
            node.span,
        )),
        Some(Expect::Int64) | Some(Expect::Float64) if !ty.is_numeric() => {
            let wanted = if config.expect == Some(Expect::Int64) {
                "int64"
            } else {
                "float64"
            };
            Err(Error::new(
                format!("expected {wanted}, but got {ty}"),
                node.span,
            ))
        }
        _ => Ok(ty),
    }
}

fn validate_const_fns(config: &Config) -> Result<(), Error> {
    if config.const_fns.is_empty() {
        return Ok(());
    }
    let Some(env) = &config.env else {
        return Err(Error::new(
            "const-expr requires an environment",
            Span::default(),
        ));
    };
    for name in &config.const_fns {
        let target = match env {
            Value::Map(entries) => entries.get(name).cloned(),
            Value::Object(object) => {
                let names = object.fields();
                names
                    .iter()
                    .position(|field| *field == name.as_str())
                    .map(|index| object.field(index))
            }
            _ => None,
        };
        match target {
            Some(Value::Func(_)) => {}
            _ => {
                return Err(Error::new(
                    format!("const-expr `{name}` does not name a function"),
                    Span::default(),
                ))
            }
        }
    }
    Ok(())
}

struct Checker<'a> {
    config: &'a Config,
    /// Element types of the enclosing comprehension closures, innermost
    /// last.
    pointers: Vec<Type>,
}

impl<'a> Checker<'a> {
    fn check(&mut self, node: &mut Node) -> Result<Type, Error> {
        let span = node.span;
        let ty = match &mut node.kind {
            NodeKind::Nil => Type::Nil,
            NodeKind::Bool(_) => Type::Bool,
            NodeKind::Int(_) => Type::Int,
            NodeKind::Float(_) => Type::Float,
            NodeKind::Str(_) => Type::String,
            NodeKind::Constant(value) => type_of_value(value),
            NodeKind::Identifier(name) => self.identifier(name, span)?,
            NodeKind::Pointer => self.pointers.last().cloned().unwrap_or(Type::Any),
            NodeKind::Unary { op, node: child } => {
                let op = *op;
                let child_ty = self.check(child)?;
                self.unary(op, child_ty, span)?
            }
            NodeKind::Binary { .. } => return self.binary(node),
            NodeKind::Matches { left, right, .. } => {
                let left_ty = self.check(left)?;
                let right_ty = self.check(right)?;
                if !is_string(&left_ty) || !is_string(&right_ty) {
                    return Err(Error::new(
                        format!("invalid operation: matches (mismatched types {left_ty} and {right_ty})"),
                        span,
                    ));
                }
                Type::Bool
            }
            NodeKind::Chain { node: child } => self.check(child)?,
            NodeKind::Property {
                node: child,
                property,
                ..
            } => {
                let property = property.clone();
                let base = self.check(child)?;
                self.property(&base, &property, span)?
            }
            NodeKind::Index { node: child, index } => {
                let base = self.check(child)?;
                let index_ty = self.check(index)?;
                self.index(&base, &index_ty, span)?
            }
            NodeKind::Slice {
                node: child,
                from,
                to,
            } => {
                let base = self.check(child)?;
                for bound in [from, to].into_iter().flatten() {
                    let bound_ty = self.check(bound)?;
                    if !matches!(bound_ty, Type::Int | Type::Any) {
                        return Err(Error::new(
                            format!("non-integer slice bound ({bound_ty})"),
                            bound.span,
                        ));
                    }
                }
                match base {
                    Type::Array(_) | Type::String | Type::Any => base,
                    other => {
                        return Err(Error::new(
                            format!("cannot slice {other}"),
                            span,
                        ))
                    }
                }
            }
            NodeKind::Method {
                node: child,
                method,
                args,
            } => {
                let method = method.clone();
                let base = self.check(child)?;
                let callee = match &base {
                    Type::Any => Type::Any,
                    Type::Record(record) => {
                        resolve_field(record, &method).map_err(|_| ambiguous(&method, span))?
                            .ok_or_else(|| {
                                Error::new(
                                    format!("type {base} has no method {method}"),
                                    span,
                                )
                            })?
                    }
                    Type::Map(value) => value.as_ref().clone(),
                    other => {
                        return Err(Error::new(
                            format!("type {other} has no method {method}"),
                            span,
                        ))
                    }
                };
                self.call_signature(&callee, args, &method, span)?
            }
            NodeKind::Call { name, args } => {
                let name = name.clone();
                let callee = self.identifier(&name, span)?;
                self.call_signature(&callee, args, &name, span)?
            }
            NodeKind::Builtin { name, .. } => {
                let name = name.clone();
                return self.builtin(node, &name, span);
            }
            NodeKind::Closure { node: child } => self.check(child)?,
            NodeKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let cond_ty = self.check(cond)?;
                if !matches!(cond_ty, Type::Bool | Type::Any) {
                    return Err(Error::new(
                        format!("non-bool condition ({cond_ty})"),
                        cond.span,
                    ));
                }
                let then_ty = self.check(then)?;
                let otherwise_ty = self.check(otherwise)?;
                if then_ty == otherwise_ty {
                    then_ty
                } else {
                    Type::Any
                }
            }
            NodeKind::Array { nodes } => {
                let mut types = Vec::with_capacity(nodes.len());
                for node in nodes.iter_mut() {
                    types.push(self.check(node)?);
                }
                Type::Array(Box::new(unify(types.into_iter())))
            }
            NodeKind::Map { pairs } => {
                let mut types = Vec::with_capacity(pairs.len());
                for (_, value) in pairs.iter_mut() {
                    types.push(self.check(value)?);
                }
                Type::Map(Box::new(unify(types.into_iter())))
            }
        };
        node.ty = Some(ty.clone());
        Ok(ty)
    }

    fn identifier(&self, name: &str, span: Span) -> Result<Type, Error> {
        let Some(shape) = &self.config.shape else {
            return Ok(Type::Any);
        };
        match resolve_field(shape, name) {
            Ok(Some(ty)) => Ok(ty),
            Ok(None) => {
                if BUILTIN_GLOBALS.contains(&name) {
                    Ok(Type::Any)
                } else if self.config.allow_undefined {
                    Ok(Type::Any)
                } else {
                    Err(Error::new(format!("unknown name {name}"), span))
                }
            }
            Err(()) => Err(ambiguous(name, span)),
        }
    }

    fn unary(&self, op: UnaryOp, ty: Type, span: Span) -> Result<Type, Error> {
        match op {
            UnaryOp::Not => {
                if matches!(ty, Type::Bool | Type::Any) {
                    Ok(Type::Bool)
                } else {
                    Err(Error::new(
                        format!("invalid operation: not (mismatched type {ty})"),
                        span,
                    ))
                }
            }
            UnaryOp::Neg | UnaryOp::Pos => {
                if ty.is_numeric() {
                    Ok(ty)
                } else {
                    Err(Error::new(
                        format!(
                            "invalid operation: {} (mismatched type {ty})",
                            op.symbol()
                        ),
                        span,
                    ))
                }
            }
        }
    }

    fn binary(&mut self, node: &mut Node) -> Result<Type, Error> {
        let span = node.span;
        let NodeKind::Binary { op, left, right } = &mut node.kind else {
            unreachable!();
        };
        let op = *op;
        let left_ty = self.check(left)?;
        let right_ty = self.check(right)?;

        // Overloaded operators rewrite into named calls before the builtin
        // rules apply.
        if let Some(candidates) = self.config.operators.get(op.symbol()) {
            for name in candidates {
                if let Some(ret) = self.overload_matches(name, &left_ty, &right_ty) {
                    let NodeKind::Binary { left, right, .. } =
                        std::mem::replace(&mut node.kind, NodeKind::Nil)
                    else {
                        unreachable!();
                    };
                    node.kind = NodeKind::Call {
                        name: name.clone(),
                        args: vec![*left, *right],
                    };
                    node.ty = Some(ret.clone());
                    return Ok(ret);
                }
            }
        }

        let ty = self.binary_rule(op, &left_ty, &right_ty, span)?;
        node.ty = Some(ty.clone());
        Ok(ty)
    }

    fn overload_matches(&self, name: &str, left: &Type, right: &Type) -> Option<Type> {
        let shape = self.config.shape.as_ref()?;
        let Ok(Some(Type::Func(func))) = resolve_field(shape, name) else {
            return None;
        };
        if func.params.len() != 2 {
            return None;
        }
        // A concrete operand type must match the declared parameter; `Any`
        // on either side never selects an overload, so dynamic expressions
        // keep the builtin operator semantics.
        let matches = |param: &Type, operand: &Type| param == operand && !operand.is_dynamic();
        if matches(&func.params[0], left) && matches(&func.params[1], right) {
            Some(func.ret.clone())
        } else {
            None
        }
    }

    fn binary_rule(
        &self,
        op: BinaryOp,
        left: &Type,
        right: &Type,
        span: Span,
    ) -> Result<Type, Error> {
        let mismatch = || {
            Error::new(
                format!(
                    "invalid operation: {} (mismatched types {left} and {right})",
                    op.symbol()
                ),
                span,
            )
        };
        match op {
            BinaryOp::And | BinaryOp::Or => {
                if matches!(left, Type::Bool | Type::Any) && matches!(right, Type::Bool | Type::Any)
                {
                    Ok(Type::Bool)
                } else {
                    Err(mismatch())
                }
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let comparable = left.promote(right).is_some()
                    || left == right
                    || left.is_dynamic()
                    || right.is_dynamic()
                    || matches!(left, Type::Nil)
                    || matches!(right, Type::Nil);
                if comparable {
                    Ok(Type::Bool)
                } else {
                    Err(mismatch())
                }
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordered = left.promote(right).is_some()
                    || (is_string(left) && is_string(right));
                if ordered {
                    Ok(Type::Bool)
                } else {
                    Err(mismatch())
                }
            }
            BinaryOp::Add => {
                if is_string(left) && is_string(right) {
                    if left.is_dynamic() && right.is_dynamic() {
                        return Ok(Type::Any);
                    }
                    if matches!(left, Type::String) || matches!(right, Type::String) {
                        return Ok(Type::String);
                    }
                }
                left.promote(right).ok_or_else(mismatch)
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                left.promote(right).ok_or_else(mismatch)
            }
            BinaryOp::Mod => match (left, right) {
                (Type::Int, Type::Int) => Ok(Type::Int),
                (Type::Any, other) | (other, Type::Any)
                    if matches!(other, Type::Int | Type::Any) =>
                {
                    Ok(Type::Any)
                }
                _ => Err(mismatch()),
            },
            BinaryOp::Pow => {
                if left.is_numeric() && right.is_numeric() {
                    Ok(Type::Float)
                } else {
                    Err(mismatch())
                }
            }
            BinaryOp::Range => match (left, right) {
                (Type::Int | Type::Any, Type::Int | Type::Any) => {
                    Ok(Type::Array(Box::new(Type::Int)))
                }
                _ => Err(mismatch()),
            },
            BinaryOp::In => match right {
                Type::Array(elem) => {
                    let comparable = left.promote(elem).is_some()
                        || left == &**elem
                        || left.is_dynamic()
                        || elem.is_dynamic();
                    if comparable {
                        Ok(Type::Bool)
                    } else {
                        Err(mismatch())
                    }
                }
                Type::Map(_) | Type::Record(_) => {
                    if is_string(left) {
                        Ok(Type::Bool)
                    } else {
                        Err(mismatch())
                    }
                }
                Type::Any => Ok(Type::Bool),
                _ => Err(mismatch()),
            },
            BinaryOp::Contains | BinaryOp::StartsWith | BinaryOp::EndsWith => {
                if is_string(left) && is_string(right) {
                    Ok(Type::Bool)
                } else {
                    Err(mismatch())
                }
            }
        }
    }

    fn property(&self, base: &Type, property: &str, span: Span) -> Result<Type, Error> {
        match base {
            Type::Any => Ok(Type::Any),
            Type::Record(record) => match resolve_field(record, property) {
                Ok(Some(ty)) => Ok(ty),
                Ok(None) => Err(Error::new(
                    format!("type {base} has no field {property}"),
                    span,
                )),
                Err(()) => Err(ambiguous(property, span)),
            },
            Type::Map(value) => Ok(value.as_ref().clone()),
            other => Err(Error::new(
                format!("type {other} has no field {property}"),
                span,
            )),
        }
    }

    fn index(&self, base: &Type, index: &Type, span: Span) -> Result<Type, Error> {
        match base {
            Type::Any => Ok(Type::Any),
            Type::Array(elem) => {
                if matches!(index, Type::Int | Type::Any) {
                    Ok(elem.as_ref().clone())
                } else {
                    Err(Error::new(
                        format!("non-integer index ({index})"),
                        span,
                    ))
                }
            }
            Type::String => {
                if matches!(index, Type::Int | Type::Any) {
                    Ok(Type::String)
                } else {
                    Err(Error::new(
                        format!("non-integer index ({index})"),
                        span,
                    ))
                }
            }
            Type::Map(value) => {
                if is_string(index) {
                    Ok(value.as_ref().clone())
                } else {
                    Err(Error::new(
                        format!("non-string key ({index})"),
                        span,
                    ))
                }
            }
            other => Err(Error::new(format!("cannot index {other}"), span)),
        }
    }

    fn call_signature(
        &mut self,
        callee: &Type,
        args: &mut [Node],
        name: &str,
        span: Span,
    ) -> Result<Type, Error> {
        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args.iter_mut() {
            arg_types.push((self.check(arg)?, arg.span));
        }
        match callee {
            Type::Any => Ok(Type::Any),
            Type::Func(func) => {
                if arg_types.len() < func.params.len() {
                    return Err(Error::new(
                        format!("not enough arguments to call {name}"),
                        span,
                    ));
                }
                for (param, (arg, arg_span)) in func.params.iter().zip(arg_types.iter()) {
                    if !assignable(param, arg) {
                        return Err(Error::new(
                            format!("cannot use {arg} as argument (type {param}) to call {name}"),
                            *arg_span,
                        ));
                    }
                }
                if let Some(tail) = &func.variadic {
                    for (arg, arg_span) in arg_types.iter().skip(func.params.len()) {
                        if !assignable(tail, arg) {
                            return Err(Error::new(
                                format!(
                                    "cannot use {arg} as argument (type {tail}) to call {name}"
                                ),
                                *arg_span,
                            ));
                        }
                    }
                }
                // Surplus arguments to fixed-arity callees are truncated at
                // run time, so they only need to exist, not to match.
                Ok(func.ret.clone())
            }
            other => Err(Error::new(format!("{name} ({other}) is not a function"), span)),
        }
    }

    fn builtin(&mut self, node: &mut Node, name: &str, span: Span) -> Result<Type, Error> {
        let NodeKind::Builtin { args, .. } = &mut node.kind else {
            unreachable!();
        };
        let ty = match name {
            "len" => {
                if args.len() != 1 {
                    return Err(invalid_arity(name, span));
                }
                let arg = self.check(&mut args[0])?;
                match arg {
                    Type::Array(_) | Type::Map(_) | Type::String | Type::Any => Type::Int,
                    other => {
                        return Err(Error::new(
                            format!("invalid argument for len (type {other})"),
                            span,
                        ))
                    }
                }
            }
            "map" | "filter" | "all" | "none" | "any" | "one" | "count" => {
                if args.len() != 2 {
                    return Err(invalid_arity(name, span));
                }
                let seq = self.check(&mut args[0])?;
                let elem = match &seq {
                    Type::Array(elem) => elem.as_ref().clone(),
                    Type::Any => Type::Any,
                    other => {
                        return Err(Error::new(
                            format!("builtin {name} takes a sequence (got {other})"),
                            args[0].span,
                        ))
                    }
                };
                if !matches!(args[1].kind, NodeKind::Closure { .. }) {
                    return Err(Error::new(
                        format!("builtin {name} takes a closure"),
                        args[1].span,
                    ));
                }
                self.pointers.push(elem.clone());
                let body = self.check(&mut args[1]);
                self.pointers.pop();
                let body = body?;
                match name {
                    "map" => Type::Array(Box::new(body)),
                    "filter" => {
                        require_bool_body(name, &body, args[1].span)?;
                        Type::Array(Box::new(elem))
                    }
                    "count" => {
                        require_bool_body(name, &body, args[1].span)?;
                        Type::Int
                    }
                    _ => {
                        require_bool_body(name, &body, args[1].span)?;
                        Type::Bool
                    }
                }
            }
            other => {
                return Err(Error::new(format!("unknown builtin {other}"), span));
            }
        };
        node.ty = Some(ty.clone());
        Ok(ty)
    }
}

fn require_bool_body(name: &str, body: &Type, span: Span) -> Result<(), Error> {
    if matches!(body, Type::Bool | Type::Any) {
        Ok(())
    } else {
        Err(Error::new(
            format!("closure of {name} must return bool (got {body})"),
            span,
        ))
    }
}

fn invalid_arity(name: &str, span: Span) -> Error {
    Error::new(format!("invalid number of arguments to {name}"), span)
}

fn ambiguous(name: &str, span: Span) -> Error {
    Error::new(format!("ambiguous identifier {name}"), span)
}

fn is_string(ty: &Type) -> bool {
    matches!(ty, Type::String | Type::Any)
}

fn assignable(param: &Type, arg: &Type) -> bool {
    if param == arg || param.is_dynamic() || arg.is_dynamic() {
        return true;
    }
    // Numeric arguments widen to the declared parameter kind.
    if param.is_numeric() && arg.is_numeric() {
        return true;
    }
    match (param, arg) {
        (Type::Array(p), Type::Array(a)) => assignable(p, a),
        (Type::Map(p), Type::Map(a)) => assignable(p, a),
        _ => false,
    }
}

/// Breadth-first field resolution through embedded (promoted) records.
/// `Err(())` reports an ambiguity: two promoted paths of the same depth.
pub fn resolve_field(record: &Rc<RecordType>, name: &str) -> Result<Option<Type>, ()> {
    let mut frontier = vec![record.clone()];
    let mut visited: Vec<*const RecordType> = Vec::new();
    while !frontier.is_empty() {
        let mut hits = Vec::new();
        for record in &frontier {
            if let Some(ty) = record.fields.get(name) {
                hits.push(ty.clone());
            }
        }
        match hits.len() {
            0 => {}
            1 => return Ok(hits.pop()),
            _ => return Err(()),
        }
        let mut next = Vec::new();
        for record in &frontier {
            visited.push(Rc::as_ptr(record));
            for embedded in &record.embedded {
                if let Some(Type::Record(inner)) = record.fields.get(embedded) {
                    if !visited.contains(&Rc::as_ptr(inner)) {
                        next.push(inner.clone());
                    }
                }
            }
        }
        frontier = next;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vex_syntax::FuncDef;

    fn env() -> Value {
        let mut entries = IndexMap::new();
        entries.insert("origin".to_string(), Value::string("MOW"));
        entries.insert("adults".to_string(), Value::Int(1));
        entries.insert("rating".to_string(), Value::Float(5.5));
        entries.insert("flag".to_string(), Value::Bool(true));
        entries.insert(
            "names".to_string(),
            Value::array(vec![Value::string("a"), Value::string("b")]),
        );
        entries.insert(
            "inc".to_string(),
            Value::func(
                FuncDef::fixed(vec![Kind::Int], |args| {
                    Ok(Value::Int(match args[0] {
                        Value::Int(value) => value + 1,
                        _ => 0,
                    }))
                })
                .returning(Kind::Int),
            ),
        );
        Value::map(entries)
    }

    fn check_src(source: &str, config: &Config) -> Result<Type, Error> {
        let mut node = vex_parser::parse(source).expect(source);
        check(&mut node, config)
    }

    #[test]
    fn literals_and_promotion() {
        let config = Config::from_env(&env());
        assert_eq!(check_src("1 + 2", &config).unwrap(), Type::Int);
        assert_eq!(check_src("1 + 2.5", &config).unwrap(), Type::Float);
        assert_eq!(check_src("rating + adults", &config).unwrap(), Type::Float);
        assert_eq!(check_src("2 ** 8", &config).unwrap(), Type::Float);
        assert_eq!(check_src("origin + \"!\"", &config).unwrap(), Type::String);
    }

    #[test]
    fn rejects_mismatched_operands() {
        let config = Config::from_env(&env());
        let err = check_src("1 == true", &config).unwrap_err();
        assert!(err.message.contains("mismatched types"), "{}", err.message);
        let err = check_src("origin - 1", &config).unwrap_err();
        assert!(err.message.contains("mismatched types"));
        let err = check_src("adults matches \"x\"", &config).unwrap_err();
        assert!(err.message.contains("matches"));
    }

    #[test]
    fn unknown_and_allowed_undefined_names() {
        let config = Config::from_env(&env());
        let err = check_src("missing + 1", &config).unwrap_err();
        assert_eq!(err.message, "unknown name missing");

        let mut relaxed = Config::from_env(&env());
        relaxed.allow_undefined = true;
        assert_eq!(check_src("missing == nil", &relaxed).unwrap(), Type::Bool);
    }

    #[test]
    fn builtin_globals_type_as_dynamic() {
        let config = Config::from_env(&env());
        assert_eq!(check_src("Math.PI > 3", &config).unwrap(), Type::Bool);
        assert_eq!(check_src("parseInt(\"10\")", &config).unwrap(), Type::Any);
    }

    #[test]
    fn comprehension_pointer_takes_element_type() {
        let config = Config::from_env(&env());
        assert_eq!(
            check_src("filter(names, {# startsWith \"a\"})", &config).unwrap(),
            Type::Array(Box::new(Type::String))
        );
        let err = check_src("all(names, {# + 1})", &config).unwrap_err();
        assert!(err.message.contains("mismatched types"));
        let err = check_src("map(names, 1)", &config).unwrap_err();
        assert!(err.message.contains("closure"));
    }

    #[test]
    fn expected_type_enforcement() {
        let mut config = Config::from_env(&env());
        config.expect = Some(Expect::Bool);
        assert!(check_src("adults >= 0", &config).is_ok());
        let err = check_src("adults + 42", &config).unwrap_err();
        assert_eq!(err.message, "expected bool, but got int");

        config.expect = Some(Expect::Float64);
        let err = check_src("!!flag", &config).unwrap_err();
        assert_eq!(err.message, "expected float64, but got bool");
    }

    #[test]
    fn operator_overload_rewrites_to_call() {
        let record = Rc::new(
            RecordType::new("env")
                .field("birthDay", Type::String)
                .field(
                    "dateEqual",
                    Type::Func(Rc::new(FuncType {
                        params: vec![Type::String, Type::String],
                        variadic: None,
                        ret: Type::Bool,
                    })),
                ),
        );
        let mut config = Config::from_record(record);
        config.operator("==", &["dateEqual"]);
        let mut node = vex_parser::parse("birthDay == \"2017-10-23\"").unwrap();
        let ty = check(&mut node, &config).unwrap();
        assert_eq!(ty, Type::Bool);
        assert_eq!(node.dump(), "dateEqual(birthDay, \"2017-10-23\")");
    }

    #[test]
    fn ambiguous_promoted_identifier() {
        let left = Rc::new(RecordType::new("Left").field("tag", Type::String));
        let right = Rc::new(RecordType::new("Right").field("tag", Type::Int));
        let record = Rc::new(
            RecordType::new("env")
                .embed("left", left)
                .embed("right", right),
        );
        let config = Config::from_record(record);
        let err = check_src("tag", &config).unwrap_err();
        assert_eq!(err.message, "ambiguous identifier tag");
    }

    #[test]
    fn promoted_field_resolves_through_embedding() {
        let meta = Rc::new(RecordType::new("Meta").field("tags", Type::Map(Box::new(Type::String))));
        let record = Rc::new(
            RecordType::new("env")
                .embed("meta", meta)
                .field("marker", Type::String),
        );
        let config = Config::from_record(record);
        assert_eq!(
            check_src("tags[\"foo\"] startsWith \"bar\"", &config).unwrap(),
            Type::Bool
        );
    }

    #[test]
    fn const_expr_must_name_a_function() {
        let mut config = Config::from_env(&env());
        config.const_expr("adults");
        let err = check_src("1", &config).unwrap_err();
        assert!(err.message.contains("does not name a function"));

        let mut config = Config::new();
        config.const_expr("fib");
        let err = check_src("1", &config).unwrap_err();
        assert!(err.message.contains("requires an environment"));
    }

    #[test]
    fn membership_rules() {
        let config = Config::from_env(&env());
        assert_eq!(check_src("1 in [1, 2, 3]", &config).unwrap(), Type::Bool);
        assert_eq!(
            check_src("\"foo\" in {foo: 0, bar: 1}", &config).unwrap(),
            Type::Bool
        );
        let err = check_src("1 in {foo: 0}", &config).unwrap_err();
        assert!(err.message.contains("mismatched types"));
        let err = check_src("origin in [1, 2]", &config).unwrap_err();
        assert!(err.message.contains("mismatched types"));
    }

    #[test]
    fn call_argument_checks() {
        let config = Config::from_env(&env());
        assert_eq!(check_src("inc(1)", &config).unwrap(), Type::Int);
        assert_eq!(check_src("inc(rating)", &config).unwrap(), Type::Int);
        let err = check_src("inc(origin)", &config).unwrap_err();
        assert!(err.message.contains("cannot use"));
        let err = check_src("inc()", &config).unwrap_err();
        assert!(err.message.contains("not enough arguments"));
        let err = check_src("adults(1)", &config).unwrap_err();
        assert!(err.message.contains("is not a function"));
    }
}
