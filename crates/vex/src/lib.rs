//! An embeddable expression language: programs compile once to compact
//! bytecode and run many times against host-supplied environments.
//!
//! ```
//! use vex::Value;
//!
//! let mut env = indexmap::IndexMap::new();
//! env.insert("greet".to_string(), Value::string("Hello, "));
//! env.insert("name".to_string(), Value::string("world!"));
//!
//! let output = vex::eval("greet + name", &Value::map(env)).unwrap();
//! assert_eq!(output, Value::string("Hello, world!"));
//! ```

use std::rc::Rc;

pub use vex_check::{Config, Expect};
pub use vex_syntax::{
    walk, BinaryOp, Call, Error, FuncDef, FuncType, Kind, Location, Node, NodeKind, Object,
    RecordType, Source, Span, Type, UnaryOp, Value, Visitor,
};
pub use vex_vm::{Opcode, Program, StepHook, Vm, MEMORY_BUDGET};

/// Compile with the default options: dynamic environment, optimizer on.
pub fn compile(source: &str) -> Result<Program, Error> {
    Options::new().compile(source)
}

/// Run a compiled program against an environment.
pub fn run(program: &Program, env: &Value) -> Result<Value, Error> {
    vex_vm::run(program, env)
}

/// Compile and immediately run, without static checking. Handy for one-off
/// evaluation; hot paths should compile once and reuse the program.
pub fn eval(source: &str, env: &Value) -> Result<Value, Error> {
    let program = compile(source)?;
    run(&program, env)
}

/// Compile-time options: the type environment, operator overloads,
/// const-expr registrations, an AST patch visitor, the expected result
/// type, and the optimizer toggle.
pub struct Options {
    env: Option<Value>,
    record: Option<Rc<RecordType>>,
    allow_undefined: bool,
    operators: Vec<(String, Vec<String>)>,
    const_fns: Vec<String>,
    expect: Option<Expect>,
    optimize: bool,
    patcher: Option<Box<dyn Visitor>>,
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

impl Options {
    pub fn new() -> Self {
        Options {
            env: None,
            record: None,
            allow_undefined: false,
            operators: Vec::new(),
            const_fns: Vec::new(),
            expect: None,
            optimize: true,
            patcher: None,
        }
    }

    /// Derive the static environment shape from a sample value. The sample
    /// is also what const-expr calls evaluate against at compile time.
    pub fn type_check(mut self, env: &Value) -> Self {
        self.env = Some(env.clone());
        self
    }

    /// Check against a hand-built record shape instead of a sample value.
    pub fn type_check_record(mut self, record: RecordType) -> Self {
        self.record = Some(Rc::new(record));
        self
    }

    /// Relax unknown identifiers to dynamic lookups that yield nil.
    pub fn allow_undefined_variables(mut self) -> Self {
        self.allow_undefined = true;
        self
    }

    /// Overload an operator with named environment functions; the first
    /// candidate whose signature matches the operand types wins.
    pub fn operator(mut self, symbol: &str, candidates: &[&str]) -> Self {
        self.operators.push((
            symbol.to_string(),
            candidates.iter().map(|name| name.to_string()).collect(),
        ));
        self
    }

    /// Mark an environment function as evaluable at compile time when all
    /// its arguments are constant.
    pub fn const_expr(mut self, name: &str) -> Self {
        self.const_fns.push(name.to_string());
        self
    }

    /// Rewrite the tree between checking and optimization.
    pub fn patch(mut self, visitor: impl Visitor + 'static) -> Self {
        self.patcher = Some(Box::new(visitor));
        self
    }

    pub fn as_bool(mut self) -> Self {
        self.expect = Some(Expect::Bool);
        self
    }

    pub fn as_int64(mut self) -> Self {
        self.expect = Some(Expect::Int64);
        self
    }

    pub fn as_float64(mut self) -> Self {
        self.expect = Some(Expect::Float64);
        self
    }

    pub fn optimize(mut self, enabled: bool) -> Self {
        self.optimize = enabled;
        self
    }

    /// The full pipeline: parse, check, patch, optimize, compile. Every
    /// error comes back bound to the source with a location and snippet.
    pub fn compile(self, source: &str) -> Result<Program, Error> {
        let src = Source::new(source);
        let mut node = vex_parser::parse(source).map_err(|err| err.bind(&src))?;

        let mut config = match (&self.env, &self.record) {
            (Some(env), _) => Config::from_env(env),
            (None, Some(record)) => Config::from_record(record.clone()),
            (None, None) => Config::new(),
        };
        config.allow_undefined = self.allow_undefined;
        for (symbol, candidates) in &self.operators {
            let candidates: Vec<&str> = candidates.iter().map(String::as_str).collect();
            config.operator(symbol, &candidates);
        }
        for name in &self.const_fns {
            config.const_expr(name);
        }
        config.expect = self.expect;

        vex_check::check(&mut node, &config).map_err(|err| err.bind(&src))?;
        if let Some(mut patcher) = self.patcher {
            walk(&mut node, patcher.as_mut());
        }
        if self.optimize {
            vex_vm::optimize(&mut node, Some(&config)).map_err(|err| err.bind(&src))?;
        }
        vex_vm::compile(&node, src.clone(), Some(&config)).map_err(|err| err.bind(&src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn map_env(entries: Vec<(&str, Value)>) -> Value {
        let mut map = IndexMap::new();
        for (key, value) in entries {
            map.insert(key.to_string(), value);
        }
        Value::map(map)
    }

    #[test]
    fn eval_concatenates_greeting() {
        let env = map_env(vec![
            ("greet", Value::string("Hello, ")),
            ("name", Value::string("world!")),
        ]);
        assert_eq!(
            eval("greet + name", &env).unwrap(),
            Value::string("Hello, world!")
        );
    }

    #[test]
    fn as_bool_rejects_non_bool_results() {
        let env = map_env(vec![("foo", Value::Int(0))]);
        let program = Options::new()
            .type_check(&env)
            .as_bool()
            .compile("foo >= 0")
            .unwrap();
        assert_eq!(run(&program, &env).unwrap(), Value::Bool(true));

        let err = Options::new()
            .type_check(&env)
            .as_bool()
            .compile("foo + 42")
            .unwrap_err();
        assert_eq!(err.message, "expected bool, but got int");
    }

    #[test]
    fn as_int64_truncates_floats() {
        let env = map_env(vec![("rating", Value::Float(5.5))]);
        let program = Options::new()
            .type_check(&env)
            .as_int64()
            .compile("rating")
            .unwrap();
        assert_eq!(run(&program, &env).unwrap(), Value::Int(5));
    }

    #[test]
    fn as_float64_casts_and_rejects() {
        let program = Options::new().as_float64().compile("42").unwrap();
        assert_eq!(run(&program, &Value::Nil).unwrap(), Value::Float(42.0));

        let err = Options::new().as_float64().compile("!!true").unwrap_err();
        assert_eq!(err.message, "expected float64, but got bool");
    }

    #[test]
    fn allow_undefined_variables_yields_nil() {
        let env = map_env(vec![(
            "greeting",
            Value::func(FuncDef::fixed(vec![Kind::String], |args| {
                Ok(Value::string(format!("Hello, {}!", args[0])))
            })),
        )]);
        let program = Options::new()
            .type_check(&env)
            .allow_undefined_variables()
            .compile(r#"name == nil ? "Hello, world!" : greeting(name)"#)
            .unwrap();
        assert_eq!(
            run(&program, &env).unwrap(),
            Value::string("Hello, world!")
        );

        let mut entries = IndexMap::new();
        entries.insert(
            "greeting".to_string(),
            Value::func(FuncDef::fixed(vec![Kind::String], |args| {
                Ok(Value::string(format!("Hello, {}!", args[0])))
            })),
        );
        entries.insert("name".to_string(), Value::string("you"));
        let env = Value::map(entries);
        assert_eq!(
            run(&program, &env).unwrap(),
            Value::string("Hello, you!")
        );
    }

    #[test]
    fn operators_rewrite_to_named_calls() {
        let env = map_env(vec![
            ("birthDay", Value::string("2017-10-23")),
            (
                "dateEqual",
                Value::func(
                    FuncDef::fixed(vec![Kind::String, Kind::String], |args| {
                        Ok(Value::Bool(args[0] == args[1]))
                    })
                    .returning(Kind::Bool),
                ),
            ),
        ]);
        let program = Options::new()
            .type_check(&env)
            .operator("==", &["dateEqual"])
            .compile(r#"birthDay == "2017-10-23""#)
            .unwrap();
        assert_eq!(run(&program, &env).unwrap(), Value::Bool(true));
    }

    struct GetterPatcher;
    impl Visitor for GetterPatcher {
        fn exit(&mut self, node: &mut Node) {
            if let NodeKind::Property { .. } = &node.kind {
                let NodeKind::Property { node: base, property, .. } =
                    std::mem::replace(&mut node.kind, NodeKind::Nil)
                else {
                    unreachable!();
                };
                let property = Node::new(NodeKind::Str(property), node.span);
                node.kind = NodeKind::Call {
                    name: "get".to_string(),
                    args: vec![*base, property],
                };
            }
        }
    }

    #[test]
    fn patch_rewrites_property_reads() {
        let env = map_env(vec![
            ("greet", Value::string("Hello")),
            (
                "get",
                Value::func(FuncDef::fixed(
                    vec![Kind::String, Kind::String],
                    |args| Ok(Value::string(format!("{}, {}", args[0], args[1]))),
                )),
            ),
        ]);
        let program = Options::new()
            .patch(GetterPatcher)
            .compile(r#"greet.you.world + "!""#)
            .unwrap();
        assert_eq!(
            run(&program, &env).unwrap(),
            Value::string("Hello, you, world!")
        );
    }

    #[test]
    fn const_expr_requires_a_function() {
        let env = map_env(vec![("fib", Value::Int(0))]);
        let err = Options::new()
            .type_check(&env)
            .const_expr("fib")
            .compile("fib")
            .unwrap_err();
        assert!(err.message.contains("does not name a function"));

        let err = Options::new()
            .const_expr("fib")
            .compile("1")
            .unwrap_err();
        assert!(err.message.contains("requires an environment"));
    }
}
