//! Evaluator for parsed attribute scripts

use std::collections::HashMap;

use rand::Rng;
use serde_json::{Number, Value};

use crate::error::ValueError;
use crate::script::parser::{BinOp, Expr, Program, Stmt, Target, UnOp};

/// A remote attribute reference found in a script
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub attribute: String,
}

/// Pre-resolved values for the remote references of one evaluation
pub type EntityEnv = HashMap<EntityRef, Value>;

/// Read-only bindings exposed to every script
#[derive(Debug, Clone)]
pub struct Bindings {
    /// Current authentication token, when one is held
    pub token: Option<String>,
    /// Simulation clock as epoch seconds
    pub now_epoch_seconds: f64,
}

/// Outcome of one script run: the result plus the state to persist
#[derive(Debug)]
pub struct EvalOutcome {
    pub result: Value,
    pub state: HashMap<String, Value>,
    pub global_writes: HashMap<String, Value>,
}

/// Collect the remote references of a program.
///
/// `entity(...)` accepts two or three literal string arguments:
/// `entity(id, attribute)` or `entity(id, type, attribute)`.
pub fn entity_refs(program: &Program) -> Result<Vec<EntityRef>, ValueError> {
    let mut refs = Vec::new();
    let mut error = None;
    program.visit_exprs(&mut |expr| {
        if let Expr::Call(name, args) = expr {
            if name == "entity" && error.is_none() {
                match parse_entity_ref(args) {
                    Ok(reference) => {
                        if !refs.contains(&reference) {
                            refs.push(reference);
                        }
                    }
                    Err(e) => error = Some(e),
                }
            }
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(refs),
    }
}

fn parse_entity_ref(args: &[Expr]) -> Result<EntityRef, ValueError> {
    let literal = |expr: &Expr| match expr {
        Expr::Str(text) => Ok(text.clone()),
        _ => Err(ValueError::Script("entity() arguments must be literal strings".to_string())),
    };
    match args {
        [id, attribute] => Ok(EntityRef {
            entity_id: literal(id)?,
            entity_type: None,
            attribute: literal(attribute)?,
        }),
        [id, entity_type, attribute] => Ok(EntityRef {
            entity_id: literal(id)?,
            entity_type: Some(literal(entity_type)?),
            attribute: literal(attribute)?,
        }),
        _ => Err(ValueError::Script("entity() takes 2 or 3 arguments".to_string())),
    }
}

/// Run a program against its persisted state, the shared globals and the
/// pre-resolved remote references.
pub fn evaluate(
    program: &Program,
    bindings: &Bindings,
    previous_state: &HashMap<String, Value>,
    globals: &HashMap<String, Value>,
    entities: &EntityEnv,
) -> Result<EvalOutcome, ValueError> {
    let mut scope = Scope {
        vars: HashMap::new(),
        state_names: Vec::new(),
        globals: globals.clone(),
        global_writes: HashMap::new(),
        bindings,
        entities,
    };

    // State variables: restored value wins over the initializer
    for (name, initializer) in &program.state_vars {
        let value = match previous_state.get(name) {
            Some(saved) => saved.clone(),
            None => match initializer {
                Some(expr) => scope.eval(expr)?,
                None => Value::Null,
            },
        };
        scope.state_names.push(name.clone());
        scope.vars.insert(name.clone(), value);
    }

    let mut result = Value::Null;
    for stmt in &program.stmts {
        match stmt {
            Stmt::Assign(Target::Var(name), expr) => {
                let value = scope.eval(expr)?;
                scope.vars.insert(name.clone(), value.clone());
                result = value;
            }
            Stmt::Assign(Target::Global(field), expr) => {
                let value = scope.eval(expr)?;
                scope.globals.insert(field.clone(), value.clone());
                scope.global_writes.insert(field.clone(), value.clone());
                result = value;
            }
            Stmt::Expr(expr) => {
                result = scope.eval(expr)?;
            }
        }
    }

    let state = scope
        .state_names
        .iter()
        .filter_map(|name| scope.vars.get(name).map(|value| (name.clone(), value.clone())))
        .collect();

    Ok(EvalOutcome { result, state, global_writes: scope.global_writes })
}

struct Scope<'a> {
    vars: HashMap<String, Value>,
    state_names: Vec<String>,
    globals: HashMap<String, Value>,
    global_writes: HashMap<String, Value>,
    bindings: &'a Bindings,
    entities: &'a EntityEnv,
}

impl Scope<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, ValueError> {
        match expr {
            Expr::Number(value) => Ok(number(*value)),
            Expr::Str(value) => Ok(Value::from(value.clone())),
            Expr::Bool(value) => Ok(Value::from(*value)),
            Expr::Null => Ok(Value::Null),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Var(name) => self.variable(name),
            Expr::Global(field) => Ok(self.globals.get(field).cloned().unwrap_or(Value::Null)),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnOp::Neg => Ok(number(-as_number(&value)?)),
                    UnOp::Not => Ok(Value::from(!truthy(&value))),
                }
            }
            Expr::Binary(op, left, right) => self.binary(*op, left, right),
            Expr::Ternary(cond, then, otherwise) => {
                if truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn variable(&self, name: &str) -> Result<Value, ValueError> {
        match name {
            "token" => Ok(self
                .bindings
                .token
                .as_ref()
                .map(|token| Value::from(token.clone()))
                .unwrap_or(Value::Null)),
            "now" => Ok(number(self.bindings.now_epoch_seconds)),
            _ => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| ValueError::Script(format!("unknown variable '{name}'"))),
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<Value, ValueError> {
        // Short-circuit logical operators
        match op {
            BinOp::And => {
                let lhs = self.eval(left)?;
                if !truthy(&lhs) {
                    return Ok(Value::from(false));
                }
                return Ok(Value::from(truthy(&self.eval(right)?)));
            }
            BinOp::Or => {
                let lhs = self.eval(left)?;
                if truthy(&lhs) {
                    return Ok(Value::from(true));
                }
                return Ok(Value::from(truthy(&self.eval(right)?)));
            }
            _ => {}
        }

        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        match op {
            BinOp::Add => match (&lhs, &rhs) {
                (Value::String(a), _) => Ok(Value::from(format!("{a}{}", display(&rhs)))),
                (_, Value::String(b)) => Ok(Value::from(format!("{}{b}", display(&lhs)))),
                _ => Ok(number(as_number(&lhs)? + as_number(&rhs)?)),
            },
            BinOp::Sub => Ok(number(as_number(&lhs)? - as_number(&rhs)?)),
            BinOp::Mul => Ok(number(as_number(&lhs)? * as_number(&rhs)?)),
            BinOp::Div => {
                let divisor = as_number(&rhs)?;
                if divisor == 0.0 {
                    return Err(ValueError::Script("division by zero".to_string()));
                }
                Ok(number(as_number(&lhs)? / divisor))
            }
            BinOp::Rem => {
                let divisor = as_number(&rhs)?;
                if divisor == 0.0 {
                    return Err(ValueError::Script("division by zero".to_string()));
                }
                Ok(number(as_number(&lhs)? % divisor))
            }
            BinOp::Eq => Ok(Value::from(lhs == rhs)),
            BinOp::NotEq => Ok(Value::from(lhs != rhs)),
            BinOp::Lt => Ok(Value::from(compare(&lhs, &rhs)? == std::cmp::Ordering::Less)),
            BinOp::LtEq => Ok(Value::from(compare(&lhs, &rhs)? != std::cmp::Ordering::Greater)),
            BinOp::Gt => Ok(Value::from(compare(&lhs, &rhs)? == std::cmp::Ordering::Greater)),
            BinOp::GtEq => Ok(Value::from(compare(&lhs, &rhs)? != std::cmp::Ordering::Less)),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, ValueError> {
        if name == "entity" {
            let reference = parse_entity_ref(args)?;
            return self.entities.get(&reference).cloned().ok_or_else(|| {
                ValueError::Script(format!(
                    "no resolved value for entity '{}' attribute '{}'",
                    reference.entity_id, reference.attribute
                ))
            });
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        let unary = |values: &[Value], f: fn(f64) -> f64| -> Result<Value, ValueError> {
            match values {
                [value] => Ok(number(f(as_number(value)?))),
                _ => Err(ValueError::Script(format!("{name}() takes one argument"))),
            }
        };

        match name {
            "min" | "max" => {
                if values.is_empty() {
                    return Err(ValueError::Script(format!("{name}() needs arguments")));
                }
                let mut numbers = Vec::with_capacity(values.len());
                for value in &values {
                    numbers.push(as_number(value)?);
                }
                let result = if name == "min" {
                    numbers.iter().copied().fold(f64::INFINITY, f64::min)
                } else {
                    numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                };
                Ok(number(result))
            }
            "abs" => unary(&values, f64::abs),
            "floor" => unary(&values, f64::floor),
            "ceil" => unary(&values, f64::ceil),
            "round" => unary(&values, f64::round),
            "sqrt" => unary(&values, f64::sqrt),
            "pow" => match values.as_slice() {
                [base, exponent] => Ok(number(as_number(base)?.powf(as_number(exponent)?))),
                _ => Err(ValueError::Script("pow() takes two arguments".to_string())),
            },
            "random" => match values.as_slice() {
                [] => Ok(number(rand::thread_rng().gen_range(0.0..1.0))),
                [lo, hi] => {
                    let (lo, hi) = (as_number(lo)?, as_number(hi)?);
                    if lo >= hi {
                        Ok(number(lo))
                    } else {
                        Ok(number(rand::thread_rng().gen_range(lo..hi)))
                    }
                }
                _ => Err(ValueError::Script("random() takes zero or two arguments".to_string())),
            },
            other => Err(ValueError::Script(format!("unknown function '{other}'"))),
        }
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_number(value: &Value) -> Result<f64, ValueError> {
    value
        .as_f64()
        .ok_or_else(|| ValueError::Script(format!("expected a number, found {value}")))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, ValueError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let (a, b) = (as_number(lhs)?, as_number(rhs)?);
            a.partial_cmp(&b)
                .ok_or_else(|| ValueError::Script("values are not comparable".to_string()))
        }
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::Program;

    fn bindings() -> Bindings {
        Bindings { token: Some("tok-1".to_string()), now_epoch_seconds: 1_000.0 }
    }

    fn run(source: &str, state: &HashMap<String, Value>) -> EvalOutcome {
        let program = Program::parse(source).unwrap();
        evaluate(&program, &bindings(), state, &HashMap::new(), &EntityEnv::new()).unwrap()
    }

    #[test]
    fn test_arithmetic_result() {
        let outcome = run("2 + 3 * 4", &HashMap::new());
        assert_eq!(outcome.result, Value::from(14));
    }

    #[test]
    fn test_state_initializer_and_persistence() {
        let outcome = run("state counter = 10; counter = counter + 1; counter", &HashMap::new());
        assert_eq!(outcome.result, Value::from(11));
        assert_eq!(outcome.state.get("counter"), Some(&Value::from(11)));

        // Restored state wins over the initializer on the next call
        let outcome = run("state counter = 10; counter = counter + 1; counter", &outcome.state);
        assert_eq!(outcome.result, Value::from(12));
    }

    #[test]
    fn test_bindings_available() {
        let outcome = run("token", &HashMap::new());
        assert_eq!(outcome.result, Value::from("tok-1"));
        let outcome = run("now / 1000", &HashMap::new());
        assert_eq!(outcome.result, Value::from(1));
    }

    #[test]
    fn test_global_writes_reported() {
        let outcome = run("globals.total = 5; globals.total", &HashMap::new());
        assert_eq!(outcome.result, Value::from(5));
        assert_eq!(outcome.global_writes.get("total"), Some(&Value::from(5)));
    }

    #[test]
    fn test_entity_lookup_uses_resolved_env() {
        let program = Program::parse("entity('E1', 'temperature') + 1").unwrap();
        let refs = entity_refs(&program).unwrap();
        assert_eq!(refs.len(), 1);
        let mut env = EntityEnv::new();
        env.insert(refs[0].clone(), Value::from(20));
        let outcome =
            evaluate(&program, &bindings(), &HashMap::new(), &HashMap::new(), &env).unwrap();
        assert_eq!(outcome.result, Value::from(21));
    }

    #[test]
    fn test_entity_with_dynamic_args_rejected() {
        let program = Program::parse("entity('E' + '1', 'temperature')").unwrap();
        assert!(entity_refs(&program).is_err());
    }

    #[test]
    fn test_division_by_zero_is_script_error() {
        let program = Program::parse("1 / 0").unwrap();
        let result =
            evaluate(&program, &bindings(), &HashMap::new(), &HashMap::new(), &EntityEnv::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_ternary_and_comparison() {
        let outcome = run("now > 500 ? 'day' : 'night'", &HashMap::new());
        assert_eq!(outcome.result, Value::from("day"));
    }
}
