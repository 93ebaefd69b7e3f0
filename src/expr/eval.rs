//! Tree-walking evaluator over `serde_json::Value`.
//!
//! Semantics follow the expression language the pipeline configs are written
//! in: Python-flavoured truthiness, `/` always yields a float, `//` floors,
//! `%` takes the sign of the divisor, negative indices count from the end.
//! Tuples and sets are modelled as lists.

use super::parser::{BinOp, BoolOp, CmpOp, Expr, UnaryOp};
use super::rng::StageRng;
use crate::errors::ExprError;
use serde_json::{Map, Value, json};
use std::collections::HashMap;

/// Hard ceiling on materialised sequences (`range`, list repetition) so a
/// typo in a config cannot exhaust memory.
const MAX_SEQUENCE: usize = 1_000_000;

/// Mutable evaluation context: the symbol table plus the stage RNG.
pub struct EvalContext<'a> {
    pub vars: &'a mut HashMap<String, Value>,
    pub rng: Option<&'a mut StageRng>,
}

impl<'a> EvalContext<'a> {
    pub fn new(vars: &'a mut HashMap<String, Value>, rng: Option<&'a mut StageRng>) -> Self {
        Self { vars, rng }
    }
}

pub fn eval(expr: &Expr, ctx: &mut EvalContext) -> Result<Value, ExprError> {
    match expr {
        Expr::Int(v) => Ok(Value::from(*v)),
        Expr::Float(v) => Ok(num(*v)),
        Expr::Str(v) => Ok(Value::String(v.clone())),
        Expr::Bool(v) => Ok(Value::Bool(*v)),
        Expr::None => Ok(Value::Null),
        Expr::Name(name) => ctx
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Undefined { name: name.clone() }),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Dict(pairs) => {
            let mut map = Map::new();
            for (key_expr, value_expr) in pairs {
                let key = match eval(key_expr, ctx)? {
                    Value::String(s) => s,
                    other => to_display_string(&other),
                };
                let value = eval(value_expr, ctx)?;
                map.insert(key, value);
            }
            Ok(Value::Object(map))
        }
        Expr::Unary { op, operand } => {
            let value = eval(operand, ctx)?;
            match op {
                UnaryOp::Neg => match value {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Ok(Value::from(-i))
                        } else {
                            Ok(num(-n.as_f64().unwrap_or(0.0)))
                        }
                    }
                    other => Err(ExprError::Type(format!(
                        "cannot negate {}",
                        type_name(&other)
                    ))),
                },
                UnaryOp::Pos => match value {
                    Value::Number(_) => Ok(value),
                    other => Err(ExprError::Type(format!(
                        "unary '+' needs a number, got {}",
                        type_name(&other)
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, ctx)?;
            let rhs = eval(right, ctx)?;
            binary(*op, lhs, rhs)
        }
        Expr::BoolOp { op, left, right } => {
            let lhs = eval(left, ctx)?;
            // Python short-circuit: the operand value itself is the result.
            match op {
                BoolOp::And => {
                    if truthy(&lhs) {
                        eval(right, ctx)
                    } else {
                        Ok(lhs)
                    }
                }
                BoolOp::Or => {
                    if truthy(&lhs) {
                        Ok(lhs)
                    } else {
                        eval(right, ctx)
                    }
                }
            }
        }
        Expr::Not(operand) => {
            let value = eval(operand, ctx)?;
            Ok(Value::Bool(!truthy(&value)))
        }
        Expr::Compare { left, rest } => {
            let mut prev = eval(left, ctx)?;
            for (op, right_expr) in rest {
                let right = eval(right_expr, ctx)?;
                if !compare(*op, &prev, &right)? {
                    return Ok(Value::Bool(false));
                }
                prev = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            let condition = eval(cond, ctx)?;
            if truthy(&condition) {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Call { func, args } => eval_call(func, args, ctx),
        Expr::Attr { value, name } => {
            let base = eval(value, ctx)?;
            match base {
                Value::Object(map) => map.get(name).cloned().ok_or_else(|| {
                    ExprError::Eval(format!("object has no field '{name}'"))
                }),
                other => Err(ExprError::Type(format!(
                    "cannot read attribute '{name}' of {}",
                    type_name(&other)
                ))),
            }
        }
        Expr::Index { value, index } => {
            let base = eval(value, ctx)?;
            let idx = eval(index, ctx)?;
            index_value(&base, &idx)
        }
        Expr::Slice {
            value,
            start,
            stop,
            step,
        } => {
            let base = eval(value, ctx)?;
            let start = eval_opt(start, ctx)?;
            let stop = eval_opt(stop, ctx)?;
            let step = eval_opt(step, ctx)?;
            slice_value(&base, start, stop, step)
        }
        Expr::ListComp {
            expr,
            var,
            iter,
            cond,
        } => {
            let iterable = eval(iter, ctx)?;
            let items = iter_items(&iterable)?;
            let saved = ctx.vars.get(var).cloned();
            let mut out = Vec::new();
            for item in items {
                ctx.vars.insert(var.clone(), item);
                let keep = match cond {
                    Some(c) => truthy(&eval(c, ctx)?),
                    None => true,
                };
                if keep {
                    out.push(eval(expr, ctx)?);
                }
            }
            match saved {
                Some(v) => ctx.vars.insert(var.clone(), v),
                None => ctx.vars.remove(var),
            };
            Ok(Value::Array(out))
        }
    }
}

fn eval_opt(
    expr: &Option<Box<Expr>>,
    ctx: &mut EvalContext,
) -> Result<Option<i64>, ExprError> {
    match expr {
        None => Ok(None),
        Some(e) => {
            let v = eval(e, ctx)?;
            v.as_i64()
                .map(Some)
                .ok_or_else(|| ExprError::Type("slice bounds must be integers".to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Add => match (&lhs, &rhs) {
            (Value::Number(_), Value::Number(_)) => arith(op, &lhs, &rhs),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => Err(type_mismatch("+", &lhs, &rhs)),
        },
        BinOp::Mul => match (&lhs, &rhs) {
            (Value::Number(_), Value::Number(_)) => arith(op, &lhs, &rhs),
            (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
                let count = repeat_count(n)?;
                Ok(Value::String(s.repeat(count)))
            }
            (Value::Array(a), Value::Number(n)) | (Value::Number(n), Value::Array(a)) => {
                let count = repeat_count(n)?;
                if a.len().saturating_mul(count) > MAX_SEQUENCE {
                    return Err(ExprError::Eval("list repetition too large".to_string()));
                }
                let mut out = Vec::with_capacity(a.len() * count);
                for _ in 0..count {
                    out.extend(a.iter().cloned());
                }
                Ok(Value::Array(out))
            }
            _ => Err(type_mismatch("*", &lhs, &rhs)),
        },
        _ => arith(op, &lhs, &rhs),
    }
}

fn repeat_count(n: &serde_json::Number) -> Result<usize, ExprError> {
    let v = n
        .as_i64()
        .ok_or_else(|| ExprError::Type("repeat count must be an integer".to_string()))?;
    Ok(v.max(0) as usize)
}

fn arith(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    let (Value::Number(a), Value::Number(b)) = (lhs, rhs) else {
        return Err(type_mismatch(op_symbol(op), lhs, rhs));
    };

    // Integer arithmetic stays integral where the operation allows it.
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        match op {
            BinOp::Add => return Ok(Value::from(x.wrapping_add(y))),
            BinOp::Sub => return Ok(Value::from(x.wrapping_sub(y))),
            BinOp::Mul => return Ok(Value::from(x.wrapping_mul(y))),
            BinOp::FloorDiv => {
                if y == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                // Floors toward negative infinity regardless of sign.
                return Ok(Value::from((x as f64 / y as f64).floor() as i64));
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                // Result takes the divisor's sign.
                let r = x - y * (x as f64 / y as f64).floor() as i64;
                return Ok(Value::from(r));
            }
            BinOp::Pow => {
                if y >= 0 {
                    if let Ok(exp) = u32::try_from(y) {
                        if let Some(v) = x.checked_pow(exp) {
                            return Ok(Value::from(v));
                        }
                    }
                }
                return Ok(num((x as f64).powf(y as f64)));
            }
            BinOp::Div => {
                if y == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                return Ok(num(x as f64 / y as f64));
            }
        }
    }

    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    let out = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            x - y * (x / y).floor()
        }
        BinOp::Pow => x.powf(y),
    };
    Ok(num(out))
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
    }
}

fn type_mismatch(op: &str, lhs: &Value, rhs: &Value) -> ExprError {
    ExprError::Type(format!(
        "unsupported operand types for '{op}': {} and {}",
        type_name(lhs),
        type_name(rhs)
    ))
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => Ok(value_eq(lhs, rhs)),
        CmpOp::NotEq => Ok(!value_eq(lhs, rhs)),
        CmpOp::In => membership(lhs, rhs),
        CmpOp::NotIn => membership(lhs, rhs).map(|b| !b),
        CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => {
            let ord = value_order(lhs, rhs)?;
            Ok(match op {
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::LtEq => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::GtEq => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            })
        }
    }
}

/// Equality with cross-type numeric comparison (`1 == 1.0`).
pub fn value_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        _ => lhs == rhs,
    }
}

fn value_order(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y)
                .ok_or_else(|| ExprError::Eval("cannot order NaN".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = value_order(x, y)?;
                if ord != std::cmp::Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(ExprError::Type(format!(
            "cannot order {} and {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|v| value_eq(needle, v))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ExprError::Type(format!(
                "'in <string>' needs a string, got {}",
                type_name(other)
            ))),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(ExprError::Type(format!(
                "'in <dict>' needs a string key, got {}",
                type_name(other)
            ))),
        },
        other => Err(ExprError::Type(format!(
            "'in' needs a list, string, or dict, got {}",
            type_name(other)
        ))),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "int"
            } else {
                "float"
            }
        }
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn num(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Indexing and slicing
// ---------------------------------------------------------------------------

fn index_value(base: &Value, idx: &Value) -> Result<Value, ExprError> {
    match base {
        Value::Array(items) => {
            let i = idx
                .as_i64()
                .ok_or_else(|| ExprError::Type("list index must be an integer".to_string()))?;
            let resolved = resolve_index(i, items.len())
                .ok_or_else(|| ExprError::Eval(format!("list index {i} out of range")))?;
            Ok(items[resolved].clone())
        }
        Value::String(s) => {
            let i = idx
                .as_i64()
                .ok_or_else(|| ExprError::Type("string index must be an integer".to_string()))?;
            let chars: Vec<char> = s.chars().collect();
            let resolved = resolve_index(i, chars.len())
                .ok_or_else(|| ExprError::Eval(format!("string index {i} out of range")))?;
            Ok(Value::String(chars[resolved].to_string()))
        }
        Value::Object(map) => {
            let key = idx
                .as_str()
                .ok_or_else(|| ExprError::Type("dict key must be a string".to_string()))?;
            map.get(key)
                .cloned()
                .ok_or_else(|| ExprError::Eval(format!("key '{key}' not found")))
        }
        other => Err(ExprError::Type(format!(
            "{} is not indexable",
            type_name(other)
        ))),
    }
}

fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if i < 0 { i + len } else { i };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

fn slice_value(
    base: &Value,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Value, ExprError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(ExprError::Eval("slice step cannot be zero".to_string()));
    }
    match base {
        Value::Array(items) => Ok(Value::Array(slice_items(items, start, stop, step))),
        Value::String(s) => {
            let chars: Vec<Value> = s.chars().map(|c| Value::String(c.to_string())).collect();
            let sliced = slice_items(&chars, start, stop, step);
            let out: String = sliced
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            Ok(Value::String(out))
        }
        other => Err(ExprError::Type(format!(
            "{} is not sliceable",
            type_name(other)
        ))),
    }
}

fn slice_items(items: &[Value], start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<Value> {
    let len = items.len() as i64;
    let clamp = |i: i64| -> i64 {
        let i = if i < 0 { i + len } else { i };
        i.clamp(if step > 0 { 0 } else { -1 }, len)
    };
    let (default_start, default_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
    let start = start.map(clamp).unwrap_or(default_start);
    let stop = stop.map(clamp).unwrap_or(default_stop);

    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        if (0..len).contains(&i) {
            out.push(items[i as usize].clone());
        }
        i += step;
    }
    out
}

// ---------------------------------------------------------------------------
// Calls: builtins, methods, and the random module
// ---------------------------------------------------------------------------

fn eval_call(func: &Expr, args: &[Expr], ctx: &mut EvalContext) -> Result<Value, ExprError> {
    match func {
        Expr::Name(name) => {
            // map/filter take a builtin by name as their first argument.
            if (name == "map" || name == "filter") && !args.is_empty() {
                return eval_map_filter(name, args, ctx);
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx)?);
            }
            call_builtin(name, &values)
        }
        Expr::Attr { value, name } => {
            if matches!(value.as_ref(), Expr::Name(module) if module == "random") {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(eval(arg, ctx)?);
                }
                let rng = ctx
                    .rng
                    .as_deref_mut()
                    .ok_or_else(|| ExprError::Eval("random is not available here".to_string()))?;
                return rng.call(name, &values);
            }
            let receiver = eval(value, ctx)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx)?);
            }
            call_method(&receiver, name, &values)
        }
        other => Err(ExprError::Type(format!("{other:?} is not callable"))),
    }
}

fn eval_map_filter(name: &str, args: &[Expr], ctx: &mut EvalContext) -> Result<Value, ExprError> {
    if args.len() != 2 {
        return Err(ExprError::Eval(format!("{name} takes 2 arguments")));
    }
    let func_name = match &args[0] {
        Expr::Name(n) => Some(n.clone()),
        Expr::None => None,
        _ => {
            return Err(ExprError::Type(format!(
                "{name}: first argument must be a builtin name"
            )));
        }
    };
    let iterable = eval(&args[1], ctx)?;
    let items = iter_items(&iterable)?;
    let mut out = Vec::new();
    for item in items {
        match (name, &func_name) {
            ("map", Some(f)) => out.push(call_builtin(f, &[item])?),
            ("map", None) => out.push(item),
            ("filter", Some(f)) => {
                if truthy(&call_builtin(f, std::slice::from_ref(&item))?) {
                    out.push(item);
                }
            }
            ("filter", None) => {
                if truthy(&item) {
                    out.push(item);
                }
            }
            _ => unreachable!(),
        }
    }
    Ok(Value::Array(out))
}

fn iter_items(value: &Value) -> Result<Vec<Value>, ExprError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Object(map) => Ok(map.keys().map(|k| Value::String(k.clone())).collect()),
        other => Err(ExprError::Type(format!(
            "{} is not iterable",
            type_name(other)
        ))),
    }
}

fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "len" => {
            one_arg(name, args)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExprError::Type(format!(
                        "len() of {}",
                        type_name(other)
                    )));
                }
            };
            Ok(Value::from(n as i64))
        }
        "int" => {
            one_arg(name, args)?;
            match &args[0] {
                Value::Bool(b) => Ok(Value::from(*b as i64)),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(i))
                    } else {
                        Ok(Value::from(n.as_f64().unwrap_or(0.0).trunc() as i64))
                    }
                }
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| {
                    ExprError::Eval(format!("int(): invalid literal '{s}'"))
                }),
                other => Err(ExprError::Type(format!("int() of {}", type_name(other)))),
            }
        }
        "float" => {
            one_arg(name, args)?;
            match &args[0] {
                Value::Bool(b) => Ok(num(*b as i64 as f64)),
                Value::Number(n) => Ok(num(n.as_f64().unwrap_or(0.0))),
                Value::String(s) => s.trim().parse::<f64>().map(num).map_err(|_| {
                    ExprError::Eval(format!("float(): invalid literal '{s}'"))
                }),
                other => Err(ExprError::Type(format!("float() of {}", type_name(other)))),
            }
        }
        "str" => {
            one_arg(name, args)?;
            Ok(Value::String(to_display_string(&args[0])))
        }
        "bool" => {
            one_arg(name, args)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "abs" => {
            one_arg(name, args)?;
            match &args[0] {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(i.abs()))
                    } else {
                        Ok(num(n.as_f64().unwrap_or(0.0).abs()))
                    }
                }
                other => Err(ExprError::Type(format!("abs() of {}", type_name(other)))),
            }
        }
        "round" => {
            if args.is_empty() || args.len() > 2 {
                return Err(ExprError::Eval("round() takes 1 or 2 arguments".to_string()));
            }
            let x = args[0]
                .as_f64()
                .ok_or_else(|| ExprError::Type("round() needs a number".to_string()))?;
            if args.len() == 2 {
                let digits = args[1]
                    .as_i64()
                    .ok_or_else(|| ExprError::Type("round() digits must be int".to_string()))?;
                let factor = 10f64.powi(digits as i32);
                Ok(num((x * factor).round() / factor))
            } else {
                Ok(Value::from(x.round() as i64))
            }
        }
        "min" | "max" => {
            let items = collect_varargs(name, args)?;
            if items.is_empty() {
                return Err(ExprError::Eval(format!("{name}() of empty sequence")));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ord = value_order(item, &best)?;
                let take = if name == "min" {
                    ord == std::cmp::Ordering::Less
                } else {
                    ord == std::cmp::Ordering::Greater
                };
                if take {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        "sum" => {
            one_arg(name, args)?;
            let items = iter_items(&args[0])?;
            let mut int_total: i64 = 0;
            let mut float_total = 0.0;
            let mut all_int = true;
            for item in &items {
                match item {
                    Value::Number(n) if n.is_i64() => {
                        int_total = int_total.wrapping_add(n.as_i64().unwrap_or(0));
                    }
                    Value::Number(n) => {
                        all_int = false;
                        float_total += n.as_f64().unwrap_or(0.0);
                    }
                    other => {
                        return Err(ExprError::Type(format!(
                            "sum() of {}",
                            type_name(other)
                        )));
                    }
                }
            }
            if all_int {
                Ok(Value::from(int_total))
            } else {
                Ok(num(int_total as f64 + float_total))
            }
        }
        "sorted" => {
            one_arg(name, args)?;
            let mut items = iter_items(&args[0])?;
            let mut sort_err = None;
            items.sort_by(|a, b| match value_order(a, b) {
                Ok(ord) => ord,
                Err(e) => {
                    sort_err.get_or_insert(e);
                    std::cmp::Ordering::Equal
                }
            });
            match sort_err {
                Some(e) => Err(e),
                None => Ok(Value::Array(items)),
            }
        }
        "list" | "tuple" => {
            one_arg(name, args)?;
            Ok(Value::Array(iter_items(&args[0])?))
        }
        "set" => {
            one_arg(name, args)?;
            let items = iter_items(&args[0])?;
            let mut out: Vec<Value> = Vec::new();
            for item in items {
                if !out.iter().any(|v| value_eq(v, &item)) {
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        "dict" => {
            one_arg(name, args)?;
            match &args[0] {
                Value::Object(_) => Ok(args[0].clone()),
                Value::Array(pairs) => {
                    let mut map = Map::new();
                    for pair in pairs {
                        let Some(kv) = pair.as_array().filter(|kv| kv.len() == 2) else {
                            return Err(ExprError::Type(
                                "dict() needs [key, value] pairs".to_string(),
                            ));
                        };
                        let key = to_display_string(&kv[0]);
                        map.insert(key, kv[1].clone());
                    }
                    Ok(Value::Object(map))
                }
                other => Err(ExprError::Type(format!("dict() of {}", type_name(other)))),
            }
        }
        "range" => {
            let (start, stop, step) = match args.len() {
                1 => (0, int_arg(name, &args[0])?, 1),
                2 => (int_arg(name, &args[0])?, int_arg(name, &args[1])?, 1),
                3 => (
                    int_arg(name, &args[0])?,
                    int_arg(name, &args[1])?,
                    int_arg(name, &args[2])?,
                ),
                _ => return Err(ExprError::Eval("range() takes 1-3 arguments".to_string())),
            };
            if step == 0 {
                return Err(ExprError::Eval("range() step cannot be zero".to_string()));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(Value::from(i));
                if out.len() > MAX_SEQUENCE {
                    return Err(ExprError::Eval("range() too large".to_string()));
                }
                i += step;
            }
            Ok(Value::Array(out))
        }
        "enumerate" => {
            one_arg(name, args)?;
            let items = iter_items(&args[0])?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| json!([i, v]))
                    .collect(),
            ))
        }
        "zip" => {
            let lists: Vec<Vec<Value>> = args
                .iter()
                .map(iter_items)
                .collect::<Result<_, _>>()?;
            let shortest = lists.iter().map(|l| l.len()).min().unwrap_or(0);
            let mut out = Vec::with_capacity(shortest);
            for i in 0..shortest {
                out.push(Value::Array(lists.iter().map(|l| l[i].clone()).collect()));
            }
            Ok(Value::Array(out))
        }
        "any" | "all" => {
            one_arg(name, args)?;
            let items = iter_items(&args[0])?;
            let result = if name == "any" {
                items.iter().any(truthy)
            } else {
                items.iter().all(truthy)
            };
            Ok(Value::Bool(result))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// `min`/`max` accept either a single iterable or varargs.
fn collect_varargs(name: &str, args: &[Value]) -> Result<Vec<Value>, ExprError> {
    match args {
        [] => Err(ExprError::Eval(format!("{name}() needs arguments"))),
        [single] => iter_items(single),
        many => Ok(many.to_vec()),
    }
}

fn one_arg(name: &str, args: &[Value]) -> Result<(), ExprError> {
    if args.len() != 1 {
        return Err(ExprError::Eval(format!(
            "{name}() takes exactly 1 argument, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> Result<i64, ExprError> {
    value
        .as_i64()
        .ok_or_else(|| ExprError::Type(format!("{name}() expects integer arguments")))
}

fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match receiver {
        Value::String(s) => string_method(s, name, args),
        Value::Object(map) => match name {
            "keys" => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            "values" => Ok(Value::Array(map.values().cloned().collect())),
            "items" => Ok(Value::Array(
                map.iter()
                    .map(|(k, v)| json!([k, v]))
                    .collect(),
            )),
            "get" => {
                let key = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ExprError::Type("get() needs a string key".to_string()))?;
                Ok(map
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Null)))
            }
            other => Err(ExprError::UnknownFunction(format!("dict.{other}"))),
        },
        Value::Array(items) => match name {
            "index" => {
                let needle = args
                    .first()
                    .ok_or_else(|| ExprError::Eval("index() needs an argument".to_string()))?;
                items
                    .iter()
                    .position(|v| value_eq(v, needle))
                    .map(|i| Value::from(i as i64))
                    .ok_or_else(|| ExprError::Eval("value not in list".to_string()))
            }
            "count" => {
                let needle = args
                    .first()
                    .ok_or_else(|| ExprError::Eval("count() needs an argument".to_string()))?;
                Ok(Value::from(
                    items.iter().filter(|v| value_eq(v, needle)).count() as i64,
                ))
            }
            other => Err(ExprError::UnknownFunction(format!("list.{other}"))),
        },
        other => Err(ExprError::Type(format!(
            "{} has no method '{name}'",
            type_name(other)
        ))),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let str_arg = |i: usize| -> Result<&str, ExprError> {
        args.get(i)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExprError::Type(format!("str.{name}: expected string argument")))
    };
    match name {
        "upper" => Ok(Value::String(s.to_uppercase())),
        "lower" => Ok(Value::String(s.to_lowercase())),
        "strip" => Ok(Value::String(s.trim().to_string())),
        "lstrip" => Ok(Value::String(s.trim_start().to_string())),
        "rstrip" => Ok(Value::String(s.trim_end().to_string())),
        "title" => Ok(Value::String(title_case(s))),
        "capitalize" => {
            let mut chars = s.chars();
            let out = match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            };
            Ok(Value::String(out))
        }
        "split" => {
            let parts: Vec<Value> = if args.is_empty() {
                s.split_whitespace()
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            } else {
                s.split(str_arg(0)?)
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        "join" => {
            let items = args
                .first()
                .and_then(|v| v.as_array())
                .ok_or_else(|| ExprError::Type("str.join: expected a list".to_string()))?;
            let parts: Result<Vec<String>, ExprError> = items
                .iter()
                .map(|v| {
                    v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        ExprError::Type("str.join: list members must be strings".to_string())
                    })
                })
                .collect();
            Ok(Value::String(parts?.join(s)))
        }
        "replace" => Ok(Value::String(s.replace(str_arg(0)?, str_arg(1)?))),
        "startswith" => Ok(Value::Bool(s.starts_with(str_arg(0)?))),
        "endswith" => Ok(Value::Bool(s.ends_with(str_arg(0)?))),
        "find" => Ok(Value::from(
            s.find(str_arg(0)?).map(|i| i as i64).unwrap_or(-1),
        )),
        "count" => Ok(Value::from(s.matches(str_arg(0)?).count() as i64)),
        other => Err(ExprError::UnknownFunction(format!("str.{other}"))),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;

    fn eval_str(input: &str, vars: &mut HashMap<String, Value>) -> Result<Value, ExprError> {
        let ast = parse(input)?;
        let mut ctx = EvalContext::new(vars, None);
        eval(&ast, &mut ctx)
    }

    fn eval_simple(input: &str) -> Value {
        let mut vars = HashMap::new();
        eval_str(input, &mut vars).unwrap()
    }

    #[test]
    fn arithmetic_keeps_ints_integral() {
        assert_eq!(eval_simple("2 + 3 * 4"), json!(14));
        assert_eq!(eval_simple("7 // 2"), json!(3));
        assert_eq!(eval_simple("2 ** 10"), json!(1024));
    }

    #[test]
    fn division_always_floats() {
        assert_eq!(eval_simple("7 / 2"), json!(3.5));
        assert_eq!(eval_simple("4 / 2"), json!(2.0));
    }

    #[test]
    fn modulo_takes_divisor_sign() {
        assert_eq!(eval_simple("-7 % 3"), json!(2));
        assert_eq!(eval_simple("7 % 3"), json!(1));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let mut vars = HashMap::new();
        assert!(matches!(
            eval_str("1 / 0", &mut vars),
            Err(ExprError::DivisionByZero)
        ));
        assert!(matches!(
            eval_str("1 % 0", &mut vars),
            Err(ExprError::DivisionByZero)
        ));
    }

    #[test]
    fn string_and_list_concatenation() {
        assert_eq!(eval_simple("'ab' + 'cd'"), json!("abcd"));
        assert_eq!(eval_simple("[1, 2] + [3]"), json!([1, 2, 3]));
        assert_eq!(eval_simple("'ab' * 3"), json!("ababab"));
    }

    #[test]
    fn chained_comparison_semantics() {
        assert_eq!(eval_simple("0 <= 5 < 10"), json!(true));
        assert_eq!(eval_simple("0 <= 15 < 10"), json!(false));
    }

    #[test]
    fn short_circuit_returns_operand_value() {
        assert_eq!(eval_simple("0 or 'fallback'"), json!("fallback"));
        assert_eq!(eval_simple("'x' and 'y'"), json!("y"));
        // Right side must not evaluate when short-circuited.
        assert_eq!(eval_simple("1 or undefined_name"), json!(1));
    }

    #[test]
    fn ternary_and_membership() {
        assert_eq!(eval_simple("'low' if 3 < 5 else 'high'"), json!("low"));
        assert_eq!(eval_simple("2 in [1, 2, 3]"), json!(true));
        assert_eq!(eval_simple("'ell' in 'hello'"), json!(true));
        assert_eq!(eval_simple("4 not in [1, 2, 3]"), json!(true));
    }

    #[test]
    fn variables_resolve_and_missing_names_error() {
        let mut vars = HashMap::new();
        vars.insert("pos".to_string(), json!(5));
        assert_eq!(eval_str("pos + 1", &mut vars).unwrap(), json!(6));
        assert!(matches!(
            eval_str("nope + 1", &mut vars),
            Err(ExprError::Undefined { .. })
        ));
    }

    #[test]
    fn comprehension_with_filter_and_scoping() {
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), json!("outer"));
        let out = eval_str("[x * x for x in range(5) if x % 2 == 1]", &mut vars).unwrap();
        assert_eq!(out, json!([1, 9]));
        // Loop variable restored after the comprehension.
        assert_eq!(vars["x"], json!("outer"));
    }

    #[test]
    fn slicing_matches_python() {
        assert_eq!(eval_simple("[0, 1, 2, 3, 4][1:3]"), json!([1, 2]));
        assert_eq!(eval_simple("[0, 1, 2, 3, 4][-2:]"), json!([3, 4]));
        assert_eq!(eval_simple("[0, 1, 2, 3, 4][::2]"), json!([0, 2, 4]));
        assert_eq!(eval_simple("[0, 1, 2, 3, 4][::-1]"), json!([4, 3, 2, 1, 0]));
        assert_eq!(eval_simple("'hello'[1:4]"), json!("ell"));
    }

    #[test]
    fn negative_indexing() {
        assert_eq!(eval_simple("[1, 2, 3][-1]"), json!(3));
        assert_eq!(eval_simple("'abc'[-1]"), json!("c"));
    }

    #[test]
    fn builtins_cover_the_contracted_set() {
        assert_eq!(eval_simple("len('hello')"), json!(5));
        assert_eq!(eval_simple("int('42')"), json!(42));
        assert_eq!(eval_simple("int(3.9)"), json!(3));
        assert_eq!(eval_simple("float('2.5')"), json!(2.5));
        assert_eq!(eval_simple("str(42)"), json!("42"));
        assert_eq!(eval_simple("bool([])"), json!(false));
        assert_eq!(eval_simple("min([3, 1, 2])"), json!(1));
        assert_eq!(eval_simple("max(3, 1, 2)"), json!(3));
        assert_eq!(eval_simple("sum([1, 2, 3])"), json!(6));
        assert_eq!(eval_simple("sum([1.5, 2.5])"), json!(4.0));
        assert_eq!(eval_simple("abs(-4)"), json!(4));
        assert_eq!(eval_simple("round(2.567, 2)"), json!(2.57));
        assert_eq!(eval_simple("sorted([3, 1, 2])"), json!([1, 2, 3]));
        assert_eq!(eval_simple("list('ab')"), json!(["a", "b"]));
        assert_eq!(eval_simple("set([1, 2, 2, 3, 1])"), json!([1, 2, 3]));
        assert_eq!(eval_simple("range(3)"), json!([0, 1, 2]));
        assert_eq!(eval_simple("range(1, 7, 2)"), json!([1, 3, 5]));
        assert_eq!(eval_simple("enumerate(['a', 'b'])"), json!([[0, "a"], [1, "b"]]));
        assert_eq!(eval_simple("zip([1, 2], ['a', 'b'])"), json!([[1, "a"], [2, "b"]]));
        assert_eq!(eval_simple("any([0, 0, 1])"), json!(true));
        assert_eq!(eval_simple("all([1, 1, 0])"), json!(false));
        assert_eq!(eval_simple("map(int, ['1', '2'])"), json!([1, 2]));
        assert_eq!(eval_simple("filter(None, [0, 1, 2, 0])"), json!([1, 2]));
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval_simple("'Hello World'.lower()"), json!("hello world"));
        assert_eq!(eval_simple("'  x  '.strip()"), json!("x"));
        assert_eq!(eval_simple("'a,b,c'.split(',')"), json!(["a", "b", "c"]));
        assert_eq!(eval_simple("'-'.join(['a', 'b'])"), json!("a-b"));
        assert_eq!(eval_simple("'abcabc'.replace('a', 'x')"), json!("xbcxbc"));
        assert_eq!(eval_simple("'hello'.startswith('he')"), json!(true));
        assert_eq!(eval_simple("'drunken sailor'.title()"), json!("Drunken Sailor"));
    }

    #[test]
    fn dict_access_and_methods() {
        let mut vars = HashMap::new();
        vars.insert("d".to_string(), json!({"a": 1, "b": 2}));
        assert_eq!(eval_str("d['a']", &mut vars).unwrap(), json!(1));
        assert_eq!(eval_str("d.get('c', 9)", &mut vars).unwrap(), json!(9));
        assert_eq!(
            eval_str("sorted(d.keys())", &mut vars).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(eval_str("'a' in d", &mut vars).unwrap(), json!(true));
    }

    #[test]
    fn range_blowup_is_guarded() {
        let mut vars = HashMap::new();
        assert!(eval_str("range(100000000)", &mut vars).is_err());
    }

    #[test]
    fn random_module_requires_rng() {
        let mut vars = HashMap::new();
        let err = eval_str("random.choice([1])", &mut vars).unwrap_err();
        assert!(err.to_string().contains("random"));
    }

    #[test]
    fn random_module_works_with_rng() {
        let ast = parse("random.choice([-1, 1])").unwrap();
        let mut vars = HashMap::new();
        let mut rng = StageRng::from_seed(3);
        let mut ctx = EvalContext::new(&mut vars, Some(&mut rng));
        let v = eval(&ast, &mut ctx).unwrap();
        assert!(v == json!(-1) || v == json!(1));
    }
}
