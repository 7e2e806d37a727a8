//! Sandboxed expression evaluator for `Expression` field mappings.
//!
//! The grammar exposes exactly `value`, the declared row fields, literals,
//! arithmetic/comparison/boolean operators and a fixed builtin set. There is
//! no host-language escape hatch: unknown identifiers and unknown functions
//! are errors at evaluation time.
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := cmp ("and" cmp)*
//! cmp     := add (("==" | "!=" | "<=" | ">=" | "<" | ">") add)?
//! add     := mul (("+" | "-") mul)*
//! mul     := unary (("*" | "/") unary)*
//! unary   := "-" unary | "not" unary | primary
//! primary := number | string | "null" | "true" | "false"
//!          | ident "(" args ")" | ident | "(" expr ")"
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, none_of},
    combinator::{map, map_res, opt, recognize, verify},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::core::{Record, Value};
use crate::error::{MigrateError, Result};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// A compiled, reusable expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse an expression, rejecting trailing garbage.
    pub fn compile(source: &str) -> Result<Self> {
        let (rest, ast) = parse_expr(source)
            .map_err(|e| MigrateError::Expression(format!("parse failed: {e}")))?;
        if !rest.trim().is_empty() {
            return Err(MigrateError::Expression(format!(
                "unexpected trailing input: '{}'",
                rest.trim()
            )));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// Original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the current field value and its row.
    pub fn eval(&self, value: &Value, row: &Record) -> Result<Value> {
        eval(&self.ast, value, row)
    }
}

// ===== Parser =====

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn parse_expr(input: &str) -> IResult<&str, Expr> {
    parse_or(input)
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(preceded(ws(keyword("or")), parse_and))(input)?;
    Ok((input, fold_binary(first, BinOp::Or, rest)))
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_cmp(input)?;
    let (input, rest) = many0(preceded(ws(keyword("and")), parse_cmp))(input)?;
    Ok((input, fold_binary(first, BinOp::And, rest)))
}

fn parse_cmp(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_add(input)?;
    let (input, tail) = opt(pair(
        ws(alt((
            map(tag("=="), |_| BinOp::Eq),
            map(tag("!="), |_| BinOp::Ne),
            map(tag("<="), |_| BinOp::Le),
            map(tag(">="), |_| BinOp::Ge),
            map(tag("<"), |_| BinOp::Lt),
            map(tag(">"), |_| BinOp::Gt),
        ))),
        parse_add,
    ))(input)?;
    Ok(match tail {
        Some((op, rhs)) => (input, Expr::Binary(op, Box::new(first), Box::new(rhs))),
        None => (input, first),
    })
}

fn parse_add(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_mul(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            map(char('+'), |_| BinOp::Add),
            map(char('-'), |_| BinOp::Sub),
        ))),
        parse_mul,
    ))(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |lhs, (op, rhs)| {
            Expr::Binary(op, Box::new(lhs), Box::new(rhs))
        }),
    ))
}

fn parse_mul(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            map(char('*'), |_| BinOp::Mul),
            map(char('/'), |_| BinOp::Div),
        ))),
        parse_unary,
    ))(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |lhs, (op, rhs)| {
            Expr::Binary(op, Box::new(lhs), Box::new(rhs))
        }),
    ))
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('-')), parse_unary), |e| {
            Expr::Neg(Box::new(e))
        }),
        map(preceded(ws(keyword("not")), parse_unary), |e| {
            Expr::Not(Box::new(e))
        }),
        parse_primary,
    ))(input)
}

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        parse_number,
        parse_string,
        map(keyword("null"), |_| Expr::Literal(Value::Null)),
        map(keyword("true"), |_| Expr::Literal(Value::Bool(true))),
        map(keyword("false"), |_| Expr::Literal(Value::Bool(false))),
        parse_call,
        parse_ident,
        delimited(char('('), parse_expr, preceded(multispace0, char(')'))),
    )))(input)
}

fn parse_number(input: &str) -> IResult<&str, Expr> {
    // Literals that do not fit their type are a parse failure, not zero.
    map_res(
        recognize(tuple((digit1, opt(pair(char('.'), digit1))))),
        |text: &str| -> std::result::Result<Expr, ()> {
            if text.contains('.') {
                text.parse()
                    .map(|f| Expr::Literal(Value::Float(f)))
                    .map_err(|_| ())
            } else {
                text.parse()
                    .map(|i| Expr::Literal(Value::Int(i)))
                    .map_err(|_| ())
            }
        },
    )(input)
}

fn parse_string(input: &str) -> IResult<&str, Expr> {
    map(
        alt((
            delimited(char('\''), recognize(many0(none_of("'"))), char('\'')),
            delimited(char('"'), recognize(many0(none_of("\""))), char('"')),
        )),
        |s: &str| Expr::Literal(Value::Text(s.to_string())),
    )(input)
}

fn ident_str(input: &str) -> IResult<&str, &str> {
    verify(
        recognize(pair(
            take_while(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
        |s: &str| {
            !s.is_empty()
                && s.chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic() || c == '_')
                    .unwrap_or(false)
        },
    )(input)
}

/// Match a bare keyword, refusing to split a longer identifier.
fn keyword(word: &'static str) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (rest, matched) = tag(word)(input)?;
        if rest
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric() || c == '_')
            .unwrap_or(false)
        {
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        } else {
            Ok((rest, matched))
        }
    }
}

fn parse_call(input: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            ident_str,
            preceded(multispace0, char('(')),
            separated_list0(ws(char(',')), parse_expr),
            preceded(multispace0, char(')')),
        )),
        |(name, _, args, _)| Expr::Call(name.to_string(), args),
    )(input)
}

fn parse_ident(input: &str) -> IResult<&str, Expr> {
    map(ident_str, |s| Expr::Ident(s.to_string()))(input)
}

fn fold_binary(first: Expr, op: BinOp, rest: Vec<Expr>) -> Expr {
    rest.into_iter()
        .fold(first, |lhs, rhs| Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
}

// ===== Evaluator =====

fn eval(expr: &Expr, value: &Value, row: &Record) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => {
            if name == "value" {
                Ok(value.clone())
            } else if let Some(v) = row.get(name) {
                Ok(v.clone())
            } else {
                Err(MigrateError::Expression(format!(
                    "unknown identifier '{name}' (only 'value' and row fields are visible)"
                )))
            }
        }
        Expr::Neg(inner) => match eval(inner, value, row)? {
            Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| {
                MigrateError::Expression("integer overflow in negation".into())
            }),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(MigrateError::Expression(format!(
                "cannot negate '{other}'"
            ))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, value, row)?.is_truthy())),
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, value, row)?;
            // Short-circuit boolean operators.
            match op {
                BinOp::And => {
                    return if !l.is_truthy() {
                        Ok(Value::Bool(false))
                    } else {
                        Ok(Value::Bool(eval(rhs, value, row)?.is_truthy()))
                    };
                }
                BinOp::Or => {
                    return if l.is_truthy() {
                        Ok(Value::Bool(true))
                    } else {
                        Ok(Value::Bool(eval(rhs, value, row)?.is_truthy()))
                    };
                }
                _ => {}
            }
            let r = eval(rhs, value, row)?;
            eval_binary(*op, l, r)
        }
        Expr::Call(name, args) => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, value, row)?);
            }
            eval_call(name, evaluated)
        }
    }
}

fn eval_binary(op: BinOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinOp::Add => {
            if matches!(l, Value::Text(_)) || matches!(r, Value::Text(_)) {
                return Ok(Value::Text(format!("{}{}", l.to_text(), r.to_text())));
            }
            numeric_op(op, l, r)
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div => numeric_op(op, l, r),
        BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&l, &r)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::And | BinOp::Or => unreachable!("handled in eval"),
    }
}

fn numeric_op(op: BinOp, l: Value, r: Value) -> Result<Value> {
    let (lf, rf) = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(MigrateError::Expression(format!(
                "arithmetic needs numeric operands, got '{l}' and '{r}'"
            )))
        }
    };

    if op == BinOp::Div {
        if rf == 0.0 {
            return Err(MigrateError::Expression("division by zero".into()));
        }
        return Ok(Value::Float(lf / rf));
    }

    // Integer arithmetic stays integral.
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let result = match op {
            BinOp::Add => a.checked_add(*b),
            BinOp::Sub => a.checked_sub(*b),
            BinOp::Mul => a.checked_mul(*b),
            _ => unreachable!(),
        };
        return result.map(Value::Int).ok_or_else(|| {
            MigrateError::Expression(format!(
                "integer overflow evaluating '{l}' and '{r}'"
            ))
        });
    }

    Ok(Value::Float(match op {
        BinOp::Add => lf + rf,
        BinOp::Sub => lf - rf,
        BinOp::Mul => lf * rf,
        _ => unreachable!(),
    }))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) if !matches!(l, Value::Text(_)) || !matches!(r, Value::Text(_)) => {
            a == b
        }
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a.partial_cmp(&b).ok_or_else(|| {
            MigrateError::Expression("incomparable numeric values".into())
        });
    }
    Ok(l.to_text().cmp(&r.to_text()))
}

fn eval_call(name: &str, mut args: Vec<Value>) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() != n {
            Err(MigrateError::Expression(format!(
                "{name}() expects {n} argument(s), got {}",
                args.len()
            )))
        } else {
            Ok(())
        }
    };

    match name {
        "upper" => {
            arity(1)?;
            Ok(Value::Text(args[0].to_text().to_uppercase()))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::Text(args[0].to_text().to_lowercase()))
        }
        "trim" => {
            arity(1)?;
            Ok(Value::Text(args[0].to_text().trim().to_string()))
        }
        "len" => {
            arity(1)?;
            Ok(Value::Int(args[0].to_text().chars().count() as i64))
        }
        "concat" => Ok(Value::Text(
            args.iter().map(Value::to_text).collect::<String>(),
        )),
        "coalesce" => Ok(args
            .drain(..)
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null)),
        "if" => {
            arity(3)?;
            let cond = args.remove(0);
            let then = args.remove(0);
            let otherwise = args.remove(0);
            Ok(if cond.is_truthy() { then } else { otherwise })
        }
        other => Err(MigrateError::Expression(format!(
            "unknown function '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Record {
        let mut r = Record::new();
        r.insert("first_name".into(), Value::Text("Ada".into()));
        r.insert("last_name".into(), Value::Text("Lovelace".into()));
        r.insert("qty".into(), Value::Int(3));
        r.insert("price".into(), Value::Float(2.5));
        r
    }

    fn eval_src(src: &str, value: Value) -> Result<Value> {
        Expression::compile(src)?.eval(&value, &row())
    }

    #[test]
    fn test_value_passthrough() {
        assert_eq!(eval_src("value", Value::Int(7)).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_src("qty * 2 + 1", Value::Null).unwrap(), Value::Int(7));
        assert_eq!(
            eval_src("qty * price", Value::Null).unwrap(),
            Value::Float(7.5)
        );
        assert!(eval_src("qty / 0", Value::Null).is_err());
    }

    #[test]
    fn test_string_concat_and_builtins() {
        assert_eq!(
            eval_src("first_name + ' ' + last_name", Value::Null).unwrap(),
            Value::Text("Ada Lovelace".into())
        );
        assert_eq!(
            eval_src("upper(concat(first_name, last_name))", Value::Null).unwrap(),
            Value::Text("ADALOVELACE".into())
        );
        assert_eq!(eval_src("len(first_name)", Value::Null).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_comparison_and_conditional() {
        assert_eq!(
            eval_src("if(qty > 2, 'bulk', 'single')", Value::Null).unwrap(),
            Value::Text("bulk".into())
        );
        assert_eq!(
            eval_src("qty >= 3 and price < 3", Value::Null).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_src("not (qty == 3)", Value::Null).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_coalesce_null_handling() {
        assert_eq!(
            eval_src("coalesce(value, 'fallback')", Value::Null).unwrap(),
            Value::Text("fallback".into())
        );
        assert_eq!(
            eval_src("coalesce(value, 'fallback')", Value::Int(1)).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn test_unknown_identifier_rejected() {
        assert!(eval_src("secret_env", Value::Null).is_err());
        assert!(eval_src("open('/etc/passwd')", Value::Null).is_err());
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        // A literal too large for i64 fails to compile.
        assert!(Expression::compile("99999999999999999999").is_err());

        let max = i64::MAX;
        assert!(eval_src(&format!("{max} + 1"), Value::Null).is_err());
        assert!(eval_src(&format!("{max} * 2"), Value::Null).is_err());
        assert!(eval_src(&format!("-2 * {max} - 2"), Value::Null).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(Expression::compile("value value").is_err());
        assert!(Expression::compile("1 +").is_err());
    }

    #[test]
    fn test_keywords_not_split_from_identifiers() {
        // A field literally named "orders" must not parse as "or" + "ders".
        let mut r = Record::new();
        r.insert("orders".into(), Value::Int(2));
        let v = Expression::compile("orders + 1")
            .unwrap()
            .eval(&Value::Null, &r)
            .unwrap();
        assert_eq!(v, Value::Int(3));
    }
}
