//! Contains functions for parsing [expressions](super::Expr), [assignments](super::Assignment)
//! and [rules](super::Rule).
//!
//! This is brought to you by [`nom`].
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, multispace0, multispace1, satisfy};
use nom::combinator::{all_consuming, eof, map, map_res, peek, recognize, value};
use nom::error::ParseError;
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::{Err, Finish, IResult};

use super::*;

/// The error kind for [`ParseExprError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
enum ParseExprErrorKind {
    /// An operator was encountered, but there were not enough operands on the stack.
    #[error("not enough operands on the stack")]
    NotEnoughOperands,

    /// More than one expression preceded a `=`.
    #[error("more than one expression on the stack in an assignment")]
    MalformedAssignment,

    /// Only one expression was expected, but multiple were parsed.
    #[error("expected exactly one expression, found several (missing operator?)")]
    TooManyExpressions,

    /// An error returned by `nom`.
    #[error("unexpected input: {}", .0.description())]
    Nom(nom::error::ErrorKind),
}

/// An error encountered while parsing expressions.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to parse `{input}`: {kind}")]
pub struct ParseExprError {
    kind: ParseExprErrorKind,

    /// The input that caused the error.
    input: String,
}

impl ParseExprError {
    fn new(kind: ParseExprErrorKind, input: &str) -> Self {
        Self {
            kind,
            input: input.to_owned(),
        }
    }
}

impl<'a> ParseError<&'a str> for ParseExprError {
    fn from_error_kind(input: &'a str, kind: nom::error::ErrorKind) -> Self {
        Self::new(ParseExprErrorKind::Nom(kind), input)
    }

    fn append(_input: &'a str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a, E> nom::error::FromExternalError<&'a str, E> for ParseExprError {
    fn from_external_error(input: &'a str, kind: nom::error::ErrorKind, _e: E) -> Self {
        Self::from_error_kind(input, kind)
    }
}

type ParseResult<'a, T> = IResult<&'a str, T, ParseExprError>;

/// Succeeds without consuming input if a token ends here.
fn token_end(input: &str) -> ParseResult<'_, ()> {
    peek(alt((value((), multispace1), value((), eof))))(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Parses a variable name of the form `$[a-zA-Z0-9_.]+`.
fn variable(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(char('$'), take_while1(is_ident_char)))(input)
}

/// Parses a constant name of the form `[a-zA-Z_.][a-zA-Z0-9_.]*`.
fn constant(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == '.'),
        take_while(is_ident_char),
    ))(input)
}

/// Parses a [register](super::Register).
pub fn register(input: &str) -> ParseResult<'_, Register> {
    alt((
        map(variable, |v| Register::Var(v.to_owned())),
        map(constant, |c| Register::Const(c.to_owned())),
    ))(input)
}

/// Parses a [register](super::Register).
///
/// It will fail if there is any input remaining afterwards.
pub fn register_complete(input: &str) -> Result<Register, ParseExprError> {
    all_consuming(register)(input).finish().map(|(_, r)| r)
}

/// Parses a [binary operator](super::BinOp).
fn bin_op(input: &str) -> ParseResult<'_, BinOp> {
    alt((
        value(BinOp::Add, char('+')),
        value(BinOp::Sub, char('-')),
        value(BinOp::Mul, char('*')),
        value(BinOp::Div, char('/')),
        value(BinOp::Mod, char('%')),
        value(BinOp::Align, char('@')),
    ))(input)
}

fn deref_op(input: &str) -> ParseResult<'_, char> {
    char('^')(input)
}

/// Parses an integer literal.
///
/// Decimal literals may be negative, in which case they wrap around. Hexadecimal literals
/// carry a `0x` prefix.
fn number<T: RegisterValue>(input: &str) -> ParseResult<'_, T> {
    alt((
        map_res(preceded(tag("0x"), hex_digit1), |hex| {
            u64::from_str_radix(hex, 16).map(T::from_u64)
        }),
        map_res(recognize(preceded(char('-'), digit1)), |dec: &str| {
            dec.parse::<i64>().map(T::from_i64)
        }),
        map_res(digit1, |dec: &str| dec.parse::<u64>().map(T::from_u64)),
    ))(input)
}

/// Parses a number or register that is followed by whitespace or the end of input.
fn base_expr<T: RegisterValue>(input: &str) -> ParseResult<'_, Expr<T>> {
    terminated(
        alt((map(number, Expr::Value), map(register, Expr::Reg))),
        token_end,
    )(input)
}

/// Recognizes the start of a rule, such as `.cfa:`, without consuming it.
fn rule_start(input: &str) -> ParseResult<'_, Register> {
    peek(terminated(register, char(':')))(input)
}

fn pop_operand<T>(
    stack: &mut Vec<Expr<T>>,
    input: &str,
) -> Result<Expr<T>, Err<ParseExprError>> {
    stack.pop().ok_or_else(|| {
        Err::Error(ParseExprError::new(
            ParseExprErrorKind::NotEnoughOperands,
            input,
        ))
    })
}

fn expr_stack_until<T: RegisterValue>(
    mut input: &str,
    stop_at_rule: bool,
) -> ParseResult<'_, Vec<Expr<T>>> {
    let mut stack = Vec::new();

    loop {
        input = multispace0::<_, ParseExprError>(input)?.0;
        if input.is_empty() || (stop_at_rule && rule_start(input).is_ok()) {
            break;
        }

        if let Ok((rest, e)) = base_expr::<T>(input) {
            stack.push(e);
            input = rest;
        } else if let Ok((rest, _)) = terminated(deref_op, token_end)(input) {
            let e = pop_operand(&mut stack, input)?;
            stack.push(Expr::Deref(Box::new(e)));
            input = rest;
        } else if let Ok((rest, op)) = terminated(bin_op, token_end)(input) {
            let e2 = pop_operand(&mut stack, input)?;
            let e1 = pop_operand(&mut stack, input)?;
            stack.push(Expr::Op(Box::new(e1), Box::new(e2), op));
            input = rest;
        } else {
            break;
        }
    }

    Ok((input, stack))
}

/// Parses a stack of [expressions](super::Expr).
///
/// Parsing stops at the first token that is not part of an expression, such as `=`.
///
/// # Example
/// ```rust
/// use symbolic_unwind::parsing::expr_stack;
/// use symbolic_unwind::BinOp::*;
/// use symbolic_unwind::Expr::*;
///
/// let (_, stack) = expr_stack::<u32>("1 2 + 3").unwrap();
/// assert_eq!(stack.len(), 2);
/// assert_eq!(stack[0], Op(Box::new(Value(1)), Box::new(Value(2)), Add));
/// assert_eq!(stack[1], Value(3));
/// ```
pub fn expr_stack<T: RegisterValue>(input: &str) -> ParseResult<'_, Vec<Expr<T>>> {
    expr_stack_until(input, false)
}

/// Reduces a parsed stack to exactly one expression.
fn single_expr<T>(
    mut stack: Vec<Expr<T>>,
    input: &str,
    too_many: ParseExprErrorKind,
) -> Result<Expr<T>, Err<ParseExprError>> {
    if stack.len() > 1 {
        return Err(Err::Error(ParseExprError::new(too_many, input)));
    }
    pop_operand(&mut stack, input)
}

/// Parses an [expression](super::Expr).
///
/// It will fail if there is any input remaining afterwards.
pub fn expr_complete<T: RegisterValue>(input: &str) -> Result<Expr<T>, ParseExprError> {
    let (rest, stack) = all_consuming(expr_stack)(input).finish()?;
    match single_expr(stack, rest, ParseExprErrorKind::TooManyExpressions) {
        Ok(expr) => Ok(expr),
        Err(Err::Error(e) | Err::Failure(e)) => Err(e),
        Err(Err::Incomplete(_)) => Err(ParseExprError::new(
            ParseExprErrorKind::NotEnoughOperands,
            input,
        )),
    }
}

/// Parses an [assignment](super::Assignment).
fn assignment<T: RegisterValue>(input: &str) -> ParseResult<'_, Assignment<T>> {
    let (input, v) = delimited(multispace0, variable, multispace0)(input)?;
    let (input, stack) = expr_stack(input)?;
    let e = single_expr(stack, input, ParseExprErrorKind::MalformedAssignment)?;
    let (rest, _) = preceded(multispace0, char::<_, ParseExprError>('='))(input)?;
    Ok((rest, Assignment(Register::Var(v.to_owned()), e)))
}

/// Parses an [assignment](super::Assignment).
///
/// It will fail if there is any input remaining afterwards.
pub fn assignment_complete<T: RegisterValue>(input: &str) -> Result<Assignment<T>, ParseExprError> {
    all_consuming(delimited(multispace0, assignment, multispace0))(input)
        .finish()
        .map(|(_, a)| a)
}

/// Parses a sequence of [assignments](super::Assignment), as found in `STACK WIN` records.
///
/// It will fail if there is any input remaining afterwards.
pub fn assignments_complete<T: RegisterValue>(
    input: &str,
) -> Result<Vec<Assignment<T>>, ParseExprError> {
    let (_, assigns) =
        all_consuming(many0(delimited(multispace0, assignment, multispace0)))(input).finish()?;
    Ok(assigns)
}

/// Parses a [rule](super::Rule) like `.cfa: $rsp 8 +`.
pub fn rule<T: RegisterValue>(input: &str) -> ParseResult<'_, Rule<T>> {
    let (input, r) = terminated(preceded(multispace0, register), char(':'))(input)?;
    let (input, stack) = expr_stack_until(input, true)?;
    let e = single_expr(stack, input, ParseExprErrorKind::TooManyExpressions)?;
    Ok((input, Rule(r, e)))
}

/// Parses a [rule](super::Rule).
///
/// It will fail if there is any input remaining afterwards.
pub fn rule_complete<T: RegisterValue>(input: &str) -> Result<Rule<T>, ParseExprError> {
    all_consuming(terminated(rule, multispace0))(input)
        .finish()
        .map(|(_, r)| r)
}

/// Parses a sequence of [rules](super::Rule), as found in `STACK CFI` records.
///
/// It will fail if there is any input remaining afterwards.
///
/// ```
/// use symbolic_unwind::parsing::rules_complete;
/// use symbolic_unwind::Register;
///
/// let rules = rules_complete::<u64>(".cfa: sp 16 + .ra: lr x29: .cfa -16 + ^").unwrap();
/// assert_eq!(rules.len(), 3);
/// assert_eq!(rules[1].0, Register::ra());
/// ```
pub fn rules_complete<T: RegisterValue>(input: &str) -> Result<Vec<Rule<T>>, ParseExprError> {
    let (_, rules) = all_consuming(terminated(many0(rule), multispace0))(input).finish()?;
    Ok(rules)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    use crate::evaluator::strategies::{arb_expr, arb_rule};

    #[test]
    fn test_expr_1() {
        use Expr::*;
        let e = Op(
            Box::new(Op(Box::new(Value(1u32)), Box::new(Value(2)), BinOp::Add)),
            Box::new(Value(3)),
            BinOp::Mul,
        );
        let (rest, parsed) = expr_stack("1 2 + 3 *").unwrap();
        assert_eq!(rest, "");
        assert_eq!(parsed, vec![e]);
    }

    #[test]
    fn test_var() {
        let (rest, parsed) = variable("$foo bar").unwrap();
        assert_eq!(rest, " bar");
        assert_eq!(parsed, "$foo");
    }

    #[test]
    fn test_expr_2() {
        use Expr::*;
        let e1 = Op(
            Box::new(Value(1u32)),
            Box::new(Deref(Box::new(Value(2)))),
            BinOp::Add,
        );
        let e2 = Op(
            Box::new(Value(3)),
            Box::new(Reg(Register::Var("$foo".into()))),
            BinOp::Mul,
        );
        let (rest, parsed) = expr_stack("1 2 ^ + 3 $foo *").unwrap();
        assert_eq!(rest, "");
        assert_eq!(parsed, vec![e1, e2]);
    }

    #[test]
    fn test_negative_and_hex_literals() {
        use Expr::*;
        let (_, parsed) = expr_stack::<u32>(".cfa -8 + 0x10 -").unwrap();
        assert_eq!(
            parsed,
            vec![Op(
                Box::new(Op(
                    Box::new(Reg(Register::cfa())),
                    Box::new(Value(0xffff_fff8)),
                    BinOp::Add
                )),
                Box::new(Value(0x10)),
                BinOp::Sub,
            )]
        );
    }

    #[test]
    fn test_expr_malformed() {
        let err = expr_stack::<u32>("3 +").finish().unwrap_err();
        assert_eq!(
            err,
            ParseExprError::new(ParseExprErrorKind::NotEnoughOperands, "+")
        );
        assert!(expr_complete::<u32>("1 2").is_err());
        assert!(expr_complete::<u32>("").is_err());
    }

    #[test]
    fn test_assignment() {
        use Expr::*;
        let e = Op(
            Box::new(Deref(Box::new(Value(4)))),
            Box::new(Value(7)),
            BinOp::Align,
        );

        let (rest, a) = assignment::<u32>("$foo 4 ^ 7 @ =").unwrap();
        assert_eq!(rest, "");
        assert_eq!(a, Assignment(Register::Var("$foo".into()), e));
    }

    #[test]
    fn test_assignment_malformed() {
        let err = assignment::<u32>("$foo 4 ^ 7 =").finish().unwrap_err();
        assert_eq!(
            err,
            ParseExprError::new(ParseExprErrorKind::MalformedAssignment, "=")
        );
    }

    #[test]
    fn test_rules() {
        let rules = rules_complete::<u64>(".cfa: $rsp 8 + .ra: .cfa -8 + ^").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].to_string(), ".cfa: $rsp 8 +");
        assert_eq!(rules[1].0, Register::ra());
        assert_eq!(
            format_rules(&rules),
            ".cfa: $rsp 8 + .ra: .cfa 18446744073709551608 + ^"
        );

        assert!(rules_complete::<u64>(".cfa: $rsp 8").is_err());
        assert!(rules_complete::<u64>(".cfa:").is_err());
    }

    proptest! {
        #[test]
        fn proptest_expr_display_roundtrip(expr in arb_expr::<u64>()) {
            let printed = expr.to_string();
            let parsed = expr_complete::<u64>(&printed).unwrap();
            prop_assert_eq!(parsed, expr);
        }

        #[test]
        fn proptest_rules_display_roundtrip(rules in prop::collection::vec(arb_rule::<u64>(), 1..5)) {
            let printed = format_rules(&rules);
            let parsed = rules_complete::<u64>(&printed).unwrap();
            prop_assert_eq!(parsed, rules);
        }

        #[test]
        fn proptest_parse_arbitrary_input_never_panics(input in "[ a-z0-9$.:+*/%@^=-]{0,40}") {
            let _ = rules_complete::<u32>(&input);
            let _ = assignments_complete::<u32>(&input);
        }
    }
}
