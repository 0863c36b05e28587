//! Evaluation of Breakpad [RPN](https://en.wikipedia.org/wiki/Reverse_Polish_notation)
//! expressions.
//!
//! These expressions are defined by the following
//! [BNF](https://en.wikipedia.org/wiki/Backus%E2%80%93Naur_form) grammar:
//! ```text
//! <rule>       ::=  <register>: <expr>
//! <assignment> ::=  <variable> <expr> =
//! <expr>       ::=  <register> | <literal> | <expr> <expr> <binop> | <expr> ^
//! <register>   ::=  <constant> | <variable>
//! <constant>   ::=  [a-zA-Z_.][a-zA-Z0-9_.]*
//! <variable>   ::=  $[a-zA-Z0-9_.]+
//! <binop>      ::=  + | - | * | / | % | @
//! <literal>    ::=  -?[0-9]+ | 0x[0-9a-fA-F]+
//! ```
//! The symbol `^` dereferences its operand: `x ^` reads the machine word stored at address `x`
//! in the evaluator's memory. `@` aligns its first operand down to a multiple of the second.
//!
//! Breakpad `STACK CFI` records contain sequences of rules, `STACK WIN` program strings contain
//! sequences of assignments. Both are parsed by the functions in [`parsing`].
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use super::base::{Endianness, MemoryRegion, RegisterValue};
use parsing::ParseExprError;

pub mod parsing;
#[cfg(test)]
mod strategies;

/// Encapsulates the information necessary to evaluate postfix expressions.
///
/// It is generic over the register value type, which is also used for pointers into `memory`,
/// and the [`Endianness`] used to read values from memory.
pub struct Evaluator<'memory, A, E> {
    /// Stack memory of the frame. Dereferencing fails if this is `None`.
    memory: Option<MemoryRegion<'memory>>,

    /// The values of registers. Using a register that is not in this map fails evaluation.
    registers: BTreeMap<Register, A>,

    endian: E,
}

impl<'memory, A, E> Evaluator<'memory, A, E> {
    /// Creates an evaluator with the given endianness, no memory, and no registers.
    pub fn new(endian: E) -> Self {
        Self {
            memory: None,
            registers: BTreeMap::new(),
            endian,
        }
    }

    /// Sets the memory that dereferences read from.
    pub fn memory(mut self, memory: MemoryRegion<'memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Sets the register map to the given map.
    pub fn registers(mut self, registers: BTreeMap<Register, A>) -> Self {
        self.registers = registers;
        self
    }

    /// Returns the current register values.
    pub fn register_values(&self) -> &BTreeMap<Register, A> {
        &self.registers
    }
}

impl<'memory, A: RegisterValue, E: Endianness> Evaluator<'memory, A, E> {
    /// Evaluates a single expression.
    ///
    /// This fails if the expression dereferences unavailable memory, uses undefined registers,
    /// or divides by zero.
    pub fn evaluate(&self, expr: &Expr<A>) -> Result<A, EvaluationError> {
        self.evaluate_with(expr, &self.registers)
    }

    fn evaluate_with(
        &self,
        expr: &Expr<A>,
        registers: &BTreeMap<Register, A>,
    ) -> Result<A, EvaluationError> {
        match expr {
            Expr::Value(x) => Ok(*x),
            Expr::Reg(register) => registers
                .get(register)
                .copied()
                .ok_or_else(|| EvaluationError::UndefinedRegister(register.clone())),
            Expr::Op(e1, e2, op) => {
                let e1 = self.evaluate_with(e1, registers)?;
                let e2 = self.evaluate_with(e2, registers)?;
                match op {
                    BinOp::Add => Ok(e1.add(e2)),
                    BinOp::Sub => Ok(e1.sub(e2)),
                    BinOp::Mul => Ok(e1.mul(e2)),
                    BinOp::Div => e1.div(e2).ok_or(EvaluationError::DivisionByZero),
                    BinOp::Mod => e1.rem(e2).ok_or(EvaluationError::DivisionByZero),
                    BinOp::Align => e1
                        .div(e2)
                        .map(|quotient| quotient.mul(e2))
                        .ok_or(EvaluationError::DivisionByZero),
                }
            }
            Expr::Deref(address) => {
                let address = self.evaluate_with(address, registers)?.into_u64();
                let memory = self
                    .memory
                    .as_ref()
                    .ok_or(EvaluationError::MemoryUnavailable)?;
                memory
                    .get(address, self.endian)
                    .ok_or(EvaluationError::IllegalMemoryAccess {
                        address,
                        bytes: A::WIDTH,
                        address_range: memory.base_addr..memory.end_addr(),
                    })
            }
        }
    }

    /// Performs an assignment by evaluating its right-hand side and storing the result.
    ///
    /// Returns `true` if the assignment overwrote an existing register.
    pub fn assign(&mut self, Assignment(v, e): &Assignment<A>) -> Result<bool, EvaluationError> {
        let value = self.evaluate(e)?;
        Ok(self.registers.insert(v.clone(), value).is_some())
    }

    /// Processes a string of assignments, modifying the registers accordingly.
    ///
    /// Returns the set of registers that were assigned, even if their values did not change.
    ///
    /// # Example
    /// ```
    /// use std::collections::BTreeMap;
    /// use symbolic_unwind::{BigEndian, Evaluator, Register};
    ///
    /// let foo = Register::from_name("$foo");
    /// let bar = Register::from_name("$bar");
    /// let mut registers = BTreeMap::new();
    /// registers.insert(bar.clone(), 17u32);
    /// let mut evaluator = Evaluator::new(BigEndian).registers(registers);
    ///
    /// let changed = evaluator.process("$foo $bar 5 + = $bar 17 =").unwrap();
    ///
    /// assert_eq!(changed, [foo.clone(), bar].into_iter().collect());
    /// assert_eq!(evaluator.register_values()[&foo], 22);
    /// ```
    pub fn process(&mut self, input: &str) -> Result<BTreeSet<Register>, ExpressionError> {
        let mut changed = BTreeSet::new();
        for assignment in parsing::assignments_complete::<A>(input)? {
            self.assign(&assignment)?;
            changed.insert(assignment.0);
        }

        Ok(changed)
    }

    /// Evaluates a set of `STACK CFI` rules and returns the caller's registers.
    ///
    /// The `.cfa` rule is evaluated first, against the callee's registers. All other rules are
    /// then evaluated with `.cfa` bound to that value. The result contains `.cfa` and one entry
    /// per rule. Registers without a rule are not part of the result.
    pub fn evaluate_rules(
        &self,
        rules: &[Rule<A>],
    ) -> Result<BTreeMap<Register, A>, EvaluationError> {
        let cfa_register = Register::cfa();
        let cfa_rule = rules
            .iter()
            .find(|rule| rule.0 == cfa_register)
            .ok_or(EvaluationError::MissingCfa)?;
        let cfa = self.evaluate(&cfa_rule.1)?;

        let mut callee = self.registers.clone();
        callee.insert(cfa_register.clone(), cfa);

        let mut caller = BTreeMap::new();
        caller.insert(cfa_register, cfa);
        for Rule(register, expr) in rules {
            if !caller.contains_key(register) {
                caller.insert(register.clone(), self.evaluate_with(expr, &callee)?);
            }
        }

        Ok(caller)
    }
}

/// An error encountered while evaluating an expression.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The expression contains an undefined register name.
    #[error("register {0} is not defined")]
    UndefinedRegister(Register),

    /// The expression contains a dereference, but the evaluator does not have access to memory.
    #[error("the evaluator does not have access to memory")]
    MemoryUnavailable,

    /// The requested piece of memory exceeds the bounds of the memory region.
    #[error(
        "tried to read {bytes} bytes at address {address:#x}, available range is \
         [{:#x}, {:#x})", .address_range.start, .address_range.end
    )]
    IllegalMemoryAccess {
        /// The address at which the read was attempted.
        address: u64,
        /// The number of bytes that were tried to read.
        bytes: usize,
        /// The range of available addresses.
        address_range: Range<u64>,
    },

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// A rule set without a `.cfa` rule.
    #[error("no rule for the canonical frame address")]
    MissingCfa,
}

/// An error encountered while parsing or evaluating an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    /// An error was encountered while parsing an expression.
    #[error("error while parsing")]
    Parsing(#[from] ParseExprError),

    /// An error was encountered while evaluating an expression.
    #[error("error while evaluating")]
    Evaluation(#[from] EvaluationError),
}

/// A register.
///
/// Registers come in two flavors: "constants" and "variables". Names of variables begin with
/// `$`. The pseudo registers `.cfa` and `.ra` are constants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    /// A variable, such as `$rsp` or `$T0`.
    Var(String),

    /// A constant, such as `sp` or `.cfa`.
    Const(String),
}

impl Register {
    /// Creates a register from its name, choosing the flavor by the `$` prefix.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with('$') {
            Self::Var(name.to_owned())
        } else {
            Self::Const(name.to_owned())
        }
    }

    /// Returns the `CFA` (Canonical Frame Address) register, called `.cfa`.
    pub fn cfa() -> Self {
        Self::Const(".cfa".to_string())
    }

    /// Returns the `RA` (Return Address) register, called `.ra`.
    pub fn ra() -> Self {
        Self::Const(".ra".to_string())
    }

    /// Returns the full name of this register, including a `$` prefix for variables.
    pub fn name(&self) -> &str {
        match self {
            Self::Var(name) | Self::Const(name) => name,
        }
    }

    /// Returns true if this is a variable register, that is, if its name begins with `$`.
    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Var(_))
    }

    /// Returns true if this is one of the pseudo registers `.cfa` or `.ra`.
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Self::Const(name) if name == ".cfa" || name == ".ra")
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::register_complete(input)
    }
}

/// A binary operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,

    /// Subtraction.
    Sub,

    /// Multiplication.
    Mul,

    /// Division.
    Div,

    /// Remainder.
    Mod,

    /// Alignment.
    ///
    /// Truncates the first operand to a multiple of the second operand.
    Align,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Align => "@",
        })
    }
}

/// An expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr<T> {
    /// A base value.
    Value(T),

    /// A register name.
    Reg(Register),

    /// An expression `a b §`, where `§` is a [binary operator](BinOp).
    Op(Box<Expr<T>>, Box<Expr<T>>, BinOp),

    /// A dereferenced subexpression.
    Deref(Box<Expr<T>>),
}

impl<T: fmt::Display> fmt::Display for Expr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Value(n) => write!(f, "{n}"),
            Self::Reg(i) => write!(f, "{i}"),
            Self::Op(x, y, op) => write!(f, "{x} {y} {op}"),
            Self::Deref(x) => write!(f, "{x} ^"),
        }
    }
}

impl<T: RegisterValue> FromStr for Expr<T> {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::expr_complete(input)
    }
}

/// An assignment `v e =` where `v` is a [variable register](Register) and `e` is an
/// [expression](Expr).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment<T>(Register, Expr<T>);

impl<T> Assignment<T> {
    /// Creates a new assignment.
    ///
    /// Returns `None` if `variable` is not a variable register.
    pub fn new(variable: Register, expr: Expr<T>) -> Option<Self> {
        variable.is_variable().then_some(Self(variable, expr))
    }
}

impl<T: fmt::Display> fmt::Display for Assignment<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} =", self.0, self.1)
    }
}

impl<T: RegisterValue> FromStr for Assignment<T> {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::assignment_complete(input)
    }
}

/// A `STACK CFI` rule `reg: e`, where `reg` is a [register](Register) and `e` is an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule<A>(pub Register, pub Expr<A>);

impl<A: fmt::Display> fmt::Display for Rule<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}

/// Formats a list of rules as a single program, as found in `STACK CFI` records.
pub fn format_rules<A: fmt::Display>(rules: &[Rule<A>]) -> String {
    let mut program = String::new();
    for rule in rules {
        if !program.is_empty() {
            program.push(' ');
        }
        program.push_str(&rule.to_string());
    }
    program
}

/// These tests are inspired by the Breakpad PostfixEvaluator unit tests:
/// [https://github.com/google/breakpad/blob/main/src/processor/postfix_evaluator_unittest.cc]
#[cfg(test)]
mod test {
    use super::*;
    use crate::base::{BigEndian, LittleEndian};
    use proptest::prelude::*;

    #[test]
    fn test_assignment() {
        let input = "$rAdd3 2 2 + =$rMul2 9 6 * =";

        let mut eval = Evaluator::<u64, _>::new(BigEndian);
        let r_add3 = Register::from_name("$rAdd3");
        let r_mul2 = Register::from_name("$rMul2");

        let changed_vars = eval.process(input).unwrap();

        assert_eq!(
            changed_vars,
            vec![r_add3.clone(), r_mul2.clone()].into_iter().collect()
        );

        assert_eq!(eval.registers[&r_add3], 4);
        assert_eq!(eval.registers[&r_mul2], 54);
    }

    #[test]
    fn test_deref() {
        let memory = MemoryRegion {
            base_addr: 9,
            contents: &[0, 0, 0, 0, 0, 0, 0, 10],
        };

        let mut eval = Evaluator::<u64, _>::new(BigEndian).memory(memory);
        let r_deref = Register::from_name("$rDeref");

        let changed_vars = eval.process("$rDeref 9 ^ =").unwrap();

        assert_eq!(changed_vars, vec![r_deref.clone()].into_iter().collect());
        assert_eq!(eval.registers[&r_deref], 10);
    }

    #[test]
    fn test_division_by_zero() {
        let eval = Evaluator::<u32, _>::new(LittleEndian);
        let expr = "4 0 /".parse::<Expr<u32>>().unwrap();
        assert!(matches!(
            eval.evaluate(&expr),
            Err(EvaluationError::DivisionByZero)
        ));

        let expr = "4 0 @".parse::<Expr<u32>>().unwrap();
        assert!(eval.evaluate(&expr).is_err());
    }

    #[test]
    fn test_rules_use_cfa() {
        // x86_64 frame after `push rbp; mov rbp, rsp`.
        let rules = parsing::rules_complete::<u64>(
            ".cfa: $rbp 16 + .ra: .cfa -8 + ^ $rbp: .cfa -16 + ^",
        )
        .unwrap();

        let mut stack = Vec::new();
        stack.extend_from_slice(&0x7f00u64.to_le_bytes()); // saved rbp
        stack.extend_from_slice(&0x4242u64.to_le_bytes()); // return address

        let mut registers = BTreeMap::new();
        registers.insert(Register::from_name("$rbp"), 0x1000u64);
        registers.insert(Register::from_name("$rsp"), 0x0ff0u64);

        let eval = Evaluator::new(LittleEndian)
            .memory(MemoryRegion {
                base_addr: 0x1000,
                contents: &stack,
            })
            .registers(registers);

        let caller = eval.evaluate_rules(&rules).unwrap();
        assert_eq!(caller[&Register::cfa()], 0x1010);
        assert_eq!(caller[&Register::ra()], 0x4242);
        assert_eq!(caller[&Register::from_name("$rbp")], 0x7f00);
        assert_eq!(caller.len(), 3);
    }

    #[test]
    fn test_rules_without_cfa() {
        let rules = parsing::rules_complete::<u64>(".ra: lr").unwrap();
        let eval = Evaluator::<u64, _>::new(LittleEndian);
        assert!(matches!(
            eval.evaluate_rules(&rules),
            Err(EvaluationError::MissingCfa)
        ));
    }

    proptest! {
        #[test]
        fn proptest_evaluate_never_panics(expr in strategies::arb_expr::<u32>()) {
            let memory = MemoryRegion { base_addr: 0, contents: &[0xab; 64] };
            let mut registers = BTreeMap::new();
            registers.insert(Register::from_name("$x"), 3u32);
            let eval = Evaluator::new(LittleEndian).memory(memory).registers(registers);
            let _ = eval.evaluate(&expr);
        }
    }
}
