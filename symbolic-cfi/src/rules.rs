//! Textual handling of postfix rule programs.

use std::fmt;

/// The rules in effect at one address, keyed by register.
///
/// Rule programs are stored as text, e.g. `.cfa: $rsp 16 + .ra: .cfa -8 + ^`. A later program
/// only lists the registers whose rules changed, so applying it replaces those rules and keeps
/// all others.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RuleSet {
    rules: Vec<(String, String)>,
}

impl RuleSet {
    pub(crate) fn parse(program: &str) -> Self {
        let mut rules = Self::default();
        rules.apply(program);
        rules
    }

    /// Applies a program on top of the current rules.
    pub(crate) fn apply(&mut self, program: &str) {
        for (register, expr) in split_rules(program) {
            match self.rules.iter_mut().find(|(name, _)| name == register) {
                Some(rule) => rule.1 = expr,
                None => self.rules.push((register.to_owned(), expr)),
            }
        }
    }

    pub(crate) fn contains(&self, register: &str) -> bool {
        self.rules.iter().any(|(name, _)| name == register)
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (register, expr)) in self.rules.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{register}: {expr}")?;
        }
        Ok(())
    }
}

/// Splits a program into `(register, expression)` pairs.
///
/// A token ending in `:` starts a new rule. Tokens before the first rule are dropped.
fn split_rules(program: &str) -> Vec<(&str, String)> {
    let mut rules: Vec<(&str, String)> = Vec::new();

    for token in program.split_whitespace() {
        match token.strip_suffix(':') {
            Some(register) if !register.is_empty() => rules.push((register, String::new())),
            _ => {
                if let Some((_, expr)) = rules.last_mut() {
                    if !expr.is_empty() {
                        expr.push(' ');
                    }
                    expr.push_str(token);
                }
            }
        }
    }

    rules
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_apply_replaces_changed_rules() {
        let mut rules = RuleSet::parse(".cfa: $rsp 8 + .ra: .cfa -8 + ^");
        rules.apply(".cfa: $rsp 16 +  $rbp: .cfa -16 + ^");

        assert_eq!(
            rules.to_string(),
            ".cfa: $rsp 16 + .ra: .cfa -8 + ^ $rbp: .cfa -16 + ^"
        );
        assert!(rules.contains("$rbp"));
        assert!(!rules.contains("$rbx"));
    }

    #[test]
    fn test_arm_registers() {
        let rules = RuleSet::parse(".cfa: sp 16 + .ra: lr x29: .cfa -16 + ^");
        assert_eq!(rules.to_string(), ".cfa: sp 16 + .ra: lr x29: .cfa -16 + ^");
    }

    #[test]
    fn test_leading_garbage() {
        assert_eq!(RuleSet::parse("8 + .cfa: $esp 4 +").to_string(), ".cfa: $esp 4 +");
        assert_eq!(RuleSet::parse("").to_string(), "");
    }
}
