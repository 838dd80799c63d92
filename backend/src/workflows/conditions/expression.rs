//! Recursive descent parser for composite condition expressions.
//!
//! Grammar (keywords are case-insensitive, NOT binds tighter than AND, AND
//! tighter than OR):
//!
//! ```text
//! or      := and ("OR" and)*
//! and     := not ("AND" not)*
//! not     := "NOT" not | primary
//! primary := "(" or ")" | name "(" argument ")"
//! ```
//!
//! An argument is either quoted (`'..'` or `".."`) or bare text up to the
//! closing parenthesis.
//!
//! Nesting of `NOT` and parentheses is capped at [`MAX_DEPTH`] and an
//! expression holds at most [`MAX_LEAVES`] conditions, which bounds the
//! recursion of both the parser and the tree walks.

use super::super::predicate::Predicate;

pub const MAX_DEPTH: usize = 64;
pub const MAX_LEAVES: usize = 256;

/// Error during parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    /// Character offset into the input
    pub position: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

/// Boolean tree over leaves of type `L`
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<L> {
    Leaf(L),
    And(Box<Expr<L>>, Box<Expr<L>>),
    Or(Box<Expr<L>>, Box<Expr<L>>),
    Not(Box<Expr<L>>),
}

/// Unresolved leaf as written, e.g. `has-role(admin)`
#[derive(Debug, Clone, PartialEq)]
pub struct LeafCall {
    pub name: String,
    pub argument: String,
    pub position: usize,
}

impl<L> Expr<L> {
    pub fn try_map<M, E>(&self, f: &mut impl FnMut(&L) -> Result<M, E>) -> Result<Expr<M>, E> {
        Ok(match self {
            Expr::Leaf(leaf) => Expr::Leaf(f(leaf)?),
            Expr::And(l, r) => Expr::And(Box::new(l.try_map(f)?), Box::new(r.try_map(f)?)),
            Expr::Or(l, r) => Expr::Or(Box::new(l.try_map(f)?), Box::new(r.try_map(f)?)),
            Expr::Not(inner) => Expr::Not(Box::new(inner.try_map(f)?)),
        })
    }

    pub fn leaves(&self) -> Vec<&L> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a L>) {
        match self {
            Expr::Leaf(leaf) => out.push(leaf),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_leaves(out);
                r.collect_leaves(out);
            }
            Expr::Not(inner) => inner.collect_leaves(out),
        }
    }

    pub fn evaluate(&self, leaf: &impl Fn(&L) -> bool) -> bool {
        match self {
            Expr::Leaf(l) => leaf(l),
            Expr::And(l, r) => l.evaluate(leaf) && r.evaluate(leaf),
            Expr::Or(l, r) => l.evaluate(leaf) || r.evaluate(leaf),
            Expr::Not(inner) => !inner.evaluate(leaf),
        }
    }

    /// Builds an n-ary predicate tree; chains of the same connective are flattened.
    pub fn to_predicate(&self, leaf: &impl Fn(&L) -> Predicate) -> Predicate {
        match self {
            Expr::Leaf(l) => leaf(l),
            Expr::And(..) => {
                let mut items = Vec::new();
                self.flatten_and(leaf, &mut items);
                Predicate::And(items)
            }
            Expr::Or(..) => {
                let mut items = Vec::new();
                self.flatten_or(leaf, &mut items);
                Predicate::Or(items)
            }
            Expr::Not(inner) => Predicate::negate(inner.to_predicate(leaf)),
        }
    }

    fn flatten_and(&self, leaf: &impl Fn(&L) -> Predicate, out: &mut Vec<Predicate>) {
        match self {
            Expr::And(l, r) => {
                l.flatten_and(leaf, out);
                r.flatten_and(leaf, out);
            }
            other => out.push(other.to_predicate(leaf)),
        }
    }

    fn flatten_or(&self, leaf: &impl Fn(&L) -> Predicate, out: &mut Vec<Predicate>) {
        match self {
            Expr::Or(l, r) => {
                l.flatten_or(leaf, out);
                r.flatten_or(leaf, out);
            }
            other => out.push(other.to_predicate(leaf)),
        }
    }
}

pub fn parse(input: &str) -> Result<Expr<LeafCall>, ParseError> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        position: 0,
        depth: 0,
        leaves: 0,
    };

    let expr = parser.parse_or()?;
    parser.skip_whitespace();
    if !parser.is_at_end() {
        return Err(parser.error(format!("Unexpected '{}' after expression", parser.chars[parser.position])));
    }

    Ok(expr)
}

struct Parser {
    chars: Vec<char>,
    position: usize,
    depth: usize,
    leaves: usize,
}

impl Parser {
    fn parse_or(&mut self) -> Result<Expr<LeafCall>, ParseError> {
        let mut left = self.parse_and()?;

        while self.match_keyword("OR") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr<LeafCall>, ParseError> {
        let mut left = self.parse_not()?;

        while self.match_keyword("AND") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr<LeafCall>, ParseError> {
        if self.match_keyword("NOT") {
            self.descend()?;
            let expr = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(expr)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr<LeafCall>, ParseError> {
        self.skip_whitespace();

        if self.match_char('(') {
            self.descend()?;
            let expr = self.parse_or()?;
            self.skip_whitespace();
            self.expect_char(')')?;
            self.depth -= 1;
            return Ok(expr);
        }

        let start = self.position;
        let name = self.take_while(is_name_char);
        if name.is_empty() {
            return Err(match self.peek() {
                Some(c) => self.error(format!("Expected condition, found '{}'", c)),
                None => self.error("Expected condition, found end of input"),
            });
        }

        self.leaves += 1;
        if self.leaves > MAX_LEAVES {
            return Err(ParseError {
                message: format!("Expression has more than {} conditions", MAX_LEAVES),
                position: start,
            });
        }

        self.skip_whitespace();
        self.expect_char('(')?;
        let argument = self.parse_argument()?;
        self.expect_char(')')?;

        Ok(Expr::Leaf(LeafCall {
            name,
            argument,
            position: start,
        }))
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("Expression is nested deeper than {} levels", MAX_DEPTH)));
        }
        Ok(())
    }

    fn parse_argument(&mut self) -> Result<String, ParseError> {
        self.skip_whitespace();

        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                let start = self.position;
                self.position += 1;
                let value = self.take_while(|c| c != quote);
                if !self.match_char(quote) {
                    return Err(ParseError {
                        message: "Unterminated quoted argument".to_string(),
                        position: start,
                    });
                }
                self.skip_whitespace();
                Ok(value)
            }
            _ => Ok(self.take_while(|c| c != ')').trim().to_string()),
        }
    }

    /// Consumes `keyword` only when it stands alone, so `order-x(..)` is not `OR`.
    fn match_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();

        let len = keyword.chars().count();
        if self.position + len > self.chars.len() {
            return false;
        }

        let candidate: String = self.chars[self.position..self.position + len].iter().collect();
        if !candidate.eq_ignore_ascii_case(keyword) {
            return false;
        }

        let boundary = self.chars.get(self.position + len).is_none_or(|c| !is_name_char(*c));
        if boundary {
            self.position += len;
        }
        boundary
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.position;
        while self.peek().is_some_and(&pred) {
            self.position += 1;
        }
        self.chars[start..self.position].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        if self.match_char(expected) {
            return Ok(());
        }
        Err(match self.peek() {
            Some(c) => self.error(format!("Expected '{}', found '{}'", expected, c)),
            None => self.error(format!("Expected '{}', found end of input", expected)),
        })
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.chars.len()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.position,
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, argument: &str) -> String {
        format!("{}({})", name, argument)
    }

    /// Renders with explicit grouping so precedence is visible in assertions
    fn render(expr: &Expr<LeafCall>) -> String {
        match expr {
            Expr::Leaf(l) => leaf(&l.name, &l.argument),
            Expr::And(l, r) => format!("[{} & {}]", render(l), render(r)),
            Expr::Or(l, r) => format!("[{} | {}]", render(l), render(r)),
            Expr::Not(inner) => format!("!{}", render(inner)),
        }
    }

    #[test]
    fn test_single_leaf() {
        let expr = parse("has-role(admin)").unwrap();
        assert_eq!(render(&expr), "has-role(admin)");
    }

    #[test]
    fn test_precedence_not_and_or() {
        let expr = parse("has-role(a) OR has-role(b) AND NOT has-role(c)").unwrap();
        assert_eq!(render(&expr), "[has-role(a) | [has-role(b) & !has-role(c)]]");
    }

    #[test]
    fn test_parentheses_override() {
        let expr = parse("(has-role(a) OR has-role(b)) AND has-role(c)").unwrap();
        assert_eq!(render(&expr), "[[has-role(a) | has-role(b)] & has-role(c)]");
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let expr = parse("not has-role(a) and has-role(b) Or has-role(c)").unwrap();
        assert_eq!(render(&expr), "[[!has-role(a) & has-role(b)] | has-role(c)]");
    }

    #[test]
    fn test_arguments_bare_and_quoted() {
        let expr = parse("is-member-of( /staff/contractors ) AND has-user-attribute('dept:R&D (east)')").unwrap();
        let leaves = expr.leaves();
        assert_eq!(leaves[0].argument, "/staff/contractors");
        assert_eq!(leaves[1].argument, "dept:R&D (east)");
    }

    #[test]
    fn test_keyword_prefix_is_not_keyword() {
        let expr = parse("NOT order-flag(x)").unwrap();
        assert_eq!(render(&expr), "!order-flag(x)");
    }

    #[test]
    fn test_errors_report_position() {
        let err = parse("has-role(a) AND").unwrap_err();
        assert_eq!(err.position, 15);

        let err = parse("has-role(a) has-role(b)").unwrap_err();
        assert!(err.message.starts_with("Unexpected"));

        assert!(parse("has-role('a)").is_err());
        assert!(parse("(has-role(a)").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let at_limit = format!("{}has-role(a)", "NOT ".repeat(MAX_DEPTH));
        assert!(parse(&at_limit).is_ok());

        let nots = format!("{}has-role(a)", "NOT ".repeat(200_000));
        let err = parse(&nots).unwrap_err();
        assert!(err.message.contains("nested deeper"));
        assert_eq!(err.position, 4 * MAX_DEPTH + 3);

        let parens = format!("{}has-role(a){}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(parse(&parens).unwrap_err().message.contains("nested deeper"));
    }

    #[test]
    fn test_condition_count_is_bounded() {
        let chain = |n: usize| vec!["has-role(a)"; n].join(" AND ");
        assert_eq!(parse(&chain(MAX_LEAVES)).unwrap().leaves().len(), MAX_LEAVES);

        let err = parse(&chain(100_000)).unwrap_err();
        assert!(err.message.contains("more than"));
    }

    #[test]
    fn test_predicate_flattening() {
        use crate::workflows::predicate::Relation;

        let expr = parse("has-role(a) AND has-role(b) AND (has-role(c) OR has-role(d) OR has-role(e))").unwrap();
        let predicate = expr.to_predicate(&|l: &LeafCall| {
            Predicate::exists(Relation::Role { name: l.argument.clone() })
        });

        match predicate {
            Predicate::And(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(&items[2], Predicate::Or(inner) if inner.len() == 3));
            }
            other => panic!("expected AND, got {:?}", other),
        }
    }
}
