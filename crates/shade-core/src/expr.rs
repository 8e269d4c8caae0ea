//! Arithmetic expressions for symbolic texture sizes.
//!
//! Supports `+ - * / %`, parentheses, unary signs, numeric literals, and
//! named constants such as `INPUT_WIDTH`. Expressions are parsed into a small
//! tree once and can then be evaluated against any variable context.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    UnexpectedChar { pos: usize, ch: char },
    UnexpectedEnd,
    UnexpectedToken { pos: usize, found: String },
    UnbalancedParen { pos: usize },
    InvalidNumber(String),
    UndefinedVariable(String),
    DivisionByZero,
}

impl std::fmt::Display for ExprError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedChar { pos, ch } => {
                write!(f, "unexpected character '{}' at offset {}", ch, pos)
            }
            Self::UnexpectedEnd => write!(f, "unexpected end of expression"),
            Self::UnexpectedToken { pos, found } => {
                write!(f, "unexpected '{}' at offset {}", found, pos)
            }
            Self::UnbalancedParen { pos } => write!(f, "unbalanced parenthesis at offset {}", pos),
            Self::InvalidNumber(s) => write!(f, "invalid number '{}'", s),
            Self::UndefinedVariable(name) => write!(f, "undefined variable '{}'", name),
            Self::DivisionByZero => write!(f, "division by zero"),
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Var(String),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

/// A parsed expression, ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    root: Node,
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression()?;
        if let Some((pos, tok)) = parser.tokens.get(parser.pos) {
            return Err(match tok {
                Token::RParen => ExprError::UnbalancedParen { pos: *pos },
                other => ExprError::UnexpectedToken {
                    pos: *pos,
                    found: token_text(other),
                },
            });
        }
        Ok(Self { root })
    }

    pub fn eval(&self, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
        eval_node(&self.root, vars)
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(src: &str, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
    Expr::parse(src)?.eval(vars)
}

fn eval_node(node: &Node, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
    match node {
        Node::Number(v) => Ok(*v),
        Node::Var(name) => vars
            .get(name)
            .copied()
            .ok_or_else(|| ExprError::UndefinedVariable(name.clone())),
        Node::Neg(inner) => Ok(-eval_node(inner, vars)?),
        Node::Binary(op, lhs, rhs) => {
            let a = eval_node(lhs, vars)?;
            let b = eval_node(rhs, vars)?;
            match op {
                BinOp::Add => Ok(a + b),
                BinOp::Sub => Ok(a - b),
                BinOp::Mul => Ok(a * b),
                BinOp::Div | BinOp::Rem if b == 0.0 => Err(ExprError::DivisionByZero),
                BinOp::Div => Ok(a / b),
                BinOp::Rem => Ok(a % b),
            }
        }
    }
}

fn token_text(tok: &Token) -> String {
    match tok {
        Token::Number(v) => v.to_string(),
        Token::Ident(s) => s.clone(),
        Token::Op(c) => c.to_string(),
        Token::LParen => "(".to_string(),
        Token::RParen => ")".to_string(),
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (pos, ch) = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push((pos, Token::Op(ch)));
                i += 1;
            }
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                tokens.push((pos, Token::Number(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((pos, Token::Ident(text)));
            }
            other => return Err(ExprError::UnexpectedChar { pos, ch: other }),
        }
    }
    Ok(tokens)
}

// expression := term (('+' | '-') term)*
// term       := unary (('*' | '/' | '%') unary)*
// unary      := ('+' | '-') unary | primary
// primary    := number | ident | '(' expression ')'
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expression(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            let op = if c == '+' { BinOp::Add } else { BinOp::Sub };
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            let op = match c {
                '*' => BinOp::Mul,
                '/' => BinOp::Div,
                _ => BinOp::Rem,
            };
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some((_, Token::Number(v))) => Ok(Node::Number(v)),
            Some((_, Token::Ident(name))) => Ok(Node::Var(name)),
            Some((open, Token::LParen)) => {
                let inner = self.expression()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, tok)) => Err(ExprError::UnexpectedToken {
                        pos,
                        found: token_text(&tok),
                    }),
                    None => Err(ExprError::UnbalancedParen { pos: open }),
                }
            }
            Some((pos, tok)) => Err(ExprError::UnexpectedToken {
                pos,
                found: token_text(&tok),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_half_input_width() {
        let vars = ctx(&[("INPUT_WIDTH", 1920.0)]);
        assert_eq!(evaluate("INPUT_WIDTH/2", &vars).unwrap(), 960.0);
    }

    #[test]
    fn test_precedence_and_parens() {
        let vars = ctx(&[("W", 10.0), ("H", 4.0)]);
        assert_eq!(evaluate("W + H * 2", &vars).unwrap(), 18.0);
        assert_eq!(evaluate("(W + H) * 2", &vars).unwrap(), 28.0);
        assert_eq!(evaluate("W % 3 - -H", &vars).unwrap(), 5.0);
        assert_eq!(evaluate("-(W - 12) / 0.5", &vars).unwrap(), 4.0);
    }

    #[test]
    fn test_undefined_variable_is_named() {
        let err = evaluate("OUTPUT_WIDTH * 2", &HashMap::new()).unwrap_err();
        assert_eq!(err, ExprError::UndefinedVariable("OUTPUT_WIDTH".to_string()));
        assert!(err.to_string().contains("OUTPUT_WIDTH"));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(matches!(Expr::parse("(1 + 2"), Err(ExprError::UnbalancedParen { .. })));
        assert!(matches!(Expr::parse("1 + 2)"), Err(ExprError::UnbalancedParen { .. })));
        assert!(matches!(Expr::parse("1 +"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(Expr::parse("2 $ 3"), Err(ExprError::UnexpectedChar { ch: '$', .. })));
        assert!(matches!(Expr::parse("2 3"), Err(ExprError::UnexpectedToken { .. })));
        assert!(matches!(Expr::parse("1.2.3"), Err(ExprError::InvalidNumber(_))));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            evaluate("4 / (2 - 2)", &HashMap::new()),
            Err(ExprError::DivisionByZero)
        );
        assert_eq!(evaluate("4 % 0", &HashMap::new()), Err(ExprError::DivisionByZero));
    }
}
