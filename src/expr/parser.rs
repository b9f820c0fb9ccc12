use super::ExprError;
use super::lexer::{Spanned, Token, lex};
use super::scope::SymbolTable;
use super::value::{CmpOp, Value};

/// Parsed form of a rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    In {
        needle: Operand,
        haystack: Operand,
    },
    /// A bare operand evaluated for truthiness.
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Lit(Value),
    Var(Vec<String>),
}

/// A compiled expression: parsed and scope-checked against a symbol table.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub source: String,
    pub ast: Expr,
}

/// Compile an expression, failing with `ParseError` on grammar violations
/// and `ScopeError` when a referenced symbol is not declared in `table`.
pub fn compile(source: &str, table: &SymbolTable) -> Result<Compiled, ExprError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, index: 0, len: source.len() };
    let ast = parser.parse_expr()?;
    if let Some(trailing) = parser.peek() {
        return Err(ExprError::Parse {
            position: trailing.position,
            message: "unexpected trailing input".to_string(),
        });
    }
    check_scope(&ast, table)?;
    Ok(Compiled {
        source: source.to_string(),
        ast,
    })
}

fn check_scope(expr: &Expr, table: &SymbolTable) -> Result<(), ExprError> {
    let check_operand = |operand: &Operand| -> Result<(), ExprError> {
        if let Operand::Var(path) = operand
            && table.lookup(path).is_none()
        {
            return Err(ExprError::Scope {
                path: path.join(":"),
            });
        }
        Ok(())
    };
    match expr {
        Expr::Or(a, b) | Expr::And(a, b) => {
            check_scope(a, table)?;
            check_scope(b, table)
        }
        Expr::Not(inner) => check_scope(inner, table),
        Expr::Cmp { lhs, rhs, .. } => {
            check_operand(lhs)?;
            check_operand(rhs)
        }
        Expr::In { needle, haystack } => {
            check_operand(needle)?;
            check_operand(haystack)
        }
        Expr::Truthy(operand) => check_operand(operand),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.index)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn error_here(&self, message: &str) -> ExprError {
        let position = self.peek().map(|s| s.position).unwrap_or(self.len);
        ExprError::Parse {
            position,
            message: message.to_string(),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek().map(|s| &s.token), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek().map(|s| &s.token), Some(Token::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek().map(|s| &s.token), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek().map(|s| &s.token), Some(Token::LParen)) {
            self.advance();
            let inner = self.parse_expr()?;
            match self.advance().map(|s| s.token) {
                Some(Token::RParen) => return Ok(inner),
                _ => return Err(self.error_here("expected ')'")),
            }
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek().map(|s| &s.token) {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::In) => {
                self.advance();
                let haystack = self.parse_operand()?;
                return Ok(Expr::In {
                    needle: lhs,
                    haystack,
                });
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let rhs = self.parse_operand()?;
                Ok(Expr::Cmp { op, lhs, rhs })
            }
            None => Ok(Expr::Truthy(lhs)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        let spanned = match self.advance() {
            Some(s) => s,
            None => return Err(self.error_here("expected an operand")),
        };
        match spanned.token {
            Token::Int(i) => Ok(Operand::Lit(Value::Int(i))),
            Token::Float(f) => Ok(Operand::Lit(Value::Float(f))),
            Token::Str(s) => Ok(Operand::Lit(Value::Str(s))),
            Token::True => Ok(Operand::Lit(Value::Bool(true))),
            Token::False => Ok(Operand::Lit(Value::Bool(false))),
            Token::Ident(first) => {
                let mut path = vec![first];
                while matches!(self.peek().map(|s| &s.token), Some(Token::Colon)) {
                    self.advance();
                    match self.advance().map(|s| s.token) {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => return Err(self.error_here("expected a name after ':'")),
                    }
                }
                Ok(Operand::Var(path))
            }
            _ => Err(ExprError::Parse {
                position: spanned.position,
                message: "expected a literal or a name".to_string(),
            }),
        }
    }
}
