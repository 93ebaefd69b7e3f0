//! Recursive-descent parser producing the expression AST.

use super::lexer::{Spanned, Token, tokenize};
use crate::errors::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Short-circuiting `and` / `or`.
    BoolOp {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    /// Chained comparisons: `a < b <= c` evaluates as `a < b and b <= c`.
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    /// `then if cond else otherwise`
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Attr {
        value: Box<Expr>,
        name: String,
    },
    Index {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        value: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    /// `[expr for var in iter if cond]`
    ListComp {
        expr: Box<Expr>,
        var: String,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExprError::Syntax {
            position: parser.tokens[parser.pos].position,
            message: format!("unexpected trailing {:?}", parser.tokens[parser.pos].token),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.position)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|s| s.position + 1)
                    .unwrap_or(0)
            })
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                position: self.position(),
                message: format!("expected {:?}, found {:?}", expected, self.peek()),
            })
        }
    }

    fn err(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    /// `or_expr ('if' or_expr 'else' ternary)?` — Python conditional order.
    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let value = self.or_expr()?;
        if self.eat(&Token::If) {
            let cond = self.or_expr()?;
            self.expect(Token::Else)?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let operand = self.not_expr()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::NotEq,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtEq) => CmpOp::LtEq,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtEq) => CmpOp::GtEq,
                Some(Token::In) => CmpOp::In,
                Some(Token::Not) => {
                    // `not in` is the only postfix use of `not`.
                    if self.tokens.get(self.pos + 1).map(|s| &s.token) == Some(&Token::In) {
                        self.pos += 1;
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.pos += 1;
            let right = self.arith()?;
            rest.push((op, right));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::DoubleSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Plus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Pos,
                operand: Box::new(operand),
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.postfix()?;
        if self.eat(&Token::DoubleStar) {
            // Right-associative, binds tighter than unary on the right.
            let exponent = self.unary()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut value = self.atom()?;
        loop {
            if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.ternary()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                value = Expr::Call {
                    func: Box::new(value),
                    args,
                };
            } else if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Some(Token::Name(n)) => n,
                    other => {
                        return Err(self.err(format!("expected attribute name, found {other:?}")));
                    }
                };
                value = Expr::Attr {
                    value: Box::new(value),
                    name,
                };
            } else if self.eat(&Token::LBracket) {
                value = self.index_or_slice(value)?;
            } else {
                break;
            }
        }
        Ok(value)
    }

    fn index_or_slice(&mut self, value: Expr) -> Result<Expr, ExprError> {
        let start = if matches!(self.peek(), Some(Token::Colon)) {
            None
        } else {
            Some(Box::new(self.ternary()?))
        };
        if self.eat(&Token::RBracket) {
            let index = start.ok_or_else(|| self.err("empty index"))?;
            return Ok(Expr::Index {
                value: Box::new(value),
                index,
            });
        }
        self.expect(Token::Colon)?;
        let stop = if matches!(self.peek(), Some(Token::Colon) | Some(Token::RBracket)) {
            None
        } else {
            Some(Box::new(self.ternary()?))
        };
        let step = if self.eat(&Token::Colon) {
            if matches!(self.peek(), Some(Token::RBracket)) {
                None
            } else {
                Some(Box::new(self.ternary()?))
            }
        } else {
            None
        };
        self.expect(Token::RBracket)?;
        Ok(Expr::Slice {
            value: Box::new(value),
            start,
            stop,
            step,
        })
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::Str(v)) => Ok(Expr::Str(v)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::None) => Ok(Expr::None),
            Some(Token::Name(n)) => Ok(Expr::Name(n)),
            Some(Token::LParen) => {
                let first = self.ternary()?;
                if self.eat(&Token::Comma) {
                    // Tuple literal; modelled as a list.
                    let mut items = vec![first];
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            items.push(self.ternary()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    return Ok(Expr::List(items));
                }
                self.expect(Token::RParen)?;
                Ok(first)
            }
            Some(Token::LBracket) => self.list_or_comprehension(),
            Some(Token::LBrace) => self.dict_literal(),
            other => Err(ExprError::Syntax {
                position: self.position(),
                message: format!("unexpected {other:?}"),
            }),
        }
    }

    fn list_or_comprehension(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.ternary()?;
        if self.eat(&Token::For) {
            let var = match self.advance() {
                Some(Token::Name(n)) => n,
                other => return Err(self.err(format!("expected loop variable, found {other:?}"))),
            };
            self.expect(Token::In)?;
            let iter = self.or_expr()?;
            let cond = if self.eat(&Token::If) {
                Some(Box::new(self.or_expr()?))
            } else {
                None
            };
            self.expect(Token::RBracket)?;
            return Ok(Expr::ListComp {
                expr: Box::new(first),
                var,
                iter: Box::new(iter),
                cond,
            });
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.peek() == Some(&Token::RBracket) {
                break;
            }
            items.push(self.ternary()?);
        }
        self.expect(Token::RBracket)?;
        Ok(Expr::List(items))
    }

    fn dict_literal(&mut self) -> Result<Expr, ExprError> {
        let mut pairs = Vec::new();
        if !self.eat(&Token::RBrace) {
            loop {
                let key = self.ternary()?;
                self.expect(Token::Colon)?;
                let value = self.ternary()?;
                pairs.push((key, value));
                if !self.eat(&Token::Comma) {
                    break;
                }
                if self.peek() == Some(&Token::RBrace) {
                    break;
                }
            }
            self.expect(Token::RBrace)?;
        }
        Ok(Expr::Dict(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_mul_over_add() {
        let ast = parse("1 + 2 * 3").unwrap();
        match ast {
            Expr::Binary {
                op: BinOp::Add,
                right,
                ..
            } => {
                assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("expected Add at root, got {other:?}"),
        }
    }

    #[test]
    fn chained_comparison_parses_flat() {
        let ast = parse("0 <= x < 10").unwrap();
        match ast {
            Expr::Compare { rest, .. } => assert_eq!(rest.len(), 2),
            other => panic!("expected Compare, got {other:?}"),
        }
    }

    #[test]
    fn ternary_is_python_ordered() {
        let ast = parse("'low' if x < 5 else 'high'").unwrap();
        match ast {
            Expr::Ternary { then, .. } => assert_eq!(*then, Expr::Str("low".into())),
            other => panic!("expected Ternary, got {other:?}"),
        }
    }

    #[test]
    fn membership_and_negated_membership() {
        assert!(matches!(
            parse("x in xs").unwrap(),
            Expr::Compare { .. }
        ));
        match parse("x not in xs").unwrap() {
            Expr::Compare { rest, .. } => assert_eq!(rest[0].0, CmpOp::NotIn),
            other => panic!("expected Compare, got {other:?}"),
        }
    }

    #[test]
    fn list_comprehension_with_filter() {
        let ast = parse("[x * 2 for x in items if x > 0]").unwrap();
        match ast {
            Expr::ListComp { var, cond, .. } => {
                assert_eq!(var, "x");
                assert!(cond.is_some());
            }
            other => panic!("expected ListComp, got {other:?}"),
        }
    }

    #[test]
    fn slices_parse_all_forms() {
        assert!(matches!(parse("xs[1]").unwrap(), Expr::Index { .. }));
        assert!(matches!(parse("xs[1:3]").unwrap(), Expr::Slice { .. }));
        assert!(matches!(parse("xs[:3]").unwrap(), Expr::Slice { .. }));
        assert!(matches!(parse("xs[::2]").unwrap(), Expr::Slice { .. }));
    }

    #[test]
    fn attribute_call_chain() {
        let ast = parse("random.choice([-1, 1])").unwrap();
        match ast {
            Expr::Call { func, args } => {
                assert!(matches!(*func, Expr::Attr { .. }));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse("1 + 2 )").is_err());
        assert!(parse("x y").is_err());
    }

    #[test]
    fn dict_literal_parses() {
        let ast = parse("{'a': 1, 'b': 2}").unwrap();
        match ast {
            Expr::Dict(pairs) => assert_eq!(pairs.len(), 2),
            other => panic!("expected Dict, got {other:?}"),
        }
    }

    #[test]
    fn power_is_right_associative() {
        let ast = parse("2 ** 3 ** 2").unwrap();
        match ast {
            Expr::Binary {
                op: BinOp::Pow,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinOp::Pow, .. })),
            other => panic!("expected Pow at root, got {other:?}"),
        }
    }
}
