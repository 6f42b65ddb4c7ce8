//! Parser: turns Eva source text into the `Expr` AST the scope analyzer and
//! compiler consume.

pub mod ast;
mod lexer;

pub use ast::{Expr, NodeId};

use crate::error::ParseError;
use lexer::{Lexer, Token};

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_id: NodeId,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, next_id: 0 }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token::LParen) => self.parse_list(),
            Some(Token::RParen) => Err(ParseError::UnmatchedCloseParen),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Atom(a)) => Ok(parse_atom(&a)),
            None => Err(ParseError::UnterminatedList),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, ParseError> {
        let id = self.fresh_id();
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RParen) => {
                    self.advance();
                    return Ok(Expr::List(id, items));
                }
                None => return Err(ParseError::UnterminatedList),
                _ => items.push(self.parse_expr()?),
            }
        }
    }
}

fn parse_atom(atom: &str) -> Expr {
    if let Ok(n) = atom.parse::<f64>() {
        Expr::Number(n)
    } else {
        Expr::Symbol(atom.to_string())
    }
}

/// Parses a sequence of top-level expressions: the *body* of a program,
/// not yet wrapped in `(begin ...)`. [`crate::exec`] performs that wrap so
/// that scope analysis always sees a single root list.
pub fn parse_all(source: &str) -> Result<Vec<Expr>, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    let mut exprs = Vec::new();
    while parser.peek().is_some() {
        exprs.push(parser.parse_expr()?);
    }
    Ok(exprs)
}

/// Parses `source` and wraps it as `(begin <source>)`, the shape scope
/// analysis and the compiler expect as their root expression.
pub fn parse_program(source: &str) -> Result<Expr, ParseError> {
    let mut body = parse_all(source)?;
    if body.is_empty() {
        return Err(ParseError::EmptyProgram);
    }
    let mut items = Vec::with_capacity(body.len() + 1);
    items.push(Expr::Symbol("begin".to_string()));
    items.append(&mut body);
    Ok(Expr::List(0, renumber(items, 1)))
}

/// Assigns fresh, contiguous node ids to every list in `items` in
/// pre-order, starting from `start` (the wrapping `begin` itself already
/// took id 0).
fn renumber(items: Vec<Expr>, start: NodeId) -> Vec<Expr> {
    let mut next = start;
    items.into_iter().map(|e| renumber_expr(e, &mut next)).collect()
}

fn renumber_expr(expr: Expr, next: &mut NodeId) -> Expr {
    match expr {
        Expr::List(_, items) => {
            let id = *next;
            *next += 1;
            let items = items.into_iter().map(|e| renumber_expr(e, next)).collect();
            Expr::List(id, items)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_strings_symbols() {
        let exprs = parse_all(r#"5 "hi" foo"#).unwrap();
        assert_eq!(exprs, vec![Expr::Number(5.0), Expr::Str("hi".to_string()), Expr::Symbol("foo".to_string())]);
    }

    #[test]
    fn parses_nested_lists_with_unique_ids() {
        let Expr::List(outer_id, items) = parse_all("(+ 1 (* 2 3))").unwrap().remove(0) else {
            panic!("expected a list");
        };
        let Expr::List(inner_id, _) = &items[2] else {
            panic!("expected a nested list");
        };
        assert_ne!(outer_id, *inner_id);
    }

    #[test]
    fn wraps_program_in_begin() {
        let program = parse_program("(var x 1) x").unwrap();
        let Expr::List(id, items) = program else {
            panic!("expected a list");
        };
        assert_eq!(id, 0);
        assert_eq!(items[0], Expr::Symbol("begin".to_string()));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn unmatched_close_paren_is_an_error() {
        assert_eq!(parse_all(")").unwrap_err(), ParseError::UnmatchedCloseParen);
    }

    #[test]
    fn unterminated_list_is_an_error() {
        assert_eq!(parse_all("(+ 1 2").unwrap_err(), ParseError::UnterminatedList);
    }
}
