//! Restricted arithmetic evaluator for per-PID conversion formulas.
//!
//! A formula is an expression like `((A*256)+B)/4` over the ordered payload
//! bytes, where `A` is byte 0, `B` is byte 1 and so on. Only `+ - * /`,
//! parentheses, unary minus and decimal literals are accepted. Evaluation
//! happens over the provided bytes and nothing else, so a malformed or
//! hostile formula string can at worst produce an error, never run code.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
/// Error produced while tokenizing or evaluating a conversion formula
pub enum FormulaError {
    /// A character outside the accepted grammar was found
    #[error("unexpected character {0:?} in formula")]
    UnexpectedChar(char),
    /// The formula ended mid-expression
    #[error("formula ended unexpectedly")]
    UnexpectedEnd,
    /// Input remained after a complete expression was parsed
    #[error("trailing input after expression")]
    TrailingInput,
    /// A variable beyond the payload length was referenced
    #[error("variable {0:?} has no payload byte")]
    UnknownVariable(char),
    /// Division by zero
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Variable(char),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(formula: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = formula.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            'A'..='Z' => {
                chars.next();
                tokens.push(Token::Variable(c));
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text
                    .parse::<f64>()
                    .map_err(|_| FormulaError::UnexpectedChar(c))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(FormulaError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    payload: &'a [u8],
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<Token, FormulaError> {
        let token = self.peek().ok_or(FormulaError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // factor := number | variable | '(' expr ')' | '-' factor
    fn factor(&mut self) -> Result<f64, FormulaError> {
        match self.next()? {
            Token::Number(n) => Ok(n),
            Token::Variable(name) => {
                let index = (name as u8 - b'A') as usize;
                self.payload
                    .get(index)
                    .map(|b| f64::from(*b))
                    .ok_or(FormulaError::UnknownVariable(name))
            }
            Token::Minus => Ok(-self.factor()?),
            Token::Open => {
                let value = self.expr()?;
                match self.next()? {
                    Token::Close => Ok(value),
                    _ => Err(FormulaError::UnexpectedEnd),
                }
            }
            Token::Plus | Token::Star | Token::Slash | Token::Close => {
                Err(FormulaError::UnexpectedEnd)
            }
        }
    }
}

/// Evaluates `formula` over `payload`, with byte 0 bound to `A`, byte 1 to
/// `B` and so on.
pub fn evaluate(formula: &str, payload: &[u8]) -> Result<f64, FormulaError> {
    let tokens = tokenize(formula)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        payload,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(FormulaError::TrailingInput);
    }
    Ok(value)
}
