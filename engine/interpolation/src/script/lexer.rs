//! Tokenizer for the attribute expression grammar

use crate::error::ValueError;

/// A single token of the expression grammar
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    // Punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,
    Question,
    Colon,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Bang,
}

/// Tokenize a script body
pub fn tokenize(source: &str) -> Result<Vec<Token>, ValueError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ValueError::Script(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(number));
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(d) if d == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => {
                                return Err(ValueError::Script("unterminated string".to_string()))
                            }
                        },
                        Some(d) => text.push(d),
                        None => return Err(ValueError::Script("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            '(' => push_single(&mut chars, &mut tokens, Token::LParen),
            ')' => push_single(&mut chars, &mut tokens, Token::RParen),
            '[' => push_single(&mut chars, &mut tokens, Token::LBracket),
            ']' => push_single(&mut chars, &mut tokens, Token::RBracket),
            ',' => push_single(&mut chars, &mut tokens, Token::Comma),
            ';' => push_single(&mut chars, &mut tokens, Token::Semicolon),
            '.' => push_single(&mut chars, &mut tokens, Token::Dot),
            '?' => push_single(&mut chars, &mut tokens, Token::Question),
            ':' => push_single(&mut chars, &mut tokens, Token::Colon),
            '+' => push_single(&mut chars, &mut tokens, Token::Plus),
            '-' => push_single(&mut chars, &mut tokens, Token::Minus),
            '*' => push_single(&mut chars, &mut tokens, Token::Star),
            '/' => push_single(&mut chars, &mut tokens, Token::Slash),
            '%' => push_single(&mut chars, &mut tokens, Token::Percent),
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    tokens.push(Token::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::LtEq);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::GtEq);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(ValueError::Script("expected '&&'".to_string()));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::OrOr);
                } else {
                    return Err(ValueError::Script("expected '||'".to_string()));
                }
            }
            other => {
                return Err(ValueError::Script(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn push_single(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    tokens: &mut Vec<Token>,
    token: Token,
) {
    chars.next();
    tokens.push(token);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_expression() {
        let tokens = tokenize("state a = 1; a + 2.5 * 3").unwrap();
        assert_eq!(tokens[0], Token::Ident("state".to_string()));
        assert_eq!(tokens[2], Token::Assign);
        assert!(tokens.contains(&Token::Number(2.5)));
        assert!(tokens.contains(&Token::Star));
    }

    #[test]
    fn test_tokenize_strings_and_comparison() {
        let tokens = tokenize("x == 'on' && y != \"off\"").unwrap();
        assert!(tokens.contains(&Token::Eq));
        assert!(tokens.contains(&Token::AndAnd));
        assert!(tokens.contains(&Token::Str("on".to_string())));
        assert!(tokens.contains(&Token::Str("off".to_string())));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(tokenize("a # b").is_err());
    }
}
