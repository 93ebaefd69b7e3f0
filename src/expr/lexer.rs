//! Tokenizer for the expression language.

use crate::errors::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    // Keywords
    And,
    Or,
    Not,
    In,
    If,
    Else,
    For,
    True,
    False,
    None,
    // Operators and punctuation
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let position = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let token = if is_float {
                    Token::Float(text.parse().map_err(|_| ExprError::Syntax {
                        position,
                        message: format!("bad float literal '{text}'"),
                    })?)
                } else {
                    Token::Int(text.parse().map_err(|_| ExprError::Syntax {
                        position,
                        message: format!("bad integer literal '{text}'"),
                    })?)
                };
                tokens.push(Spanned { token, position });
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            let escaped = chars[i + 1];
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '\\' => '\\',
                                '\'' => '\'',
                                '"' => '"',
                                other => other,
                            });
                            i += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        ch => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(ExprError::Syntax {
                        position,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Spanned {
                    token: Token::Str(s),
                    position,
                });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "for" => Token::For,
                    "True" | "true" => Token::True,
                    "False" | "false" => Token::False,
                    "None" | "null" => Token::None,
                    _ => Token::Name(word),
                };
                tokens.push(Spanned { token, position });
            }
            '+' => {
                tokens.push(Spanned { token: Token::Plus, position });
                i += 1;
            }
            '-' => {
                tokens.push(Spanned { token: Token::Minus, position });
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Spanned { token: Token::DoubleStar, position });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Star, position });
                    i += 1;
                }
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Spanned { token: Token::DoubleSlash, position });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Slash, position });
                    i += 1;
                }
            }
            '%' => {
                tokens.push(Spanned { token: Token::Percent, position });
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Spanned { token: Token::Eq, position });
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        position,
                        message: "assignment is not allowed in expressions".to_string(),
                    });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Spanned { token: Token::NotEq, position });
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        position,
                        message: "unexpected '!'".to_string(),
                    });
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Spanned { token: Token::LtEq, position });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Lt, position });
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Spanned { token: Token::GtEq, position });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Gt, position });
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Spanned { token: Token::LParen, position });
                i += 1;
            }
            ')' => {
                tokens.push(Spanned { token: Token::RParen, position });
                i += 1;
            }
            '[' => {
                tokens.push(Spanned { token: Token::LBracket, position });
                i += 1;
            }
            ']' => {
                tokens.push(Spanned { token: Token::RBracket, position });
                i += 1;
            }
            '{' => {
                tokens.push(Spanned { token: Token::LBrace, position });
                i += 1;
            }
            '}' => {
                tokens.push(Spanned { token: Token::RBrace, position });
                i += 1;
            }
            ',' => {
                tokens.push(Spanned { token: Token::Comma, position });
                i += 1;
            }
            ':' => {
                tokens.push(Spanned { token: Token::Colon, position });
                i += 1;
            }
            '.' => {
                tokens.push(Spanned { token: Token::Dot, position });
                i += 1;
            }
            other => {
                return Err(ExprError::Syntax {
                    position,
                    message: format!("unexpected character '{other}'"),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn numbers_and_operators() {
        assert_eq!(
            kinds("1 + 2.5 ** 3"),
            vec![
                Token::Int(1),
                Token::Plus,
                Token::Float(2.5),
                Token::DoubleStar,
                Token::Int(3)
            ]
        );
    }

    #[test]
    fn floor_division_vs_division() {
        assert_eq!(
            kinds("a // b / c"),
            vec![
                Token::Name("a".into()),
                Token::DoubleSlash,
                Token::Name("b".into()),
                Token::Slash,
                Token::Name("c".into())
            ]
        );
    }

    #[test]
    fn strings_with_escapes_and_both_quotes() {
        assert_eq!(
            kinds(r#"'it\'s' + "a\nb""#),
            vec![
                Token::Str("it's".into()),
                Token::Plus,
                Token::Str("a\nb".into())
            ]
        );
    }

    #[test]
    fn keywords_and_names() {
        assert_eq!(
            kinds("x in items and not done"),
            vec![
                Token::Name("x".into()),
                Token::In,
                Token::Name("items".into()),
                Token::And,
                Token::Not,
                Token::Name("done".into())
            ]
        );
    }

    #[test]
    fn scientific_notation_is_float() {
        assert_eq!(kinds("1e3"), vec![Token::Float(1000.0)]);
        assert_eq!(kinds("2.5e-1"), vec![Token::Float(0.25)]);
    }

    #[test]
    fn assignment_is_rejected() {
        assert!(tokenize("x = 1").is_err());
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(tokenize("'oops").is_err());
    }

    #[test]
    fn integer_attribute_access_does_not_lex_as_float() {
        // "path[0]" style access plus ".append" would be method syntax;
        // ensure "1.x" lexes as Int Dot Name rather than a bad float.
        assert_eq!(
            kinds("v.upper"),
            vec![Token::Name("v".into()), Token::Dot, Token::Name("upper".into())]
        );
    }
}
