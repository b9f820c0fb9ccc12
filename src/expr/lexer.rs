use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    And,
    Or,
    Not,
    In,
    True,
    False,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Colon,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn lex(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let position = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Spanned { token: Token::LParen, position });
                i += 1;
            }
            ')' => {
                tokens.push(Spanned { token: Token::RParen, position });
                i += 1;
            }
            ':' => {
                tokens.push(Spanned { token: Token::Colon, position });
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Eq, position });
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        position,
                        message: "expected '==' but found single '='".to_string(),
                    });
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Ne, position });
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        position,
                        message: "expected '!=' but found single '!'".to_string(),
                    });
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Le, position });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Lt, position });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Ge, position });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Gt, position });
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] as char != quote {
                    end += 1;
                }
                if end >= bytes.len() {
                    return Err(ExprError::Parse {
                        position,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Spanned {
                    token: Token::Str(source[start..end].to_string()),
                    position,
                });
                i = end + 1;
            }
            '0'..='9' => {
                let start = i;
                let mut end = i;
                let mut is_float = false;
                while end < bytes.len() {
                    let c = bytes[end] as char;
                    if c.is_ascii_digit() {
                        end += 1;
                    } else if c == '.' && !is_float
                        && bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit())
                    {
                        is_float = true;
                        end += 1;
                    } else {
                        break;
                    }
                }
                let text = &source[start..end];
                let token = if is_float {
                    Token::Float(text.parse().map_err(|_| ExprError::Parse {
                        position,
                        message: format!("invalid float literal '{}'", text),
                    })?)
                } else {
                    Token::Int(text.parse().map_err(|_| ExprError::Parse {
                        position,
                        message: format!("invalid integer literal '{}'", text),
                    })?)
                };
                tokens.push(Spanned { token, position });
                i = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < bytes.len() {
                    let c = bytes[end] as char;
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                let text = &source[start..end];
                let token = match text {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(text.to_string()),
                };
                tokens.push(Spanned { token, position });
                i = end;
            }
            other => {
                return Err(ExprError::Parse {
                    position,
                    message: format!("unexpected character '{}'", other),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_lex_simple() {
        assert_eq!(
            kinds("rmq:latency < 0.200"),
            vec![
                Token::Ident("rmq".into()),
                Token::Colon,
                Token::Ident("latency".into()),
                Token::Lt,
                Token::Float(0.2),
            ]
        );
    }

    #[test]
    fn test_lex_keywords_and_strings() {
        assert_eq!(
            kinds("not a and 'x' in b or \"25s\""),
            vec![
                Token::Not,
                Token::Ident("a".into()),
                Token::And,
                Token::Str("x".into()),
                Token::In,
                Token::Ident("b".into()),
                Token::Or,
                Token::Str("25s".into()),
            ]
        );
    }

    #[test]
    fn test_lex_operators() {
        assert_eq!(
            kinds("== != < <= > >="),
            vec![Token::Eq, Token::Ne, Token::Lt, Token::Le, Token::Gt, Token::Ge]
        );
    }

    #[test]
    fn test_lex_errors() {
        assert!(lex("a = b").is_err());
        assert!(lex("'unterminated").is_err());
        assert!(lex("a § b").is_err());
    }

    #[test]
    fn test_positions() {
        let tokens = lex("a and b").unwrap();
        assert_eq!(tokens[1].position, 2);
        assert_eq!(tokens[2].position, 6);
    }
}
