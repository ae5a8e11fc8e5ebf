//! Tokenizer for AIL surface text.
//!
//! Produces a bounded token stream; the token count limit is enforced while
//! scanning so an oversized input fails before the parser allocates a tree.
//! Scanning is a single forward pass with one character of lookahead, so no
//! pattern can backtrack.

use ail_types::{CognitionError, Operation};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
    Identifier(String),
    Operation(Operation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character, for error messages.
    pub offset: usize,
}

impl Token {
    fn new(kind: TokenKind, offset: usize) -> Self {
        Token { kind, offset }
    }

    /// Short description used in parser diagnostics.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::String(s) => format!("string {s:?}"),
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Boolean(b) => format!("boolean {b}"),
            TokenKind::Null => "null".to_string(),
            TokenKind::Identifier(name) => format!("identifier '{name}'"),
            TokenKind::Operation(op) => format!("operation {op}"),
        }
    }
}

/// Tokenize `input`, failing with `Security` once the stream would exceed
/// `max_tokens` and with `Parse` on any unrecognized character sequence.
pub fn tokenize(input: &str, max_tokens: usize) -> Result<Vec<Token>, CognitionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let b = bytes[pos];

        if b.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        let kind = match b {
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b'[' => {
                pos += 1;
                TokenKind::LBracket
            }
            b']' => {
                pos += 1;
                TokenKind::RBracket
            }
            b'{' => {
                pos += 1;
                TokenKind::LBrace
            }
            b'}' => {
                pos += 1;
                TokenKind::RBrace
            }
            b':' => {
                pos += 1;
                TokenKind::Colon
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b'"' => {
                let (s, next) = scan_string(input, pos)?;
                pos = next;
                TokenKind::String(s)
            }
            b'-' | b'0'..=b'9' => {
                let (n, next) = scan_number(input, pos)?;
                pos = next;
                TokenKind::Number(n)
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let (word, next) = scan_word(bytes, pos);
                pos = next;
                classify_word(word)
            }
            _ => {
                let ch = input[pos..].chars().next().unwrap_or('?');
                return Err(CognitionError::Parse(format!(
                    "unexpected character '{ch}' at offset {pos}"
                )));
            }
        };

        if tokens.len() == max_tokens {
            return Err(CognitionError::Security(format!(
                "token limit of {max_tokens} exceeded"
            )));
        }
        tokens.push(Token::new(kind, start));
    }

    Ok(tokens)
}

/// `[A-Za-z_][A-Za-z0-9_-]*`, one forward pass.
fn scan_word(bytes: &[u8], start: usize) -> (&str, usize) {
    let mut end = start + 1;
    while end < bytes.len() {
        match bytes[end] {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => end += 1,
            _ => break,
        }
    }
    // The scanned range is pure ASCII.
    (std::str::from_utf8(&bytes[start..end]).unwrap_or(""), end)
}

fn classify_word(word: &str) -> TokenKind {
    if let Some(op) = Operation::from_keyword(word) {
        return TokenKind::Operation(op);
    }
    match word {
        "true" => TokenKind::Boolean(true),
        "false" => TokenKind::Boolean(false),
        "null" => TokenKind::Null,
        _ => TokenKind::Identifier(word.to_string()),
    }
}

/// Double-quoted string with JSON-style escapes. Returns the decoded string
/// and the offset just past the closing quote.
fn scan_string(input: &str, start: usize) -> Result<(String, usize), CognitionError> {
    let mut out = String::new();
    let mut chars = input[start + 1..].char_indices();

    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Ok((out, start + 1 + i + 1)),
            '\\' => {
                let Some((_, esc)) = chars.next() else {
                    break;
                };
                match esc {
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '/' => out.push('/'),
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{0008}'),
                    'f' => out.push('\u{000C}'),
                    'u' => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let Some((_, h)) = chars.next() else {
                                return Err(CognitionError::Parse(format!(
                                    "truncated \\u escape in string at offset {start}"
                                )));
                            };
                            let Some(digit) = h.to_digit(16) else {
                                return Err(CognitionError::Parse(format!(
                                    "invalid \\u escape in string at offset {start}"
                                )));
                            };
                            code = code * 16 + digit;
                        }
                        match char::from_u32(code) {
                            Some(decoded) => out.push(decoded),
                            None => {
                                return Err(CognitionError::Parse(format!(
                                    "invalid \\u codepoint in string at offset {start}"
                                )))
                            }
                        }
                    }
                    other => {
                        return Err(CognitionError::Parse(format!(
                            "unknown escape '\\{other}' in string at offset {start}"
                        )))
                    }
                }
            }
            _ => out.push(ch),
        }
    }

    Err(CognitionError::Parse(format!(
        "unterminated string starting at offset {start}"
    )))
}

/// Decimal integer or float, with optional leading minus and exponent.
fn scan_number(input: &str, start: usize) -> Result<(f64, usize), CognitionError> {
    let bytes = input.as_bytes();
    let mut end = start;

    if bytes[end] == b'-' {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return Err(CognitionError::Parse(format!(
            "expected digits after '-' at offset {start}"
        )));
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        let frac_start = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end == frac_start {
            return Err(CognitionError::Parse(format!(
                "expected digits after '.' at offset {start}"
            )));
        }
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        end += 1;
        if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
            end += 1;
        }
        let exp_start = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end == exp_start {
            return Err(CognitionError::Parse(format!(
                "expected exponent digits at offset {start}"
            )));
        }
    }

    let text = &input[start..end];
    let value: f64 = text.parse().map_err(|_| {
        CognitionError::Parse(format!("invalid number '{text}' at offset {start}"))
    })?;
    Ok((value, end))
}
