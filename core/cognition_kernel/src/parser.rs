//! Recursive descent parser from tokens into the typed cognition tree.
//!
//! Depth is an explicit counter checked on every `parse_cognition` entry, so
//! hostile nesting fails with a security error instead of exhausting the
//! stack. Every constructed node receives a fresh UUID; children record the
//! parent's UUID.

use std::collections::BTreeMap;

use ail_types::{
    AilValue, Cognition, CognitionError, CognitionId, Entity, Operation, DEFAULT_MAX_DEPTH,
    DEFAULT_MAX_TOKENS,
};
use uuid::Uuid;

use crate::lexer::{tokenize, Token, TokenKind};

/// Security bounds applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_depth: usize,
    pub max_tokens: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        ParserLimits {
            max_depth: DEFAULT_MAX_DEPTH,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Parse one complete cognition with default limits.
pub fn parse(text: &str) -> Result<Cognition, CognitionError> {
    parse_with_limits(text, ParserLimits::default())
}

/// Parse one complete cognition. The top-level parse must consume every
/// token; trailing tokens fail with a parse error.
pub fn parse_with_limits(text: &str, limits: ParserLimits) -> Result<Cognition, CognitionError> {
    let tokens = tokenize(text, limits.max_tokens)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        max_depth: limits.max_depth,
    };

    let cognition = parser.parse_cognition(1, None)?;

    if let Some(extra) = parser.peek() {
        return Err(CognitionError::Parse(format!(
            "trailing input after cognition: {}",
            extra.describe()
        )));
    }

    Ok(cognition)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    max_depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> Result<(), CognitionError> {
        match self.next() {
            Some(token) if token.kind == *kind => Ok(()),
            Some(token) => Err(CognitionError::Parse(format!(
                "expected {} in {context}, found {}",
                describe_kind(kind),
                token.describe()
            ))),
            None => Err(CognitionError::Parse(format!(
                "expected {} in {context}, found end of input",
                describe_kind(kind)
            ))),
        }
    }

    fn parse_cognition(
        &mut self,
        depth: usize,
        parent_id: Option<CognitionId>,
    ) -> Result<Cognition, CognitionError> {
        if depth > self.max_depth {
            return Err(CognitionError::Security(format!(
                "cognition depth limit of {} exceeded",
                self.max_depth
            )));
        }

        self.expect(&TokenKind::LParen, "cognition")?;

        let operation = match self.next() {
            Some(Token {
                kind: TokenKind::Operation(op),
                ..
            }) => op,
            Some(token) => {
                return Err(CognitionError::Parse(format!(
                    "expected operation keyword after '(', found {}",
                    token.describe()
                )))
            }
            None => {
                return Err(CognitionError::Parse(
                    "expected operation keyword after '(', found end of input".to_string(),
                ))
            }
        };

        let cognition_id = Uuid::new_v4();
        let mut args = Vec::new();

        // The LET binding list `((name cognition) ...)` is the one arg shape
        // that is not itself a value; it is parsed into an array of
        // `[name, cognition]` pairs.
        if operation == Operation::Let {
            args.push(self.parse_let_bindings(depth, cognition_id)?);
        }

        loop {
            match self.peek() {
                Some(Token {
                    kind: TokenKind::RParen,
                    ..
                }) => {
                    self.pos += 1;
                    break;
                }
                Some(_) => args.push(self.parse_value(depth, cognition_id)?),
                None => {
                    return Err(CognitionError::Parse(format!(
                        "missing ')' closing {operation} cognition"
                    )))
                }
            }
        }

        Ok(Cognition {
            cognition_id,
            parent_id,
            operation,
            args,
            metadata: BTreeMap::new(),
        })
    }

    fn parse_let_bindings(
        &mut self,
        depth: usize,
        parent_id: CognitionId,
    ) -> Result<AilValue, CognitionError> {
        self.expect(&TokenKind::LParen, "LET binding list")?;

        let mut pairs = Vec::new();
        loop {
            match self.peek().map(|t| t.kind.clone()) {
                Some(TokenKind::RParen) => {
                    self.pos += 1;
                    break;
                }
                Some(TokenKind::LParen) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Token {
                            kind: TokenKind::Identifier(name),
                            ..
                        }) => name,
                        Some(token) => {
                            return Err(CognitionError::Parse(format!(
                                "expected binding name identifier, found {}",
                                token.describe()
                            )))
                        }
                        None => {
                            return Err(CognitionError::Parse(
                                "expected binding name identifier, found end of input".to_string(),
                            ))
                        }
                    };
                    let bound = self.parse_value(depth, parent_id)?;
                    self.expect(&TokenKind::RParen, "LET binding pair")?;
                    pairs.push(AilValue::Array(vec![AilValue::String(name), bound]));
                }
                Some(_) => {
                    let token = self.next().unwrap_or(Token {
                        kind: TokenKind::RParen,
                        offset: 0,
                    });
                    return Err(CognitionError::Parse(format!(
                        "expected '(' starting a LET binding pair, found {}",
                        token.describe()
                    )));
                }
                None => {
                    return Err(CognitionError::Parse(
                        "missing ')' closing LET binding list".to_string(),
                    ))
                }
            }
        }

        Ok(AilValue::Array(pairs))
    }

    fn parse_value(
        &mut self,
        depth: usize,
        parent_id: CognitionId,
    ) -> Result<AilValue, CognitionError> {
        let token = match self.peek() {
            Some(token) => token.clone(),
            None => {
                return Err(CognitionError::Parse(
                    "expected value, found end of input".to_string(),
                ))
            }
        };

        match token.kind {
            TokenKind::LParen => {
                let child = self.parse_cognition(depth + 1, Some(parent_id))?;
                Ok(AilValue::Cognition(Box::new(child)))
            }
            TokenKind::LBracket => self.parse_bracket(depth, parent_id),
            TokenKind::LBrace => self.parse_map(depth, parent_id),
            TokenKind::String(s) => {
                self.pos += 1;
                Ok(AilValue::String(s))
            }
            TokenKind::Number(n) => {
                self.pos += 1;
                Ok(AilValue::Number(n))
            }
            TokenKind::Boolean(b) => {
                self.pos += 1;
                Ok(AilValue::Bool(b))
            }
            TokenKind::Null => {
                self.pos += 1;
                Ok(AilValue::Null)
            }
            // The literal ON-FAIL marker inside a TRY arg list. The validator
            // rejects it anywhere else.
            TokenKind::Operation(Operation::OnFail) => {
                self.pos += 1;
                Ok(AilValue::Cognition(Box::new(Cognition {
                    cognition_id: Uuid::new_v4(),
                    parent_id: Some(parent_id),
                    operation: Operation::OnFail,
                    args: Vec::new(),
                    metadata: BTreeMap::new(),
                })))
            }
            TokenKind::Operation(op) => Err(CognitionError::Parse(format!(
                "operation {op} is only valid after '('"
            ))),
            TokenKind::Identifier(name) => Err(CognitionError::Parse(format!(
                "bare identifier '{name}' is only valid as an entity name or LET binding name"
            ))),
            other => Err(CognitionError::Parse(format!(
                "expected value, found {}",
                Token {
                    kind: other,
                    offset: token.offset
                }
                .describe()
            ))),
        }
    }

    /// `[name]`, `[name:value]`, or an array. A bare identifier as the first
    /// element always means an entity.
    fn parse_bracket(
        &mut self,
        depth: usize,
        parent_id: CognitionId,
    ) -> Result<AilValue, CognitionError> {
        self.expect(&TokenKind::LBracket, "entity or array")?;

        if let Some(Token {
            kind: TokenKind::Identifier(name),
            ..
        }) = self.peek().cloned()
        {
            self.pos += 1;
            return match self.next() {
                Some(Token {
                    kind: TokenKind::RBracket,
                    ..
                }) => Ok(AilValue::Entity(Entity::named(name))),
                Some(Token {
                    kind: TokenKind::Colon,
                    ..
                }) => {
                    let payload = self.parse_value(depth, parent_id)?;
                    self.expect(&TokenKind::RBracket, "entity")?;
                    Ok(AilValue::Entity(Entity::with_payload(name, payload)))
                }
                Some(token) => Err(CognitionError::Parse(format!(
                    "entity '{name}' must be closed with ']' or continued with ':', found {}",
                    token.describe()
                ))),
                None => Err(CognitionError::Parse(format!(
                    "unterminated entity '[{name}'"
                ))),
            };
        }

        let mut items = Vec::new();
        loop {
            match self.peek().map(|t| t.kind.clone()) {
                Some(TokenKind::RBracket) => {
                    self.pos += 1;
                    break;
                }
                Some(TokenKind::Comma) => {
                    self.pos += 1;
                }
                Some(_) => items.push(self.parse_value(depth, parent_id)?),
                None => {
                    return Err(CognitionError::Parse(
                        "missing ']' closing array".to_string(),
                    ))
                }
            }
        }

        Ok(AilValue::Array(items))
    }

    /// `{ "key": value, ... }`. Keys are strings; duplicates are rejected.
    fn parse_map(
        &mut self,
        depth: usize,
        parent_id: CognitionId,
    ) -> Result<AilValue, CognitionError> {
        self.expect(&TokenKind::LBrace, "metadata map")?;

        let mut map = BTreeMap::new();

        if matches!(
            self.peek().map(|t| &t.kind),
            Some(TokenKind::RBrace)
        ) {
            self.pos += 1;
            return Ok(AilValue::Map(map));
        }

        loop {
            let key = match self.next() {
                Some(Token {
                    kind: TokenKind::String(key),
                    ..
                }) => key,
                Some(token) => {
                    return Err(CognitionError::Parse(format!(
                        "expected string key in metadata map, found {}",
                        token.describe()
                    )))
                }
                None => {
                    return Err(CognitionError::Parse(
                        "expected string key in metadata map, found end of input".to_string(),
                    ))
                }
            };
            self.expect(&TokenKind::Colon, "metadata map")?;
            let value = self.parse_value(depth, parent_id)?;
            if map.insert(key.clone(), value).is_some() {
                return Err(CognitionError::Parse(format!(
                    "duplicate metadata key \"{key}\""
                )));
            }

            match self.next() {
                Some(Token {
                    kind: TokenKind::Comma,
                    ..
                }) => continue,
                Some(Token {
                    kind: TokenKind::RBrace,
                    ..
                }) => break,
                Some(token) => {
                    return Err(CognitionError::Parse(format!(
                        "expected ',' or '}}' in metadata map, found {}",
                        token.describe()
                    )))
                }
                None => {
                    return Err(CognitionError::Parse(
                        "missing '}' closing metadata map".to_string(),
                    ))
                }
            }
        }

        Ok(AilValue::Map(map))
    }
}

fn describe_kind(kind: &TokenKind) -> String {
    Token {
        kind: kind.clone(),
        offset: 0,
    }
    .describe()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested(levels: usize) -> String {
        let mut text = String::new();
        for _ in 0..levels - 1 {
            text.push_str("(PLAN {\"goal\": \"g\"} ");
        }
        text.push_str("(EXECUTE [kv] [\"x\"])");
        for _ in 0..levels - 1 {
            text.push(')');
        }
        text
    }

    #[test]
    fn parses_simple_execute() {
        let cognition = parse(r#"(EXECUTE [shell] ["echo hello"])"#).expect("should parse");
        assert_eq!(cognition.operation, Operation::Execute);
        assert_eq!(cognition.args.len(), 2);
        assert_eq!(
            cognition.args[0],
            AilValue::Entity(Entity::named("shell"))
        );
        assert_eq!(
            cognition.args[1],
            AilValue::Array(vec![AilValue::String("echo hello".into())])
        );
        assert!(cognition.parent_id.is_none());
    }

    #[test]
    fn children_record_parent_id() {
        let cognition =
            parse(r#"(PLAN {"goal": "g"} (EXECUTE [kv] ["1"]))"#).expect("should parse");
        let child = cognition.args[1].as_cognition().expect("child cognition");
        assert_eq!(child.parent_id, Some(cognition.cognition_id));
    }

    #[test]
    fn let_binding_list_becomes_pairs() {
        let cognition =
            parse(r#"(LET ((x (EXECUTE [kv] ["42"]))) (EXECUTE [kv] [x]))"#).expect("should parse");
        assert_eq!(cognition.operation, Operation::Let);
        assert_eq!(cognition.args.len(), 2);

        let pairs = cognition.args[0].as_array().expect("binding array");
        assert_eq!(pairs.len(), 1);
        let pair = pairs[0].as_array().expect("pair array");
        assert_eq!(pair[0], AilValue::String("x".into()));
        assert!(pair[1].as_cognition().is_some());
    }

    #[test]
    fn try_keeps_on_fail_marker() {
        let cognition = parse(
            r#"(TRY (EXECUTE [flaky] []) ON-FAIL (EXECUTE [kv] ["recovered"]))"#,
        )
        .expect("should parse");
        assert_eq!(cognition.args.len(), 3);
        let marker = cognition.args[1].as_cognition().expect("marker");
        assert_eq!(marker.operation, Operation::OnFail);
        assert!(marker.args.is_empty());
    }

    #[test]
    fn entity_with_payload() {
        let cognition = parse(r#"(EXECUTE [shell:"ls -la"] [])"#).expect("should parse");
        let entity = cognition.args[0].as_entity().expect("entity");
        assert_eq!(entity.name, "shell");
        assert_eq!(
            entity.payload.as_deref(),
            Some(&AilValue::String("ls -la".into()))
        );
    }

    #[test]
    fn arrays_and_maps() {
        let cognition = parse(
            r#"(QUERY {"intent": "find notes", "mode": "standard", "max_results": 5})"#,
        )
        .expect("should parse");
        let map = cognition.args[0].as_map().expect("metadata map");
        assert_eq!(map["intent"], AilValue::String("find notes".into()));
        assert_eq!(map["max_results"], AilValue::Number(5.0));

        let cognition = parse(r#"(EXECUTE [kv] ["a", "b", 3])"#).expect("should parse");
        let array = cognition.args[1].as_array().expect("array");
        assert_eq!(array.len(), 3);
    }

    #[test]
    fn depth_boundary() {
        let ok = nested(10);
        assert!(parse(&ok).is_ok(), "tree at exactly max_depth should parse");

        let too_deep = nested(11);
        let err = parse(&too_deep).unwrap_err();
        assert_eq!(err.kind(), "security");
    }

    #[test]
    fn trailing_tokens_fail() {
        let err = parse(r#"(EXECUTE [kv] ["x"]) ("#).unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn missing_operation_fails() {
        let err = parse(r#"(execute [kv] ["x"])"#).unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn unclosed_cognition_fails() {
        let err = parse(r#"(EXECUTE [kv] ["x"]"#).unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn duplicate_metadata_key_fails() {
        let err = parse(r#"(CLARIFY {"a": 1, "a": 2})"#).unwrap_err();
        assert_eq!(err.kind(), "parse");
    }
}
