//! Static per-operation arity and shape checks, run on the full tree before
//! any evaluation begins. Every violation maps to `CognitionError::Validation`.

use ail_types::{AilValue, Cognition, CognitionError, Operation};

/// Validate a parsed tree. Called once on the root; recurses into every
/// nested cognition, including those inside arrays, maps, and entity
/// payloads.
pub fn validate(cognition: &Cognition) -> Result<(), CognitionError> {
    validate_node(cognition)
}

fn validate_node(cognition: &Cognition) -> Result<(), CognitionError> {
    match cognition.operation {
        Operation::Query => validate_query(cognition),
        Operation::Execute => validate_execute(cognition),
        Operation::Plan => validate_plan(cognition),
        Operation::Communicate => validate_communicate(cognition),
        Operation::Let => validate_let(cognition),
        Operation::Try => validate_try(cognition),
        Operation::Await => validate_await(cognition),
        Operation::SandboxedExecute => validate_sandboxed_execute(cognition),
        Operation::Clarify => validate_clarify(cognition),
        Operation::Event => validate_event(cognition),
        Operation::OnFail => Err(CognitionError::Validation(
            "ON-FAIL is only valid as the third element of a TRY".to_string(),
        )),
    }
}

/// Recurse into nested cognitions in value position. A stray ON-FAIL marker
/// anywhere outside its TRY slot is rejected here.
fn validate_value(value: &AilValue) -> Result<(), CognitionError> {
    match value {
        AilValue::Cognition(child) => validate_node(child),
        AilValue::Array(items) => items.iter().try_for_each(validate_value),
        AilValue::Map(map) => map.values().try_for_each(validate_value),
        AilValue::Entity(entity) => match &entity.payload {
            Some(payload) => validate_value(payload),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

fn arity_error(op: Operation, expected: &str, got: usize) -> CognitionError {
    CognitionError::Validation(format!("{op} expects {expected}, got {got} args"))
}

fn require_map<'a>(
    cognition: &'a Cognition,
    index: usize,
    what: &str,
) -> Result<&'a std::collections::BTreeMap<String, AilValue>, CognitionError> {
    cognition.args.get(index).and_then(AilValue::as_map).ok_or_else(|| {
        CognitionError::Validation(format!(
            "{} expects {what} at position {index}",
            cognition.operation
        ))
    })
}

fn require_string(
    map: &std::collections::BTreeMap<String, AilValue>,
    key: &str,
    op: Operation,
) -> Result<(), CognitionError> {
    match map.get(key) {
        Some(AilValue::String(_)) => Ok(()),
        Some(_) => Err(CognitionError::Validation(format!(
            "{op} metadata key \"{key}\" must be a string"
        ))),
        None => Err(CognitionError::Validation(format!(
            "{op} metadata must contain \"{key}\""
        ))),
    }
}

fn require_number_if_present(
    map: &std::collections::BTreeMap<String, AilValue>,
    key: &str,
    op: Operation,
) -> Result<(), CognitionError> {
    match map.get(key) {
        None | Some(AilValue::Number(_)) => Ok(()),
        Some(_) => Err(CognitionError::Validation(format!(
            "{op} metadata key \"{key}\" must be a number"
        ))),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_query(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 1 {
        return Err(arity_error(
            Operation::Query,
            "exactly 1 metadata arg",
            cognition.args.len(),
        ));
    }
    let map = require_map(cognition, 0, "a metadata map")?;
    require_string(map, "intent", Operation::Query)?;

    if let Some(mode) = map.get("mode") {
        let valid = mode
            .as_str()
            .map(|m| ail_types::QueryMode::from_str(m).is_some())
            .unwrap_or(false);
        if !valid {
            return Err(CognitionError::Validation(format!(
                "QUERY mode must be one of standard/explore/connect, got {mode:?}"
            )));
        }
    }
    require_number_if_present(map, "max_results", Operation::Query)?;
    require_number_if_present(map, "similarity_threshold", Operation::Query)?;
    validate_value(&cognition.args[0])
}

fn validate_execute(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 2 {
        return Err(arity_error(
            Operation::Execute,
            "a [tool] entity and a parameter value",
            cognition.args.len(),
        ));
    }
    if cognition.args[0].as_entity().is_none() {
        return Err(CognitionError::Validation(
            "EXECUTE expects a [tool] entity as its first arg".to_string(),
        ));
    }
    cognition.args.iter().try_for_each(validate_value)
}

fn validate_plan(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() < 2 {
        return Err(arity_error(
            Operation::Plan,
            "a goal metadata map followed by at least 1 child cognition",
            cognition.args.len(),
        ));
    }
    let map = require_map(cognition, 0, "a goal metadata map")?;
    require_string(map, "goal", Operation::Plan)?;

    for (index, arg) in cognition.args.iter().enumerate().skip(1) {
        if arg.as_cognition().is_none() {
            return Err(CognitionError::Validation(format!(
                "PLAN child at position {index} must be a cognition"
            )));
        }
    }
    cognition.args.iter().try_for_each(validate_value)
}

fn validate_communicate(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 2 {
        return Err(arity_error(
            Operation::Communicate,
            "a [recipient] entity and a child cognition",
            cognition.args.len(),
        ));
    }
    if cognition.args[0].as_entity().is_none() {
        return Err(CognitionError::Validation(
            "COMMUNICATE expects a [recipient] entity as its first arg".to_string(),
        ));
    }
    if cognition.args[1].as_cognition().is_none() {
        return Err(CognitionError::Validation(
            "COMMUNICATE expects a child cognition as its second arg".to_string(),
        ));
    }
    cognition.args.iter().try_for_each(validate_value)
}

fn validate_let(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 2 {
        return Err(arity_error(
            Operation::Let,
            "a binding list and a body cognition",
            cognition.args.len(),
        ));
    }

    let bindings = cognition.args[0].as_array().ok_or_else(|| {
        CognitionError::Validation("LET expects a binding list as its first arg".to_string())
    })?;

    let mut seen = std::collections::HashSet::new();
    for pair in bindings {
        let pair = pair.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
            CognitionError::Validation(
                "LET bindings must be (name cognition) pairs".to_string(),
            )
        })?;
        let name = pair[0].as_str().ok_or_else(|| {
            CognitionError::Validation("LET binding names must be identifiers".to_string())
        })?;
        if !is_identifier(name) {
            return Err(CognitionError::Validation(format!(
                "LET binding name '{name}' is not a valid identifier"
            )));
        }
        if !seen.insert(name.to_string()) {
            return Err(CognitionError::Validation(format!(
                "duplicate LET binding name '{name}'"
            )));
        }
        if pair[1].as_cognition().is_none() {
            return Err(CognitionError::Validation(format!(
                "LET binding '{name}' must bind a cognition"
            )));
        }
    }

    if cognition.args[1].as_cognition().is_none() {
        return Err(CognitionError::Validation(
            "LET expects a body cognition as its second arg".to_string(),
        ));
    }
    cognition.args.iter().try_for_each(validate_value)
}

fn validate_try(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 3 {
        return Err(arity_error(
            Operation::Try,
            "an attempt cognition, the literal ON-FAIL, and a recovery cognition",
            cognition.args.len(),
        ));
    }

    let marker_ok = cognition.args[1]
        .as_cognition()
        .map(|c| c.operation == Operation::OnFail && c.args.is_empty())
        .unwrap_or(false);
    if !marker_ok {
        return Err(CognitionError::Validation(
            "TRY expects the literal ON-FAIL as its second element".to_string(),
        ));
    }

    for (index, slot) in [(0usize, "attempt"), (2usize, "recovery")] {
        match cognition.args[index].as_cognition() {
            Some(child) if child.operation != Operation::OnFail => validate_node(child)?,
            _ => {
                return Err(CognitionError::Validation(format!(
                    "TRY {slot} must be a cognition"
                )))
            }
        }
    }
    Ok(())
}

fn validate_await(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.is_empty() || cognition.args.len() > 2 {
        return Err(arity_error(
            Operation::Await,
            "a child cognition and optional {timeout_ms} metadata",
            cognition.args.len(),
        ));
    }
    if cognition.args[0].as_cognition().is_none() {
        return Err(CognitionError::Validation(
            "AWAIT expects a child cognition as its first arg".to_string(),
        ));
    }
    if cognition.args.len() == 2 {
        let map = require_map(cognition, 1, "{timeout_ms} metadata")?;
        require_number_if_present(map, "timeout_ms", Operation::Await)?;
    }
    cognition.args.iter().try_for_each(validate_value)
}

fn validate_sandboxed_execute(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() < 2 || cognition.args.len() > 3 {
        return Err(arity_error(
            Operation::SandboxedExecute,
            "a [tool] entity, parameters, and optional policy metadata",
            cognition.args.len(),
        ));
    }
    if cognition.args[0].as_entity().is_none() {
        return Err(CognitionError::Validation(
            "SANDBOXED-EXECUTE expects a [tool] entity as its first arg".to_string(),
        ));
    }
    if cognition.args.len() == 3 {
        let map = require_map(cognition, 2, "policy metadata")?;
        if let Some(policy) = map.get("policy") {
            if policy.as_map().is_none() {
                return Err(CognitionError::Validation(
                    "SANDBOXED-EXECUTE policy must be a map".to_string(),
                ));
            }
        }
    }
    cognition.args.iter().try_for_each(validate_value)
}

fn validate_clarify(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 1 {
        return Err(arity_error(
            Operation::Clarify,
            "exactly 1 metadata arg",
            cognition.args.len(),
        ));
    }
    let map = require_map(cognition, 0, "a metadata map")?;
    require_string(map, "ambiguous_intent", Operation::Clarify)?;
    require_string(map, "clarification_prompt", Operation::Clarify)?;
    if let Some(options) = map.get("options") {
        if options.as_array().is_none() {
            return Err(CognitionError::Validation(
                "CLARIFY options must be an array".to_string(),
            ));
        }
    }
    validate_value(&cognition.args[0])
}

fn validate_event(cognition: &Cognition) -> Result<(), CognitionError> {
    if cognition.args.len() != 1 {
        return Err(arity_error(
            Operation::Event,
            "exactly 1 metadata arg",
            cognition.args.len(),
        ));
    }
    let map = require_map(cognition, 0, "a metadata map")?;
    require_string(map, "name", Operation::Event)?;
    require_string(map, "trigger", Operation::Event)?;
    match map.get("handler") {
        Some(AilValue::Cognition(handler)) => validate_node(handler)?,
        _ => {
            return Err(CognitionError::Validation(
                "EVENT metadata must contain a \"handler\" cognition".to_string(),
            ))
        }
    }
    if let Some(description) = map.get("description") {
        if description.as_str().is_none() {
            return Err(CognitionError::Validation(
                "EVENT description must be a string".to_string(),
            ));
        }
    }
    // The handler was validated above; the remaining metadata values hold no
    // cognitions the loop below would miss, but walking them keeps stray
    // ON-FAIL markers out.
    for (key, value) in map {
        if key != "handler" {
            validate_value(value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn check(text: &str) -> Result<(), CognitionError> {
        validate(&parse(text).expect("parse should succeed"))
    }

    #[test]
    fn accepts_well_formed_operations() {
        assert!(check(r#"(EXECUTE [shell] ["echo hi"])"#).is_ok());
        assert!(check(r#"(QUERY {"intent": "find x", "mode": "explore"})"#).is_ok());
        assert!(check(r#"(PLAN {"goal": "g"} (EXECUTE [kv] ["1"]))"#).is_ok());
        assert!(check(r#"(COMMUNICATE [agent7] (EXECUTE [kv] ["1"]))"#).is_ok());
        assert!(check(r#"(LET ((x (EXECUTE [kv] ["1"]))) (EXECUTE [kv] [x]))"#).is_ok());
        assert!(
            check(r#"(TRY (EXECUTE [flaky] []) ON-FAIL (EXECUTE [kv] ["r"]))"#).is_ok()
        );
        assert!(check(r#"(AWAIT (EXECUTE [kv] ["1"]) {"timeout_ms": 50})"#).is_ok());
        assert!(check(
            r#"(SANDBOXED-EXECUTE [kv] ["1"] {"policy": {"allowed_operations": ["kv"]}})"#
        )
        .is_ok());
        assert!(check(
            r#"(CLARIFY {"ambiguous_intent": "it", "clarification_prompt": "which?", "options": ["a", "b"]})"#
        )
        .is_ok());
        assert!(check(
            r#"(EVENT {"name": "n", "trigger": "t", "handler": (EXECUTE [kv] ["1"])})"#
        )
        .is_ok());
    }

    #[test]
    fn query_requires_intent_and_known_mode() {
        assert_eq!(check(r#"(QUERY {"mode": "standard"})"#).unwrap_err().kind(), "validation");
        assert_eq!(
            check(r#"(QUERY {"intent": "x", "mode": "sideways"})"#)
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            check(r#"(QUERY {"intent": "x", "max_results": "five"})"#)
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[test]
    fn execute_requires_tool_entity() {
        assert_eq!(check(r#"(EXECUTE "shell" ["x"])"#).unwrap_err().kind(), "validation");
        assert_eq!(check(r#"(EXECUTE [shell])"#).unwrap_err().kind(), "validation");
    }

    #[test]
    fn plan_requires_goal_and_children() {
        assert_eq!(check(r#"(PLAN {"goal": "g"})"#).unwrap_err().kind(), "validation");
        assert_eq!(
            check(r#"(PLAN {"topic": "g"} (EXECUTE [kv] ["1"]))"#)
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            check(r#"(PLAN {"goal": "g"} "not a cognition")"#)
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[test]
    fn let_rejects_duplicate_names() {
        let err = check(
            r#"(LET ((x (EXECUTE [kv] ["1"])) (x (EXECUTE [kv] ["2"]))) (EXECUTE [kv] [x]))"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn try_shape_is_fixed() {
        assert_eq!(
            check(r#"(TRY (EXECUTE [kv] ["1"]) (EXECUTE [kv] ["2"]))"#)
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[test]
    fn on_fail_is_not_standalone() {
        assert_eq!(check(r#"(ON-FAIL)"#).unwrap_err().kind(), "validation");
    }

    #[test]
    fn event_requires_handler_cognition() {
        assert_eq!(
            check(r#"(EVENT {"name": "n", "trigger": "t", "handler": "text"})"#)
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[test]
    fn nested_cognitions_are_validated() {
        // The inner QUERY is missing its intent.
        let err = check(r#"(PLAN {"goal": "g"} (QUERY {"mode": "standard"}))"#).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
