//! Canonical AIL text for cognition trees.
//!
//! One normalized form is used everywhere a cognition is persisted or
//! shipped: cognition-log records, stored event handlers, and COMMUNICATE
//! payloads. Single spaces separate arguments, metadata keys are emitted in
//! sorted order, and strings use JSON escaping, so re-serializing a reparsed
//! tree is bit-stable.

use ail_types::{AilValue, Cognition, Entity, Operation};

/// Render a cognition tree as canonical surface text. The output reparses
/// to the same tree up to fresh cognition ids.
pub fn to_canonical_text(cognition: &Cognition) -> String {
    let mut out = String::new();
    write_cognition(&mut out, cognition);
    out
}

fn write_cognition(out: &mut String, cognition: &Cognition) {
    out.push('(');
    out.push_str(cognition.operation.keyword());

    let mut args = cognition.args.iter();

    // LET binding lists have dedicated surface syntax.
    if cognition.operation == Operation::Let {
        if let Some(first) = args.next() {
            out.push(' ');
            match first {
                AilValue::Array(pairs) => write_binding_list(out, pairs),
                other => write_value(out, other),
            }
        }
    }

    for arg in args {
        out.push(' ');
        write_value(out, arg);
    }

    if !cognition.metadata.is_empty() {
        out.push(' ');
        write_map(out, &cognition.metadata);
    }

    out.push(')');
}

fn write_binding_list(out: &mut String, pairs: &[AilValue]) {
    out.push('(');
    for (i, pair) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push('(');
        if let Some(parts) = pair.as_array() {
            if let Some(name) = parts.first().and_then(AilValue::as_str) {
                out.push_str(name);
            }
            if let Some(bound) = parts.get(1) {
                out.push(' ');
                write_value(out, bound);
            }
        }
        out.push(')');
    }
    out.push(')');
}

fn write_value(out: &mut String, value: &AilValue) {
    match value {
        AilValue::Null => out.push_str("null"),
        AilValue::Bool(true) => out.push_str("true"),
        AilValue::Bool(false) => out.push_str("false"),
        AilValue::Number(n) => write_number(out, *n),
        AilValue::String(s) => write_string(out, s),
        AilValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        AilValue::Map(map) => write_map(out, map),
        AilValue::Entity(entity) => write_entity(out, entity),
        AilValue::Cognition(child) if child.operation == Operation::OnFail
            && child.args.is_empty() =>
        {
            out.push_str("ON-FAIL")
        }
        AilValue::Cognition(child) => write_cognition(out, child),
    }
}

fn write_map(out: &mut String, map: &std::collections::BTreeMap<String, AilValue>) {
    out.push('{');
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_string(out, key);
        out.push_str(": ");
        write_value(out, value);
    }
    out.push('}');
}

fn write_entity(out: &mut String, entity: &Entity) {
    out.push('[');
    out.push_str(&entity.name);
    if let Some(payload) = &entity.payload {
        out.push(':');
        write_value(out, payload);
    }
    out.push(']');
}

fn write_number(out: &mut String, n: f64) {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        out.push_str(&format!("{}", n as i64));
    } else {
        out.push_str(&format!("{n}"));
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
