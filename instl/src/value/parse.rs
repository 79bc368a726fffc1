// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parses `$(NAME)` / `$(NAME:list_sep="...")` interpolation syntax into
//! a small tree, per the re-architecture note in the design docs: model
//! as `Atom | Ref | Concat` rather than doing substitution with regex
//! callbacks against a live string.

/// A parsed fragment of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Atom(String),
    Ref {
        name: String,
        list_sep: Option<String>,
    },
    Concat(Vec<Value>),
}

/// Parse `text` into a `Value`. Malformed `$(` sequences (missing `)`)
/// are treated as literal text from that point on.
pub fn parse(text: &str) -> Value {
    let mut parts = Vec::new();
    let mut rest = text;

    loop {
        match rest.find("$(") {
            None => {
                if !rest.is_empty() {
                    parts.push(Value::Atom(rest.to_string()));
                }
                break;
            }
            Some(start) => {
                if start > 0 {
                    parts.push(Value::Atom(rest[..start].to_string()));
                }
                let after = &rest[start + 2..];
                match after.find(')') {
                    None => {
                        parts.push(Value::Atom(rest[start..].to_string()));
                        break;
                    }
                    Some(end) => {
                        let inner = &after[..end];
                        parts.push(parse_ref(inner));
                        rest = &after[end + 1..];
                    }
                }
            }
        }
    }

    match parts.len() {
        0 => Value::Atom(String::new()),
        1 => parts.into_iter().next().expect("len checked"),
        _ => Value::Concat(parts),
    }
}

fn parse_ref(inner: &str) -> Value {
    match inner.split_once(':') {
        Some((name, option)) => {
            let list_sep = option
                .strip_prefix("list_sep=")
                .map(|raw| raw.trim_matches('"').to_string());
            Value::Ref {
                name: name.to_string(),
                list_sep,
            }
        }
        None => Value::Ref {
            name: inner.to_string(),
            list_sep: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text() {
        assert_eq!(parse("hello"), Value::Atom("hello".to_string()));
    }

    #[test]
    fn parses_single_reference() {
        assert_eq!(
            parse("$(NAME)"),
            Value::Ref {
                name: "NAME".to_string(),
                list_sep: None
            }
        );
    }

    #[test]
    fn parses_reference_with_list_sep() {
        assert_eq!(
            parse("$(ITEMS:list_sep=\",\")"),
            Value::Ref {
                name: "ITEMS".to_string(),
                list_sep: Some(",".to_string())
            }
        );
    }

    #[test]
    fn parses_mixed_text_and_references() {
        assert_eq!(
            parse("a/$(B)/c"),
            Value::Concat(vec![
                Value::Atom("a/".to_string()),
                Value::Ref {
                    name: "B".to_string(),
                    list_sep: None
                },
                Value::Atom("/c".to_string()),
            ])
        );
    }

    #[test]
    fn unterminated_reference_is_literal() {
        assert_eq!(parse("a$(B"), Value::Concat(vec![
            Value::Atom("a".to_string()),
            Value::Atom("$(B".to_string()),
        ]));
    }
}
