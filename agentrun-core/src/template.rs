//! User-message templates with `{{name}}` placeholders.

use crate::error::AiError;
use crate::types::Variables;
use serde_json::Value;

/// Render a template by substituting every `{{name}}` placeholder.
///
/// Whitespace inside the braces is ignored. String values are inserted
/// verbatim; other values use their JSON text. A `{{` with no closing `}}`
/// is kept literally. Every unbound placeholder is reported at once.
pub fn render(template: &str, variables: &Variables) -> Result<String, AiError> {
    let mut out = String::with_capacity(template.len());
    let mut missing: Vec<String> = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let name = after[..end].trim();
        match variables.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(AiError::Template { missing })
    }
}

/// Placeholder names in order of first appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let name = after[..end].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
        rest = &after[end + 2..];
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_all() {
        let v = vars(&[("city", json!("Lisbon")), ("days", json!(3))]);
        let out = render("Plan {{ days }} days in {{city}}.", &v).unwrap();
        assert_eq!(out, "Plan 3 days in Lisbon.");
    }

    #[test]
    fn test_render_is_deterministic() {
        let v = vars(&[("a", json!("x")), ("b", json!({"k": [1, 2]}))]);
        let t = "{{a}}-{{b}}-{{a}}";
        assert_eq!(render(t, &v).unwrap(), render(t, &v).unwrap());
    }

    #[test]
    fn test_unbound_placeholders_reported() {
        let v = vars(&[("city", json!("Lisbon"))]);
        let err = render("{{city}} {{date}} {{who}} {{date}}", &v).unwrap_err();
        match err {
            AiError::Template { missing } => assert_eq!(missing, vec!["date", "who"]),
            other => panic!("Expected Template error, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let out = render("keep {{this", &Variables::new()).unwrap();
        assert_eq!(out, "keep {{this");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("{{a}} {{ b }} {{a}}"), vec!["a", "b"]);
    }
}
