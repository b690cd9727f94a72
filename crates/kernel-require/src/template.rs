//! Script templates with `$$`-delimited parameter substitution.
//!
//! Script fragments routinely contain ordinary JavaScript `$`-prefixed
//! expressions (jQuery calls, template literals), so substitution sites use
//! the two-character delimiter `$$`. A placeholder is `$$name` or
//! `$${name}`; `$$$$` renders as a literal `$$`.
//!
//! Values supplied as JSON `null` or as an empty string render as the
//! literal token `null`, so a site like `const x = $$x;` stays well-formed
//! JavaScript instead of degenerating to `const x = ;`.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Named parameter values for a substitution pass.
///
/// Insertion order is irrelevant to rendering; an ordered map keeps
/// diagnostic output reproducible.
pub type TemplateParams = IndexMap<String, Value>;

/// Placeholder grammar: `$$$$` (escape), `$$name`, `$${name}`, or a bare
/// `$$` with no identifier (invalid).
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\$\$(?:(?P<escaped>\$\$)|(?P<named>[A-Za-z_][A-Za-z0-9_]*)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)\}|(?P<invalid>))",
    )
    .expect("placeholder pattern is valid")
});

/// Error type for strict substitution.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("No value supplied for placeholder `$${0}`")]
    MissingPlaceholder(String),

    #[error("Invalid placeholder at byte offset {0}")]
    InvalidPlaceholder(usize),
}

/// A script fragment with `$$`-delimited substitution sites.
///
/// Single-pass literal substitution only: substituted values are never
/// re-scanned for placeholders, and there are no loops or conditionals.
#[derive(Debug, Clone)]
pub struct JsTemplate {
    text: String,
}

impl JsTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Raw template text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Substitute known parameters, leaving unknown placeholders (and
    /// malformed `$$` sequences) as literal text.
    pub fn safe_substitute(&self, params: &TemplateParams) -> String {
        // The lenient pass cannot fail.
        self.render(params, false)
            .unwrap_or_else(|_| self.text.clone())
    }

    /// Substitute all placeholders, failing if any is unresolved or
    /// malformed. For callers that guarantee a complete parameter set.
    pub fn substitute(&self, params: &TemplateParams) -> Result<String, TemplateError> {
        self.render(params, true)
    }

    fn render(&self, params: &TemplateParams, strict: bool) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.text.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(&self.text) {
            let whole = caps.get(0).expect("capture group 0 always present");
            out.push_str(&self.text[last..whole.start()]);
            last = whole.end();

            if caps.name("escaped").is_some() {
                out.push_str("$$");
                continue;
            }

            if let Some(name) = caps.name("named").or_else(|| caps.name("braced")) {
                match params.get(name.as_str()) {
                    Some(value) => out.push_str(&render_value(value)),
                    None if strict => {
                        return Err(TemplateError::MissingPlaceholder(name.as_str().to_string()))
                    }
                    None => out.push_str(whole.as_str()),
                }
                continue;
            }

            // Bare `$$` with no identifier after it.
            if strict {
                return Err(TemplateError::InvalidPlaceholder(whole.start()));
            }
            out.push_str(whole.as_str());
        }

        out.push_str(&self.text[last..]);
        Ok(out)
    }
}

/// Render a parameter value as script text.
///
/// Strings are inserted verbatim (the caller controls quoting); other JSON
/// values use their JSON rendering, which is valid JavaScript literal text.
/// Null and the empty string coerce to `null`.
fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) if s.is_empty() => "null".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(entries: &[(&str, Value)]) -> TemplateParams {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_named_and_braced_placeholders() {
        let t = JsTemplate::new("const a = $$x; const b = $${x};");
        let out = t.safe_substitute(&params(&[("x", json!("42"))]));
        assert_eq!(out, "const a = 42; const b = 42;");
    }

    #[test]
    fn test_null_value_coerces_to_null_token() {
        let t = JsTemplate::new("const x = $$x;");
        let out = t.safe_substitute(&params(&[("x", Value::Null)]));
        assert_eq!(out, "const x = null;");
    }

    #[test]
    fn test_empty_string_coerces_to_null_token() {
        let t = JsTemplate::new("const x = $$x;");
        let out = t.safe_substitute(&params(&[("x", json!(""))]));
        assert_eq!(out, "const x = null;");
    }

    #[test]
    fn test_missing_parameter_left_literal_in_safe_mode() {
        let t = JsTemplate::new("require(['$$lib'], () => $$callback());");
        let out = t.safe_substitute(&params(&[("lib", json!("d3"))]));
        assert_eq!(out, "require(['d3'], () => $$callback());");
    }

    #[test]
    fn test_missing_parameter_fails_in_strict_mode() {
        let t = JsTemplate::new("let v = $$value;");
        let err = t.substitute(&TemplateParams::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingPlaceholder(name) if name == "value"));
    }

    #[test]
    fn test_single_dollar_is_not_a_substitution_site() {
        let t = JsTemplate::new("$(element).html(`${lib}`);");
        let out = t.safe_substitute(&params(&[("lib", json!("d3"))]));
        assert_eq!(out, "$(element).html(`${lib}`);");
    }

    #[test]
    fn test_escaped_delimiter() {
        let t = JsTemplate::new("literal $$$$ here");
        assert_eq!(t.safe_substitute(&TemplateParams::new()), "literal $$ here");
    }

    #[test]
    fn test_invalid_placeholder_safe_vs_strict() {
        let t = JsTemplate::new("price: $$ 100");
        assert_eq!(t.safe_substitute(&TemplateParams::new()), "price: $$ 100");
        assert!(matches!(
            t.substitute(&TemplateParams::new()),
            Err(TemplateError::InvalidPlaceholder(7))
        ));
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let t = JsTemplate::new("const n = $$n; const flag = $$flag; const xs = $$xs;");
        let out = t.safe_substitute(&params(&[
            ("n", json!(3)),
            ("flag", json!(true)),
            ("xs", json!(["a", "b"])),
        ]));
        assert_eq!(out, r#"const n = 3; const flag = true; const xs = ["a","b"];"#);
    }

    #[test]
    fn test_substitution_is_single_pass() {
        let t = JsTemplate::new("$$outer");
        let out = t.safe_substitute(&params(&[("outer", json!("$$inner")), ("inner", json!("x"))]));
        assert_eq!(out, "$$inner");
    }
}
