use crate::error::{Result, TagError};
use std::collections::BTreeMap;
use sxd_xpath::{Context, Factory, Value, XPath};

// ---------------------------------------------------------------------------
// Matcher trait
// ---------------------------------------------------------------------------

/// Membership decision for one (definition, facts) pair.
///
/// Pure: implementations must not mutate either input or carry state between
/// calls. The rebuild coordinator is written against this trait so tests can
/// substitute a fake that decides membership without parsing XML.
pub trait Matcher: Send + Sync {
    fn evaluate(&self, definition: &str, facts_xml: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// XpathMatcher
// ---------------------------------------------------------------------------

/// XPath 1.0 matcher over hardware-facts XML documents.
///
/// Result typing:
/// - boolean results are taken as-is (comparisons such as
///   `//node[@id="display"]/clock > 1000000000` already yield a boolean
///   under XPath semantics);
/// - numbers are truthy when non-zero (and not NaN);
/// - node-sets are truthy when non-empty;
/// - strings are rejected as unevaluable rather than coerced.
#[derive(Debug, Clone, Default)]
pub struct XpathMatcher {
    namespaces: BTreeMap<String, String>,
}

impl XpathMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matcher with XPath namespace prefixes available to definitions.
    pub fn with_namespaces(namespaces: BTreeMap<String, String>) -> Self {
        Self { namespaces }
    }

    /// Syntax-only check, used when a definition is created or updated so a
    /// bad expression is rejected before anything is persisted.
    pub fn validate(&self, definition: &str) -> Result<()> {
        match Factory::new().build(definition) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(TagError::InvalidDefinition {
                expression: definition.to_string(),
                reason: "expression is empty".to_string(),
            }),
            Err(e) => Err(TagError::InvalidDefinition {
                expression: definition.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn compile(&self, definition: &str) -> Result<XPath> {
        match Factory::new().build(definition) {
            Ok(Some(xpath)) => Ok(xpath),
            Ok(None) => Err(TagError::Evaluation {
                expression: definition.to_string(),
                reason: "expression is empty".to_string(),
            }),
            Err(e) => Err(TagError::Evaluation {
                expression: definition.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Matcher for XpathMatcher {
    fn evaluate(&self, definition: &str, facts_xml: &str) -> Result<bool> {
        let xpath = self.compile(definition)?;

        let package = sxd_document::parser::parse(facts_xml).map_err(|e| TagError::Evaluation {
            expression: definition.to_string(),
            reason: format!("facts document is not well-formed XML: {e}"),
        })?;
        let document = package.as_document();

        let mut context = Context::new();
        for (prefix, uri) in &self.namespaces {
            context.set_namespace(prefix, uri);
        }

        let value =
            xpath
                .evaluate(&context, document.root())
                .map_err(|e| TagError::Evaluation {
                    expression: definition.to_string(),
                    reason: e.to_string(),
                })?;

        match value {
            Value::Boolean(b) => Ok(b),
            Value::Number(n) => Ok(n != 0.0 && !n.is_nan()),
            Value::Nodeset(set) => Ok(set.size() > 0),
            Value::String(_) => Err(TagError::Evaluation {
                expression: definition.to_string(),
                reason: "expression yields a string; expected boolean, number, or node-set"
                    .to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(definition: &str, xml: &str) -> Result<bool> {
        XpathMatcher::new().evaluate(definition, xml)
    }

    #[test]
    fn nodeset_match() {
        assert!(eval("/foo", "<foo/>").unwrap());
    }

    #[test]
    fn nodeset_no_match() {
        assert!(!eval("/foo", "<bar/>").unwrap());
    }

    #[test]
    fn text_nodes_count_as_match() {
        assert!(eval("/foo/text()", "<foo>content</foo>").unwrap());
        assert!(!eval("/foo/text()", "<foo/>").unwrap());
    }

    #[test]
    fn numeric_comparison_yields_boolean() {
        let facts = r#"<list><node id="display"><clock>1500000000</clock></node></list>"#;
        assert!(eval(r#"//node[@id="display"]/clock > 1000000000"#, facts).unwrap());
        let slow = r#"<list><node id="display"><clock>800000000</clock></node></list>"#;
        assert!(!eval(r#"//node[@id="display"]/clock > 1000000000"#, slow).unwrap());
    }

    #[test]
    fn count_is_truthy_when_nonzero() {
        assert!(eval("count(//cpu)", "<list><cpu/><cpu/></list>").unwrap());
        assert!(!eval("count(//cpu)", "<list/>").unwrap());
    }

    #[test]
    fn string_result_is_an_evaluation_error() {
        let err = eval(r#"string(/foo)"#, "<foo>x</foo>").unwrap_err();
        assert!(matches!(err, TagError::Evaluation { .. }));
    }

    #[test]
    fn undefined_namespace_prefix_is_an_evaluation_error() {
        let err = eval("//hw:cpu", "<foo/>").unwrap_err();
        assert!(matches!(err, TagError::Evaluation { .. }));
    }

    #[test]
    fn configured_namespace_prefix_resolves() {
        let mut ns = BTreeMap::new();
        ns.insert("hw".to_string(), "http://example.com/hw".to_string());
        let matcher = XpathMatcher::with_namespaces(ns);
        let facts = r#"<list xmlns:hw="http://example.com/hw"><hw:cpu/></list>"#;
        assert!(matcher.evaluate("//hw:cpu", facts).unwrap());
    }

    #[test]
    fn malformed_xml_is_an_evaluation_error() {
        let err = eval("/foo", "<foo><unclosed></foo>").unwrap_err();
        assert!(matches!(err, TagError::Evaluation { .. }));
    }

    #[test]
    fn validate_accepts_well_formed_expressions() {
        let m = XpathMatcher::new();
        m.validate("//node[@id=\"display\"]/clock > 1000000000")
            .unwrap();
        m.validate("/foo/bar").unwrap();
    }

    #[test]
    fn validate_rejects_malformed_expressions() {
        let m = XpathMatcher::new();
        let err = m.validate("invalid::tag").unwrap_err();
        assert!(matches!(err, TagError::InvalidDefinition { .. }));
        assert!(m.validate("//foo[").is_err());
    }

    #[test]
    fn evaluation_does_not_mutate_inputs() {
        let matcher = XpathMatcher::new();
        let definition = "/foo";
        let facts = "<foo/>";
        matcher.evaluate(definition, facts).unwrap();
        // Same answer on a second pass over identical inputs.
        assert!(matcher.evaluate(definition, facts).unwrap());
    }
}
