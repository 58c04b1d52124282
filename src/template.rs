use handlebars::Handlebars;
use serde_json::Value;

use crate::error::{Error, Result};

/// Renders the node's query template against a context.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<String>;
}

/// Mustache-style `{{path.to.value}}` rendering.
///
/// Missing paths render as empty strings. `{{ }}` escapes HTML entities and
/// `{{{ }}}` inserts the raw value, as in mustache.
pub struct MustacheRenderer {
    registry: Handlebars<'static>,
}

impl Default for MustacheRenderer {
    fn default() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        Self { registry }
    }
}

impl MustacheRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateRenderer for MustacheRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String> {
        self.registry
            .render_template(template, context)
            .map_err(|e| Error::Template(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    fn render(template: &str, context: Value) -> Result<String> {
        MustacheRenderer::new().render(template, &context)
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(
            render("SELECT * FROM t WHERE id = $id", json!({})).unwrap(),
            "SELECT * FROM t WHERE id = $id"
        );
    }

    #[test]
    fn test_renders_message_fields() {
        let ctx = Message::with_payload(json!({"table": "orders", "limit": 5})).template_context();
        assert_eq!(
            render("SELECT * FROM {{msg.payload.table}} LIMIT {{msg.payload.limit}}", ctx).unwrap(),
            "SELECT * FROM orders LIMIT 5"
        );
    }

    #[test]
    fn test_missing_path_renders_empty() {
        assert_eq!(render("SELECT '{{msg.nope}}'", json!({"msg": {}})).unwrap(), "SELECT ''");
    }

    #[test]
    fn test_triple_braces_skip_escaping() {
        let ctx = json!({"msg": {"payload": "a<b"}});
        assert_eq!(render("{{{msg.payload}}}", ctx).unwrap(), "a<b");
    }

    #[test]
    fn test_malformed_template_is_error() {
        let err = render("SELECT {{#if}", json!({})).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }
}
