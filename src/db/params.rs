use bytes::BytesMut;
use serde_json::Value;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, Kind, ToSql, Type};

/// A JSON value bound as a text-format parameter.
///
/// The server parses the text against the parameter type it inferred, so a
/// JSON number binds equally well to `int4`, `int8` or `numeric`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam(pub Value);

impl SqlParam {
    pub fn from_values(values: &[Value]) -> Vec<SqlParam> {
        values.iter().cloned().map(SqlParam).collect()
    }
}

/// Borrow a parameter list in the shape tokio-postgres expects.
pub fn as_sql_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }
        let text = match (&self.0, ty.kind()) {
            (Value::Array(items), Kind::Array(_)) => array_literal(items),
            (value, _) => scalar_text(value),
        };
        out.extend_from_slice(text.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Render a PostgreSQL array literal, e.g. `{1,"a b",NULL}`.
fn array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(nested) => array_literal(nested),
            Value::Bool(_) | Value::Number(_) => scalar_text(item),
            other => quote_element(&scalar_text(other)),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_element(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
