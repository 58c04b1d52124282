//! Named placeholder support.
//!
//! Rewrites `$name` placeholders into PostgreSQL's positional `$1..$N` form.
//! Positions are assigned by sorting the referenced names, not by where they
//! first appear in the statement, so `$z $y $x` becomes `$3 $2 $1`.

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A query ready for the driver: positional text plus its ordered values.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub text: String,
    pub values: Vec<Value>,
}

/// A `$name` occurrence: byte range of the whole token (including `$`).
#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Scan for `$` followed by an ASCII letter and a run of letters, digits or `_`.
fn tokens(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_alphabetic() {
            let start = i;
            let mut end = i + 2;
            while end < bytes.len() && is_word_byte(bytes[end]) {
                end += 1;
            }
            found.push(Token {
                start,
                end,
                name: &sql[start + 1..end],
            });
            i = end;
        } else {
            i += 1;
        }
    }
    found
}

/// Names referenced by `sql`, in order of first appearance.
pub fn referenced_names(sql: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    tokens(sql)
        .into_iter()
        .filter(|t| seen.insert(t.name))
        .map(|t| t.name)
        .collect()
}

/// Translate a named-parameter query into positional form.
///
/// Fails with [`Error::MissingParameters`] listing every referenced name that
/// `params` does not provide; nothing is rewritten in that case. Entries of
/// `params` that the SQL never mentions are ignored.
pub fn translate(sql: &str, params: &Map<String, Value>) -> Result<Translated> {
    let found = tokens(sql);

    let missing: Vec<String> = referenced_names(sql)
        .into_iter()
        .filter(|name| !params.contains_key(*name))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(Error::MissingParameters(missing));
    }

    let ordered: BTreeSet<&str> = found.iter().map(|t| t.name).collect();
    let ordered: Vec<&str> = ordered.into_iter().collect();

    let mut text = String::with_capacity(sql.len());
    let mut cursor = 0;
    for token in &found {
        // binary_search cannot miss: every token name is in `ordered`
        if let Ok(idx) = ordered.binary_search(&token.name) {
            text.push_str(&sql[cursor..token.start]);
            text.push('$');
            text.push_str(&(idx + 1).to_string());
            cursor = token.end;
        }
    }
    text.push_str(&sql[cursor..]);

    let values = ordered
        .iter()
        .filter_map(|name| params.get(*name).cloned())
        .collect();

    Ok(Translated { text, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_basic_interpolation() {
        let result = translate("$a $b $c", &params(json!({"a": 10, "b": 20, "c": 30}))).unwrap();
        assert_eq!(result.text, "$1 $2 $3");
        assert_eq!(result.values, vec![json!(10), json!(20), json!(30)]);
    }

    #[test]
    fn test_lexicographic_order_differs_from_appearance() {
        let result = translate("$z $y $x", &params(json!({"z": 10, "y": 20, "x": 30}))).unwrap();
        assert_eq!(result.text, "$3 $2 $1");
        assert_eq!(result.values, vec![json!(30), json!(20), json!(10)]);
    }

    #[test]
    fn test_missing_parameters() {
        let err = translate("$z $y $x", &params(json!({"z": 10, "y": 20}))).unwrap_err();
        match &err {
            Error::MissingParameters(names) => assert_eq!(names, &vec!["x".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "Missing Parameters: x");
    }

    #[test]
    fn test_missing_parameters_lists_every_name() {
        let err = translate("$c $a $b", &params(json!({"b": 1}))).unwrap_err();
        let Error::MissingParameters(mut names) = err else {
            panic!("expected MissingParameters");
        };
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_extra_parameters_are_ignored() {
        let result =
            translate("$x $y $z", &params(json!({"w": 0, "x": 10, "y": 20, "z": 30}))).unwrap();
        assert_eq!(result.text, "$1 $2 $3");
        assert_eq!(result.values, vec![json!(10), json!(20), json!(30)]);
    }

    #[test]
    fn test_word_boundaries() {
        let result = translate("$a $aa", &params(json!({"a": 5, "aa": 23}))).unwrap();
        assert_eq!(result.text, "$1 $2");
        assert_eq!(result.values, vec![json!(5), json!(23)]);
    }

    #[test]
    fn test_empty_params_pass_through() {
        let sql = "SELECT name FORM person WHERE name = $1 AND tenure <= $2 AND age <= $3";
        let result = translate(sql, &Map::new()).unwrap();
        assert_eq!(result.text, sql);
        assert!(result.values.is_empty());
    }

    #[test]
    fn test_named_dispatch() {
        let sql =
            "SELECT name FORM person WHERE name = $name AND tenure <= $tenure AND age <= $age";
        let result = translate(
            sql,
            &params(json!({"name": "Ursus Oestergardii", "tenure": 3, "age": 24})),
        )
        .unwrap();
        assert_eq!(
            result.text,
            "SELECT name FORM person WHERE name = $2 AND tenure <= $3 AND age <= $1"
        );
        assert_eq!(
            result.values,
            vec![json!(24), json!("Ursus Oestergardii"), json!(3)]
        );
    }

    #[test]
    fn test_repeated_token_shares_index() {
        let result = translate(
            "SELECT * FROM t WHERE a = $id OR b = $id",
            &params(json!({"id": 7})),
        )
        .unwrap();
        assert_eq!(result.text, "SELECT * FROM t WHERE a = $1 OR b = $1");
        assert_eq!(result.values, vec![json!(7)]);
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let err = translate("$Id", &params(json!({"id": 1}))).unwrap_err();
        assert!(matches!(err, Error::MissingParameters(names) if names == vec!["Id".to_string()]));
    }

    #[test]
    fn test_positional_and_dollar_quotes_untouched() {
        let sql = "SELECT $1, $$body$$, $name";
        let result = translate(sql, &params(json!({"name": "n", "body": "ignored"}))).unwrap();
        // `$body` after `$$` is still a token by the grammar
        assert_eq!(result.text, "SELECT $1, $$1$$, $2");
        assert_eq!(result.values, vec![json!("ignored"), json!("n")]);
    }

    #[test]
    fn test_referenced_names_in_appearance_order() {
        assert_eq!(referenced_names("$b $a $b $c1"), vec!["b", "a", "c1"]);
        assert!(referenced_names("SELECT $1").is_empty());
    }
}
