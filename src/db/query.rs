use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use std::error::Error as StdError;
use std::fmt;
use std::net::IpAddr;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Row, SimpleQueryRow};
use uuid::Uuid;

/// Categorized error types for SQL query failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Structured error with context from PostgreSQL error responses.
#[derive(Debug, Clone)]
pub struct StructuredError {
    pub category: ErrorCategory,
    /// PostgreSQL severity (ERROR, FATAL, etc.)
    pub severity: String,
    /// SQLSTATE error code (e.g., "42601" for syntax_error)
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Character position in the query where the error occurred (1-based byte offset)
    pub position: Option<u32>,
    /// Computed line number (1-based) from position, if available
    pub line: Option<usize>,
    /// Computed column number (1-based) from position, if available
    pub col: Option<usize>,
}

impl StructuredError {
    /// Create a StructuredError from a tokio_postgres error, using the query text
    /// to compute line/column from the byte position.
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code_str = db_err.code().code().to_string();
            let category = categorize_sqlstate(&code_str);
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });

            let (line, col) = if let Some(pos) = position {
                byte_offset_to_line_col(query, pos as usize)
            } else {
                (None, None)
            };

            StructuredError {
                category,
                severity: db_err.severity().to_string(),
                code: code_str,
                message: db_err.message().to_string(),
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
                position,
                line,
                col,
            }
        } else {
            // Non-database error (connection, protocol, etc.)
            let category = if err.source().is_some() || err.is_closed() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            StructuredError {
                category,
                severity: "ERROR".to_string(),
                code: String::new(),
                message: err.to_string(),
                detail: err.source().map(|e| e.to_string()),
                hint: None,
                position: None,
                line: None,
                col: None,
            }
        }
    }

    /// Create a simple error from a plain string (for non-database errors).
    pub fn from_string(msg: String) -> Self {
        StructuredError {
            category: ErrorCategory::Unknown,
            severity: "ERROR".to_string(),
            code: String::new(),
            message: msg,
            detail: None,
            hint: None,
            position: None,
            line: None,
            col: None,
        }
    }

    /// Format as a rich multi-line string for logs.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }

        lines.join("\n")
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || query.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(query.len()); // PostgreSQL positions are 1-based
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 = syntax_error, everything else in class 42 is semantic
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Rows and metadata produced by one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResult {
    /// Command tag keyword (`SELECT`, `INSERT`, ...).
    pub command: String,
    /// Rows returned, or rows affected for statements without output.
    pub row_count: u64,
    pub rows: Vec<Value>,
}

/// Leading keyword of a statement, upper-cased.
pub fn leading_command(sql: &str) -> String {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

/// Command tag of one statement, used since the extended protocol does not
/// surface it. Data-modifying `WITH` queries report their outer command.
pub fn command_tag(sql: &str) -> String {
    let parsed = SqlParser::parse_sql(&PostgreSqlDialect {}, sql).ok();
    match parsed.as_deref() {
        Some([Statement::Query(query)]) => match query.body.as_ref() {
            SetExpr::Insert(_) => "INSERT".to_string(),
            SetExpr::Update(_) => "UPDATE".to_string(),
            _ => "SELECT".to_string(),
        },
        _ => leading_command(sql),
    }
}

/// Split `sql` on top-level `;`. Quoted strings, quoted identifiers,
/// dollar-quoted bodies and comments are skipped; pieces holding only
/// whitespace or comments are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;
    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        i = match bytes[i] {
            b'-' if next == Some(b'-') => skip_line_comment(bytes, i),
            b'/' if next == Some(b'*') => skip_block_comment(bytes, i),
            b';' => {
                if has_code {
                    statements.push(sql[start..i].trim());
                }
                has_code = false;
                start = i + 1;
                i + 1
            }
            b if b.is_ascii_whitespace() => i + 1,
            b => {
                has_code = true;
                match b {
                    b'\'' => skip_quoted(bytes, i, b'\'', is_escape_string(bytes, i)),
                    b'"' => skip_quoted(bytes, i, b'"', false),
                    b'$' => skip_dollar_quoted(sql, i),
                    _ => i + 1,
                }
            }
        };
    }
    if has_code {
        statements.push(sql[start..].trim());
    }
    statements
}

/// `E'...'` strings take backslash escapes.
fn is_escape_string(bytes: &[u8], quote: usize) -> bool {
    quote > 0
        && matches!(bytes[quote - 1], b'E' | b'e')
        && (quote == 1 || !is_word_byte(bytes[quote - 2]))
}

fn skip_quoted(bytes: &[u8], open: usize, quote: u8, backslash: bool) -> usize {
    let mut j = open + 1;
    while j < bytes.len() {
        if backslash && bytes[j] == b'\\' {
            j += 2;
        } else if bytes[j] == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
            } else {
                return j + 1;
            }
        } else {
            j += 1;
        }
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut j = start;
    while j + 1 < bytes.len() {
        match (bytes[j], bytes[j + 1]) {
            (b'/', b'*') => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return j;
                }
            }
            _ => j += 1,
        }
    }
    bytes.len()
}

/// Skip `$tag$ ... $tag$`. A `$` that does not open a dollar quote (a
/// positional parameter, or part of an identifier) is a single byte.
fn skip_dollar_quoted(sql: &str, start: usize) -> usize {
    let bytes = sql.as_bytes();
    if start > 0 && is_word_byte(bytes[start - 1]) {
        return start + 1;
    }
    let mut j = start + 1;
    while j < bytes.len() && is_word_byte(bytes[j]) {
        j += 1;
    }
    let opens = bytes.get(j) == Some(&b'$')
        && !bytes.get(start + 1).is_some_and(|b| b.is_ascii_digit());
    if !opens {
        return start + 1;
    }
    let delimiter = &sql[start..=j];
    sql[j + 1..]
        .find(delimiter)
        .map_or(sql.len(), |p| j + 1 + p + delimiter.len())
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[derive(Debug, Clone)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
    Array(Vec<CellValue>),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_rfc3339(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(items) => {
                let items: Vec<String> = items.iter().map(CellValue::display).collect();
                format!("{{{}}}", items.join(","))
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int16(i) => serde_json::json!(*i),
            CellValue::Int32(i) => serde_json::json!(*i),
            CellValue::Int64(i) => serde_json::json!(*i),
            CellValue::Float32(f) => serde_json::json!(*f),
            CellValue::Float64(f) => serde_json::json!(*f),
            CellValue::Json(j) => j.clone(),
            CellValue::Bytes(b) => Value::Array(b.iter().map(|x| serde_json::json!(*x)).collect()),
            CellValue::Array(items) => Value::Array(items.iter().map(CellValue::to_json).collect()),
            other => Value::String(other.display()),
        }
    }
}

type DecodeError = Box<dyn StdError + Sync + Send>;

/// Decodes any column. Types with no JSON-native form (NUMERIC, UUID,
/// INTERVAL, INET, MONEY, enums) become their PostgreSQL text form.
impl<'a> FromSql<'a> for CellValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        let value = match *ty {
            Type::BOOL => CellValue::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => CellValue::Int16(i16::from_sql(ty, raw)?),
            Type::INT4 => CellValue::Int32(i32::from_sql(ty, raw)?),
            Type::INT8 => CellValue::Int64(i64::from_sql(ty, raw)?),
            Type::OID => CellValue::Int64(u32::from_sql(ty, raw)?.into()),
            Type::FLOAT4 => CellValue::Float32(f32::from_sql(ty, raw)?),
            Type::FLOAT8 => CellValue::Float64(f64::from_sql(ty, raw)?),
            Type::NUMERIC => CellValue::Text(decode_numeric(ty, raw)?),
            Type::MONEY => CellValue::Text(format_money(i64::from_sql(&Type::INT8, raw)?)),
            Type::CHAR => CellValue::Text(char::from(i8::from_sql(ty, raw)? as u8).to_string()),
            Type::BYTEA => CellValue::Bytes(Vec::<u8>::from_sql(ty, raw)?),
            Type::DATE => CellValue::Date(NaiveDate::from_sql(ty, raw)?),
            Type::TIME => CellValue::Time(NaiveTime::from_sql(ty, raw)?),
            Type::TIMESTAMP => CellValue::DateTime(NaiveDateTime::from_sql(ty, raw)?),
            Type::TIMESTAMPTZ => CellValue::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
            Type::INTERVAL => CellValue::Text(decode_interval(raw)?),
            Type::UUID => CellValue::Text(Uuid::from_sql(ty, raw)?.to_string()),
            Type::INET | Type::CIDR => CellValue::Text(decode_inet(raw, *ty == Type::CIDR)?),
            Type::JSON | Type::JSONB => CellValue::Json(Value::from_sql(ty, raw)?),
            Type::XML => CellValue::Text(std::str::from_utf8(raw)?.to_string()),
            _ => match ty.kind() {
                Kind::Array(_) => CellValue::Array(Vec::<CellValue>::from_sql(ty, raw)?),
                Kind::Enum(_) => CellValue::Text(std::str::from_utf8(raw)?.to_string()),
                _ if <&'a str as FromSql<'a>>::accepts(ty) => {
                    CellValue::Text(<&'a str as FromSql<'a>>::from_sql(ty, raw)?.to_string())
                }
                _ => return Err(format!("no decoder for type {}", ty).into()),
            },
        };
        Ok(value)
    }

    fn from_sql_null(_: &Type) -> Result<Self, DecodeError> {
        Ok(CellValue::Null)
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_numeric(ty: &Type, raw: &[u8]) -> Result<String, DecodeError> {
    // sign word of the special values
    match raw.get(4..6) {
        Some([0xC0, 0x00]) => return Ok("NaN".to_string()),
        Some([0xD0, 0x00]) => return Ok("Infinity".to_string()),
        Some([0xF0, 0x00]) => return Ok("-Infinity".to_string()),
        _ => {}
    }
    Ok(Decimal::from_sql(ty, raw)?.to_string())
}

fn decode_interval(raw: &[u8]) -> Result<String, DecodeError> {
    if raw.len() != 16 {
        return Err("invalid interval value".into());
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into()?);
    let days = i32::from_be_bytes(raw[8..12].try_into()?);
    let months = i32::from_be_bytes(raw[12..16].try_into()?);
    Ok(format_interval(months, days, micros))
}

/// Interval in PostgreSQL's default output style, e.g. `1 year 2 mons 3 days 04:05:06.5`.
fn format_interval(months: i32, days: i32, micros: i64) -> String {
    let mut parts = Vec::new();
    let mut negative = false;
    for (value, unit) in [(months / 12, "year"), (months % 12, "mon"), (days, "day")] {
        if value != 0 {
            let plural = if value == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", value, unit, plural));
            negative |= value < 0;
        }
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 {
            "-"
        } else if negative {
            "+"
        } else {
            ""
        };
        let abs = micros.unsigned_abs();
        let secs = abs / 1_000_000;
        let mut time = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let frac = abs % 1_000_000;
        if frac != 0 {
            time.push('.');
            time.push_str(format!("{:06}", frac).trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}

fn decode_inet(raw: &[u8], cidr: bool) -> Result<String, DecodeError> {
    let [family, bits, _, _, address @ ..] = raw else {
        return Err("invalid inet value".into());
    };
    let ip = match (*family, address.len()) {
        (2, 4) => IpAddr::from(<[u8; 4]>::try_from(address)?),
        (3, 16) => IpAddr::from(<[u8; 16]>::try_from(address)?),
        _ => return Err("invalid inet value".into()),
    };
    let max_bits = if ip.is_ipv4() { 32 } else { 128 };
    Ok(if cidr || *bits != max_bits {
        format!("{}/{}", ip, bits)
    } else {
        ip.to_string()
    })
}

fn format_money(cents: i64) -> String {
    let abs = cents.unsigned_abs();
    let whole = (abs / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if cents < 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, abs % 100)
}

/// Convert a row into a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> Value {
    let mut obj = Map::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        obj.insert(col.name().to_string(), extract_value(row, i, col.name()).to_json());
    }
    Value::Object(obj)
}

fn extract_value(row: &Row, idx: usize, name: &str) -> CellValue {
    row.try_get::<_, CellValue>(idx).unwrap_or_else(|e| {
        tracing::warn!("Column {} could not be decoded, returning null: {}", name, e);
        CellValue::Null
    })
}

/// Convert a simple-protocol row. Values arrive as text; given the column
/// `types` they take the same JSON shapes as binary rows.
pub fn simple_row_to_json(row: &SimpleQueryRow, types: Option<&[Type]>) -> Value {
    let mut obj = Map::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        let value = match (row.get(i), types.and_then(|t| t.get(i))) {
            (None, _) => Value::Null,
            (Some(text), Some(ty)) => text_to_json(ty, text),
            (Some(text), None) => Value::String(text.to_string()),
        };
        obj.insert(col.name().to_string(), value);
    }
    Value::Object(obj)
}

/// A text-format value of type `ty` as JSON. Text that does not parse stays
/// a string.
fn text_to_json(ty: &Type, text: &str) -> Value {
    let parsed = match *ty {
        Type::BOOL => match text {
            "t" => Some(Value::Bool(true)),
            "f" => Some(Value::Bool(false)),
            _ => None,
        },
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => {
            text.parse::<i64>().ok().map(Value::from)
        }
        Type::FLOAT4 => text.parse().ok().map(|f| CellValue::Float32(f).to_json()),
        Type::FLOAT8 => text.parse().ok().map(|f| CellValue::Float64(f).to_json()),
        Type::JSON | Type::JSONB => serde_json::from_str(text).ok(),
        Type::BYTEA => decode_bytea_hex(text).map(|b| CellValue::Bytes(b).to_json()),
        Type::TIME => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
            .ok()
            .map(|t| CellValue::Time(t).to_json()),
        Type::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|t| CellValue::DateTime(t).to_json()),
        Type::TIMESTAMPTZ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .ok()
            .map(|t| CellValue::TimestampTz(t.with_timezone(&Utc)).to_json()),
        _ => match ty.kind() {
            Kind::Array(member) => parse_array_literal(text).map(|items| {
                items
                    .into_iter()
                    .map(|item| match item {
                        Some(item) => text_to_json(member, &item),
                        None => Value::Null,
                    })
                    .collect()
            }),
            _ => None,
        },
    };
    parsed.unwrap_or_else(|| Value::String(text.to_string()))
}

fn decode_bytea_hex(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Elements of a one-dimensional array literal such as `{1,NULL,"a b"}`.
/// Nested arrays are left alone.
fn parse_array_literal(text: &str) -> Option<Vec<Option<String>>> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    let mut items = Vec::new();
    if inner.is_empty() {
        return Some(items);
    }
    let mut chars = inner.chars().peekable();
    loop {
        match chars.peek() {
            Some('{') => return None,
            Some('"') => {
                chars.next();
                let mut item = String::new();
                loop {
                    match chars.next()? {
                        '\\' => item.push(chars.next()?),
                        '"' => break,
                        c => item.push(c),
                    }
                }
                items.push(Some(item));
            }
            _ => {
                let mut item = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    item.push(c);
                    chars.next();
                }
                items.push((item != "NULL").then_some(item));
            }
        }
        match chars.next() {
            Some(',') => {}
            None => return Some(items),
            Some(_) => return None,
        }
    }
}
