//! Conversion between JSON values and SQLite values, per field kind.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;

use crate::DbError;
use keel_types::{Field, FieldDefault, FieldKind};

const STORED_DATETIME: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn invalid(field: &Field, reason: impl Into<String>) -> DbError {
    DbError::InvalidValue {
        field: field.name.clone(),
        reason: reason.into(),
    }
}

fn expect_str<'a>(field: &Field, value: &'a JsonValue) -> Result<&'a str, DbError> {
    value
        .as_str()
        .ok_or_else(|| invalid(field, format!("expected a string, got {value}")))
}

fn expect_i64(field: &Field, value: &JsonValue) -> Result<i64, DbError> {
    value
        .as_i64()
        .ok_or_else(|| invalid(field, format!("expected an integer, got {value}")))
}

/// Converts a value for storage in `field`'s column.
///
/// # Errors
///
/// Returns `DbError::InvalidValue` when the value has the wrong shape and
/// `DbError::InvalidChoice` when an enum value is not one of the choices.
pub fn to_sql(field: &Field, value: &JsonValue) -> Result<SqlValue, DbError> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    let converted = match &field.kind {
        FieldKind::Char { .. } | FieldKind::Text | FieldKind::Url => {
            SqlValue::Text(expect_str(field, value)?.to_string())
        }
        FieldKind::Integer => SqlValue::Integer(expect_i64(field, value)?),
        FieldKind::Float => SqlValue::Real(
            value
                .as_f64()
                .ok_or_else(|| invalid(field, format!("expected a number, got {value}")))?,
        ),
        FieldKind::Boolean => {
            let b = value
                .as_bool()
                .ok_or_else(|| invalid(field, format!("expected a boolean, got {value}")))?;
            SqlValue::Integer(i64::from(b))
        }
        FieldKind::Json => SqlValue::Text(value.to_string()),
        FieldKind::Uuid => {
            let raw = expect_str(field, value)?;
            let parsed = uuid::Uuid::parse_str(raw).map_err(|e| invalid(field, e.to_string()))?;
            SqlValue::Text(parsed.hyphenated().to_string())
        }
        FieldKind::DateTimeTz => {
            let raw = expect_str(field, value)?;
            let parsed =
                DateTime::parse_from_rfc3339(raw).map_err(|e| invalid(field, e.to_string()))?;
            SqlValue::Text(
                parsed
                    .with_timezone(&Utc)
                    .naive_utc()
                    .format(STORED_DATETIME)
                    .to_string(),
            )
        }
        FieldKind::StrEnum(choices) => {
            let raw = expect_str(field, value)?.to_string();
            if !choices.contains_value(&raw) {
                return Err(DbError::InvalidChoice {
                    field: field.name.clone(),
                    value: value.to_string(),
                    choices: choices.to_string(),
                });
            }
            SqlValue::Text(raw)
        }
        FieldKind::IntEnum(choices) => {
            let raw = expect_i64(field, value)?;
            if !choices.contains_value(&raw) {
                return Err(DbError::InvalidChoice {
                    field: field.name.clone(),
                    value: value.to_string(),
                    choices: choices.to_string(),
                });
            }
            SqlValue::Integer(raw)
        }
    };
    Ok(converted)
}

fn parse_stored_datetime(raw: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn plain(value: SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(i) => JsonValue::from(i),
        SqlValue::Real(f) => JsonValue::from(f),
        SqlValue::Text(s) => JsonValue::String(s),
        SqlValue::Blob(bytes) => JsonValue::from(bytes),
    }
}

/// Converts a stored value back into JSON for `field`.
///
/// JSON text that does not parse and timestamps in an unknown format come
/// back as plain strings.
pub fn from_sql(field: &Field, value: SqlValue) -> JsonValue {
    match (&field.kind, value) {
        (_, SqlValue::Null) => JsonValue::Null,
        (FieldKind::Boolean, SqlValue::Integer(i)) => JsonValue::Bool(i != 0),
        (FieldKind::Float, SqlValue::Integer(i)) => JsonValue::from(i as f64),
        (FieldKind::Json, SqlValue::Text(text)) => {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
        (FieldKind::DateTimeTz, SqlValue::Text(text)) => match parse_stored_datetime(&text) {
            Some(dt) => JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => JsonValue::String(text),
        },
        (_, other) => plain(other),
    }
}

/// The value an insert uses when the row omits `field`.
pub fn default_for(field: &Field) -> Option<JsonValue> {
    match field.default.as_ref()? {
        FieldDefault::Value(value) => Some(value.clone()),
        FieldDefault::Now => Some(JsonValue::String(
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::Choices;
    use serde_json::json;

    #[test]
    fn json_is_stored_as_text() {
        let field = Field::json("json");
        let stored = to_sql(&field, &json!({"key": "value"})).unwrap();
        assert_eq!(stored, SqlValue::Text("{\"key\":\"value\"}".to_string()));
        assert_eq!(from_sql(&field, stored), json!({"key": "value"}));
    }

    #[test]
    fn unparsable_json_comes_back_as_string() {
        let field = Field::json("json");
        assert_eq!(
            from_sql(&field, SqlValue::Text("not json".to_string())),
            json!("not json")
        );
    }

    #[test]
    fn enum_values_are_checked() {
        let str_enum = Field::str_enum(
            "str_enum",
            Choices::from_pairs([("a", "A".to_string()), ("b", "B".to_string())]),
        );
        assert_eq!(
            to_sql(&str_enum, &json!("A")).unwrap(),
            SqlValue::Text("A".to_string())
        );
        match to_sql(&str_enum, &json!("a")) {
            Err(DbError::InvalidChoice { field, choices, .. }) => {
                assert_eq!(field, "str_enum");
                assert_eq!(choices, "a, b");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let int_enum = Field::int_enum("int_enum", Choices::from_pairs([("a", 1), ("b", 2)]));
        assert_eq!(to_sql(&int_enum, &json!(2)).unwrap(), SqlValue::Integer(2));
        assert!(matches!(
            to_sql(&int_enum, &json!(3)),
            Err(DbError::InvalidChoice { .. })
        ));
    }

    #[test]
    fn datetimes_are_stored_as_naive_utc() {
        let field = Field::datetime_tz("created");
        let stored = to_sql(&field, &json!("2024-03-01T12:30:00+02:00")).unwrap();
        assert_eq!(
            stored,
            SqlValue::Text("2024-03-01 10:30:00.000000".to_string())
        );
        assert_eq!(
            from_sql(&field, stored),
            json!("2024-03-01T10:30:00.000000Z")
        );
    }

    #[test]
    fn invalid_datetime_is_rejected() {
        let field = Field::datetime_tz("created");
        assert!(matches!(
            to_sql(&field, &json!("yesterday")),
            Err(DbError::InvalidValue { .. })
        ));
    }

    #[test]
    fn uuids_are_normalised() {
        let field = Field::uuid("data");
        let stored = to_sql(&field, &json!("67E55044-10B1-426F-9247-BB680E5FE0C8")).unwrap();
        assert_eq!(
            stored,
            SqlValue::Text("67e55044-10b1-426f-9247-bb680e5fe0c8".to_string())
        );
        assert!(to_sql(&field, &json!("nope")).is_err());
    }

    #[test]
    fn booleans_round_trip_through_integers() {
        let field = Field::boolean("flag");
        let stored = to_sql(&field, &json!(true)).unwrap();
        assert_eq!(stored, SqlValue::Integer(1));
        assert_eq!(from_sql(&field, stored), json!(true));
    }

    #[test]
    fn wrong_shapes_are_rejected() {
        assert!(to_sql(&Field::char("c"), &json!(1)).is_err());
        assert!(to_sql(&Field::integer("i"), &json!("1")).is_err());
        assert_eq!(
            to_sql(&Field::integer("i"), &JsonValue::Null).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn defaults() {
        assert_eq!(default_for(&Field::char("c")), None);
        assert_eq!(
            default_for(&Field::json("j").default_value(json!({}))),
            Some(json!({}))
        );
        let now = default_for(&Field::datetime_tz("t").default_now()).unwrap();
        assert!(now.as_str().unwrap().ends_with('Z'));
    }
}
