//! DDL generation and schema introspection.

use rusqlite::{Connection, OptionalExtension};

use keel_types::{Field, FieldDefault, ModelDef, PRIMARY_KEY};

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders a JSON scalar as an SQL literal, `None` for anything else.
fn sql_literal(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

/// Column definition used in `CREATE TABLE`.
pub fn column_sql(field: &Field) -> String {
    let mut sql = format!("{} {}", quote_ident(&field.name), field.kind.sql_type());
    if !field.null {
        sql.push_str(" NOT NULL");
    }
    if field.unique {
        sql.push_str(" UNIQUE");
    }
    sql
}

/// `CREATE TABLE IF NOT EXISTS` for a model, with the implicit primary key.
pub fn create_table_sql(def: &ModelDef) -> String {
    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote_ident(PRIMARY_KEY)
    )];
    columns.extend(
        def.fields
            .iter()
            .filter(|f| f.name != PRIMARY_KEY)
            .map(column_sql),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({});",
        quote_ident(&def.table),
        columns.join(", ")
    )
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {};", quote_ident(table))
}

/// `ALTER TABLE ADD COLUMN` for a field.
///
/// SQLite only accepts a `NOT NULL` column here when it carries a constant
/// default, and never accepts `UNIQUE`; other fields are added as nullable.
pub fn add_column_sql(table: &str, field: &Field) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(table),
        quote_ident(&field.name),
        field.kind.sql_type()
    );
    let literal = match &field.default {
        Some(FieldDefault::Value(value)) => sql_literal(value),
        _ => None,
    };
    if let (false, Some(literal)) = (field.null, literal) {
        sql.push_str(&format!(" NOT NULL DEFAULT {literal}"));
    }
    sql.push(';');
    sql
}

pub fn drop_column_sql(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {};",
        quote_ident(table),
        quote_ident(column)
    )
}

/// Whether `table` exists in the main schema.
pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

/// Column names of `table` in table order. Empty if the table is missing.
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Creates the tables of `defs`, skipping those that exist.
pub fn create_tables(conn: &Connection, defs: &[ModelDef]) -> rusqlite::Result<()> {
    for def in defs {
        tracing::debug!(table = %def.table, "creating table");
        conn.execute_batch(&create_table_sql(def))?;
    }
    Ok(())
}

/// Drops the tables of `defs` in reverse order, skipping missing ones.
pub fn drop_tables(conn: &Connection, defs: &[ModelDef]) -> rusqlite::Result<()> {
    for def in defs.iter().rev() {
        tracing::debug!(table = %def.table, "dropping table");
        conn.execute_batch(&drop_table_sql(&def.table))?;
    }
    Ok(())
}
