//! Row operations on registered models.
//!
//! Rows cross the API as JSON objects keyed by column name. Values are
//! converted per field by [`crate::codec`].

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension, Row};
use serde_json::{Map, Value as JsonValue};

use crate::codec;
use crate::registry::RegisteredModel;
use crate::schema::quote_ident;
use crate::scope::DbConnection;
use crate::DbError;
use keel_types::{ModelDef, PRIMARY_KEY};

/// A row as a JSON object.
pub type RowData = Map<String, JsonValue>;

fn select_sql(def: &ModelDef) -> String {
    let columns: Vec<String> = def.column_names().iter().map(|c| quote_ident(c)).collect();
    format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&def.table))
}

fn decode_row(def: &ModelDef, row: &Row<'_>) -> rusqlite::Result<RowData> {
    let mut out = Map::new();
    out.insert(PRIMARY_KEY.to_string(), JsonValue::from(row.get::<_, i64>(0)?));
    for (idx, field) in def.fields.iter().enumerate() {
        let value: SqlValue = row.get(idx + 1)?;
        out.insert(field.name.clone(), codec::from_sql(field, value));
    }
    Ok(out)
}

/// Builds the column list and values for an insert, applying defaults.
fn encode_insert(def: &ModelDef, row: &RowData) -> Result<(Vec<String>, Vec<SqlValue>), DbError> {
    if let Some(unknown) = row
        .keys()
        .find(|k| k.as_str() != PRIMARY_KEY && def.get_field(k).is_none())
    {
        return Err(DbError::UnknownField {
            table: def.table.clone(),
            field: unknown.clone(),
        });
    }

    let mut columns = Vec::new();
    let mut values = Vec::new();

    if let Some(id) = row.get(PRIMARY_KEY).filter(|v| !v.is_null()) {
        let id = id.as_i64().ok_or_else(|| DbError::InvalidValue {
            field: PRIMARY_KEY.to_string(),
            reason: format!("expected an integer, got {id}"),
        })?;
        columns.push(quote_ident(PRIMARY_KEY));
        values.push(SqlValue::Integer(id));
    }

    for field in &def.fields {
        let value = match row.get(&field.name) {
            Some(value) => Some(value.clone()),
            None => codec::default_for(field),
        };
        if let Some(value) = value {
            columns.push(quote_ident(&field.name));
            values.push(codec::to_sql(field, &value)?);
        }
    }

    Ok((columns, values))
}

impl RegisteredModel {
    /// Inserts a row and returns its primary key.
    ///
    /// Omitted fields take their defaults; fields without a default are left
    /// to the column definition, so a missing non-null field fails in SQLite.
    pub async fn insert(&self, conn: &DbConnection, row: RowData) -> Result<i64, DbError> {
        let def = self.def().clone();
        let (columns, values) = encode_insert(&def, &row)?;
        conn.run(move |c| {
            if columns.is_empty() {
                c.execute(
                    &format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&def.table)),
                    [],
                )?;
            } else {
                let placeholders: Vec<String> =
                    (1..=values.len()).map(|i| format!("?{i}")).collect();
                c.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote_ident(&def.table),
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    params_from_iter(values.iter()),
                )?;
            }
            Ok(c.last_insert_rowid())
        })
        .await
    }

    /// Returns every row ordered by primary key.
    pub async fn fetch_all(&self, conn: &DbConnection) -> Result<Vec<RowData>, DbError> {
        let def = self.def().clone();
        conn.run(move |c| {
            let mut stmt = c.prepare(&format!(
                "{} ORDER BY {}",
                select_sql(&def),
                quote_ident(PRIMARY_KEY)
            ))?;
            let rows = stmt
                .query_map([], |row| decode_row(&def, row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Returns the row with primary key `id`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotFound` if no such row exists.
    pub async fn get(&self, conn: &DbConnection, id: i64) -> Result<RowData, DbError> {
        let def = self.def().clone();
        conn.run(move |c| {
            let row = c
                .query_row(
                    &format!(
                        "{} WHERE {} = ?1",
                        select_sql(&def),
                        quote_ident(PRIMARY_KEY)
                    ),
                    [id],
                    |row| decode_row(&def, row),
                )
                .optional()?;
            row.ok_or(DbError::NotFound {
                table: def.table.clone(),
                id,
            })
        })
        .await
    }

    /// Counts the rows in the model's table.
    pub async fn count(&self, conn: &DbConnection) -> Result<i64, DbError> {
        let table = self.table().to_string();
        conn.run(move |c| {
            Ok(c.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&table)),
                [],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// Deletes every row and returns how many were removed.
    pub async fn delete_all(&self, conn: &DbConnection) -> Result<usize, DbError> {
        let table = self.table().to_string();
        conn.run(move |c| Ok(c.execute(&format!("DELETE FROM {}", quote_ident(&table)), [])?))
            .await
    }
}
