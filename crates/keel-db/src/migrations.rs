//! File-based SQL migration router.
//!
//! Migrations live in a directory as `NNN_name.sql` files. Each file holds an
//! up section and a down section:
//!
//! ```sql
//! -- migrate:up
//! CREATE TABLE items (id INTEGER PRIMARY KEY);
//!
//! -- migrate:down
//! DROP TABLE items;
//! ```
//!
//! Applied migrations are tracked by name in the `migratehistory` table.
//! Ordering is by name, so the zero-padded prefix assigned at creation decides
//! the order. Under normal operation the applied set is a prefix of the files;
//! the router reports but does not repair anything else.
//!
//! Every operation takes a plain `rusqlite::Connection` and blocks. Async
//! callers run them on the blocking thread pool.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

use crate::schema;
use crate::DbError;
use keel_types::ModelDef;

const HISTORY_TABLE: &str = "migratehistory";
const UP_MARKER: &str = "-- migrate:up";
const DOWN_MARKER: &str = "-- migrate:down";

/// Errors that can occur while managing migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// The name of the migration that failed.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Failed to query or update migration history.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),

    /// Reading or writing a migration file failed.
    #[error("migration file error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A migration name was requested that has no file.
    #[error("unknown migration '{0}'")]
    UnknownMigration(String),

    /// `rollback` was called with an empty history.
    #[error("no applied migrations to roll back")]
    NothingToRollback,

    /// `merge` was called with no migration files.
    #[error("no migrations to merge")]
    NothingToMerge,

    /// An applied migration's file is gone.
    #[error("migration '{0}' is recorded as applied but its file is missing")]
    MissingFile(String),

    /// `merge` would lose track of migrations that were never applied.
    #[error("{0} migration(s) are pending; apply them before merging")]
    PendingMigrations(usize),

    /// The connection could not be obtained.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Parsed contents of a migration file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationScript {
    pub up: String,
    pub down: String,
}

impl MigrationScript {
    /// Splits a file into its up and down sections. Text before any marker
    /// belongs to the up section.
    pub fn parse(source: &str) -> Self {
        let mut up = Vec::new();
        let mut down = Vec::new();
        let mut in_down = false;

        for line in source.lines() {
            match line.trim() {
                UP_MARKER => in_down = false,
                DOWN_MARKER => in_down = true,
                _ if in_down => down.push(line),
                _ => up.push(line),
            }
        }

        Self {
            up: up.join("\n").trim().to_string(),
            down: down.join("\n").trim().to_string(),
        }
    }

    /// Renders the script in file form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(UP_MARKER);
        out.push('\n');
        if !self.up.is_empty() {
            out.push_str(&self.up);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(DOWN_MARKER);
        out.push('\n');
        if !self.down.is_empty() {
            out.push_str(&self.down);
            out.push('\n');
        }
        out
    }
}

/// Applied and pending migrations, as reported by [`Router::status`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationStatus {
    pub done: Vec<String>,
    pub pending: Vec<String>,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.done {
            writeln!(f, "- [x] {name}")?;
        }
        for name in &self.pending {
            writeln!(f, "- [ ] {name}")?;
        }
        write!(f, "Done: {}, Pending: {}", self.done.len(), self.pending.len())
    }
}

/// Splits `NNN_name` into its numeric prefix.
fn number_of(name: &str) -> Option<u32> {
    let (prefix, rest) = name.split_once('_')?;
    if rest.is_empty() || prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// Lower-cases `name` and replaces anything but letters and digits with `_`.
fn clean_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "auto".to_string()
    } else {
        cleaned
    }
}

fn state_err(e: rusqlite::Error) -> MigrationError {
    MigrationError::StateQuery(e)
}

/// Compares `defs` with the live schema and returns up and down statements.
///
/// Missing tables are created and missing columns added. Nothing is ever
/// dropped: tables and columns the models no longer mention are left alone.
pub fn auto_script(conn: &Connection, defs: &[ModelDef]) -> rusqlite::Result<MigrationScript> {
    let mut up = Vec::new();
    let mut down = Vec::new();

    for def in defs {
        if !schema::table_exists(conn, &def.table)? {
            tracing::debug!(table = %def.table, "table missing from schema");
            up.push(schema::create_table_sql(def));
            down.push(schema::drop_table_sql(&def.table));
            continue;
        }

        let columns = schema::table_columns(conn, &def.table)?;
        for field in def.fields.iter().filter(|f| !columns.contains(&f.name)) {
            tracing::debug!(table = %def.table, column = %field.name, "column missing from schema");
            up.push(schema::add_column_sql(&def.table, field));
            down.push(schema::drop_column_sql(&def.table, &field.name));
        }
    }

    down.reverse();
    Ok(MigrationScript {
        up: up.join("\n"),
        down: down.join("\n"),
    })
}

/// Discovers, applies, and reverts migration files in one directory.
#[derive(Debug, Clone)]
pub struct Router {
    migrate_dir: PathBuf,
}

impl Router {
    pub fn new(migrate_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrate_dir: migrate_dir.into(),
        }
    }

    pub fn migrate_dir(&self) -> &Path {
        &self.migrate_dir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.migrate_dir.join(format!("{name}.sql"))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MigrationError + '_ {
        move |source| MigrationError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Every migration file, in order. A missing directory has none.
    pub fn todo(&self) -> Result<Vec<String>, MigrationError> {
        let entries = match fs::read_dir(&self.migrate_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.migrate_dir)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Self::io_err(&self.migrate_dir))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if number_of(stem).is_some() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn ensure_history(conn: &Connection) -> Result<(), MigrationError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(255) NOT NULL,
                migrated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );"
        ))
        .map_err(|e| MigrationError::ExecutionFailed {
            name: format!("{HISTORY_TABLE}_bootstrap"),
            source: e,
        })
    }

    /// Applied migrations, in the order they were applied.
    pub fn done(&self, conn: &Connection) -> Result<Vec<String>, MigrationError> {
        Self::ensure_history(conn)?;
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM {HISTORY_TABLE} ORDER BY id"))
            .map_err(state_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(state_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(state_err)?;
        Ok(names)
    }

    /// Migration files not yet applied, in order.
    pub fn diff(&self, conn: &Connection) -> Result<Vec<String>, MigrationError> {
        let done = self.done(conn)?;
        Ok(self
            .todo()?
            .into_iter()
            .filter(|name| !done.contains(name))
            .collect())
    }

    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus, MigrationError> {
        Ok(MigrationStatus {
            done: self.done(conn)?,
            pending: self.diff(conn)?,
        })
    }

    /// Reads and parses a migration file.
    pub fn read(&self, name: &str) -> Result<MigrationScript, MigrationError> {
        let path = self.path_of(name);
        let source = fs::read_to_string(&path).map_err(Self::io_err(&path))?;
        Ok(MigrationScript::parse(&source))
    }

    fn write(&self, name: &str, script: &MigrationScript) -> Result<(), MigrationError> {
        fs::create_dir_all(&self.migrate_dir).map_err(Self::io_err(&self.migrate_dir))?;
        let path = self.path_of(name);
        fs::write(&path, script.render()).map_err(Self::io_err(&path))
    }

    /// Writes a new migration and returns its name.
    ///
    /// With `auto`, the script is generated from the given models against the
    /// live schema; if nothing differs no file is written and `None` is
    /// returned. Without `auto` an empty script is written.
    pub fn create(
        &self,
        conn: &Connection,
        name: &str,
        auto: Option<&[ModelDef]>,
    ) -> Result<Option<String>, MigrationError> {
        let script = match auto {
            Some(defs) => {
                let script = auto_script(conn, defs).map_err(state_err)?;
                if script.up.is_empty() {
                    tracing::info!("models match the schema, no migration created");
                    return Ok(None);
                }
                script
            }
            None => MigrationScript::default(),
        };

        let next = self
            .todo()?
            .iter()
            .filter_map(|n| number_of(n))
            .max()
            .unwrap_or(0)
            + 1;
        let name = format!("{next:03}_{}", clean_name(name));
        self.write(&name, &script)?;

        tracing::info!(migration = %name, path = %self.path_of(&name).display(), "migration created");
        Ok(Some(name))
    }

    /// Applies pending migrations up to and including `target`, or all of them.
    ///
    /// Each migration runs in its own transaction together with its history
    /// row. With `fake` only the history is written. Returns the names applied.
    pub fn run(
        &self,
        conn: &Connection,
        target: Option<&str>,
        fake: bool,
    ) -> Result<Vec<String>, MigrationError> {
        let todo = self.todo()?;
        if let Some(target) = target {
            if !todo.iter().any(|n| n == target) {
                return Err(MigrationError::UnknownMigration(target.to_string()));
            }
        }

        let done = self.done(conn)?;
        let mut applied = Vec::new();

        for name in todo {
            if done.contains(&name) {
                tracing::debug!(migration = %name, "migration already applied, skipping");
            } else {
                let script = self.read(&name)?;
                self.apply(conn, &name, &script.up, fake)?;
                applied.push(name.clone());
            }
            if target == Some(name.as_str()) {
                break;
            }
        }

        if applied.is_empty() {
            tracing::info!("no migrations to apply");
        }
        Ok(applied)
    }

    fn apply(
        &self,
        conn: &Connection,
        name: &str,
        sql: &str,
        fake: bool,
    ) -> Result<(), MigrationError> {
        let failed = |source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        };

        if fake {
            tracing::info!(migration = %name, "recording migration without running it");
        } else {
            tracing::info!(migration = %name, "applying migration");
        }

        let tx = conn.unchecked_transaction().map_err(failed)?;
        if !fake && !sql.is_empty() {
            tx.execute_batch(sql).map_err(failed)?;
        }
        tx.execute(
            &format!("INSERT INTO {HISTORY_TABLE} (name) VALUES (?1)"),
            [name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)
    }

    /// Reverts the most recently applied migration and returns its name.
    pub fn rollback(&self, conn: &Connection) -> Result<String, MigrationError> {
        Self::ensure_history(conn)?;
        let last: Option<(i64, String)> = conn
            .query_row(
                &format!("SELECT id, name FROM {HISTORY_TABLE} ORDER BY id DESC LIMIT 1"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(state_err)?;
        let (id, name) = last.ok_or(MigrationError::NothingToRollback)?;

        if !self.path_of(&name).exists() {
            return Err(MigrationError::MissingFile(name));
        }
        let script = self.read(&name)?;

        tracing::info!(migration = %name, "rolling back migration");
        let failed = |source| MigrationError::ExecutionFailed {
            name: name.clone(),
            source,
        };
        let tx = conn.unchecked_transaction().map_err(failed)?;
        if !script.down.is_empty() {
            tx.execute_batch(&script.down).map_err(failed)?;
        }
        tx.execute(&format!("DELETE FROM {HISTORY_TABLE} WHERE id = ?1"), [id])
            .map_err(failed)?;
        tx.commit().map_err(failed)?;

        Ok(name)
    }

    /// Deletes every history row and returns how many there were. The schema
    /// and the files are left as they are.
    pub fn clear(&self, conn: &Connection) -> Result<usize, MigrationError> {
        Self::ensure_history(conn)?;
        let removed = conn
            .execute(&format!("DELETE FROM {HISTORY_TABLE}"), [])
            .map_err(state_err)?;
        tracing::info!(removed, "migration history cleared");
        Ok(removed)
    }

    /// Collapses every migration file into a single `001_<name>` migration.
    ///
    /// Up sections are concatenated in order and down sections in reverse.
    /// If every original was applied the merged migration is recorded as
    /// applied; if none was, it is left pending.
    pub fn merge(&self, conn: &Connection, name: &str) -> Result<String, MigrationError> {
        let todo = self.todo()?;
        if todo.is_empty() {
            return Err(MigrationError::NothingToMerge);
        }
        let pending = self.diff(conn)?.len();
        let all_done = pending == 0;
        if !all_done && pending != todo.len() {
            return Err(MigrationError::PendingMigrations(pending));
        }

        let mut ups = Vec::new();
        let mut downs = Vec::new();
        for original in &todo {
            let script = self.read(original)?;
            if !script.up.is_empty() {
                ups.push(script.up);
            }
            if !script.down.is_empty() {
                downs.push(script.down);
            }
        }
        downs.reverse();
        let merged = MigrationScript {
            up: ups.join("\n\n"),
            down: downs.join("\n\n"),
        };

        let merged_name = format!("001_{}", clean_name(name));
        let staged = self.migrate_dir.join(format!(".{merged_name}.sql.tmp"));
        fs::write(&staged, merged.render()).map_err(Self::io_err(&staged))?;

        if let Err(e) = self.swap_in_merged(conn, &todo, &staged, &merged_name, all_done) {
            if staged.exists() {
                if let Err(cleanup) = fs::remove_file(&staged) {
                    tracing::warn!(
                        path = %staged.display(),
                        error = %cleanup,
                        "staged merge file left behind"
                    );
                }
            }
            return Err(e);
        }

        tracing::info!(
            migration = %merged_name,
            merged = todo.len(),
            recorded = all_done,
            "migrations merged"
        );
        Ok(merged_name)
    }

    /// Replaces `originals` with the staged merged file and rewrites the
    /// history in one transaction. The originals are parked under `.bak`
    /// names until the transaction commits and are put back on any failure.
    fn swap_in_merged(
        &self,
        conn: &Connection,
        originals: &[String],
        staged: &Path,
        merged_name: &str,
        record: bool,
    ) -> Result<(), MigrationError> {
        let tx = conn.unchecked_transaction().map_err(state_err)?;
        tx.execute(&format!("DELETE FROM {HISTORY_TABLE}"), [])
            .map_err(state_err)?;
        if record {
            tx.execute(
                &format!("INSERT INTO {HISTORY_TABLE} (name) VALUES (?1)"),
                [merged_name],
            )
            .map_err(state_err)?;
        }

        let target = self.path_of(merged_name);
        let mut parked: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut placed = false;
        let swapped = (|| {
            for original in originals {
                let path = self.path_of(original);
                let backup = self.migrate_dir.join(format!("{original}.sql.bak"));
                fs::rename(&path, &backup).map_err(Self::io_err(&path))?;
                parked.push((path, backup));
            }
            fs::rename(staged, &target).map_err(Self::io_err(&target))?;
            placed = true;
            tx.commit().map_err(state_err)
        })();

        match swapped {
            Ok(()) => {
                for (_, backup) in &parked {
                    if let Err(e) = fs::remove_file(backup) {
                        tracing::warn!(
                            path = %backup.display(),
                            error = %e,
                            "merged migration backup left behind"
                        );
                    }
                }
                Ok(())
            }
            Err(e) => {
                if placed {
                    if let Err(undo) = fs::remove_file(&target) {
                        tracing::warn!(
                            path = %target.display(),
                            error = %undo,
                            "failed to remove merged migration"
                        );
                    }
                }
                for (path, backup) in parked.iter().rev() {
                    if let Err(undo) = fs::rename(backup, path) {
                        tracing::error!(
                            path = %path.display(),
                            error = %undo,
                            "failed to restore migration file"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}
