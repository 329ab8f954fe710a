//! Shared schema types for the keel workspace.
//!
//! A model is described by a [`ModelDef`]: a table name plus an ordered list
//! of typed [`Field`]s. Definitions carry no database handle of their own;
//! `keel-db` attaches them to a manager at registration time.
//!
//! Every model gets an implicit `id INTEGER PRIMARY KEY AUTOINCREMENT`
//! column, so `id` is not a valid field name.

use serde::{Deserialize, Serialize};

mod choices;
pub use choices::Choices;

/// Connection URI of the placeholder manager used before setup.
pub const PLACEHOLDER_URL: &str = "dummy://localhost";

/// Name of the implicit primary key column.
pub const PRIMARY_KEY: &str = "id";

/// Default length of `Char` and `Url` columns.
pub const DEFAULT_CHAR_LENGTH: u32 = 255;

/// Storage kind of a model field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Bounded string, `VARCHAR(n)`.
    Char { max_length: u32 },
    /// Unbounded string.
    Text,
    /// 64-bit integer.
    Integer,
    /// Double precision float.
    Float,
    /// Boolean stored as `0`/`1`.
    Boolean,
    /// Arbitrary JSON document stored as text.
    Json,
    /// UUID stored in hyphenated form.
    Uuid,
    /// Timezone-aware timestamp, stored as naive UTC.
    DateTimeTz,
    /// URL string. Not validated.
    Url,
    /// String restricted to a set of choices.
    StrEnum(Choices<String>),
    /// Integer restricted to a set of choices.
    IntEnum(Choices<i64>),
}

impl FieldKind {
    /// Returns the SQLite column type for this kind.
    pub fn sql_type(&self) -> String {
        match self {
            Self::Char { max_length } => format!("VARCHAR({max_length})"),
            Self::Url | Self::StrEnum(_) => format!("VARCHAR({DEFAULT_CHAR_LENGTH})"),
            Self::Text | Self::Json | Self::Uuid => "TEXT".to_string(),
            Self::Integer | Self::Boolean | Self::IntEnum(_) => "INTEGER".to_string(),
            Self::Float => "REAL".to_string(),
            Self::DateTimeTz => "DATETIME".to_string(),
        }
    }
}

/// Value a field takes when an insert omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldDefault {
    /// A fixed value.
    Value(serde_json::Value),
    /// The current UTC time. Only meaningful for `DateTimeTz`.
    Now,
}

/// A single typed column of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Storage kind.
    pub kind: FieldKind,
    /// Whether `NULL` is accepted.
    pub null: bool,
    /// Whether the column carries a `UNIQUE` constraint.
    pub unique: bool,
    /// Value applied on insert when the row omits this field.
    pub default: Option<FieldDefault>,
}

impl Field {
    /// Creates a non-null field without a default.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            null: false,
            unique: false,
            default: None,
        }
    }

    pub fn char(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Char {
                max_length: DEFAULT_CHAR_LENGTH,
            },
        )
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Uuid)
    }

    pub fn datetime_tz(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::DateTimeTz)
    }

    pub fn url(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Url)
    }

    pub fn str_enum(name: impl Into<String>, choices: Choices<String>) -> Self {
        Self::new(name, FieldKind::StrEnum(choices))
    }

    pub fn int_enum(name: impl Into<String>, choices: Choices<i64>) -> Self {
        Self::new(name, FieldKind::IntEnum(choices))
    }

    /// Allows `NULL` values.
    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Adds a `UNIQUE` constraint.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets a fixed default value.
    pub fn default_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    /// Defaults to the current time on insert.
    pub fn default_now(mut self) -> Self {
        self.default = Some(FieldDefault::Now);
        self
    }
}

/// Schema definition of a model: its table and fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    /// Table name.
    pub table: String,
    /// Fields in declaration order, excluding the implicit primary key.
    pub fields: Vec<Field>,
}

impl ModelDef {
    /// Starts a definition for `table` with no fields.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field. A field with the same name replaces the earlier one.
    ///
    /// A field named [`PRIMARY_KEY`] is ignored; every model already has it.
    pub fn field(mut self, field: Field) -> Self {
        if field.name == PRIMARY_KEY {
            return self;
        }
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Looks up a field by column name.
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Column names including the primary key, in table order.
    pub fn column_names(&self) -> Vec<&str> {
        std::iter::once(PRIMARY_KEY)
            .chain(
                self.fields
                    .iter()
                    .map(|f| f.name.as_str())
                    .filter(|name| *name != PRIMARY_KEY),
            )
            .collect()
    }
}
