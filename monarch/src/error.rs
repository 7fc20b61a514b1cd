use std::path::PathBuf;

/// Error type for the monarch crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Server errors display the server's own message.
    #[error("{}", postgres_message(.0))]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Lua(#[from] mlua::Error),
    #[error("{0}")]
    Template(#[from] minijinja::Error),
    /// A query returned a column whose type has no script representation.
    #[error(
        "column {column_name} (index {column_index}) is of an unsupported type ({type_name}); \
        cast the value to a varchar or another type in your SQL query"
    )]
    UnsupportedType {
        /// 1-based position of the column in the result.
        column_index: usize,
        column_name: String,
        type_name: String,
    },
    #[error("parameter {position} is of an unsupported type ({type_name}); pass a string, number, boolean or nil")]
    UnsupportedParameter { position: usize, type_name: String },
    /// A statement was issued while the rows of a previous query were still open.
    #[error("conn busy: read every row of the previous query or call close() on it first")]
    ConnectionBusy,
    #[error("migrations directory {} does not exist; run `monarch init` first", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("template file {} not found", .0.display())]
    TemplateNotFound(PathBuf),
    #[error("file {} already exists", .0.display())]
    FileExists(PathBuf),
    #[error("{0} is not a valid migration name (^[a-zA-Z0-9_]+$)")]
    InvalidName(String),
    #[error("migration file {0} does not exist")]
    UnknownMigrationFile(String),
    #[error("cannot reapply {0} because it has not yet been run; use `monarch migrate` first")]
    NotYetMigrated(String),
    #[error("migration {name} failed: {source}")]
    MigrationFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("migration run cancelled")]
    Cancelled,
    #[error("migration run exceeded its deadline")]
    DeadlineExceeded,
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

fn postgres_message(err: &postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.to_string(),
        None => err.to_string(),
    }
}

impl Error {
    /// The error that actually stopped a run.
    ///
    /// Unwraps [`Error::MigrationFailed`] and looks through the Lua error chain for
    /// an error raised by the `db` API, so callers can match on
    /// [`Error::UnsupportedType`] or [`Error::ConnectionBusy`] even though the
    /// script runtime wrapped it.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::MigrationFailed { source, .. } => source.root_cause(),
            Error::Lua(err) => lua_cause(err).map_or(self, Error::root_cause),
            _ => self,
        }
    }
}

fn lua_cause(err: &mlua::Error) -> Option<&Error> {
    match err {
        mlua::Error::CallbackError { cause, .. } => lua_cause(cause),
        mlua::Error::WithContext { cause, .. } => lua_cause(cause),
        mlua::Error::ExternalError(external) => external.downcast_ref::<Error>(),
        _ => None,
    }
}
