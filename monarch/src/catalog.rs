//! Migration files on disk.
//!
//! A migration is a file named `<14-digit UTC timestamp><title>.lua`. Sorting
//! by name is therefore sorting by creation time. Everything else in the
//! directory, including `template.lua`, is ignored.

use crate::error::Error;
use chrono::{DateTime, Utc};
use minijinja::{context, Environment};
use regex::{Captures, Regex};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const SCRIPT_EXTENSION: &str = "lua";
pub const TEMPLATE_FILE_NAME: &str = "template.lua";

const DEFAULT_TEMPLATE: &str = include_str!("template.lua");

static MIGRATION_FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{14}.*\.lua$").expect("migration file pattern"));
static UNDERSCORE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_+([a-zA-Z0-9])").expect("underscore pattern"));

/// A file recognised as a migration. Only names matching the naming pattern
/// can be turned into one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationFile {
    name: String,
}

impl MigrationFile {
    pub fn parse(name: &str) -> Option<Self> {
        MIGRATION_FILE_NAME.is_match(name).then(|| MigrationFile {
            name: name.to_string(),
        })
    }

    /// The file name, which is also the migration id in the metadata table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `YYYYMMDDHHMMSS` prefix.
    pub fn timestamp(&self) -> &str {
        &self.name[..14]
    }
}

impl std::fmt::Display for MigrationFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// The migrations directory.
#[derive(Debug, Clone)]
pub struct Catalog {
    directory: PathBuf,
}

impl Catalog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn template_path(&self) -> PathBuf {
        self.directory.join(TEMPLATE_FILE_NAME)
    }

    pub fn migration_path(&self, file: &MigrationFile) -> PathBuf {
        self.directory.join(file.name())
    }

    pub fn validate_directory(&self) -> Result<(), Error> {
        match fs::metadata(&self.directory) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(Error::NotADirectory(self.directory.clone())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::DirectoryNotFound(self.directory.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create the directory if needed and seed it with the default template.
    /// Existing templates are left alone.
    pub fn init_directory(&self) -> Result<(), Error> {
        match fs::metadata(&self.directory) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(Error::NotADirectory(self.directory.clone()))
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.directory)?;
                tracing::info!(directory = %self.directory.display(), "created migrations directory");
            }
            Err(err) => return Err(err.into()),
        }

        let template = self.template_path();
        if !template.exists() {
            fs::write(&template, DEFAULT_TEMPLATE)?;
            tracing::info!(template = %template.display(), "wrote default template");
        }

        Ok(())
    }

    /// All migration files, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationFile>, Error> {
        self.validate_directory()?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let Some(file) = entry.file_name().to_str().and_then(MigrationFile::parse) else {
                continue;
            };
            if entry.path().is_file() {
                files.push(file);
            }
        }
        files.sort();

        Ok(files)
    }

    /// Find the migration a user referred to. Accepts a bare file name, a
    /// path, or a name without the `.lua` extension.
    pub fn resolve(&self, name: &str) -> Result<MigrationFile, Error> {
        let base = Path::new(name)
            .file_name()
            .and_then(|base| base.to_str())
            .unwrap_or(name);
        let file_name = if base.ends_with(&format!(".{}", SCRIPT_EXTENSION)) {
            base.to_string()
        } else {
            format!("{}.{}", base, SCRIPT_EXTENSION)
        };

        match MigrationFile::parse(&file_name) {
            Some(file) if self.migration_path(&file).is_file() => Ok(file),
            _ => Err(Error::UnknownMigrationFile(file_name)),
        }
    }

    /// Write a new migration from the directory's template.
    ///
    /// The template is rendered before the file is created, and the file is
    /// created with create-new semantics, so a failure never leaves a partial
    /// or overwritten file behind.
    pub fn create(&self, title: &str, now: DateTime<Utc>) -> Result<PathBuf, Error> {
        self.validate_directory()?;

        let file_name = file_name_for(title, now);
        let path = self.directory.join(&file_name);
        if path.exists() {
            return Err(Error::FileExists(path));
        }

        let template_path = self.template_path();
        let template = match fs::read_to_string(&template_path) {
            Ok(template) => template,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::TemplateNotFound(template_path))
            }
            Err(err) => return Err(err.into()),
        };

        let migration_name = file_name.trim_end_matches(&format!(".{}", SCRIPT_EXTENSION));
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        let rendered = env.render_str(&template, context! { migration_name => migration_name })?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::FileExists(path))
            }
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = file.write_all(rendered.as_bytes()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }

        tracing::info!(file = %path.display(), "created migration");
        Ok(path)
    }
}

/// `<now as YYYYMMDDHHMMSS><Title>.lua`
pub fn file_name_for(title: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}{}.{}",
        now.format("%Y%m%d%H%M%S"),
        to_camel_case(title),
        SCRIPT_EXTENSION
    )
}

/// `add_users_table` becomes `AddUsersTable`.
pub fn to_camel_case(name: &str) -> String {
    let camel = UNDERSCORE_RUN.replace_all(name, |caps: &Captures| caps[1].to_uppercase());
    let mut chars = camel.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
