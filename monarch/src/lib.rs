//! `monarch` applies PostgreSQL schema migrations written as Lua scripts.
//!
//! A migrations directory holds a `template.lua` and any number of scripts
//! named `<YYYYMMDDHHMMSS><Title>.lua`. Scripts run in file-name order inside
//! a sandboxed Lua 5.4 state and talk to the database through a small `db`
//! API:
//!
//! ```lua
//! db.execute("CREATE TABLE users (id uuid PRIMARY KEY, name text NOT NULL)")
//! db.execute("INSERT INTO users VALUES ($1, $2)", { "00112233-4455-6677-8899-aabbccddeeff", "ada" })
//!
//! local columns, rows = db.query("SELECT id, name FROM users WHERE name = $1", { "ada" })
//! for row in rows do
//!     print(row.id, row[2])
//! end
//! ```
//!
//! Every pending script of a run shares one transaction. Applied scripts are
//! recorded in a `migrations` table and never run again, except through
//! [`Migrator::reapply`], which exposes `runconfig.reapply == true` to the
//! script.
//!
//! # Values
//!
//! Query results are converted to Lua values column by column: text, varchar,
//! bytea, uuid and numeric become strings (numeric keeps its exact decimal
//! text), booleans become booleans, integers become integers and floats
//! become floats. Any other column type fails with
//! [`Error::UnsupportedType`]; cast it to text in the query instead.
//!
//! Parameters are sent as text and parsed by the server, except strings
//! bound to `bytea` parameters, which are sent as their raw bytes.
//!
//! # Cursors
//!
//! The rows of `db.query` are streamed. Until they have been read to the end
//! or closed with `rows:close()`, the connection is busy and every other
//! statement fails.

mod bridge;

pub mod catalog;
pub use catalog::{Catalog, MigrationFile};

mod context;
pub use context::RunContext;

mod error;
pub use error::Error;

mod migrator;
pub use migrator::{MigrationReport, MigrationStatus, Migrator};

pub mod script;
pub use script::RunConfig;

pub mod state;
pub use state::MigrationRecord;

pub mod value;

#[cfg(test)]
pub(crate) mod test_postgres;
