//! The `db` API seen by migration scripts.
//!
//! All statements of a script go through one [`Session`], which wraps the
//! run's transaction and allows at most one open result cursor at a time.
//! While a cursor is open (not drained, not closed) every other statement
//! fails with [`Error::ConnectionBusy`]; scripts must read to the end or call
//! `rows:close()` first.

use crate::context::RunContext;
use crate::error::Error;
use crate::value::{marshal_row, ScriptParam, ScriptValue};
use mlua::{
    ExternalResult, Function, IntoLua, Lua, MetaMethod, MultiValue, Scope, Table, UserData,
    UserDataMethods, Value,
};
use postgres::types::ToSql;
use postgres::{Portal, Row, Transaction};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Rows requested from the server per round trip while iterating a cursor.
const FETCH_SIZE: i32 = 128;

struct OpenCursor {
    id: u64,
    portal: Portal,
    columns: Rc<[String]>,
    buffered: VecDeque<Row>,
    drained: bool,
}

/// Statement execution over a borrowed transaction, one cursor at a time.
pub(crate) struct Session<'a, 'tx> {
    tx: &'a mut Transaction<'tx>,
    ctx: &'a RunContext,
    cursor: Option<OpenCursor>,
    next_cursor_id: u64,
}

impl<'a, 'tx> Session<'a, 'tx> {
    pub fn new(tx: &'a mut Transaction<'tx>, ctx: &'a RunContext) -> Self {
        Self {
            tx,
            ctx,
            cursor: None,
            next_cursor_id: 1,
        }
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        match self.cursor {
            Some(_) => Err(Error::ConnectionBusy),
            None => Ok(()),
        }
    }

    /// Run a statement and discard its rows.
    pub fn execute(&mut self, sql: &str, params: &[ScriptParam]) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ctx.check()?;

        let result = if params.is_empty() {
            // simple protocol, so one call may carry several statements
            self.tx.batch_execute(sql)
        } else {
            self.tx.execute(sql, &param_refs(params)).map(|_| ())
        };
        result.map_err(|err| interrupted(self.ctx, err))
    }

    /// Open a cursor over the rows of `sql`. Returns the cursor id and the
    /// result column names.
    pub fn query(&mut self, sql: &str, params: &[ScriptParam]) -> Result<(u64, Rc<[String]>), Error> {
        self.ensure_idle()?;
        self.ctx.check()?;

        let statement = self
            .tx
            .prepare(sql)
            .map_err(|err| interrupted(self.ctx, err))?;
        let columns: Rc<[String]> = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        let portal = self
            .tx
            .bind(&statement, &param_refs(params))
            .map_err(|err| interrupted(self.ctx, err))?;

        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursor = Some(OpenCursor {
            id,
            portal,
            columns: Rc::clone(&columns),
            buffered: VecDeque::new(),
            drained: false,
        });

        tracing::debug!(cursor = id, sql, "opened cursor");
        Ok((id, columns))
    }

    /// Advance cursor `id`.
    ///
    /// Returns `None` once the rows are exhausted, and for a cursor that was
    /// already released. Exhaustion and every error release the cursor.
    pub fn next_row(&mut self, id: u64) -> Result<Option<(Rc<[String]>, Vec<ScriptValue>)>, Error> {
        let result = self.advance(id);
        match result {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => self.close(id),
        }
        result
    }

    fn advance(&mut self, id: u64) -> Result<Option<(Rc<[String]>, Vec<ScriptValue>)>, Error> {
        let Session { tx, ctx, cursor, .. } = self;
        let Some(cursor) = cursor.as_mut().filter(|cursor| cursor.id == id) else {
            return Ok(None);
        };

        if cursor.buffered.is_empty() && !cursor.drained {
            ctx.check()?;
            let rows = tx
                .query_portal(&cursor.portal, FETCH_SIZE)
                .map_err(|err| interrupted(ctx, err))?;
            cursor.drained = rows.len() < FETCH_SIZE as usize;
            cursor.buffered.extend(rows);
        }

        match cursor.buffered.pop_front() {
            Some(row) => Ok(Some((Rc::clone(&cursor.columns), marshal_row(&row)?))),
            None => Ok(None),
        }
    }

    /// Release cursor `id`. Closing a cursor that is no longer open does nothing.
    pub fn close(&mut self, id: u64) {
        if self.cursor.as_ref().is_some_and(|cursor| cursor.id == id) {
            self.cursor = None;
            tracing::debug!(cursor = id, "released cursor");
        }
    }
}

/// A statement cancelled because the run stopped reports why the run stopped.
fn interrupted(ctx: &RunContext, err: postgres::Error) -> Error {
    match ctx.check() {
        Err(stop) => stop,
        Ok(()) => err.into(),
    }
}

fn param_refs(params: &[ScriptParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|param| param as &(dyn ToSql + Sync)).collect()
}

fn read_params(params: Option<Table>) -> mlua::Result<Vec<ScriptParam>> {
    let Some(params) = params else {
        return Ok(Vec::new());
    };
    (1..=params.raw_len())
        .map(|position| {
            let value: Value = params.raw_get(position)?;
            ScriptParam::from_lua(position, &value).into_lua_err()
        })
        .collect()
}

fn row_table(lua: &Lua, columns: &[String], values: Vec<ScriptValue>) -> mlua::Result<Table> {
    let row = lua.create_table_with_capacity(values.len(), values.len())?;
    for (idx, (name, value)) in columns.iter().zip(values).enumerate() {
        let value = value.into_lua(lua)?;
        if value.is_nil() {
            continue;
        }
        row.raw_set(idx + 1, value.clone())?;
        row.raw_set(name.as_str(), value)?;
    }
    Ok(row)
}

/// The row producer returned by `db.query`: call it for the next row, or
/// `close` it to stop early.
struct Rows {
    id: i64,
    fetch: Function,
    release: Function,
}

impl UserData for Rows {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("close", |_, rows, ()| rows.release.call::<()>(rows.id));
        methods.add_meta_method(MetaMethod::Call, |_, rows, _: MultiValue| {
            rows.fetch.call::<Value>(rows.id)
        });
        methods.add_meta_method(MetaMethod::Close, |_, rows, _: MultiValue| {
            rows.release.call::<()>(rows.id)
        });
    }
}

/// Build the `db` table for one script run.
///
/// The functions live only as long as `scope`; a row producer that escapes
/// the script fails instead of touching the transaction afterwards.
pub(crate) fn register<'scope, 'env: 'scope>(
    lua: &Lua,
    scope: &'scope Scope<'scope, 'env>,
    session: &'env RefCell<Session<'_, '_>>,
) -> mlua::Result<Table> {
    let fetch = scope.create_function(move |lua, id: i64| {
        let next = session.borrow_mut().next_row(id as u64).into_lua_err()?;
        match next {
            Some((columns, values)) => Ok(Value::Table(row_table(lua, &columns, values)?)),
            None => Ok(Value::Nil),
        }
    })?;

    let release = scope.create_function(move |_, id: i64| {
        session.borrow_mut().close(id as u64);
        Ok(())
    })?;

    let execute = scope.create_function(move |_, (sql, params): (String, Option<Table>)| {
        let params = read_params(params)?;
        session.borrow_mut().execute(&sql, &params).into_lua_err()
    })?;

    let query = scope.create_function(move |lua, (sql, params): (String, Option<Table>)| {
        let params = read_params(params)?;
        let (id, columns) = session.borrow_mut().query(&sql, &params).into_lua_err()?;
        let columns = lua.create_sequence_from(columns.iter().map(String::as_str))?;
        let rows = Rows {
            id: id as i64,
            fetch: fetch.clone(),
            release: release.clone(),
        };
        Ok((columns, rows))
    })?;

    let db = lua.create_table()?;
    db.set("execute", execute)?;
    db.set("query", query)?;
    Ok(db)
}
