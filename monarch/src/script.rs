//! Running one migration script.

use crate::bridge::{self, Session};
use crate::context::RunContext;
use crate::error::Error;
use mlua::{HookTriggers, Lua, LuaOptions, MultiValue, StdLib, VmState};
use postgres::Transaction;
use std::cell::RefCell;
use std::fs;
use std::path::Path;

/// Lua instructions between two checks of the run context.
const INTERRUPT_INTERVAL: u32 = 10_000;

/// Run metadata exposed to scripts as the read-only `runconfig` table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// True only when the script runs through `reapply`.
    pub reapply: bool,
}

/// Execute the script at `path` against `tx`.
pub fn run_file(
    tx: &mut Transaction<'_>,
    ctx: &RunContext,
    config: RunConfig,
    path: &Path,
) -> Result<(), Error> {
    let source = fs::read(path)?;
    run_source(tx, ctx, config, &path.display().to_string(), &source)
}

/// Execute a script held in memory. `name` appears in Lua error messages.
pub fn run_source(
    tx: &mut Transaction<'_>,
    ctx: &RunContext,
    config: RunConfig,
    name: &str,
    source: &[u8],
) -> Result<(), Error> {
    ctx.check()?;
    let lua = sandbox()?;
    install_runconfig(&lua, config)?;
    install_interrupt(&lua, ctx);

    let _watch = ctx.watch(tx.cancel_token())?;
    let session = RefCell::new(Session::new(tx, ctx));
    lua.scope(|scope| {
        let db = bridge::register(&lua, scope, &session)?;
        lua.globals().set("db", db)?;
        lua.load(source).set_name(format!("@{}", name)).exec()
    })?;

    Ok(())
}

fn sandbox() -> mlua::Result<Lua> {
    Lua::new_with(
        StdLib::PACKAGE | StdLib::TABLE | StdLib::MATH | StdLib::STRING | StdLib::IO,
        LuaOptions::new(),
    )
}

fn install_runconfig(lua: &Lua, config: RunConfig) -> mlua::Result<()> {
    let values = lua.create_table()?;
    values.set("reapply", config.reapply)?;

    let meta = lua.create_table()?;
    meta.set("__index", values)?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError("runconfig is read-only".to_string()))
        })?,
    )?;
    meta.set("__metatable", false)?;

    let runconfig = lua.create_table()?;
    runconfig.set_metatable(Some(meta));
    lua.globals().set("runconfig", runconfig)
}

fn install_interrupt(lua: &Lua, ctx: &RunContext) {
    let ctx = ctx.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(INTERRUPT_INTERVAL),
        move |_, _| match ctx.check() {
            Ok(()) => Ok(VmState::Continue),
            Err(err) => Err(mlua::Error::external(err)),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_postgres::get_test_client;

    fn run(client: &mut postgres::Client, config: RunConfig, source: &str) -> Result<(), Error> {
        let mut tx = client.transaction().unwrap();
        let result = run_source(&mut tx, &RunContext::new(), config, "test.lua", source.as_bytes());
        tx.commit().unwrap();
        result
    }

    #[test]
    fn supported_types_arrive_as_lua_values() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            local columns, rows = db.query([[
                SELECT 'text'::text AS t,
                       'vc'::varchar AS vc,
                       '\x616263'::bytea AS b,
                       '00112233-4455-6677-8899-aabbccddeeff'::uuid AS u,
                       12345678901234567890.123456789::numeric AS n,
                       true AS flag,
                       7::int2 AS small,
                       70000::int4 AS medium,
                       9007199254740993::int8 AS big,
                       1.5::float4 AS f4,
                       0.25::float8 AS f8,
                       NULL::int4 AS missing
            ]])
            assert(#columns == 12, "column count")
            assert(columns[1] == "t" and columns[12] == "missing")
            local row = rows()
            assert(row.t == "text" and row[1] == "text")
            assert(row.vc == "vc")
            assert(row.b == "abc")
            assert(row.u == "00112233-4455-6677-8899-aabbccddeeff")
            assert(row.n == "12345678901234567890.123456789", row.n)
            assert(row.flag == true)
            assert(math.type(row.small) == "integer" and row.small == 7)
            assert(row.medium == 70000)
            assert(row.big == 9007199254740993)
            assert(math.type(row.f4) == "float" and row.f4 == 1.5)
            assert(row.f8 == 0.25)
            assert(row.missing == nil and row[12] == nil)
            assert(rows() == nil)
            "#,
        )
        .unwrap();
    }

    #[test]
    fn params_bind_positionally() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            db.execute("CREATE TABLE people (id int PRIMARY KEY, name text, score numeric, active bool)")
            db.execute("INSERT INTO people VALUES ($1, $2, $3, $4)", { 1, "ada", 1.25, true })
            db.execute("INSERT INTO people VALUES ($1, $2, $3, $4)", { 2, "bob", nil, false })
            local _, rows = db.query("SELECT name, score FROM people WHERE id = $1", { 2 })
            local row = rows()
            assert(row.name == "bob" and row.score == nil)
            rows:close()
            local _, rows = db.query("SELECT count(*) AS n FROM people WHERE active = $1", { true })
            assert(rows().n == 1)
            assert(rows() == nil)
            "#,
        )
        .unwrap();
    }

    #[test]
    fn bytea_round_trips_through_params() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            db.execute("CREATE TABLE blobs (id int PRIMARY KEY, data bytea)")
            db.execute("INSERT INTO blobs VALUES ($1, $2)", { 1, "a\\b\0\255" })
            local _, rows = db.query("SELECT data FROM blobs WHERE id = $1", { 1 })
            local data = rows().data
            assert(data == "a\\b\0\255", data)
            rows:close()
            db.execute("INSERT INTO blobs VALUES ($1, $2)", { 2, data })
            local _, rows = db.query("SELECT count(*) AS n FROM blobs WHERE data = $1", { data })
            assert(rows().n == 2)
            rows:close()
            "#,
        )
        .unwrap();
    }

    #[test]
    fn multiple_statements_in_one_execute() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            db.execute([[
                CREATE TABLE a (id int);
                CREATE TABLE b (id int);
            ]])
            "#,
        )
        .unwrap();
        let count: i64 = client
            .query_one(
                "SELECT count(*) FROM information_schema.tables WHERE table_name IN ('a', 'b')",
                &[],
            )
            .unwrap()
            .get(0);
        assert_eq!(count, 2);
    }

    #[test]
    fn unsupported_column_type_is_reported_with_its_position() {
        let mut client = get_test_client();
        let err = run(
            &mut client,
            RunConfig::default(),
            r#"
            local _, rows = db.query("SELECT 1 AS id, now() AS created_at")
            rows()
            "#,
        )
        .unwrap_err();

        match err.root_cause() {
            Error::UnsupportedType {
                column_index,
                column_name,
                type_name,
            } => {
                assert_eq!(*column_index, 2);
                assert_eq!(column_name, "created_at");
                assert_eq!(type_name, "timestamptz");
            }
            other => panic!("expected unsupported type, got {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("created_at"));
        assert!(message.contains("index 2"));
        assert!(message.contains("cast"));
    }

    #[test]
    fn cursor_is_released_after_unsupported_type() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            local _, rows = db.query("SELECT now() AS created_at")
            local ok = pcall(rows)
            assert(not ok)
            db.execute("SELECT 1")
            "#,
        )
        .unwrap();
    }

    #[test]
    fn fetch_failure_releases_cursor_with_server_text() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            local _, rows = db.query("SELECT 1 / (3 - n) AS q FROM generate_series(1, 5) AS n")
            local ok, err = pcall(function()
                for _ in rows do end
            end)
            assert(not ok)
            assert(tostring(err):find("division by zero"), tostring(err))
            -- the transaction is aborted now, but the connection is no longer busy
            local ok, err = pcall(db.execute, "SELECT 1")
            assert(not ok)
            assert(not tostring(err):find("conn busy"), tostring(err))
            assert(tostring(err):find("current transaction is aborted"), tostring(err))
            "#,
        )
        .unwrap();
    }

    #[test]
    fn unfinished_cursor_makes_connection_busy() {
        let mut client = get_test_client();
        let err = run(
            &mut client,
            RunConfig::default(),
            r#"
            local _, rows = db.query("SELECT generate_series(1, 3) AS n")
            assert(rows().n == 1)
            db.query("SELECT 1")
            "#,
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), Error::ConnectionBusy));
        assert!(err.to_string().contains("conn busy"));
    }

    #[test]
    fn execute_is_also_blocked_by_open_cursor() {
        let mut client = get_test_client();
        let err = run(
            &mut client,
            RunConfig::default(),
            r#"
            local _, rows = db.query("SELECT generate_series(1, 3) AS n")
            rows()
            db.execute("SELECT 1")
            "#,
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), Error::ConnectionBusy));
    }

    #[test]
    fn closed_or_drained_cursor_frees_connection() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            r#"
            local _, rows = db.query("SELECT generate_series(1, 3) AS n")
            assert(rows().n == 1)
            rows:close()
            rows:close()
            assert(rows() == nil)

            local _, rows = db.query("SELECT generate_series(1, 300) AS n")
            local total = 0
            for row in rows do
                total = total + row.n
            end
            assert(total == 45150, total)
            rows:close()

            do
                local _, scoped <close> = db.query("SELECT generate_series(1, 5) AS n")
                scoped()
            end
            db.execute("SELECT 1")
            "#,
        )
        .unwrap();
    }

    #[test]
    fn database_errors_surface_server_text() {
        let mut client = get_test_client();
        let err = run(&mut client, RunConfig::default(), r#"db.execute("SELEC 1")"#).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Postgres(_)));
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn runconfig_reports_reapply_and_is_read_only() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig { reapply: true },
            r#"
            assert(runconfig.reapply == true)
            local ok, err = pcall(function() runconfig.reapply = false end)
            assert(not ok and tostring(err):find("read%-only"))
            assert(runconfig.reapply == true)
            "#,
        )
        .unwrap();
        run(
            &mut client,
            RunConfig::default(),
            "assert(runconfig.reapply == false)",
        )
        .unwrap();
    }

    #[test]
    fn sandbox_has_no_os_library() {
        let mut client = get_test_client();
        run(
            &mut client,
            RunConfig::default(),
            "assert(os == nil and debug == nil and string.format ~= nil)",
        )
        .unwrap();
    }

    #[test]
    fn cancelled_context_interrupts_a_loop() {
        let mut client = get_test_client();
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        let mut tx = client.transaction().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            canceller.cancel();
        });
        let err = run_source(
            &mut tx,
            &ctx,
            RunConfig::default(),
            "loop.lua",
            b"while true do end",
        )
        .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err.root_cause(), Error::Cancelled));
    }

    #[test]
    fn cancelled_context_aborts_a_running_statement() {
        let mut client = get_test_client();
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        let mut tx = client.transaction().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = run_source(
            &mut tx,
            &ctx,
            RunConfig::default(),
            "sleep.lua",
            br#"db.execute("SELECT pg_sleep(5)")"#,
        )
        .unwrap_err();
        handle.join().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        assert!(matches!(err.root_cause(), Error::Cancelled));
    }

    #[test]
    fn deadline_aborts_a_running_query() {
        let mut client = get_test_client();
        let ctx = RunContext::new().with_timeout(std::time::Duration::from_millis(200));
        let mut tx = client.transaction().unwrap();
        let started = std::time::Instant::now();
        let err = run_source(
            &mut tx,
            &ctx,
            RunConfig::default(),
            "sleep.lua",
            br#"
            local _, rows = db.query("SELECT pg_sleep(5) AS slept")
            rows()
            "#,
        )
        .unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        assert!(matches!(err.root_cause(), Error::DeadlineExceeded));
    }
}
