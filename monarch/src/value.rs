//! Conversion between PostgreSQL values and Lua values.
//!
//! Column values arrive in PostgreSQL's binary format and are mapped through a
//! closed set of [`ColumnKind`]s. Anything outside that set is rejected rather
//! than approximated; in particular temporal types are never converted, so a
//! timestamp in some session time zone cannot silently change meaning on its
//! way into a script. Scripts cast such columns to text in SQL instead.
//!
//! Parameters travel the other way as [`ScriptParam`]s, sent in text format
//! so the server coerces them to whatever type the statement expects.

use crate::error::Error;
use bytes::BytesMut;
use mlua::{IntoLua, Lua, Value};
use postgres::types::{to_sql_checked, FromSql, Format, IsNull, Kind, ToSql, Type};
use postgres::Row;
use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// A value handed to script code.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Lua strings are byte strings; text columns are UTF-8, bytea columns are
    /// passed through untouched.
    String(Vec<u8>),
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Nil,
}

impl ScriptValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

impl IntoLua for ScriptValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            ScriptValue::String(bytes) => Value::String(lua.create_string(bytes)?),
            ScriptValue::Boolean(value) => Value::Boolean(value),
            ScriptValue::Integer(value) => Value::Integer(value),
            ScriptValue::Number(value) => Value::Number(value),
            ScriptValue::Nil => Value::Nil,
        })
    }
}

/// The column types scripts can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Bytes,
    Uuid,
    Numeric,
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Unsupported,
}

impl ColumnKind {
    pub fn of(ty: &Type) -> ColumnKind {
        match *ty {
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                ColumnKind::Text
            }
            Type::BYTEA => ColumnKind::Bytes,
            Type::UUID => ColumnKind::Uuid,
            Type::NUMERIC => ColumnKind::Numeric,
            Type::BOOL => ColumnKind::Bool,
            Type::INT2 => ColumnKind::Int2,
            Type::INT4 => ColumnKind::Int4,
            Type::INT8 => ColumnKind::Int8,
            Type::FLOAT4 => ColumnKind::Float4,
            Type::FLOAT8 => ColumnKind::Float8,
            // enum labels are sent as their text
            ref other if matches!(other.kind(), Kind::Enum(_)) => ColumnKind::Text,
            ref other if other.name() == "citext" => ColumnKind::Text,
            _ => ColumnKind::Unsupported,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("unsupported column type {0}")]
    Unsupported(String),
    #[error("{0}")]
    Decode(BoxError),
}

/// Convert one binary-format column value into a [`ScriptValue`].
///
/// `raw` is `None` for SQL NULL, which becomes `nil` whatever the column type.
pub fn convert(ty: &Type, raw: Option<&[u8]>) -> Result<ScriptValue, ConvertError> {
    let Some(raw) = raw else {
        return Ok(ScriptValue::Nil);
    };

    let value = match ColumnKind::of(ty) {
        ColumnKind::Text | ColumnKind::Bytes => ScriptValue::String(raw.to_vec()),
        ColumnKind::Uuid => {
            let uuid = uuid::Uuid::from_sql(ty, raw).map_err(ConvertError::Decode)?;
            ScriptValue::String(uuid.hyphenated().to_string().into_bytes())
        }
        ColumnKind::Numeric => ScriptValue::String(
            numeric_to_string(raw)
                .map_err(ConvertError::Decode)?
                .into_bytes(),
        ),
        ColumnKind::Bool => ScriptValue::Boolean(decode(ty, raw)?),
        ColumnKind::Int2 => ScriptValue::Integer(decode::<i16>(ty, raw)?.into()),
        ColumnKind::Int4 => ScriptValue::Integer(decode::<i32>(ty, raw)?.into()),
        ColumnKind::Int8 => ScriptValue::Integer(decode(ty, raw)?),
        ColumnKind::Float4 => ScriptValue::Number(decode::<f32>(ty, raw)?.into()),
        ColumnKind::Float8 => ScriptValue::Number(decode(ty, raw)?),
        ColumnKind::Unsupported => return Err(ConvertError::Unsupported(ty.name().to_string())),
    };

    Ok(value)
}

fn decode<'a, T: FromSql<'a>>(ty: &Type, raw: &'a [u8]) -> Result<T, ConvertError> {
    T::from_sql(ty, raw).map_err(ConvertError::Decode)
}

/// Render a binary `numeric` the way PostgreSQL's own output function does.
///
/// Layout: ndigits, weight, sign and dscale as 16-bit big-endian words, then
/// `ndigits` base-10000 digits, most significant first. The first digit sits
/// at position `weight` (in powers of 10000).
fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("invalid numeric value: truncated header".into());
    }
    let word = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = word(0) as usize;
    let weight = i32::from(word(2) as i16);
    let sign = word(4);
    let dscale = word(6) as usize;

    if raw.len() != 8 + ndigits * 2 {
        return Err(format!(
            "invalid numeric value: expected {} digits, found {} bytes",
            ndigits,
            raw.len() - 8
        )
        .into());
    }

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign {:#06x}", other).into()),
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
    if let Some(bad) = digits.iter().find(|&&d| d > 9999) {
        return Err(format!("invalid numeric digit {}", bad).into());
    }
    let digit = |idx: i32| {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| digits.get(idx).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for idx in 1..=weight {
            text.push_str(&format!("{:04}", digit(idx)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(idx)));
            idx += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

/// Raw binary value of any column type.
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(RawValue(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Marshal every column of `row`.
///
/// Fails with [`Error::UnsupportedType`] on the first column that has no
/// script representation.
pub(crate) fn marshal_row(row: &Row) -> Result<Vec<ScriptValue>, Error> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let raw: Option<RawValue<'_>> = row.try_get(idx)?;
            convert(column.type_(), raw.map(|raw| raw.0)).map_err(|err| match err {
                ConvertError::Unsupported(type_name) => Error::UnsupportedType {
                    column_index: idx + 1,
                    column_name: column.name().to_string(),
                    type_name,
                },
                ConvertError::Decode(err) => Error::Generic(format!(
                    "cannot decode column {} (index {}): {}",
                    column.name(),
                    idx + 1,
                    err
                )),
            })
        })
        .collect()
}

/// A statement parameter supplied by a script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptParam {
    /// Text representation, parsed by the server as the parameter's type.
    /// Sent verbatim for `bytea` parameters.
    Text(Vec<u8>),
    Null,
}

impl ScriptParam {
    /// `position` is the 1-based index in the script's params list, used for
    /// error messages.
    pub fn from_lua(position: usize, value: &Value) -> Result<Self, Error> {
        let text = match value {
            Value::Nil => return Ok(ScriptParam::Null),
            Value::Boolean(value) => value.to_string(),
            Value::Integer(value) => value.to_string(),
            Value::Number(value) => float_text(*value),
            Value::String(value) => return Ok(ScriptParam::Text(value.as_bytes().to_vec())),
            other => {
                return Err(Error::UnsupportedParameter {
                    position,
                    type_name: other.type_name().to_string(),
                })
            }
        };
        Ok(ScriptParam::Text(text.into_bytes()))
    }
}

fn float_text(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

impl ToSql for ScriptParam {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            ScriptParam::Text(text) => {
                out.extend_from_slice(text);
                Ok(IsNull::No)
            }
            ScriptParam::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    /// `bytea` parameters take the string's raw bytes, as `db.query` returns
    /// them; every other type is parsed by the server from text.
    fn encode_format(&self, ty: &Type) -> Format {
        if *ty == Type::BYTEA {
            Format::Binary
        } else {
            Format::Text
        }
    }

    to_sql_checked!();
}
