//! MySQL column types and text-protocol casting.
//!
//! In the text protocol every cell arrives as a length-encoded string (or
//! the NULL marker). [`cast`] turns those bytes into a [`Value`] according
//! to the column's declared type and the active [`QueryFlags`].

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, TimeZone};
use mywire_core::error::TypeError;
use mywire_core::value::days_from_civil;
use mywire_core::{Error, Result, Value};

use crate::config::QueryFlags;
use crate::error::protocol_error;
use crate::protocol::{PacketReader, charset};

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte. Unknown codes are treated as strings.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }
}

/// Column flags in result set metadata.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const UNSIGNED: u16 = 32;
}

/// Column definition from a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name (or alias)
    pub name: String,
    /// Character set number
    pub charset: u16,
    /// Declared display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition payload (protocol 4.1 layout).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        // catalog, schema, table, org_table
        for _ in 0..4 {
            reader.read_lenenc_bytes()?;
        }
        let name = reader.read_lenenc_string()?;
        // org_name
        reader.read_lenenc_bytes()?;
        // length of the fixed-size fields (0x0c)
        reader.read_lenenc_int()?;

        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Ok(ColumnDef {
            name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }
}

fn type_error(expected: &'static str, raw: &[u8], column: &ColumnDef) -> Error {
    Error::Type(TypeError {
        expected,
        actual: String::from_utf8_lossy(raw).into_owned(),
        column: Some(column.name.clone()),
    })
}

fn as_text<'a>(raw: &'a [u8], expected: &'static str, column: &ColumnDef) -> Result<&'a str> {
    std::str::from_utf8(raw).map_err(|_| type_error(expected, raw, column))
}

/// Cast one cell. `None` is the NULL marker.
pub fn cast(column: &ColumnDef, cell: Option<&[u8]>, flags: QueryFlags) -> Result<Value> {
    let Some(raw) = cell else {
        return Ok(Value::Null);
    };
    if !flags.contains(QueryFlags::CAST) {
        return Ok(Value::Bytes(raw.to_vec()));
    }

    let booleans = flags.contains(QueryFlags::CAST_BOOLEANS) && column.column_length == 1;
    let local = flags.contains(QueryFlags::LOCAL_TIMEZONE);

    match column.column_type {
        FieldType::Bit if booleans => match raw {
            [byte] => Ok(Value::Bool(*byte != 0)),
            _ => Err(protocol_error(format!(
                "BIT(1) cell of {} bytes in column '{}'",
                raw.len(),
                column.name
            ))),
        },
        FieldType::Bit => Ok(Value::Bytes(raw.to_vec())),
        FieldType::Tiny if booleans => Ok(Value::Bool(raw != b"0")),
        FieldType::Tiny
        | FieldType::Short
        | FieldType::Long
        | FieldType::LongLong
        | FieldType::Int24
        | FieldType::Year => parse_integer(raw, column),
        FieldType::Decimal | FieldType::NewDecimal => {
            if column.decimals == 0 && !flags.contains(QueryFlags::CAST_ALL_DECIMALS) {
                // DECIMAL(65,0) can exceed 64 bits; keep those exact as decimals.
                parse_integer(raw, column).or_else(|_| parse_decimal(raw, column))
            } else {
                parse_decimal(raw, column)
            }
        }
        FieldType::Float | FieldType::Double => as_text(raw, "float", column)?
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| type_error("float", raw, column)),
        FieldType::Timestamp | FieldType::DateTime => parse_datetime(raw, column, local),
        FieldType::Time => parse_time(raw, column, local),
        FieldType::Date | FieldType::NewDate => parse_date(raw, column),
        FieldType::Null => Ok(Value::Null),
        _ => Ok(decode_charset(raw, column.charset)),
    }
}

/// Bytes under the column's charset: text for the utf8 family, bytes otherwise.
fn decode_charset(raw: &[u8], charset_id: u16) -> Value {
    if charset::is_utf8(charset_id) {
        Value::Text(String::from_utf8_lossy(raw).into_owned())
    } else {
        Value::Bytes(raw.to_vec())
    }
}

fn parse_integer(raw: &[u8], column: &ColumnDef) -> Result<Value> {
    let text = as_text(raw, "integer", column)?;
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Value::Int(v));
    }
    // Only UNSIGNED columns reach past i64::MAX.
    match text.parse::<u64>() {
        Ok(v) if column.is_unsigned() => Ok(Value::UInt(v)),
        _ => Err(type_error("integer", raw, column)),
    }
}

fn is_decimal_text(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    match frac_part {
        Some(f) => {
            all_digits(int_part) && all_digits(f) && !(int_part.is_empty() && f.is_empty())
        }
        None => !int_part.is_empty() && all_digits(int_part),
    }
}

fn parse_decimal(raw: &[u8], column: &ColumnDef) -> Result<Value> {
    let text = as_text(raw, "decimal", column)?;
    if is_decimal_text(text) {
        Ok(Value::Decimal(text.to_string()))
    } else {
        Err(type_error("decimal", raw, column))
    }
}

fn is_zero_date(text: &str) -> bool {
    text.starts_with("0000-00-00")
}

fn instant_micros(naive: NaiveDateTime, local: bool) -> Option<i64> {
    if local {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_micros())
    } else {
        Some(naive.and_utc().timestamp_micros())
    }
}

fn parse_datetime(raw: &[u8], column: &ColumnDef, local: bool) -> Result<Value> {
    let text = as_text(raw, "datetime", column)?;
    if is_zero_date(text) {
        return Ok(Value::Null);
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .and_then(|naive| instant_micros(naive, local))
        .map(Value::Timestamp)
        .ok_or_else(|| type_error("datetime", raw, column))
}

/// Parse `[-]HHH:MM:SS[.ffffff]` into signed microseconds.
fn time_offset_micros(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, fraction) = match body.split_once('.') {
        Some((c, f)) => (c, f),
        None => (body, ""),
    };

    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    if fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let micros = if fraction.is_empty() {
        0
    } else {
        format!("{:0<6}", fraction).parse::<i64>().ok()?
    };

    let total = ((hours * 60 + minutes) * 60 + seconds) * 1_000_000 + micros;
    Some(if negative { -total } else { total })
}

fn parse_time(raw: &[u8], column: &ColumnDef, local: bool) -> Result<Value> {
    let text = as_text(raw, "time", column)?;
    let anchor = NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| instant_micros(naive, local));

    match (anchor, time_offset_micros(text)) {
        (Some(anchor), Some(offset)) => Ok(Value::Time(anchor + offset)),
        _ => Err(type_error("time", raw, column)),
    }
}

fn parse_date(raw: &[u8], column: &ColumnDef) -> Result<Value> {
    let text = as_text(raw, "date", column)?;
    if is_zero_date(text) {
        return Ok(Value::Null);
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| type_error("date", raw, column))?;
    Ok(Value::Date(days_from_civil(
        date.year(),
        date.month(),
        date.day(),
    )))
}
