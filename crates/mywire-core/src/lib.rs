//! Core types for the mywire MySQL/MariaDB client.
//!
//! - `Error` and its payload structs for every failure the client surfaces
//! - `Value`, the dynamic cell type produced by result casting
//! - `ResultSet` and `Row`, fully materialized query results

pub mod error;
pub mod result;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError,
    QueryErrorKind, Result, TypeError,
};
pub use result::{ColumnInfo, ResultSet, Row};
pub use value::Value;
