//! Postgres row operation.
//!
//! - [`ColumnDescriptor`]
//! - [`Row`]
//! - [`RowIndex`]
//! - [`DecodeError`]
use bytes::{Buf, Bytes};
use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, ProtocolError},
    types::{CodecError, TypeRegistry},
    value::Value,
};

/// One field of a `RowDescription` message.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub column_attr: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see `pg_type.typlen`).
    /// Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see `pg_attribute.atttypmod`).
    /// The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field.
    ///
    /// In a RowDescription returned from the statement variant of Describe,
    /// the format code is not yet known and will always be text.
    pub format: PgFormat,
}

/// Parse a `RowDescription` body into its ordered column descriptors.
pub(crate) fn parse_row_description(mut body: Bytes) -> Result<Arc<[ColumnDescriptor]>, ProtocolError> {
    if body.remaining() < 2 {
        return Err(ProtocolError::malformed("RowDescription"));
    }
    let field_len = body.get_u16();
    let mut columns = Vec::with_capacity(field_len as usize);
    for _ in 0..field_len {
        let name = ByteStr::read_nul(&mut body)?;
        if body.remaining() < 18 {
            return Err(ProtocolError::malformed("RowDescription"));
        }
        columns.push(ColumnDescriptor {
            name,
            table_oid: body.get_u32(),
            column_attr: body.get_i16(),
            type_oid: body.get_u32(),
            type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: PgFormat::from_code(body.get_u16())
                .ok_or(ProtocolError::malformed("RowDescription"))?,
        });
    }
    Ok(columns.into())
}

/// A single result row, decoded on demand.
///
/// Holds the column descriptors of the preceding `RowDescription` and the
/// raw `DataRow` payload; a field only goes through the registry when it is
/// asked for.
pub struct Row {
    columns: Arc<[ColumnDescriptor]>,
    registry: Arc<TypeRegistry>,
    values: Bytes,
}

impl Row {
    /// `body` is a `DataRow` message body.
    pub(crate) fn new(
        columns: Arc<[ColumnDescriptor]>,
        registry: Arc<TypeRegistry>,
        mut body: Bytes,
    ) -> Result<Self, ProtocolError> {
        if body.remaining() < 2 {
            return Err(ProtocolError::malformed("DataRow"));
        }
        let field_len = body.get_u16();
        if field_len as usize != columns.len() {
            return Err(ProtocolError::malformed("DataRow"));
        }
        Ok(Self { columns, registry, values: body })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// The column descriptors this row was described with.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Raw bytes of the nth field, [`None`] for SQL `NULL`.
    fn raw(&self, nth: usize) -> Result<Option<Bytes>, DecodeError> {
        let mut values = self.values.clone();
        for i in 0..=nth {
            if values.remaining() < 4 {
                return Err(DecodeError::IndexOutOfBounds(nth));
            }
            let len = values.get_i32();
            let value = match len {
                -1 => None,
                len if len < 0 => return Err(DecodeError::IndexOutOfBounds(nth)),
                len => {
                    if values.remaining() < len as usize {
                        return Err(DecodeError::IndexOutOfBounds(nth));
                    }
                    Some(values.split_to(len as usize))
                }
            };
            if i == nth {
                return Ok(value);
            }
        }
        unreachable!()
    }

    /// Get and decode a field by position or column name.
    ///
    /// The interpretation of the bytes is dictated by the column's format
    /// code and type oid; a type without a registered codec yields
    /// [`Value::Raw`].
    pub fn get<I: RowIndex>(&self, idx: I) -> Result<Value, DecodeError> {
        let nth = idx.position(&self.columns)?;
        let column = &self.columns[nth];
        let raw = self.raw(nth)?;
        self.registry
            .decode(column.type_oid, column.format, raw)
            .map_err(DecodeError::Codec)
    }

    /// Decode every field in order.
    pub fn values(&self) -> Result<Vec<Value>, DecodeError> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (i, column) in self.columns.iter().enumerate() {
            dbg.key(&column.name.as_str());
            match self.get(i) {
                Ok(value) => dbg.value(&value),
                Err(_) => dbg.value(&"<ERROR>"),
            };
        }
        dbg.finish()
    }
}

/// Type that can be used for indexing column.
pub trait RowIndex: Sized + sealed::Sealed {
    /// Returns the zero-based column position.
    fn position(self, columns: &[ColumnDescriptor]) -> Result<usize, DecodeError>;
}

impl RowIndex for usize {
    fn position(self, columns: &[ColumnDescriptor]) -> Result<usize, DecodeError> {
        if self < columns.len() {
            Ok(self)
        } else {
            Err(DecodeError::IndexOutOfBounds(self))
        }
    }
}

impl RowIndex for &str {
    fn position(self, columns: &[ColumnDescriptor]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|c| c.name == *self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// A registered codec refused the bytes.
    Codec(CodecError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl From<CodecError> for DecodeError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn description(columns: &[(&str, Oid, u16)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(columns.len() as u16);
        for (name, oid, format) in columns {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(0); // table oid
            buf.put_i16(0); // attr
            buf.put_u32(*oid);
            buf.put_i16(-1); // typlen
            buf.put_i32(-1); // typmod
            buf.put_u16(*format);
        }
        buf.freeze()
    }

    fn data_row(fields: &[Option<&[u8]>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(fields.len() as u16);
        for field in fields {
            match field {
                None => buf.put_i32(-1),
                Some(bytes) => {
                    buf.put_i32(bytes.len() as i32);
                    buf.put_slice(bytes);
                }
            }
        }
        buf.freeze()
    }

    #[test]
    fn descriptor_parse() {
        use crate::postgres::oid;
        let columns = parse_row_description(description(&[
            ("id", oid::INT4, 1),
            ("name", oid::TEXT, 0),
        ]))
        .unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].type_oid, oid::INT4);
        assert_eq!(columns[0].format, PgFormat::Binary);
        assert_eq!(columns[1].format, PgFormat::Text);
    }

    #[test]
    fn get_by_index_and_name() {
        use crate::postgres::oid;
        let columns = parse_row_description(description(&[
            ("id", oid::INT4, 1),
            ("name", oid::TEXT, 0),
        ]))
        .unwrap();
        let registry = Arc::new(TypeRegistry::new());
        let row = Row::new(
            columns,
            registry,
            data_row(&[Some(&42i32.to_be_bytes()), Some(b"foo")]),
        )
        .unwrap();

        assert_eq!(row.get(0).unwrap(), Value::Int4(42));
        assert_eq!(row.get("name").unwrap(), Value::Text("foo".into()));
        assert!(matches!(row.get("nope"), Err(DecodeError::ColumnNotFound(_))));
        assert!(matches!(row.get(5), Err(DecodeError::IndexOutOfBounds(5))));
    }

    #[test]
    fn null_fields() {
        use crate::postgres::oid;
        let columns = parse_row_description(description(&[("n", oid::INT4, 1)])).unwrap();
        let registry = Arc::new(TypeRegistry::new());
        let row = Row::new(columns, registry, data_row(&[None])).unwrap();
        assert_eq!(row.get(0).unwrap(), Value::Null);
    }

    #[test]
    fn field_count_mismatch_refuses() {
        use crate::postgres::oid;
        let columns = parse_row_description(description(&[("n", oid::INT4, 1)])).unwrap();
        let registry = Arc::new(TypeRegistry::new());
        assert!(Row::new(columns, registry, data_row(&[None, None])).is_err());
    }
}
