/// Server-assigned 32-bit type identifier.
pub type Oid = u32;

/// Builtin type oids from the `pg_type` catalog.
///
/// Only the types with a builtin codec are listed; anything else is carried
/// around as raw bytes plus metadata.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const VARCHAR: Oid = 1043;
    pub const BPCHAR: Oid = 1042;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const INTERVAL: Oid = 1186;
    pub const TIMETZ: Oid = 1266;
    pub const NUMERIC: Oid = 1700;

    pub const BOOL_ARRAY: Oid = 1000;
    pub const BYTEA_ARRAY: Oid = 1001;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const INT8_ARRAY: Oid = 1016;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const DATE_ARRAY: Oid = 1182;
    pub const TIME_ARRAY: Oid = 1183;
    pub const TIMESTAMP_ARRAY: Oid = 1115;
    pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
    pub const NUMERIC_ARRAY: Oid = 1231;

    /// Returns the element oid when `o` is one of the known array oids.
    pub const fn array_element(o: Oid) -> Option<Oid> {
        Some(match o {
            BOOL_ARRAY => BOOL,
            BYTEA_ARRAY => BYTEA,
            INT2_ARRAY => INT2,
            INT4_ARRAY => INT4,
            INT8_ARRAY => INT8,
            TEXT_ARRAY => TEXT,
            DATE_ARRAY => DATE,
            TIME_ARRAY => TIME,
            TIMESTAMP_ARRAY => TIMESTAMP,
            TIMESTAMPTZ_ARRAY => TIMESTAMPTZ,
            NUMERIC_ARRAY => NUMERIC,
            _ => return None,
        })
    }

    /// Returns the array oid whose element is `o`, when known.
    pub const fn array_of(o: Oid) -> Option<Oid> {
        Some(match o {
            BOOL => BOOL_ARRAY,
            BYTEA => BYTEA_ARRAY,
            INT2 => INT2_ARRAY,
            INT4 => INT4_ARRAY,
            INT8 => INT8_ARRAY,
            TEXT => TEXT_ARRAY,
            DATE => DATE_ARRAY,
            TIME => TIME_ARRAY,
            TIMESTAMP => TIMESTAMP_ARRAY,
            TIMESTAMPTZ => TIMESTAMPTZ_ARRAY,
            NUMERIC => NUMERIC_ARRAY,
            _ => return None,
        })
    }
}
