//! # faultdb Codec
//!
//! Attribute values and CBOR encoding for faultdb.
//!
//! Every row the engine persists is a map from attribute name to [`Value`].
//! Rows, journal frames and the manifest are all serialized as CBOR through
//! [`to_cbor`] and [`from_cbor`].
//!
//! ## Usage
//!
//! ```
//! use faultdb_codec::{from_cbor, to_cbor, Value};
//!
//! let value = Value::Text("Paris".into());
//! let bytes = to_cbor(&value).unwrap();
//! let decoded: Value = from_cbor(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            (-1.0e12f64..1.0e12).prop_map(Value::Float),
            ".{0,24}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
            any::<i64>().prop_map(Value::Timestamp),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn rows_survive_encoding(row in prop::collection::btree_map("[a-z]{1,8}", arb_value(), 0..8)) {
            let bytes = to_cbor(&row).unwrap();
            let decoded: BTreeMap<String, Value> = from_cbor(&bytes).unwrap();
            prop_assert_eq!(row, decoded);
        }
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        let result: CodecResult<Value> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    #[test]
    fn shape_mismatch_is_a_decoding_error() {
        let bytes = to_cbor(&Value::Integer(1)).unwrap();
        let result: CodecResult<Vec<String>> = from_cbor(&bytes);
        assert!(result.is_err());
    }
}
