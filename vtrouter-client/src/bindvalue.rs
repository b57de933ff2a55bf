//! Typed bind-variable values, replacing the original `interface{}` union so
//! scatter serialization is total and typed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single bind-variable value. Tuples are only ever one level deep (used
/// by `IN (...)` style plans).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BindValue {
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    Bytes(Vec<u8>),
    Tuple(Vec<BindValue>),
    /// Used to populate join variables when a join's left side is empty and
    /// the right side is only being probed for field metadata.
    Null,
}

impl BindValue {
    pub fn as_bytes_for_vindex(&self) -> Option<&[u8]> {
        match self {
            BindValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

pub type BindVars = HashMap<String, BindValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_variant_nests_values() {
        let v = BindValue::Tuple(vec![BindValue::Int64(1), BindValue::Int64(2)]);
        if let BindValue::Tuple(items) = v {
            assert_eq!(items.len(), 2);
        } else {
            panic!("expected tuple");
        }
    }
}
