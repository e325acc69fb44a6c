use super::Value;
use std::collections::BTreeMap;

/// Column name to value map; the unit of entity state and of load snapshots.
pub type Row = BTreeMap<String, Value>;

/// Builds a [`Row`] from `(column, value)` pairs.
///
/// ```
/// use webcontext::core::{row, Value};
///
/// let r = row([("id", Value::from(1)), ("name", Value::from("first"))]);
/// assert_eq!(r["name"], Value::from("first"));
/// ```
pub fn row<K, V, I>(pairs: I) -> Row
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
