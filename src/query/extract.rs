use std::fmt;

use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;

/// Pulls the value at `path` out of a JSON line without building the rest of the tree.
///
/// Sibling values are skipped with [`IgnoredAny`]; only the addressed value is
/// materialized. Returns `Ok(None)` when any segment of the path is missing or
/// crosses a non-object value.
pub fn extract<S: AsRef<str>>(line: &str, path: &[S]) -> serde_json::Result<Option<Value>> {
    let mut de = serde_json::Deserializer::from_str(line);
    let found = PathSeed { path }.deserialize(&mut de)?;
    de.end()?;
    Ok(found)
}

struct PathSeed<'p, S> {
    path: &'p [S],
}

impl<'de, 'p, S: AsRef<str>> DeserializeSeed<'de> for PathSeed<'p, S> {
    type Value = Option<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        if self.path.is_empty() {
            Value::deserialize(deserializer).map(Some)
        } else {
            deserializer.deserialize_any(PathVisitor { path: self.path })
        }
    }
}

struct PathVisitor<'p, S> {
    path: &'p [S],
}

impl<'de, 'p, S: AsRef<str>> Visitor<'de> for PathVisitor<'p, S> {
    type Value = Option<Value>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let (head, rest) = match self.path.split_first() {
            Some(split) => split,
            None => return Ok(None),
        };

        let mut found = None;
        while let Some(key) = map.next_key::<String>()? {
            if found.is_none() && key == head.as_ref() {
                found = map.next_value_seed(PathSeed { path: rest })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(None)
    }

    fn visit_bool<E>(self, _: bool) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_i64<E>(self, _: i64) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_u64<E>(self, _: u64) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_f64<E>(self, _: f64) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_str<E>(self, _: &str) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LINE: &str = r#"{"__id":"k1","slave":{"name":"Ada","tags":["x",{"name":"no"}],"address":{"city":"Oslo"}}}"#;

    #[test]
    fn test_extracts_nested_value() {
        assert_eq!(extract(LINE, &["slave", "name"]).unwrap(), Some(json!("Ada")));
        assert_eq!(extract(LINE, &["slave", "address", "city"]).unwrap(), Some(json!("Oslo")));
        assert_eq!(extract(LINE, &["__id"]).unwrap(), Some(json!("k1")));
    }

    #[test]
    fn test_missing_path_is_none() {
        assert_eq!(extract(LINE, &["slave", "age"]).unwrap(), None);
        assert_eq!(extract(LINE, &["slave", "name", "first"]).unwrap(), None);
        assert_eq!(extract(LINE, &["slave", "tags", "name"]).unwrap(), None);
    }

    #[test]
    fn test_empty_path_returns_whole_value() {
        let whole = extract::<&str>(r#"{"a":1}"#, &[]).unwrap();
        assert_eq!(whole, Some(json!({"a": 1})));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(extract(r#"{"slave": {"name": "#, &["slave", "name"]).is_err());
        assert!(extract(r#"{"a":1} trailing"#, &["a"]).is_err());
    }
}
