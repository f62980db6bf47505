//! Setting values inside a record at a path such as `address.lines[1]`.

use crate::{Result, RillError};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathToken {
    Key(String),
    Index(usize),
}

pub(crate) fn tokenize(path: &str) -> Result<Vec<PathToken>> {
    let invalid = || RillError::InvalidMessageData(format!("invalid path '{}'", path));
    let mut tokens = Vec::new();

    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(position) => part.split_at(position),
            None => (part, ""),
        };
        if !key.is_empty() {
            tokens.push(PathToken::Key(key.to_string()));
        } else if rest.is_empty() {
            return Err(invalid());
        }

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            let index = rest[1..close].trim().parse::<usize>().map_err(|_| invalid())?;
            tokens.push(PathToken::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid());
            }
        }
    }

    Ok(tokens)
}

/// Sets `value` at `path` inside `data`, creating intermediate containers.
///
/// Bare numeric segments index into an array when one is already there and
/// act as object keys otherwise.
pub fn set_value(data: &mut Value, path: &str, value: Value) -> Result<()> {
    let tokens = tokenize(path)?;
    let mut target = data;
    for token in &tokens {
        target = child_mut(target, token).map_err(|reason| {
            RillError::InvalidMessageData(format!("path '{}' {}", path, reason))
        })?;
    }
    *target = value;
    Ok(())
}

/// How far past the end of an array a patch may write; the gap is filled with nulls.
const MAX_ARRAY_GAP: usize = 1024;

fn child_mut<'a>(
    target: &'a mut Value,
    token: &PathToken,
) -> std::result::Result<&'a mut Value, String> {
    let index = match token {
        PathToken::Index(index) => Some(*index),
        PathToken::Key(key) if target.is_array() => key.parse::<usize>().ok(),
        PathToken::Key(_) => None,
    };

    match (index, token) {
        (Some(index), _) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            let Value::Array(items) = target else {
                return Err("does not resolve to an array".to_string());
            };
            if index >= items.len() {
                if index - items.len() > MAX_ARRAY_GAP {
                    return Err(format!(
                        "index {} is too far past the array end ({})",
                        index,
                        items.len()
                    ));
                }
                items.resize(index + 1, Value::Null);
            }
            Ok(&mut items[index])
        }
        (None, PathToken::Key(key)) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let Value::Object(map) = target else {
                return Err("does not resolve to an object".to_string());
            };
            Ok(map.entry(key.clone()).or_insert(Value::Null))
        }
        (None, PathToken::Index(_)) => Err("has an unusable index".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("a.b[2][0].c").unwrap(),
            vec![
                PathToken::Key("a".to_string()),
                PathToken::Key("b".to_string()),
                PathToken::Index(2),
                PathToken::Index(0),
                PathToken::Key("c".to_string()),
            ]
        );
        assert!(tokenize("").is_err());
        assert!(tokenize("a..b").is_err());
        assert!(tokenize("a[x]").is_err());
        assert!(tokenize("a[1]b").is_err());
    }

    #[test]
    fn test_set_existing_and_missing_paths() {
        let mut data = json!({"name": "alice", "address": {"city": "Berlin"}});
        set_value(&mut data, "address.city", json!("Paris")).unwrap();
        set_value(&mut data, "address.zip", json!("75001")).unwrap();
        set_value(&mut data, "tags[1]", json!("b")).unwrap();
        set_value(&mut data, "deep.nested[0].flag", json!(true)).unwrap();

        assert_eq!(
            data,
            json!({
                "name": "alice",
                "address": {"city": "Paris", "zip": "75001"},
                "tags": [null, "b"],
                "deep": {"nested": [{"flag": true}]}
            })
        );
    }

    #[test]
    fn test_bare_numeric_segments() {
        let mut data = json!({"list": [1, 2, 3], "map": {}});
        set_value(&mut data, "list.1", json!(20)).unwrap();
        set_value(&mut data, "map.1", json!("one")).unwrap();
        assert_eq!(data, json!({"list": [1, 20, 3], "map": {"1": "one"}}));
    }

    #[test]
    fn test_replaces_scalars_on_the_way() {
        let mut data = json!({"a": 5});
        set_value(&mut data, "a.b", json!(1)).unwrap();
        assert_eq!(data, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_index_far_past_array_end_is_rejected() {
        let mut data = json!({"a": [1]});
        let err = set_value(&mut data, "a[18446744073709551615]", json!(1)).unwrap_err();
        assert!(matches!(err, RillError::InvalidMessageData(_)));
        assert!(set_value(&mut data, "b[10000000000]", json!(1)).is_err());
        assert_eq!(data["a"], json!([1]));

        set_value(&mut data, "a[3]", json!(4)).unwrap();
        assert_eq!(data["a"], json!([1, null, null, 4]));
    }
}
