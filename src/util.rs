//! Key helpers shared by drivers and decorators.

/// Every ancestor prefix of `key`, shallowest first.
///
/// `"a/b/c"` yields `["a", "a/b"]`.
pub fn prefixes(key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut idx = 0;
    while let Some(pos) = key[idx..].find('/') {
        let end = idx + pos;
        out.push(key[..end].to_string());
        idx = end + 1;
    }
    out
}

/// Append `items` to `list`, skipping ones already present.
pub fn append_if_missing(list: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

/// Reduce full keys to the list segments below `prefix`.
///
/// Keys not starting with `prefix` are ignored. The remainder is cut at its
/// first '/' (keeping the '/'), then deduplicated and sorted.
pub fn list_segments<I, S>(keys: I, prefix: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = keys
        .into_iter()
        .filter_map(|key| {
            let rest = key.as_ref().strip_prefix(prefix)?;
            if rest.is_empty() {
                return None;
            }
            Some(match rest.find('/') {
                Some(i) => rest[..=i].to_string(),
                None => rest.to_string(),
            })
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Split a key at its last '/': `("a/b", "c")` for `"a/b/c"`, `("", "c")`
/// for `"c"`.
pub fn split_parent(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(i) => (&key[..i], &key[i + 1..]),
        None => ("", key),
    }
}

/// Serde adapter for byte fields stored as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert!(prefixes("a").is_empty());
        assert_eq!(prefixes("a/b/c"), vec!["a".to_string(), "a/b".to_string()]);
    }

    #[test]
    fn test_append_if_missing() {
        let mut list = vec!["a".to_string()];
        append_if_missing(&mut list, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(list, vec!["a", "b"]);
    }

    #[test]
    fn test_list_segments() {
        let keys = ["foo", "foo/bar", "foo/bar/baz", "other"];
        assert_eq!(list_segments(keys, ""), vec!["foo", "foo/", "other"]);
        assert_eq!(list_segments(keys, "foo/"), vec!["bar", "bar/"]);
        assert_eq!(list_segments(keys, "foo/bar/"), vec!["baz"]);
        assert!(list_segments(keys, "nope/").is_empty());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("a/b/c"), ("a/b", "c"));
        assert_eq!(split_parent("c"), ("", "c"));
    }
}
