//! Object listing with prefix, marker and delimiter handling

use serde::Serialize;

/// One page of a bucket listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ListObjectsResult {
    /// Object keys, ascending
    pub objects: Vec<String>,
    /// Keys rolled up at the delimiter, ascending
    pub common_prefixes: Vec<String>,
    /// More entries follow this page
    pub is_truncated: bool,
}

impl ListObjectsResult {
    /// Entries on this page
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len() + self.common_prefixes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page through `keys`, which must be sorted and free of duplicates
///
/// Keys at or before `marker` and keys not starting with `prefix` are
/// skipped. With a non-empty `delimiter`, the part of a key after
/// `prefix` is cut at the first delimiter and the key is reported once
/// as `prefix + segment + delimiter`. Objects and prefixes both count
/// toward `max_keys`.
///
/// A common prefix is reported only if it sorts after `marker`, so a
/// marker inside a rolled-up group suppresses the rest of that group.
pub fn paginate<I, S>(
    keys: I,
    prefix: &str,
    marker: &str,
    delimiter: &str,
    max_keys: usize,
) -> ListObjectsResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result = ListObjectsResult::default();

    for key in keys {
        let key = key.as_ref();
        if key <= marker {
            continue;
        }
        let Some(key_after_prefix) = key.strip_prefix(prefix) else {
            continue;
        };

        let common_prefix = if delimiter.is_empty() {
            None
        } else {
            key_after_prefix
                .find(delimiter)
                .map(|pos| format!("{prefix}{}{delimiter}", &key_after_prefix[..pos]))
        };

        if let Some(common_prefix) = common_prefix {
            // Keys under one prefix are adjacent in sorted order
            if common_prefix.as_str() <= marker
                || result.common_prefixes.last() == Some(&common_prefix)
            {
                continue;
            }
            if result.len() == max_keys {
                result.is_truncated = true;
                break;
            }
            result.common_prefixes.push(common_prefix);
        } else {
            if result.len() == max_keys {
                result.is_truncated = true;
                break;
            }
            result.objects.push(key.to_string());
        }
    }

    result
}
