//! Core type definitions for donut
//!
//! Validated bucket and object names, bucket ACLs, metadata records and
//! the placement slot naming a single replica location.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Flat string-keyed metadata record, serialized with stable key order
pub type Metadata = BTreeMap<String, String>;

/// Version tag written into every object metadata record
pub const OBJECT_METADATA_VERSION: &str = "1.0";

/// Version tag written into every donut object metadata record
pub const DONUT_OBJECT_METADATA_VERSION: &str = "1.0";

/// Version tag for bucket records
pub const BUCKET_METADATA_VERSION: &str = "1.0";

/// Version tag for coordinator and node configuration records
pub const CONFIG_VERSION: &str = "1.0";

/// On-disk file names used inside a domain directory
pub mod files {
    /// Coordinator record at the domain root
    pub const DONUT_CONFIG: &str = "donutMetadata.json";
    /// Node record at the domain root
    pub const NODE_CONFIG: &str = "nodeMetadata.json";
    /// Bucket record inside each bucket directory
    pub const BUCKET_METADATA: &str = "bucketMetadata.json";
    /// User-facing object metadata inside each object directory
    pub const OBJECT_METADATA: &str = "objectMetadata.json";
    /// Internal object bookkeeping inside each object directory
    pub const DONUT_OBJECT_METADATA: &str = "donutObjectMetadata.json";
    /// Object payload inside each object directory
    pub const OBJECT_DATA: &str = "data";
}

/// Bucket name, validated against S3 naming rules
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BucketName(String);

impl BucketName {
    /// Create a new bucket name (validates S3 naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, BucketNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the bucket name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), BucketNameError> {
        if name.len() < 3 {
            return Err(BucketNameError::TooShort);
        }
        if name.len() > 63 {
            return Err(BucketNameError::TooLong);
        }

        let first = name.chars().next().unwrap_or_default();
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(BucketNameError::InvalidStartChar);
        }

        let last = name.chars().last().unwrap_or_default();
        if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
            return Err(BucketNameError::InvalidEndChar);
        }

        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.' {
                return Err(BucketNameError::InvalidChar(c));
            }
        }

        if name.contains("..") {
            return Err(BucketNameError::ConsecutivePeriods);
        }

        if name.parse::<std::net::Ipv4Addr>().is_ok() {
            return Err(BucketNameError::LooksLikeIpAddress);
        }

        Ok(())
    }
}

impl fmt::Debug for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketName({:?})", self.0)
    }
}

impl AsRef<str> for BucketName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when creating a bucket name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketNameError {
    #[error("bucket name must be at least 3 characters")]
    TooShort,
    #[error("bucket name must be at most 63 characters")]
    TooLong,
    #[error("bucket name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("bucket name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("bucket name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("bucket name cannot contain consecutive periods")]
    ConsecutivePeriods,
    #[error("bucket name cannot be formatted as an IP address")]
    LooksLikeIpAddress,
}

/// Longest encoded key that still fits in one file name
pub const MAX_ENCODED_KEY_LEN: usize = 255;

/// Object key (path within a bucket)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create a new object key
    pub fn new(key: impl Into<String>) -> Result<Self, ObjectKeyError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Get the object key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name holding this object on disk
    ///
    /// Keys may contain `/`; encoding keeps every object one level below
    /// its bucket directory.
    #[must_use]
    pub fn encoded(&self) -> String {
        urlencoding::encode(&self.0).into_owned()
    }

    /// Recover a key from its on-disk directory name
    #[must_use]
    pub fn decode(encoded: &str) -> Option<Self> {
        let key = urlencoding::decode(encoded).ok()?;
        Self::new(key.into_owned()).ok()
    }

    fn validate(key: &str) -> Result<(), ObjectKeyError> {
        if key.is_empty() {
            return Err(ObjectKeyError::Empty);
        }

        // Maximum length: 1024 bytes (UTF-8)
        if key.len() > 1024 {
            return Err(ObjectKeyError::TooLong);
        }

        // Bucket directories hold their record next to the object directories
        if key == "." || key == ".." || key == files::BUCKET_METADATA {
            return Err(ObjectKeyError::Reserved);
        }

        if key.chars().any(char::is_control) {
            return Err(ObjectKeyError::ControlChar);
        }

        // The encoded key is a single directory name on disk
        if urlencoding::encode(key).len() > MAX_ENCODED_KEY_LEN {
            return Err(ObjectKeyError::EncodedTooLong);
        }

        Ok(())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({:?})", self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when creating an object key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key cannot exceed 1024 bytes")]
    TooLong,
    #[error("encoded object key cannot exceed {MAX_ENCODED_KEY_LEN} bytes")]
    EncodedTooLong,
    #[error("object key is reserved")]
    Reserved,
    #[error("object key cannot contain control characters")]
    ControlChar,
}

/// Canned bucket ACLs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Acl {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
}

impl Acl {
    /// Canonical string form as stored in bucket metadata
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRead => "public-read",
            Self::PublicReadWrite => "public-read-write",
            Self::AuthenticatedRead => "authenticated-read",
        }
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Acl {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "private" => Ok(Self::Private),
            "public-read" => Ok(Self::PublicRead),
            "public-read-write" => Ok(Self::PublicReadWrite),
            "authenticated-read" => Ok(Self::AuthenticatedRead),
            other => Err(crate::Error::InvalidAcl(other.to_string())),
        }
    }
}

/// One replica location: a disk order on a named node
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub node: String,
    pub order: usize,
}

impl Slot {
    #[must_use]
    pub fn new(node: impl Into<String>, order: usize) -> Self {
        Self {
            node: node.into(),
            order,
        }
    }

    /// Render a slot list the way it is stored in donut object metadata
    #[must_use]
    pub fn join(slots: &[Self]) -> String {
        let mut sorted = slots.to_vec();
        sorted.sort();
        sorted
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a stored slot list; an empty string is an empty list
    pub fn split(list: &str) -> Result<Vec<Self>, crate::Error> {
        list.split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.order)
    }
}

impl FromStr for Slot {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, order) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::invalid_argument(format!("malformed slot: {s}")))?;
        let order = order
            .parse()
            .map_err(|_| crate::Error::invalid_argument(format!("malformed slot order: {s}")))?;
        Ok(Self::new(node, order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bucket_names() {
        assert!(BucketName::new("my-bucket").is_ok());
        assert!(BucketName::new("bucket123").is_ok());
        assert!(BucketName::new("my.bucket.name").is_ok());
        assert!(BucketName::new("abc").is_ok());
    }

    #[test]
    fn test_invalid_bucket_names() {
        assert_eq!(BucketName::new("ab"), Err(BucketNameError::TooShort));
        assert_eq!(
            BucketName::new("a".repeat(64)),
            Err(BucketNameError::TooLong)
        );
        assert_eq!(
            BucketName::new("-bucket"),
            Err(BucketNameError::InvalidStartChar)
        );
        assert_eq!(
            BucketName::new("bucket-"),
            Err(BucketNameError::InvalidEndChar)
        );
        assert_eq!(
            BucketName::new("My-Bucket"),
            Err(BucketNameError::InvalidStartChar)
        );
        assert_eq!(
            BucketName::new("my_bucket"),
            Err(BucketNameError::InvalidChar('_'))
        );
        assert_eq!(
            BucketName::new("my..bucket"),
            Err(BucketNameError::ConsecutivePeriods)
        );
        assert_eq!(
            BucketName::new("192.168.1.1"),
            Err(BucketNameError::LooksLikeIpAddress)
        );
    }

    #[test]
    fn test_object_key_encoding() {
        let key = ObjectKey::new("photos/2015/june.jpg").unwrap();
        let encoded = key.encoded();
        assert!(!encoded.contains('/'));
        assert_eq!(ObjectKey::decode(&encoded), Some(key));

        let spaced = ObjectKey::new("a b%c").unwrap();
        assert_eq!(spaced.encoded(), "a%20b%25c");
        assert_eq!(ObjectKey::decode("a%20b%25c"), Some(spaced));
    }

    #[test]
    fn test_invalid_object_keys() {
        assert_eq!(ObjectKey::new(""), Err(ObjectKeyError::Empty));
        assert_eq!(ObjectKey::new(".."), Err(ObjectKeyError::Reserved));
        assert_eq!(
            ObjectKey::new(files::BUCKET_METADATA),
            Err(ObjectKeyError::Reserved)
        );
        assert_eq!(
            ObjectKey::new("x".repeat(1025)),
            Err(ObjectKeyError::TooLong)
        );
        assert_eq!(ObjectKey::new("a\nb"), Err(ObjectKeyError::ControlChar));
        assert!(ObjectKey::decode("%0A").is_none());
    }

    #[test]
    fn test_encoded_key_length_limit() {
        assert!(ObjectKey::new("a".repeat(255)).is_ok());
        assert_eq!(
            ObjectKey::new("a".repeat(256)),
            Err(ObjectKeyError::EncodedTooLong)
        );

        // Each '/' encodes to three bytes
        let key = format!("{}{}", "/".repeat(84), "abc");
        assert_eq!(ObjectKey::new(key).unwrap().encoded().len(), 255);
        assert_eq!(
            ObjectKey::new("/".repeat(86)),
            Err(ObjectKeyError::EncodedTooLong)
        );
    }

    #[test]
    fn test_acl_parse() {
        assert_eq!("".parse::<Acl>().unwrap(), Acl::Private);
        assert_eq!("public-read".parse::<Acl>().unwrap(), Acl::PublicRead);
        assert!("world-writable".parse::<Acl>().is_err());
        assert_eq!(Acl::AuthenticatedRead.to_string(), "authenticated-read");
    }

    #[test]
    fn test_slot_list() {
        let slots = vec![Slot::new("node2", 0), Slot::new("node1", 1), Slot::new("node1", 0)];
        let joined = Slot::join(&slots);
        assert_eq!(joined, "node1:0,node1:1,node2:0");
        assert_eq!(Slot::split(&joined).unwrap().len(), 3);
        assert!(Slot::split("").unwrap().is_empty());
        assert!(Slot::split("node1").is_err());
    }
}
