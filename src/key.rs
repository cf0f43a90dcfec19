//! Key types for query caching.
//!
//! A [`QueryKey`] is an ordered sequence of [`KeyPart`]s. Its canonical
//! serialized form (JSON array text) is the identity of a cache entry: two keys
//! that serialize to the same string address the same entry, even if they were
//! built differently.

use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// One element of a [`QueryKey`].
///
/// Records keep their fields in insertion order, so two records with the same
/// fields in a different order serialize differently.
#[derive(Clone, PartialEq)]
pub enum KeyPart {
    /// An absent value. Serialized as `null` inside a sequence and omitted as a
    /// record field.
    Undefined,
    /// An explicit null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. Integral values serialize without a fractional part.
    Number(f64),
    /// A string.
    String(String),
    /// A nested ordered sequence.
    List(Vec<KeyPart>),
    /// A plain record with insertion-ordered fields.
    Record(Vec<(String, KeyPart)>),
}

impl KeyPart {
    /// Start building a record part.
    ///
    /// ```ignore
    /// let filters = KeyPart::record().field("page", 2).field("q", "ana");
    /// ```
    pub fn record() -> Self {
        KeyPart::Record(Vec::new())
    }

    /// Append a field to a record part.
    ///
    /// Calling this on a non-record part turns it into a record holding only
    /// the new field.
    pub fn field(self, name: impl Into<String>, value: impl Into<KeyPart>) -> Self {
        let mut fields = match self {
            KeyPart::Record(fields) => fields,
            _ => Vec::new(),
        };
        fields.push((name.into(), value.into()));
        KeyPart::Record(fields)
    }

    fn is_undefined(&self) -> bool {
        matches!(self, KeyPart::Undefined)
    }
}

impl Serialize for KeyPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KeyPart::Undefined | KeyPart::Null => serializer.serialize_unit(),
            KeyPart::Bool(b) => serializer.serialize_bool(*b),
            KeyPart::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    // serde_json writes non-finite floats as `null`
                    serializer.serialize_f64(*n)
                }
            }
            KeyPart::String(s) => serializer.serialize_str(s),
            KeyPart::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            KeyPart::Record(fields) => {
                let present = fields.iter().filter(|(_, v)| !v.is_undefined());
                let mut map = serializer.serialize_map(None)?;
                for (name, value) in present {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}

impl fmt::Debug for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Undefined => write!(f, "undefined"),
            _ => f.write_str(&to_json(self)),
        }
    }
}

macro_rules! key_part_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    KeyPart::Number(value as f64)
                }
            }
        )*
    };
}

key_part_from_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::String(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::String(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::String(value.clone())
    }
}

impl From<()> for KeyPart {
    fn from(_: ()) -> Self {
        KeyPart::Null
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map_or(KeyPart::Null, Into::into)
    }
}

impl<T: Into<KeyPart>> From<Vec<T>> for KeyPart {
    fn from(value: Vec<T>) -> Self {
        KeyPart::List(value.into_iter().map(Into::into).collect())
    }
}

/// Cache key for a query.
///
/// A bare scalar converts into a one-element key, so `QueryKey::from("todos")`
/// and `query_key!["todos"]` address the same entry.
#[derive(Clone, PartialEq, Default)]
pub struct QueryKey {
    parts: Vec<KeyPart>,
}

impl QueryKey {
    /// Create a key from its parts.
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    /// Append a part, returning the extended key.
    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// The parts of this key, in order.
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Canonical string used as the cache index.
    pub fn serialize(&self) -> String {
        to_json(&self.parts)
    }

    /// Canonical string with its trailing `]` removed.
    ///
    /// Every key that extends this one has a serialized form starting with
    /// this pattern. So do some keys that don't (`["page",1` also matches
    /// `["page",12]`); see [`PrefixMatch`].
    pub fn prefix_pattern(&self) -> String {
        let mut serialized = self.serialize();
        if serialized.ends_with(']') {
            serialized.pop();
        }
        serialized
    }

    /// Whether the leading parts of `self` equal every part of `prefix`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.parts.len() <= self.parts.len()
            && self
                .parts
                .iter()
                .zip(&prefix.parts)
                .all(|(part, prefix_part)| part == prefix_part)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    // Map keys are always strings here, which is the only way serde_json
    // serialization can fail.
    serde_json::to_string(value).unwrap_or_else(|_| String::from("null"))
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl From<KeyPart> for QueryKey {
    fn from(part: KeyPart) -> Self {
        Self { parts: vec![part] }
    }
}

impl From<Vec<KeyPart>> for QueryKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

impl<T: Into<KeyPart>, const N: usize> From<[T; N]> for QueryKey {
    fn from(parts: [T; N]) -> Self {
        Self::new(parts.into_iter().map(Into::into))
    }
}

macro_rules! query_key_from_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for QueryKey {
                fn from(value: $ty) -> Self {
                    QueryKey::from(KeyPart::from(value))
                }
            }
        )*
    };
}

query_key_from_scalar!(
    &str, String, bool, (), i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64
);

macro_rules! query_key_from_tuple {
    ($($name:ident),+) => {
        impl<$($name: Into<KeyPart>),+> From<($($name,)+)> for QueryKey {
            #[allow(non_snake_case)]
            fn from(($($name,)+): ($($name,)+)) -> Self {
                QueryKey::new([$($name.into()),+])
            }
        }
    };
}

query_key_from_tuple!(A);
query_key_from_tuple!(A, B);
query_key_from_tuple!(A, B, C);
query_key_from_tuple!(A, B, C, D);
query_key_from_tuple!(A, B, C, D, E);
query_key_from_tuple!(A, B, C, D, E, F);

/// Build a [`QueryKey`] from heterogeneous parts.
///
/// ```ignore
/// let key = query_key!["user", 1, KeyPart::record().field("tab", "posts")];
/// assert_eq!(key.serialize(), r#"["user",1,{"tab":"posts"}]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::QueryKey::new([$($crate::KeyPart::from($part)),*])
    };
}

/// How [`invalidate`](crate::QueryClient::invalidate) decides which stored keys
/// belong to a prefix group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefixMatch {
    /// Compare canonical strings: a stored key matches when its serialized
    /// form starts with [`QueryKey::prefix_pattern`]. `["page",1]` therefore
    /// also matches `["page",12]`.
    #[default]
    Textual,
    /// Compare parts: a stored key matches when its leading parts equal the
    /// prefix's parts.
    Structural,
}

impl PrefixMatch {
    pub(crate) fn matches(self, stored: &QueryKey, stored_serialized: &str, prefix: &Prefix) -> bool {
        match self {
            PrefixMatch::Textual => stored_serialized.starts_with(&prefix.pattern),
            PrefixMatch::Structural => stored.starts_with(&prefix.key),
        }
    }
}

/// A prefix key with its textual pattern computed once per invalidation pass.
pub(crate) struct Prefix {
    key: QueryKey,
    pattern: String,
}

impl Prefix {
    pub(crate) fn new(key: QueryKey) -> Self {
        let pattern = key.prefix_pattern();
        Self { key, pattern }
    }
}
