//! Data models for CAMS
//!
//! Defines the catalog record and the id-keyed record set. The JSON shape
//! is shared by local persistence and the remote file: a bare array of
//! record objects, no envelope.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::Utc;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Largest integer an `f64` represents exactly (2^53)
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Time-ordered record identifier
///
/// Ids are milliseconds since the epoch at creation time. Imported records
/// carry a fractional tie-breaker so that a burst created within the same
/// millisecond stays unique. The value is always finite.
#[derive(Debug, Clone, Copy)]
pub struct RecordId(f64);

impl RecordId {
    /// Generate an id from the current wall clock
    pub fn generate() -> Self {
        Self(Utc::now().timestamp_millis() as f64)
    }

    /// Generate an id with a random fractional tie-breaker
    pub fn generate_unique() -> Self {
        let noise = (Uuid::new_v4().as_u128() % 1000) as f64 / 1000.0;
        Self(Utc::now().timestamp_millis() as f64 + noise)
    }

    /// Create an id from a raw value, rejecting NaN and infinities
    pub fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() {
            // Fold -0.0 into 0.0 so equality and hashing agree
            Some(Self(if value == 0.0 { 0.0 } else { value }))
        } else {
            None
        }
    }

    /// Create an id from a millisecond timestamp
    pub fn from_millis(millis: i64) -> Self {
        Self(millis as f64)
    }

    /// The raw numeric value, used as the fallback recency marker
    pub fn value(&self) -> f64 {
        self.0
    }

    fn is_integral(&self) -> bool {
        self.0.fract() == 0.0 && self.0.abs() < MAX_SAFE_INTEGER
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integral() {
            write!(f, "{}", self.0 as i64)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for RecordId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| format!("Invalid record id: '{}'", s))?;
        Self::from_f64(value).ok_or_else(|| format!("Invalid record id: '{}'", s))
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_integral() {
            serializer.serialize_i64(self.0 as i64)
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordIdVisitor;

        impl Visitor<'_> for RecordIdVisitor {
            type Value = RecordId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a finite number or numeric string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordId, E> {
                Ok(RecordId::from_millis(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordId, E> {
                Ok(RecordId(v as f64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<RecordId, E> {
                RecordId::from_f64(v).ok_or_else(|| E::custom("record id must be finite"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<RecordId, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(RecordIdVisitor)
    }
}

/// Other clients write `null` for empty fields
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timestamp in milliseconds, written by other clients as an integer, a
/// fractional number or a numeric string
///
/// Fractions are floored. `null` and unparseable strings read as absent,
/// which falls back to the id for recency.
fn lenient_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    struct MillisVisitor;

    impl<'de> Visitor<'de> for MillisVisitor {
        type Value = Option<i64>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a timestamp in milliseconds")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Option<i64>, D2::Error> {
            d.deserialize_any(self)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Option<i64>, E> {
            Ok(Some(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Option<i64>, E> {
            Ok(Some(i64::try_from(v).unwrap_or(i64::MAX)))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Option<i64>, E> {
            // `as` saturates at the i64 bounds
            Ok(v.is_finite().then(|| v.floor() as i64))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Option<i64>, E> {
            let v = v.trim();
            match v.parse::<i64>() {
                Ok(millis) => Ok(Some(millis)),
                Err(_) => match v.parse::<f64>() {
                    Ok(millis) => self.visit_f64(millis),
                    Err(_) => Ok(None),
                },
            }
        }
    }

    deserializer.deserialize_any(MillisVisitor)
}

/// A catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique, time-ordered identifier
    pub id: RecordId,
    /// Romanized display name
    #[serde(default, deserialize_with = "null_as_default")]
    pub english: String,
    /// Name in Chinese characters
    #[serde(default, deserialize_with = "null_as_default")]
    pub chinese: String,
    /// Sort key derived from the romanized name
    #[serde(
        rename = "pinyin",
        alias = "phoneticKey",
        default,
        deserialize_with = "null_as_default"
    )]
    pub phonetic_key: String,
    /// Tags for organization
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    /// Marked as favorite
    #[serde(default, deserialize_with = "null_as_default")]
    pub favorite: bool,
    /// Opaque image reference (data URL or remote URL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Last modification, milliseconds since the epoch
    #[serde(
        default,
        deserialize_with = "lenient_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<i64>,
    /// Fields written by other clients, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Create a new record with a fresh id
    pub fn new(english: impl Into<String>, chinese: impl Into<String>) -> Self {
        Self::with_id(RecordId::generate(), english, chinese)
    }

    /// Create a record with a specific id
    pub fn with_id(id: RecordId, english: impl Into<String>, chinese: impl Into<String>) -> Self {
        let english = english.into();
        Self {
            id,
            phonetic_key: phonetic_key(&english),
            english,
            chinese: chinese.into(),
            tags: Vec::new(),
            favorite: false,
            image: None,
            updated_at: Some(Utc::now().timestamp_millis()),
            extra: Map::new(),
        }
    }

    /// Recency marker used to break merge conflicts
    ///
    /// The explicit timestamp when present, else the id value.
    pub fn recency(&self) -> f64 {
        self.updated_at.map(|t| t as f64).unwrap_or(self.id.value())
    }

    /// Stamp the record as modified now
    pub fn touch(&mut self) {
        let now = Utc::now().timestamp_millis();
        // Never move backwards past the current marker, even with clock skew
        let floor = self.recency().floor() as i64 + 1;
        self.updated_at = Some(now.max(floor));
    }

    /// Update the romanized name (and its sort key)
    pub fn set_english(&mut self, english: impl Into<String>) {
        self.english = english.into();
        self.phonetic_key = phonetic_key(&self.english);
        self.touch();
    }

    /// Update the Chinese name
    pub fn set_chinese(&mut self, chinese: impl Into<String>) {
        self.chinese = chinese.into();
        self.touch();
    }

    /// Set the image reference
    pub fn set_image(&mut self, image: Option<String>) {
        self.image = image.filter(|i| !i.trim().is_empty());
        self.touch();
    }

    /// Add a tag
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
            self.touch();
        }
    }

    /// Remove a tag
    pub fn remove_tag(&mut self, tag: &str) {
        if let Some(pos) = self.tags.iter().position(|t| t == tag) {
            self.tags.remove(pos);
            self.touch();
        }
    }

    /// Set all tags (replacing existing, duplicates dropped)
    pub fn set_tags(&mut self, tags: Vec<String>) {
        let mut unique = Vec::with_capacity(tags.len());
        for tag in tags {
            if !tag.is_empty() && !unique.contains(&tag) {
                unique.push(tag);
            }
        }
        self.tags = unique;
        self.touch();
    }

    /// Flip the favorite flag
    pub fn toggle_favorite(&mut self) {
        self.favorite = !self.favorite;
        self.touch();
    }

    /// Check whether the record matches a search query
    ///
    /// Case-insensitive on the romanized name and tags, exact substring on
    /// the Chinese name.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.english.to_lowercase().contains(&q)
            || self.chinese.contains(query)
            || self.tags.join(",").to_lowercase().contains(&q)
    }
}

/// Derive the phonetic sort key from a romanized name
///
/// Decomposes, strips combining diacritics and lower-cases, so "Yáng Mì"
/// sorts as "yang mi".
pub fn phonetic_key(text: &str) -> String {
    text.nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect::<String>()
        .to_lowercase()
}

/// Collection of records keyed by id
///
/// Serializes as a JSON array ordered by id. Deserializing an array that
/// repeats an id keeps the occurrence with the greater recency marker (the
/// first one on a tie), so ids are unique in every value of this type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<RecordId, Record>,
}

impl RecordSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from records, resolving repeated ids by recency
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut set = Self::new();
        for record in records {
            match set.records.entry(record.id) {
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                btree_map::Entry::Occupied(mut slot) => {
                    if record.recency() > slot.get().recency() {
                        slot.insert(record);
                    }
                }
            }
        }
        set
    }

    /// Parse a JSON array of records
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Serialize to a compact JSON array
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Serialize to an indented JSON array (for exports)
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &RecordId) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    /// Insert or replace a record, returning the previous one
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id, record)
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        self.records.remove(id)
    }

    /// Iterate records in id order
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Iterate ids in order
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = btree_map::IntoValues<RecordId, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

impl Serialize for RecordSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.records.values())
    }
}

impl<'de> Deserialize<'de> for RecordSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<Record>::deserialize(deserializer)?;
        Ok(Self::from_records(records))
    }
}
