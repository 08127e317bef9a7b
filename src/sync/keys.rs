//! Cache key definitions.
//!
//! A `CacheKey` is an ordered list of JSON segments identifying a query and
//! its parameters. Equality and hashing are structural: two keys are equal
//! when their canonical serialized forms are equal, regardless of how the
//! segments were built or in which order object fields were inserted.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known root segments used by the portal's queries.
pub mod names {
    pub const ADMIN_WATER_DATA: &str = "adminWaterData";
    pub const WATER_DATA: &str = "waterData";
    /// Shared key of the public homepage water table.
    pub const WATER_DATA_QUERY_KEY: &str = "waterQualityData";

    pub const ADMIN_SEWER_DATA: &str = "adminSewerData";
    pub const SEWER_DATA: &str = "sewerData";
    /// Shared key of the public homepage sewer table.
    pub const SEWER_DATA_QUERY_KEY: &str = "sewerQualityData";

    pub const ADMIN_SAMPLES: &str = "adminSamples";
    pub const SAMPLES: &str = "samples";

    pub const ADMIN_PARAMETERS: &str = "adminParameters";
    pub const TEST_PARAMETERS: &str = "testParameters";

    pub const ADMIN_APPLICATIONS: &str = "adminApplications";
    pub const APPLICATION_STATUS: &str = "applicationStatus";

    /// Chart aggregates on the admin dashboard.
    pub const DASHBOARD_STATS: &str = "dashboardStats";
}

/// Structural identifier of a cached query result.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Value>", into = "Vec<Value>")]
pub struct CacheKey {
    segments: Vec<Value>,
    canonical: String,
}

impl CacheKey {
    /// Build a key from its ordered segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        Self::from(segments.into_iter().map(Into::into).collect::<Vec<_>>())
    }

    /// A single-segment key, the usual shape of an invalidation prefix.
    pub fn root(name: &str) -> Self {
        Self::new([name])
    }

    /// Append one segment, returning the extended key.
    pub fn segment(self, segment: impl Into<Value>) -> Self {
        let mut segments = self.segments;
        segments.push(segment.into());
        Self::from(segments)
    }

    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The first segment when it is a string.
    pub fn name(&self) -> Option<&str> {
        self.segments.first().and_then(Value::as_str)
    }

    /// Canonical serialized form; the basis of equality.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// True when `prefix` equals this key or is a leading run of its segments.
    ///
    /// The empty key is a prefix of every key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(wanted, actual)| wanted == actual)
    }
}

impl From<Vec<Value>> for CacheKey {
    fn from(segments: Vec<Value>) -> Self {
        let mut canonical = String::new();
        canonical.push('[');
        for (index, segment) in segments.iter().enumerate() {
            if index > 0 {
                canonical.push(',');
            }
            write_canonical(segment, &mut canonical);
        }
        canonical.push(']');
        Self {
            segments,
            canonical,
        }
    }
}

impl From<CacheKey> for Vec<Value> {
    fn from(key: CacheKey) -> Self {
        key.segments
    }
}

impl From<&str> for CacheKey {
    fn from(name: &str) -> Self {
        Self::root(name)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

// Object fields are emitted in sorted order so the output does not depend on
// serde_json's map representation.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (name, field)) in fields.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
