use crate::error::QueryError;
use crate::run_type::RunType;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path separator inside configuration keys
pub const SEPARATOR: &str = "/";

/// Root path under which component configuration entries live
pub const CONFIG_COMPONENTS_PATH: &str = "components/";

lazy_static! {
    //                                        component      /RUNTYPE       /rolename      /entry         @timestamp
    static ref CANONICAL_KEY_REGEX: Regex =
        Regex::new(r"^([A-Za-z0-9_-]+)/([A-Z0-9_-]+)/([A-Za-z0-9_-]+)/([A-Za-z0-9_-]+)(@[0-9]+)?$")
            .expect("canonical key regex is valid");

    // Raw rendering: the timestamp arrives as a fifth path segment.
    static ref RAW_KEY_REGEX: Regex =
        Regex::new(r"^([A-Za-z0-9_-]+)/([A-Z0-9_-]+)/([A-Za-z0-9_-]+)/([A-Za-z0-9_-]+)(/[0-9]+)?$")
            .expect("raw key regex is valid");
}

/// Returns true if the string is a valid component configuration key in
/// either the canonical (`@timestamp`) or raw (`/timestamp`) rendering.
pub fn is_valid_key(path: &str) -> bool {
    CANONICAL_KEY_REGEX.is_match(path) || RAW_KEY_REGEX.is_match(path)
}

/// A parsed component configuration query.
///
/// The canonical rendering separates the optional timestamp with `@`
/// ([`Query::path`]); the raw rendering uses a plain path segment
/// ([`Query::raw`]). Both parse back to the same tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Component the entry belongs to, e.g. `readout`
    pub component: String,
    /// Run type the entry applies to
    pub flavor: RunType,
    /// Workflow role name the entry targets
    pub rolename: String,
    /// Entry key within the component
    pub entry_key: String,
    /// Optional version timestamp; empty when querying the latest entry
    pub timestamp: String,
}

impl Query {
    /// Parse a configuration key in either rendering.
    pub fn new(path: &str) -> Result<Self, QueryError> {
        if !is_valid_key(path) {
            return Err(QueryError::BadKey);
        }

        let (body, timestamp) = match path.split_once('@') {
            Some((body, ts)) => (body, ts.to_string()),
            None => (path, String::new()),
        };

        let mut params = body.split(SEPARATOR);
        let component = params.next().ok_or(QueryError::BadKey)?;
        let flavor = params.next().ok_or(QueryError::BadKey)?;
        let rolename = params.next().ok_or(QueryError::BadKey)?;
        let entry_key = params.next().ok_or(QueryError::BadKey)?;

        // Raw rendering carries the timestamp as a fifth segment.
        let timestamp = match params.next() {
            Some(ts) if timestamp.is_empty() && !ts.is_empty() => ts.to_string(),
            Some(_) => return Err(QueryError::BadKey),
            None => timestamp,
        };

        Ok(Query {
            component: component.to_string(),
            flavor: flavor.parse()?,
            rolename: rolename.to_string(),
            entry_key: entry_key.to_string(),
            timestamp,
        })
    }

    /// Canonical rendering: `component/RUNTYPE/rolename/entry[@timestamp]`
    pub fn path(&self) -> String {
        let path = self.without_timestamp();
        if self.timestamp.is_empty() {
            path
        } else {
            format!("{}@{}", path, self.timestamp)
        }
    }

    /// Raw rendering: `component/RUNTYPE/rolename/entry[/timestamp]`
    pub fn raw(&self) -> String {
        let path = self.without_timestamp();
        if self.timestamp.is_empty() {
            path
        } else {
            format!("{}{}{}", path, SEPARATOR, self.timestamp)
        }
    }

    /// Rendering without any timestamp component
    pub fn without_timestamp(&self) -> String {
        [
            self.component.as_str(),
            self.flavor.as_str(),
            self.rolename.as_str(),
            self.entry_key.as_str(),
        ]
        .join(SEPARATOR)
    }

    /// Raw rendering prefixed with the components configuration root
    pub fn absolute_raw(&self) -> String {
        format!("{}{}", CONFIG_COMPONENTS_PATH, self.raw())
    }

    /// Timestampless rendering prefixed with the components configuration root
    pub fn absolute_without_timestamp(&self) -> String {
        format!("{}{}", CONFIG_COMPONENTS_PATH, self.without_timestamp())
    }
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Query::new(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_without_timestamp() {
        let q = Query::new("readout/PHYSICS/flp/default").unwrap();
        assert_eq!(q.component, "readout");
        assert_eq!(q.flavor, RunType::Physics);
        assert_eq!(q.rolename, "flp");
        assert_eq!(q.entry_key, "default");
        assert_eq!(q.timestamp, "");
        // Path() yields the input unchanged
        assert_eq!(q.path(), "readout/PHYSICS/flp/default");
        assert_eq!(q.raw(), "readout/PHYSICS/flp/default");
    }

    #[test]
    fn test_parse_with_canonical_timestamp() {
        let q = Query::new("readout/PHYSICS/flp/default@1700000000").unwrap();
        assert_eq!(q.timestamp, "1700000000");
        assert_eq!(q.path(), "readout/PHYSICS/flp/default@1700000000");
        assert_eq!(q.raw(), "readout/PHYSICS/flp/default/1700000000");
    }

    #[test]
    fn test_parse_with_raw_timestamp() {
        let q = Query::new("readout/PHYSICS/flp/default/1700000000").unwrap();
        assert_eq!(q.timestamp, "1700000000");
        assert_eq!(q.path(), "readout/PHYSICS/flp/default@1700000000");
    }

    #[test]
    fn test_lowercase_run_type_is_bad_key() {
        assert_eq!(
            Query::new("readout/physics/flp/default"),
            Err(QueryError::BadKey)
        );
    }

    #[test]
    fn test_unknown_run_type_is_bad_key() {
        assert_eq!(
            Query::new("readout/STAGING/flp/default"),
            Err(QueryError::BadKey)
        );
    }

    #[test]
    fn test_malformed_keys_rejected() {
        for key in [
            "",
            "readout",
            "readout/PHYSICS",
            "readout/PHYSICS/flp",
            "readout/PHYSICS/flp/default@",
            "readout/PHYSICS/flp/default@abc",
            "readout/PHYSICS/flp/default/",
            "read out/PHYSICS/flp/default",
            "readout/PHYSICS/flp/default@17@18",
        ] {
            assert_eq!(Query::new(key), Err(QueryError::BadKey), "key: {key}");
        }
    }

    #[test]
    fn test_round_trip_both_renderings() {
        let q = Query::new("qc/COSMICS/tpc-cluster/threshold@42").unwrap();
        assert_eq!(Query::new(&q.path()).unwrap(), q);
        assert_eq!(Query::new(&q.raw()).unwrap(), q);
    }

    #[test]
    fn test_absolute_paths() {
        let q = Query::new("readout/TECHNICAL/flp/default@7").unwrap();
        assert_eq!(q.absolute_raw(), "components/readout/TECHNICAL/flp/default/7");
        assert_eq!(
            q.absolute_without_timestamp(),
            "components/readout/TECHNICAL/flp/default"
        );
    }

    #[test]
    fn test_numeric_entry_without_timestamp() {
        // A purely numeric fourth segment is an entry key, not a timestamp.
        let q = Query::new("readout/PHYSICS/flp/123").unwrap();
        assert_eq!(q.entry_key, "123");
        assert_eq!(q.timestamp, "");
    }
}
