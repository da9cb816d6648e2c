//! Core domain model for multi-source player reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

pub const MARKET_VALUE: &str = "market_value";
pub const RATING: &str = "rating";

/// Inclusive bounds of a valid player rating.
pub const RATING_BOUNDS: (f64, f64) = (0.0, 10.0);

/// Scalar attribute value as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(*v as f64),
            Scalar::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

/// One provider's observation of a player, handed from adapters into the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub club: String,
    pub league: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Scalar>,
    pub fetched_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn new(
        source_id: impl Into<String>,
        name: impl Into<String>,
        club: impl Into<String>,
        league: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: None,
            name: name.into(),
            club: club.into(),
            league: league.into(),
            attributes: BTreeMap::new(),
            fetched_at,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Non-null attribute lookup.
    pub fn attribute(&self, key: &str) -> Option<&Scalar> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }
}

/// Reconciled player record produced by folding one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub league: String,
    pub name: String,
    pub club: Option<String>,
    pub external_ids: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, Scalar>,
    pub market_value: Option<f64>,
    pub rating: Option<f64>,
    pub sources: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn attribute(&self, key: &str) -> Option<&Scalar> {
        self.attributes.get(key)
    }
}

/// Case-folds, trims and collapses inner whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub const NAME_TOKEN_SEPARATOR: char = '_';
pub const CLUB_SEPARATOR: char = '|';

/// Identity key shared by every record of one player: first and last name token
/// plus club. Pure function of normalized (name, club).
pub fn match_key(name: &str, club: &str) -> String {
    let name = normalize_text(name);
    let tokens = name.split(' ').filter(|t| !t.is_empty()).collect::<Vec<_>>();
    let key_name = match tokens.as_slice() {
        [] => String::new(),
        [only] => (*only).to_string(),
        [first, .., last] => format!("{first}{NAME_TOKEN_SEPARATOR}{last}"),
    };
    format!("{key_name}{CLUB_SEPARATOR}{}", normalize_text(club))
}

/// Stable storage identifier for a player; repeated syncs of the same entity target the same row.
///
/// Derived from the match key rather than the full name, so whichever source
/// supplies the display name, the cluster lands on one row.
pub fn canonical_record_id(name: &str, club: &str, league: &str) -> Uuid {
    let source = format!("{}|{}", match_key(name, club), normalize_text(league));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
}
