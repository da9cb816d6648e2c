//! Field-level conflict resolution: folds one cluster into a canonical record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use scout_core::{
    canonical_record_id, CandidateRecord, CanonicalRecord, Scalar, MARKET_VALUE, RATING,
    RATING_BOUNDS,
};
use tracing::debug;

use crate::resolver::Cluster;

/// Attributes consulted for the post-fold rating back-fill.
pub const REPORTED_RATING_KEYS: &[&str] = &["average_rating", "season_rating"];

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn rating_in_bounds(value: f64) -> bool {
    let (min, max) = RATING_BOUNDS;
    value.is_finite() && (min..=max).contains(&value)
}

/// Running state of one merge.
///
/// `rating` follows the pairwise recurrence `(previous + new) / 2`, so the most
/// recently folded source weighs as much as all earlier ones together. This is
/// not the arithmetic mean and must stay that way for compatibility with stored
/// records.
#[derive(Debug, Default)]
pub struct CanonicalFold {
    name: Option<String>,
    club: Option<String>,
    external_ids: BTreeMap<String, String>,
    attributes: BTreeMap<String, Scalar>,
    market_value: Option<f64>,
    rating: Option<f64>,
    reported_ratings: Vec<f64>,
    sources: BTreeSet<String>,
}

impl CanonicalFold {
    pub fn fold(&mut self, candidate: &CandidateRecord) {
        self.sources.insert(candidate.source_id.clone());

        let name = candidate.name.split_whitespace().collect::<Vec<_>>().join(" ");
        if self.name.is_none() && !name.is_empty() {
            self.name = Some(name);
        }
        let club = candidate.club.trim();
        if self.club.is_none() && !club.is_empty() {
            self.club = Some(club.to_string());
        }

        if let Some(id) = candidate.external_id.as_deref().filter(|id| !id.is_empty()) {
            self.external_ids
                .insert(candidate.source_id.clone(), id.to_string());
        }

        for (key, value) in &candidate.attributes {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                MARKET_VALUE => self.fold_market_value(value),
                RATING => self.fold_rating(&candidate.source_id, value),
                _ => {
                    if REPORTED_RATING_KEYS.contains(&key.as_str()) {
                        if let Some(v) = value.as_f64().filter(|v| rating_in_bounds(*v)) {
                            self.reported_ratings.push(v);
                        }
                    }
                    self.attributes
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }
    }

    fn fold_market_value(&mut self, value: &Scalar) {
        let Some(value) = value.as_f64().filter(|v| v.is_finite()) else {
            debug!(?value, "ignoring non-numeric market value");
            return;
        };
        self.market_value = Some(match self.market_value {
            Some(current) => current.max(value),
            None => value,
        });
    }

    fn fold_rating(&mut self, source_id: &str, value: &Scalar) {
        let Some(value) = value.as_f64() else {
            return;
        };
        if !rating_in_bounds(value) {
            debug!(source_id, value, "ignoring out-of-range rating");
            return;
        }
        self.rating = Some(match self.rating {
            Some(previous) => round_one_decimal((previous + value) / 2.0),
            None => value,
        });
    }

    pub fn finish(mut self, league: &str, updated_at: DateTime<Utc>) -> CanonicalRecord {
        if self.rating.is_none() && !self.reported_ratings.is_empty() {
            let total: f64 = self.reported_ratings.iter().sum();
            self.rating = Some(round_one_decimal(
                total / self.reported_ratings.len() as f64,
            ));
        }

        let name = self.name.unwrap_or_default();
        let club_for_id = self.club.clone().unwrap_or_default();
        CanonicalRecord {
            id: canonical_record_id(&name, &club_for_id, league),
            league: league.to_string(),
            name,
            club: self.club,
            external_ids: self.external_ids,
            attributes: self.attributes,
            market_value: self.market_value,
            rating: self.rating,
            sources: self.sources,
            last_updated: updated_at,
        }
    }
}

/// Fold `cluster` in its member order. Never fails: absent fields stay `None`.
pub fn merge_cluster(cluster: &Cluster, league: &str, updated_at: DateTime<Utc>) -> CanonicalRecord {
    let mut fold = CanonicalFold::default();
    for candidate in cluster.members() {
        fold.fold(candidate);
    }
    fold.finish(league, updated_at)
}
