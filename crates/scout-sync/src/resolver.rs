//! Candidate clustering by derived match key.
//!
//! The key is a deliberately loose identity heuristic: first and last name token
//! plus club. Two distinct players sharing both collapse into one cluster, and one
//! player whose club is spelled differently across providers is split in two.

use std::collections::BTreeMap;

use scout_core::CandidateRecord;
pub use scout_core::match_key;

/// Candidates judged to be the same player; at most one per source.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub key: String,
    members: Vec<CandidateRecord>,
}

impl Cluster {
    fn new(key: String) -> Self {
        Self {
            key,
            members: Vec::new(),
        }
    }

    /// A second record from the same source replaces the first, keeping its fold position.
    fn insert(&mut self, candidate: CandidateRecord) {
        match self
            .members
            .iter_mut()
            .find(|m| m.source_id == candidate.source_id)
        {
            Some(slot) => *slot = candidate,
            None => self.members.push(candidate),
        }
    }

    /// Members in source-arrival order.
    pub fn members(&self) -> &[CandidateRecord] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Group candidates, supplied in the fixed source order, by match key.
pub fn resolve(candidates: impl IntoIterator<Item = CandidateRecord>) -> BTreeMap<String, Cluster> {
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    for candidate in candidates {
        let key = match_key(&candidate.name, &candidate.club);
        clusters
            .entry(key.clone())
            .or_insert_with(|| Cluster::new(key))
            .insert(candidate);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(source: &str, name: &str, club: &str) -> CandidateRecord {
        CandidateRecord::new(source, name, club, "MLS", Utc::now())
    }

    #[test]
    fn key_ignores_case_and_whitespace() {
        let a = match_key("Juan Pérez", "LA Galaxy");
        let b = match_key("  juan   pérez ", "LA GALAXY ");
        assert_eq!(a, b);
        assert_eq!(a, "juan_pérez|la galaxy");
        assert_eq!(match_key("Juan Pérez", "LA Galaxy"), a);
    }

    #[test]
    fn key_uses_first_and_last_name_tokens() {
        assert_eq!(
            match_key("Juan Carlos Pérez", "LA Galaxy"),
            match_key("Juan Pérez", "LA Galaxy")
        );
        assert_eq!(match_key("Pelé", "Santos"), "pelé|santos");
    }

    #[test]
    fn degenerate_inputs_still_key_deterministically() {
        assert_eq!(match_key("", ""), "|");
        assert_eq!(match_key("   ", "FC X"), "|fc x");
        assert_eq!(match_key("John Smith", ""), "john_smith|");
    }

    #[test]
    fn clusters_keep_one_record_per_source_in_arrival_order() {
        let mut late = candidate("fbref", "John Smith", "FC X");
        late.external_id = Some("second".into());
        let clusters = resolve(vec![
            candidate("fbref", "John Smith", "FC X"),
            candidate("transfermarkt", "JOHN SMITH", "fc x"),
            late,
            candidate("fbref", "Ana Lima", "Orlando City"),
        ]);

        assert_eq!(clusters.len(), 2);
        let smith = &clusters["john_smith|fc x"];
        assert_eq!(smith.len(), 2);
        assert_eq!(smith.members()[0].source_id, "fbref");
        assert_eq!(smith.members()[0].external_id.as_deref(), Some("second"));
        assert_eq!(smith.members()[1].source_id, "transfermarkt");
    }

    #[test]
    fn club_spelling_drift_splits_a_player() {
        let clusters = resolve(vec![
            candidate("fbref", "John Smith", "FC X"),
            candidate("sofascore", "John Smith", "FC X United"),
        ]);
        assert_eq!(clusters.len(), 2);
    }
}
