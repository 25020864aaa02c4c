//! Citation Aggregation
//!
//! The assistant backend retrieves document chunks before answering and ships
//! them to the client as a flat list of [`CitationRecord`]s. Several records
//! usually point into the same source document (different pages or chunks),
//! and a record may be delivered more than once. The [`CitationAggregator`]
//! folds that flat list into one [`CitationGroup`] per source.
//!
//! # Ordering and identity
//!
//! - Groups appear in first-appearance order of their `source_title`.
//! - Within a group, `pages` is ascending and distinct; `members` keep arrival order.
//! - A record is a duplicate when its `id` matches, or (without an id) when
//!   `(source_title, page_number, chunk_text)` matches. A duplicate updates the
//!   stored member in place instead of adding a second one, so the view never
//!   shows a citation twice or a stale score.
//!
//! The output is a pure function of the records fed so far; no hash iteration
//! order leaks into it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One retrieved document chunk backing an assistant answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    /// Server-side identifier; authoritative for deduplication when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Title of the source document
    pub source_title: String,
    /// 1-based page number, when the source is paginated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    /// Retrieval similarity in `[0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
    /// The excerpt that was retrieved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_text: Option<String>,
}

impl CitationRecord {
    /// Create a record for a source with no page, score or excerpt
    pub fn new(source_title: impl Into<String>) -> Self {
        Self {
            id: None,
            source_title: source_title.into(),
            page_number: None,
            relevance_score: None,
            chunk_text: None,
        }
    }

    /// Set the server id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the page number
    #[must_use]
    pub fn with_page(mut self, page: u32) -> Self {
        self.page_number = Some(page);
        self
    }

    /// Set the relevance score
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.relevance_score = Some(score);
        self
    }

    /// Set the excerpt
    #[must_use]
    pub fn with_chunk(mut self, text: impl Into<String>) -> Self {
        self.chunk_text = Some(text.into());
        self
    }

    /// Bring wire values into the documented ranges
    ///
    /// Page 0 means "no page"; scores are clamped to `[0, 1]` and non-finite
    /// scores are dropped.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.page_number == Some(0) {
            self.page_number = None;
        }
        self.relevance_score = self
            .relevance_score
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 1.0));
        self
    }

    /// Score used for averaging (missing counts as 0)
    #[must_use]
    pub fn score_or_zero(&self) -> f64 {
        self.relevance_score.unwrap_or(0.0)
    }

    fn key(&self) -> CitationKey {
        match &self.id {
            Some(id) => CitationKey::Id(id.clone()),
            None => CitationKey::Content {
                source_title: self.source_title.clone(),
                page_number: self.page_number,
                chunk_text: self.chunk_text.clone(),
            },
        }
    }
}

/// Deduplication identity of a record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CitationKey {
    Id(String),
    Content {
        source_title: String,
        page_number: Option<u32>,
        chunk_text: Option<String>,
    },
}

/// All citations from one source document
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CitationGroup {
    /// Source document title (group key)
    pub source_title: String,
    /// Distinct page numbers, ascending
    pub pages: Vec<u32>,
    /// Mean of member scores, missing scores counted as 0
    pub avg_relevance: f64,
    /// Member records in first-seen order
    pub members: Vec<CitationRecord>,
}

impl CitationGroup {
    fn new(source_title: String) -> Self {
        Self {
            source_title,
            pages: Vec::new(),
            avg_relevance: 0.0,
            members: Vec::new(),
        }
    }

    /// Page reference for display: `p. 4`, `pp. 3, 5`, or `None` without pages
    #[must_use]
    pub fn page_label(&self) -> Option<String> {
        match self.pages.as_slice() {
            [] => None,
            [page] => Some(format!("p. {page}")),
            pages => {
                let list: Vec<String> = pages.iter().map(u32::to_string).collect();
                Some(format!("pp. {}", list.join(", ")))
            }
        }
    }

    /// Average relevance as a rounded percentage
    #[must_use]
    pub fn relevance_percent(&self) -> u8 {
        (self.avg_relevance * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Recompute the derived fields from `members`
    fn refresh(&mut self) {
        let mut pages: Vec<u32> = self.members.iter().filter_map(|m| m.page_number).collect();
        pages.sort_unstable();
        pages.dedup();
        self.pages = pages;

        let total: f64 = self.members.iter().map(CitationRecord::score_or_zero).sum();
        self.avg_relevance = if self.members.is_empty() {
            0.0
        } else {
            total / self.members.len() as f64
        };
    }
}

/// Incremental grouping of citation records by source
#[derive(Clone, Debug, Default)]
pub struct CitationAggregator {
    groups: Vec<CitationGroup>,
    /// source_title -> index into `groups`
    group_index: HashMap<String, usize>,
    /// identity -> (group index, member index)
    seen: HashMap<CitationKey, (usize, usize)>,
    /// Deduplicated records in first-seen order
    records: Vec<CitationRecord>,
    duplicates: usize,
}

impl CitationAggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold more records into the grouped view
    ///
    /// Returns the number of records that were new (not duplicates).
    pub fn extend<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = CitationRecord>,
    {
        let mut added = 0;
        let mut touched: Vec<usize> = Vec::new();

        for record in records {
            let key = record.key();
            if let Some(&(group_idx, member_idx)) = self.seen.get(&key) {
                self.duplicates += 1;
                let member = &mut self.groups[group_idx].members[member_idx];
                if record.relevance_score.is_some() {
                    member.relevance_score = record.relevance_score;
                }
                if record.chunk_text.is_some() && member.chunk_text != record.chunk_text {
                    member.chunk_text = record.chunk_text.clone();
                }
                if let Some(flat) = self.records.iter_mut().find(|r| r.key() == key) {
                    *flat = member.clone();
                }
                touched.push(group_idx);
                continue;
            }

            let group_idx = match self.group_index.get(&record.source_title) {
                Some(&idx) => idx,
                None => {
                    let idx = self.groups.len();
                    self.groups.push(CitationGroup::new(record.source_title.clone()));
                    self.group_index.insert(record.source_title.clone(), idx);
                    idx
                }
            };

            let group = &mut self.groups[group_idx];
            self.seen.insert(key, (group_idx, group.members.len()));
            group.members.push(record.clone());
            self.records.push(record);
            touched.push(group_idx);
            added += 1;
        }

        touched.sort_unstable();
        touched.dedup();
        for idx in touched {
            self.groups[idx].refresh();
        }

        added
    }

    /// Grouped view, in first-appearance order of each source
    #[must_use]
    pub fn groups(&self) -> &[CitationGroup] {
        &self.groups
    }

    /// Deduplicated flat records, in first-seen order
    #[must_use]
    pub fn records(&self) -> &[CitationRecord] {
        &self.records
    }

    /// Number of distinct sources
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of duplicate records folded away so far
    #[must_use]
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Whether nothing has been aggregated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all state
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Consume the aggregator, returning the grouped view
    #[must_use]
    pub fn into_groups(self) -> Vec<CitationGroup> {
        self.groups
    }
}

/// Group a flat citation list in one pass
#[must_use]
pub fn aggregate(records: &[CitationRecord]) -> Vec<CitationGroup> {
    let mut aggregator = CitationAggregator::new();
    aggregator.extend(records.iter().cloned());
    aggregator.into_groups()
}

/// Section header for a citation list, e.g. `Sources (2)`
#[must_use]
pub fn sources_heading(groups: &[CitationGroup]) -> String {
    format!("Sources ({})", groups.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cite(title: &str, page: u32, score: f64) -> CitationRecord {
        CitationRecord::new(title).with_page(page).with_score(score)
    }

    #[test]
    fn test_groups_by_source_in_first_appearance_order() {
        let groups = aggregate(&[cite("A", 5, 0.9), cite("B", 2, 0.6), cite("A", 3, 0.7)]);

        let titles: Vec<&str> = groups.iter().map(|g| g.source_title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
        assert_eq!(groups[0].pages, vec![3, 5]);
        assert!((groups[0].avg_relevance - 0.8).abs() < 1e-9);
        assert_eq!(groups[1].pages, vec![2]);
        assert!((groups[1].avg_relevance - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_members_keep_arrival_order() {
        let groups = aggregate(&[cite("A", 5, 0.9), cite("A", 3, 0.7)]);
        let pages: Vec<Option<u32>> = groups[0].members.iter().map(|m| m.page_number).collect();
        assert_eq!(pages, vec![Some(5), Some(3)]);
    }

    #[test]
    fn test_single_page_label_is_singular() {
        let groups = aggregate(&[cite("Handbook", 4, 0.5)]);
        assert_eq!(groups[0].page_label().as_deref(), Some("p. 4"));
    }

    #[test]
    fn test_multi_page_label_and_missing_pages() {
        let groups = aggregate(&[
            cite("Handbook", 9, 0.5),
            cite("Handbook", 2, 0.5),
            CitationRecord::new("Memo"),
        ]);
        assert_eq!(groups[0].page_label().as_deref(), Some("pp. 2, 9"));
        assert_eq!(groups[1].page_label(), None);
        assert_eq!(sources_heading(&groups), "Sources (2)");
    }

    #[test]
    fn test_repeated_page_is_listed_once() {
        let groups = aggregate(&[
            cite("A", 3, 0.4).with_chunk("first"),
            cite("A", 3, 0.6).with_chunk("second"),
        ]);
        assert_eq!(groups[0].pages, vec![3]);
        assert_eq!(groups[0].members.len(), 2);
        assert!((groups[0].avg_relevance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_scores_count_as_zero() {
        let groups = aggregate(&[cite("A", 1, 0.9), CitationRecord::new("A").with_page(2)]);
        assert!((groups[0].avg_relevance - 0.45).abs() < 1e-9);
        assert_eq!(groups[0].relevance_percent(), 45);
    }

    #[test]
    fn test_duplicate_by_content_is_dropped() {
        let mut agg = CitationAggregator::new();
        let added = agg.extend(vec![
            cite("A", 3, 0.7).with_chunk("x"),
            cite("A", 3, 0.7).with_chunk("x"),
        ]);
        assert_eq!(added, 1);
        assert_eq!(agg.duplicates(), 1);
        assert_eq!(agg.groups()[0].members.len(), 1);
        assert_eq!(agg.records().len(), 1);
    }

    #[test]
    fn test_id_is_authoritative_for_identity() {
        // Same id, different content: still the same citation
        let mut agg = CitationAggregator::new();
        agg.extend(vec![
            cite("A", 3, 0.2).with_id("c1"),
            cite("A", 3, 0.9).with_id("c1"),
        ]);
        assert_eq!(agg.groups()[0].members.len(), 1);

        // Different ids, identical content: two citations
        let mut agg = CitationAggregator::new();
        agg.extend(vec![
            cite("A", 3, 0.5).with_id("c1"),
            cite("A", 3, 0.5).with_id("c2"),
        ]);
        assert_eq!(agg.groups()[0].members.len(), 2);
    }

    #[test]
    fn test_redelivered_score_replaces_stale_one() {
        let mut agg = CitationAggregator::new();
        agg.extend(vec![cite("A", 1, 0.2).with_id("c1"), cite("A", 2, 0.4).with_id("c2")]);
        assert!((agg.groups()[0].avg_relevance - 0.3).abs() < 1e-9);

        agg.extend(vec![cite("A", 1, 0.8).with_id("c1")]);
        let group = &agg.groups()[0];
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.members[0].relevance_score, Some(0.8));
        assert!((group.avg_relevance - 0.6).abs() < 1e-9);
        assert_eq!(agg.records()[0].relevance_score, Some(0.8));
    }

    #[test]
    fn test_incremental_matches_single_batch() {
        let all = vec![
            cite("A", 5, 0.9),
            cite("B", 2, 0.6),
            cite("A", 3, 0.7),
            cite("C", 1, 0.1),
            cite("B", 7, 0.3),
        ];

        let mut agg = CitationAggregator::new();
        agg.extend(all[..2].to_vec());
        agg.extend(all[2..].to_vec());

        assert_eq!(agg.groups(), aggregate(&all).as_slice());
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let input: Vec<CitationRecord> = (0..40)
            .map(|i| cite(&format!("S{}", i % 7), (i * 13) % 11 + 1, f64::from(i % 10) / 10.0))
            .collect();

        let first = serde_json::to_string(&aggregate(&input)).unwrap();
        for _ in 0..10 {
            assert_eq!(serde_json::to_string(&aggregate(&input)).unwrap(), first);
        }
    }

    #[test]
    fn test_normalized_bounds_values() {
        let rec = CitationRecord::new("A").with_page(0).with_score(1.7).normalized();
        assert_eq!(rec.page_number, None);
        assert_eq!(rec.relevance_score, Some(1.0));

        let rec = CitationRecord::new("A").with_score(f64::NAN).normalized();
        assert_eq!(rec.relevance_score, None);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut agg = CitationAggregator::new();
        agg.extend(vec![cite("A", 1, 0.5)]);
        agg.clear();
        assert!(agg.is_empty());
        assert_eq!(agg.source_count(), 0);
    }
}
