use super::document::{tokenize, IndexDocument};
use super::{IndexError, SearchQuery};
use async_trait::async_trait;
use common_types::{OwnerId, PhotoId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use tokio::sync::RwLock;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Replaces any earlier document for the same photo.
    async fn upsert(&self, document: IndexDocument) -> Result<(), IndexError>;

    async fn remove(&self, photo_id: &str) -> Result<(), IndexError>;

    /// Photo ids of one owner, best match first.
    async fn query(&self, owner_id: OwnerId, query: &SearchQuery) -> Result<Vec<PhotoId>, IndexError>;
}

#[derive(Debug, Default)]
struct OwnerIndex {
    documents: HashMap<PhotoId, IndexDocument>,
    /// Token to the photos containing it. Ordered for prefix range scans.
    postings: BTreeMap<String, BTreeSet<PhotoId>>,
}

impl OwnerIndex {
    fn insert(&mut self, document: IndexDocument) {
        for token in document.tokens() {
            self.postings
                .entry(token.clone())
                .or_default()
                .insert(document.photo_id.clone());
        }
        self.documents.insert(document.photo_id.clone(), document);
    }

    fn remove(&mut self, photo_id: &str) -> Option<IndexDocument> {
        let document = self.documents.remove(photo_id)?;
        for token in document.tokens() {
            if let Some(ids) = self.postings.get_mut(token) {
                ids.remove(photo_id);
                if ids.is_empty() {
                    self.postings.remove(token);
                }
            }
        }
        Some(document)
    }

    /// Tokens equal to or starting with `term`.
    fn expand<'a>(&'a self, term: &'a str) -> impl Iterator<Item = (&'a String, &'a BTreeSet<PhotoId>)> {
        self.postings
            .range::<str, _>((Bound::Included(term), Bound::Unbounded))
            .take_while(move |(token, _)| token.starts_with(term))
    }
}

#[derive(Debug, Default)]
struct Score {
    matched_terms: usize,
    label_confidence: f32,
}

#[derive(Debug, Default)]
struct Indexes {
    owners: HashMap<OwnerId, OwnerIndex>,
    owner_of: HashMap<PhotoId, OwnerId>,
}

/// Inverted index kept in process memory.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    inner: RwLock<Indexes>,
}

impl InMemorySearchIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.owner_of.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn document(&self, photo_id: &str) -> Option<IndexDocument> {
        let inner = self.inner.read().await;
        let owner = inner.owner_of.get(photo_id)?;
        inner.owners.get(owner)?.documents.get(photo_id).cloned()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, document: IndexDocument) -> Result<(), IndexError> {
        let mut inner = self.inner.write().await;
        if let Some(previous_owner) = inner.owner_of.get(&document.photo_id).copied()
            && let Some(owner) = inner.owners.get_mut(&previous_owner)
        {
            owner.remove(&document.photo_id);
        }
        inner
            .owner_of
            .insert(document.photo_id.clone(), document.owner_id);
        inner.owners.entry(document.owner_id).or_default().insert(document);
        Ok(())
    }

    async fn remove(&self, photo_id: &str) -> Result<(), IndexError> {
        let mut inner = self.inner.write().await;
        if let Some(owner_id) = inner.owner_of.remove(photo_id)
            && let Some(owner) = inner.owners.get_mut(&owner_id)
        {
            owner.remove(photo_id);
        }
        Ok(())
    }

    async fn query(&self, owner_id: OwnerId, query: &SearchQuery) -> Result<Vec<PhotoId>, IndexError> {
        let inner = self.inner.read().await;
        let Some(owner) = inner.owners.get(&owner_id) else {
            return Ok(Vec::new());
        };

        let terms: BTreeSet<String> = tokenize(&query.text).collect();
        let mut scored: Vec<(&IndexDocument, Score)> = if terms.is_empty() {
            owner
                .documents
                .values()
                .map(|doc| (doc, Score::default()))
                .collect()
        } else {
            let mut scores: HashMap<&PhotoId, Score> = HashMap::new();
            for term in &terms {
                // Best label confidence per photo for this term; text-only hits count as 0.
                let mut hits: HashMap<&PhotoId, f32> = HashMap::new();
                for (token, ids) in owner.expand(term) {
                    for id in ids {
                        let confidence = owner
                            .documents
                            .get(id)
                            .and_then(|doc| doc.label_terms.get(token))
                            .copied()
                            .unwrap_or(0.0);
                        let best = hits.entry(id).or_insert(0.0);
                        *best = best.max(confidence);
                    }
                }
                for (id, confidence) in hits {
                    let score = scores.entry(id).or_default();
                    score.matched_terms += 1;
                    score.label_confidence += confidence;
                }
            }
            scores
                .into_iter()
                .filter_map(|(id, score)| owner.documents.get(id).map(|doc| (doc, score)))
                .collect()
        };

        scored.retain(|(doc, _)| query.filters.matches(doc));
        scored.sort_by(|(a_doc, a), (b_doc, b)| {
            b.matched_terms
                .cmp(&a.matched_terms)
                .then_with(|| b.label_confidence.total_cmp(&a.label_confidence))
                .then_with(|| b_doc.uploaded_at.cmp(&a_doc.uploaded_at))
                .then_with(|| a_doc.photo_id.cmp(&b_doc.photo_id))
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(doc, _)| doc.photo_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{DateRange, GeoBox, SearchFilters};
    use chrono::{DateTime, TimeZone, Utc};
    use common_types::GeoPoint;

    fn doc(photo_id: &str, labels: &[(&str, f32)], text: &str, uploaded_at: DateTime<Utc>) -> IndexDocument {
        IndexDocument {
            photo_id: photo_id.into(),
            owner_id: 1,
            uploaded_at,
            effective_date: uploaded_at,
            location: None,
            label_terms: labels.iter().map(|(n, c)| ((*n).to_string(), *c)).collect(),
            text_terms: tokenize(text).collect(),
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0)
            .single()
            .unwrap_or_default()
    }

    fn text(text: &str) -> SearchQuery {
        SearchQuery::builder().text(text).build()
    }

    async fn index(docs: Vec<IndexDocument>) -> color_eyre::Result<InMemorySearchIndex> {
        let index = InMemorySearchIndex::new();
        for doc in docs {
            index.upsert(doc).await?;
        }
        Ok(index)
    }

    #[tokio::test]
    async fn unique_term_returns_exactly_that_photo() -> color_eyre::Result<()> {
        let index = index(vec![
            doc("p1", &[("dog", 0.91), ("beach", 0.77)], "", at(1)),
            doc("p2", &[("cat", 0.8)], "", at(2)),
        ])
        .await?;
        assert_eq!(index.query(1, &text("dog")).await?, ["p1"]);
        assert_eq!(index.query(1, &text("DOG")).await?, ["p1"]);
        assert!(index.query(1, &text("giraffe")).await?.is_empty());
        assert!(index.query(2, &text("dog")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn prefix_matches_labels_and_text() -> color_eyre::Result<()> {
        let index = index(vec![
            doc("p1", &[("beach", 0.7)], "", at(1)),
            doc("p2", &[], "bear sighting", at(2)),
            doc("p3", &[("cat", 0.7)], "", at(3)),
        ])
        .await?;
        assert_eq!(index.query(1, &text("bea")).await?, ["p1", "p2"]);
        Ok(())
    }

    #[tokio::test]
    async fn ranking_prefers_terms_then_confidence_then_recency() -> color_eyre::Result<()> {
        let index = index(vec![
            doc("both", &[("dog", 0.5), ("beach", 0.5)], "", at(1)),
            doc("confident", &[("dog", 0.99)], "", at(2)),
            doc("old", &[("dog", 0.6)], "", at(3)),
            doc("new", &[("dog", 0.6)], "", at(4)),
            doc("text", &[], "dog", at(5)),
        ])
        .await?;
        assert_eq!(
            index.query(1, &text("dog beach")).await?,
            ["both", "confident", "new", "old", "text"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_query_lists_everything_newest_first() -> color_eyre::Result<()> {
        let index = index(vec![
            doc("a", &[], "", at(1)),
            doc("b", &[], "", at(3)),
            doc("c", &[], "", at(2)),
        ])
        .await?;
        assert_eq!(index.query(1, &text("")).await?, ["b", "c", "a"]);

        let limited = SearchQuery::builder().text("").limit(2).build();
        assert_eq!(index.query(1, &limited).await?, ["b", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn date_filter_excludes_regardless_of_text() -> color_eyre::Result<()> {
        let index = index(vec![
            doc("june1", &[("dog", 0.9)], "", at(1)),
            doc("june10", &[("dog", 0.9)], "", at(10)),
        ])
        .await?;
        let query = SearchQuery::builder()
            .text("dog")
            .filters(SearchFilters {
                date_range: Some(DateRange {
                    start: Some(at(5)),
                    end: Some(at(10)),
                }),
                region: None,
            })
            .build();
        assert_eq!(index.query(1, &query).await?, ["june10"]);
        Ok(())
    }

    #[tokio::test]
    async fn geo_filter_handles_antimeridian_and_missing_locations() -> color_eyre::Result<()> {
        let mut fiji = doc("fiji", &[], "", at(1));
        fiji.location = Some(GeoPoint {
            latitude: -17.7,
            longitude: 178.0,
        });
        let mut samoa = doc("samoa", &[], "", at(2));
        samoa.location = Some(GeoPoint {
            latitude: -13.8,
            longitude: -172.1,
        });
        let mut paris = doc("paris", &[], "", at(3));
        paris.location = Some(GeoPoint {
            latitude: 48.8,
            longitude: 2.3,
        });
        let nowhere = doc("nowhere", &[], "", at(4));
        let index = index(vec![fiji, samoa, paris, nowhere]).await?;

        let pacific = SearchQuery::builder()
            .text("")
            .filters(SearchFilters {
                date_range: None,
                region: Some(GeoBox {
                    min_latitude: -30.0,
                    max_latitude: 0.0,
                    min_longitude: 170.0,
                    max_longitude: -170.0,
                }),
            })
            .build();
        assert_eq!(index.query(1, &pacific).await?, ["samoa", "fiji"]);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_replaces_and_remove_forgets() -> color_eyre::Result<()> {
        let index = index(vec![doc("p1", &[("dog", 0.9)], "", at(1))]).await?;
        index.upsert(doc("p1", &[("cat", 0.9)], "", at(1))).await?;
        assert!(index.query(1, &text("dog")).await?.is_empty());
        assert_eq!(index.query(1, &text("cat")).await?, ["p1"]);
        assert_eq!(index.len().await, 1);

        index.remove("p1").await?;
        assert!(index.query(1, &text("cat")).await?.is_empty());
        assert!(index.is_empty().await);
        Ok(())
    }
}
