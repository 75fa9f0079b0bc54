use common_types::{GeoPoint, OwnerId, PhotoId, PhotoRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Lowercased alphanumeric runs of `text`.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// What the search index keeps of a photo. Always rebuildable from the record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub photo_id: PhotoId,
    pub owner_id: OwnerId,
    pub uploaded_at: DateTime<Utc>,
    /// Capture time if known, else upload time. Date filters apply to this.
    pub effective_date: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    /// Label token to the best confidence of any label containing it.
    pub label_terms: BTreeMap<String, f32>,
    pub text_terms: BTreeSet<String>,
}

impl IndexDocument {
    #[must_use]
    pub fn from_record(record: &PhotoRecord) -> Self {
        let mut label_terms: BTreeMap<String, f32> = BTreeMap::new();
        for label in &record.labels {
            for token in tokenize(&label.name) {
                let best = label_terms.entry(token).or_insert(label.confidence);
                *best = best.max(label.confidence);
            }
        }
        let text_terms = record
            .extracted_text
            .as_deref()
            .map(|text| tokenize(text).collect())
            .unwrap_or_default();

        Self {
            photo_id: record.photo_id.clone(),
            owner_id: record.owner_id,
            uploaded_at: record.uploaded_at,
            effective_date: record.effective_date(),
            location: record.location,
            label_terms,
            text_terms,
        }
    }

    /// Every distinct token, label and text alike.
    pub fn tokens(&self) -> impl Iterator<Item = &String> {
        let text_only = self
            .text_terms
            .iter()
            .filter(|t| !self.label_terms.contains_key(*t));
        self.label_terms.keys().chain(text_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_types::{Label, NewPhoto};

    #[test]
    fn tokenizer_lowercases_and_splits_on_punctuation() {
        let tokens: Vec<String> = tokenize("Golden-Retriever, BEACH  sunset!").collect();
        assert_eq!(tokens, ["golden", "retriever", "beach", "sunset"]);
    }

    #[test]
    fn document_keeps_best_confidence_per_token() {
        let photo = NewPhoto::builder()
            .owner_id(3)
            .storage_ref("originals/p.jpg")
            .thumbnail_ref("thumbs/p.avif")
            .build();
        let mut record = PhotoRecord::new_pending("p".into(), photo, Utc::now());
        record.labels = vec![
            Label {
                name: "Dog".into(),
                confidence: 0.6,
            },
            Label {
                name: "Hot dog".into(),
                confidence: 0.9,
            },
        ];
        record.extracted_text = Some("Dog show 2024".into());

        let doc = IndexDocument::from_record(&record);
        assert_eq!(doc.label_terms.get("dog"), Some(&0.9));
        assert_eq!(doc.label_terms.get("hot"), Some(&0.9));
        assert!(doc.text_terms.contains("2024"));
        let tokens: Vec<&String> = doc.tokens().collect();
        assert_eq!(tokens, ["dog", "hot", "2024", "show"]);
        assert_eq!(doc.effective_date, record.uploaded_at);
    }
}
