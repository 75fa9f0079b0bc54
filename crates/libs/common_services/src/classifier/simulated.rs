use super::ClassificationClient;
use async_trait::async_trait;
use common_types::{
    normalized, BoundingBox, ClassificationResult, ClassifiedLabel, ClassifierError, DetectedFace,
};
use fastrand::Rng;
use std::time::Duration;
use tracing::debug;

/// Labels every photo gets.
const BASE_LABELS: &[&str] = &["Person", "Indoor", "Screenshot"];

/// Storage reference keyword to the labels it implies.
const KEYWORD_LABELS: &[(&str, &[&str])] = &[
    ("error", &["Text", "Error Message", "Computer", "Monitor"]),
    ("search", &["Web Page", "Search Results", "UI", "Internet"]),
    ("login", &["Form", "Login Screen", "Security"]),
    ("job", &["Document", "Resume", "Business"]),
    ("dog", &["Dog", "Animal", "Pet"]),
    ("beach", &["Beach", "Sea", "Sand"]),
];

const FACE_PREFIX: &str = "face-";
const TEXT_PREFIX: &str = "text-";
const FACE_NOISE: f32 = 0.03;

/// Stand-in vision service that derives its answer from the storage
/// reference, so the pipeline can run without the real one.
///
/// - keywords anywhere in the reference add labels (`beach`, `dog`, `login`, ...)
/// - each `face-<name>` token adds a face whose embedding is fixed per name,
///   plus a little per-photo noise
/// - `text-<word>` tokens become extracted text
/// - a reference containing `unavailable` fails like a service outage
///
/// Confidences are pseudo-random but seeded by the reference, so the same
/// photo always gets the same answer.
#[derive(Debug, Clone)]
pub struct SimulatedClassifier {
    embedding_dimension: usize,
    latency: Duration,
}

impl SimulatedClassifier {
    #[must_use]
    pub const fn new(embedding_dimension: usize, latency: Duration) -> Self {
        Self {
            embedding_dimension,
            latency,
        }
    }

    /// The embedding every face of `name` is drawn around.
    #[must_use]
    pub fn identity_embedding(&self, name: &str) -> Vec<f32> {
        let mut rng = seeded(name.as_bytes());
        let raw: Vec<f32> = (0..self.embedding_dimension)
            .map(|_| rng.f32().mul_add(2.0, -1.0))
            .collect();
        normalized(&raw)
    }

    fn face(&self, name: &str, rng: &mut Rng) -> DetectedFace {
        let noisy: Vec<f32> = self
            .identity_embedding(name)
            .iter()
            .map(|v| v + rng.f32().mul_add(2.0, -1.0) * FACE_NOISE)
            .collect();
        DetectedFace {
            bbox: BoundingBox::new(rng.f32() * 0.7, rng.f32() * 0.7, 0.2, 0.25),
            embedding: normalized(&noisy),
        }
    }

    /// Deterministic analysis of one storage reference.
    #[must_use]
    pub fn analyse(&self, storage_ref: &str) -> ClassificationResult {
        let mut rng = seeded(storage_ref.as_bytes());
        let lower = storage_ref.to_lowercase();

        let mut names: Vec<&str> = BASE_LABELS.to_vec();
        for (keyword, labels) in KEYWORD_LABELS {
            if lower.contains(keyword) {
                names.extend_from_slice(labels);
            }
        }
        let labels = names
            .into_iter()
            .map(|name| ClassifiedLabel {
                name: name.to_string(),
                confidence: rng.f32().mul_add(0.149, 0.85),
            })
            .collect();

        let tokens: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .filter(|t| !t.is_empty())
            .collect();
        let faces = tokens
            .iter()
            .filter_map(|t| t.strip_prefix(FACE_PREFIX))
            .filter(|name| !name.is_empty())
            .map(|name| self.face(name, &mut rng))
            .collect();
        let words: Vec<&str> = tokens
            .iter()
            .filter_map(|t| t.strip_prefix(TEXT_PREFIX))
            .filter(|word| !word.is_empty())
            .collect();
        let text = (!words.is_empty()).then(|| words.join(" "));

        ClassificationResult {
            labels,
            faces,
            text,
        }
    }
}

fn seeded(bytes: &[u8]) -> Rng {
    let hash = blake3::hash(bytes);
    let mut seed = [0_u8; 8];
    seed.copy_from_slice(&hash.as_bytes()[..8]);
    Rng::with_seed(u64::from_le_bytes(seed))
}

#[async_trait]
impl ClassificationClient for SimulatedClassifier {
    async fn classify(&self, storage_ref: &str) -> Result<ClassificationResult, ClassifierError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if storage_ref.to_lowercase().contains("unavailable") {
            return Err(ClassifierError::Unavailable(format!(
                "simulated outage for {storage_ref}"
            )));
        }
        let result = self.analyse(storage_ref);
        debug!(
            "Simulated analysis of {storage_ref}: {} labels, {} faces",
            result.labels.len(),
            result.faces.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_types::cosine_distance;

    fn classifier() -> SimulatedClassifier {
        SimulatedClassifier::new(128, Duration::ZERO)
    }

    #[test]
    fn keywords_add_labels_with_high_confidence() {
        let result = classifier().analyse("originals/1/login_error.png");
        let names: Vec<&str> = result.labels.iter().map(|l| l.name.as_str()).collect();
        assert!(names.contains(&"Person"));
        assert!(names.contains(&"Login Screen"));
        assert!(names.contains(&"Error Message"));
        assert!(!names.contains(&"Resume"));
        assert!(
            result
                .labels
                .iter()
                .all(|l| (0.85..=0.999).contains(&l.confidence))
        );
        assert!(result.validate(128).is_ok());
    }

    #[test]
    fn same_reference_same_answer() {
        let c = classifier();
        assert_eq!(c.analyse("originals/a.jpg"), c.analyse("originals/a.jpg"));
    }

    #[test]
    fn faces_of_one_name_are_close_and_names_are_far_apart() {
        let c = classifier();
        let first = c.analyse("originals/beach_face-alice.jpg");
        let second = c.analyse("originals/party_face-alice_face-bob.jpg");
        assert_eq!(first.faces.len(), 1);
        assert_eq!(second.faces.len(), 2);

        let alice_alice = cosine_distance(&first.faces[0].embedding, &second.faces[0].embedding);
        let alice_bob = cosine_distance(&first.faces[0].embedding, &second.faces[1].embedding);
        assert!(alice_alice < 0.1, "same person at distance {alice_alice}");
        assert!(alice_bob > 0.4, "different people at distance {alice_bob}");
    }

    #[test]
    fn text_tokens_become_extracted_text() {
        let result = classifier().analyse("originals/text-hello_text-world.png");
        assert_eq!(result.text.as_deref(), Some("hello world"));
        assert_eq!(classifier().analyse("originals/plain.png").text, None);
    }

    #[tokio::test]
    async fn unavailable_reference_fails() {
        let result = classifier().classify("originals/unavailable.jpg").await;
        assert!(matches!(result, Err(ClassifierError::Unavailable(_))));
    }
}
