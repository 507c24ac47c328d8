use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of features in every embedding.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    WrongDimension(usize),
    #[error("feature {index} out of range [0, 1]: {value}")]
    OutOfRange { index: usize, value: f32 },
}

/// Face feature vector: exactly [`EMBEDDING_DIM`] values, each in [0, 1].
///
/// The only way to build one is through [`Embedding::from_values`], so a
/// deserialized or extracted embedding always satisfies the invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn from_values(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongDimension(values.len()));
        }
        if let Some((index, &value)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            return Err(EmbeddingError::OutOfRange { index, value });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Cosine similarity over the shared prefix of both vectors.
    ///
    /// Returns 0.0 when either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::from_values(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

/// Axis-aligned face rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceBox {
    pub top_left: (f32, f32),
    pub bottom_right: (f32, f32),
    pub confidence: f32,
}

impl FaceBox {
    pub fn new(top_left: (f32, f32), bottom_right: (f32, f32)) -> Self {
        Self {
            top_left,
            bottom_right,
            confidence: 1.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.bottom_right.0 - self.top_left.0
    }

    pub fn height(&self) -> f32 {
        self.bottom_right.1 - self.top_left.1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }
}

/// An enrolled person as held by the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub display_name: String,
    pub external_id: Option<String>,
    pub embedding: Embedding,
    pub enrolled_at: String,
    pub record_id: i64,
}

/// Identity as it comes back from persistent storage. Older records may
/// lack face data entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub record_id: i64,
    pub display_name: String,
    pub external_id: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub enrolled_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl IdentityRecord {
    pub fn from_identity(identity: &Identity, image_path: Option<String>) -> Self {
        Self {
            record_id: identity.record_id,
            display_name: identity.display_name.clone(),
            external_id: identity.external_id.clone(),
            embedding: Some(identity.embedding.values().to_vec()),
            enrolled_at: identity.enrolled_at.clone(),
            image_path,
        }
    }
}

/// One committed attendance event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub display_name: String,
    pub external_id: String,
    /// Calendar day, e.g. "Mon Jan 01 2024".
    pub date: String,
    /// Human-readable local time, e.g. "9:05:03 AM".
    pub time: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Outcome of matching one probe against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    NoMatch,
    Matched { identity: Identity, similarity: f32 },
}

impl RecognitionResult {
    pub fn is_match(&self) -> bool {
        matches!(self, RecognitionResult::Matched { .. })
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            RecognitionResult::Matched { identity, .. } => Some(&identity.display_name),
            RecognitionResult::NoMatch => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Deterministic embedding with some structure so that different seeds
    /// produce clearly different vectors.
    pub fn embedding(seed: u32) -> Embedding {
        let values = (0..EMBEDDING_DIM as u32)
            .map(|i| ((i.wrapping_mul(31).wrapping_add(seed.wrapping_mul(97))) % 256) as f32 / 255.0)
            .collect();
        Embedding::from_values(values).unwrap()
    }

    /// Embedding that is 1.0 in block `n` of 32 features and 0.0 elsewhere.
    /// Different blocks are orthogonal.
    pub fn block(n: usize) -> Embedding {
        let values = (0..EMBEDDING_DIM)
            .map(|i| if i / 32 == n % 4 { 1.0 } else { 0.0 })
            .collect();
        Embedding::from_values(values).unwrap()
    }

    pub fn identity(name: &str, external_id: &str, record_id: i64, embedding: Embedding) -> Identity {
        Identity {
            display_name: name.into(),
            external_id: Some(external_id.into()),
            embedding,
            enrolled_at: "1/1/2024".into(),
            record_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(value: f32) -> Embedding {
        Embedding::from_values(vec![value; EMBEDDING_DIM]).unwrap()
    }

    #[test]
    fn test_self_similarity_is_one() {
        let e = fixtures::embedding(7);
        assert!((e.similarity(&e) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_similarity() {
        let zero = filled(0.0);
        let other = fixtures::embedding(3);
        assert_eq!(zero.similarity(&other), 0.0);
        assert_eq!(other.similarity(&zero), 0.0);
        assert_eq!(zero.similarity(&zero), 0.0);
    }

    #[test]
    fn test_uniform_vectors_are_parallel() {
        let a = filled(0.2);
        let b = filled(0.9);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let err = Embedding::from_values(vec![0.5; 64]).unwrap_err();
        assert_eq!(err, EmbeddingError::WrongDimension(64));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut values = vec![0.5; EMBEDDING_DIM];
        values[10] = 1.5;
        let err = Embedding::from_values(values).unwrap_err();
        assert!(matches!(err, EmbeddingError::OutOfRange { index: 10, .. }));

        let mut values = vec![0.5; EMBEDDING_DIM];
        values[0] = f32::NAN;
        assert!(Embedding::from_values(values).is_err());
    }

    #[test]
    fn test_embedding_deserialize_validates() {
        let ok: Embedding = serde_json::from_str(&serde_json::to_string(&vec![0.25f32; 128]).unwrap()).unwrap();
        assert_eq!(ok.values().len(), EMBEDDING_DIM);

        let short = serde_json::from_str::<Embedding>("[0.1, 0.2]");
        assert!(short.is_err());
    }

    #[test]
    fn test_face_box_dimensions() {
        let b = FaceBox::new((10.0, 20.0), (60.0, 100.0));
        assert_eq!(b.width(), 50.0);
        assert_eq!(b.height(), 80.0);
        assert_eq!(b.area(), 4000.0);

        let inverted = FaceBox::new((60.0, 20.0), (10.0, 100.0));
        assert_eq!(inverted.area(), 0.0);
    }

    #[test]
    fn test_attendance_record_json_shape() {
        let record = AttendanceRecord {
            display_name: "Asha".into(),
            external_id: "US002".into(),
            date: "Mon Jan 01 2024".into(),
            time: "9:00:00 AM".into(),
            timestamp: 1_704_099_600_000,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["displayName"], "Asha");
        assert_eq!(json["externalId"], "US002");
        assert_eq!(json["timestamp"], 1_704_099_600_000i64);
    }
}
