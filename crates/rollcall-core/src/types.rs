use serde::{Deserialize, Serialize};

/// A detected face in frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Left eye, right eye, nose tip, left and right mouth corners.
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// A face embedding, L2-normalized by the recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Recognition model that produced the vector, e.g. "w600k_r50".
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]; 0.0 when either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, aa, bb) = self
            .values
            .iter()
            .zip(&other.values)
            .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (a, b)| (dot + a * b, aa + a * a, bb + b * b));

        let norms = (aa * bb).sqrt();
        if norms > 0.0 {
            dot / norms
        } else {
            0.0
        }
    }

    /// Values as consecutive little-endian f32s.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * 4);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes); `None` on a ragged length.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values, model_version })
    }
}

/// One enrolled student in the matching gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    /// Student id.
    pub id: String,
    /// Student name.
    pub label: String,
    pub embedding: Embedding,
}

/// Outcome of matching one probe against the gallery.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult<'g> {
    /// Matched entry, `None` when nothing reached the threshold.
    pub entry: Option<&'g GalleryEntry>,
    /// Similarity of the closest entry (0.0 for an empty gallery).
    pub similarity: f32,
}

impl MatchResult<'_> {
    pub fn is_match(&self) -> bool {
        self.entry.is_some()
    }
}

/// Compares a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn best_match<'g>(&self, probe: &Embedding, gallery: &'g [GalleryEntry], threshold: f32) -> MatchResult<'g>;
}

/// Nearest neighbour by cosine similarity; a match needs `similarity >= threshold`.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match<'g>(&self, probe: &Embedding, gallery: &'g [GalleryEntry], threshold: f32) -> MatchResult<'g> {
        let closest = gallery
            .iter()
            .map(|entry| (entry, probe.similarity(&entry.embedding)))
            .fold(None, |best: Option<(&GalleryEntry, f32)>, (entry, sim)| match best {
                Some((_, best_sim)) if best_sim >= sim => best,
                _ => Some((entry, sim)),
            });

        match closest {
            Some((entry, similarity)) => MatchResult {
                entry: (similarity >= threshold).then_some(entry),
                similarity,
            },
            None => MatchResult { entry: None, similarity: 0.0 },
        }
    }
}
