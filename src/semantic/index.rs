//! Flat inner-product index over unit-length vectors.
//!
//! Vectors are L2-normalized on insert, so the inner product of a
//! normalized query with a stored row is the cosine similarity. Position `i`
//! in the index is the `i`-th inserted vector and maps to `ids[i]`.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::records::EmbeddedRecord;

/// In-memory flat index: one contiguous row-major vector buffer plus the
/// parallel id list.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimensions: usize,
    /// `ids.len() * dimensions` floats
    vectors: Vec<f32>,
    ids: Vec<String>,
}

/// One search hit: index position and inner-product score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub position: usize,
    pub score: f32,
}

impl FlatIndex {
    /// Create a new empty index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: vec![],
            ids: vec![],
        }
    }

    /// Assemble an index from already-normalized rows, as read back from
    /// disk. Fails when the buffer does not hold exactly one row per id.
    pub fn from_parts(
        dimensions: usize,
        vectors: Vec<f32>,
        ids: Vec<String>,
    ) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::DimensionMismatch {
                expected: 1,
                got: 0,
            });
        }
        if vectors.len() != ids.len() * dimensions {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.len() / dimensions,
                ids: ids.len(),
            });
        }

        Ok(Self {
            dimensions,
            vectors,
            ids,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ordered id list; `ids()[i]` belongs to `vector(i)`.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id(&self, position: usize) -> Option<&str> {
        self.ids.get(position).map(String::as_str)
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimensions)?;
        self.vectors.get(start..start + self.dimensions)
    }

    /// Iterate over normalized rows in position order.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.vectors.chunks_exact(self.dimensions)
    }

    /// Normalize `embedding` and append it at the next position.
    pub fn insert(&mut self, id: String, mut embedding: Vec<f32>) -> Result<usize, IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        normalize_l2(&mut embedding)?;

        self.vectors.extend_from_slice(&embedding);
        self.ids.push(id);

        Ok(self.ids.len() - 1)
    }

    /// Top-`k` rows by inner product with the normalized `query`.
    ///
    /// Results are sorted by score descending; equal scores keep insertion
    /// order (lower position first).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let mut query = query.to_vec();
        normalize_l2(&mut query)?;

        let k = k.min(self.len());
        if k == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<Hit> = self
            .rows()
            .enumerate()
            .map(|(position, row)| Hit {
                position,
                score: dot(&query, row),
            })
            .collect();

        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, rank_order);
            hits.truncate(k);
        }
        hits.sort_by(rank_order);

        Ok(hits)
    }
}

/// Descending score, then ascending position.
fn rank_order(a: &Hit, b: &Hit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.position.cmp(&b.position))
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place.
pub fn normalize_l2(v: &mut [f32]) -> Result<(), IndexError> {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(IndexError::ZeroNormVector);
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Streams embedded records into a [`FlatIndex`].
///
/// The first record fixes the dimensionality. Repeated ids keep their first
/// vector.
#[derive(Default)]
pub struct IndexBuilder {
    index: Option<FlatIndex>,
    seen: HashSet<String>,
    duplicates: usize,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EmbeddedRecord) -> Result<(), IndexError> {
        if self.seen.contains(&record.id) {
            self.duplicates += 1;
            return Ok(());
        }

        let index = self
            .index
            .get_or_insert_with(|| FlatIndex::new(record.vector.len()));
        index.insert(record.id.clone(), record.vector)?;
        self.seen.insert(record.id);

        Ok(())
    }

    /// Number of records skipped because their id was already indexed.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn finish(self) -> Result<FlatIndex, IndexError> {
        match self.index {
            Some(index) if !index.is_empty() => Ok(index),
            _ => Err(IndexError::Empty),
        }
    }
}

/// Build an index from records held in memory.
pub fn build_index<I>(records: I) -> Result<FlatIndex, IndexError>
where
    I: IntoIterator<Item = EmbeddedRecord>,
{
    let mut builder = IndexBuilder::new();
    for record in records {
        builder.push(record)?;
    }
    builder.finish()
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Dimension mismatch: index holds {vectors} vectors but {ids} ids")]
    LengthMismatch { vectors: usize, ids: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("No embedded records to index")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    const NORM_TOLERANCE: f32 = 1e-4;

    fn embedded(id: &str, vector: Vec<f32>) -> EmbeddedRecord {
        EmbeddedRecord {
            id: id.to_string(),
            text_hash: String::new(),
            vector,
        }
    }

    #[test]
    fn test_new_index() {
        let index = FlatIndex::new(384);
        assert_eq!(index.dimensions(), 384);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_insert_normalizes() {
        let mut index = FlatIndex::new(3);
        index.insert("a".into(), vec![3.0, 4.0, 0.0]).unwrap();

        let row = index.vector(0).unwrap();
        assert!((l2_norm(row) - 1.0).abs() < NORM_TOLERANCE);
        assert!((row[0] - 0.6).abs() < 1e-6);
        assert!((row[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_every_row_has_unit_norm() {
        let mut index = FlatIndex::new(4);
        for i in 0..20 {
            let v = vec![i as f32 + 1.0, (i * 3) as f32, -2.5, 0.25 * i as f32];
            index.insert(format!("id{i}"), v).unwrap();
        }

        for row in index.rows() {
            assert!((l2_norm(row) - 1.0).abs() < NORM_TOLERANCE);
        }
        assert_eq!(index.rows().count(), index.ids().len());
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = FlatIndex::new(3);
        let result = index.insert("a".into(), vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_zero_norm_rejected() {
        let mut index = FlatIndex::new(3);
        let result = index.insert("a".into(), vec![0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_search_basic() {
        let mut index = FlatIndex::new(3);
        index.insert("x".into(), vec![1.0, 0.0, 0.0]).unwrap();
        index.insert("y".into(), vec![0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.1, 0.0], 10).unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].position, 0);
        assert!(hits[0].score > hits[1].score);
        assert!(hits[0].score <= 1.0 + NORM_TOLERANCE);
    }

    #[test]
    fn test_search_limit() {
        let mut index = FlatIndex::new(3);
        for i in 0..10 {
            index
                .insert(format!("{i}"), vec![1.0, i as f32 * 0.1, 0.0])
                .unwrap();
        }

        let hits = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        // closest rows are the ones with the smallest second component
        let positions: Vec<_> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_search_ties_break_by_position() {
        let mut index = FlatIndex::new(2);
        index.insert("far".into(), vec![0.0, 1.0]).unwrap();
        index.insert("tie-a".into(), vec![1.0, 1.0]).unwrap();
        index.insert("tie-b".into(), vec![2.0, 2.0]).unwrap();
        index.insert("tie-c".into(), vec![0.5, 0.5]).unwrap();

        let hits = index.search(&[1.0, 1.0], 3).unwrap();

        let positions: Vec<_> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(hits[0].score, hits[1].score);
    }

    #[test]
    fn test_search_k_larger_than_index() {
        let mut index = FlatIndex::new(2);
        index.insert("a".into(), vec![1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 50).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_search_query_dimension_mismatch() {
        let index = FlatIndex::new(3);
        let result = index.search(&[1.0, 0.0], 5);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_from_parts_length_mismatch() {
        let result = FlatIndex::from_parts(2, vec![1.0, 0.0, 0.0, 1.0], vec!["a".into()]);
        assert!(matches!(
            result,
            Err(IndexError::LengthMismatch { vectors: 2, ids: 1 })
        ));
    }

    #[test]
    fn test_builder_keeps_first_duplicate() {
        let mut builder = IndexBuilder::new();
        builder.push(embedded("a", vec![1.0, 0.0])).unwrap();
        builder.push(embedded("a", vec![0.0, 1.0])).unwrap();
        builder.push(embedded("b", vec![0.0, 1.0])).unwrap();
        assert_eq!(builder.duplicates(), 1);

        let index = builder.finish().unwrap();
        assert_eq!(index.ids(), &["a".to_string(), "b".to_string()]);
        assert_eq!(index.vector(0).unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_builder_rejects_mixed_dimensions() {
        let result = build_index(vec![
            embedded("a", vec![1.0, 0.0]),
            embedded("b", vec![1.0, 0.0, 0.0]),
        ]);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn test_builder_empty() {
        assert!(matches!(build_index(vec![]), Err(IndexError::Empty)));
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let records = vec![
            embedded("c", vec![0.3, 0.1]),
            embedded("a", vec![0.9, 0.2]),
            embedded("b", vec![0.1, 0.7]),
        ];

        let first = build_index(records.clone()).unwrap();
        let second = build_index(records).unwrap();

        assert_eq!(first.ids(), second.ids());
        assert_eq!(first, second);
    }
}
