//! Deterministic embedder for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use super::embeddings::{Embedder, EmbeddingError, Embeddings, InputType};

pub const DIMENSIONS: usize = 16;

/// Words that share a concept dimension.
const CONCEPTS: &[&[&str]] = &[
    &["heart", "cardiac", "cardio"],
    &["rate", "pulse", "beats"],
    &["blood", "pressure", "hypertension"],
    &["weight", "mass", "body"],
    &["age", "birth", "gender", "sex"],
    &["pain", "ache"],
    &["diabetes", "glucose", "insulin"],
];

#[derive(Debug, Clone)]
pub struct Call {
    pub texts: Vec<String>,
    pub input_type: InputType,
    pub started: Instant,
}

/// Maps synonyms onto shared dimensions and hashes everything else into the
/// remaining ones, so "cardiac rate" lands next to "heart rate".
pub struct ConceptEmbedder {
    model: String,
    calls: Mutex<Vec<Call>>,
    /// 1-based call number -> error returned by that call
    failures: Mutex<HashMap<usize, EmbeddingError>>,
}

impl ConceptEmbedder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: Mutex::new(vec![]),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make call number `call` (1-based) fail with `error`.
    pub fn fail_call(self, call: usize, error: EmbeddingError) -> Self {
        self.failures.lock().unwrap().insert(call, error);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIMENSIONS];
        // keeps every vector away from zero norm
        vector[DIMENSIONS - 1] = 0.05;

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            match CONCEPTS.iter().position(|group| group.contains(&word.as_str())) {
                Some(dim) => vector[dim] += 1.0,
                None => {
                    let spare = DIMENSIONS - CONCEPTS.len() - 1;
                    let hash = word
                        .bytes()
                        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                    vector[CONCEPTS.len() + hash % spare] += 0.3;
                }
            }
        }

        vector
    }
}

impl Embedder for ConceptEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String], input_type: InputType) -> Result<Embeddings, EmbeddingError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                texts: texts.to_vec(),
                input_type,
                started: Instant::now(),
            });
            calls.len()
        };

        if let Some(err) = self.failures.lock().unwrap().remove(&call_number) {
            return Err(err);
        }

        Ok(Embeddings {
            vectors: texts.iter().map(|t| Self::vector_for(t)).collect(),
            total_tokens: Some(texts.iter().map(|t| t.split_whitespace().count() as u64).sum()),
        })
    }
}
