//! Voyage AI embeddings client.
//!
//! Blocking client for `POST {base_url}/embeddings`. Every failure is mapped
//! onto a distinct [`EmbeddingError`] kind; nothing is retried here, the
//! batch driver decides what to do with a failed call.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::embeddings::{Embedder, EmbeddingError, Embeddings, InputType};

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 500;

pub struct VoyageEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    truncation: bool,
}

impl VoyageEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
        truncation: bool,
    ) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::MissingApiKey);
        }
        if model.trim().is_empty() {
            return Err(EmbeddingError::InvalidModel("empty model name".to_string()));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| EmbeddingError::InitFailed("invalid Voyage API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| EmbeddingError::InitFailed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            truncation,
        })
    }

    fn send(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, &body));
        }

        response.json::<EmbeddingResponse>().map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Timeout(e.to_string())
            } else {
                EmbeddingError::Malformed(format!("failed to parse Voyage response: {e}"))
            }
        })
    }
}

impl Embedder for VoyageEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String], input_type: InputType) -> Result<Embeddings, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Embeddings::default());
        }

        let request = EmbeddingRequest {
            input: texts,
            model: &self.model,
            input_type,
            truncation: self.truncation,
        };

        let response = self.send(&request)?;
        into_embeddings(response, texts.len())
    }
}

/// Map a non-success HTTP status onto an error kind.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> EmbeddingError {
    let body = truncate_body(body);
    let lower = body.to_lowercase();

    match status {
        StatusCode::TOO_MANY_REQUESTS
            if lower.contains("quota") || lower.contains("billing") || lower.contains("payment") =>
        {
            EmbeddingError::QuotaExceeded(body)
        }
        StatusCode::TOO_MANY_REQUESTS => EmbeddingError::RateLimited(body),
        StatusCode::PAYMENT_REQUIRED => EmbeddingError::QuotaExceeded(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EmbeddingError::Unauthorized(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => EmbeddingError::Timeout(body),
        status if status.is_server_error() => EmbeddingError::Server {
            status: status.as_u16(),
            body,
        },
        status => EmbeddingError::Request(format!("{status}: {body}")),
    }
}

fn map_transport_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::Timeout(err.to_string())
    } else {
        EmbeddingError::Request(err.to_string())
    }
}

/// Order vectors by their `index` field and check that every input got one.
fn into_embeddings(
    mut response: EmbeddingResponse,
    expected: usize,
) -> Result<Embeddings, EmbeddingError> {
    if response.data.len() != expected {
        return Err(EmbeddingError::Malformed(format!(
            "Voyage returned {} embeddings for {} inputs",
            response.data.len(),
            expected
        )));
    }

    response.data.sort_by_key(|entry| entry.index);
    if response
        .data
        .iter()
        .enumerate()
        .any(|(position, entry)| entry.index != position)
    {
        return Err(EmbeddingError::Malformed(
            "embedding indices do not cover every input".to_string(),
        ));
    }

    Ok(Embeddings {
        vectors: response.data.into_iter().map(|entry| entry.embedding).collect(),
        total_tokens: response.usage.map(|usage| usage.total_tokens),
    })
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let truncated: String = body.chars().take(MAX_ERROR_BODY).collect();
    format!("{truncated}...")
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: InputType,
    truncation: bool,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, EmbeddingError::RateLimited(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_classify_quota_on_429() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            "You have exceeded your monthly token quota",
        );
        assert!(matches!(err, EmbeddingError::QuotaExceeded(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_classify_other_statuses() {
        assert!(matches!(
            classify_status(StatusCode::PAYMENT_REQUIRED, ""),
            EmbeddingError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            EmbeddingError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, ""),
            EmbeddingError::Timeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            EmbeddingError::Server { status: 502, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad input"),
            EmbeddingError::Request(_)
        ));
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(2000);
        match classify_status(StatusCode::BAD_GATEWAY, &body) {
            EmbeddingError::Server { body, .. } => assert!(body.len() <= MAX_ERROR_BODY + 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_response_reordered_by_index() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{
                "object": "list",
                "data": [
                    {"object": "embedding", "embedding": [0.0, 1.0], "index": 1},
                    {"object": "embedding", "embedding": [1.0, 0.0], "index": 0}
                ],
                "model": "voyage-large-2",
                "usage": {"total_tokens": 7}
            }"#,
        )
        .unwrap();

        let embeddings = into_embeddings(response, 2).unwrap();
        assert_eq!(embeddings.vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(embeddings.total_tokens, Some(7));
    }

    #[test]
    fn test_response_count_mismatch_is_malformed() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [1.0], "index": 0}]}"#,
        )
        .unwrap();

        let err = into_embeddings(response, 2).unwrap_err();
        assert!(matches!(err, EmbeddingError::Malformed(_)));
    }

    #[test]
    fn test_response_duplicate_index_is_malformed() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [1.0], "index": 0}, {"embedding": [2.0], "index": 0}]}"#,
        )
        .unwrap();

        assert!(into_embeddings(response, 2).is_err());
    }

    #[test]
    fn test_request_serialization() {
        let input = vec!["heart rate".to_string()];
        let request = EmbeddingRequest {
            input: &input,
            model: "voyage-large-2",
            input_type: InputType::Document,
            truncation: true,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"][0], "heart rate");
        assert_eq!(json["input_type"], "document");
        assert_eq!(json["truncation"], true);
    }

    #[test]
    fn test_missing_key_rejected() {
        let result = VoyageEmbedder::new(
            "  ",
            "https://api.voyageai.com/v1",
            "voyage-large-2",
            Duration::from_secs(5),
            true,
        );
        assert!(matches!(result, Err(EmbeddingError::MissingApiKey)));
    }
}
