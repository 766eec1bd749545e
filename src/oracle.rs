//! Classification oracle.
//!
//! The [`Classifier`] trait is the seam the scheduler talks through; the
//! bundled implementation sends event batches to an OpenAI-compatible
//! chat endpoint and parses the structured verdicts back out. Prompt
//! construction and response parsing are pure functions so they can be
//! tested without a network.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::types::{Classification, ClassificationResult, CorrectionExample, Event};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Unparseable oracle response: {0}")]
    Parse(String),
    #[error("Oracle API key not configured")]
    MissingApiKey,
}

impl OracleError {
    /// Whether another attempt could produce a different outcome.
    /// Parse failures qualify: the completion is nondeterministic, so a
    /// re-send may come back well-formed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Http(err) => err.is_timeout() || err.is_connect(),
            OracleError::Api { status, .. } => {
                *status == 429 || *status == 408 || *status >= 500
            }
            OracleError::Parse(_) => true,
            OracleError::MissingApiKey => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, OracleError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(OracleError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if retryable_status(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "oracle retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "oracle retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(OracleError::Http(err));
            }
        }
    }

    Err(OracleError::Api {
        status: 0,
        message: "request exhausted retries".to_string(),
    })
}

/// Re-run `operation` on parse failures with increasing backoff.
///
/// Transport and status retries live in [`send_with_retry`]; this outer
/// loop re-sends when the endpoint answers 200 but the completion body
/// is unusable (malformed JSON, no result array, no choices).
async fn with_parse_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, OracleError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, OracleError>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err @ OracleError::Parse(_)) if attempt < attempts => {
                let delay = retry_delay(attempt, policy, None);
                log::warn!(
                    "oracle retry {}/{} after parse error: {} (sleep {:?})",
                    attempt,
                    attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(OracleError::Parse("request exhausted retries".to_string()))
}

/// Batch classifier the scheduler drives. Implementations must be safe
/// to call from a spawned task.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a batch of events, honoring the supplied manager
    /// corrections. Returns one verdict per event the oracle answered
    /// for; callers must not assume a verdict for every input.
    async fn classify(
        &self,
        batch: &[Event],
        examples: &[CorrectionExample],
    ) -> Result<Vec<ClassificationResult>, OracleError>;
}

/// OpenAI-compatible chat-completions classifier.
pub struct OpenAiClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
    policy: RetryPolicy,
}

impl OpenAiClassifier {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.oracle_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: config.openai_api_key.clone(),
            model: config.model.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            policy: RetryPolicy::default(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    response_format: ResponseFormat<'a>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: String,
}

/// The only event fields the oracle sees.
#[derive(Serialize)]
struct EventPayload<'a> {
    id: &'a str,
    title: &'a str,
    agent: &'a str,
}

/// System instructions: the sales rubric plus any manager corrections
/// rendered as title-to-label rules.
pub(crate) fn build_instructions(examples: &[CorrectionExample]) -> String {
    let mut out = String::from(
        "You classify insurance agents' calendar events as sales activity or not.\n\
         \n\
         Label an event \"sales\" only when it is a confirmed meeting or call with a \
         named client or prospect about insurance or financial products: policy reviews, \
         quotes, applications, renewals, Medicare or annuity consultations, closings.\n\
         \n\
         Label everything else \"not_sales\", including:\n\
         - internal meetings, standups, trainings, one-on-ones\n\
         - prospecting blocks, cold-call blocks, and other unscheduled outreach time\n\
         - personal events, meals, travel, admin and paperwork blocks\n\
         - anything ambiguous, and events with empty or generic titles\n",
    );

    if !examples.is_empty() {
        out.push_str("\nManager corrections. Follow these exactly when a title matches:\n");
        for example in examples {
            out.push_str(&format!(
                "- \"{}\" should be {}\n",
                example.title, example.corrected
            ));
        }
    }

    out.push_str(
        "\nThe user message is a JSON array of events ({id, title, agent}). Respond with \
         a JSON object of the form {\"results\": [{\"id\", \"classification\", \
         \"confidence\", \"reasoning\"}]} with one entry per event. \"classification\" \
         is \"sales\" or \"not_sales\", \"confidence\" is a number from 0 to 1, and \
         \"reasoning\" is one short sentence.",
    );
    out
}

/// Extract verdicts from the model's JSON reply.
///
/// Accepts either a top-level array or an object whose first array value
/// holds the results. Entries missing an id or classification are
/// skipped; unknown labels normalize to `not_sales`.
pub(crate) fn parse_results(content: &str) -> Result<Vec<ClassificationResult>, OracleError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| OracleError::Parse(format!("invalid JSON: {e}")))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .find_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .ok_or_else(|| OracleError::Parse("no result array in response object".to_string()))?,
        _ => {
            return Err(OracleError::Parse(
                "response is neither object nor array".to_string(),
            ))
        }
    };

    let mut results = Vec::new();
    for item in items {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        let Some(label) = item.get("classification").and_then(Value::as_str) else {
            log::debug!("oracle verdict for {id} missing classification, skipping");
            continue;
        };
        let confidence = item
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let reasoning = item
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        results.push(ClassificationResult {
            id: id.to_string(),
            classification: Classification::normalize(label),
            confidence,
            reasoning,
        });
    }
    Ok(results)
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        batch: &[Event],
        examples: &[CorrectionExample],
    ) -> Result<Vec<ClassificationResult>, OracleError> {
        if self.api_key.is_empty() {
            return Err(OracleError::MissingApiKey);
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let payload: Vec<EventPayload> = batch
            .iter()
            .map(|event| EventPayload {
                id: &event.id,
                title: &event.title,
                agent: &event.agent_name,
            })
            .collect();
        let instructions = build_instructions(examples);
        let user_content = serde_json::to_string(&payload)
            .map_err(|e| OracleError::Parse(e.to_string()))?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &instructions,
                },
                ChatMessage {
                    role: "user",
                    content: &user_content,
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.api_base);
        let client = &self.client;
        let api_key = &self.api_key;
        let policy = &self.policy;
        let body = &body;

        with_parse_retry(policy, move || {
            let request = client.post(&url).bearer_auth(api_key).json(body);
            async move {
                let response = send_with_retry(request, policy).await?;
                let status = response.status();
                if !status.is_success() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(OracleError::Api {
                        status: status.as_u16(),
                        message,
                    });
                }

                let parsed: ChatResponse = response.json().await?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| choice.message.content)
                    .ok_or_else(|| {
                        OracleError::Parse("response has no choices".to_string())
                    })?;

                parse_results(&content)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instructions_contain_rubric_and_labels() {
        let text = build_instructions(&[]);
        assert!(text.contains("\"sales\""));
        assert!(text.contains("\"not_sales\""));
        assert!(text.contains("prospecting"));
        assert!(!text.contains("Manager corrections"));
    }

    #[test]
    fn test_instructions_render_corrections() {
        let examples = vec![
            CorrectionExample {
                title: "Team Standup".to_string(),
                corrected: Classification::Sales,
            },
            CorrectionExample {
                title: "Lunch".to_string(),
                corrected: Classification::NotSales,
            },
        ];
        let text = build_instructions(&examples);
        assert!(text.contains("- \"Team Standup\" should be sales"));
        assert!(text.contains("- \"Lunch\" should be not_sales"));
    }

    #[test]
    fn test_parse_results_object_wrapper() {
        let content = r#"{"results": [
            {"id": "a1", "classification": "sales", "confidence": 0.9, "reasoning": "client call"},
            {"id": "b2", "classification": "not_sales", "confidence": 0.8, "reasoning": "standup"}
        ]}"#;
        let results = parse_results(content).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a1");
        assert_eq!(results[0].classification, Classification::Sales);
        assert_eq!(results[1].classification, Classification::NotSales);
    }

    #[test]
    fn test_parse_results_alternate_key_and_top_level_array() {
        let alternate = r#"{"classifications": [{"id": "a1", "classification": "sales"}]}"#;
        assert_eq!(parse_results(alternate).unwrap().len(), 1);

        let bare = r#"[{"id": "a1", "classification": "sales"}]"#;
        assert_eq!(parse_results(bare).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_results_unknown_label_and_defaults() {
        let content = r#"{"results": [{"id": "a1", "classification": "maybe"}]}"#;
        let results = parse_results(content).unwrap();
        assert_eq!(results[0].classification, Classification::NotSales);
        assert_eq!(results[0].confidence, 0.5);
        assert_eq!(results[0].reasoning, "");
    }

    #[test]
    fn test_parse_results_clamps_confidence() {
        let content = r#"{"results": [{"id": "a1", "classification": "sales", "confidence": 7.5}]}"#;
        let results = parse_results(content).unwrap();
        assert_eq!(results[0].confidence, 1.0);
    }

    #[test]
    fn test_parse_results_skips_incomplete_entries() {
        let content = r#"{"results": [
            {"classification": "sales"},
            {"id": "b2"},
            {"id": "c3", "classification": "sales"}
        ]}"#;
        let results = parse_results(content).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "c3");
    }

    #[test]
    fn test_parse_results_rejects_garbage() {
        assert!(parse_results("not json at all").is_err());
        assert!(parse_results("42").is_err());
        assert!(parse_results(r#"{"note": "no array here"}"#).is_err());
    }

    #[test]
    fn test_error_retryability() {
        assert!(OracleError::Api {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(OracleError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!OracleError::Api {
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!OracleError::MissingApiKey.is_retryable());
        // A re-sent request may yield a well-formed completion
        assert!(OracleError::Parse("bad".to_string()).is_retryable());
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_malformed_completion_recovers_on_later_attempt() {
        let calls = std::cell::Cell::new(0u32);
        let result = with_parse_retry(&fast_policy(), || {
            calls.set(calls.get() + 1);
            let attempt = calls.get();
            async move {
                if attempt < 3 {
                    Err(OracleError::Parse("invalid JSON: not json".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_parse_retries_are_bounded() {
        let calls = std::cell::Cell::new(0u32);
        let result = with_parse_retry(&fast_policy(), || {
            calls.set(calls.get() + 1);
            async { Err::<u32, _>(OracleError::Parse("still bad".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(OracleError::Parse(_))));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_non_parse_errors_surface_immediately() {
        let calls = std::cell::Cell::new(0u32);
        let result = with_parse_retry(&fast_policy(), || {
            calls.set(calls.get() + 1);
            async { Err::<u32, _>(OracleError::MissingApiKey) }
        })
        .await;

        assert!(matches!(result, Err(OracleError::MissingApiKey)));
        assert_eq!(calls.get(), 1);
    }
}
