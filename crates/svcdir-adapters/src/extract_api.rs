use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use svcdir_core::{CandidateRecord, Job, Metadata};
use tracing::debug;

use crate::{mentions_rate_limit, status_error, ExtractError, Extraction, Extractor};

const DEFAULT_PROMPT: &str = "Extract every local service, organisation or facility listed on \
    this page. For each one return name, description, phone, email, address, website and category.";

/// Hosted content-extraction API endpoint settings.
#[derive(Debug, Clone)]
pub struct ExtractApiConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Sends the job URL plus prompt/schema to a hosted extraction API.
#[derive(Debug, Clone)]
pub struct ExtractApiExtractor {
    client: reqwest::Client,
    config: ExtractApiConfig,
}

impl ExtractApiExtractor {
    pub fn new(client: reqwest::Client, config: ExtractApiConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/scrape", self.config.base_url.trim_end_matches('/'))
    }
}

fn default_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "services": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "description": {"type": "string"},
                        "phone": {"type": "string"},
                        "email": {"type": "string"},
                        "address": {"type": "string"},
                        "website": {"type": "string"},
                        "category": {"type": "string"}
                    },
                    "required": ["name"]
                }
            }
        }
    })
}

#[async_trait]
impl Extractor for ExtractApiExtractor {
    fn kind(&self) -> &'static str {
        "extract_api"
    }

    fn default_confidence(&self) -> Option<f64> {
        Some(0.85)
    }

    async fn extract(&self, job: &Job) -> Result<Extraction, ExtractError> {
        let body = json!({
            "url": job.target,
            "formats": ["extract"],
            "extract": {
                "prompt": job.prompt.as_deref().unwrap_or(DEFAULT_PROMPT),
                "schema": job.schema.clone().unwrap_or_else(default_schema),
            }
        });

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let url = resp.url().to_string();
        let text = resp.text().await?;

        if !status.is_success() {
            if mentions_rate_limit(&text) {
                return Err(ExtractError::RateLimited(format!(
                    "http {} from {url}",
                    status.as_u16()
                )));
            }
            return Err(status_error(status, &url));
        }

        let payload: JsonValue = serde_json::from_str(&text)
            .map_err(|err| ExtractError::Parse(format!("extract api response: {err}")))?;

        if payload.get("success").and_then(JsonValue::as_bool) == Some(false) {
            let error = payload
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown error");
            if mentions_rate_limit(error) {
                return Ok(Extraction::rate_limited());
            }
            return Err(ExtractError::Parse(format!("extract api reported failure: {error}")));
        }

        let mut candidates = candidates_from_json(&payload, &job.target);
        let scraped_at = Utc::now().to_rfc3339();
        for candidate in &mut candidates {
            candidate
                .metadata
                .insert("extraction_method".into(), json!("extract_api"));
            candidate.metadata.insert("scraped_at".into(), json!(scraped_at));
            if candidate.category.is_none() {
                candidate.category = job.category.clone();
            }
        }
        debug!(job = %job.name, candidates = candidates.len(), "extract api returned");
        Ok(Extraction::of(candidates))
    }
}

const KNOWN_FIELDS: &[&str] = &[
    "name",
    "description",
    "phone",
    "email",
    "address",
    "website",
    "category",
    "confidence",
    "source_url",
];

/// Pulls candidate records out of an extraction payload.
///
/// Accepts `{data: {extract: ..}}`, `{extract: ..}`, `{services: [..]}`, a bare array
/// or a single object; unknown item keys are kept as metadata.
pub fn candidates_from_json(payload: &JsonValue, source: &str) -> Vec<CandidateRecord> {
    let extract = payload
        .pointer("/data/extract")
        .or_else(|| payload.get("extract"))
        .unwrap_or(payload);
    let items: Vec<&JsonValue> = match extract {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(map) => match map.get("services") {
            Some(JsonValue::Array(items)) => items.iter().collect(),
            _ if map.contains_key("name") => vec![extract],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(JsonValue::as_object)
        .map(|item| candidate_from_object(item, source))
        .collect()
}

fn string_field(item: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match item.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn candidate_from_object(item: &Map<String, JsonValue>, source: &str) -> CandidateRecord {
    let mut metadata = Metadata::new();
    for (key, value) in item {
        if !KNOWN_FIELDS.contains(&key.as_str()) && !value.is_null() {
            metadata.insert(key.clone(), value.clone());
        }
    }
    let source = string_field(item, "source_url").unwrap_or_else(|| source.to_string());
    metadata.insert("source_url".into(), json!(source));

    CandidateRecord {
        name: string_field(item, "name"),
        description: string_field(item, "description"),
        phone: string_field(item, "phone"),
        email: string_field(item, "email"),
        address: string_field(item, "address"),
        website: string_field(item, "website"),
        category: string_field(item, "category"),
        source,
        confidence: item.get("confidence").and_then(JsonValue::as_f64),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_services_payload() {
        let payload = json!({
            "success": true,
            "data": {"extract": {"services": [
                {"name": "Headspace Mount Isa", "phone": "07 4743 9800", "hours": "9-5"},
                {"name": "  ", "description": "blank name"},
                "not an object"
            ]}}
        });
        let candidates = candidates_from_json(&payload, "https://health.example");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name.as_deref(), Some("Headspace Mount Isa"));
        assert_eq!(candidates[0].metadata["hours"], json!("9-5"));
        assert_eq!(candidates[0].source, "https://health.example");
        assert_eq!(candidates[1].name, None);
    }

    #[test]
    fn bare_array_and_single_object_payloads() {
        let array = json!([{"name": "A"}, {"name": "B", "confidence": 0.6}]);
        let parsed = candidates_from_json(&array, "cmd");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].confidence, Some(0.6));

        let single = json!({"extract": {"name": "Solo", "source_url": "https://solo.example"}});
        let parsed = candidates_from_json(&single, "fallback");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].source, "https://solo.example");

        assert!(candidates_from_json(&json!({"data": {}}), "x").is_empty());
    }
}
