use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::{json, Value};

use super::upstream::redact_error;
use crate::errors::AppError;

/// What the demo client sends to `/ai-proxy`. Everything except
/// `device_info` is forwarded upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub contents: Value,
    #[serde(rename = "generationConfig")]
    pub generation_config: Option<Value>,
    #[serde(default)]
    pub device_info: Value,
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_endpoint() -> String {
    "generateContent".to_string()
}

#[derive(Debug)]
pub struct ProxyOutcome {
    pub response: Value,
    pub tokens_used: u64,
}

/// Forward a generate request to the Gemini API using a pooled key.
/// The key travels only in the upstream query string, never in our response.
pub async fn generate(
    http: &ClientWithMiddleware,
    api_base: &str,
    api_key: &str,
    request: &ProxyRequest,
) -> Result<ProxyOutcome, AppError> {
    // model and endpoint are interpolated into the URL path.
    validate_segment("model", &request.model)?;
    validate_segment("endpoint", &request.endpoint)?;

    let url = format!(
        "{}/models/{}:{}?key={}",
        api_base.trim_end_matches('/'),
        request.model,
        request.endpoint,
        api_key
    );

    let payload = json!({
        "contents": if request.contents.is_null() { json!([]) } else { request.contents.clone() },
        "generationConfig": request.generation_config.clone().unwrap_or_else(|| json!({
            "temperature": 0.7,
            "topK": 1,
            "topP": 1,
            "maxOutputTokens": 2048,
        })),
    });

    let resp = http
        .post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("generate request failed: {}", redact_error(e))))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(AppError::Upstream(format!("generate {}: {}", status, text)));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| AppError::Upstream(format!("generate decode: {}", e.without_url())))?;

    let tokens_used = body
        .get("usageMetadata")
        .and_then(|m| m.get("totalTokenCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(ProxyOutcome {
        response: body,
        tokens_used,
    })
}

fn validate_segment(name: &str, value: &str) -> Result<(), AppError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid {}: '{}'", name, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_reject_path_metacharacters() {
        assert!(validate_segment("model", "gemini-1.5-flash").is_ok());
        assert!(validate_segment("endpoint", "generateContent").is_ok());
        assert!(validate_segment("endpoint", "streamGenerateContent").is_ok());
        assert!(validate_segment("model", "").is_err());
        assert!(validate_segment("model", "a/b").is_err());
        assert!(validate_segment("endpoint", "gen?key=other").is_err());
        assert!(validate_segment("model", "m#frag").is_err());
    }

    #[test]
    fn proxy_request_defaults() {
        let req: ProxyRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.model, "gemini-1.5-flash");
        assert_eq!(req.endpoint, "generateContent");
        assert!(req.generation_config.is_none());
    }

    #[tokio::test]
    async fn send_failures_do_not_echo_the_key() {
        let upstream = crate::proxy::upstream::UpstreamClient::new();
        let req: ProxyRequest = serde_json::from_str("{}").unwrap();

        // Unroutable base: the send fails with an error that would carry
        // the full request URL if not redacted.
        let err = generate(
            upstream.hop_client(),
            "http://127.0.0.1:1",
            "AIza-pooled-secret",
            &req,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Upstream(_)));
        assert!(!err.to_string().contains("AIza-pooled-secret"));
    }
}
