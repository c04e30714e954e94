use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Map, Value};

use super::{KeyStore, PooledKey, UsageRecord, UsageStore};
use crate::auth::credentials::GcpCredentials;

const FIRESTORE_BASE: &str = "https://firestore.googleapis.com";

/// Firestore REST implementation of both stores.
///
/// Writes use server-side field transforms (`increment`,
/// `appendMissingElements`) in a single `:commit`, so concurrent requests
/// for the same fingerprint never read-modify-write at the application
/// level. Creation uses `createDocument?documentId=`, treating
/// ALREADY_EXISTS as "someone else won the race".
pub struct FirestoreStore {
    read: ClientWithMiddleware,
    write: ClientWithMiddleware,
    credentials: Arc<GcpCredentials>,
    project_id: String,
    usage_collection: String,
    keys_collection: String,
    base_url: String,
}

impl FirestoreStore {
    pub fn new(
        read: ClientWithMiddleware,
        write: ClientWithMiddleware,
        credentials: Arc<GcpCredentials>,
        project_id: String,
        usage_collection: String,
        keys_collection: String,
    ) -> Self {
        Self {
            read,
            write,
            credentials,
            project_id,
            usage_collection,
            keys_collection,
            base_url: FIRESTORE_BASE.to_string(),
        }
    }

    /// Point at a mock endpoint. Test use only.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn documents_root(&self) -> String {
        format!(
            "{}/v1/projects/{}/databases/(default)/documents",
            self.base_url, self.project_id
        )
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!(
            "projects/{}/databases/(default)/documents/{}/{}",
            self.project_id, collection, id
        )
    }

    async fn bearer(&self) -> anyhow::Result<String> {
        self.credentials.access_token().await
    }

    async fn fetch_usage_doc(&self, fingerprint: &str) -> anyhow::Result<Option<UsageRecord>> {
        let url = format!("{}/{}/{}", self.documents_root(), self.usage_collection, fingerprint);
        let resp = self
            .read
            .get(&url)
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("usage read failed: {}", resp.status());
        }

        let doc: Value = resp.json().await?;
        Ok(Some(parse_usage_record(&doc)?))
    }
}

#[async_trait]
impl UsageStore for FirestoreStore {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<UsageRecord>> {
        self.fetch_usage_doc(fingerprint).await
    }

    async fn get_or_create(&self, fingerprint: &str) -> anyhow::Result<UsageRecord> {
        let now = Utc::now();
        let url = format!(
            "{}/{}?documentId={}",
            self.documents_root(),
            self.usage_collection,
            fingerprint
        );
        let body = json!({
            "fields": {
                "created_at": ts_value(now),
                "total_requests": int_value(0),
                "successful_requests": int_value(0),
                "total_tokens": int_value(0),
                "requests_this_minute": empty_array(),
                "requests_this_hour": empty_array(),
                "requests_this_day": empty_array(),
            }
        });

        let resp = self
            .write
            .post(&url)
            .bearer_auth(self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            // Lost the create race; the winner's record is authoritative.
            return self
                .fetch_usage_doc(fingerprint)
                .await?
                .ok_or_else(|| anyhow::anyhow!("usage record vanished after conflict"));
        }
        if !resp.status().is_success() {
            anyhow::bail!("usage create failed: {}", resp.status());
        }

        let doc: Value = resp.json().await?;
        parse_usage_record(&doc)
    }

    async fn record_usage(
        &self,
        fingerprint: &str,
        success: bool,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let name = self.document_name(&self.usage_collection, fingerprint);
        let ts = ts_value(at);
        let append = json!({ "values": [ts.clone()] });

        let body = json!({
            "writes": [{
                "update": {
                    "name": name,
                    "fields": { "last_request": ts.clone() },
                },
                "updateMask": { "fieldPaths": ["last_request"] },
                "updateTransforms": [
                    { "fieldPath": "total_requests", "increment": int_value(1) },
                    { "fieldPath": "successful_requests", "increment": int_value(if success { 1 } else { 0 }) },
                    { "fieldPath": "total_tokens", "increment": int_value(tokens) },
                    { "fieldPath": "requests_this_minute", "appendMissingElements": append.clone() },
                    { "fieldPath": "requests_this_hour", "appendMissingElements": append.clone() },
                    { "fieldPath": "requests_this_day", "appendMissingElements": append },
                ],
            }]
        });

        let url = format!("{}:commit", self.documents_root());
        let resp = self
            .write
            .post(&url)
            .bearer_auth(self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("usage commit failed: {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for FirestoreStore {
    async fn active_keys(&self) -> anyhow::Result<Vec<PooledKey>> {
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": self.keys_collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "active" },
                        "op": "EQUAL",
                        "value": { "booleanValue": true },
                    }
                },
                "orderBy": [{
                    "field": { "fieldPath": "used_today" },
                    "direction": "ASCENDING",
                }],
            }
        });

        let url = format!("{}:runQuery", self.documents_root());
        let resp = self
            .read
            .post(&url)
            .bearer_auth(self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("key pool query failed: {}", resp.status());
        }

        let results: Vec<Value> = resp.json().await?;
        let mut keys = Vec::new();
        for entry in &results {
            // runQuery interleaves progress markers without a `document`.
            let Some(doc) = entry.get("document") else {
                continue;
            };
            keys.push(parse_pooled_key(doc)?);
        }
        Ok(keys)
    }

    async fn increment_usage(&self, key_id: &str) -> anyhow::Result<()> {
        let body = json!({
            "writes": [{
                "transform": {
                    "document": self.document_name(&self.keys_collection, key_id),
                    "fieldTransforms": [
                        { "fieldPath": "used_today", "increment": int_value(1) },
                    ],
                }
            }]
        });

        let url = format!("{}:commit", self.documents_root());
        let resp = self
            .write
            .post(&url)
            .bearer_auth(self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("key usage commit failed: {}", resp.status());
        }
        Ok(())
    }
}

// ── Firestore value mapping ──────────────────────────────────

fn ts_value(t: DateTime<Utc>) -> Value {
    json!({ "timestampValue": t.to_rfc3339_opts(SecondsFormat::Micros, true) })
}

fn int_value(n: u64) -> Value {
    // Firestore encodes int64 as a decimal string.
    json!({ "integerValue": n.to_string() })
}

fn empty_array() -> Value {
    json!({ "arrayValue": { "values": [] } })
}

fn fields_of(doc: &Value) -> anyhow::Result<&Map<String, Value>> {
    doc.get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow::anyhow!("document has no fields"))
}

fn read_int(fields: &Map<String, Value>, name: &str) -> u64 {
    fields
        .get(name)
        .and_then(|v| v.get("integerValue"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn read_bool(fields: &Map<String, Value>, name: &str) -> bool {
    fields
        .get(name)
        .and_then(|v| v.get("booleanValue"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn read_ts(fields: &Map<String, Value>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.get("timestampValue"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn read_ts_array(fields: &Map<String, Value>, name: &str) -> Vec<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.get("arrayValue"))
        .and_then(|v| v.get("values"))
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.get("timestampValue"))
                .filter_map(Value::as_str)
                .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_usage_record(doc: &Value) -> anyhow::Result<UsageRecord> {
    let fields = fields_of(doc)?;
    Ok(UsageRecord {
        created_at: read_ts(fields, "created_at").unwrap_or_else(Utc::now),
        total_requests: read_int(fields, "total_requests"),
        successful_requests: read_int(fields, "successful_requests"),
        total_tokens: read_int(fields, "total_tokens"),
        last_request_at: read_ts(fields, "last_request"),
        requests_this_minute: read_ts_array(fields, "requests_this_minute"),
        requests_this_hour: read_ts_array(fields, "requests_this_hour"),
        requests_this_day: read_ts_array(fields, "requests_this_day"),
    })
}

fn parse_pooled_key(doc: &Value) -> anyhow::Result<PooledKey> {
    let fields = fields_of(doc)?;
    let id = doc
        .get("name")
        .and_then(Value::as_str)
        .and_then(|n| n.rsplit('/').next())
        .ok_or_else(|| anyhow::anyhow!("key document has no name"))?
        .to_string();
    Ok(PooledKey {
        id,
        active: read_bool(fields, "active"),
        used_today: read_int(fields, "used_today"),
        // Original pool entries default to a 1000/day quota when unset.
        daily_quota: match read_int(fields, "daily_quota") {
            0 => 1000,
            q => q,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usage_document() {
        let doc = json!({
            "name": "projects/p/databases/(default)/documents/ai_usage_tracking/abcd1234abcd1234",
            "fields": {
                "created_at": { "timestampValue": "2025-08-08T19:30:00Z" },
                "total_requests": { "integerValue": "12" },
                "successful_requests": { "integerValue": "11" },
                "total_tokens": { "integerValue": "3400" },
                "last_request": { "timestampValue": "2025-08-08T19:45:00Z" },
                "requests_this_minute": { "arrayValue": { "values": [
                    { "timestampValue": "2025-08-08T19:45:00Z" }
                ] } },
                "requests_this_hour": { "arrayValue": { "values": [] } },
                "requests_this_day": { "arrayValue": {} },
            }
        });
        let rec = parse_usage_record(&doc).unwrap();
        assert_eq!(rec.total_requests, 12);
        assert_eq!(rec.successful_requests, 11);
        assert_eq!(rec.total_tokens, 3400);
        assert_eq!(rec.requests_this_minute.len(), 1);
        assert!(rec.requests_this_day.is_empty());
        assert!(rec.last_request_at.is_some());
    }

    #[test]
    fn parses_pooled_key_with_quota_default() {
        let doc = json!({
            "name": "projects/p/databases/(default)/documents/shared_ai_keys/key-01",
            "fields": {
                "active": { "booleanValue": true },
                "used_today": { "integerValue": "42" },
            }
        });
        let key = parse_pooled_key(&doc).unwrap();
        assert_eq!(key.id, "key-01");
        assert!(key.active);
        assert_eq!(key.used_today, 42);
        assert_eq!(key.daily_quota, 1000);
    }
}
