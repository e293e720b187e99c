//! Enricher: pulls off-chain market descriptors from the external REST
//! catalog and merges them onto `Condition` rows with COALESCE semantics.
//! Best-effort: failures are logged and swallowed, never surfaced to the
//! indexing checkpoint.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::CatalogDescriptor;
use crate::store::Store;

pub struct Enricher {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    catalog_url: String,
}

impl Enricher {
    pub fn new(store: Arc<dyn Store>, catalog_url: String, query_timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(query_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            store,
            http,
            catalog_url,
        }
    }

    /// Fetches the catalog and merges every resolvable descriptor. Returns
    /// the number of conditions actually updated.
    pub async fn run_once(&self) -> usize {
        let descriptors = match self.fetch_catalog().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "catalog fetch failed, skipping this enrichment pass");
                return 0;
            }
        };

        let mut updated = 0;
        for descriptor in descriptors {
            let end_date = descriptor
                .end_date_iso
                .as_deref()
                .and_then(parse_flexible_iso8601);
            let condition_id = descriptor.condition_id.clone();
            let clob_token_ids = descriptor.clob_token_ids.clone();

            match self.store.upsert_condition_metadata_coalesce(&descriptor, end_date).await {
                Ok(true) => {
                    updated += 1;
                    self.backfill_position_tokens(&condition_id, clob_token_ids).await;
                }
                Ok(false) => debug!(condition_id, "catalog entry references unknown condition, skipped"),
                Err(e) => warn!(error = %e, condition_id, "enrichment upsert failed"),
            }
        }

        info!(updated, "enrichment pass complete");
        updated
    }

    /// The catalog is the only source that ties an on-chain token id back to
    /// its (condition, outcome_index) pair; trades and transfers carry the id
    /// alone. Backfills are best-effort and skip ids already attached elsewhere.
    async fn backfill_position_tokens(&self, condition_id: &str, clob_token_ids: Option<Vec<String>>) {
        let Some(ids) = clob_token_ids else { return };
        for (outcome_index, token_id) in ids.iter().enumerate() {
            if token_id.is_empty() {
                continue;
            }
            if let Err(e) = self
                .store
                .backfill_position_token_id(condition_id, outcome_index as u32, token_id)
                .await
            {
                warn!(error = %e, condition_id, token_id, "failed to backfill position token id");
            }
        }
    }

    async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogDescriptor>> {
        let response = self.http.get(&self.catalog_url).send().await?;
        let body: Value = response.error_for_status()?.json().await?;

        let entries = body
            .as_array()
            .cloned()
            .or_else(|| body.get("data").and_then(Value::as_array).cloned())
            .unwrap_or_default();

        let mut descriptors = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<CatalogDescriptor>(entry.clone()) {
                Ok(d) => descriptors.push(d),
                Err(e) => warn!(error = %e, "catalog entry did not match the expected shape, skipping"),
            }
        }
        Ok(descriptors)
    }
}

/// Accepts date-only (`2026-07-28`) and RFC-3339-ish date-times with or
/// without a UTC offset; anything else is dropped rather than rejecting the
/// whole descriptor.
fn parse_flexible_iso8601(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return naive.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_only() {
        assert!(parse_flexible_iso8601("2026-07-28").is_some());
    }

    #[test]
    fn parses_offset_datetime() {
        assert!(parse_flexible_iso8601("2026-07-28T10:00:00Z").is_some());
    }

    #[test]
    fn parses_naive_datetime() {
        assert!(parse_flexible_iso8601("2026-07-28T10:00:00").is_some());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_flexible_iso8601("not-a-date").is_none());
    }

    #[test]
    fn clob_token_ids_parses_json_encoded_string() {
        let raw = r#"{"condition_id":"0xabc","clob_token_ids":"[\"111\",\"222\"]"}"#;
        let descriptor: crate::models::CatalogDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.clob_token_ids, Some(vec!["111".to_string(), "222".to_string()]));
    }

    #[test]
    fn clob_token_ids_parses_native_array() {
        let raw = r#"{"condition_id":"0xabc","clob_token_ids":["111","222"]}"#;
        let descriptor: crate::models::CatalogDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.clob_token_ids, Some(vec!["111".to_string(), "222".to_string()]));
    }

    #[test]
    fn clob_token_ids_absent_field_is_none() {
        let raw = r#"{"condition_id":"0xabc"}"#;
        let descriptor: crate::models::CatalogDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.clob_token_ids, None);
    }
}
