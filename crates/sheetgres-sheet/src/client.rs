use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{SheetError, SheetResult};

/// A record as the Sheet service returns it: an opaque identifier plus the
/// raw field values.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetRecord {
    pub id: String,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// One page of a record listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPage {
    pub records: Vec<SheetRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The capability set the engine needs from the Sheet vendor. Deliberately
/// small: full listing with cursoring, record CRUD, and a single-field
/// equality query for id-mapping recovery.
pub trait SheetClient: Send + Sync {
    fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = SheetResult<RecordPage>> + Send;

    /// Create a record; returns the Sheet-assigned external id.
    fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = SheetResult<String>> + Send;

    fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = SheetResult<()>> + Send;

    fn delete_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
    ) -> impl Future<Output = SheetResult<()>> + Send;

    /// Records where `field == value`. Only equality is required.
    fn query_records(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = SheetResult<Vec<SheetRecord>>> + Send;

    /// Cheap connectivity check for the `test` command.
    fn ping(&self) -> impl Future<Output = SheetResult<()>> + Send;
}

/// Read every page of a table. The poller must never diff against a
/// partial listing, so this iterates cursors to exhaustion.
pub async fn list_all_records<C: SheetClient>(
    client: &C,
    db: &str,
    table: &str,
) -> SheetResult<Vec<SheetRecord>> {
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = client.list_records(db, table, cursor.as_deref()).await?;
        all.extend(page.records);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(all),
        }
    }
}

/// HTTP adapter for a REST-style Sheet service.
pub struct HttpSheetClient {
    http: reqwest::Client,
    base_url: String,
    app_token: String,
}

impl HttpSheetClient {
    pub fn new(
        base_url: impl Into<String>,
        app_token: impl Into<String>,
    ) -> SheetResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| SheetError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_token: app_token.into(),
        })
    }

    fn records_url(&self, db: &str, table: &str) -> String {
        format!("{}/databases/{}/tables/{}/records", self.base_url, db, table)
    }

    async fn check(response: reqwest::Response) -> SheetResult<reqwest::Response> {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SheetError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SheetError::Unauthorized);
        }
        if status.as_u16() == 404 {
            return Err(SheetError::NotFound(response.url().path().to_string()));
        }
        if status.is_server_error() {
            return Err(SheetError::Network(format!("upstream {}", status)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SheetError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<SheetRecord>,
}

impl SheetClient for HttpSheetClient {
    fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = SheetResult<RecordPage>> + Send {
        let mut request = self
            .http
            .get(self.records_url(db, table))
            .bearer_auth(&self.app_token);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        async move {
            let response = Self::check(request.send().await?).await?;
            Ok(response.json::<RecordPage>().await?)
        }
    }

    fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = SheetResult<String>> + Send {
        let request = self
            .http
            .post(self.records_url(db, table))
            .bearer_auth(&self.app_token)
            .json(&serde_json::json!({ "fields": fields }));

        async move {
            let response = Self::check(request.send().await?).await?;
            Ok(response.json::<CreatedRecord>().await?.id)
        }
    }

    fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = SheetResult<()>> + Send {
        let request = self
            .http
            .patch(format!("{}/{}", self.records_url(db, table), external_id))
            .bearer_auth(&self.app_token)
            .json(&serde_json::json!({ "fields": fields }));

        async move {
            Self::check(request.send().await?).await?;
            Ok(())
        }
    }

    fn delete_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
    ) -> impl Future<Output = SheetResult<()>> + Send {
        let request = self
            .http
            .delete(format!("{}/{}", self.records_url(db, table), external_id))
            .bearer_auth(&self.app_token);

        async move {
            Self::check(request.send().await?).await?;
            Ok(())
        }
    }

    fn query_records(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = SheetResult<Vec<SheetRecord>>> + Send {
        let value_text = value.to_string();
        let request = self
            .http
            .get(format!("{}/query", self.records_url(db, table)))
            .bearer_auth(&self.app_token)
            .query(&[("field", field), ("value", value_text.as_str())]);

        async move {
            let response = Self::check(request.send().await?).await?;
            Ok(response.json::<QueryResponse>().await?.records)
        }
    }

    fn ping(&self) -> impl Future<Output = SheetResult<()>> + Send {
        let request = self
            .http
            .get(format!("{}/ping", self.base_url))
            .bearer_auth(&self.app_token);

        async move {
            Self::check(request.send().await?).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSheetClient;

    #[tokio::test]
    async fn test_list_all_follows_cursors() {
        let client = MockSheetClient::new();
        client.set_page_size(2);
        for i in 0..5 {
            client.seed_record(
                "MyDB",
                "users",
                [("Key".to_string(), serde_json::json!(format!("k{}", i)))]
                    .into_iter()
                    .collect(),
            );
        }

        let records = list_all_records(&client, "MyDB", "users").await.unwrap();
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_record_page_deserializes_without_cursor() {
        let page: RecordPage =
            serde_json::from_str(r#"{"records":[{"id":"r1","fields":{"Name":"a"}}]}"#).unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.next_cursor.is_none());
    }
}
