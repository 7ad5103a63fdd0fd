//! Cosmos DB backend over the SQL REST API.
//!
//! Requests are signed with the account master key:
//! `HMAC-SHA256(key, "{verb}\n{resource type}\n{resource link}\n{date}\n\n")`,
//! sent as the URL-encoded token `type=master&ver=1.0&sig={base64}`.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::config::StoreConfig;
use crate::store::{validate_container_name, DocumentStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

pub const API_VERSION: &str = "2018-12-31";

const QUERY_ALL: &str = "SELECT * FROM c";
const QUERY_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct CosmosConfig {
    pub endpoint: String,
    pub key: String,
    pub database: String,
    pub partition_key: String,
}

impl From<&StoreConfig> for CosmosConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            key: config.key.clone(),
            database: config.database.clone(),
            partition_key: config.partition_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CosmosErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// One page of a document query; system properties stay on each document.
#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct CosmosDocumentStore {
    client: Client,
    config: CosmosConfig,
    base_url: String,
    key: Vec<u8>,
}

impl CosmosDocumentStore {
    pub fn new(config: CosmosConfig) -> Result<Self, StoreError> {
        let key = STANDARD
            .decode(config.key.trim())
            .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let base_url = config.endpoint.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            config,
            base_url,
            key,
        })
    }

    fn database_link(&self) -> String {
        format!("dbs/{}", self.config.database)
    }

    fn collection_link(&self, container: &str) -> String {
        format!("dbs/{}/colls/{}", self.config.database, container)
    }

    fn partition_key_header(&self, document: &Value) -> Result<String, StoreError> {
        let value = document
            .get(&self.config.partition_key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| StoreError::MissingPartitionKey(self.config.partition_key.clone()))?;
        Ok(serde_json::to_string(&[value])?)
    }

    fn request(
        &self,
        method: Method,
        resource_type: &str,
        resource_link: &str,
        url: String,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let date = rfc1123_now();
        let token = master_key_token(
            &self.key,
            method.as_str(),
            resource_type,
            resource_link,
            &date,
        )?;
        Ok(self
            .client
            .request(method, url)
            .header("authorization", token)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION))
    }
}

/// Map a non-2xx reply to `StoreError::Api`, preferring the service's
/// `code: message` body over the raw text.
async fn api_error(response: reqwest::Response, container: &str, action: &str) -> StoreError {
    let code = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<CosmosErrorBody>(&body)
        .ok()
        .map(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message,
            (Some(code), None) => code,
            (None, None) => body.clone(),
        })
        .unwrap_or(body);

    tracing::error!(
        code = code,
        container = container,
        action = action,
        message = %message,
        "Cosmos DB request rejected"
    );
    StoreError::Api { code, message }
}

#[async_trait]
impl DocumentStore for CosmosDocumentStore {
    async fn insert(&self, container: &str, document: &Value) -> Result<(), StoreError> {
        validate_container_name(container)?;
        let link = self.collection_link(container);
        let url = format!("{}/{}/docs", self.base_url, link);
        let partition_key = self.partition_key_header(document)?;

        let response = self
            .request(Method::POST, "docs", &link, url)?
            .header("x-ms-documentdb-partitionkey", partition_key)
            .json(document)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, container, "insert").await);
        }

        tracing::debug!(container = container, "Cosmos DB document created");
        Ok(())
    }

    async fn query_all(&self, container: &str) -> Result<Vec<Value>, StoreError> {
        validate_container_name(container)?;
        let link = self.collection_link(container);
        let url = format!("{}/{}/docs", self.base_url, link);
        let query = serde_json::to_vec(&serde_json::json!({
            "query": QUERY_ALL,
            "parameters": [],
        }))?;

        let mut documents = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .request(Method::POST, "docs", &link, url.clone())?
                .header("content-type", "application/query+json")
                .header("x-ms-documentdb-isquery", "True")
                .header("x-ms-documentdb-query-enablecrosspartition", "True")
                .header("x-ms-max-item-count", QUERY_PAGE_SIZE.to_string());
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token.as_str());
            }

            let response = request.body(query.clone()).send().await?;
            if !response.status().is_success() {
                return Err(api_error(response, container, "query").await);
            }

            continuation = response
                .headers()
                .get("x-ms-continuation")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            let page: QueryPage = response.json().await?;
            documents.extend(page.documents);

            if continuation.is_none() {
                break;
            }
        }

        tracing::debug!(
            container = container,
            count = documents.len(),
            "Cosmos DB container read"
        );
        Ok(documents)
    }

    async fn health(&self) -> Result<String, StoreError> {
        let link = self.database_link();
        let url = format!("{}/{}", self.base_url, link);
        let response = self.request(Method::GET, "dbs", &link, url)?.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Api {
                code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(format!("database {} reachable", self.config.database))
    }

    fn name(&self) -> &str {
        "cosmos"
    }
}

/// Current time in the RFC 1123 form Cosmos expects in `x-ms-date`.
pub fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build the URL-encoded master-key authorization token for one request.
pub fn master_key_token(
    key: &[u8],
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String, StoreError> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );

    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let token = format!("type=master&ver=1.0&sig={}", signature);
    Ok(url::form_urlencoded::byte_serialize(token.as_bytes()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "dGVzdC1tYXN0ZXIta2V5LWZvci1jb3Ntb3MtcmVsYXk=";

    fn test_config(endpoint: String) -> CosmosConfig {
        CosmosConfig {
            endpoint,
            key: TEST_KEY.to_string(),
            database: "openmw_conv".to_string(),
            partition_key: "id".to_string(),
        }
    }

    #[test]
    fn test_master_key_token_signs_lowercased_payload() {
        let key = STANDARD.decode(TEST_KEY).unwrap();
        let date = "Thu, 27 Apr 2017 00:51:12 GMT";
        let token =
            master_key_token(&key, "POST", "docs", "dbs/openmw_conv/colls/api_output", date)
                .unwrap();

        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(b"post\ndocs\ndbs/openmw_conv/colls/api_output\nthu, 27 apr 2017 00:51:12 gmt\n\n");
        let expected_sig = STANDARD.encode(mac.finalize().into_bytes());
        let expected: String = url::form_urlencoded::byte_serialize(
            format!("type=master&ver=1.0&sig={}", expected_sig).as_bytes(),
        )
        .collect();

        assert_eq!(token, expected);
        assert!(token.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
        assert!(!token.contains('+'), "base64 '+' must be percent-encoded");
    }

    #[test]
    fn test_rfc1123_format() {
        let date = rfc1123_now();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), "Thu, 27 Apr 2017 00:51:12 GMT".len());
    }

    #[test]
    fn test_new_rejects_invalid_key() {
        let mut config = test_config("https://acct.documents.azure.com".to_string());
        config.key = "%%%".to_string();
        match CosmosDocumentStore::new(config) {
            Err(StoreError::InvalidKey(_)) => {}
            other => panic!("Expected InvalidKey, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_insert_posts_signed_document() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(format!("{}/", mock_server.uri())))
            .expect("Failed to create store");

        let document = json!({"id": "msg-1", "document_id": "doc-1", "c": 3});

        Mock::given(method("POST"))
            .and(path("/dbs/openmw_conv/colls/api_output/docs"))
            .and(header("x-ms-version", API_VERSION))
            .and(header("x-ms-documentdb-partitionkey", "[\"msg-1\"]"))
            .and(header_exists("authorization"))
            .and(header_exists("x-ms-date"))
            .and(body_json(document.clone()))
            .respond_with(ResponseTemplate::new(201).set_body_json(document.clone()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = store.insert("api_output", &document).await;
        assert!(result.is_ok(), "Expected Ok, got {:?}", result.err());
    }

    #[tokio::test]
    async fn test_insert_conflict_surfaces_api_error() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "Conflict",
                "message": "Entity with the specified id already exists in the system."
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = store.insert("js_input", &json!({"id": "msg-1"})).await;
        match result {
            Err(StoreError::Api { code, message }) => {
                assert_eq!(code, 409);
                assert!(message.starts_with("Conflict:"), "message: {}", message);
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_does_not_retry_throttled_requests() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Request rate is large"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = store.insert("js_output", &json!({"id": "msg-1"})).await;
        match result {
            Err(e) => {
                assert_eq!(e.status_code(), Some(429));
                assert!(e.to_string().contains("Request rate is large"));
            }
            Ok(()) => panic!("Expected throttling error"),
        }
    }

    #[tokio::test]
    async fn test_insert_requires_partition_key_value() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(mock_server.uri())).unwrap();

        let result = store.insert("api_output", &json!({"c": 3})).await;
        assert!(matches!(result, Err(StoreError::MissingPartitionKey(ref f)) if f == "id"));
    }

    #[tokio::test]
    async fn test_query_all_follows_continuation_across_partitions() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/dbs/openmw_conv/colls/js_input/docs"))
            .and(header("x-ms-continuation", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Documents": [{"id": "m2", "_ts": 2}],
                "_count": 1
            })))
            .with_priority(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/dbs/openmw_conv/colls/js_input/docs"))
            .and(header("x-ms-documentdb-isquery", "True"))
            .and(header("x-ms-documentdb-query-enablecrosspartition", "True"))
            .and(header("content-type", "application/query+json"))
            .and(header_exists("authorization"))
            .and(body_json(json!({"query": "SELECT * FROM c", "parameters": []})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ms-continuation", "page-2")
                    .set_body_json(json!({
                        "Documents": [{"id": "m1", "_ts": 1}],
                        "_count": 1
                    })),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let docs = store.query_all("js_input").await.expect("query");
        assert_eq!(docs, vec![json!({"id": "m1", "_ts": 1}), json!({"id": "m2", "_ts": 2})]);
    }

    #[tokio::test]
    async fn test_query_all_surfaces_auth_failure() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "code": "Unauthorized",
                "message": "The input authorization token can't serve the request."
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match store.query_all("api_output").await {
            Err(StoreError::Api { code, message }) => {
                assert_eq!(code, 401);
                assert!(message.starts_with("Unauthorized:"), "message: {}", message);
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_health_reads_database() {
        let mock_server = MockServer::start().await;
        let store = CosmosDocumentStore::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("GET"))
            .and(path("/dbs/openmw_conv"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "openmw_conv"})))
            .mount(&mock_server)
            .await;

        let status = store.health().await.expect("health");
        assert!(status.contains("openmw_conv"));
        assert_eq!(store.name(), "cosmos");
    }
}
