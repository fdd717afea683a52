//! Hetzner DNS API client.

use super::{DnsApi, DnsRecord, NewRecord, Zone};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://dns.hetzner.com/api/v1";

#[derive(Debug, Deserialize)]
struct ZonesResponse {
    #[serde(default)]
    zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    #[serde(default)]
    records: Vec<DnsRecord>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    record: DnsRecord,
}

pub struct HetznerDns {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HetznerDns {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Auth-API-Token", &self.token)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Dns {
        code: status.as_u16(),
        body,
    })
}

#[async_trait]
impl DnsApi for HetznerDns {
    async fn zones(&self, name: &str) -> Result<Vec<Zone>> {
        let path = format!("/zones?name={}", urlencoding::encode(name));
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        // an unknown zone name is answered with 404 rather than an empty list
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: ZonesResponse = check(response).await?.json().await?;
        Ok(body.zones)
    }

    async fn records(&self, zone_id: &str) -> Result<Vec<DnsRecord>> {
        let path = format!("/records?zone_id={}", urlencoding::encode(zone_id));
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let body: RecordsResponse = check(response).await?.json().await?;
        Ok(body.records)
    }

    async fn create_record(&self, record: &NewRecord) -> Result<DnsRecord> {
        debug!(name = %record.name, zone_id = %record.zone_id, "POST /records");
        let response = self
            .request(reqwest::Method::POST, "/records")
            .json(record)
            .send()
            .await?;
        let body: RecordResponse = check(response).await?.json().await?;
        Ok(body.record)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let path = format!("/records/{}", urlencoding::encode(record_id));
        let response = self.request(reqwest::Method::DELETE, &path).send().await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get};
    use axum::Json;
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fake_api() -> Router {
        Router::new()
            .route(
                "/zones",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("name").map(String::as_str) == Some("example.com") {
                        (StatusCode::OK, Json(json!({"zones": [{"id": "z1", "name": "example.com", "ttl": 86400}]})))
                    } else {
                        (StatusCode::NOT_FOUND, Json(json!({"zones": []})))
                    }
                }),
            )
            .route(
                "/records",
                get(|| async {
                    Json(json!({"records": [
                        {"id": "r1", "zone_id": "z1", "name": "ci", "type": "A", "value": "203.0.113.5", "ttl": 3600},
                        {"id": "r2", "zone_id": "z1", "name": "@", "type": "NS", "value": "ns1.example.net."}
                    ]}))
                })
                .post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    if headers.get("Auth-API-Token").is_none() {
                        return (StatusCode::UNAUTHORIZED, Json(json!({})));
                    }
                    let mut record = body;
                    record["id"] = json!("r3");
                    (StatusCode::OK, Json(json!({ "record": record })))
                }),
            )
            .route(
                "/records/:id",
                delete(|Path(id): Path<String>| async move {
                    if id == "r1" { StatusCode::OK } else { StatusCode::NOT_FOUND }
                }),
            )
    }

    #[tokio::test]
    async fn test_against_fake_api() {
        let url = serve(fake_api()).await;
        let api = HetznerDns::with_base_url(&url, "token").unwrap();

        let zones = api.zones("example.com").await.unwrap();
        assert_eq!(zones[0].id, "z1");
        assert!(api.zones("example.org").await.unwrap().is_empty());

        let records = api.records("z1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, "A");
        assert_eq!(records[1].ttl, None);

        let created = api
            .create_record(&NewRecord {
                zone_id: "z1".to_string(),
                name: "ci".to_string(),
                record_type: "A".to_string(),
                value: "203.0.113.9".to_string(),
                ttl: 3600,
            })
            .await
            .unwrap();
        assert_eq!(created.id, "r3");
        assert_eq!(created.value, "203.0.113.9");

        api.delete_record("r1").await.unwrap();
        let err = api.delete_record("r9").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
