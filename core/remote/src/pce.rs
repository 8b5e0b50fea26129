//! PCE REST API client.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use pcemirror_common::{EntityKind, Error, JobHandle, Resource, Result, TrafficFlow, TrafficQuery};

use crate::client::{JobStatus, Page, RemoteClient};
use crate::context::{Credentials, PceContext};
use crate::parse::{parse_flow, parse_resource, query_body};
use crate::retry::{RetryConfig, RetryExecutor};

const ASYNC_QUERIES: &str = "traffic_flows/async_queries";

/// Async query record as returned on creation and status checks.
#[derive(Debug, Deserialize)]
struct WireJob {
    href: Option<String>,
    status: Option<String>,
    flows_count: Option<u64>,
    error_message: Option<String>,
    rules: Option<WireRules>,
}

#[derive(Debug, Deserialize)]
struct WireRules {
    status: Option<String>,
}

/// HTTP client for one PCE organization.
pub struct PceClient {
    http: Client,
    context: PceContext,
    retry: RetryExecutor,
}

impl PceClient {
    /// Create a client for `context`.
    ///
    /// # Errors
    /// - `Config` if the HTTP client cannot be built
    pub fn new(context: PceContext, retry: RetryConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pcemirror/", env!("CARGO_PKG_VERSION")))
            .timeout(context.timeout)
            .danger_accept_invalid_certs(!context.verify_tls)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            context,
            retry: RetryExecutor::new(retry),
        })
    }

    /// Connection context in use.
    pub fn context(&self) -> &PceContext {
        &self.context
    }

    fn collection_endpoint(kind: EntityKind) -> String {
        if kind.is_policy_object() {
            format!("sec_policy/draft/{}", kind.as_str())
        } else {
            kind.as_str().to_string()
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.context.credentials {
            Credentials::ApiKey { key, secret } => request.basic_auth(key, Some(secret.as_str())),
            Credentials::Session {
                csrf_token,
                session_cookie,
            } => request
                .header("X-CSRF-Token", csrf_token.as_str())
                .header(header::COOKIE, format!("JSESSIONID={}", session_cookie.as_str())),
            Credentials::Anonymous => request,
        }
    }

    /// GET a JSON array, retrying transient failures. Also returns the
    /// `X-Total-Count` header when present.
    async fn get_array(&self, url: &Url, query: &[(&str, String)]) -> Result<(Vec<Value>, Option<u64>)> {
        let label = format!("GET {}", url.path());
        self.retry
            .execute(&label, || async move {
                let response = self
                    .authorize(self.http.get(url.clone()).query(query))
                    .send()
                    .await
                    .map_err(transport)?;

                let total = response
                    .headers()
                    .get("x-total-count")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                let items: Vec<Value> = handle_response(response).await?;
                Ok((items, total))
            })
            .await
    }

    async fn get_job(&self, handle: &JobHandle) -> Result<WireJob> {
        let url = &self.context.href_url(handle.as_str())?;
        self.retry
            .execute("GET job status", || async move {
                let response = self
                    .authorize(self.http.get(url.clone()))
                    .send()
                    .await
                    .map_err(transport)?;
                handle_response(response).await
            })
            .await
    }

    fn page_size(&self) -> u64 {
        u64::from(self.context.page_size.max(1))
    }
}

#[async_trait]
impl RemoteClient for PceClient {
    fn name(&self) -> &str {
        "pce"
    }

    async fn list_page(&self, kind: EntityKind, cursor: Option<&str>) -> Result<Page<Resource>> {
        let offset = parse_cursor(cursor)?;
        let url = self.context.org_url(&Self::collection_endpoint(kind))?;
        let query = [
            ("max_results", self.page_size().to_string()),
            ("offset", offset.to_string()),
        ];

        let (values, total) = self.get_array(&url, &query).await?;
        let received = values.len() as u64;
        let items = values
            .into_iter()
            .filter_map(|value| parse_resource(kind, value).transpose())
            .collect::<Result<Vec<Resource>>>()?;

        debug!("Fetched {} {} at offset {}", items.len(), kind, offset);
        Ok(Page {
            items,
            next_cursor: next_cursor(offset, received, self.page_size(), total),
        })
    }

    async fn submit_job(&self, query: &TrafficQuery) -> Result<JobHandle> {
        let url = self.context.org_url(ASYNC_QUERIES)?;

        let response = self
            .authorize(self.http.post(url))
            .json(&query_body(query))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status().as_u16();

        let job: WireJob = handle_response(response).await?;
        let href = job
            .href
            .ok_or_else(|| Error::remote(Some(status), "Job created without an href"))?;

        info!("Submitted traffic query '{}' as {}", query.name, href);
        Ok(JobHandle::new(href))
    }

    async fn get_job_status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let job = self.get_job(handle).await?;
        let state = job
            .status
            .as_deref()
            .ok_or_else(|| Error::remote(None, format!("No status reported for {handle}")))?
            .parse()?;

        let rules = match job.rules.and_then(|r| r.status) {
            Some(status) => match status.parse() {
                Ok(rules) => Some(rules),
                Err(e) => {
                    warn!("Ignoring rule analysis state of {}: {}", handle, e);
                    None
                }
            },
            None => None,
        };

        Ok(JobStatus {
            state,
            detail: job.error_message,
            result_rows: job.flows_count,
            rules,
        })
    }

    async fn list_result_page(
        &self,
        handle: &JobHandle,
        cursor: Option<&str>,
    ) -> Result<Page<TrafficFlow>> {
        let offset = parse_cursor(cursor)?;
        let url = self
            .context
            .href_url(&format!("{}/download", handle.as_str().trim_end_matches('/')))?;
        let query = [
            ("offset", offset.to_string()),
            ("limit", self.page_size().to_string()),
        ];

        let (values, total) = self.get_array(&url, &query).await?;
        let received = values.len() as u64;
        let items: Vec<TrafficFlow> = values.into_iter().filter_map(parse_flow).collect();

        debug!("Fetched {} result rows of {} at offset {}", items.len(), handle, offset);
        Ok(Page {
            items,
            next_cursor: next_cursor(offset, received, self.page_size(), total),
        })
    }

    async fn request_rule_analysis(&self, handle: &JobHandle, label_based: bool) -> Result<()> {
        let url = self
            .context
            .href_url(&format!("{}/update_rules", handle.as_str().trim_end_matches('/')))?;

        let response = self
            .authorize(self.http.put(url))
            .query(&[("label_based_rules", label_based)])
            .send()
            .await
            .map_err(transport)?;
        handle_empty(response).await?;

        info!("Requested rule analysis of {}", handle);
        Ok(())
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<()> {
        let url = self.context.href_url(handle.as_str())?;
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(transport)?;
        handle_empty(response).await
    }

    async fn ping(&self) -> Result<()> {
        let url = self.context.org_url("labels")?;
        self.get_array(&url, &[("max_results", "1".to_string())])
            .await
            .map(|_| ())
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<u64> {
    cursor.map_or(Ok(0), |c| {
        c.parse()
            .map_err(|_| Error::Serialization(format!("Invalid page cursor: {c}")))
    })
}

/// Offset of the next page, or `None` once a short page or the reported
/// total ends the collection.
fn next_cursor(offset: u64, received: u64, page_size: u64, total: Option<u64>) -> Option<String> {
    let next = offset + received;
    if received < page_size || total.is_some_and(|t| next >= t) {
        None
    } else {
        Some(next.to_string())
    }
}

fn transport(err: reqwest::Error) -> Error {
    Error::remote(err.status().map(|s| s.as_u16()), format!("Request failed: {err}"))
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();

    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {e}")))
    } else {
        Err(status_error(status, response).await)
    }
}

async fn handle_empty(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(status_error(status, response).await)
    }
}

async fn status_error(status: StatusCode, response: Response) -> Error {
    if status == StatusCode::UNAUTHORIZED {
        return Error::remote(
            Some(status.as_u16()),
            "Authentication failed; check the PCE credentials",
        );
    }
    let body = response.text().await.unwrap_or_default();
    Error::remote(Some(status.as_u16()), format!("API error: {} {}", status, body.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zeroize::Zeroizing;

    use crate::client::RemoteJobState;

    fn client(server: &MockServer, credentials: Credentials, page_size: u32) -> PceClient {
        let context = PceContext::new(&server.uri(), 1, credentials)
            .unwrap()
            .with_page_size(page_size);
        let retry = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        PceClient::new(context, retry).unwrap()
    }

    fn label(id: u32) -> Value {
        json!({"href": format!("/orgs/1/labels/{id}"), "key": "env", "value": format!("v{id}")})
    }

    #[tokio::test]
    async fn test_list_page_follows_offsets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/orgs/1/labels"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([label(1), label(2)])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/orgs/1/labels"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([label(3)])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, Credentials::Anonymous, 2);
        let first = client.list_page(EntityKind::Label, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let second = client
            .list_page(EntityKind::Label, first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.items[0].id(), "3");
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn test_total_count_ends_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/orgs/1/sec_policy/draft/services"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "1")
                    .set_body_json(json!([{"href": "/orgs/1/sec_policy/draft/services/9", "name": "SSH"}])),
            )
            .mount(&server)
            .await;

        let client = client(&server, Credentials::Anonymous, 1);
        let page = client.list_page(EntityKind::Service, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn test_malformed_record_fails_the_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/orgs/1/sec_policy/draft/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"href": "/orgs/1/sec_policy/draft/services/1", "name": "All Services",
                 "service_ports": [{"proto": -1}]},
                {"href": "/orgs/1/sec_policy/draft/services/2", "service_ports": "tcp"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, Credentials::Anonymous, 10)
            .list_page(EntityKind::Service, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_api_key_sent_as_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/orgs/1/labels"))
            .and(header("authorization", "Basic YXBpXzE6czNjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = Credentials::ApiKey {
            key: "api_1".to_string(),
            secret: Zeroizing::new("s3cret".to_string()),
        };
        client(&server, credentials, 10).ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_credentials_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("X-CSRF-Token", "csrf-abc"))
            .and(header("cookie", "JSESSIONID=sess-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = Credentials::Session {
            csrf_token: Zeroizing::new("csrf-abc".to_string()),
            session_cookie: Zeroizing::new("sess-123".to_string()),
        };
        client(&server, credentials, 10).ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, Credentials::Anonymous, 10)
            .ping()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(401), .. }));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        Mock::given(method("GET"))
            .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
                if attempts_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(502)
                } else {
                    ResponseTemplate::new(200).set_body_json(json!([]))
                }
            })
            .expect(3)
            .mount(&server)
            .await;

        client(&server, Credentials::Anonymous, 10).ping().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_submit_and_track_job() {
        let server = MockServer::start().await;
        let href = "/orgs/1/traffic_flows/async_queries/q-1";
        Mock::given(method("POST"))
            .and(path("/api/v2/orgs/1/traffic_flows/async_queries"))
            .and(body_partial_json(json!({"query_name": "weekly", "max_results": 500})))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"href": href, "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v2{href}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"href": href, "status": "completed", "flows_count": 3})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v2{href}/download")))
            .and(query_param("offset", "0"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"src": {"ip": "10.0.0.1"}, "dst": {"ip": "10.0.0.2"}, "service": {"port": 443, "proto": 6},
                 "policy_decision": "allowed", "num_connections": 4}
            ])))
            .mount(&server)
            .await;

        let client = client(&server, Credentials::Anonymous, 100);
        let query = TrafficQuery::new(
            "weekly",
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            500,
        );

        let handle = client.submit_job(&query).await.unwrap();
        assert_eq!(handle.as_str(), href);
        assert_eq!(handle.remote_id(), Some("q-1"));

        let status = client.get_job_status(&handle).await.unwrap();
        assert_eq!(status.state, RemoteJobState::Completed);
        assert_eq!(status.result_rows, Some(3));
        assert_eq!(status.rules, None);

        let page = client.list_result_page(&handle, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].num_connections, 4);
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn test_rule_analysis_request_and_status() {
        let server = MockServer::start().await;
        let href = "/orgs/1/traffic_flows/async_queries/q-4";
        Mock::given(method("PUT"))
            .and(path(format!("/api/v2{href}/update_rules")))
            .and(query_param("label_based_rules", "false"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v2{href}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": href,
                "status": "completed",
                "rules": {"status": "working"}
            })))
            .mount(&server)
            .await;

        let client = client(&server, Credentials::Anonymous, 100);
        let handle = JobHandle::new(href);
        client.request_rule_analysis(&handle, false).await.unwrap();

        let status = client.get_job_status(&handle).await.unwrap();
        assert_eq!(status.state, RemoteJobState::Completed);
        assert_eq!(status.rules, Some(RemoteJobState::Working));
    }

    #[tokio::test]
    async fn test_rule_analysis_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(406).set_body_string("query not completed"))
            .expect(1)
            .mount(&server)
            .await;

        let handle = JobHandle::new("/orgs/1/traffic_flows/async_queries/q-5");
        let err = client(&server, Credentials::Anonymous, 10)
            .request_rule_analysis(&handle, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(406), .. }));
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(406).set_body_string("invalid query"))
            .expect(1)
            .mount(&server)
            .await;

        let query = TrafficQuery::last_days("q", 7, 100);
        let err = client(&server, Credentials::Anonymous, 10)
            .submit_job(&query)
            .await
            .unwrap_err();
        match err {
            Error::Remote { status, message } => {
                assert_eq!(status, Some(406));
                assert!(message.contains("invalid query"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v2/orgs/1/traffic_flows/async_queries/q-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let handle = JobHandle::new("/orgs/1/traffic_flows/async_queries/q-9");
        client(&server, Credentials::Anonymous, 10)
            .cancel_job(&handle)
            .await
            .unwrap();
    }

    #[test]
    fn test_next_cursor() {
        assert_eq!(next_cursor(0, 10, 10, None), Some("10".to_string()));
        assert_eq!(next_cursor(10, 4, 10, None), None);
        assert_eq!(next_cursor(0, 10, 10, Some(10)), None);
    }
}
