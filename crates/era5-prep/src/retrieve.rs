//! Remote data client for the reanalysis retrieval service.
//!
//! The pipeline only sees [`RemoteDataClient::retrieve`]: one blocking
//! request that ends with the dataset written to the given path, or an error.
//! [`CdsClient`] implements it against the Climate Data Store web API:
//! - Submit the request and poll the queued task until it completes
//! - Stream the result file to disk
//! - Retry the result download with exponential backoff
//! - Verify the size against the advertised content length

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::FetchError;
use crate::product::ProductSpec;

/// Issues retrieval requests for product specs.
#[async_trait]
pub trait RemoteDataClient: Send + Sync {
    /// Retrieve `spec` into `destination`, overwriting anything there.
    ///
    /// May take minutes to hours. Any error fails the artifact.
    async fn retrieve(&self, spec: &ProductSpec, destination: &Path) -> Result<(), FetchError>;
}

/// Configuration for the Climate Data Store client.
#[derive(Debug, Clone)]
pub struct CdsConfig {
    /// API root, e.g. `https://cds.climate.copernicus.eu/api/v2`
    pub url: String,
    /// `UID:API-KEY`
    pub key: String,
    /// Delay between task status polls
    pub poll_interval: Duration,
    /// Give up waiting for a queued task after this long
    pub max_wait: Duration,
    /// Maximum retry attempts for the result download
    pub max_retries: u32,
    /// Initial retry delay (doubles each retry)
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl Default for CdsConfig {
    fn default() -> Self {
        Self {
            url: "https://cds.climate.copernicus.eu/api/v2".to_string(),
            key: String::new(),
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(24 * 3600),
            max_retries: 5,
            initial_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(120),
            request_timeout: Duration::from_secs(3600),
        }
    }
}

impl CdsConfig {
    /// Fill in url and key from explicit values, then `CDSAPI_URL`/`CDSAPI_KEY`,
    /// then `~/.cdsapirc`.
    pub fn resolve_credentials(
        mut self,
        url: Option<String>,
        key: Option<String>,
    ) -> Result<Self, FetchError> {
        let rc = read_cdsapirc();

        let url = url
            .or_else(|| std::env::var("CDSAPI_URL").ok())
            .or_else(|| rc.as_ref().and_then(|(u, _)| u.clone()));
        let key = key
            .or_else(|| std::env::var("CDSAPI_KEY").ok())
            .or_else(|| rc.as_ref().and_then(|(_, k)| k.clone()));

        if let Some(url) = url {
            self.url = url;
        }
        self.key = key.ok_or(FetchError::MissingCredentials)?;
        Ok(self)
    }
}

/// Parse `url:` and `key:` lines from `$HOME/.cdsapirc`.
fn read_cdsapirc() -> Option<(Option<String>, Option<String>)> {
    let home = std::env::var_os("HOME")?;
    let content = std::fs::read_to_string(Path::new(&home).join(".cdsapirc")).ok()?;
    Some(parse_cdsapirc(&content))
}

fn parse_cdsapirc(content: &str) -> (Option<String>, Option<String>) {
    let mut url = None;
    let mut key = None;
    for line in content.lines() {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim().to_string();
            match name.trim() {
                "url" => url = Some(value),
                "key" => key = Some(value),
                _ => {}
            }
        }
    }
    (url, key)
}

/// Task status reply from the service.
#[derive(Debug, Clone, Deserialize)]
struct TaskReply {
    state: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    content_length: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

/// Climate Data Store client.
pub struct CdsClient {
    client: Client,
    config: CdsConfig,
    user: String,
    password: String,
}

impl CdsClient {
    /// Create a new client; the key must have the `UID:KEY` form.
    pub fn new(config: CdsConfig) -> Result<Self, FetchError> {
        let (user, password) = config
            .key
            .split_once(':')
            .map(|(u, p)| (u.to_string(), p.to_string()))
            .ok_or(FetchError::MissingCredentials)?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            config,
            user,
            password,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn submit(&self, spec: &ProductSpec) -> Result<TaskReply, FetchError> {
        let response = self
            .client
            .post(self.endpoint(&format!("resources/{}", spec.dataset)))
            .basic_auth(&self.user, Some(&self.password))
            .json(&spec.to_request())
            .send()
            .await?;

        parse_reply(response).await
    }

    async fn poll(&self, request_id: &str) -> Result<TaskReply, FetchError> {
        let response = self
            .client
            .get(self.endpoint(&format!("tasks/{}", request_id)))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        parse_reply(response).await
    }

    /// Poll until the task completes; returns the result location and size.
    async fn wait_for_result(
        &self,
        mut reply: TaskReply,
    ) -> Result<(String, Option<u64>, Option<String>), FetchError> {
        let started = Instant::now();
        let request_id = reply.request_id.clone();

        loop {
            match reply.state.as_str() {
                "completed" => {
                    let location = reply.location.clone().ok_or_else(|| {
                        FetchError::Protocol("completed task without location".to_string())
                    })?;
                    return Ok((location, reply.content_length, request_id));
                }
                "failed" => {
                    return Err(FetchError::Rejected(describe_error(reply.error.as_ref())));
                }
                "queued" | "running" => {}
                other => {
                    return Err(FetchError::Protocol(format!("unknown task state '{}'", other)));
                }
            }

            if started.elapsed() >= self.config.max_wait {
                return Err(FetchError::Timeout(self.config.max_wait));
            }

            let id = request_id
                .as_deref()
                .ok_or_else(|| FetchError::Protocol("queued task without request_id".into()))?;

            debug!(request_id = %id, state = %reply.state, "Waiting for retrieval task");
            tokio::time::sleep(self.config.poll_interval).await;
            reply = self.poll(id).await?;
        }
    }

    /// Download the result with retries; returns bytes written.
    async fn download_with_retry(
        &self,
        location: &str,
        destination: &Path,
        expected: Option<u64>,
    ) -> Result<u64, FetchError> {
        let url = Url::parse(&self.config.url)
            .and_then(|base| base.join(location))
            .map_err(|e| FetchError::Protocol(format!("bad result location '{}': {}", location, e)))?;

        let mut retry_count = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            match self.download_once(url.clone(), destination, expected).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        return Err(e);
                    }

                    warn!(
                        error = %e,
                        retry = retry_count,
                        max_retries = self.config.max_retries,
                        delay_secs = delay.as_secs(),
                        "Result download failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                }
            }
        }
    }

    async fn download_once(
        &self,
        url: Url,
        destination: &Path,
        expected: Option<u64>,
    ) -> Result<u64, FetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let written = stream_to_file(response, destination).await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(FetchError::Protocol(format!(
                    "size mismatch: expected {} bytes, got {}",
                    expected, written
                )));
            }
        }

        Ok(written)
    }

    /// Wait for a submitted task and download its result. The task is
    /// deleted from the service queue whatever the outcome.
    async fn collect(&self, reply: TaskReply, destination: &Path) -> Result<u64, FetchError> {
        let request_id = reply.request_id.clone();

        let result = match self.wait_for_result(reply).await {
            Ok((location, expected, _)) => {
                self.download_with_retry(&location, destination, expected)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Some(id) = &request_id {
            self.delete_task(id).await;
        }

        result
    }

    /// Remove a task from the service queue. Failures are only logged.
    async fn delete_task(&self, request_id: &str) -> bool {
        let result = self
            .client
            .delete(self.endpoint(&format!("tasks/{}", request_id)))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(request_id = %request_id, "Deleted retrieval task");
                true
            }
            Ok(response) => {
                warn!(
                    request_id = %request_id,
                    status = response.status().as_u16(),
                    "Service refused to delete retrieval task"
                );
                false
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Failed to delete retrieval task");
                false
            }
        }
    }
}

#[async_trait]
impl RemoteDataClient for CdsClient {
    #[instrument(skip(self, spec), fields(kind = %spec.kind, date = %spec.window.to_request_string()))]
    async fn retrieve(&self, spec: &ProductSpec, destination: &Path) -> Result<(), FetchError> {
        let reply = self.submit(spec).await?;
        info!(
            request_id = ?reply.request_id,
            state = %reply.state,
            "Retrieval request submitted"
        );

        let bytes = self.collect(reply, destination).await?;
        info!(path = %destination.display(), bytes = bytes, "Retrieval complete");
        Ok(())
    }
}

async fn parse_reply(response: Response) -> Result<TaskReply, FetchError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    Ok(response.json::<TaskReply>().await?)
}

async fn status_error(response: Response) -> FetchError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    FetchError::Status {
        status,
        body: body.chars().take(500).collect(),
    }
}

fn describe_error(error: Option<&Value>) -> String {
    match error {
        Some(Value::Object(map)) => {
            let message = map.get("message").and_then(Value::as_str).unwrap_or("");
            let reason = map.get("reason").and_then(Value::as_str).unwrap_or("");
            format!("{} {}", message, reason).trim().to_string()
        }
        Some(other) => other.to_string(),
        None => "no reason given".to_string(),
    }
}

/// Stream a response body to a freshly truncated file.
async fn stream_to_file(response: Response, path: &Path) -> Result<u64, FetchError> {
    let mut file = File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path as AxumPath;
    use axum::http::StatusCode;
    use axum::routing::{delete, get};
    use axum::Router;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_cdsapirc() {
        let (url, key) =
            parse_cdsapirc("url: https://cds.climate.copernicus.eu/api/v2\nkey: 1234:abcd-ef\n");
        assert_eq!(url.as_deref(), Some("https://cds.climate.copernicus.eu/api/v2"));
        assert_eq!(key.as_deref(), Some("1234:abcd-ef"));
    }

    #[test]
    fn test_key_must_contain_uid() {
        let config = CdsConfig {
            key: "no-uid".to_string(),
            ..CdsConfig::default()
        };
        assert!(matches!(
            CdsClient::new(config),
            Err(FetchError::MissingCredentials)
        ));
    }

    #[test]
    fn test_task_reply_parsing() {
        let reply: TaskReply = serde_json::from_str(
            r#"{"state": "completed", "request_id": "abc", "location": "/download/x.nc", "content_length": 42}"#,
        )
        .unwrap();
        assert_eq!(reply.state, "completed");
        assert_eq!(reply.content_length, Some(42));
    }

    #[test]
    fn test_describe_error() {
        let err = serde_json::json!({"message": "the request you have submitted is not valid", "reason": "Mars server task finished in error"});
        assert_eq!(
            describe_error(Some(&err)),
            "the request you have submitted is not valid Mars server task finished in error"
        );
        assert_eq!(describe_error(None), "no reason given");
    }

    #[tokio::test]
    async fn test_failed_task_is_rejected() {
        let client = CdsClient::new(CdsConfig {
            key: "1:k".to_string(),
            ..CdsConfig::default()
        })
        .unwrap();

        let reply = TaskReply {
            state: "failed".to_string(),
            request_id: Some("abc".to_string()),
            location: None,
            content_length: None,
            error: Some(serde_json::json!({"message": "quota exceeded"})),
        };

        let result = client.wait_for_result(reply).await;
        assert!(matches!(result, Err(FetchError::Rejected(m)) if m == "quota exceeded"));
    }

    /// Local stand-in for the retrieval service: serves results from
    /// `/download/{file}` and answers task deletion with `delete_status`.
    async fn spawn_service(
        result_status: StatusCode,
        delete_status: StatusCode,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let recorded = deleted.clone();

        let app = Router::new()
            .route(
                "/download/:file",
                get(move || async move { (result_status, "GRIB0000") }),
            )
            .route(
                "/tasks/:id",
                delete(move |AxumPath(id): AxumPath<String>| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push(id);
                        delete_status
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), deleted)
    }

    fn local_client(url: String) -> CdsClient {
        CdsClient::new(CdsConfig {
            url,
            key: "1:k".to_string(),
            max_retries: 0,
            initial_retry_delay: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            ..CdsConfig::default()
        })
        .unwrap()
    }

    fn completed(request_id: &str) -> TaskReply {
        TaskReply {
            state: "completed".to_string(),
            request_id: Some(request_id.to_string()),
            location: Some(format!("/download/{}.grib", request_id)),
            content_length: Some(8),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_task_deleted_after_download() {
        let (url, deleted) = spawn_service(StatusCode::OK, StatusCode::OK).await;
        let client = local_client(url);
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out.grib");

        let bytes = client.collect(completed("r1"), &destination).await.unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(*deleted.lock().unwrap(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_task_deleted_when_download_fails() {
        let (url, deleted) = spawn_service(StatusCode::NOT_FOUND, StatusCode::OK).await;
        let client = local_client(url);
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out.grib");

        let result = client.collect(completed("r2"), &destination).await;
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert_eq!(*deleted.lock().unwrap(), vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_task_deleted_when_rejected() {
        let (url, deleted) = spawn_service(StatusCode::OK, StatusCode::OK).await;
        let client = local_client(url);
        let dir = tempfile::tempdir().unwrap();

        let reply = TaskReply {
            state: "failed".to_string(),
            request_id: Some("r3".to_string()),
            location: None,
            content_length: None,
            error: Some(serde_json::json!({"message": "quota exceeded"})),
        };

        let result = client.collect(reply, &dir.path().join("out.grib")).await;
        assert!(matches!(result, Err(FetchError::Rejected(_))));
        assert_eq!(*deleted.lock().unwrap(), vec!["r3".to_string()]);
    }

    #[tokio::test]
    async fn test_refused_delete_is_reported() {
        let (url, deleted) =
            spawn_service(StatusCode::OK, StatusCode::INTERNAL_SERVER_ERROR).await;
        let client = local_client(url);

        assert!(!client.delete_task("r4").await);
        assert_eq!(deleted.lock().unwrap().len(), 1);

        let (url, _) = spawn_service(StatusCode::OK, StatusCode::NO_CONTENT).await;
        assert!(local_client(url).delete_task("r5").await);
    }
}
