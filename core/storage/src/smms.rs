//! SM.MS image gallery provider (API v2).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{stream, StreamExt};
use reqwest::{header, Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, warn};

use imgbackup_common::{Error, ImageInfo, ProviderConfig, ProviderSettings, Result, UploadResult};

use crate::http::{build_client, download_to, handle_response, send};
use crate::provider::{limited, ImageProvider, ImageStream, ProviderOptions, PROBE_TIMEOUT};

const DEFAULT_API_BASE: &str = "https://sm.ms/api/v2";

/// Items per `upload_history` page.
const PAGE_SIZE: usize = 100;

/// Pause between page requests.
const PAGE_DELAY: Duration = Duration::from_millis(100);

/// Response code for an upload whose content is already stored.
const IMAGE_REPEATED: &str = "image_repeated";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
    /// URL of the existing image for `image_repeated` responses.
    images: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryItem {
    url: String,
    filename: String,
    size: Option<u64>,
    created_at: Option<Value>,
    hash: Option<String>,
    delete: Option<String>,
    page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    url: String,
    hash: Option<String>,
    delete: Option<String>,
}

/// SM.MS listing state.
struct Pager {
    page: u32,
    buffer: VecDeque<ImageInfo>,
    exhausted: bool,
}

/// SM.MS gallery provider.
pub struct SmmsProvider {
    config: ProviderConfig,
    client: Client,
    api_base: String,
    token: String,
}

impl SmmsProvider {
    /// Create a new SM.MS provider.
    ///
    /// # Errors
    /// - Configuration is not gallery-style
    /// - HTTP client cannot be built
    pub fn new(config: ProviderConfig, options: &ProviderOptions) -> Result<Self> {
        let ProviderSettings::Gallery {
            api_token,
            endpoint,
        } = &config.settings
        else {
            return Err(Error::Configuration(format!(
                "provider '{}' requires gallery settings, got {}",
                config.name,
                config.kind()
            )));
        };

        let api_base = endpoint
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let token = api_token.clone();

        Ok(Self {
            client: build_client(options.timeout)?,
            api_base,
            token,
            config,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.api_base, path))
            .header(header::AUTHORIZATION, &self.token)
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<ImageInfo>> {
        let request = self
            .get("/upload_history")
            .query(&[("page", page.to_string()), ("format", "json".to_string())]);
        let body: ApiResponse<Vec<HistoryItem>> =
            handle_response(send(request, "list upload history").await?).await?;

        if !body.success {
            return Err(Error::Network(format!("SM.MS error: {}", body.message)));
        }
        Ok(body
            .data
            .unwrap_or_default()
            .into_iter()
            .map(history_to_image)
            .collect())
    }

    async fn fetch_count(&self) -> Result<Option<u64>> {
        let body: ApiResponse<Value> =
            handle_response(send(self.get("/profile"), "fetch profile").await?).await?;
        if !body.success {
            return Ok(None);
        }
        Ok(body
            .data
            .as_ref()
            .and_then(|d| d.pointer("/disk_usage_raw/upload_count"))
            .and_then(Value::as_u64))
    }

    async fn send_upload(&self, local_path: &Path) -> Result<UploadResult> {
        let filename = local_path
            .file_name()
            .ok_or_else(|| Error::InvalidInput("Upload path has no file name".to_string()))?
            .to_string_lossy()
            .into_owned();
        let data = tokio::fs::read(local_path).await?;

        let form = reqwest::multipart::Form::new()
            .text("format", "json")
            .part(
                "smfile",
                reqwest::multipart::Part::bytes(data).file_name(filename.clone()),
            );
        let request = self
            .client
            .post(format!("{}/upload", self.api_base))
            .header(header::AUTHORIZATION, &self.token)
            .multipart(form);
        let body: ApiResponse<UploadData> =
            handle_response(send(request, "upload image").await?).await?;

        if body.success {
            let Some(data) = body.data else {
                return Ok(UploadResult::failed("SM.MS returned no upload data"));
            };
            let mut result = UploadResult::ok(Some(data.url), format!("Uploaded {}", filename));
            if let Some(hash) = data.hash {
                result = result.with_meta("hash", hash);
            }
            if let Some(delete) = data.delete {
                result = result.with_meta("delete_url", delete);
            }
            return Ok(result);
        }

        if body.code == IMAGE_REPEATED {
            return Ok(UploadResult::ok(body.images, "Image already exists"));
        }
        Ok(UploadResult::failed(format!("SM.MS error: {}", body.message)))
    }
}

fn history_to_image(item: HistoryItem) -> ImageInfo {
    let mut info = ImageInfo::new(item.url, item.filename);
    if let Some(size) = item.size {
        info = info.with_size(size);
    }
    if let Some(created_at) = item.created_at.as_ref().and_then(parse_timestamp) {
        info = info.with_created_at(created_at);
    }
    for (key, value) in [
        ("hash", item.hash),
        ("delete_url", item.delete),
        ("page_url", item.page),
    ] {
        if let Some(value) = value {
            info = info.with_meta(key, value);
        }
    }
    info
}

/// Accepts unix seconds, RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|s| DateTime::from_timestamp(s, 0)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|n| n.and_utc())
            }),
        _ => None,
    }
}

#[async_trait]
impl ImageProvider for SmmsProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn test_connection(&self) -> bool {
        let probe = send(self.get("/profile").timeout(PROBE_TIMEOUT), "probe profile");
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                error!("SM.MS connection test failed: {}", e);
                false
            }
            Err(_) => {
                error!("SM.MS connection test timed out");
                false
            }
        }
    }

    fn list_images(&self, limit: Option<usize>) -> ImageStream<'_> {
        let pager = Pager {
            page: 1,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        let images = stream::unfold(pager, move |mut pager| async move {
            loop {
                if let Some(image) = pager.buffer.pop_front() {
                    return Some((image, pager));
                }
                if pager.exhausted {
                    return None;
                }
                if pager.page > 1 {
                    tokio::time::sleep(PAGE_DELAY).await;
                }
                match self.fetch_page(pager.page).await {
                    Ok(items) => {
                        debug!("SM.MS page {} returned {} images", pager.page, items.len());
                        pager.exhausted = items.len() < PAGE_SIZE;
                        pager.page += 1;
                        pager.buffer.extend(items);
                    }
                    Err(e) => {
                        warn!("Listing {} stopped at page {}: {}", self.name(), pager.page, e);
                        return None;
                    }
                }
            }
        });

        limited(images.boxed(), limit)
    }

    async fn download_image(&self, image: &ImageInfo, destination: &Path) -> bool {
        match download_to(self.client.get(&image.url), destination).await {
            Ok(size) => {
                debug!("Downloaded {} ({} bytes)", image.filename, size);
                true
            }
            Err(e) if e.is_transient() => {
                warn!("Failed to download image {}: {}", image.filename, e);
                false
            }
            Err(e) => {
                error!("Failed to download image {}: {}", image.filename, e);
                false
            }
        }
    }

    async fn upload_image(&self, local_path: &Path, remote_path: Option<&str>) -> UploadResult {
        if let Some(remote) = remote_path {
            debug!("SM.MS ignores remote path {}", remote);
        }
        match self.send_upload(local_path).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to upload {}: {}", local_path.display(), e);
                UploadResult::failed(e.to_string())
            }
        }
    }

    async fn get_image_count(&self) -> Option<u64> {
        match self.fetch_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to get SM.MS image count: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> SmmsProvider {
        let config = ProviderConfig::new(
            "smms",
            true,
            ProviderSettings::Gallery {
                api_token: "secret".to_string(),
                endpoint: Some(server.uri()),
            },
        );
        SmmsProvider::new(config, &ProviderOptions::default()).unwrap()
    }

    fn history_page(start: usize, len: usize, base: &str) -> Value {
        let items: Vec<Value> = (start..start + len)
            .map(|i| {
                json!({
                    "url": format!("{}/i/{}.png", base, i),
                    "filename": format!("{}.png", i),
                    "size": 10,
                    "created_at": "2024-03-01 10:00:00",
                    "hash": format!("h{}", i)
                })
            })
            .collect();
        json!({ "success": true, "code": "success", "message": "", "data": items })
    }

    #[tokio::test]
    async fn test_connection_and_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .and(header_eq("Authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "username": "me", "disk_usage_raw": { "upload_count": 42 } }
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        assert!(provider.test_connection().await);
        assert_eq!(provider.get_image_count().await, Some(42));
    }

    #[tokio::test]
    async fn test_rejected_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        assert!(!provider.test_connection().await);
        assert_eq!(provider.get_image_count().await, None);
    }

    #[tokio::test]
    async fn test_listing_follows_pages() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/upload_history"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(history_page(0, PAGE_SIZE, &base)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upload_history"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(history_page(PAGE_SIZE, 2, &base)))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let images: Vec<ImageInfo> = provider.list_images(None).collect().await;

        assert_eq!(images.len(), PAGE_SIZE + 2);
        assert_eq!(images[0].filename, "0.png");
        assert_eq!(images[0].metadata["hash"], "h0");
        assert!(images[0].created_at.is_some());
    }

    #[tokio::test]
    async fn test_limit_stops_paging() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/upload_history"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(history_page(0, PAGE_SIZE, &base)))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let images: Vec<ImageInfo> = provider.list_images(Some(5)).collect().await;
        assert_eq!(images.len(), 5);
    }

    #[tokio::test]
    async fn test_listing_error_ends_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upload_history"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        assert_eq!(provider.list_images(None).count().await, 0);
    }

    #[tokio::test]
    async fn test_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/i/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png-bytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/i/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = provider_for(&server);

        let image = ImageInfo::new(format!("{}/i/a.png", server.uri()), "a.png");
        let dest = temp.path().join("smms").join("a.png");
        assert!(provider.download_image(&image, &dest).await);
        assert_eq!(std::fs::read(&dest).unwrap(), b"png-bytes");

        let gone = ImageInfo::new(format!("{}/i/gone.png", server.uri()), "gone.png");
        let dest = temp.path().join("smms").join("gone.png");
        assert!(!provider.download_image(&gone, &dest).await);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_upload_and_repeated_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "code": "success",
                "message": "Upload success.",
                "data": { "url": "https://s2.loli.net/a.png", "hash": "abc", "delete": "https://sm.ms/delete/abc" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "image_repeated",
                "message": "Image upload repeated limit.",
                "images": "https://s2.loli.net/a.png"
            })))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.png");
        std::fs::write(&file, b"png").unwrap();
        let provider = provider_for(&server);

        let first = provider.upload_image(&file, None).await;
        assert!(first.success);
        assert_eq!(first.url.as_deref(), Some("https://s2.loli.net/a.png"));
        assert_eq!(first.metadata["hash"], "abc");

        let second = provider.upload_image(&file, None).await;
        assert!(second.success);
        assert_eq!(second.url.as_deref(), Some("https://s2.loli.net/a.png"));

        let missing = provider.upload_image(&temp.path().join("none.png"), None).await;
        assert!(!missing.success);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp(&json!(1_700_000_000)).is_some());
        assert!(parse_timestamp(&json!("2024-03-01 10:00:00")).is_some());
        assert!(parse_timestamp(&json!("2024-03-01T10:00:00Z")).is_some());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }
}
