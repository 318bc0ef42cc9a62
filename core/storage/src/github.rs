//! GitHub repository provider (contents API).
//!
//! Images are files of a repository, optionally below a directory `path`.
//! Listing walks the directory tree depth-first in API order; uploads
//! create or update files with `PUT /contents/{path}`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{header, Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, error, warn};

use imgbackup_common::{
    is_image_path, Error, ImageInfo, ProviderConfig, ProviderSettings, Result, UploadResult,
};

use crate::http::{build_client, check_status, download_to, handle_response, send};
use crate::provider::{limited, ImageProvider, ImageStream, ProviderOptions, PROBE_TIMEOUT};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github.v3+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw";

/// Characters escaped inside one path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Deserialize)]
struct ContentItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<u64>,
    sha: Option<String>,
    download_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContent<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContentInfo,
}

#[derive(Debug, Deserialize)]
struct PutContentInfo {
    path: String,
    sha: Option<String>,
    download_url: Option<String>,
    html_url: Option<String>,
}

/// Pending state of a repository walk.
struct Walk {
    pending: Vec<String>,
    ready: VecDeque<ImageInfo>,
}

/// GitHub repository provider.
pub struct GitHubProvider {
    config: ProviderConfig,
    client: Client,
    api_base: String,
    auth: String,
    owner: String,
    repo: String,
    branch: Option<String>,
    root: String,
}

impl GitHubProvider {
    /// Create a new GitHub provider.
    ///
    /// # Errors
    /// - Configuration is not repository-style
    /// - HTTP client cannot be built
    pub fn new(config: ProviderConfig, options: &ProviderOptions) -> Result<Self> {
        let ProviderSettings::Repository {
            token,
            owner,
            repo,
            branch,
            path,
            endpoint,
        } = &config.settings
        else {
            return Err(Error::Configuration(format!(
                "provider '{}' requires repository settings, got {}",
                config.name,
                config.kind()
            )));
        };

        let api_base = endpoint
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let root = path
            .as_deref()
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        Ok(Self {
            client: build_client(options.timeout)?,
            api_base,
            auth: format!("token {}", token),
            owner: owner.clone(),
            repo: repo.clone(),
            branch: branch.clone().filter(|b| !b.is_empty()),
            root,
            config,
        })
    }

    fn repo_url(&self) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_base,
            utf8_percent_encode(&self.owner, SEGMENT),
            utf8_percent_encode(&self.repo, SEGMENT)
        )
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
            .collect();
        if encoded.is_empty() {
            format!("{}/contents", self.repo_url())
        } else {
            format!("{}/contents/{}", self.repo_url(), encoded.join("/"))
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(header::AUTHORIZATION, &self.auth)
    }

    fn contents_request(&self, path: &str, accept: &str) -> RequestBuilder {
        let mut request = self
            .authorized(self.client.get(self.contents_url(path)))
            .header(header::ACCEPT, accept);
        if let Some(branch) = &self.branch {
            request = request.query(&[("ref", branch)]);
        }
        request
    }

    /// List one directory: subdirectories and images under the root.
    async fn read_dir(&self, path: &str) -> Result<(Vec<String>, Vec<ImageInfo>)> {
        let request = self.contents_request(path, ACCEPT_JSON);
        let items: Vec<ContentItem> =
            handle_response(send(request, "list directory").await?).await?;

        let mut dirs = Vec::new();
        let mut images = Vec::new();
        for item in items {
            match item.kind.as_str() {
                "dir" => dirs.push(item.path),
                "file" if item.path.starts_with(&self.root) && is_image_path(&item.path) => {
                    images.push(content_to_image(item));
                }
                _ => {}
            }
        }
        Ok((dirs, images))
    }

    async fn fetch(&self, image: &ImageInfo, destination: &Path) -> Result<u64> {
        if !image.url.is_empty() {
            return download_to(self.authorized(self.client.get(&image.url)), destination).await;
        }
        let path = image
            .metadata
            .get("path")
            .ok_or_else(|| Error::InvalidInput(format!("No location for {}", image.filename)))?;
        download_to(self.contents_request(path, ACCEPT_RAW), destination).await
    }

    /// SHA of an existing file, needed to overwrite it.
    async fn existing_sha(&self, path: &str) -> Result<Option<String>> {
        let response = send(self.contents_request(path, ACCEPT_JSON), "look up file").await?;
        match check_status(response).await {
            Ok(response) => {
                let item: ContentItem = response
                    .json()
                    .await
                    .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))?;
                Ok(item.sha)
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, local_path: &Path, remote_path: Option<&str>) -> Result<UploadResult> {
        let filename = local_path
            .file_name()
            .ok_or_else(|| Error::InvalidInput("Upload path has no file name".to_string()))?
            .to_string_lossy()
            .into_owned();
        let target = match remote_path {
            Some(remote) => remote.trim_matches('/').to_string(),
            None if self.root.is_empty() => filename.clone(),
            None => format!("{}/{}", self.root, filename),
        };

        let data = tokio::fs::read(local_path).await?;
        let body = PutContent {
            message: format!("Upload {}", filename),
            content: STANDARD.encode(&data),
            branch: self.branch.as_deref(),
            sha: self.existing_sha(&target).await?,
        };
        let request = self
            .authorized(self.client.put(self.contents_url(&target)))
            .header(header::ACCEPT, ACCEPT_JSON)
            .json(&body);
        let response: PutResponse = handle_response(send(request, "upload file").await?).await?;

        let info = response.content;
        let url = info.download_url.or(info.html_url);
        let mut result = UploadResult::ok(url, format!("Uploaded to {}", info.path))
            .with_meta("path", info.path);
        if let Some(sha) = info.sha {
            result = result.with_meta("sha", sha);
        }
        Ok(result)
    }
}

fn content_to_image(item: ContentItem) -> ImageInfo {
    let filename = item
        .path
        .rsplit('/')
        .next()
        .unwrap_or(item.path.as_str())
        .to_string();
    let mut info = ImageInfo::new(item.download_url.unwrap_or_default(), filename);
    if let Some(size) = item.size {
        info = info.with_size(size);
    }
    if let Some(sha) = item.sha {
        info = info.with_meta("sha", sha);
    }
    info.with_meta("path", item.path)
}

#[async_trait]
impl ImageProvider for GitHubProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn test_connection(&self) -> bool {
        let request = self
            .authorized(self.client.get(self.repo_url()))
            .header(header::ACCEPT, ACCEPT_JSON)
            .timeout(PROBE_TIMEOUT);
        match tokio::time::timeout(PROBE_TIMEOUT, send(request, "probe repository")).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                error!("GitHub connection test failed: {}", e);
                false
            }
            Err(_) => {
                error!("GitHub connection test timed out");
                false
            }
        }
    }

    fn list_images(&self, limit: Option<usize>) -> ImageStream<'_> {
        let walk = Walk {
            pending: vec![self.root.clone()],
            ready: VecDeque::new(),
        };

        let images = stream::unfold(walk, move |mut walk| async move {
            loop {
                if let Some(image) = walk.ready.pop_front() {
                    return Some((image, walk));
                }
                let dir = walk.pending.pop()?;
                match self.read_dir(&dir).await {
                    Ok((dirs, images)) => {
                        walk.pending.extend(dirs.into_iter().rev());
                        walk.ready.extend(images);
                    }
                    Err(e) => {
                        warn!("Skipping directory '{}' of {}: {}", dir, self.name(), e);
                    }
                }
            }
        });

        limited(images.boxed(), limit)
    }

    async fn download_image(&self, image: &ImageInfo, destination: &Path) -> bool {
        match self.fetch(image, destination).await {
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
        match self.put(local_path, remote_path).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to upload {}: {}", local_path.display(), e);
                UploadResult::failed(e.to_string())
            }
        }
    }

    async fn get_image_count(&self) -> Option<u64> {
        Some(self.list_images(None).count().await as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer, root: Option<&str>) -> GitHubProvider {
        let config = ProviderConfig::new(
            "github",
            true,
            ProviderSettings::Repository {
                token: "ghp_test".to_string(),
                owner: "me".to_string(),
                repo: "pics".to_string(),
                branch: Some("main".to_string()),
                path: root.map(str::to_string),
                endpoint: Some(server.uri()),
            },
        );
        GitHubProvider::new(config, &ProviderOptions::default()).unwrap()
    }

    fn file(path: &str, base: &str) -> serde_json::Value {
        json!({
            "path": path,
            "type": "file",
            "size": 4,
            "sha": format!("sha-{}", path),
            "download_url": format!("{}/raw/{}", base, path)
        })
    }

    async fn mount_tree(server: &MockServer) {
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/repos/me/pics/contents/img"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                file("img/a.png", &base),
                { "path": "img/sub", "type": "dir" },
                file("img/readme.md", &base),
                file("img/z.jpg", &base),
            ])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/me/pics/contents/img/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                file("img/sub/b.gif", &base),
            ])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_connection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/me/pics"))
            .and(header_eq("Authorization", "token ghp_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
            .mount(&server)
            .await;

        assert!(provider_for(&server, None).test_connection().await);
    }

    #[tokio::test]
    async fn test_listing_walks_subdirectories() {
        let server = MockServer::start().await;
        mount_tree(&server).await;

        let provider = provider_for(&server, Some("img/"));
        let images: Vec<ImageInfo> = provider.list_images(None).collect().await;
        let paths: Vec<&str> = images.iter().map(|i| i.metadata["path"].as_str()).collect();

        assert_eq!(paths, vec!["img/a.png", "img/z.jpg", "img/sub/b.gif"]);
        assert_eq!(images[0].filename, "a.png");
        assert_eq!(images[0].metadata["sha"], "sha-img/a.png");
        assert_eq!(provider.get_image_count().await, Some(3));

        let limited: Vec<ImageInfo> = provider.list_images(Some(1)).collect().await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_directory_is_skipped() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/repos/me/pics/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "path": "broken", "type": "dir" },
                file("top.png", &base),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/me/pics/contents/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = provider_for(&server, None);
        let images: Vec<ImageInfo> = provider.list_images(None).collect().await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, "top.png");
    }

    #[tokio::test]
    async fn test_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/raw/img/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = provider_for(&server, None);
        let image = ImageInfo::new(format!("{}/raw/img/a.png", server.uri()), "a.png");
        let dest = temp.path().join("github/a.png");

        assert!(provider.download_image(&image, &dest).await);
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_upload_creates_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/me/pics/contents/img/new.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/me/pics/contents/img/new.png"))
            .and(body_partial_json(json!({
                "content": STANDARD.encode(b"fresh"),
                "branch": "main"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "content": {
                    "path": "img/new.png",
                    "sha": "abc123",
                    "download_url": "https://raw.example/img/new.png"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let local = temp.path().join("new.png");
        std::fs::write(&local, b"fresh").unwrap();

        let provider = provider_for(&server, Some("img"));
        let result = provider.upload_image(&local, None).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.url.as_deref(), Some("https://raw.example/img/new.png"));
        assert_eq!(result.metadata["sha"], "abc123");
    }

    #[tokio::test]
    async fn test_upload_overwrites_with_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/me/pics/contents/old.png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "path": "old.png", "type": "file", "sha": "prev"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/me/pics/contents/old.png"))
            .and(body_partial_json(json!({ "sha": "prev" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": { "path": "old.png", "sha": "next" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let local = temp.path().join("local.png");
        std::fs::write(&local, b"v2").unwrap();

        let provider = provider_for(&server, None);
        let result = provider.upload_image(&local, Some("/old.png")).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.metadata["path"], "old.png");
    }

    #[tokio::test]
    async fn test_upload_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let local = temp.path().join("x.png");
        std::fs::write(&local, b"x").unwrap();

        let result = provider_for(&server, None).upload_image(&local, None).await;
        assert!(!result.success);
        assert!(result.message.contains("Permission denied"));
    }
}
