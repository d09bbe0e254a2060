//! WebDAV storage driver.
//!
//! Speaks plain HTTP against the collection given by the configured base
//! URL, authenticated with basic credentials. "Not found" is recognized from
//! the 404 status of the response; 401/403 map to auth errors.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{run_cancellable, DriverKind, StorageDriver};
use crate::core::models::WebDavConfig;
use crate::error::{Result, SyncError};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

pub struct WebDavDriver {
    name: String,
    config: WebDavConfig,
    client: Client,
}

impl WebDavDriver {
    pub fn new(name: String, config: WebDavConfig) -> Self {
        Self {
            name,
            config,
            client: Client::new(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url_for(path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn send(&self, request: RequestBuilder, op: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Storage(format!("webdav {op}: {e}")))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Auth(format!(
                "webdav {op}: status {}",
                response.status()
            ))),
            _ => Ok(response),
        }
    }

    /// MKCOL every collection above `path` that the server reports missing.
    /// 405 means the collection already exists.
    async fn ensure_collections(&self, path: &str) -> Result<()> {
        let Some((dirs, _file)) = path.rsplit_once('/') else {
            return Ok(());
        };

        let mut prefix = String::new();
        for segment in dirs.split('/').filter(|s| !s.is_empty()) {
            prefix.push_str(segment);
            prefix.push('/');
            let response = self.send(self.request(mkcol(), &prefix), "mkcol").await?;
            match response.status() {
                status if status.is_success() => {}
                StatusCode::METHOD_NOT_ALLOWED => {}
                status => {
                    return Err(SyncError::Storage(format!(
                        "webdav mkcol {prefix}: status {status}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn put(&self, path: &str, data: &Bytes) -> Result<StatusCode> {
        let response = self
            .send(self.request(Method::PUT, path).body(data.clone()), "upload")
            .await?;
        Ok(response.status())
    }
}

#[async_trait]
impl StorageDriver for WebDavDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Webdav
    }

    async fn upload(&self, path: &str, data: Bytes, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            let status = self.put(path, &data).await?;
            if status.is_success() {
                return Ok(());
            }

            // Some servers refuse a PUT into a collection that does not
            // exist yet; create the intermediate collections and retry once.
            if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
                self.ensure_collections(path).await?;
                let retried = self.put(path, &data).await?;
                if retried.is_success() {
                    return Ok(());
                }
                return Err(SyncError::Storage(format!(
                    "webdav upload {path}: status {retried}"
                )));
            }

            Err(SyncError::Storage(format!(
                "webdav upload {path}: status {status}"
            )))
        })
        .await
    }

    async fn download(&self, path: &str, cancel: &CancellationToken) -> Result<Bytes> {
        run_cancellable(cancel, async {
            let response = self.send(self.request(Method::GET, path), "download").await?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(SyncError::NotFound(path.to_string())),
                status if status.is_success() => response
                    .bytes()
                    .await
                    .map_err(|e| SyncError::Storage(format!("webdav download {path}: {e}"))),
                status => Err(SyncError::Storage(format!(
                    "webdav download {path}: status {status}"
                ))),
            }
        })
        .await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            let response = self.send(self.request(Method::DELETE, path), "delete").await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(()),
                status if status.is_success() => Ok(()),
                status => Err(SyncError::Storage(format!(
                    "webdav delete {path}: status {status}"
                ))),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        run_cancellable(cancel, async {
            let dir = if prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", prefix.trim_end_matches('/'))
            };

            let request = self
                .request(propfind(), &dir)
                .header("Depth", "1")
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(PROPFIND_BODY);
            let response = self.send(request, "propfind").await?;

            match response.status() {
                StatusCode::NOT_FOUND => Ok(Vec::new()),
                status if status.is_success() => {
                    let body = response
                        .text()
                        .await
                        .map_err(|e| SyncError::Storage(format!("webdav propfind: {e}")))?;
                    let files = parse_multistatus_files(&body);
                    debug!(target = %self.name, count = files.len(), "webdav listing");
                    Ok(files)
                }
                status => Err(SyncError::Storage(format!(
                    "webdav propfind {dir}: status {status}"
                ))),
            }
        })
        .await
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool> {
        run_cancellable(cancel, async {
            let response = self.send(self.request(Method::HEAD, path), "stat").await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(false),
                status if status.is_success() => Ok(true),
                status => Err(SyncError::Storage(format!(
                    "webdav stat {path}: status {status}"
                ))),
            }
        })
        .await
    }

    async fn size(&self, path: &str, cancel: &CancellationToken) -> Result<u64> {
        run_cancellable(cancel, async {
            let response = self.send(self.request(Method::HEAD, path), "stat").await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(0),
                status if status.is_success() => {
                    let length = response
                        .headers()
                        .get(reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    Ok(length)
                }
                status => Err(SyncError::Storage(format!(
                    "webdav stat {path}: status {status}"
                ))),
            }
        })
        .await
    }

    async fn range_read(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        run_cancellable(cancel, async {
            let end = offset + length - 1;
            let request = self
                .request(Method::GET, path)
                .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"));
            let response = self.send(request, "range read").await?;

            match response.status() {
                StatusCode::NOT_FOUND => Err(SyncError::NotFound(path.to_string())),
                StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
                StatusCode::PARTIAL_CONTENT => response
                    .bytes()
                    .await
                    .map_err(|e| SyncError::Storage(format!("webdav range read {path}: {e}"))),
                // Server ignored the Range header; slice the full body.
                StatusCode::OK => {
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| SyncError::Storage(format!("webdav range read {path}: {e}")))?;
                    let start = (offset as usize).min(body.len());
                    let stop = (offset.saturating_add(length) as usize).min(body.len());
                    Ok(body.slice(start..stop))
                }
                status => Err(SyncError::Storage(format!(
                    "webdav range read {path}: status {status}"
                ))),
            }
        })
        .await
    }
}

fn propfind() -> Method {
    Method::from_bytes(b"PROPFIND").expect("static method name")
}

fn mkcol() -> Method {
    Method::from_bytes(b"MKCOL").expect("static method name")
}

/// Pull the file names out of a PROPFIND multistatus body. Collections end
/// with a slash and are filtered out, including the listed directory itself.
fn parse_multistatus_files(xml: &str) -> Vec<String> {
    let mut files = Vec::new();
    for chunk in xml.split('<') {
        let Some((tag, text)) = chunk.split_once('>') else {
            continue;
        };
        if tag.starts_with('/') {
            continue;
        }
        let name = tag
            .split_whitespace()
            .next()
            .unwrap_or(tag)
            .rsplit(':')
            .next()
            .unwrap_or(tag);
        if !name.eq_ignore_ascii_case("href") {
            continue;
        }
        let href = text.trim();
        if href.is_empty() || href.ends_with('/') {
            continue;
        }
        if let Some(file) = href.rsplit('/').next() {
            if !file.is_empty() {
                files.push(file.to_string());
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multistatus_hrefs() {
        let body = r#"<?xml version="1.0"?>
            <D:multistatus xmlns:D="DAV:">
              <D:response>
                <D:href>/backups/</D:href>
              </D:response>
              <D:response>
                <D:href>/backups/vaultwarden-backup-20240501-120000.zip</D:href>
              </D:response>
              <D:response>
                <D:href>/backups/vaultwarden-backup-20240502-120000.enc</D:href>
              </D:response>
              <D:response>
                <D:href>/backups/nested/</D:href>
              </D:response>
            </D:multistatus>"#;

        let files = parse_multistatus_files(body);
        assert_eq!(
            files,
            vec![
                "vaultwarden-backup-20240501-120000.zip".to_string(),
                "vaultwarden-backup-20240502-120000.enc".to_string(),
            ]
        );
    }

    #[test]
    fn empty_body_yields_no_files() {
        assert!(parse_multistatus_files("").is_empty());
        assert!(parse_multistatus_files("<d:multistatus/>").is_empty());
    }

    #[test]
    fn joins_urls_without_doubled_slashes() {
        let driver = WebDavDriver::new(
            "dav".into(),
            WebDavConfig {
                url: "https://dav.example.com/backups/".into(),
                username: "u".into(),
                password: "p".into(),
            },
        );
        assert_eq!(
            driver.url_for("/archive.zip"),
            "https://dav.example.com/backups/archive.zip"
        );
        assert_eq!(
            driver.url_for("archive.zip"),
            "https://dav.example.com/backups/archive.zip"
        );
    }
}
