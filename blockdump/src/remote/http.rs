//! HTTP client for the Notion-style REST content API.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use super::{FileBody, RemoteClient};
use crate::config::RemoteConfig;
use crate::model::{BlockNode, ChildrenPage, PageInfo};
use crate::utils::errors::RemoteError;

const PAGE_SIZE: usize = 100;

pub struct HttpClient {
    http: reqwest::Client,
    call_timeout: Duration,
    base_url: String,
    token: String,
    api_version: String,
}

impl HttpClient {
    /// Connects and idle reads are bounded by the call timeout. Only API
    /// calls get a total deadline; file bodies may take as long as they keep
    /// flowing.
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let call_timeout = config.call_timeout();
        let http = reqwest::Client::builder()
            .connect_timeout(call_timeout)
            .read_timeout(call_timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            call_timeout,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            api_version: config.api_version.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", &self.api_version)
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value, RemoteError> {
        let response = check_status(request.timeout(self.call_timeout).send().await?).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| RemoteError::InvalidRequest(format!("undecodable response: {e}")))
    }
}

/// Map non-success statuses onto the retry classification.
async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::REQUEST_TIMEOUT => RemoteError::Server {
            status: status.as_u16(),
            message,
        },
        s if s.is_server_error() => RemoteError::Server {
            status: s.as_u16(),
            message,
        },
        _ => RemoteError::InvalidRequest(format!("{status}: {message}")),
    })
}

fn block_from_wire(raw: &Value) -> Result<BlockNode, RemoteError> {
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::InvalidRequest("block without type".into()))?;
    Ok(BlockNode {
        id: raw.get("id").and_then(Value::as_str).map(str::to_string),
        kind: kind.to_string(),
        payload: raw.get(kind).cloned().unwrap_or_else(|| json!({})),
        has_children: raw
            .get("has_children")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        children: Vec::new(),
        attachment: None,
    })
}

fn block_to_wire(node: &BlockNode) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("object".into(), json!("block"));
    obj.insert("type".into(), json!(node.kind));
    obj.insert(node.kind.clone(), node.payload.clone());
    Value::Object(obj)
}

fn title_from_properties(page: &Value) -> String {
    page.get("properties")
        .and_then(Value::as_object)
        .and_then(|props| {
            props
                .values()
                .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))
        })
        .and_then(|p| p.get("title").and_then(Value::as_array))
        .map(|parts| {
            parts
                .iter()
                .filter_map(|t| t.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "untitled".to_string())
}

#[async_trait]
impl RemoteClient for HttpClient {
    async fn fetch_page(&self, page_id: &str) -> Result<PageInfo, RemoteError> {
        let page = self
            .send_json(self.request(Method::GET, &format!("pages/{page_id}")))
            .await?;
        Ok(PageInfo {
            id: page
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(page_id)
                .to_string(),
            title: title_from_properties(&page),
        })
    }

    async fn fetch_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError> {
        let mut request = self
            .request(Method::GET, &format!("blocks/{block_id}/children"))
            .query(&[("page_size", PAGE_SIZE.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("start_cursor", cursor)]);
        }
        let body = self.send_json(request).await?;

        let blocks = body
            .get("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().map(block_from_wire).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        let next_cursor = if has_more {
            body.get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };
        Ok(ChildrenPage { blocks, next_cursor })
    }

    async fn fetch_file(&self, url: &str) -> Result<FileBody, RemoteError> {
        // Hosted file URLs are pre-signed; the API token must not leak to them.
        let response = check_status(self.http.get(url).send().await?).await?;
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RemoteError::from))
            .boxed();
        Ok(FileBody { media_type, stream })
    }

    async fn append_children(
        &self,
        parent_id: &str,
        children: &[BlockNode],
    ) -> Result<Vec<String>, RemoteError> {
        let payload = json!({
            "children": children.iter().map(block_to_wire).collect::<Vec<_>>(),
        });
        let body = self
            .send_json(
                self.request(Method::PATCH, &format!("blocks/{parent_id}/children"))
                    .json(&payload),
            )
            .await?;

        let ids: Vec<String> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        // The remote may echo pre-existing siblings; the new blocks are the tail.
        if ids.len() < children.len() {
            return Err(RemoteError::InvalidRequest(format!(
                "append returned {} ids for {} blocks",
                ids.len(),
                children.len()
            )));
        }
        Ok(ids[ids.len() - children.len()..].to_vec())
    }

    async fn update_block(&self, block_id: &str, block: &BlockNode) -> Result<(), RemoteError> {
        let mut obj = serde_json::Map::new();
        obj.insert(block.kind.clone(), block.payload.clone());
        self.send_json(
            self.request(Method::PATCH, &format!("blocks/{block_id}"))
                .json(&Value::Object(obj)),
        )
        .await?;
        Ok(())
    }
}
