//! Hugging Face Hub 文件列表接口。
//!
//! 只负责一次性拉取仓库 tree（跟随分页），不做重试；失败按状态码归类为
//! 仓库不存在 / 无权限 / 网络错误，交由调用方决定是否重新运行。

use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, LINK, USER_AGENT};
use tracing::{debug, info};

use crate::download::error::{FetchError, FetchResult};
use crate::download::models::{FileListing, RepoFile, RepositoryRef};

/// 仓库文件列表来源。规划阶段只依赖此 trait，便于用内存数据测试。
pub trait RepoLister {
    fn list_files(&self, repo: &RepositoryRef) -> FetchResult<FileListing>;
}

/// tree 接口与 resolve 下载地址的拼接规则。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEndpoints {
    base: Url,
    revision: String,
}

impl HubEndpoints {
    pub fn new(endpoint: &str, revision: &str) -> anyhow::Result<Self> {
        let base = Url::parse(endpoint.trim())
            .with_context(|| format!("invalid endpoint: {endpoint}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("endpoint 不是合法的 http(s) 地址: {endpoint}"));
        }
        let revision = revision.trim();
        if revision.is_empty() {
            return Err(anyhow!("revision 不能为空"));
        }
        Ok(Self {
            base,
            revision: revision.to_string(),
        })
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn tree_url(&self, repo: &RepositoryRef) -> Url {
        let mut url = self.with_segments([
            "api",
            "models",
            repo.owner.as_str(),
            repo.name.as_str(),
            "tree",
            self.revision.as_str(),
        ]);
        url.set_query(Some("recursive=true"));
        url
    }

    pub fn resolve_url(&self, repo: &RepositoryRef, file_path: &str) -> String {
        let head = [
            repo.owner.as_str(),
            repo.name.as_str(),
            "resolve",
            self.revision.as_str(),
        ];
        self.with_segments(head.into_iter().chain(file_path.split('/')))
            .to_string()
    }

    fn with_segments<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub endpoints: HubEndpoints,
    pub request_timeout: Duration,
    pub token: Option<String>,
    pub user_agent: String,
}

pub struct HubClient {
    client: Client,
    config: HubConfig,
}

impl HubClient {
    pub fn new(config: HubConfig) -> anyhow::Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or(HeaderValue::from_static("hf-shard-downloader")),
        );
        if let Some(token) = config.token.as_deref() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("hf token contains invalid header characters")?;
            value.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn endpoints(&self) -> &HubEndpoints {
        &self.config.endpoints
    }

    fn fetch_page(&self, repo: &RepositoryRef, url: &Url) -> FetchResult<Response> {
        debug!(target: "listing", %url, "请求仓库文件列表");
        let resp = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| network_error(repo, e.to_string()))?;
        classify_status(repo, resp)
    }
}

impl RepoLister for HubClient {
    fn list_files(&self, repo: &RepositoryRef) -> FetchResult<FileListing> {
        let mut files = Vec::new();
        let mut next = Some(self.config.endpoints.tree_url(repo));
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            let resp = self.fetch_page(repo, &url)?;
            next = next_page_url(resp.headers());
            let body = resp
                .text()
                .map_err(|e| network_error(repo, format!("读取响应失败: {e}")))?;
            let page: Vec<RepoFile> = serde_json::from_str(&body).map_err(|e| {
                let snippet: String = body.chars().take(120).collect();
                network_error(repo, format!("解析文件列表失败: {e}（响应开头: {snippet}）"))
            })?;
            pages += 1;
            files.extend(page);
        }

        let listing = FileListing::new(files);
        info!(
            target: "listing",
            repo = %repo,
            revision = self.config.endpoints.revision(),
            entries = listing.files.len(),
            files = listing.len(),
            pages,
            "已获取仓库文件列表"
        );
        Ok(listing)
    }
}

fn network_error(repo: &RepositoryRef, message: String) -> FetchError {
    FetchError::NetworkError {
        repo: repo.id(),
        message,
    }
}

fn classify_status(repo: &RepositoryRef, resp: Response) -> FetchResult<Response> {
    let status = resp.status();
    debug!(target: "listing", status = status.as_u16(), "文件列表响应状态");
    match status.as_u16() {
        404 => Err(FetchError::RepositoryNotFound { repo: repo.id() }),
        401 | 403 => Err(FetchError::AccessDenied {
            repo: repo.id(),
            status: status.as_u16(),
        }),
        _ if !status.is_success() => Err(network_error(repo, format!("HTTP {status}"))),
        _ => Ok(resp),
    }
}

/// 解析 `Link: <url>; rel="next"` 分页头。
fn next_page_url(headers: &HeaderMap) -> Option<Url> {
    let raw = headers.get(LINK)?.to_str().ok()?;
    raw.split(',').find_map(|part| {
        let (target, params) = part.trim().split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| matches!(p.trim(), "rel=\"next\"" | "rel=next"));
        if !is_next {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Url::parse(target).ok()
    })
}
