//! GitHub provider client: REST API v3, `Link`-header pagination, standard
//! `x-ratelimit-*` quota headers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use sync_retry::RetryStrategyConfig;
use sync_types::{AuthMode, CancellationToken, PlatformConfig, Repository, Visibility};

use crate::http::{self, GITHUB_RATE_LIMIT_HEADERS};
use crate::{ProviderClient, https_token_url};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const PER_PAGE: u32 = 100;

pub struct GitHubClient {
    http: Client,
    base_url: String,
    token: String,
    skip_archived: bool,
    skip_forked: bool,
    retry: RetryStrategyConfig,
}

impl GitHubClient {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            http: http::build_client(concat!("sync-engine/", env!("CARGO_PKG_VERSION")))?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token: config.token.clone(),
            skip_archived: config.skip_archived,
            skip_forked: config.skip_forked,
            retry: RetryStrategyConfig::provider_page_default(),
        })
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }
}

impl ProviderClient for GitHubClient {
    fn list_repositories(&self, ctx: &CancellationToken, org: &str) -> Result<Vec<Repository>> {
        let mut out = Vec::new();
        let mut url = format!(
            "{}/orgs/{org}/repos?per_page={PER_PAGE}&type=all",
            self.base_url.trim_end_matches('/')
        );

        loop {
            if ctx.is_cancelled() {
                bail!("cancelled while listing repositories for org {org}");
            }

            let client = &self.http;
            let request_url = url.clone();
            let resp = http::fetch_page_with_retry(ctx, &self.retry, &GITHUB_RATE_LIMIT_HEADERS, || {
                self.authed(client.get(&request_url)).send()
            })?;

            match resp.status() {
                StatusCode::OK => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    bail!("authentication rejected by GitHub for org {org}: {}", resp.status());
                }
                StatusCode::NOT_FOUND => bail!("organization not found: {org}"),
                s => bail!("unexpected status while listing {org} repositories: {s}"),
            }

            let next = http::parse_link_header_next(resp.headers());
            let page: Vec<GitHubRepo> = resp
                .json()
                .context("failed to parse GitHub repository list JSON")?;

            for repo in page {
                let repository = repo.into_repository();
                if self.skip_archived && repository.archived {
                    continue;
                }
                if self.skip_forked && repository.fork {
                    continue;
                }
                out.push(repository);
            }

            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }

        Ok(out)
    }

    fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let url = format!("{}/repos/{owner}/{name}", self.base_url.trim_end_matches('/'));
        let resp = self.authed(self.http.get(&url)).send().context("GitHub repository request failed")?;

        match resp.status() {
            StatusCode::OK => {
                let repo: GitHubRepo = resp.json().context("failed to parse GitHub repository JSON")?;
                Ok(Some(repo.into_repository()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("authentication rejected by GitHub for {owner}/{name}: {}", resp.status())
            }
            s => bail!("unexpected status while fetching {owner}/{name}: {s}"),
        }
    }

    fn clone_url(&self, repo: &Repository, auth_mode: AuthMode) -> String {
        match auth_mode {
            AuthMode::HttpsToken => https_token_url(&repo.https_clone_url, &self.token),
            AuthMode::Ssh => repo.ssh_clone_url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    full_name: String,
    name: String,
    owner: GitHubOwner,
    clone_url: String,
    ssh_url: String,
    #[serde(default = "default_branch")]
    default_branch: String,
    private: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    fork: bool,
    language: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "stargazers_count")]
    stargazers_count: u64,
    #[serde(default)]
    topics: Vec<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GitHubOwner {
    #[allow(dead_code)]
    login: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GitHubRepo {
    fn into_repository(self) -> Repository {
        let owner = self
            .full_name
            .split('/')
            .next()
            .unwrap_or(&self.owner.login)
            .to_string();

        Repository {
            provider: sync_types::ProviderKind::GitHub,
            owner,
            name: self.name,
            https_clone_url: self.clone_url,
            ssh_clone_url: self.ssh_url,
            default_branch: self.default_branch,
            visibility: if self.private {
                Visibility::Private
            } else {
                Visibility::Public
            },
            archived: self.archived,
            fork: self.fork,
            language: self.language,
            size_kb: self.size,
            stars: self.stargazers_count,
            topics: self.topics,
            updated_at: self.updated_at,
        }
    }
}
