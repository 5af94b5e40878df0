//! Gitea provider client: REST API v1, page-counter pagination (stops at the
//! first short page), GitHub-compatible rate-limit headers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use sync_retry::RetryStrategyConfig;
use sync_types::{AuthMode, CancellationToken, PlatformConfig, Repository, Visibility};

use crate::http::{self, GENERIC_RATE_LIMIT_HEADERS};
use crate::{ProviderClient, https_token_url};

const PAGE_LIMIT: u32 = 50;

pub struct GiteaClient {
    http: Client,
    base_url: String,
    token: String,
    skip_archived: bool,
    skip_forked: bool,
    retry: RetryStrategyConfig,
}

impl GiteaClient {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("Gitea requires an explicit base_url (no public SaaS default)")?;

        Ok(Self {
            http: http::build_client(concat!("sync-engine/", env!("CARGO_PKG_VERSION")))?,
            base_url,
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
            req.header("Authorization", format!("token {}", self.token))
        }
    }
}

impl ProviderClient for GiteaClient {
    fn list_repositories(&self, ctx: &CancellationToken, org: &str) -> Result<Vec<Repository>> {
        let mut out = Vec::new();
        let mut page = 1u32;

        loop {
            if ctx.is_cancelled() {
                bail!("cancelled while listing repositories for org {org}");
            }

            let url = format!(
                "{}/api/v1/orgs/{org}/repos?limit={PAGE_LIMIT}&page={page}",
                self.base_url.trim_end_matches('/')
            );

            let client = &self.http;
            let resp = http::fetch_page_with_retry(ctx, &self.retry, &GENERIC_RATE_LIMIT_HEADERS, || {
                self.authed(client.get(&url)).send()
            })?;

            match resp.status() {
                StatusCode::OK => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    bail!("authentication rejected by Gitea for org {org}: {}", resp.status());
                }
                StatusCode::NOT_FOUND => bail!("organization not found: {org}"),
                s => bail!("unexpected status while listing {org} repositories: {s}"),
            }

            let page_repos: Vec<GiteaRepo> = resp
                .json()
                .context("failed to parse Gitea repository list JSON")?;
            let returned = page_repos.len() as u32;

            for repo in page_repos {
                let repository = repo.into_repository();
                if self.skip_archived && repository.archived {
                    continue;
                }
                if self.skip_forked && repository.fork {
                    continue;
                }
                out.push(repository);
            }

            if returned < PAGE_LIMIT {
                break;
            }
            page += 1;
        }

        Ok(out)
    }

    fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let url = format!(
            "{}/api/v1/repos/{owner}/{name}",
            self.base_url.trim_end_matches('/')
        );
        let resp = self.authed(self.http.get(&url)).send().context("Gitea repository request failed")?;

        match resp.status() {
            StatusCode::OK => {
                let repo: GiteaRepo = resp.json().context("failed to parse Gitea repository JSON")?;
                Ok(Some(repo.into_repository()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("authentication rejected by Gitea for {owner}/{name}: {}", resp.status())
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
struct GiteaRepo {
    full_name: String,
    name: String,
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
    #[serde(default, rename = "stars_count")]
    stars_count: u64,
    #[serde(default)]
    topics: Vec<String>,
    updated_at: DateTime<Utc>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GiteaRepo {
    fn into_repository(self) -> Repository {
        let owner = self
            .full_name
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Repository {
            provider: sync_types::ProviderKind::Gitea,
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
            stars: self.stars_count,
            topics: self.topics,
            updated_at: self.updated_at,
        }
    }
}
