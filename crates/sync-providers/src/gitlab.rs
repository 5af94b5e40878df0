//! GitLab provider client: REST API v4, `X-Next-Page` pagination header,
//! `RateLimit-*` quota headers, depth-first subgroup traversal when
//! `recursive` is set.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use sync_retry::RetryStrategyConfig;
use sync_types::{AuthMode, CancellationToken, PlatformConfig, Repository, Visibility};

use crate::http::{self, GENERIC_RATE_LIMIT_HEADERS};
use crate::{ProviderClient, https_token_url};

const DEFAULT_BASE_URL: &str = "https://gitlab.com/api/v4";
const PER_PAGE: u32 = 100;

pub struct GitLabClient {
    http: Client,
    base_url: String,
    token: String,
    recursive: bool,
    skip_archived: bool,
    skip_forked: bool,
    retry: RetryStrategyConfig,
}

impl GitLabClient {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            http: http::build_client(concat!("sync-engine/", env!("CARGO_PKG_VERSION")))?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token: config.token.clone(),
            recursive: config.recursive,
            skip_archived: config.skip_archived,
            skip_forked: config.skip_forked,
            retry: RetryStrategyConfig::provider_page_default(),
        })
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.header("PRIVATE-TOKEN", &self.token)
        }
    }

    fn list_group_projects(&self, ctx: &CancellationToken, group: &str) -> Result<Vec<Repository>> {
        let mut out = Vec::new();
        let encoded = urlencode_path(group);
        let mut page = 1u32;

        loop {
            if ctx.is_cancelled() {
                bail!("cancelled while listing projects for group {group}");
            }

            // Omit `archived` entirely unless we want to narrow the result set: GitLab
            // interprets `archived=true`/`archived=false` as "only archived"/"only
            // non-archived" respectively, not as an inclusion toggle, so requesting
            // everything means not sending the parameter at all.
            let archived_param = if self.skip_archived { "&archived=false" } else { "" };
            let url = format!(
                "{}/groups/{encoded}/projects?per_page={PER_PAGE}&page={page}&include_subgroups=false{archived_param}",
                self.base_url.trim_end_matches('/'),
            );

            let client = &self.http;
            let request_url = url.clone();
            let resp = http::fetch_page_with_retry(ctx, &self.retry, &GENERIC_RATE_LIMIT_HEADERS, || {
                self.authed(client.get(&request_url)).send()
            })?;

            match resp.status() {
                StatusCode::OK => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    bail!("authentication rejected by GitLab for group {group}: {}", resp.status());
                }
                StatusCode::NOT_FOUND => bail!("group not found: {group}"),
                s => bail!("unexpected status while listing {group} projects: {s}"),
            }

            let has_more = resp
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(|v| !v.is_empty())
                .unwrap_or(false);

            let projects: Vec<GitLabProject> = resp
                .json()
                .context("failed to parse GitLab project list JSON")?;

            if projects.is_empty() {
                break;
            }

            for project in projects {
                let repository = project.into_repository();
                if self.skip_forked && repository.fork {
                    continue;
                }
                out.push(repository);
            }

            if !has_more {
                break;
            }
            page += 1;
        }

        if self.recursive {
            for subgroup in self.list_subgroups(ctx, group)? {
                out.extend(self.list_group_projects(ctx, &subgroup)?);
            }
        }

        Ok(out)
    }

    fn list_subgroups(&self, ctx: &CancellationToken, group: &str) -> Result<Vec<String>> {
        let encoded = urlencode_path(group);
        let url = format!(
            "{}/groups/{encoded}/subgroups?per_page={PER_PAGE}",
            self.base_url.trim_end_matches('/')
        );

        let client = &self.http;
        let resp = http::fetch_page_with_retry(ctx, &self.retry, &GENERIC_RATE_LIMIT_HEADERS, || {
            self.authed(client.get(&url)).send()
        })?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(Vec::new()),
            s => bail!("unexpected status while listing subgroups of {group}: {s}"),
        }

        let subgroups: Vec<GitLabGroupRef> = resp
            .json()
            .context("failed to parse GitLab subgroup list JSON")?;
        Ok(subgroups.into_iter().map(|g| g.full_path).collect())
    }
}

fn urlencode_path(s: &str) -> String {
    s.replace('/', "%2F")
}

impl ProviderClient for GitLabClient {
    fn list_repositories(&self, ctx: &CancellationToken, org: &str) -> Result<Vec<Repository>> {
        self.list_group_projects(ctx, org)
    }

    fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let full_path = urlencode_path(&format!("{owner}/{name}"));
        let url = format!("{}/projects/{full_path}", self.base_url.trim_end_matches('/'));
        let resp = self.authed(self.http.get(&url)).send().context("GitLab project request failed")?;

        match resp.status() {
            StatusCode::OK => {
                let project: GitLabProject = resp.json().context("failed to parse GitLab project JSON")?;
                Ok(Some(project.into_repository()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("authentication rejected by GitLab for {owner}/{name}: {}", resp.status())
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
struct GitLabGroupRef {
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct GitLabProject {
    path_with_namespace: String,
    #[serde(default = "default_branch")]
    default_branch: String,
    http_url_to_repo: String,
    ssh_url_to_repo: String,
    visibility: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    forked_from_project: Option<serde_json::Value>,
    #[serde(default)]
    tag_list: Vec<String>,
    #[serde(default, rename = "star_count")]
    star_count: u64,
    last_activity_at: DateTime<Utc>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GitLabProject {
    fn into_repository(self) -> Repository {
        let mut parts = self.path_with_namespace.rsplitn(2, '/');
        let name = parts.next().unwrap_or_default().to_string();
        let owner = parts.next().unwrap_or_default().to_string();

        Repository {
            provider: sync_types::ProviderKind::GitLab,
            owner,
            name,
            https_clone_url: self.http_url_to_repo,
            ssh_clone_url: self.ssh_url_to_repo,
            default_branch: self.default_branch,
            visibility: match self.visibility.as_str() {
                "private" => Visibility::Private,
                "internal" => Visibility::Internal,
                _ => Visibility::Public,
            },
            archived: self.archived,
            fork: self.forked_from_project.is_some(),
            language: None,
            size_kb: 0,
            stars: self.star_count,
            topics: self.tag_list,
            updated_at: self.last_activity_at,
        }
    }
}
