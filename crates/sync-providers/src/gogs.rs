//! Gogs provider client: the legacy Gogs REST API returns an organization's
//! repositories in a single response with no pagination indicator, so this
//! client fetches exactly one page per call. Gogs also has no published
//! rate-limit headers; the generic retry budget still applies to transient
//! transport failures.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use sync_retry::RetryStrategyConfig;
use sync_types::{AuthMode, CancellationToken, PlatformConfig, Repository, Visibility};

use crate::http::{self, GENERIC_RATE_LIMIT_HEADERS};
use crate::{ProviderClient, https_token_url};

pub struct GogsClient {
    http: Client,
    base_url: String,
    token: String,
    skip_archived: bool,
    skip_forked: bool,
    retry: RetryStrategyConfig,
}

impl GogsClient {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("Gogs requires an explicit base_url (no public SaaS default)")?;

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
            req.query(&[("token", self.token.as_str())])
        }
    }
}

impl ProviderClient for GogsClient {
    fn list_repositories(&self, ctx: &CancellationToken, org: &str) -> Result<Vec<Repository>> {
        if ctx.is_cancelled() {
            bail!("cancelled before listing repositories for org {org}");
        }

        let url = format!(
            "{}/api/v1/orgs/{org}/repos",
            self.base_url.trim_end_matches('/')
        );

        let client = &self.http;
        let resp = http::fetch_page_with_retry(ctx, &self.retry, &GENERIC_RATE_LIMIT_HEADERS, || {
            self.authed(client.get(&url)).send()
        })?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("authentication rejected by Gogs for org {org}: {}", resp.status());
            }
            StatusCode::NOT_FOUND => bail!("organization not found: {org}"),
            s => bail!("unexpected status while listing {org} repositories: {s}"),
        }

        let repos: Vec<GogsRepo> = resp
            .json()
            .context("failed to parse Gogs repository list JSON")?;

        Ok(repos
            .into_iter()
            .map(GogsRepo::into_repository)
            .filter(|r| !(self.skip_archived && r.archived))
            .filter(|r| !(self.skip_forked && r.fork))
            .collect())
    }

    fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let url = format!(
            "{}/api/v1/repos/{owner}/{name}",
            self.base_url.trim_end_matches('/')
        );
        let resp = self.authed(self.http.get(&url)).send().context("Gogs repository request failed")?;

        match resp.status() {
            StatusCode::OK => {
                let repo: GogsRepo = resp.json().context("failed to parse Gogs repository JSON")?;
                Ok(Some(repo.into_repository()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("authentication rejected by Gogs for {owner}/{name}: {}", resp.status())
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

/// Gogs' API predates `archived`/`fork`/`topics`/`language` fields in some
/// deployments; they are treated as optional and default to the
/// least-surprising value (not archived, not a fork, no language/topics).
#[derive(Debug, Deserialize)]
struct GogsRepo {
    full_name: String,
    name: String,
    clone_url: String,
    ssh_url: String,
    private: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    fork: bool,
}

impl GogsRepo {
    fn into_repository(self) -> Repository {
        let owner = self
            .full_name
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Repository {
            provider: sync_types::ProviderKind::Gogs,
            owner,
            name: self.name,
            https_clone_url: self.clone_url,
            ssh_clone_url: self.ssh_url,
            default_branch: "master".to_string(),
            visibility: if self.private {
                Visibility::Private
            } else {
                Visibility::Public
            },
            archived: self.archived,
            fork: self.fork,
            language: None,
            size_kb: 0,
            stars: 0,
            topics: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tiny_http::{Response, Server};

    fn test_config(base_url: String) -> PlatformConfig {
        PlatformConfig {
            provider: sync_types::ProviderKind::Gogs,
            base_url: Some(base_url),
            token: "gogs-token".into(),
            organizations: vec!["acme".into()],
            recursive: false,
            skip_archived: false,
            skip_forked: false,
        }
    }

    #[test]
    fn list_repositories_parses_flat_response() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let body = serde_json::json!([{
            "full_name": "acme/legacy-app",
            "name": "legacy-app",
            "clone_url": "https://git.example.com/acme/legacy-app.git",
            "ssh_url": "git@git.example.com:acme/legacy-app.git",
            "private": true,
        }])
        .to_string();

        let handle = thread::spawn(move || {
            let req = server.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert!(req.url().contains("token=gogs-token"));
            let resp = Response::from_string(body)
                .with_header(tiny_http::Header::from_bytes("Content-Type", "application/json").unwrap());
            req.respond(resp).expect("respond");
        });

        let client = GogsClient::new(&test_config(addr)).expect("client");
        let ctx = CancellationToken::new();
        let repos = client.list_repositories(&ctx, "acme").expect("list");

        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].visibility, Visibility::Private);
        handle.join().expect("join");
    }

    #[test]
    fn new_requires_base_url() {
        let config = PlatformConfig {
            provider: sync_types::ProviderKind::Gogs,
            base_url: None,
            token: String::new(),
            organizations: vec![],
            recursive: false,
            skip_archived: false,
            skip_forked: false,
        };
        assert!(GogsClient::new(&config).is_err());
    }
}
