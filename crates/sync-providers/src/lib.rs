//! Repository-discovery clients for the platforms the sync engine supports.
//!
//! Every platform implements the same [`ProviderClient`] contract so the
//! scheduler and orchestrator never branch on provider kind. Pagination,
//! rate-limit back-off, and retry are each platform's own responsibility
//! because the wire shapes (headers, cursors, status codes) differ, but all
//! four share the [`http`] module's primitives so the policies stay
//! consistent.

pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod gogs;
pub mod http;

use anyhow::Result;
use sync_types::{AuthMode, CancellationToken, PlatformConfig, Repository};

/// Capability set every provider client exposes. Callers are polymorphic
/// over this trait rather than matching on [`sync_types::ProviderKind`].
/// `Send + Sync` so a `Box<dyn ProviderClient>` can be shared across the
/// scheduler's worker threads.
pub trait ProviderClient: Send + Sync {
    /// Enumerate every repository visible to the configured credential in
    /// `org` (or group, for platforms that nest groups). Honors
    /// `ctx.is_cancelled()` between page fetches.
    fn list_repositories(&self, ctx: &CancellationToken, org: &str) -> Result<Vec<Repository>>;

    /// Fetch a single repository by owner/name. `Ok(None)` means the
    /// provider returned 404; errors are reserved for transport/auth
    /// failures.
    fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>>;

    /// Render a clone URL for `repo` under the requested `auth_mode`.
    fn clone_url(&self, repo: &Repository, auth_mode: AuthMode) -> String;
}

/// Construct the right [`ProviderClient`] implementation for `config.provider`.
pub fn client_for(config: &PlatformConfig) -> Result<Box<dyn ProviderClient>> {
    use sync_types::ProviderKind;

    match config.provider {
        ProviderKind::GitHub => Ok(Box::new(github::GitHubClient::new(config)?)),
        ProviderKind::GitLab => Ok(Box::new(gitlab::GitLabClient::new(config)?)),
        ProviderKind::Gitea => Ok(Box::new(gitea::GiteaClient::new(config)?)),
        ProviderKind::Gogs => Ok(Box::new(gogs::GogsClient::new(config)?)),
    }
}

/// HTTPS clone URL with the token injected as userinfo:
/// `https://<token>@host/owner/name.git`.
pub(crate) fn https_token_url(https_clone_url: &str, token: &str) -> String {
    if token.is_empty() {
        return https_clone_url.to_string();
    }
    match https_clone_url.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{token}@{rest}"),
        None => https_clone_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_token_url_injects_credential() {
        let url = https_token_url("https://github.com/octocat/hello.git", "ghp_abc123");
        assert_eq!(url, "https://ghp_abc123@github.com/octocat/hello.git");
    }

    #[test]
    fn https_token_url_passes_through_when_token_empty() {
        let url = https_token_url("https://github.com/octocat/hello.git", "");
        assert_eq!(url, "https://github.com/octocat/hello.git");
    }
}
