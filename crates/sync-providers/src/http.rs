//! Shared HTTP plumbing: client construction, rate-limit header inspection,
//! and the page-fetch retry loop every provider client reuses.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use sync_types::CancellationToken;

pub fn build_client(user_agent: &str) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .context("failed to build HTTP client")
}

/// Header names used to read remaining-quota and reset-time from a
/// response. Values differ per platform; the interpretation (remaining /
/// limit fraction, reset as unix epoch seconds) is the same across all four.
pub struct RateLimitHeaderNames {
    pub remaining: &'static str,
    pub limit: &'static str,
    pub reset_epoch_secs: &'static str,
}

pub const GITHUB_RATE_LIMIT_HEADERS: RateLimitHeaderNames = RateLimitHeaderNames {
    remaining: "x-ratelimit-remaining",
    limit: "x-ratelimit-limit",
    reset_epoch_secs: "x-ratelimit-reset",
};

/// GitLab, Gitea and Gogs expose the same header family under this
/// convention (Gitea/Gogs inherit it from their GitHub-compatible APIs).
pub const GENERIC_RATE_LIMIT_HEADERS: RateLimitHeaderNames = RateLimitHeaderNames {
    remaining: "ratelimit-remaining",
    limit: "ratelimit-limit",
    reset_epoch_secs: "ratelimit-reset",
};

fn remaining_quota_fraction(headers: &HeaderMap, names: &RateLimitHeaderNames) -> Option<f64> {
    let remaining: u64 = headers.get(names.remaining)?.to_str().ok()?.parse().ok()?;
    let limit: u64 = headers.get(names.limit)?.to_str().ok()?.parse().ok()?;
    if limit == 0 {
        return None;
    }
    Some(remaining as f64 / limit as f64)
}

fn reset_wait(headers: &HeaderMap, names: &RateLimitHeaderNames) -> Option<Duration> {
    let reset_epoch: i64 = headers
        .get(names.reset_epoch_secs)?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    let now = chrono::Utc::now().timestamp();
    let delta = reset_epoch - now;
    Some(Duration::from_secs(delta.max(0) as u64))
}

/// Sleep until the rate-limit reset time when remaining quota has dropped
/// below `low_water_mark` (a fraction, default 0.1 for 10%). Interruptible
/// by cancellation.
pub fn maybe_throttle(
    ctx: &CancellationToken,
    headers: &HeaderMap,
    names: &RateLimitHeaderNames,
    low_water_mark: f64,
) {
    if let Some(fraction) = remaining_quota_fraction(headers, names)
        && fraction < low_water_mark
        && let Some(wait) = reset_wait(headers, names)
    {
        ctx.sleep_interruptible(wait);
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Issue one page request, retrying transient failures (5xx, network
/// errors, 429 without an explicit reset time) under `retry`. 4xx other than
/// 429 return immediately without retrying. Honors cancellation between
/// attempts.
pub fn fetch_page_with_retry<F>(
    ctx: &CancellationToken,
    retry: &sync_retry::RetryStrategyConfig,
    rate_limit_headers: &RateLimitHeaderNames,
    mut send: F,
) -> Result<Response>
where
    F: FnMut() -> Result<Response, reqwest::Error>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if ctx.is_cancelled() {
            bail!("cancelled while fetching page");
        }

        match send() {
            Ok(resp) => {
                let status = resp.status();

                if status == StatusCode::TOO_MANY_REQUESTS {
                    if let Some(wait) = reset_wait(resp.headers(), rate_limit_headers) {
                        ctx.sleep_interruptible(wait);
                        continue;
                    }
                    if attempt >= retry.max_attempts {
                        bail!("rate limited (429) after {attempt} attempts with no reset header");
                    }
                    ctx.sleep_interruptible(sync_retry::calculate_delay(retry, attempt));
                    continue;
                }

                if is_retryable_status(status) {
                    if attempt >= retry.max_attempts {
                        bail!("transient HTTP {status} after {attempt} attempts");
                    }
                    ctx.sleep_interruptible(sync_retry::calculate_delay(retry, attempt));
                    continue;
                }

                maybe_throttle(ctx, resp.headers(), rate_limit_headers, 0.1);
                return Ok(resp);
            }
            Err(e) => {
                if attempt >= retry.max_attempts {
                    return Err(e).context("network error fetching page");
                }
                ctx.sleep_interruptible(sync_retry::calculate_delay(retry, attempt));
            }
        }
    }
}

/// Parse an RFC 5988 `Link` header (GitHub/Gitea/Gogs pagination) and return
/// the `next` relation's URL, if present.
pub fn parse_link_header_next(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    for part in raw.split(',') {
        let mut segments = part.split(';');
        let url_part = segments.next()?.trim();
        let is_next = segments.any(|seg| seg.trim() == r#"rel="next""#);
        if is_next {
            let url = url_part.trim_start_matches('<').trim_end_matches('>');
            return Some(url.to_string());
        }
    }
    None
}
