use std::{num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Method, Url,
};

use super::{describe, ByteStream, Catalog};
use crate::{
    error::{Error, Result},
    item::{MediaItem, MediaKind},
};

/// Catalog of plain HTTP(S) URLs.
///
/// Ids are absolute URLs. Metadata comes from response headers only, so
/// items have no artist, album or duration.
///
/// Requests are rate limited so that a long queue does not hammer the
/// server: bursts are allowed up to the maximum calls per interval, and
/// requests that would exceed the limit are delayed.
pub struct Http {
    /// Client without rate limiting.
    unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Http {
    /// Rolling window of the rate limit.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum calls per interval.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 20;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    ///
    /// A read that stalls for longer fails the attempt, which is then
    /// retried by the coordinator.
    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new catalog client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let unlimited = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .ok_or_else(|| Error::internal("quota time interval is zero"))?
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .ok_or_else(|| Error::internal("calls per interval is zero"))?,
            );

        Ok(Self {
            unlimited,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    fn parse(id: &str) -> Result<Url> {
        let url = Url::parse(id)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(Error::invalid_argument(format!(
                "unsupported scheme {scheme} in {id}"
            ))),
        }
    }

    /// Executes a request after waiting for the rate limiter, failing on
    /// error statuses.
    async fn execute(&self, method: Method, url: Url) -> Result<reqwest::Response> {
        // No need to await with jitter because the level of concurrency is low.
        self.rate_limiter.until_ready().await;

        let response = self.unlimited.request(method, url).send().await?;
        Ok(response.error_for_status()?)
    }
}

#[async_trait]
impl Catalog for Http {
    async fn fetch_metadata(&self, id: &str) -> Result<MediaItem> {
        let url = Self::parse(id)?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or(id)
            .to_owned();

        let response = self.execute(Method::HEAD, url).await?;
        let headers = response.headers();

        let mut item = MediaItem::new(id, file_name.clone());
        describe(&mut item, &file_name);

        if let Some(content_type) = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_owned())
        {
            if content_type.starts_with("video/") {
                item.kind = MediaKind::Video;
            }
            item.content_type = Some(content_type);
        }

        item.size = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());

        trace!("resolved {item}");
        Ok(item)
    }

    async fn open_stream(&self, item: &MediaItem) -> Result<ByteStream> {
        let url = Self::parse(&item.id)?;
        let response = self.execute(Method::GET, url).await?;

        let stream = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(Error::from);
        Ok(stream.boxed())
    }
}
