use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// How the change log retries its upstream.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts allowed for the initial snapshot before `connect` fails.
    pub connect_attempts: u32,
    /// Consecutive failures tolerated once live. `None` retries forever.
    pub reconnect_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            connect_attempts: 5,
            reconnect_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// with jitter in the upper half so clients spread out after an outage.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff);
        let millis = base.as_millis() as u64;
        if millis < 2 {
            return base;
        }
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the write API, e.g. `http://localhost:3000`.
    pub api_url: String,
    /// Base URL serving `/v1/shape`.
    pub shape_url: String,
    pub source_id: String,
    pub source_secret: String,
    /// Directory for the auth record and saved view states.
    pub state_dir: PathBuf,
    pub retry: RetryPolicy,
    /// How long an accepted write may wait for its confirmation.
    pub match_timeout: Duration,
    pub save_debounce: Duration,
    /// Upper bound on a single HTTP request, long polls included.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, source_id: impl Into<String>, source_secret: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            shape_url: api_url.clone(),
            api_url,
            source_id: source_id.into(),
            source_secret: source_secret.into(),
            state_dir: PathBuf::from(".pixel-canvas"),
            retry: RetryPolicy::default(),
            match_timeout: Duration::from_secs(10),
            save_debounce: Duration::from_millis(500),
            request_timeout: Duration::from_secs(90),
        }
    }

    /// Read `PIXEL_*` variables, loading `.env` first if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let api_url = std::env::var("PIXEL_API_URL").unwrap_or_else(|_| "http://localhost:3000".into());
        let source_id = std::env::var("PIXEL_SOURCE_ID").unwrap_or_else(|_| "canvas".into());
        let source_secret =
            std::env::var("PIXEL_SOURCE_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());

        let mut config = Self::new(api_url, source_id, source_secret);
        if let Ok(url) = std::env::var("PIXEL_SHAPE_URL") {
            config.shape_url = url;
        }
        if let Ok(dir) = std::env::var("PIXEL_STATE_DIR") {
            config.state_dir = dir.into();
        }
        config
    }
}
