use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;

use super::error::ApiResult;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the process-wide HTTP connection pool.
///
/// The `reqwest::Client` is built on first use and every clone of the handle
/// reuses it. Adapters receive the handle explicitly.
#[derive(Clone, Default)]
pub struct SharedHttpClient {
    client: Arc<OnceLock<reqwest::Client>>,
}

impl SharedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already configured client
    pub fn from_client(client: reqwest::Client) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(client);
        Self {
            client: Arc::new(cell),
        }
    }

    /// The shared client, building it on first call
    pub fn client(&self) -> ApiResult<reqwest::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }

        let built = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        // A concurrent caller may have won the race; keep whichever landed first.
        let client = self.client.get_or_init(|| built);
        debug!("HTTP client initialized");
        Ok(client.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_built_lazily_and_shared() {
        let handle = SharedHttpClient::new();
        let clone = handle.clone();
        assert!(!handle.is_initialized());

        handle.client().unwrap();
        assert!(handle.is_initialized());
        assert!(clone.is_initialized());
    }

    #[test]
    fn test_separate_handles_are_independent() {
        let a = SharedHttpClient::new();
        let b = SharedHttpClient::new();
        a.client().unwrap();
        assert!(!b.is_initialized());
    }
}
