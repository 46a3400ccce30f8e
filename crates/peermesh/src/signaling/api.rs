//! HTTP id retrieval
//!
//! One GET against the signaling server's id endpoint; the assigned id comes
//! back as plain text.

use crate::config::{MeshOptions, CLIENT_VERSION};
use crate::error::{MeshError, MeshErrorKind};
use crate::types::PeerId;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct HttpApi {
    http: reqwest::Client,
}

impl HttpApi {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Cache-busting timestamp: unix millis with a random suffix.
    fn request_ts() -> String {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{}{}", ms, rand::random::<u32>())
    }

    pub async fn retrieve_id(&self, options: &MeshOptions) -> Result<PeerId, MeshError> {
        let url = format!(
            "{}://{}:{}{}{}/id?ts={}&version={}",
            options.http_scheme(),
            options.host,
            options.port,
            options.path,
            options.key,
            Self::request_ts(),
            CLIENT_VERSION,
        );
        debug!(%url, "retrieving id");

        let mut request = self.http.get(&url);
        if let Some(policy) = &options.referrer_policy {
            request = request.header("Referrer-Policy", policy.as_str());
        }

        let response = request.send().await.map_err(|e| {
            MeshError::new(
                MeshErrorKind::ServerError,
                format!("could not reach the id endpoint: {e}"),
            )
        })?;

        if !response.status().is_success() {
            return Err(MeshError::new(
                MeshErrorKind::ServerError,
                format!("id endpoint returned {}", response.status()),
            ));
        }

        let text = response.text().await.map_err(|e| {
            MeshError::new(
                MeshErrorKind::ServerError,
                format!("could not read the assigned id: {e}"),
            )
        })?;
        Ok(PeerId::assigned(text.trim()))
    }
}

impl Default for HttpApi {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ts_is_cache_busting() {
        let a = HttpApi::request_ts();
        let b = HttpApi::request_ts();
        assert_ne!(a, b);
        assert!(a.len() > 13);
    }
}
