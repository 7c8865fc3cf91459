use std::time::Duration;

use liaison_core::ChatError;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a transport failure. `limit` is the timeout that applied to the request.
pub(crate) fn send_error(e: reqwest::Error, limit: Duration) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout(limit)
    } else {
        ChatError::Network(e.to_string())
    }
}

/// Turn anything other than a 2xx-with-content into `ChatError::Status`.
/// 204 counts as an error: callers that expect a body cannot use it, and the
/// poll loop classifies it as "nothing yet".
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = resp.status();
    if status.is_success() && status != reqwest::StatusCode::NO_CONTENT {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ChatError::from_status(status.as_u16(), body))
}

/// Like [`check_status`] but for calls where an empty 2xx is fine.
pub(crate) async fn check_accepted(resp: reqwest::Response) -> Result<(), ChatError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ChatError::from_status(status.as_u16(), body))
}

pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ChatError> {
    resp.json::<T>()
        .await
        .map_err(|e| ChatError::Decode(e.to_string()))
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, ChatError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| ChatError::Network(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("http://h/chat/rest/", "/System/SessionId"),
            "http://h/chat/rest/System/SessionId"
        );
        assert_eq!(join_url("http://h", "messages"), "http://h/messages");
    }
}
