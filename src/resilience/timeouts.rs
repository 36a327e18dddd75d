//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound connects, socket writes and waits on other tasks
//! - Turn an elapsed deadline into `ProxyError::Timeout` naming the operation

use std::future::Future;
use std::time::Duration;

use crate::error::ProxyError;

/// Run `fut` for at most `duration`; `what` names the operation in the error.
pub async fn with_timeout<T, E, F>(duration: Duration, what: &'static str, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ProxyError>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ProxyError::Timeout(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elapsed_deadline_names_the_operation() {
        let result: Result<(), ProxyError> = with_timeout(
            Duration::from_millis(10),
            "connecting",
            std::future::pending::<Result<(), std::io::Error>>(),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::Timeout("connecting"))));
    }

    #[tokio::test]
    async fn inner_errors_are_converted() {
        let result = with_timeout(Duration::from_secs(1), "writing", async {
            Err::<(), _>(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        })
        .await;
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }
}
