//! Fallback composition for graceful degradation.

use std::future::Future;

use serde_json::json;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;

const LOGGER: Logger = Logger::new("resilience");

/// Run `primary`; on any error, run `secondary`.
///
/// If the secondary also errors, a `System` error carrying both causes is
/// surfaced. Nothing is swallowed silently.
pub async fn with_fallback<T, P, PF, S, SF>(primary: P, secondary: S) -> Result<T>
where
    P: FnOnce() -> PF,
    PF: Future<Output = Result<T>>,
    S: FnOnce() -> SF,
    SF: Future<Output = Result<T>>,
{
    let primary_err = match primary().await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    LOGGER.warn(
        "primary operation failed, using fallback",
        &[("error", json!(primary_err.to_string()))],
    );

    match secondary().await {
        Ok(value) => Ok(value),
        Err(fallback_err) => Err(CoreError::system("both primary and fallback operations failed")
            .with_code("FALLBACK_FAILED")
            .with_detail("primary_error", primary_err.to_string())
            .with_detail("fallback_error", fallback_err.to_string())
            .with_source(fallback_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let result = with_fallback(
            || async { Ok::<_, CoreError>(1) },
            || async { Ok::<_, CoreError>(2) },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fallback_used_on_primary_failure() {
        let result = with_fallback(
            || async { Err::<i32, _>(CoreError::external_service("down")) },
            || async { Ok(2) },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_double_failure_carries_both_causes() {
        let err = with_fallback(
            || async { Err::<i32, _>(CoreError::external_service("primary down")) },
            || async { Err::<i32, _>(CoreError::network("fallback down")) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::System);
        assert_eq!(err.code, "FALLBACK_FAILED");
        assert!(err.details["primary_error"]
            .as_str()
            .unwrap()
            .contains("primary down"));
        assert!(err.details["fallback_error"]
            .as_str()
            .unwrap()
            .contains("fallback down"));
    }
}
