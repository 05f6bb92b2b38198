//! Typed errors at the two boundaries that need them.
//!
//! - [`UpstreamError`] is raised by the external clients (repository search,
//!   chat completion, embeddings) so callers can tell a rate limit or
//!   timeout apart from a rejected request.
//! - [`PipelineError`] is the outcome of a comparison or analysis job as
//!   reported to the user. Only [`PipelineError::Transient`] is retried.
//!
//! Everything in between uses `anyhow`; [`PipelineError::classify`] walks
//! an `anyhow::Error` chain to recover the category.

use thiserror::Error;

/// Failure talking to an external service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    #[error("{service} rate limited the request")]
    RateLimited {
        service: &'static str,
        retry_after_secs: Option<u64>,
    },
    #[error("{service} timed out")]
    Timeout { service: &'static str },
    #[error("{service} returned server error {status}")]
    Server { service: &'static str, status: u16 },
    #[error("network error talking to {service}: {message}")]
    Network {
        service: &'static str,
        message: String,
    },
    #[error("{service} rejected the request ({status}): {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },
    #[error("{service} returned a malformed payload: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },
}

impl UpstreamError {
    /// Rate limits, timeouts, 5xx, and connection failures may succeed on
    /// a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited { .. }
                | UpstreamError::Timeout { .. }
                | UpstreamError::Server { .. }
                | UpstreamError::Network { .. }
        )
    }

    /// Map a non-success HTTP status.
    pub fn from_status(
        service: &'static str,
        status: u16,
        retry_after_secs: Option<u64>,
        body: &str,
    ) -> Self {
        match status {
            429 => UpstreamError::RateLimited {
                service,
                retry_after_secs,
            },
            // GitHub signals secondary rate limits with 403 + Retry-After.
            403 if retry_after_secs.is_some() => UpstreamError::RateLimited {
                service,
                retry_after_secs,
            },
            408 => UpstreamError::Timeout { service },
            500..=599 => UpstreamError::Server { service, status },
            _ => UpstreamError::Rejected {
                service,
                status,
                message: body.chars().take(300).collect(),
            },
        }
    }

    pub fn from_reqwest(service: &'static str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout { service }
        } else if err.is_decode() {
            UpstreamError::Malformed {
                service,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            UpstreamError::from_status(service, status.as_u16(), None, "")
        } else {
            UpstreamError::Network {
                service,
                message: err.to_string(),
            }
        }
    }
}

/// Terminal outcome of a pipeline job, in user-facing categories.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("no repositories found for {query:?}")]
    NoResults { query: String },
    #[error("temporary upstream failure: {0}")]
    Transient(String),
    #[error("daily budget exhausted (spent ${spent_usd:.4}, pending ${pending_usd:.4})")]
    BudgetExhausted { spent_usd: f64, pending_usd: f64 },
    #[error("daily request limit reached ({count}/{limit})")]
    UserLimitReached { count: i64, limit: i64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }

    /// Text safe to show the person who submitted the request.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::InvalidQuery(reason) => reason.clone(),
            PipelineError::NoResults { .. } => {
                "No repositories matched your request. Try broader or different terms.".to_string()
            }
            PipelineError::Transient(_) => {
                "The search service is busy right now. Please try again in a few minutes."
                    .to_string()
            }
            PipelineError::BudgetExhausted { .. } => {
                "The daily budget for new comparisons has been used up. Please try again tomorrow."
                    .to_string()
            }
            PipelineError::UserLimitReached { limit, .. } => format!(
                "You have reached your limit of {} requests for today.",
                limit
            ),
            PipelineError::Internal(_) => {
                "Something went wrong while building the comparison.".to_string()
            }
        }
    }

    /// HTTP-style status code for callers that expose one.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::InvalidQuery(_) => 422,
            PipelineError::NoResults { .. } => 404,
            PipelineError::Transient(_) => 502,
            PipelineError::BudgetExhausted { .. } => 503,
            PipelineError::UserLimitReached { .. } => 429,
            PipelineError::Internal(_) => 500,
        }
    }

    /// Recover the category of an error raised somewhere inside a job.
    ///
    /// An explicit `PipelineError` anywhere in the chain wins; a transient
    /// [`UpstreamError`] or a timeout/connect `reqwest::Error` becomes
    /// [`Transient`](PipelineError::Transient); everything else is
    /// [`Internal`](PipelineError::Internal).
    pub fn classify(err: &anyhow::Error) -> PipelineError {
        for cause in err.chain() {
            if let Some(pipeline) = cause.downcast_ref::<PipelineError>() {
                return pipeline.clone();
            }
        }
        for cause in err.chain() {
            if let Some(upstream) = cause.downcast_ref::<UpstreamError>() {
                return if upstream.is_transient() {
                    PipelineError::Transient(upstream.to_string())
                } else {
                    PipelineError::Internal(upstream.to_string())
                };
            }
            if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
                if http.is_timeout() || http.is_connect() {
                    return PipelineError::Transient(http.to_string());
                }
            }
        }
        PipelineError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn status_mapping() {
        assert!(UpstreamError::from_status("github", 429, None, "").is_transient());
        assert!(UpstreamError::from_status("github", 403, Some(60), "").is_transient());
        assert!(UpstreamError::from_status("github", 503, None, "").is_transient());
        assert!(!UpstreamError::from_status("github", 403, None, "forbidden").is_transient());
        assert!(!UpstreamError::from_status("openai", 400, None, "bad").is_transient());
    }

    #[test]
    fn classify_finds_upstream_through_context() {
        let err = anyhow::Error::new(UpstreamError::Timeout { service: "openai" })
            .context("ranking failed");
        assert!(matches!(
            PipelineError::classify(&err),
            PipelineError::Transient(_)
        ));

        let rejected: anyhow::Result<()> = Err(UpstreamError::Rejected {
            service: "openai",
            status: 401,
            message: "bad key".into(),
        }
        .into());
        let err = rejected.context("interpreting query").unwrap_err();
        assert!(matches!(
            PipelineError::classify(&err),
            PipelineError::Internal(_)
        ));
    }

    #[test]
    fn classify_keeps_domain_errors() {
        let err = anyhow::Error::new(PipelineError::NoResults {
            query: "x".into(),
        })
        .context("aggregating");
        let classified = PipelineError::classify(&err);
        assert_eq!(classified.status_code(), 404);
        assert!(!classified.is_retryable());
    }

    #[test]
    fn plain_errors_are_internal_and_final() {
        let err = anyhow::anyhow!("Unsupported model 'gpt-9'");
        let classified = PipelineError::classify(&err);
        assert!(matches!(classified, PipelineError::Internal(_)));
        assert!(!classified.is_retryable());
    }

    #[test]
    fn domain_errors_have_distinct_codes() {
        let codes = [
            PipelineError::InvalidQuery("x".into()).status_code(),
            PipelineError::NoResults { query: "x".into() }.status_code(),
            PipelineError::Transient("x".into()).status_code(),
            PipelineError::BudgetExhausted {
                spent_usd: 1.0,
                pending_usd: 0.0,
            }
            .status_code(),
            PipelineError::UserLimitReached { count: 1, limit: 1 }.status_code(),
            PipelineError::Internal("x".into()).status_code(),
        ];
        let mut unique = codes.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }
}
