//! Billing error types

/// Errors produced by the billing core.
///
/// `ProviderInconsistency` covers states that are auto-healed where a
/// deterministic recovery exists (deleted customer, duplicate active
/// subscriptions, stale local pointer) and is logged rather than surfaced.
/// `TransientProvider` is retryable and bubbles to the caller once any
/// internal bounded retry is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("provider inconsistency: {0}")]
    ProviderInconsistency(String),

    #[error("a payment method is required to complete this change")]
    PaymentMethodRequired,

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("provider api error: {0}")]
    ProviderApi(String),

    #[error("invalid plan change: {0}")]
    InvalidPlanChange(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::TransientProvider(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match &e {
            stripe::StripeError::Stripe(request_error) => {
                if request_error.http_status >= 500 {
                    BillingError::TransientProvider(e.to_string())
                } else if request_error.http_status == 404 {
                    BillingError::NotFound(e.to_string())
                } else {
                    BillingError::ProviderApi(e.to_string())
                }
            }
            stripe::StripeError::Timeout => BillingError::TransientProvider(e.to_string()),
            stripe::StripeError::ClientError(_) => BillingError::TransientProvider(e.to_string()),
            _ => BillingError::ProviderApi(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        assert!(BillingError::TransientProvider("502".to_string()).is_retryable());
        assert!(!BillingError::PaymentMethodRequired.is_retryable());
        assert!(!BillingError::NotFound("user".to_string()).is_retryable());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
