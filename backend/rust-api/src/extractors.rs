use axum::{
    extract::{FromRequest, Request},
    response::{IntoResponse, Response},
    Json,
};
use validator::Validate;

use crate::error::EngagementError;

/// JSON extractor that answers malformed bodies with the engagement error body
/// instead of axum's plain-text rejection.
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => {
                tracing::warn!(error = %rejection, "rejected request body");
                Err(EngagementError::InvalidInput(format!(
                    "Failed to parse JSON request body: {}",
                    rejection.body_text()
                ))
                .into_response())
            }
        }
    }
}

/// `AppJson` plus `validator` rules declared on the body type.
pub struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: serde::de::DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let AppJson(value) = AppJson::<T>::from_request(req, state).await?;
        value.validate().map_err(|errors| {
            EngagementError::InvalidInput(errors.to_string()).into_response()
        })?;
        Ok(ValidJson(value))
    }
}
