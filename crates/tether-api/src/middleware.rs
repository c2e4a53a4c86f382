use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
};
use tether_core::AppState;

/// A verified identity token on an HTTP call. The HTTP surface is a
/// trusted operator path: any valid token passes, there are no roles.
pub struct AuthIdentity {
    pub stable_id: String,
}

impl FromRequestParts<AppState> for AuthIdentity {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or((StatusCode::UNAUTHORIZED, "Invalid authorization format"))?;

        let verified = state
            .identity
            .verify(token)
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid or expired token"))?;

        Ok(AuthIdentity {
            stable_id: verified.stable_id,
        })
    }
}
