//! Request extractors that reject in the API error shape.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};

use super::error::ApiError;

/// `axum::Json` with its rejection mapped to a 400 in the API error body.
///
/// The default rejection answers 422 with a plain-text body; clients of
/// this API get a 400 with the same JSON envelope every other error uses.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::bad_request(
                "invalid request body",
                Some(rejection.body_text()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::{Router, routing::post};
    use serde::Deserialize;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::ApiJson;

    #[derive(Debug, Deserialize)]
    struct EchoRequest {
        id: Uuid,
    }

    async fn echo(ApiJson(request): ApiJson<EchoRequest>) -> String {
        request.id.to_string()
    }

    fn router() -> Router {
        Router::new().route("/echo", post(echo))
    }

    fn post_json(body: &str) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn missing_field_answers_bad_request_not_unprocessable() {
        let response = router().oneshot(post_json("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_answers_bad_request() {
        let response = router().oneshot(post_json("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn well_formed_body_passes_through() {
        let id = Uuid::new_v4();
        let body = format!("{{\"id\":\"{id}\"}}");
        let response = router().oneshot(post_json(&body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
