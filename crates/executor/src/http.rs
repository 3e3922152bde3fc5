//! HTTP reference executor and resolver
//!
//! Talks to a plain REST endpoint owned by the operator:
//! - `GET  {endpoint}/targets/{reference}` → `{"id": "..."}`
//! - `POST {endpoint}/targets/{id}/actions` with the credential as bearer token
//!
//! Response statuses are mapped through `classify_status`. Transport failures
//! (timeouts, refused connections) are `Transient`.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    ActionExecutor, Credential, ErrorKind, Outcome, ResolutionError, Target, TargetResolver,
    classify_status,
};

/// Build `{endpoint}/{segments...}` with each segment percent-encoded.
fn endpoint_url(endpoint: &Url, segments: &[&str]) -> Option<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(segments.iter().copied());
    Some(url)
}

fn transport_kind(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorKind::Transient
    } else {
        ErrorKind::Unknown
    }
}

/// Executes one action per call as an authenticated POST.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

impl ActionExecutor for HttpExecutor {
    fn id(&self) -> &str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        credential: &'a Credential,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let Some(url) = endpoint_url(&self.endpoint, &["targets", &target.id, "actions"])
            else {
                warn!(endpoint = %self.endpoint, "endpoint cannot carry a path");
                return Outcome::Failure(ErrorKind::Unknown);
            };

            let response = self
                .client
                .post(url)
                .bearer_auth(credential.secret.expose())
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let outcome = classify_status(resp.status().as_u16());
                    debug!(
                        resource_id = %credential.id,
                        target_id = %target.id,
                        status = resp.status().as_u16(),
                        outcome = outcome.label(),
                        "action response"
                    );
                    outcome
                }
                Err(e) => {
                    let kind = transport_kind(&e);
                    debug!(
                        resource_id = %credential.id,
                        target_id = %target.id,
                        error = %e,
                        kind = kind.label(),
                        "action request failed"
                    );
                    Outcome::Failure(kind)
                }
            }
        })
    }
}

#[derive(Deserialize)]
struct TargetBody {
    id: String,
}

/// Resolves references via `GET {endpoint}/targets/{reference}`.
pub struct HttpResolver {
    client: reqwest::Client,
    endpoint: Url,
    /// Operator key for the lookup endpoint, sent as a bearer token
    api_key: Option<Secret<String>>,
}

impl HttpResolver {
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Secret<String>) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

impl TargetResolver for HttpResolver {
    fn resolve<'a>(
        &'a self,
        reference: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Target, ResolutionError>> + Send + 'a>> {
        Box::pin(async move {
            let url = endpoint_url(&self.endpoint, &["targets", reference]).ok_or_else(|| {
                ResolutionError::Unavailable(format!(
                    "endpoint {} cannot carry a path",
                    self.endpoint
                ))
            })?;

            let mut request = self.client.get(url);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key.expose());
            }
            let resp = request
                .send()
                .await
                .map_err(|e| ResolutionError::Unavailable(e.to_string()))?;

            let status = resp.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ResolutionError::NotFound(reference.to_string()));
            }
            if !status.is_success() {
                return Err(ResolutionError::Unavailable(format!(
                    "resolver returned {status}"
                )));
            }

            let body: TargetBody = resp
                .json()
                .await
                .map_err(|e| ResolutionError::Unavailable(format!("invalid body: {e}")))?;
            if body.id.trim().is_empty() {
                return Err(ResolutionError::NotFound(reference.to_string()));
            }

            Ok(Target {
                id: body.id,
                reference: reference.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use tokio::net::TcpListener;

    /// Mock endpoint: target "t-1" exists, credential "good" succeeds,
    /// "revoked" gets 401, "busy" gets 429.
    async fn start_mock_endpoint() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = axum::Router::new()
            .route(
                "/api/targets/{reference}",
                get(|Path(reference): Path<String>, headers: HeaderMap| async move {
                    let operator = headers
                        .get("authorization")
                        .is_some_and(|v| v.as_bytes() == b"Bearer operator");
                    if reference == "alpha" || (reference == "private" && operator) {
                        (StatusCode::OK, axum::Json(serde_json::json!({"id": "t-1"})))
                    } else if reference == "private" {
                        (
                            StatusCode::UNAUTHORIZED,
                            axum::Json(serde_json::json!({"error": "operator key required"})),
                        )
                    } else {
                        (
                            StatusCode::NOT_FOUND,
                            axum::Json(serde_json::json!({"error": "no such target"})),
                        )
                    }
                }),
            )
            .route(
                "/api/targets/{id}/actions",
                post(|Path(id): Path<String>, headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if id != "t-1" {
                        return StatusCode::NOT_FOUND;
                    }
                    match auth {
                        "Bearer good" => StatusCode::NO_CONTENT,
                        "Bearer revoked" => StatusCode::UNAUTHORIZED,
                        "Bearer busy" => StatusCode::TOO_MANY_REQUESTS,
                        _ => StatusCode::IM_A_TEAPOT,
                    }
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Url::parse(&format!("http://{addr}/api")).unwrap()
    }

    fn credential(secret: &str) -> Credential {
        Credential {
            id: format!("res-{secret}"),
            secret: Secret::new(secret.to_string()),
        }
    }

    fn target() -> Target {
        Target {
            id: "t-1".into(),
            reference: "alpha".into(),
        }
    }

    #[tokio::test]
    async fn resolver_returns_target_id() {
        let endpoint = start_mock_endpoint().await;
        let resolver = HttpResolver::new(reqwest::Client::new(), endpoint);
        let target = resolver.resolve("alpha").await.unwrap();
        assert_eq!(target.id, "t-1");
        assert_eq!(target.reference, "alpha");
    }

    #[tokio::test]
    async fn resolver_maps_404_to_not_found() {
        let endpoint = start_mock_endpoint().await;
        let resolver = HttpResolver::new(reqwest::Client::new(), endpoint);
        let err = resolver.resolve("missing").await.unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound(ref r) if r == "missing"));
    }

    #[tokio::test]
    async fn resolver_sends_operator_key() {
        let endpoint = start_mock_endpoint().await;

        let anonymous = HttpResolver::new(reqwest::Client::new(), endpoint.clone());
        let err = anonymous.resolve("private").await.unwrap_err();
        assert!(matches!(err, ResolutionError::Unavailable(_)), "got {err:?}");

        let keyed = HttpResolver::new(reqwest::Client::new(), endpoint)
            .with_api_key(Secret::new("operator".into()));
        assert_eq!(keyed.resolve("private").await.unwrap().id, "t-1");
    }

    #[tokio::test]
    async fn resolver_unreachable_endpoint_is_unavailable() {
        let resolver = HttpResolver::new(
            reqwest::Client::new(),
            Url::parse("http://127.0.0.1:1/api").unwrap(),
        );
        let err = resolver.resolve("alpha").await.unwrap_err();
        assert!(matches!(err, ResolutionError::Unavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn executor_sends_bearer_and_classifies_status() {
        let endpoint = start_mock_endpoint().await;
        let executor = HttpExecutor::new(reqwest::Client::new(), endpoint);
        let target = target();

        assert_eq!(
            executor.execute(&credential("good"), &target).await,
            Outcome::Success
        );
        assert_eq!(
            executor.execute(&credential("revoked"), &target).await,
            Outcome::Failure(ErrorKind::AuthInvalid)
        );
        assert_eq!(
            executor.execute(&credential("busy"), &target).await,
            Outcome::Failure(ErrorKind::RateLimited)
        );
        assert_eq!(
            executor.execute(&credential("other"), &target).await,
            Outcome::Failure(ErrorKind::Unknown)
        );
    }

    #[tokio::test]
    async fn executor_connection_refused_is_transient() {
        let executor = HttpExecutor::new(
            reqwest::Client::new(),
            Url::parse("http://127.0.0.1:1/api").unwrap(),
        );
        let outcome = executor.execute(&credential("good"), &target()).await;
        assert_eq!(outcome, Outcome::Failure(ErrorKind::Transient));
    }

    #[test]
    fn endpoint_url_encodes_segments() {
        let base = Url::parse("https://example.test/api/").unwrap();
        let url = endpoint_url(&base, &["targets", "a b/c", "actions"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/api/targets/a%20b%2Fc/actions"
        );
    }
}
