//! Core services of the Conduit blogging backend.
//!
//! The interesting parts are tag reconciliation ([`tags`]) and favorites
//! ([`favorites`]), with articles, profiles and comments built on the same
//! persistence gateway ([`storage`]). Every mutating call takes a
//! [`context::CallContext`] for cancellation and deadlines.
//!
//! The HTTP surface is limited to a liveness probe. Request handlers for the
//! public API live upstream and call into [`ConduitServices`].

use crate::articles::ArticleService;
use crate::comments::CommentService;
use crate::config::{Config, Env};
use crate::favorites::FavoriteService;
use crate::profiles::ProfileService;
use crate::storage::ConduitStorage;
use crate::tags::TagService;
use axum::{
    Router,
    extract::{Extension, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{any, get},
};
use opentelemetry::{global, propagation::Extractor};
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub mod articles;
pub mod comments;
pub mod config;
pub mod context;
pub mod database;
pub mod favorites;
pub mod profiles;
pub mod storage;
pub mod tags;
pub mod telemetry;

const BUILD_COMMIT: &str = env!("BUILD_COMMIT");

/// All services over one storage handle.
#[derive(Clone)]
pub struct ConduitServices<S: ConduitStorage> {
    pub tags: TagService<S>,
    pub favorites: FavoriteService<S>,
    pub profiles: ProfileService<S>,
    pub articles: ArticleService<S>,
    pub comments: CommentService<S>,
}

impl<S: ConduitStorage> ConduitServices<S> {
    pub fn new(storage: S) -> Self {
        Self {
            tags: TagService::new(storage.clone()),
            favorites: FavoriteService::new(storage.clone()),
            profiles: ProfileService::new(storage.clone()),
            articles: ArticleService::new(storage.clone()),
            comments: CommentService::new(storage),
        }
    }
}

/// Version string reported in `x-service-version`.
pub fn service_version(env: Env) -> String {
    let version = env!("CARGO_PKG_VERSION");
    match env {
        Env::Prod => format!("{version}+{BUILD_COMMIT}"),
        other => format!("{version}-{other}+{BUILD_COMMIT}"),
    }
}

struct HeaderExtractor<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

pub fn routes<S: ConduitStorage>(storage: S, config: Config) -> Router {
    Router::new()
        .route("/is-health", get(health_check::<S>))
        .fallback(any(catch_all))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let parent_context = global::get_text_map_propagator(|propagator| {
                    propagator.extract(&HeaderExtractor(request.headers()))
                });

                let span = tracing::info_span!(
                    "http_request",
                    http_request.method = ?request.method(),
                    http_request.uri = ?request.uri(),
                    http_request.version = ?request.version(),
                    http_request.user_agent = ?request.headers().get(axum::http::header::USER_AGENT),
                );

                span.set_parent(parent_context);

                span
            }),
        )
        .layer(Extension(config))
        .with_state(storage)
}

async fn health_check<S: ConduitStorage>(
    State(storage): State<S>,
    Extension(config): Extension<Config>,
) -> impl IntoResponse {
    let mut response = if storage.is_connected().await {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::BAD_GATEWAY, "502").into_response()
    };

    let headers = [
        ("x-service-env", config.environment().to_string()),
        ("x-service-version", service_version(*config.environment())),
    ];
    for (name, value) in headers {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(name), value);
            }
            Err(err) => tracing::warn!(header = name, error = %err, "Skipping invalid header"),
        }
    }

    response
}

async fn catch_all() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "nothing to see here")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_version_marks_non_prod_envs() {
        let prod = service_version(Env::Prod);
        let local = service_version(Env::Local);

        assert!(prod.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(!prod.contains("local"));
        assert!(local.contains("-local+"));
    }
}
