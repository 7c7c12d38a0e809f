use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::error::UnknownSource;
use crate::service::{FeedService, RefreshTarget};

pub struct AppState {
    pub service: Arc<FeedService>,
    /// Re-read on `POST /reload`
    pub config_path: PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/feeds", get(feeds))
        .route("/items", get(items))
        .route("/refresh", post(refresh_all))
        .route("/refresh/status", get(refresh_status))
        .route("/refresh/:id", post(refresh_feed))
        .route("/reload", post(reload))
        .route("/health", get(health))
        .with_state(state)
}

// Custom error type
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        let error = err.into();
        let status = if error.is::<UnknownSource>() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        AppError { status, error }
    }
}

// Route handlers
pub async fn feeds(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.get_aggregated().await)
}

#[derive(Deserialize)]
pub struct ItemsQuery {
    #[serde(default)]
    pub days: Option<u32>,
}

pub async fn items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> impl IntoResponse {
    Json(state.service.recent_items(query.days).await)
}

pub async fn refresh_all(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let started = state.service.force_refresh(RefreshTarget::All).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "refreshing": true, "started": started })),
    ))
}

pub async fn refresh_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let started = state
        .service
        .force_refresh(RefreshTarget::Source(id))
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "refreshing": true, "started": started })),
    ))
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let refreshing = state.service.is_refreshing().await;
    Json(json!({ "refreshing": refreshing }))
}

pub async fn reload(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let config = Config::load(&state.config_path)?;
    let feeds = state.service.reload(&config).await?;
    Ok(Json(json!({ "feeds": feeds })))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetcher::FeedFetcher;
    use crate::model::{FeedSource, RawFeedDocument};
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    struct OfflineFetcher;

    #[async_trait]
    impl FeedFetcher for OfflineFetcher {
        async fn fetch(&self, _source: &FeedSource) -> Result<RawFeedDocument, FetchError> {
            Err(FetchError::transient("offline"))
        }
    }

    const CONFIG: &str = r#"
        [[feeds]]
        name = "Nature"
        url = "http://feeds.nature.com/nature/rss/current"

        [[feeds]]
        name = "Science"
        url = "https://www.science.org/rss/news_current.xml"
    "#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn create_test_app(config_file: &NamedTempFile) -> Router {
        let config = Config::load(config_file.path()).unwrap();
        let service = FeedService::new(&config, Arc::new(OfflineFetcher)).unwrap();
        router(Arc::new(AppState {
            service: Arc::new(service),
            config_path: config_file.path().to_path_buf(),
        }))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let file = write_config(CONFIG);
        let app = create_test_app(&file);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_feeds_lists_all_sources() {
        let file = write_config(CONFIG);
        let app = create_test_app(&file);

        let response = app
            .oneshot(Request::builder().uri("/feeds").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["sources"]["Nature"]["status"], "uninitialized");
        assert_eq!(json["sources"]["Science"]["items"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_items_empty_before_refresh() {
        let file = write_config(CONFIG);
        let app = create_test_app(&file);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/items?days=3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    mod refresh_tests {
        use super::*;

        #[tokio::test]
        async fn test_refresh_all_accepted() {
            let file = write_config(CONFIG);
            let app = create_test_app(&file);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/refresh")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let json = body_json(response).await;
            assert_eq!(json["refreshing"], true);
            assert_eq!(json["started"], 2);
        }

        #[tokio::test]
        async fn test_refresh_unknown_feed_is_not_found() {
            let file = write_config(CONFIG);
            let app = create_test_app(&file);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/refresh/Missing")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let json = body_json(response).await;
            assert!(json["error"].as_str().unwrap().contains("Missing"));
        }

        #[tokio::test]
        async fn test_refresh_single_feed() {
            let file = write_config(CONFIG);
            let app = create_test_app(&file);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/refresh/Nature")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        #[tokio::test]
        async fn test_refresh_status_endpoint() {
            let file = write_config(CONFIG);
            let app = create_test_app(&file);

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/refresh/status")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await["refreshing"], false);
        }
    }

    mod reload_tests {
        use super::*;

        #[tokio::test]
        async fn test_reload_picks_up_new_file_contents() {
            let file = write_config(CONFIG);
            let app = create_test_app(&file);

            std::fs::write(
                file.path(),
                r#"
                    [[feeds]]
                    name = "Only"
                    url = "https://only.example.com/rss"
                "#,
            )
            .unwrap();

            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/reload")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await["feeds"], 1);

            let response = app
                .oneshot(Request::builder().uri("/feeds").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let json = body_json(response).await;
            assert!(json["sources"].get("Only").is_some());
            assert!(json["sources"].get("Nature").is_none());
        }

        #[tokio::test]
        async fn test_reload_with_empty_list_fails() {
            let file = write_config(CONFIG);
            let app = create_test_app(&file);

            std::fs::write(file.path(), "feeds = []").unwrap();

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/reload")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn test_items_query_default_days() {
            let query: ItemsQuery = serde_urlencoded::from_str("").unwrap();
            assert_eq!(query.days, None);
        }

        #[test]
        fn test_items_query_with_days() {
            let query: ItemsQuery = serde_urlencoded::from_str("days=10").unwrap();
            assert_eq!(query.days, Some(10));
        }
    }
}
