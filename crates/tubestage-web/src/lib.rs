//! Read-only dashboard over the relational tables (axum + askama).

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use tubestage_core::EntityKind;
use tubestage_sync::{RelationalStore, TableView};

pub const CRATE_NAME: &str = "tubestage-web";
pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub store: RelationalStore,
}

impl AppState {
    pub fn new(store: RelationalStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct IndexQuery {
    entity: Option<String>,
}

struct EntityOption {
    value: &'static str,
    label: &'static str,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    options: Vec<EntityOption>,
    view: TableView,
}

#[derive(Template)]
#[template(path = "table_partial.html")]
struct TablePartialTemplate {
    view: TableView,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/tables/{entity}", get(table_partial_handler))
        .route("/api/tables/{entity}", get(table_json_handler))
        .with_state(Arc::new(state))
}

/// Binds `port` on all interfaces and serves until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Response {
    let kind = match query.entity.as_deref() {
        None | Some("") => EntityKind::Channel,
        Some(raw) => match raw.parse::<EntityKind>() {
            Ok(kind) => kind,
            Err(err) => return not_found(err),
        },
    };
    match state.store.select_all(kind).await {
        Ok(view) => render_html(IndexTemplate {
            options: EntityKind::ALL
                .into_iter()
                .map(|k| EntityOption {
                    value: k.collection(),
                    label: k.display_name(),
                    selected: k == kind,
                })
                .collect(),
            view,
        }),
        Err(err) => server_error(err),
    }
}

async fn table_partial_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
) -> Response {
    let kind = match entity.parse::<EntityKind>() {
        Ok(kind) => kind,
        Err(err) => return not_found(err),
    };
    match state.store.select_all(kind).await {
        Ok(view) => render_html(TablePartialTemplate { view }),
        Err(err) => server_error(err),
    }
}

async fn table_json_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
) -> Response {
    let kind = match entity.parse::<EntityKind>() {
        Ok(kind) => kind,
        Err(err) => return not_found(err),
    };
    match state.store.select_all(kind).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(err: impl std::fmt::Display) -> Response {
    (StatusCode::NOT_FOUND, Html(format!("Not found: {err}"))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use tubestage_core::Channel;

    async fn seeded_app() -> Router {
        let store = RelationalStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_schema().await.unwrap();
        store
            .upsert(&[
                Channel {
                    channel_id: "UC1".into(),
                    name: "Rust Talks".into(),
                    subscriber_count: 1500,
                    video_count: 42,
                },
                Channel {
                    channel_id: "UC2".into(),
                    name: "<b>Loud</b>".into(),
                    subscriber_count: 0,
                    video_count: 0,
                },
            ])
            .await
            .unwrap();
        app(AppState::new(store))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_defaults_to_channels() {
        let (status, text) = get(seeded_app().await, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Rust Talks"));
        assert!(text.contains("1500"));
        assert!(text.contains(r#"<option value="channels" selected>"#));
        assert!(text.contains("&lt;b&gt;Loud"));
        assert!(!text.contains("<b>Loud"));
    }

    #[tokio::test]
    async fn index_selects_entity_from_query() {
        let (status, text) = get(seeded_app().await, "/?entity=videos").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains(r#"<option value="videos" selected>"#));
        assert!(text.contains("video_info"));
        assert!(text.contains("0 row(s)"));

        let (status, _) = get(seeded_app().await, "/?entity=subscriptions").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn table_partial_renders_rows() {
        let (status, text) = get(seeded_app().await, "/tables/channel_data").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("2 row(s)"));
        assert!(text.contains("<th>subscriber_count</th>"));
        assert!(!text.contains("<html"));

        let (status, _) = get(seeded_app().await, "/tables/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dashboard_over_an_unmigrated_store_shows_empty_tables() {
        let store = RelationalStore::connect("sqlite::memory:").await.unwrap();
        let (status, text) = get(app(AppState::new(store.clone())), "/?entity=playlists").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("0 row(s)"));
        assert!(text.contains("<th>playlist_id</th>"));
        for kind in EntityKind::ALL {
            assert!(!store.table_exists(kind).await.unwrap());
        }
    }

    #[tokio::test]
    async fn json_table_view() {
        let resp = seeded_app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/api/tables/channels")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["kind"], "channel");
        assert_eq!(value["columns"][1], "channel_id");
        assert_eq!(value["rows"][0][2], "Rust Talks");
        assert_eq!(value["rows"].as_array().unwrap().len(), 2);
    }
}
