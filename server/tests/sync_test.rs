//! Integration tests for the HTTP sync API.
//!
//! The router runs in-process over the in-memory record store, so no database
//! is needed.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use ferry_engine::{
    MutationCondition, MutationRequest, MutationType, PageCursor, Record, RemoteRecord, SyncPage,
};
use ferry_server::config::Config;
use ferry_server::db::MemoryRecordStore;
use ferry_server::websocket::{ServerMessage, SubscriptionManager};
use ferry_server::{app, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

fn test_app(config: Config) -> (Router, Arc<SubscriptionManager>) {
    let state = AppState::new(Arc::new(MemoryRecordStore::new()), config);
    let subscriptions = state.subscriptions.clone();
    (app(state), subscriptions)
}

fn post(id: &str, title: &str) -> Record {
    Record::new(id, "Post", json!({"id": id, "title": title}))
}

fn mutation(record: Record, kind: MutationType, expected: Option<u64>) -> MutationRequest {
    MutationRequest {
        model: record.model.clone(),
        mutation_type: kind,
        record,
        expected_version: expected,
        condition: None,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn mutate(app: &Router, request: &MutationRequest) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/mutate/{}", request.model))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap(),
    )
    .await
}

async fn sync(app: &Router, query: &str) -> SyncPage {
    let (status, body) = send(
        app,
        Request::builder()
            .uri(format!("/sync/Post{query}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    serde_json::from_value(body).unwrap()
}

#[cfg(test)]
mod mutate_tests {
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app(Config::local());

        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["liveConnections"], 0);
        assert_eq!(body["authRequired"], false);
    }

    #[tokio::test]
    async fn test_create_then_update_increments_version() {
        let (app, _) = test_app(Config::local());

        let (status, body) = mutate(&app, &mutation(post("p1", "a"), MutationType::Create, None)).await;
        assert_eq!(status, StatusCode::OK);
        let created: RemoteRecord = serde_json::from_value(body).unwrap();
        assert_eq!(created.version, 1);
        assert!(!created.deleted);

        let (status, body) =
            mutate(&app, &mutation(post("p1", "b"), MutationType::Update, Some(1))).await;
        assert_eq!(status, StatusCode::OK);
        let updated: RemoteRecord = serde_json::from_value(body).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.record.payload["title"], "b");
        assert!(updated.last_changed_at >= created.last_changed_at);
    }

    #[tokio::test]
    async fn test_replayed_create_returns_stored_copy() {
        let (app, _) = test_app(Config::local());
        let request = mutation(post("p1", "a"), MutationType::Create, None);

        let (_, first) = mutate(&app, &request).await;
        let (status, again) = mutate(&app, &request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict_with_server_copy() {
        let (app, _) = test_app(Config::local());
        mutate(&app, &mutation(post("p1", "a"), MutationType::Create, None)).await;
        mutate(&app, &mutation(post("p1", "b"), MutationType::Update, Some(1))).await;

        let (status, body) =
            mutate(&app, &mutation(post("p1", "c"), MutationType::Update, Some(1))).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorType"], "ConflictUnhandled");
        assert_eq!(body["record"]["version"], 2);
        assert_eq!(body["record"]["record"]["payload"]["title"], "b");
    }

    #[tokio::test]
    async fn test_failed_condition_is_precondition_failed() {
        let (app, _) = test_app(Config::local());
        mutate(&app, &mutation(post("p1", "published"), MutationType::Create, None)).await;

        let mut request = mutation(post("p1", "edited"), MutationType::Update, Some(1));
        request.condition = Some(MutationCondition::eq("title", "draft"));
        let (status, body) = mutate(&app, &request).await;

        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["errorType"], "ConditionalCheck");

        let page = sync(&app, "").await;
        assert_eq!(page.items[0].version, 1);
        assert_eq!(page.items[0].record.payload["title"], "published");

        request.condition = Some(MutationCondition::eq("title", "published"));
        let (status, body) = mutate(&app, &request).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["version"], 2);
    }

    #[tokio::test]
    async fn test_update_of_missing_record_is_rejected() {
        let (app, _) = test_app(Config::local());

        let (status, body) =
            mutate(&app, &mutation(post("ghost", "a"), MutationType::Update, Some(1))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "BadRequest");
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_in_sync() {
        let (app, _) = test_app(Config::local());
        mutate(&app, &mutation(post("p1", "a"), MutationType::Create, None)).await;

        let (status, body) =
            mutate(&app, &mutation(post("p1", "a"), MutationType::Delete, Some(1))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        assert_eq!(body["version"], 2);

        let page = sync(&app, "").await;
        assert_eq!(page.items.len(), 1);
        assert!(page.items[0].deleted);
    }

    #[tokio::test]
    async fn test_model_must_match_path() {
        let (app, _) = test_app(Config::local());
        let request = mutation(post("p1", "a"), MutationType::Create, None);

        let (status, body) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/mutate/Comment")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&request).unwrap()))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "BadRequest");
    }

    #[tokio::test]
    async fn test_wire_format_of_mutation_request() {
        let (app, _) = test_app(Config::local());
        let raw = json!({
            "model": "Post",
            "mutationType": "create",
            "record": {"id": "p1", "model": "Post", "payload": {"id": "p1", "title": "raw"}},
            "expectedVersion": null
        });

        let (status, body) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/mutate/Post")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(raw.to_string()))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);
        assert!(body["lastChangedAt"].is_u64());
    }
}

#[cfg(test)]
mod sync_query_tests {
    use super::*;

    #[tokio::test]
    async fn test_pages_cover_every_record_once() {
        let (app, _) = test_app(Config::local());
        for i in 0..5 {
            let id = format!("p{i}");
            mutate(&app, &mutation(post(&id, "t"), MutationType::Create, None)).await;
        }

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0;
        loop {
            let query = match &token {
                Some(t) => format!("?limit=2&nextToken={t}"),
                None => "?limit=2".to_string(),
            };
            let page = sync(&app, &query).await;
            pages += 1;
            assert!(page.items.len() <= 2);
            seen.extend(page.items.into_iter().map(|r| r.record.id));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        assert_eq!(pages, 3);
        seen.sort();
        assert_eq!(seen, ["p0", "p1", "p2", "p3", "p4"]);
    }

    #[tokio::test]
    async fn test_last_sync_filters_older_changes() {
        let (app, _) = test_app(Config::local());
        mutate(&app, &mutation(post("p1", "t"), MutationType::Create, None)).await;

        let all = sync(&app, "").await;
        assert_eq!(all.items.len(), 1);

        let later = all.items[0].last_changed_at + 1;
        let none = sync(&app, &format!("?lastSync={later}")).await;
        assert!(none.items.is_empty());
        assert!(none.next_token.is_none());
    }

    #[tokio::test]
    async fn test_page_limit_is_capped_by_config() {
        let config = Config {
            sync_page_limit: 2,
            ..Config::local()
        };
        let (app, _) = test_app(config);
        for i in 0..3 {
            let id = format!("p{i}");
            mutate(&app, &mutation(post(&id, "t"), MutationType::Create, None)).await;
        }

        let page = sync(&app, "?limit=50").await;
        assert_eq!(page.items.len(), 2);
        assert_eq!(
            page.next_token,
            Some(PageCursor::after(&page.items[1]).to_string())
        );
    }

    #[tokio::test]
    async fn test_record_edited_between_pages_is_still_delivered() {
        let (app, _) = test_app(Config::local());
        for i in 0..4 {
            let id = format!("p{i}");
            mutate(&app, &mutation(post(&id, "t"), MutationType::Create, None)).await;
        }

        let first = sync(&app, "?limit=2").await;
        let mut seen: Vec<String> = first.items.iter().map(|r| r.record.id.clone()).collect();
        let edited = first.items[0].clone();
        let (status, body) = mutate(
            &app,
            &mutation(
                post(&edited.record.id, "edited"),
                MutationType::Update,
                Some(edited.version),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let mut token = first.next_token;
        while let Some(t) = token {
            let page = sync(&app, &format!("?limit=2&nextToken={t}")).await;
            seen.extend(page.items.iter().map(|r| r.record.id.clone()));
            token = page.next_token;
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen, ["p0", "p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_checkpoint_trails_the_clock() {
        let config = Config {
            sync_checkpoint_lag_ms: 60_000,
            ..Config::local()
        };
        let (app, _) = test_app(config);
        let (_, body) = mutate(&app, &mutation(post("p1", "t"), MutationType::Create, None)).await;
        let written: RemoteRecord = serde_json::from_value(body).unwrap();

        let page = sync(&app, "").await;
        assert!(page.started_at + 60_000 >= written.last_changed_at);
        assert!(page.started_at < written.last_changed_at);

        // A delta sync from the checkpoint still sees the write.
        let delta = sync(&app, &format!("?lastSync={}", page.started_at)).await;
        assert_eq!(delta.items.len(), 1);
        assert_eq!(delta.items[0].record.id, "p1");
    }

    #[tokio::test]
    async fn test_invalid_token_is_bad_request() {
        let (app, _) = test_app(Config::local());

        let (status, body) = send(
            &app,
            Request::builder()
                .uri("/sync/Post?nextToken=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "BadRequest");
    }
}

#[cfg(test)]
mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn test_secret_is_required_when_configured() {
        let (app, _) = test_app(Config::local().with_auth_secret("s3cret"));

        let (status, body) = send(
            &app,
            Request::builder().uri("/sync/Post").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errorType"], "Unauthorized");

        let (status, _) = send(
            &app,
            Request::builder()
                .uri("/sync/Post")
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, _) = test_app(Config::local().with_auth_secret("s3cret"));

        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authRequired"], true);
    }
}

#[cfg(test)]
mod fan_out_tests {
    use super::*;

    #[tokio::test]
    async fn test_accepted_mutation_reaches_subscribers() {
        let (app, subscriptions) = test_app(Config::local());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = subscriptions.register(tx);
        subscriptions.subscribe(&conn, "Post");

        mutate(&app, &mutation(post("p1", "a"), MutationType::Create, None)).await;

        match rx.try_recv().unwrap() {
            ServerMessage::Data { record } => {
                assert_eq!(record.record.id, "p1");
                assert_eq!(record.version, 1);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replays_and_conflicts_are_not_published() {
        let (app, subscriptions) = test_app(Config::local());
        let request = mutation(post("p1", "a"), MutationType::Create, None);
        mutate(&app, &request).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = subscriptions.register(tx);
        subscriptions.subscribe(&conn, "Post");

        mutate(&app, &request).await;
        mutate(&app, &mutation(post("p1", "x"), MutationType::Update, Some(7))).await;

        assert!(rx.try_recv().is_err());
    }
}
