mod common;

use common::{ARTICLE_SLUG, Fixture};
use conduit_services::context::{CallContext, Interrupted};
use conduit_services::favorites::{FavoriteError, FavoriteService, FavoriteState};
use conduit_services::storage::{FailPoint, MockConduitStorage, MockWrite};
use std::time::Duration;

#[tokio::test]
async fn test_favorite_twice_counts_once() {
    let fx = Fixture::new(&[]);
    let service = FavoriteService::new(fx.storage.clone());
    let ctx = CallContext::background();

    let first = service.add_favorite(ARTICLE_SLUG, "jane", &ctx).await.unwrap();
    let second = service.add_favorite(ARTICLE_SLUG, "jane", &ctx).await.unwrap();

    assert!(first.changed);
    assert_eq!(
        second,
        FavoriteState {
            favorited: true,
            favorites_count: 1,
            changed: false,
        }
    );
    assert_eq!(fx.favorites_count(), 1);
    assert_eq!(fx.storage.favorite_rows(fx.article.id), 1);
    let writes = fx.storage.write_log();
    assert_eq!(writes.len(), 1);
    assert!(writes.iter().all(MockWrite::is_favorite_association));
}

#[tokio::test]
async fn test_unfavorite_without_favorite_is_noop() {
    let fx = Fixture::new(&[]);
    let service = FavoriteService::new(fx.storage.clone());

    let state = service
        .remove_favorite(ARTICLE_SLUG, "jane", &CallContext::background())
        .await
        .unwrap();

    assert!(!state.favorited);
    assert!(!state.changed);
    assert_eq!(state.favorites_count, 0);
    assert!(fx.storage.write_log().is_empty());
}

#[tokio::test]
async fn test_round_trip_restores_counter() {
    let fx = Fixture::new(&[]);
    let fx_storage = fx.storage.clone().with_favorite(fx.article.id, fx.author.id);
    let service = FavoriteService::new(fx_storage);
    let ctx = CallContext::background();
    let before = fx.favorites_count();

    service.add_favorite(ARTICLE_SLUG, "jane", &ctx).await.unwrap();
    assert_eq!(fx.favorites_count(), before + 1);

    service
        .remove_favorite(ARTICLE_SLUG, "jane", &ctx)
        .await
        .unwrap();
    assert_eq!(fx.favorites_count(), before);
}

#[tokio::test]
async fn test_missing_article_is_not_found() {
    let fx = Fixture::new(&[]);
    let service = FavoriteService::new(fx.storage.clone());

    let err = service
        .add_favorite("no-such-article", "jane", &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(err, FavoriteError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_failure_keeps_favorite() {
    let fx = Fixture::new(&[]);
    let storage = fx.storage.clone().with_favorite(fx.article.id, fx.reader.id);
    storage.fail_on(FailPoint::DeleteFavorite);
    let service = FavoriteService::new(storage);

    let err = service
        .remove_favorite(ARTICLE_SLUG, "jane", &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(err, FavoriteError::WriteFailed(_)));
    assert_eq!(fx.storage.favorite_rows(fx.article.id), 1);
    assert_eq!(fx.favorites_count(), 1);
}

#[tokio::test]
async fn test_begin_failure_is_transaction_error() {
    let fx = Fixture::new(&[]);
    fx.storage.fail_on(FailPoint::Begin);
    let service = FavoriteService::new(fx.storage.clone());

    let err = service
        .add_favorite(ARTICLE_SLUG, "jane", &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(err, FavoriteError::Transaction(_)));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_leaves_no_favorite() {
    let fx = Fixture::from_storage(
        MockConduitStorage::new().with_latency(Duration::from_millis(30)),
        &[],
    );
    let service = FavoriteService::new(fx.storage.clone());
    let ctx = CallContext::background().with_timeout(Duration::from_millis(100));

    let err = service
        .add_favorite(ARTICLE_SLUG, "jane", &ctx)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FavoriteError::Interrupted(Interrupted::DeadlineExceeded)
    ));
    assert_eq!(fx.storage.favorite_rows(fx.article.id), 0);
    assert_eq!(fx.favorites_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_favorites_by_different_users_both_count() {
    let fx = Fixture::from_storage(
        MockConduitStorage::new().with_latency(Duration::from_millis(5)),
        &[],
    );
    let service = FavoriteService::new(fx.storage.clone());

    let handles: Vec<_> = ["jake", "jane"]
        .into_iter()
        .map(|username| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .add_favorite(ARTICLE_SLUG, username, &CallContext::background())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(fx.storage.favorite_rows(fx.article.id), 2);
    assert_eq!(fx.favorites_count(), 2);
}
