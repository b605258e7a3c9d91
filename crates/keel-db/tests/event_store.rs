//! Build event log and cursors against PostgreSQL.
//!
//! Run with `DATABASE_URL` set: `cargo test -p keel-db -- --ignored`.

mod common;

use common::{database, next_within, some_job_build};
use futures::StreamExt;
use keel_core::{BuildId, BuildStatus, Event};
use keel_db::DbError;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::time::Duration;

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_saved_events_reach_existing_subscribers(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    let events = build_db.events(0).await.unwrap();

    let first = build_db.save_event(&Event::log("some ")).await.unwrap();
    assert_eq!(first, 0);
    assert_eq!(next_within(&events).await.unwrap().event, Event::log("some "));

    let second = build_db.save_event(&Event::log("log")).await.unwrap();
    assert_eq!(second, 1);
    let event = next_within(&events).await.unwrap();
    assert_eq!(event.id, 1);
    assert_eq!(event.event, Event::log("log"));
    assert_eq!(events.position(), 2);

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_subscribing_from_offset(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    build_db.save_event(&Event::log("some ")).await.unwrap();
    build_db.save_event(&Event::log("log")).await.unwrap();

    let events = build_db.events(1).await.unwrap();
    let event = next_within(&events).await.unwrap();
    assert_eq!(event.id, 1);
    assert_eq!(event.event, Event::log("log"));

    build_db.save_event(&Event::log("more")).await.unwrap();
    assert_eq!(next_within(&events).await.unwrap().event, Event::log("more"));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_events_on_missing_build(pool: PgPool) {
    let db = database(pool).await;
    let build_db = db.build(BuildId::new(424242));

    assert!(matches!(
        build_db.events(0).await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        build_db.save_event(&Event::log("orphan")).await,
        Err(DbError::NotFound(_))
    ));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_appends_are_gapless(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let build_db = db.build(build.id);
        tasks.push(tokio::spawn(async move {
            build_db
                .save_event(&Event::log(format!("line {i}")))
                .await
                .unwrap()
        }));
    }

    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap());
    }
    assert_eq!(ids, (0..20).collect::<BTreeSet<i64>>());

    let events = db.build(build.id).events(0).await.unwrap();
    for expected in 0..20 {
        assert_eq!(next_within(&events).await.unwrap().id, expected);
    }

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_subscriber_in_another_process_is_woken(pool: PgPool) {
    let writer = database(pool.clone()).await;
    let reader = database(pool).await;
    let (_, build) = some_job_build(&writer).await;

    let events = reader.build(build.id).events(0).await.unwrap();
    let waiting = tokio::spawn(async move { next_within(&events).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    writer
        .build(build.id)
        .save_event(&Event::log("hello"))
        .await
        .unwrap();

    let event = waiting.await.unwrap().unwrap();
    assert_eq!(event.event, Event::log("hello"));

    writer.close().await;
    reader.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_close_releases_waiting_reader(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;

    let events = std::sync::Arc::new(db.build(build.id).events(0).await.unwrap());
    let waiting = {
        let events = events.clone();
        tokio::spawn(async move { events.next().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    events.close();

    assert!(matches!(
        waiting.await.unwrap(),
        Err(DbError::StreamClosed)
    ));
    assert!(matches!(events.next().await, Err(DbError::StreamClosed)));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stream_of_finished_build(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    build_db.start("engine", "").await.unwrap();
    build_db.save_event(&Event::log("output")).await.unwrap();
    build_db.finish(BuildStatus::Failed).await.unwrap();

    let collected: Vec<_> = build_db
        .events(0)
        .await
        .unwrap()
        .into_stream()
        .map(|result| result.unwrap().event.kind())
        .collect()
        .await;

    assert_eq!(collected, vec!["status", "log", "status"]);

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_finished_build_rejects_new_events(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    build_db.start("engine", "").await.unwrap();
    build_db.finish(BuildStatus::Succeeded).await.unwrap();

    let events = build_db.events(0).await.unwrap();
    assert_eq!(next_within(&events).await.unwrap().id, 0);
    assert_eq!(next_within(&events).await.unwrap().id, 1);
    assert!(matches!(next_within(&events).await, Err(DbError::EndOfStream)));

    match build_db.save_event(&Event::log("late")).await {
        Err(DbError::BuildCompleted(id)) => assert_eq!(id, build.id),
        other => panic!("expected completed build, got {other:?}"),
    }
    assert!(matches!(next_within(&events).await, Err(DbError::EndOfStream)));

    // Aborting is a transition too and stays rejected.
    assert!(matches!(
        build_db.abort().await,
        Err(DbError::InvalidTransition { .. })
    ));
    assert!(matches!(
        db.build(BuildId::new(build.id.get() + 100))
            .save_event(&Event::log("nowhere"))
            .await,
        Err(DbError::NotFound(_))
    ));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_close_stops_bus_and_pool(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let events = db.build(build.id).events(0).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), db.close())
        .await
        .expect("database did not close");

    assert!(db.bus().is_closed());
    assert!(db.pool().is_closed());
    assert!(matches!(
        db.bus().listen("anything").await,
        Err(DbError::BusClosed)
    ));
    assert!(matches!(next_within(&events).await, Err(DbError::Database(_))));
}
