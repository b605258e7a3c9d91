//! Build lifecycle transitions against PostgreSQL.
//!
//! Run with `DATABASE_URL` set: `cargo test -p keel-db -- --ignored`.

mod common;

use common::{database, next_within, some_job_build};
use keel_core::{BuildStatus, Event};
use keel_db::DbError;
use sqlx::PgPool;

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_job_builds_are_numbered_per_job(pool: PgPool) {
    let db = database(pool).await;
    let (pipeline, first) = some_job_build(&db).await;
    let second = pipeline.create_job_build("some-job").await.unwrap();

    assert_eq!(first.name, "1");
    assert_eq!(second.name, "2");
    assert_eq!(first.status, BuildStatus::Pending);
    let job = second.job.unwrap();
    assert_eq!(job.job_name, "some-job");
    assert_eq!(job.pipeline_name, "some-pipeline");

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_unknown_job_is_not_found(pool: PgPool) {
    let db = database(pool).await;
    let (_, pipeline) = common::some_pipeline(&db).await;

    let result = pipeline.create_job_build("no-such-job").await;
    assert!(matches!(result, Err(DbError::NotFound(_))));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_one_off_builds_have_no_job(pool: PgPool) {
    let db = database(pool).await;
    let team = db.team("main");
    let build = team.create_one_off_build().await.unwrap();

    assert!(build.is_one_off());
    assert_eq!(build.status, BuildStatus::Pending);
    assert_eq!(team.get_build(build.id).await.unwrap(), Some(build.clone()));
    assert_eq!(db.build(build.id).get_config().await.unwrap(), None);

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_start_records_engine_and_emits_status(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    assert!(build_db.start("some-engine", "some-metadata").await.unwrap());

    let started = build_db.get().await.unwrap().unwrap();
    assert_eq!(started.status, BuildStatus::Started);
    assert_eq!(started.engine.as_deref(), Some("some-engine"));
    assert_eq!(started.engine_metadata.as_deref(), Some("some-metadata"));
    let start_time = started.start_time.unwrap();

    let events = build_db.events(0).await.unwrap();
    let event = next_within(&events).await.unwrap();
    assert_eq!(event.id, 0);
    assert_eq!(
        event.event,
        Event::Status {
            status: BuildStatus::Started,
            time: start_time.timestamp(),
        }
    );

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_start_twice_reports_not_started(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    assert!(build_db.start("engine", "metadata").await.unwrap());
    assert!(!build_db.start("other-engine", "other").await.unwrap());

    let build = build_db.get().await.unwrap().unwrap();
    assert_eq!(build.engine.as_deref(), Some("engine"));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_start_has_one_winner(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let build_db = db.build(build.id);
        tasks.push(tokio::spawn(async move {
            build_db.start(&format!("engine-{i}"), "").await.unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_finish_emits_status_then_ends_stream(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    build_db.start("engine", "").await.unwrap();
    build_db.finish(BuildStatus::Succeeded).await.unwrap();

    let finished = build_db.get().await.unwrap().unwrap();
    assert_eq!(finished.status, BuildStatus::Succeeded);
    assert!(finished.is_finished());
    let end_time = finished.end_time.unwrap();

    let events = build_db.events(1).await.unwrap();
    let event = next_within(&events).await.unwrap();
    assert_eq!(
        event.event,
        Event::Status {
            status: BuildStatus::Succeeded,
            time: end_time.timestamp(),
        }
    );
    assert!(matches!(
        next_within(&events).await,
        Err(DbError::EndOfStream)
    ));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_finish_requires_started_build(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    let result = build_db.finish(BuildStatus::Failed).await;
    assert!(matches!(
        result,
        Err(DbError::InvalidTransition {
            from: BuildStatus::Pending,
            to: BuildStatus::Failed,
            ..
        })
    ));

    build_db.start("engine", "").await.unwrap();
    let result = build_db.finish(BuildStatus::Aborted).await;
    assert!(matches!(result, Err(DbError::InvalidInput(_))));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_abort_pending_build(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    build_db.abort().await.unwrap();

    let aborted = build_db.get().await.unwrap().unwrap();
    assert_eq!(aborted.status, BuildStatus::Aborted);
    assert!(aborted.end_time.is_some());

    let events = build_db.events(0).await.unwrap();
    let event = next_within(&events).await.unwrap();
    assert!(matches!(
        event.event,
        Event::Status {
            status: BuildStatus::Aborted,
            ..
        }
    ));
    assert!(matches!(
        next_within(&events).await,
        Err(DbError::EndOfStream)
    ));

    let result = build_db.abort().await;
    assert!(matches!(result, Err(DbError::InvalidTransition { .. })));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_mark_as_failed_records_cause(pool: PgPool) {
    let db = database(pool).await;
    let (_, build) = some_job_build(&db).await;
    let build_db = db.build(build.id);

    build_db.start("engine", "").await.unwrap();
    build_db.mark_as_failed("some failure").await.unwrap();

    let errored = build_db.get().await.unwrap().unwrap();
    assert_eq!(errored.status, BuildStatus::Errored);

    let events = build_db.events(1).await.unwrap();
    let error = next_within(&events).await.unwrap();
    assert_eq!(error.event, Event::error("some failure"));
    let status = next_within(&events).await.unwrap();
    assert_eq!(
        status.event,
        Event::Status {
            status: BuildStatus::Errored,
            time: errored.end_time.unwrap().timestamp(),
        }
    );
    assert!(matches!(
        next_within(&events).await,
        Err(DbError::EndOfStream)
    ));

    db.close().await;
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_transitions_on_missing_build(pool: PgPool) {
    let db = database(pool).await;
    let build_db = db.build(keel_core::BuildId::new(424242));

    assert!(matches!(
        build_db.start("engine", "").await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(build_db.abort().await, Err(DbError::NotFound(_))));
    assert!(matches!(
        build_db.get_config().await,
        Err(DbError::NotFound(_))
    ));
    assert_eq!(build_db.get().await.unwrap(), None);

    db.close().await;
}
