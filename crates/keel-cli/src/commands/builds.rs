//! Build commands.

use anyhow::{Context, Result};
use keel_core::{Build, BuildId, BuildStatus, Event};
use keel_db::{BuildEvent, Database, DbError, TeamDb};
use std::io::Write;
use std::sync::Arc;

pub async fn create(team: &TeamDb, job: Option<(String, String)>) -> Result<()> {
    let build = match job {
        Some((pipeline, job)) => {
            team.pipeline(&pipeline)
                .await?
                .create_job_build(&job)
                .await?
        }
        None => team.create_one_off_build().await?,
    };

    println!("Created build {} ({})", build.id, describe(&build));
    Ok(())
}

pub async fn show(db: &Database, team: &TeamDb, id: i64) -> Result<()> {
    let id = BuildId::new(id);
    let build = team
        .get_build(id)
        .await?
        .with_context(|| format!("Build {} not found in team {}", id, team.name()))?;

    println!("Build:   {} ({})", build.id, describe(&build));
    println!("Status:  {}", build.status);
    if let Some(engine) = &build.engine {
        println!("Engine:  {}", engine);
    }
    if let Some(start) = build.start_time {
        println!("Started: {}", start.to_rfc3339());
    }
    if let Some(end) = build.end_time {
        println!("Ended:   {}", end.to_rfc3339());
    }

    let (inputs, outputs) = db.build(id).get_resources().await?;
    for input in inputs {
        println!(
            "Input:   {} <- {} {}",
            input.name,
            input.versioned_resource.resource,
            serde_json::to_string(&input.versioned_resource.version)?
        );
    }
    for output in outputs {
        println!(
            "Output:  {} {}",
            output.versioned_resource.resource,
            serde_json::to_string(&output.versioned_resource.version)?
        );
    }
    Ok(())
}

/// Follow the event log until the build ends or Ctrl-C closes the cursor.
pub async fn watch(db: &Database, id: i64, from: i64) -> Result<()> {
    let events = Arc::new(db.build(BuildId::new(id)).events(from).await?);

    let interrupt = {
        let events = events.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                events.close();
            }
        })
    };

    let result = loop {
        match events.next().await {
            Ok(event) => print_event(&event)?,
            Err(DbError::EndOfStream) => break Ok(()),
            Err(DbError::StreamClosed) => {
                eprintln!("Stopped at event {}", events.position());
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        }
    };

    interrupt.abort();
    result
}

fn print_event(event: &BuildEvent) -> Result<()> {
    match &event.event {
        Event::Log { payload, .. } => {
            print!("{}", payload);
            std::io::stdout().flush()?;
        }
        Event::Status { status, .. } => println!("[status] {}", status),
        Event::Error { message, .. } => eprintln!("[error] {}", message),
        Event::Initialize { origin, .. } => println!("[initialize] {}", origin.id),
        Event::Start { origin, .. } => println!("[start] {}", origin.id),
        Event::Finish {
            origin,
            exit_status,
            ..
        } => println!("[finish] {} exited {}", origin.id, exit_status),
    }
    Ok(())
}

pub async fn start(db: &Database, id: i64, engine: &str, metadata: &str) -> Result<()> {
    if db.build(BuildId::new(id)).start(engine, metadata).await? {
        println!("Started build {}", id);
    } else {
        println!("Build {} was not pending; nothing to do", id);
    }
    Ok(())
}

pub async fn finish(db: &Database, id: i64, status: BuildStatus) -> Result<()> {
    db.build(BuildId::new(id)).finish(status).await?;
    println!("Build {} {}", id, status);
    Ok(())
}

pub async fn abort(db: &Database, id: i64) -> Result<()> {
    db.build(BuildId::new(id)).abort().await?;
    println!("Aborted build {}", id);
    Ok(())
}

pub async fn fail(db: &Database, id: i64, message: &str) -> Result<()> {
    db.build(BuildId::new(id)).mark_as_failed(message).await?;
    println!("Marked build {} as errored", id);
    Ok(())
}

fn describe(build: &Build) -> String {
    match &build.job {
        Some(job) => format!("{}/{} #{}", job.pipeline_name, job.job_name, build.name),
        None => format!("one-off #{}", build.name),
    }
}
