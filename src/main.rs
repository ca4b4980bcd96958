use std::io::Write;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use parley_core::notify::TurnEvent;
use parley_core::orchestrator::SendOutcome;
use parley_core::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state = AppState::initialize()
        .await
        .context("failed to initialize")?;
    parley_core::core::logging::init(&state.paths);

    let mut events = state.notify.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TurnEvent::Token { token, .. } => {
                    print!("{token}");
                    let _ = std::io::stdout().flush();
                }
                TurnEvent::Completed { message, .. } => {
                    println!();
                    if !message.document_references.is_empty() {
                        for reference in &message.document_references {
                            println!(
                                "  [{}] {} ({:.2})",
                                reference.chunk_index.unwrap_or_default(),
                                reference.document_name,
                                reference.similarity
                            );
                        }
                    }
                }
                TurnEvent::Failed { error, .. } => eprintln!("\nerror: {error}"),
                TurnEvent::TurnStarted { .. } => {}
            }
        }
    });

    let session = state.sessions.create_session(None, vec![]).await?;
    tracing::info!("session {}", session.id);
    println!("parley — /tags <t1,t2> to enable document retrieval, /quit to exit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(tags) = line.strip_prefix("/tags ") {
            let tags: Vec<String> = tags
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            state
                .sessions
                .set_document_tags(&session.id, tags.clone())
                .await?;
            println!("document tags: {tags:?}");
            continue;
        }

        match state.orchestrator.send(&session.id, &line).await {
            Ok(SendOutcome::Completed(_)) => {}
            Ok(SendOutcome::Busy) => eprintln!("a turn is already running"),
            Err(err) => eprintln!("error: {err}"),
        }
    }

    Ok(())
}
