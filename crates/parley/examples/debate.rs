//! A three-round debate between two roles with a canned generator.

use async_trait::async_trait;
use parley::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Answers every turn with a numbered line; concedes on the fifth call.
#[derive(Debug, Default)]
struct CannedClient {
    calls: AtomicU32,
}

#[async_trait]
impl GenerationClient for CannedClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, FlowError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let speaker = request.role_prompt.lines().next().unwrap_or_default();
        if call == 5 {
            return Ok("You make a fair case. I concede.".to_string());
        }
        Ok(format!(
            "[{speaker}] Argument {call}, replying to {} earlier turns.",
            request.messages.len()
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let flow = FlowBuilder::new("debate")
        .named("Two-sided debate")
        .then(Step::start("start"))
        .then(Step::dialogue(
            "opening",
            DialogueConfig::fixed("moderator").with_task("Introduce the motion"),
        ))
        .then(Step::repeat("rounds", 3))
        .child(
            "rounds",
            Step::dialogue(
                "argue",
                DialogueConfig::new(RoleAssignment::RoundRobin(vec![
                    "pro".into(),
                    "con".into(),
                ]))
                .with_context(ContextPolicy::Recent(Some(4))),
            ),
        )
        .then(Step::end("end"))
        .terminate_when(TerminationRules::default().keyword("I concede"))
        .build();

    let store = InMemoryStore::new();
    store.insert_flow(flow).await;

    let roles = RoleDirectory::new()
        .with(Role::new("moderator", "Moderator", "You moderate the debate."))
        .with(Role::new("pro", "Proponent", "You argue for the motion."))
        .with(Role::new("con", "Opponent", "You argue against the motion."));

    let engine = FlowEngine::builder()
        .roles(Arc::new(roles))
        .generator(Arc::new(CannedClient::default()))
        .store(Arc::new(store.clone()))
        .build()?;

    let session = engine
        .create_session(NewSession::new("demo", "debate").topic("Cities should ban cars"))
        .await?;
    let report = engine.run_session(&session, CancellationToken::new()).await?;

    for message in &report.messages {
        println!("#{} {}: {}", message.round_index, message.role_name, message.summary());
    }
    println!("status: {}", report.status);
    if let Some(reason) = &report.termination {
        println!("ended early: {reason}");
    }

    let stats = engine.statistics(&session).await?;
    println!(
        "{} log entries, {} completed, {} skipped",
        stats.total, stats.completed, stats.skipped
    );

    Ok(())
}
