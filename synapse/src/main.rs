#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use args::Args;
use clap::Parser;
use synapse_config::Config;
use synapse_llm::{
    ChatState, CompletionRequest, EventHub, LifecycleRegistry, Message, StreamState, StreamingHandler, TurnRequest,
};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    synapse_telemetry::init(config.telemetry.as_ref(), args.log_filter.as_deref())?;

    let provider = match args.provider {
        Some(provider) => provider,
        None => config
            .llm
            .providers
            .keys()
            .next()
            .cloned()
            .context("no LLM provider configured")?,
    };

    let hub = Arc::new(EventHub::new(config.llm.chat.event_buffer));
    let state = ChatState::from_config(&config.llm, hub.clone())?;

    let conversation_id = format!("cli-{}", std::process::id());
    let mut events = hub.subscribe(&conversation_id);

    let mut messages = Vec::new();
    if let Some(system) = args.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(args.prompt));

    tracing::info!(
        config_path = %args.config.display(),
        provider = %provider,
        model = %args.model,
        "starting chat turn"
    );

    let turn = TurnRequest::new(&conversation_id, provider, CompletionRequest::new(args.model, messages));
    let handler = StreamingHandler::new(state.clone());
    let running = tokio::spawn({
        let hub = hub.clone();
        let conversation_id = conversation_id.clone();
        async move {
            let outcome = handler.run(turn).await;
            // subscribers drain what is buffered, then see the channel close
            hub.close(&conversation_id);
            outcome
        }
    });

    tokio::spawn(cancel_on_interrupt(state.lifecycles().clone(), conversation_id));

    let mut stdout = std::io::stdout();
    loop {
        match events.recv().await {
            Ok(event) => writeln!(stdout, "{}", serde_json::to_string(&event)?)?,
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
    stdout.flush()?;

    let outcome = running.await.context("chat turn panicked")?;
    tracing::info!(state = ?outcome.state, finish_reason = %outcome.finish_reason, "chat turn finished");

    Ok(match outcome.state {
        StreamState::Done => ExitCode::SUCCESS,
        StreamState::Cancelled => ExitCode::from(130),
        StreamState::Failed | StreamState::Superseded | StreamState::TimedOut => ExitCode::FAILURE,
    })
}

/// Cancel the turn on Ctrl+C
async fn cancel_on_interrupt(lifecycles: LifecycleRegistry, conversation_id: String) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        return;
    }

    tracing::info!("interrupt received, cancelling turn");
    lifecycles.cancel(&conversation_id);
}
