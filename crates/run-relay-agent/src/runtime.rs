//! Run driver: pulls step events from a source, encodes them, emits messages.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use run_relay_core::message::RunMessage;

use crate::encoder::{MessageEncoder, RunContext};
use crate::source::StepSource;
use crate::{RunOutcome, RunStatus, StepEvent};

fn emit(out: &mpsc::UnboundedSender<RunMessage>, messages: Vec<RunMessage>, count: &mut usize) {
    for message in messages {
        debug!(
            message_id = %message.message_id,
            step_number = message.step_number,
            message_type = ?message.message_type(),
            "Emitting run message"
        );
        if out.send(message).is_ok() {
            *count += 1;
        }
    }
}

/// Drive one run to completion, failure, or cancellation.
///
/// The user's query is emitted first. Messages leave through `out` strictly in
/// encoding order. On cancel the source is left to stop on its own and exactly
/// one terminal message is emitted.
pub async fn drive_run(
    source: Arc<dyn StepSource>,
    encoder: &MessageEncoder,
    mut ctx: RunContext,
    query: String,
    cancel: CancellationToken,
    out: mpsc::UnboundedSender<RunMessage>,
) -> RunOutcome {
    let start = Instant::now();
    let mut emitted = 0usize;
    info!(session_id = %ctx.session_id(), source = source.name(), "Run started");

    emit(&out, vec![encoder.user_query(&ctx, &query)], &mut emitted);

    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<StepEvent>();
    let source_cancel = cancel.child_token();
    let handle = {
        let source = source.clone();
        tokio::spawn(async move { source.run(query, step_tx, source_cancel).await })
    };

    let mut cancelled = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            event = step_rx.recv() => match event {
                Some(event) => match encoder.encode(&mut ctx, event) {
                    Ok(messages) => emit(&out, messages, &mut emitted),
                    Err(e) => warn!(session_id = %ctx.session_id(), %e, "Skipping step event"),
                },
                None => break,
            },
        }
    }

    let status = if cancelled {
        info!(session_id = %ctx.session_id(), "Run cancelled");
        emit(&out, encoder.cancelled(&mut ctx), &mut emitted);
        RunStatus::Cancelled
    } else {
        match handle.await {
            Ok(Ok(())) => {
                emit(&out, encoder.finish(&mut ctx), &mut emitted);
                RunStatus::Completed
            }
            Ok(Err(e)) => {
                error!(session_id = %ctx.session_id(), %e, "Step source failed");
                let message = e.to_string();
                emit(&out, encoder.failed(&mut ctx, &message), &mut emitted);
                RunStatus::Failed { message }
            }
            Err(e) => {
                error!(session_id = %ctx.session_id(), %e, "Step source task panicked");
                let message = format!("step source aborted: {e}");
                emit(&out, encoder.failed(&mut ctx, &message), &mut emitted);
                RunStatus::Failed { message }
            }
        }
    };

    let outcome = RunOutcome {
        status,
        last_step: ctx.step_number(),
        messages_emitted: emitted,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        session_id = %ctx.session_id(),
        status = ?outcome.status,
        messages = outcome.messages_emitted,
        duration_ms = outcome.duration_ms,
        "Run finished"
    );
    outcome
}
