//! Terminal front end for a run.
//!
//! Events go out as JSON lines. Gate answers come in as text lines from a
//! channel fed by [`stdin_lines`], so waiting for an answer never blocks
//! shutdown: the wait also ends when the stop token fires.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use super::events::RunEvent;
use super::gate::{GateDecision, GateKeeper};

/// Read stdin lines on a background task.
///
/// The channel closes on EOF or a read error. Lines typed before a gate
/// opens answer the next gate.
pub fn stdin_lines() -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Write every event to `out` and answer gates from `answers`.
///
/// Returns once the event channel closes. A gate that is no longer open
/// when its event is read is not prompted for. Once `stop` fires, open
/// gates are left unanswered. A closed answer channel approves.
pub async fn relay_events<W: Write>(
    mut events: UnboundedReceiver<RunEvent>,
    gates: Arc<GateKeeper>,
    mut answers: UnboundedReceiver<String>,
    stop: CancellationToken,
    mut out: W,
) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
                    tracing::warn!(error = %e, "could not write event");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize event"),
        }

        let (gate_id, question) = match event {
            RunEvent::HumanGate {
                gate_id, question, ..
            }
            | RunEvent::MidpointGate {
                gate_id, question, ..
            } => (gate_id, question),
            _ => continue,
        };
        if stop.is_cancelled() || !gates.pending().contains(&gate_id) {
            tracing::debug!(gate_id = %gate_id, "gate no longer open, not prompting");
            continue;
        }

        eprintln!("{}", question);
        eprint!("Approve? [y/n <feedback>] ");
        let decision = tokio::select! {
            line = answers.recv() => match line {
                Some(line) => Some(GateDecision::parse_answer(&line)),
                // No interactive input: approve so the run can finish.
                None => Some(GateDecision::approve()),
            },
            _ = stop.cancelled() => None,
        };
        match decision {
            Some(decision) => {
                gates.resolve(&gate_id, decision);
            }
            None => eprintln!(),
        }
    }
}
