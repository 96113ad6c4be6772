//! Command implementations for the Tessera CLI.

pub mod chat;
pub mod replay;

use std::process::ExitCode;

use tessera_stream::{
    AbortReason, CancelHandle, DisplayFrame, SessionEnd, SessionOutcome, StreamError, StreamSession,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::render::{self, FramePrinter};

/// Exit code for a turn stopped by the user, as for SIGINT.
const EXIT_STOPPED: u8 = 130;

/// Runs `session` while printing its frames, then prints the outcome.
///
/// Ctrl-C stops a running turn. Once the turn has finished, it skips the
/// rest of the reveal instead.
pub async fn run_session(session: StreamSession) -> anyhow::Result<ExitCode> {
    let (skip_tx, skip_rx) = oneshot::channel();
    let printer = spawn_printer(&session, skip_rx);
    let interrupt = spawn_interrupt(session.cancel_handle(), skip_tx);
    let result = session.run().await;
    // A completed turn may still be revealing; the printer stops when the reveal ends or is skipped.
    let printer = printer.await;
    interrupt.abort();

    if let Ok(mut printer) = printer {
        if let Ok(outcome) = &result {
            printer.frame(&DisplayFrame {
                turn_id: outcome.turn.id().clone(),
                text: outcome.turn.visible_content().to_string(),
            });
        }
        printer.finish();
    }

    match result {
        Ok(outcome) => {
            render::print_outcome(&outcome);
            Ok(exit_code(&outcome))
        }
        Err(StreamError::Aborted(reason)) => {
            render::print_abort(reason);
            Ok(abort_code(reason))
        }
        Err(err) => Err(err.into()),
    }
}

fn spawn_interrupt(handle: CancelHandle, skip: oneshot::Sender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        if handle.cancel() {
            debug!("Interrupt received");
        } else {
            debug!("Interrupt received after the turn ended; skipping reveal");
            let _ = skip.send(());
        }
    })
}

fn spawn_printer(session: &StreamSession, mut skip: oneshot::Receiver<()>) -> JoinHandle<FramePrinter> {
    let mut frames = session.subscribe_frames();
    let mut turns = session.subscribe_turns();
    tokio::spawn(async move {
        let mut printer = FramePrinter::default();
        let mut turns_open = true;
        let mut skip_armed = true;
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => printer.frame(&frame),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                turn = turns.recv(), if turns_open => match turn {
                    Ok(turn) => printer.status(&turn),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => turns_open = false,
                },
                skipped = &mut skip, if skip_armed => match skipped {
                    Ok(()) => break,
                    Err(_) => skip_armed = false,
                },
            }
        }
        printer
    })
}

fn exit_code(outcome: &SessionOutcome) -> ExitCode {
    match outcome.end {
        SessionEnd::Completed => ExitCode::SUCCESS,
        SessionEnd::Cancelled(reason) => abort_code(reason),
        SessionEnd::Errored(_) | SessionEnd::EndOfInput => ExitCode::FAILURE,
    }
}

fn abort_code(reason: AbortReason) -> ExitCode {
    match reason {
        AbortReason::UserCancelled => ExitCode::from(EXIT_STOPPED),
        AbortReason::Timeout => ExitCode::FAILURE,
    }
}
