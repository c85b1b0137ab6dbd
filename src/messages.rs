//! Message types for the orchestrator mailbox.
//!
//! Callers talk to the [`Orchestrator`](crate::orchestrator::Orchestrator)
//! through an mpsc channel. Messages that need an answer carry a oneshot
//! sender; the actor replies once the message has been handled.
//!
//! ```text
//! Caller                             Orchestrator task
//! ------                             -----------------
//! 1. Build message + oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Validate / resolve against the Store
//!                                    4. Apply *Requested, hand effect to runner
//!                                    5. Reply on the oneshot
//! 6. Await oneshot receiver   <------
//! ```
//!
//! The reply to a submitted command only says whether the command was
//! accepted. The outcome of the backend call arrives later as a snapshot
//! change on the watch channel.
//!
//! Each variant with a reply has a helper returning the message together with
//! its receiver:
//!
//! ```rust
//! use brewbot::events::Command;
//! use brewbot::messages::OrchestratorMessage;
//!
//! let (msg, rx) = OrchestratorMessage::submit(Command::FetchPorts);
//! // tx.send(msg).await?;
//! // rx.await??;
//! ```

use crate::error::CommandError;
use crate::events::Command;
use crate::store::Store;
use tokio::sync::oneshot;

/// Messages accepted by the orchestrator task.
#[derive(Debug)]
pub enum OrchestratorMessage {
    /// Submit a command.
    ///
    /// # Response
    ///
    /// - `Ok(())`: accepted and dispatched
    /// - `Err(CommandError)`: rejected locally, nothing was sent to the backend
    ///
    /// Fire-and-forget senders (pollers) pass `None`.
    Submit {
        /// Command to run
        command: Command,
        /// Acceptance channel
        response: Option<oneshot::Sender<Result<(), CommandError>>>,
    },

    /// Wait until no backend call is in flight and every outcome has been applied.
    ///
    /// # Response
    ///
    /// The store as of that moment.
    Settle {
        /// Snapshot channel
        response: oneshot::Sender<Store>,
    },

    /// Stop accepting commands, wait for in-flight calls (bounded by the
    /// configured shutdown timeout), then exit.
    ///
    /// # Response
    ///
    /// Sent after the event loop has drained.
    Shutdown {
        /// Acknowledgement channel
        response: oneshot::Sender<()>,
    },
}

impl OrchestratorMessage {
    /// `Submit` with an acceptance receiver.
    pub fn submit(command: Command) -> (Self, oneshot::Receiver<Result<(), CommandError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Submit {
                command,
                response: Some(tx),
            },
            rx,
        )
    }

    /// `Submit` without a reply.
    pub fn enqueue(command: Command) -> Self {
        Self::Submit {
            command,
            response: None,
        }
    }

    /// `Settle` with its receiver.
    pub fn settle() -> (Self, oneshot::Receiver<Store>) {
        let (tx, rx) = oneshot::channel();
        (Self::Settle { response: tx }, rx)
    }

    /// `Shutdown` with its receiver.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
