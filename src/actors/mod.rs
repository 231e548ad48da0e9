//! Background actors.
//!
//! Each actor is an independent tokio task owned through an [`ActorHandle`].
//! Dropping the handle does not stop the actor; call
//! [`ActorHandle::shutdown`].

pub mod heartbeat;

use tokio_util::sync::CancellationToken;

pub use heartbeat::HeartbeatActor;

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the actor to stop after its current tick.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
