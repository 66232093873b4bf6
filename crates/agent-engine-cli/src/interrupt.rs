//! Ctrl-C handling for the whole process.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Routes Ctrl-C to the reply in flight, or to `quit` when idle.
///
/// One listener serves the whole process lifetime.
#[derive(Clone)]
pub struct Interrupts {
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
    quit: CancellationToken,
}

impl Interrupts {
    /// Spawn the listener.
    pub fn listen() -> Self {
        let interrupts = Self {
            in_flight: Arc::default(),
            quit: CancellationToken::new(),
        };
        let listener = interrupts.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !listener.interrupt() {
                    break;
                }
            }
        });
        interrupts
    }

    /// Cancel the operation in flight. When idle, request quit instead and
    /// return `false`.
    fn interrupt(&self) -> bool {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match in_flight {
            Some(token) => {
                tracing::debug!("Interrupt: cancelling reply");
                token.cancel();
                true
            }
            None => {
                tracing::debug!("Interrupt: quitting");
                self.quit.cancel();
                false
            }
        }
    }

    /// Token for a new operation; Ctrl-C cancels it until [`Self::end`].
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    pub fn end(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Fires once Ctrl-C arrives while idle.
    pub const fn quit(&self) -> &CancellationToken {
        &self.quit
    }
}
