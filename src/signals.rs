//! Signal handling for graceful shutdown.
//!
//! SIGINT (Ctrl-C) and SIGTERM both mean "stop watching": the caller joins
//! the monitor loop and exits. Handlers are installed up front so a signal
//! that arrives while the monitor is starting is not lost.
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Which shutdown signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalHandler {
    /// Register handlers for SIGINT and SIGTERM. Must be called inside a
    /// tokio runtime.
    pub fn install() -> std::io::Result<SignalHandler> {
        Ok(SignalHandler {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first shutdown signal.
    pub async fn wait(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.interrupt.recv() => Shutdown::Interrupt,
            _ = self.terminate.recv() => Shutdown::Terminate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal as NixSignal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_is_reported() {
        let mut handler = SignalHandler::install().unwrap();
        raise(NixSignal::SIGTERM).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), handler.wait())
            .await
            .unwrap();
        assert_eq!(got, Shutdown::Terminate);
    }
}
