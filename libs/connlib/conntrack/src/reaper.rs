use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::table::ConnTable;

/// Periodically sweeps idle connections out of a [`ConnTable`] on a dedicated thread.
pub(crate) struct Reaper {
    stop_tx: flume::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub(crate) fn spawn(table: Arc<ConnTable>, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name("conntrack-reaper".to_owned())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(flume::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                    }

                    let evicted = table.evict_idle(Instant::now());

                    if evicted > 0 {
                        tracing::debug!(
                            %evicted,
                            remaining = %table.len(),
                            "Swept idle TCP connections"
                        );
                    }
                }

                tracing::debug!("Connection reaper stopped");
            })?;

        Ok(Self { stop_tx, handle })
    }

    /// Stops the reaper and waits for its thread to exit.
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.try_send(());

        if self.handle.join().is_err() {
            tracing::error!("Connection reaper panicked");
        }
    }
}
