use crate::budget::TickBudget;
use crate::error::LoaderError;
use crate::scheduler::SchedulerShared;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Auto-reset event. Signals coalesce, a waiter consumes at most one.
pub(crate) struct Event {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Event {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Event { tx, rx }
    }
}

impl Event {
    pub fn signal(&self) {
        // Full means already signaled
        let _ = self.tx.try_send(());
    }

    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

const SUSPENDED_POLL_INTERVAL: Duration = Duration::from_millis(1);

// Dedicated thread that runs the scheduling pass while not suspended, and otherwise sleeps on
// the new-work event. Ends when the finish channel is signalled.
pub(crate) struct LoadingThread {
    finish_tx: Sender<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl LoadingThread {
    pub fn start(shared: Arc<SchedulerShared>) -> Result<Self, LoaderError> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let join_handle = std::thread::Builder::new()
            .name("Async Loading Thread".into())
            .spawn(move || run(&shared, &finish_rx))
            .map_err(|source| LoaderError::ThreadSpawn {
                name: "async loading thread",
                source,
            })?;

        log::info!("Started async loading thread");
        Ok(LoadingThread {
            finish_tx,
            join_handle: Some(join_handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            let _ = self.finish_tx.send(());
            if join_handle.join().is_err() {
                log::error!("Async loading thread panicked");
            } else {
                log::info!("Stopped async loading thread");
            }
        }
    }
}

impl Drop for LoadingThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    shared: &SchedulerShared,
    finish_rx: &Receiver<()>,
) {
    profiling::register_thread!("Async Loading Thread");
    let should_stop = || !finish_rx.is_empty();

    while !should_stop() {
        if shared.is_cancel_requested() {
            shared.cancel_internal();
            continue;
        }

        if shared.is_suspended() {
            log::debug!("Async loading thread suspended");
            shared.suspended_event.signal();
            while shared.is_suspended() && !should_stop() {
                std::thread::sleep(SUSPENDED_POLL_INTERVAL);
            }
            log::debug!("Async loading thread resumed");
            shared.resumed_event.signal();
            continue;
        }

        if !shared.has_async_work() {
            crossbeam_channel::select! {
                recv(finish_rx) -> _msg => {
                    return;
                },
                recv(shared.queued_requests_event.receiver()) -> _msg => {},
                default(shared.config.idle_wait()) => {},
            }
            continue;
        }

        profiling::scope!("async loading pass");
        let mut budget = TickBudget::unlimited();
        shared.tick_async_thread(&mut budget);
    }
}
