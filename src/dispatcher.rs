use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use log::{error, info};
use thiserror::Error;

use crate::controller::{ControllerError, ControllerHandle};

/// Normal motions leave headroom in the controller's typically-18-deep
/// planner; barrier commands (pen actuations) must drain the buffer almost
/// fully before issuing, since the next planned move must not begin until
/// the pen has finished moving.
pub const NICE_SIZE_NORMAL: usize = 16;
pub const NICE_SIZE_BARRIER: usize = 2;

const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(10);
const DEFAULT_BUFFER_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("dispatcher was not started")]
    NotStarted,
}

/// The raw line plus the derived buffer-nice-size threshold it must wait
/// for before being sent.
#[derive(Debug, Clone)]
struct CommandRecord {
    line: String,
    nice_size: usize,
}

impl CommandRecord {
    fn new(line: String, nice_size_normal: usize, nice_size_barrier: usize) -> Self {
        let nice_size = if line.trim_start().starts_with("M3") {
            nice_size_barrier
        } else {
            nice_size_normal
        };

        Self { line, nice_size }
    }
}

struct PendingCount {
    count: Mutex<usize>,
    drained: Condvar,
}

impl PendingCount {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn increment(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_for_zero(&self) {
        let mut count = self.count.lock().unwrap();
        while *count != 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

/// Single producer/single consumer G-code sender. Callers enqueue lines;
/// one background worker drains the queue, gating each line on observed
/// planner-buffer occupancy before writing it to the controller.
pub struct Dispatcher {
    controller: Arc<dyn ControllerHandle>,
    sender: channel::Sender<CommandRecord>,
    running: Arc<AtomicBool>,
    pending: Arc<PendingCount>,
    failure: Arc<Mutex<Option<DispatchError>>>,
    handle: Option<thread::JoinHandle<()>>,
    idle_poll: Duration,
    buffer_poll: Duration,
    nice_size_normal: usize,
    nice_size_barrier: usize,
}

impl Dispatcher {
    pub fn new(controller: Arc<dyn ControllerHandle>) -> Self {
        Self::with_poll_intervals(controller, DEFAULT_IDLE_POLL, DEFAULT_BUFFER_POLL)
    }

    pub fn with_poll_intervals(
        controller: Arc<dyn ControllerHandle>,
        idle_poll: Duration,
        buffer_poll: Duration,
    ) -> Self {
        Self::with_config(
            controller,
            idle_poll,
            buffer_poll,
            NICE_SIZE_NORMAL,
            NICE_SIZE_BARRIER,
        )
    }

    /// Full constructor, wiring every knob `DispatchConfig` exposes instead
    /// of falling back to the module's default constants.
    pub fn with_config(
        controller: Arc<dyn ControllerHandle>,
        idle_poll: Duration,
        buffer_poll: Duration,
        nice_size_normal: usize,
        nice_size_barrier: usize,
    ) -> Self {
        let (sender, _receiver) = channel::unbounded();
        Self {
            controller,
            sender,
            running: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(PendingCount::new()),
            failure: Arc::new(Mutex::new(None)),
            handle: None,
            idle_poll,
            buffer_poll,
            nice_size_normal,
            nice_size_barrier,
        }
    }

    /// Spawns the background worker. Calls
    /// `Controller::ensure_buffer_report_enabled` exactly once before
    /// entering the main loop.
    pub fn start(&mut self) {
        let (sender, receiver) = channel::unbounded();
        self.sender = sender;

        let controller = self.controller.clone();
        let running = self.running.clone();
        let pending = self.pending.clone();
        let failure = self.failure.clone();
        let idle_poll = self.idle_poll;
        let buffer_poll = self.buffer_poll;

        running.store(true, Ordering::SeqCst);

        let handle = thread::spawn(move || {
            if let Err(err) = controller.ensure_buffer_report_enabled() {
                error!("Failed to enable buffer status reporting: {}", err);
                *failure.lock().unwrap() = Some(DispatchError::Controller(err));
                running.store(false, Ordering::SeqCst);
                return;
            }

            while running.load(Ordering::SeqCst) {
                let record = match receiver.try_recv() {
                    Ok(record) => record,
                    Err(channel::TryRecvError::Empty) => {
                        thread::sleep(idle_poll);
                        continue;
                    }
                    Err(channel::TryRecvError::Disconnected) => break,
                };

                loop {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }

                    match controller.planning_buffer_occupancy() {
                        Ok(occupancy) if occupancy <= record.nice_size => break,
                        Ok(_) => thread::sleep(buffer_poll),
                        Err(err) => {
                            error!("Failed to poll planner buffer: {}", err);
                            *failure.lock().unwrap() = Some(DispatchError::Controller(err));
                            running.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }

                if let Err(err) = controller.command(&record.line) {
                    error!("Failed to send '{}': {}", record.line.trim_end(), err);
                    *failure.lock().unwrap() = Some(DispatchError::Controller(err));
                    running.store(false, Ordering::SeqCst);
                    pending.decrement();
                    return;
                }

                pending.decrement();
            }
        });

        self.handle = Some(handle);
    }

    /// Enqueues a line for sending. Strict FIFO: wire order matches enqueue
    /// order.
    pub fn enqueue(&self, line: impl Into<String>) {
        let record = CommandRecord::new(line.into(), self.nice_size_normal, self.nice_size_barrier);
        self.pending.increment();
        // A disconnected channel means the worker has already exited after a
        // failure; the increment above is undone so wait_for_empty_queue
        // doesn't hang on a line that will never be processed.
        if self.sender.send(record).is_err() {
            self.pending.decrement();
        }
    }

    /// Blocks until every enqueued line has been sent (or the worker gave
    /// up after a failure).
    pub fn wait_for_empty_queue(&self) {
        self.pending.wait_for_zero();
    }

    /// Polls planner occupancy until it reaches zero.
    pub fn wait_for_empty_planner_buffer(&self) -> Result<(), DispatchError> {
        loop {
            let occupancy = self.controller.planning_buffer_occupancy()?;
            if occupancy == 0 {
                return Ok(());
            }
            thread::sleep(self.buffer_poll);
        }
    }

    /// Flips `running` to false; the worker exits at its next poll. Joins
    /// the worker thread before returning.
    pub fn stop_and_join(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// The failure, if any, that caused the worker to exit early.
    pub fn take_failure(&self) -> Option<DispatchError> {
        self.failure.lock().unwrap().take()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct StubController {
        occupancies: Mutex<VecDeque<usize>>,
        sent: Mutex<Vec<String>>,
        polls: Mutex<usize>,
    }

    impl StubController {
        fn new(occupancies: Vec<usize>) -> Self {
            Self {
                occupancies: Mutex::new(occupancies.into()),
                sent: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            }
        }
    }

    impl ControllerHandle for StubController {
        fn command(&self, line: &str) -> Result<(), ControllerError> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn ensure_buffer_report_enabled(&self) -> Result<(), ControllerError> {
            Ok(())
        }

        fn planning_buffer_occupancy(&self) -> Result<usize, ControllerError> {
            *self.polls.lock().unwrap() += 1;
            let mut occupancies = self.occupancies.lock().unwrap();
            Ok(occupancies.pop_front().unwrap_or(0))
        }
    }

    #[test]
    fn barrier_waits_for_drain_then_next_line_issues_promptly() {
        // Reproduces the spec's dispatcher scenario: an M3 line must not be
        // sent until occupancy <= 2, observed on the fourth poll; a plain
        // motion line after it may issue as soon as occupancy <= 16.
        let stub = Arc::new(StubController::new(vec![18, 10, 3, 1, 16]));
        let mut dispatcher = Dispatcher::with_poll_intervals(
            stub.clone() as Arc<dyn ControllerHandle>,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        dispatcher.start();
        dispatcher.enqueue("M3 S90\n");
        dispatcher.enqueue("G1 X5\n");
        dispatcher.wait_for_empty_queue();
        dispatcher.stop_and_join();

        let sent = stub.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["M3 S90\n".to_string(), "G1 X5\n".to_string()]);
        assert_eq!(*stub.polls.lock().unwrap(), 5);
    }

    #[test]
    fn fifo_enqueue_order_matches_wire_order() {
        let stub = Arc::new(StubController::new(vec![0; 32]));
        let mut dispatcher = Dispatcher::with_poll_intervals(
            stub.clone() as Arc<dyn ControllerHandle>,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        dispatcher.start();

        let lines: Vec<String> = (0..10).map(|i| format!("G1 X{}\n", i)).collect();
        for line in &lines {
            dispatcher.enqueue(line.clone());
        }
        dispatcher.wait_for_empty_queue();
        dispatcher.stop_and_join();

        assert_eq!(*stub.sent.lock().unwrap(), lines);
    }

    #[test]
    fn barrier_lines_get_the_tight_nice_size() {
        let record = CommandRecord::new("M3 S90\n".to_string(), NICE_SIZE_NORMAL, NICE_SIZE_BARRIER);
        assert_eq!(record.nice_size, NICE_SIZE_BARRIER);

        let record = CommandRecord::new("G1 X5\n".to_string(), NICE_SIZE_NORMAL, NICE_SIZE_BARRIER);
        assert_eq!(record.nice_size, NICE_SIZE_NORMAL);
    }

    #[test]
    fn pending_count_wakes_waiters_at_zero() {
        let pending = Arc::new(PendingCount::new());
        pending.increment();
        pending.increment();

        let waiter_pending = pending.clone();
        let handle = thread::spawn(move || waiter_pending.wait_for_zero());

        thread::sleep(Duration::from_millis(20));
        pending.decrement();
        pending.decrement();

        handle.join().unwrap();
    }
}
