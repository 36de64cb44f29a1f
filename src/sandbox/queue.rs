//! Strict FIFO execution of commands against one sandbox.
//!
//! Many threads may enqueue; only the worker dequeues. Commands run one at a
//! time so two of them never race on the sandbox's transient state.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Result, SandboxError};
use crate::sandbox::command::Job;
use crate::sandbox::runtime::ContainerRuntime;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A single worker thread draining a FIFO of commands.
pub struct CommandQueue {
    name: String,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<Pending>,
    next_seq: AtomicU64,
}

impl CommandQueue {
    /// Start the worker for sandbox `name`.
    pub fn start(name: &str, runtime: ContainerRuntime) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);
        let worker_name = name.to_string();

        let worker = thread::Builder::new()
            .name(format!("cephbox-queue-{}", name))
            .spawn(move || {
                for job in receiver {
                    let seq = job.seq();
                    debug!(sandbox = %worker_name, seq, "queue:dequeued");
                    if panic::catch_unwind(AssertUnwindSafe(|| job.run(&runtime))).is_err() {
                        error!(sandbox = %worker_name, seq, "queue:command panicked");
                    }
                    worker_pending.done();
                }
                debug!(sandbox = %worker_name, "queue:worker exiting");
            })?;

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            worker: Some(worker),
            pending,
            next_seq: AtomicU64::new(1),
        })
    }

    /// Reserve the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Append to the tail of the queue.
    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(|| shut_down(&self.name))?;
        self.pending.add();
        if sender.send(job).is_err() {
            self.pending.done();
            return Err(shut_down(&self.name));
        }
        Ok(())
    }

    /// Commands queued or running.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Block until every queued command has finished and the worker is idle.
    pub fn drain(&self) {
        debug!(sandbox = %self.name, pending = self.pending(), "queue:draining");
        self.pending.wait_idle();
    }

    /// Drain, then stop the worker and join it.
    pub fn shutdown(&mut self) {
        self.drain();
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!(sandbox = %self.name, "queue:worker panicked");
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn shut_down(name: &str) -> SandboxError {
    SandboxError::Io(io::Error::other(format!(
        "command queue for {} is shut down",
        name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::command::{CommandHandle, ExecOptions};
    use crate::sandbox::testutil::FakeRuntime;
    use std::fs;
    use std::path::Path;

    fn submit(queue: &CommandQueue, script: &str) -> CommandHandle {
        let (handle, job) = Job::prepare(
            queue.next_seq(),
            "box1",
            script.to_string(),
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ExecOptions::default(),
            None,
        )
        .unwrap();
        queue.enqueue(job).unwrap();
        handle
    }

    fn append(log: &Path, i: usize) -> String {
        format!("sleep 0.0{}; echo {} >> {}", i % 3, i, log.display())
    }

    #[test]
    fn test_fifo_order() {
        let fake = FakeRuntime::new();
        let queue = CommandQueue::start("box1", ContainerRuntime::from_config(&fake.config)).unwrap();
        let log = fake.path().join("order.log");

        let handles: Vec<_> = (0..8).map(|i| submit(&queue, &append(&log, i))).collect();
        for handle in &handles {
            assert_eq!(handle.wait().unwrap(), 0);
        }
        let seqs: Vec<u64> = handles.iter().map(CommandHandle::seq).collect();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());

        let order = fs::read_to_string(&log).unwrap();
        let expected: String = (0..8).map(|i| format!("{}\n", i)).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_fifo_across_producers() {
        let fake = FakeRuntime::new();
        let queue =
            Arc::new(CommandQueue::start("box1", ContainerRuntime::from_config(&fake.config)).unwrap());
        let log = fake.path().join("order.log");

        // Each producer records what it enqueued under a shared lock so the
        // expected order is the true submission order.
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let submitted = Arc::clone(&submitted);
                let log = log.clone();
                thread::spawn(move || {
                    for i in 0..3 {
                        let id = p * 10 + i;
                        let mut order = submitted.lock().unwrap();
                        let handle = submit(&queue, &format!("echo {} >> {}", id, log.display()));
                        order.push(id);
                        drop(order);
                        handle.wait().unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let seen: Vec<usize> = fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(|l| l.parse().unwrap())
            .collect();
        assert_eq!(seen, *submitted.lock().unwrap());
    }

    #[test]
    fn test_drain_waits_for_in_flight_commands() {
        let fake = FakeRuntime::new();
        let queue = CommandQueue::start("box1", ContainerRuntime::from_config(&fake.config)).unwrap();
        let first = submit(&queue, "sleep 0.3");
        let second = submit(&queue, "exit 2");
        queue.drain();
        assert_eq!(queue.pending(), 0);
        assert_eq!(first.exit_status(), Some(0));
        assert_eq!(second.exit_status(), Some(2));
    }

    #[test]
    fn test_worker_survives_failing_commands() {
        let fake = FakeRuntime::new();
        let queue = CommandQueue::start("box1", ContainerRuntime::from_config(&fake.config)).unwrap();
        assert_eq!(submit(&queue, "exit 1").wait().unwrap(), 1);
        assert_eq!(submit(&queue, "exit 0").wait().unwrap(), 0);
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let fake = FakeRuntime::new();
        let mut queue =
            CommandQueue::start("box1", ContainerRuntime::from_config(&fake.config)).unwrap();
        queue.shutdown();
        let (_handle, job) = Job::prepare(
            queue.next_seq(),
            "box1",
            "true".to_string(),
            vec!["true".to_string()],
            ExecOptions::default(),
            None,
        )
        .unwrap();
        assert!(queue.enqueue(job).is_err());
        assert_eq!(queue.pending(), 0);
    }
}
