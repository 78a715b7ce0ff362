use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::endpoint::Endpoint;
use crate::error::{CallError, ConfigError};
use crate::types::Address;
use crate::JOB_QUEUE_CAPACITY;

/// The event loop: one worker thread on which every QUIC state mutation runs.
///
/// Dropping (or [`close`](Self::close)-ing) the network closes every connection on every
/// endpoint it created and joins the loop thread.
pub struct Network {
    handle: NetHandle,
    /// Endpoints keyed by bound address. Only the loop thread touches this.
    endpoints: Arc<Mutex<HashMap<Address, Endpoint>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown {
        graceful: bool,
        done: std_mpsc::SyncSender<()>,
    },
}

struct LoopShared {
    running: AtomicBool,
    jobs: Mutex<VecDeque<Job>>,
    /// Edge-triggered wakeup for the loop; armed by every job submission.
    job_waker: Notify,
    loop_thread: OnceLock<ThreadId>,
}

/// Cheap handle for submitting work to the loop thread; cloned into every endpoint,
/// connection, and stream handle.
#[derive(Clone)]
pub(crate) struct NetHandle(Arc<LoopShared>);

impl NetHandle {
    pub(crate) fn in_event_loop(&self) -> bool {
        self.0.loop_thread.get() == Some(&thread::current().id())
    }

    /// Run `f` on the loop thread: inline when already there, otherwise queued in FIFO
    /// order behind every previously submitted job. Rejected without running once
    /// shutdown has begun or when the queue is at capacity.
    pub(crate) fn call(&self, f: impl FnOnce() + Send + 'static) {
        if !self.0.running.load(Ordering::Acquire) {
            trace!("network closed; dropping job");
            return;
        }
        if self.in_event_loop() {
            f();
            return;
        }
        let queued = self.enqueue(Job::Run(Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                error!("job panicked on loop thread: {}", panic_message(&payload));
            }
        })));
        if !queued {
            error!("job queue full; dropping job");
        }
    }

    /// Like [`call`](Self::call) but blocks the submitting thread until `f` has produced
    /// a value. A panic inside `f` is marshaled back as [`CallError::JobPanicked`].
    pub(crate) fn call_get<T, F>(&self, f: F) -> Result<T, CallError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if !self.0.running.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }
        if self.in_event_loop() {
            return Ok(f());
        }
        let (tx, rx) = std_mpsc::sync_channel(1);
        let queued = self.enqueue(Job::Run(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|p| panic_message(&p));
            let _ = tx.send(result);
        })));
        if !queued {
            return Err(CallError::QueueFull);
        }
        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(CallError::JobPanicked(msg)),
            // Loop exited with our job still queued.
            Err(_) => Err(CallError::Closed),
        }
    }

    /// Queue a job, refusing past [`JOB_QUEUE_CAPACITY`]; false means rejected.
    fn enqueue(&self, job: Job) -> bool {
        {
            let mut queue = self.0.jobs.lock().unwrap();
            if queue.len() >= JOB_QUEUE_CAPACITY {
                return false;
            }
            queue.push_back(job);
            trace!("event loop now has {} jobs queued", queue.len());
        }
        self.0.job_waker.notify_one();
        true
    }

    /// Queue a control job exempt from the capacity bound (shutdown must always land).
    fn enqueue_unbounded(&self, job: Job) {
        self.0.jobs.lock().unwrap().push_back(job);
        self.0.job_waker.notify_one();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl Network {
    /// Spawn the loop thread and its single-threaded reactor.
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;

        let shared = Arc::new(LoopShared {
            running: AtomicBool::new(true),
            jobs: Mutex::new(VecDeque::with_capacity(JOB_QUEUE_CAPACITY)),
            job_waker: Notify::new(),
            loop_thread: OnceLock::new(),
        });

        let handle = NetHandle(shared.clone());
        let endpoints: Arc<Mutex<HashMap<Address, Endpoint>>> = Arc::default();

        let loop_endpoints = endpoints.clone();
        let thread = thread::Builder::new()
            .name("quicnet-loop".into())
            .spawn(move || {
                shared
                    .loop_thread
                    .set(thread::current().id())
                    .expect("loop thread id set once");
                debug!("starting event loop run");
                runtime.block_on(run_loop(&shared, &loop_endpoints));
                debug!("event loop run returned, thread finished");
            })?;

        info!("network started");
        Ok(Self {
            handle,
            endpoints,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Get (or create) the endpoint bound to `local`.
    ///
    /// Bind and context errors are raised synchronously. Repeated calls with the same
    /// address return the same endpoint.
    pub fn endpoint(&self, local: Address) -> Result<Endpoint, ConfigError> {
        let handle = self.handle.clone();
        let endpoints = self.endpoints.clone();
        self.handle.call_get(move || {
            let mut map = endpoints.lock().unwrap();
            if let Some(ep) = map.get(&local) {
                debug!(%local, "endpoint already exists for address");
                return Ok(ep.clone());
            }
            let ep = Endpoint::bind(handle, local)?;
            map.insert(local, ep.clone());
            Ok(ep)
        })?
    }

    /// Shut the network down and join the loop thread. Idempotent.
    ///
    /// Jobs submitted before this call still run; jobs submitted after are rejected.
    /// With `graceful` true every connection sends CONNECTION_CLOSE and fires its stream
    /// close callbacks before the sockets are unbound; otherwise endpoints are dropped
    /// immediately.
    pub fn close(&self, graceful: bool) {
        if !self.handle.0.running.swap(false, Ordering::AcqRel) {
            // Second close: just make sure the thread is gone.
            self.join();
            return;
        }
        info!("shutting down network");

        let (tx, rx) = std_mpsc::sync_channel(1);
        self.handle.enqueue_unbounded(Job::Shutdown {
            graceful,
            done: tx,
        });
        if self.handle.in_event_loop() {
            // Closing from inside a callback: the loop will process the shutdown job
            // after this one returns; we cannot wait for it here.
            return;
        }
        let _ = rx.recv();
        self.join();
        info!("network shutdown complete");
    }

    fn join(&self) {
        if self.handle.in_event_loop() {
            return;
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.close(true);
    }
}

async fn run_loop(shared: &LoopShared, endpoints: &Mutex<HashMap<Address, Endpoint>>) {
    loop {
        // Swap the whole queue out so job bodies can enqueue without deadlocking.
        let batch = {
            let mut queue = shared.jobs.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        let mut shutdown = None;
        for job in batch {
            match job {
                Job::Run(f) => f(),
                Job::Shutdown { graceful, done } => {
                    shutdown = Some((graceful, done));
                    break;
                }
            }
        }

        if let Some((graceful, done)) = shutdown {
            let drained: Vec<Endpoint> = endpoints.lock().unwrap().drain().map(|(_, ep)| ep).collect();
            for ep in &drained {
                if graceful {
                    ep.close_conns(None);
                }
                ep.shutdown();
            }
            drop(drained);
            let _ = done.send(());
            return;
        }

        shared.job_waker.notified().await;
    }
}
