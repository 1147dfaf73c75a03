//! Per-device ordered command streams.
//!
//! A stream belongs to the host framework: exactly one exists per device (see
//! `DeviceRegistry`), and every producer and consumer of that device's tensors
//! submits through it. Work submitted to one stream completes in submission
//! order.
//!
//! Submission never blocks on device completion. Each submission returns a
//! [`Ticket`]; host code that needs the results waits on a [`Fence`] built
//! from that ticket. Device-side failures are recorded against the ticket and
//! reported by [`Stream::status`] when observed.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use forge_dtype::DeviceSpec;
use parking_lot::Mutex;
use snafu::ResultExt;

use crate::error::{Error, KernelExecutionSnafu, Result, StreamClosedSnafu, WorkerSpawnSnafu};
use crate::sync::{CpuTimelineSignal, TimelineSignal};

/// Position of a submission on its stream's timeline. The first submission
/// is ticket 1; ticket 0 is "nothing submitted".
pub type Ticket = u64;

/// Who submitted a piece of work, carried for fault reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionLabel {
    pub operator: String,
    pub kernel: String,
}

impl SubmissionLabel {
    pub fn new(operator: impl Into<String>, kernel: impl Into<String>) -> Self {
        Self { operator: operator.into(), kernel: kernel.into() }
    }
}

impl std::fmt::Display for SubmissionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.operator, self.kernel)
    }
}

/// Ordered command stream of one device.
pub trait Stream: Send + Sync + std::fmt::Debug {
    fn device(&self) -> &DeviceSpec;

    /// Ticket of the most recent submission (0 if none).
    fn submitted(&self) -> Ticket;

    /// Highest ticket known to have finished executing.
    fn completed(&self) -> Ticket;

    /// Block until `ticket` has finished executing.
    ///
    /// This reports stream-level failures only; use [`Stream::status`] for the
    /// outcome of the work itself.
    fn wait_for(&self, ticket: Ticket) -> Result<()>;

    /// Outcome of a finished submission.
    fn status(&self, ticket: Ticket) -> Result<()>;

    /// Block until everything submitted so far has finished.
    fn synchronize(&self) -> Result<()> {
        self.wait_for(self.submitted())
    }

    fn as_any(&self) -> &dyn Any;
}

/// A submission whose completion gates host access to a buffer.
///
/// A fence also remembers the fences of the submissions that produced its
/// inputs, so a fault anywhere upstream is reported by every result derived
/// from it.
#[derive(Debug, Clone)]
pub struct Fence {
    stream: Arc<dyn Stream>,
    ticket: Ticket,
    label: SubmissionLabel,
    /// Producers that were unfinished or faulted when this fence was made.
    producers: Arc<[Fence]>,
}

impl Fence {
    pub fn new(stream: Arc<dyn Stream>, ticket: Ticket, label: SubmissionLabel) -> Self {
        Self { stream, ticket, label, producers: Arc::from(Vec::new()) }
    }

    /// Attach the fences of the submissions whose results this one consumed.
    ///
    /// Producers that already finished cleanly are dropped right away.
    pub fn with_producers(mut self, producers: impl IntoIterator<Item = Fence>) -> Self {
        self.producers = producers.into_iter().filter(|fence| !fence.settled_cleanly()).collect();
        self
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn label(&self) -> &SubmissionLabel {
        &self.label
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    pub fn producers(&self) -> &[Fence] {
        &self.producers
    }

    pub fn is_complete(&self) -> bool {
        self.stream.completed() >= self.ticket
    }

    fn settled_cleanly(&self) -> bool {
        self.is_complete()
            && self.stream.status(self.ticket).is_ok()
            && self.producers.iter().all(Fence::settled_cleanly)
    }

    /// Wait for the submission and every producer it depends on, then report
    /// the first fault found, upstream faults first.
    ///
    /// Host-side failures (timeouts, a closed stream) are returned as they
    /// are; anything the device reports is attributed to the submitting
    /// operator and kernel.
    pub fn wait(&self) -> Result<()> {
        tracing::trace!(ticket = self.ticket, submission = %self.label, "waiting on fence");
        let mut chain: Vec<&Fence> = vec![self];
        let mut next = 0;
        while next < chain.len() {
            let fence: &Fence = chain[next];
            chain.extend(fence.producers.iter());
            next += 1;
        }

        for fence in chain.iter().rev() {
            fence.finish()?;
            fence.stream.status(fence.ticket)?;
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.stream.wait_for(self.ticket).map_err(|e| match e {
            e @ (Error::Timeout { .. } | Error::StreamClosed { .. } | Error::KernelExecution { .. }) => e,
            other => Error::KernelExecution {
                operator: self.label.operator.clone(),
                kernel: self.label.kernel.clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Wait for the submission to finish without inspecting its outcome.
    pub fn wait_idle(&self) -> Result<()> {
        self.stream.wait_for(self.ticket)
    }
}

/// Unit of work executed by the CPU stream worker.
///
/// An `Err` marks the submission as faulted with the given reason.
pub type CpuWork = Box<dyn FnOnce() -> std::result::Result<(), String> + Send>;

struct Job {
    ticket: Ticket,
    label: SubmissionLabel,
    work: CpuWork,
}

#[derive(Debug, Clone)]
struct Fault {
    label: SubmissionLabel,
    reason: String,
}

struct Submitter {
    next: Ticket,
    sender: Option<mpsc::Sender<Job>>,
}

/// Reference stream for host memory.
///
/// A single framework-owned worker thread drains submissions in FIFO order,
/// which gives CPU tensors the same asynchronous, stream-ordered semantics as
/// device tensors.
pub struct CpuStream {
    device: DeviceSpec,
    submitter: Mutex<Submitter>,
    signal: Arc<CpuTimelineSignal>,
    faults: Arc<Mutex<HashMap<Ticket, Fault>>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for CpuStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuStream")
            .field("device", &self.device)
            .field("submitted", &self.submitted())
            .field("completed", &self.completed())
            .finish()
    }
}

impl CpuStream {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let signal = Arc::new(CpuTimelineSignal::new());
        let faults: Arc<Mutex<HashMap<Ticket, Fault>>> = Arc::default();

        let worker_signal = Arc::clone(&signal);
        let worker_faults = Arc::clone(&faults);
        let worker = thread::Builder::new()
            .name("forge-cpu-stream".to_string())
            .spawn(move || {
                for Job { ticket, label, work } in receiver {
                    if let Err(reason) = work() {
                        tracing::warn!(ticket, submission = %label, %reason, "cpu stream work failed");
                        worker_faults.lock().insert(ticket, Fault { label, reason });
                    }
                    worker_signal.set(ticket);
                }
            })
            .context(WorkerSpawnSnafu)?;
        let worker_id = worker.thread().id();

        Ok(Self {
            device: DeviceSpec::Cpu,
            submitter: Mutex::new(Submitter { next: 1, sender: Some(sender) }),
            signal,
            faults,
            worker: Some(worker),
            worker_id,
            timeout: None,
        })
    }

    /// Bound every host-side wait on this stream by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Submit `work` behind everything already on the stream.
    pub fn enqueue(&self, label: SubmissionLabel, work: CpuWork) -> Result<Ticket> {
        let mut submitter = self.submitter.lock();
        let ticket = submitter.next;
        let sender = submitter.sender.as_ref().ok_or_else(|| StreamClosedSnafu { device: self.device }.build())?;
        tracing::trace!(ticket, submission = %label, "cpu stream enqueue");
        sender.send(Job { ticket, label, work }).map_err(|_| StreamClosedSnafu { device: self.device }.build())?;
        submitter.next += 1;
        Ok(ticket)
    }
}

impl Stream for CpuStream {
    fn device(&self) -> &DeviceSpec {
        &self.device
    }

    fn submitted(&self) -> Ticket {
        self.submitter.lock().next - 1
    }

    fn completed(&self) -> Ticket {
        self.signal.value()
    }

    fn wait_for(&self, ticket: Ticket) -> Result<()> {
        self.signal.wait(ticket, self.timeout)
    }

    fn status(&self, ticket: Ticket) -> Result<()> {
        match self.faults.lock().get(&ticket) {
            None => Ok(()),
            Some(Fault { label, reason }) => KernelExecutionSnafu {
                operator: label.operator.clone(),
                kernel: label.kernel.clone(),
                reason: reason.clone(),
            }
            .fail(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for CpuStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.submitter.get_mut().sender.take();
        if let Some(worker) = self.worker.take() {
            // The last reference can be released by a job on the worker itself.
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(feature = "cuda")]
pub use cuda::CudaStream;

#[cfg(feature = "cuda")]
mod cuda {
    use std::any::Any;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use forge_dtype::DeviceSpec;
    use snafu::ResultExt;

    use super::{Stream, Ticket};
    use crate::error::{CudaSnafu, Result};

    /// The default stream of a CUDA context.
    ///
    /// Launches go straight onto the driver stream, so ordering against other
    /// framework work is the driver's FIFO order. Faults are sticky in CUDA
    /// and show up at the next synchronization.
    #[derive(Debug)]
    pub struct CudaStream {
        device: DeviceSpec,
        stream: Arc<cudarc::driver::CudaStream>,
        submitted: AtomicU64,
        completed: AtomicU64,
    }

    impl CudaStream {
        pub fn new(device_id: usize, stream: Arc<cudarc::driver::CudaStream>) -> Self {
            Self {
                device: DeviceSpec::Cuda { device_id },
                stream,
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }
        }

        /// Driver stream to launch onto.
        pub fn raw(&self) -> &Arc<cudarc::driver::CudaStream> {
            &self.stream
        }

        /// Account for a launch that was just issued on [`CudaStream::raw`].
        pub fn record_submission(&self) -> Ticket {
            self.submitted.fetch_add(1, Ordering::AcqRel) + 1
        }
    }

    impl Stream for CudaStream {
        fn device(&self) -> &DeviceSpec {
            &self.device
        }

        fn submitted(&self) -> Ticket {
            self.submitted.load(Ordering::Acquire)
        }

        fn completed(&self) -> Ticket {
            self.completed.load(Ordering::Acquire)
        }

        fn wait_for(&self, ticket: Ticket) -> Result<()> {
            if self.completed() >= ticket {
                return Ok(());
            }
            let reached = self.submitted();
            self.stream.synchronize().context(CudaSnafu)?;
            self.completed.fetch_max(reached, Ordering::AcqRel);
            Ok(())
        }

        fn status(&self, _ticket: Ticket) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}
