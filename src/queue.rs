use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use image::RgbImage;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::ServiceError;
use crate::executor;
use crate::health::ServiceStatus;
use crate::memory::{MemorySnapshot, ResidencyController};
use crate::request::GenerationRequest;

/// One unit of accelerator work, owned by the queue from submit until its
/// result is delivered. Every job gets exactly one result on its channel.
struct Job {
    request: GenerationRequest,
    deadline: Instant,
    reply: oneshot::Sender<Result<RgbImage, ServiceError>>,
    cancelled: Arc<AtomicBool>,
}

struct ReclaimRequest {
    reply: oneshot::Sender<Result<MemorySnapshot, ServiceError>>,
}

/// Handle for one submitted job. Await [`JobTicket::wait`] for the result;
/// [`JobTicket::cancel`] withdraws the job if the worker has not picked it
/// up yet. A job that already started always runs to completion, since the
/// model runtime offers no safe interruption point.
pub struct JobTicket {
    receiver: oneshot::Receiver<Result<RgbImage, ServiceError>>,
    cancelled: Arc<AtomicBool>,
}

impl JobTicket {
    pub async fn wait(self) -> Result<RgbImage, ServiceError> {
        self.receiver
            .await
            .map_err(|_| ServiceError::WorkerUnavailable)?
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Admission control for the single accelerator. Submission is safe from any
/// number of concurrent callers; a lone worker drains the queue in strict
/// FIFO order, so exactly one job touches the device at a time and
/// completions observe submission order. The residency controller lives
/// inside that worker, which makes the no-concurrent-placement guarantee
/// structural rather than lock-based; each step of device work runs on the
/// blocking pool, never on an async runtime thread.
pub struct JobQueue {
    jobs: mpsc::Sender<Job>,
    control: mpsc::UnboundedSender<ReclaimRequest>,
    status: Arc<ServiceStatus>,
    default_timeout: Duration,
}

impl JobQueue {
    /// Enqueue a job, failing fast with `QueueFull` when the configured
    /// depth limit is reached.
    pub fn submit(&self, request: GenerationRequest) -> Result<JobTicket, ServiceError> {
        let (reply, receiver) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = Job {
            request,
            deadline: Instant::now() + self.default_timeout,
            reply,
            cancelled: cancelled.clone(),
        };

        self.jobs.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => ServiceError::QueueFull,
            TrySendError::Closed(_) => ServiceError::WorkerUnavailable,
        })?;
        // Counted only after the handoff succeeded, so rejected submissions
        // never inflate the probed depth; the signed counter absorbs the
        // worker retiring a job before this increment lands.
        self.status.job_admitted();

        Ok(JobTicket {
            receiver,
            cancelled,
        })
    }

    /// Ask the worker to release device memory to baseline and verify it
    /// actually dropped. Handled ahead of queued jobs, so a wedged device
    /// can be probed without draining the backlog first.
    pub async fn reclaim(&self) -> Result<MemorySnapshot, ServiceError> {
        let (reply, receiver) = oneshot::channel();
        self.control
            .send(ReclaimRequest { reply })
            .map_err(|_| ServiceError::WorkerUnavailable)?;
        receiver.await.map_err(|_| ServiceError::WorkerUnavailable)?
    }
}

/// Spawns the worker task and returns the submission handle. `depth` bounds
/// the jobs waiting for the worker, so with the one being executed at most
/// `depth + 1` are admitted at any instant; `default_timeout` is each job's
/// wall-clock deadline measured from enqueue.
pub fn spawn(
    controller: ResidencyController,
    depth: usize,
    default_timeout: Duration,
    status: Arc<ServiceStatus>,
) -> JobQueue {
    let (jobs_tx, jobs_rx) = mpsc::channel(depth.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    tokio::spawn(worker_loop(controller, jobs_rx, control_rx, status.clone()));

    JobQueue {
        jobs: jobs_tx,
        control: control_tx,
        status,
        default_timeout,
    }
}

enum WorkerStep {
    Job(Job),
    Reclaim(ReclaimRequest),
}

async fn worker_loop(
    mut controller: ResidencyController,
    mut jobs: mpsc::Receiver<Job>,
    mut control: mpsc::UnboundedReceiver<ReclaimRequest>,
    status: Arc<ServiceStatus>,
) {
    loop {
        let step = tokio::select! {
            biased;
            request = control.recv() => match request {
                Some(request) => WorkerStep::Reclaim(request),
                None => break,
            },
            job = jobs.recv() => match job {
                Some(job) => WorkerStep::Job(job),
                None => break,
            },
        };

        // Device work is blocking and can take seconds per job on a real
        // model; run it on the blocking pool so probes, handlers and timers
        // on the async runtime stay live while a job renders.
        let step_status = status.clone();
        let handle = tokio::task::spawn_blocking(move || {
            match step {
                WorkerStep::Job(job) => handle_job(&mut controller, &step_status, job),
                WorkerStep::Reclaim(request) => {
                    handle_reclaim(&mut controller, &step_status, request)
                }
            }
            controller
        });
        controller = match handle.await {
            Ok(controller) => controller,
            Err(error) => {
                // The controller is lost with the panicked task; pending
                // callers see WorkerUnavailable when the channels close.
                tracing::error!(%error, "device work panicked");
                break;
            }
        };
    }
    tracing::info!("generation worker shutting down");
}

fn handle_job(controller: &mut ResidencyController, status: &ServiceStatus, job: Job) {
    if job.cancelled.load(Ordering::Acquire) || job.reply.is_closed() {
        // Never started; no device interaction to clean up after.
        let _ = job.reply.send(Err(ServiceError::Cancelled));
        status.job_retired();
        return;
    }

    let result = if Instant::now() >= job.deadline {
        Err(ServiceError::GenerationTimeout)
    } else {
        run_admitted(controller, &job)
    };

    if let Err(error) = &result {
        tracing::warn!(%error, "job failed");
    }

    // Post-job reclaim runs on success, failure and timeout alike, so no
    // job leaves memory state behind for the next one.
    after_job(controller, status);

    let _ = job.reply.send(result);
    status.job_retired();
}

fn run_admitted(
    controller: &mut ResidencyController,
    job: &Job,
) -> Result<RgbImage, ServiceError> {
    controller.ensure_device_resident()?;
    let image = executor::run_job(controller, &job.request)?;
    // The runtime cannot be interrupted mid-render; a deadline that expired
    // while rendering is detected here and the late output discarded.
    if Instant::now() > job.deadline {
        return Err(ServiceError::GenerationTimeout);
    }
    Ok(image)
}

fn after_job(controller: &mut ResidencyController, status: &ServiceStatus) {
    match controller.release_to_baseline() {
        Ok(snapshot) => status.publish(snapshot),
        Err(error) => {
            tracing::error!(%error, "post-job release failed");
            status.latch_fault(&error);
            status.publish(controller.snapshot());
        }
    }
}

fn handle_reclaim(
    controller: &mut ResidencyController,
    status: &ServiceStatus,
    request: ReclaimRequest,
) {
    let result = controller.reclaim_checked();
    match &result {
        Ok(snapshot) => status.publish(*snapshot),
        Err(error) => {
            status.latch_fault(error);
            status.publish(controller.snapshot());
        }
    }
    let _ = request.reply.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ResidencyPolicy;
    use crate::model::{DiffusionPipeline, MemoryProfile, ProceduralPipeline, RenderParams};
    use crate::request::QualityTier;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn request(seed: u64) -> GenerationRequest {
        GenerationRequest {
            prompt: "a red fox".to_string(),
            negative_prompt: "blurry".to_string(),
            tier: QualityTier::Fast,
            width: 512,
            height: 512,
            seed,
        }
    }

    /// Pipeline instrumented for concurrency and ordering assertions. Render
    /// blocks while `gate` is held closed and records every seed it serves.
    struct ProbePipeline {
        inner: ProceduralPipeline,
        gate: Arc<AtomicBool>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        served: Arc<Mutex<Vec<u64>>>,
    }

    #[derive(Clone)]
    struct Probe {
        gate: Arc<AtomicBool>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        served: Arc<Mutex<Vec<u64>>>,
    }

    impl ProbePipeline {
        fn new(open: bool) -> (Self, Probe) {
            let probe = Probe {
                gate: Arc::new(AtomicBool::new(open)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                served: Arc::new(Mutex::new(Vec::new())),
            };
            let pipeline = Self {
                inner: ProceduralPipeline::new(MemoryProfile {
                    host_bytes: 1_000,
                    device_full_bytes: 800,
                    device_working_set_bytes: 200,
                }),
                gate: probe.gate.clone(),
                in_flight: probe.in_flight.clone(),
                max_in_flight: probe.max_in_flight.clone(),
                served: probe.served.clone(),
            };
            (pipeline, probe)
        }
    }

    impl DiffusionPipeline for ProbePipeline {
        fn profile(&self) -> MemoryProfile {
            self.inner.profile()
        }
        fn fetch_to_host(&mut self) -> Result<(), ServiceError> {
            self.inner.fetch_to_host()
        }
        fn upload_full(&mut self) -> Result<(), ServiceError> {
            self.inner.upload_full()
        }
        fn upload_working_set(&mut self) -> Result<(), ServiceError> {
            self.inner.upload_working_set()
        }
        fn offload_to_host(&mut self) -> Result<(), ServiceError> {
            self.inner.offload_to_host()
        }
        fn unload(&mut self) -> Result<(), ServiceError> {
            self.inner.unload()
        }
        fn render(&mut self, params: &RenderParams) -> Result<RgbImage, ServiceError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            while !self.gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.served.lock().push(params.seed);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RgbImage::new(8, 8))
        }
        fn device_allocated_bytes(&self) -> u64 {
            self.inner.device_allocated_bytes()
        }
        fn device_reserved_bytes(&self) -> u64 {
            self.inner.device_reserved_bytes()
        }
        fn host_model_present(&self) -> bool {
            self.inner.host_model_present()
        }
    }

    fn probe_queue(
        open: bool,
        depth: usize,
        timeout: Duration,
    ) -> (JobQueue, Probe, Arc<ServiceStatus>) {
        let (pipeline, probe) = ProbePipeline::new(open);
        let controller =
            ResidencyController::new(ResidencyPolicy::Offload, GIB, Box::new(pipeline));
        let status = Arc::new(ServiceStatus::new());
        let queue = spawn(controller, depth, timeout, status.clone());
        (queue, probe, status)
    }

    async fn wait_until_rendering(probe: &Probe) {
        for _ in 0..500 {
            if probe.in_flight.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("worker never started rendering");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completions_follow_submission_order() {
        let (queue, probe, _status) = probe_queue(true, 16, Duration::from_secs(5));
        let tickets: Vec<_> = (0..8)
            .map(|seed| queue.submit(request(seed)).unwrap())
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(*probe.served.lock(), (0..8).collect::<Vec<_>>());
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflow_is_rejected_without_blocking() {
        let (queue, probe, status) = probe_queue(false, 1, Duration::from_secs(5));
        let first = queue.submit(request(1)).unwrap();
        wait_until_rendering(&probe).await;
        // Worker is busy with the first job; the channel holds exactly one.
        let second = queue.submit(request(2)).unwrap();
        let depth_before = status.queue_depth();
        let overflow = queue.submit(request(3));
        assert!(matches!(overflow, Err(ServiceError::QueueFull)));
        // A rejected submission was never admitted and must not show up in
        // the probed depth, even transiently after the rejection.
        assert_eq!(status.queue_depth(), depth_before);

        probe.gate.store(true, Ordering::SeqCst);
        first.wait().await.unwrap();
        second.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn runtime_stays_responsive_while_a_job_renders() {
        let (queue, probe, status) = probe_queue(false, 4, Duration::from_secs(5));
        let ticket = queue.submit(request(1)).unwrap();
        wait_until_rendering(&probe).await;

        // The render is parked on the blocking pool, so on a single-threaded
        // runtime a timer and a read-only probe still make progress.
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "timer stalled behind an in-flight render"
        );
        let report = status.probe();
        assert!(report.ok);
        assert_eq!(report.queue_depth, 1);

        probe.gate.store(true, Ordering::SeqCst);
        ticket.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_job_can_be_cancelled_before_start() {
        let (queue, probe, _status) = probe_queue(false, 4, Duration::from_secs(5));
        let running = queue.submit(request(1)).unwrap();
        wait_until_rendering(&probe).await;
        let queued = queue.submit(request(2)).unwrap();
        queued.cancel();

        probe.gate.store(true, Ordering::SeqCst);
        running.wait().await.unwrap();
        assert!(matches!(queued.wait().await, Err(ServiceError::Cancelled)));
        // The cancelled job never reached the device.
        assert_eq!(*probe.served.lock(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_job_times_out_without_device_interaction() {
        let (queue, probe, _status) = probe_queue(false, 4, Duration::from_millis(100));
        let running = queue.submit(request(1)).unwrap();
        wait_until_rendering(&probe).await;
        let queued = queue.submit(request(2)).unwrap();

        // Hold the gate long enough for the queued job's deadline to pass.
        tokio::time::sleep(Duration::from_millis(200)).await;
        probe.gate.store(true, Ordering::SeqCst);

        assert!(matches!(
            running.wait().await,
            Err(ServiceError::GenerationTimeout)
        ));
        assert!(matches!(
            queued.wait().await,
            Err(ServiceError::GenerationTimeout)
        ));
        // Only the first job ever rendered.
        assert_eq!(*probe.served.lock(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_render_is_reported_as_timeout() {
        let (queue, probe, _status) = probe_queue(false, 4, Duration::from_millis(100));
        let ticket = queue.submit(request(1)).unwrap();
        wait_until_rendering(&probe).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        probe.gate.store(true, Ordering::SeqCst);
        assert!(matches!(
            ticket.wait().await,
            Err(ServiceError::GenerationTimeout)
        ));
        // The render did complete; its output was discarded.
        assert_eq!(*probe.served.lock(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_stays_at_or_below_ceiling_after_each_job() {
        let controller = ResidencyController::new(
            ResidencyPolicy::Offload,
            8 * GIB,
            Box::new(ProceduralPipeline::new(MemoryProfile::default())),
        );
        let status = Arc::new(ServiceStatus::new());
        let queue = spawn(controller, 8, Duration::from_secs(5), status.clone());

        for seed in 0..3 {
            queue.submit(request(seed)).unwrap().wait().await.unwrap();
            let snapshot = status.snapshot();
            assert!(snapshot.device_allocated_bytes <= 8 * GIB);
            // Offload baseline: nothing left on the device between jobs.
            assert_eq!(snapshot.device_allocated_bytes, 0);
            assert!(snapshot.host_model_present);
        }
        assert_eq!(status.queue_depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reclaim_on_idle_queue_returns_baseline() {
        let controller = ResidencyController::new(
            ResidencyPolicy::Offload,
            8 * GIB,
            Box::new(ProceduralPipeline::new(MemoryProfile::default())),
        );
        let status = Arc::new(ServiceStatus::new());
        let queue = spawn(controller, 8, Duration::from_secs(5), status.clone());

        let snapshot = queue.reclaim().await.unwrap();
        assert_eq!(snapshot.device_allocated_bytes, 0);
        assert!(status.probe().ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wedged_reclaim_latches_unhealthy() {
        let mut controller = ResidencyController::new(
            ResidencyPolicy::Offload,
            8 * GIB,
            Box::new(ProceduralPipeline::new_wedged(MemoryProfile::default())),
        );
        controller.ensure_device_resident().unwrap();
        let status = Arc::new(ServiceStatus::new());
        let queue = spawn(controller, 8, Duration::from_secs(5), status.clone());

        assert!(matches!(
            queue.reclaim().await,
            Err(ServiceError::MemoryWedged { .. })
        ));
        assert!(!status.probe().ok);
    }
}
