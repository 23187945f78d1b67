//! Long-lived recognition service.
//!
//! Owns the classifier and one set of landmark detectors for the lifetime of
//! the process. Requests may arrive from any thread; they are queued to a
//! background worker, and every detector call goes through a gate that lets
//! one extraction run at a time.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    detector::LandmarkAdapter,
    error::{RecognitionError, Result},
    extractor::{KeypointExtractor, KeypointSequence},
    recognizer::{Recognition, Recognizer},
    types::Video,
};

/// A pool of exactly one detector set behind a mutex.
pub struct DetectorGate {
    adapter: Mutex<LandmarkAdapter>,
    closed: AtomicBool,
}

/// Exclusive use of the gated detectors, released on drop.
pub struct DetectorLease<'a> {
    guard: MutexGuard<'a, LandmarkAdapter>,
}

impl Deref for DetectorLease<'_> {
    type Target = LandmarkAdapter;

    fn deref(&self) -> &LandmarkAdapter {
        &self.guard
    }
}

impl DerefMut for DetectorLease<'_> {
    fn deref_mut(&mut self) -> &mut LandmarkAdapter {
        &mut self.guard
    }
}

impl DetectorGate {
    pub fn new(adapter: LandmarkAdapter) -> Self {
        Self {
            adapter: Mutex::new(adapter),
            closed: AtomicBool::new(false),
        }
    }

    /// Blocks until the detectors are free.
    pub fn acquire(&self) -> Result<DetectorLease<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RecognitionError::WorkerUnavailable);
        }
        // A panic mid-extraction leaves the detectors usable; the next
        // frame starts from scratch.
        let guard = self.adapter.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(RecognitionError::WorkerUnavailable);
        }
        Ok(DetectorLease { guard })
    }

    /// Releases the detectors once in-flight work finishes. Later
    /// acquisitions fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut adapter = self.adapter.lock().unwrap_or_else(PoisonError::into_inner);
        adapter.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What the worker runs a request against.
pub struct Pipeline {
    gate: Arc<DetectorGate>,
    extractor: KeypointExtractor,
    recognizer: Recognizer,
}

impl Pipeline {
    pub fn extract(&self, video: &Video) -> Result<KeypointSequence> {
        let mut detectors = self.gate.acquire()?;
        self.extractor.extract(&mut detectors, video)
    }

    /// Detectors are released before classification starts.
    pub fn recognize(&self, video: &Video) -> Result<Recognition> {
        let sequence = self.extract(video)?;
        self.recognizer.recognize(&sequence)
    }

    pub fn recognizer(&self) -> &Recognizer {
        &self.recognizer
    }
}

type Job = Box<dyn FnOnce(&Pipeline) + Send>;

pub struct RecognitionService {
    jobs: Option<Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
    gate: Arc<DetectorGate>,
}

impl RecognitionService {
    pub fn start(
        detectors: LandmarkAdapter,
        extractor: KeypointExtractor,
        recognizer: Recognizer,
    ) -> Result<Self> {
        let gate = Arc::new(DetectorGate::new(detectors));
        let pipeline = Pipeline {
            gate: gate.clone(),
            extractor,
            recognizer,
        };
        let (jobs, job_rx) = crossbeam_channel::unbounded();

        let worker = thread::Builder::new()
            .name("recognition-worker".into())
            .spawn(move || run_worker_loop(pipeline, job_rx))
            .map_err(|err| {
                RecognitionError::InvalidConfig(format!("failed to spawn recognition worker: {err}"))
            })?;

        log::info!("recognition service started");
        Ok(Self {
            jobs: Some(jobs),
            worker: Some(worker),
            gate,
        })
    }

    fn submit<T, F>(&self, task: F) -> Result<Receiver<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&Pipeline) -> Result<T> + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(RecognitionError::WorkerUnavailable)?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move |pipeline| {
            let _ = reply_tx.send(task(pipeline));
        });
        jobs.send(job)
            .map_err(|_| RecognitionError::WorkerUnavailable)?;
        Ok(reply_rx)
    }

    /// Queues a clip; the receiver yields exactly one result.
    pub fn submit_video(&self, video: Video) -> Result<Receiver<Result<Recognition>>> {
        self.submit(move |pipeline| pipeline.recognize(&video))
    }

    pub fn recognize(&self, video: Video) -> Result<Recognition> {
        wait(self.submit_video(video)?)
    }

    pub fn extract(&self, video: Video) -> Result<KeypointSequence> {
        wait(self.submit(move |pipeline| pipeline.extract(&video))?)
    }

    /// Stops accepting work, drains queued jobs and releases the detectors.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("recognition worker panicked");
            }
        }
        self.gate.close();
    }
}

impl Drop for RecognitionService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wait<T>(reply: Receiver<Result<T>>) -> Result<T> {
    reply.recv().map_err(|_| RecognitionError::WorkerUnavailable)?
}

fn run_worker_loop(pipeline: Pipeline, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        job(&pipeline);
    }
    log::info!("recognition worker stopped");
}
