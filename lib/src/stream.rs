//! Streaming frame processing
//!
//! Runs a [`DataPath`] on a background thread, fed chirp by chirp from a
//! [`ChirpSource`]. Each processed frame is forwarded to an optional
//! [`ObjectSink`]:
//!  - `ObjectSink::File`: frames are batched and written to a detection file
//!  - `ObjectSink::Queue`: frames are sent to an in-process queue
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::errors::PipelineError;
use crate::fixed::Cplx16;
use crate::objects::FrameOutput;
use crate::persistence::{DetectionFile, Writer};
use crate::DataPath;

/// Number of frames collected before they are committed to the file.
const BATCH_SIZE: usize = 100;

/// How long a queue-backed source waits for an event before reporting idle.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// What the front end delivers to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontEndEvent {
    /// ADC samples of one chirp, `[rx][sample]`
    Chirp(Vec<Cplx16>),
    /// All chirps of the current frame have been delivered
    FrameEnd,
}

/// Outcome of polling a [`ChirpSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Ready(FrontEndEvent),
    /// Nothing arrived within the source's timeout; poll again
    Idle,
    /// The source is exhausted
    Closed,
}

/// Producer of front end events.
///
/// `poll_event` must return within a bounded time so that the runner can
/// observe a stop request.
pub trait ChirpSource: Send {
    fn poll_event(&mut self) -> SourcePoll;
}

impl ChirpSource for Receiver<FrontEndEvent> {
    fn poll_event(&mut self) -> SourcePoll {
        match self.recv_timeout(POLL_TIMEOUT) {
            Ok(event) => SourcePoll::Ready(event),
            Err(RecvTimeoutError::Timeout) => SourcePoll::Idle,
            Err(RecvTimeoutError::Disconnected) => SourcePoll::Closed,
        }
    }
}

/// A sink to receive processed frames.
pub enum ObjectSink {
    File(DetectionFile),
    Queue(Sender<FrameOutput>),
}

/// Drives a [`DataPath`] from a [`ChirpSource`] on a worker thread.
pub struct FrameRunner {
    datapath: Option<DataPath>,
    source: Option<Box<dyn ChirpSource>>,
    sink: Option<Sender<FrameOutput>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<RunSummary>>,
    file_writer: Option<JoinHandle<()>>,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub objects: u64,
    /// Error that halted the pipeline, if any
    pub error: Option<PipelineError>,
}

impl FrameRunner {
    pub fn new(datapath: DataPath, source: impl ChirpSource + 'static) -> Self {
        log::trace!("Creating frame runner");
        Self {
            datapath: Some(datapath),
            source: Some(Box::new(source)),
            sink: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            file_writer: None,
        }
    }

    /// Registers the sink processed frames are forwarded to. A previously
    /// registered sink is closed.
    pub fn subscribe(&mut self, sink: ObjectSink) {
        if self.sink.is_some() {
            log::warn!("Replacing the registered object sink");
        }

        let sink = match sink {
            ObjectSink::File(file) => {
                let (tx, rx) = bounded(BATCH_SIZE);
                log::trace!(
                    "Spawning background thread to write detections to file {:?}",
                    file
                );
                self.file_writer = Some(thread::spawn(|| write_frames_to_file(rx, file)));
                tx
            }
            ObjectSink::Queue(queue) => queue,
        };
        self.sink = Some(sink);
    }

    /// Starts processing on the worker thread.
    ///
    /// Runs until the source is exhausted, the pipeline halts or
    /// [`FrameRunner::stop`] is called.
    ///
    /// # Parameters
    /// * `print` - Whether to print detected objects to stdout.
    pub fn start(&mut self, print: bool) {
        let (Some(datapath), Some(source)) = (self.datapath.take(), self.source.take()) else {
            log::error!("Frame runner was already started");
            return;
        };
        log::info!("Starting frame processing");
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let sink = self.sink.take();
        self.worker = Some(thread::spawn(move || run(datapath, source, running, sink, print)));
    }

    /// Whether the worker is still processing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops processing, joins the worker threads and returns what the
    /// worker achieved.
    pub fn stop(&mut self) -> RunSummary {
        log::info!("Stopping frame processing");
        self.running.store(false, Ordering::SeqCst);

        let mut summary = RunSummary::default();
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(s) => summary = s,
                Err(e) => log::error!("Couldn't join frame worker thread. Error: {:?}", e),
            }
        }

        // Closing the queue lets the file writer drain and exit
        self.sink = None;
        if let Some(file_writer) = self.file_writer.take() {
            if let Err(e) = file_writer.join() {
                log::error!("Couldn't join file writer thread. Error: {:?}", e);
            }
        }
        summary
    }
}

impl Drop for FrameRunner {
    fn drop(&mut self) {
        if self.worker.is_some() || self.file_writer.is_some() {
            self.stop();
        }
    }
}

/// Feeds the pipeline until the source ends, an error halts it or the
/// runner is stopped.
fn run(
    mut datapath: DataPath,
    mut source: Box<dyn ChirpSource>,
    running: Arc<AtomicBool>,
    sink: Option<Sender<FrameOutput>>,
    print: bool,
) -> RunSummary {
    let mut summary = RunSummary::default();

    while running.load(Ordering::SeqCst) {
        let event = match source.poll_event() {
            SourcePoll::Ready(event) => event,
            SourcePoll::Idle => continue,
            SourcePoll::Closed => {
                log::trace!("Chirp source exhausted");
                break;
            }
        };

        let result = match event {
            FrontEndEvent::Chirp(samples) => datapath.process_chirp(&samples).map(|_| None),
            FrontEndEvent::FrameEnd => datapath.process_frame().map(Some),
        };

        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                log::error!("Frame processing failed; Stopping. Error: {}", e);
                summary.error = Some(e);
                break;
            }
        };

        summary.frames += 1;
        summary.objects += frame.objects.len() as u64;
        if print {
            print_frame(&frame);
        }
        if let Some(sink) = &sink {
            let frame_index = frame.frame_index;
            if let Err(e) = sink.send(frame) {
                log::error!("Failed to forward frame to sink; Stopping. Error: {}", e);
                summary.error = Some(PipelineError::SinkClosed { frame_index });
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    log::info!(
        "Frame processing completed: {} frames, {} objects",
        summary.frames,
        summary.objects
    );
    summary
}

fn print_frame(frame: &FrameOutput) {
    println!(
        "Frame {}: {} objects (inter-frame {:?}, inter-chirp {:?})",
        frame.frame_index,
        frame.objects.len(),
        frame.metrics.inter_frame_processing,
        frame.metrics.inter_chirp_processing
    );
    for o in &frame.objects {
        println!(
            " - range {:4} doppler {:4} peak {:5} xyz ({}, {}, {}) {:?}",
            o.range_idx, o.doppler_idx, o.peak_val, o.x, o.y, o.z, o.doa_state
        );
    }
}

/// Writes processed frames to a file in batches, receiving them from a
/// queue.
fn write_frames_to_file(rx: Receiver<FrameOutput>, out_file: DetectionFile) {
    let mut writer = match Writer::new(out_file) {
        Ok(writer) => writer,
        Err(e) => {
            log::error!("Couldn't create a file writer: {}", e);
            // Keep draining so the producer never blocks on a dead sink
            while rx.recv().is_ok() {}
            return;
        }
    };

    let mut frame_buffer = Vec::with_capacity(BATCH_SIZE);
    while let Ok(frame) = rx.recv() {
        frame_buffer.push(frame);
        if frame_buffer.len() < BATCH_SIZE {
            continue;
        }
        if let Err(e) = writer.add_batch(&frame_buffer) {
            log::error!("Error encountered on batch writing: {}. Exiting writer.", e);
            return;
        }
        frame_buffer.clear();
    }

    // Write any remaining frames when the channel is closed
    if !frame_buffer.is_empty() {
        if let Err(e) = writer.add_batch(&frame_buffer) {
            log::error!("Error encountered on batch writing: {}. Exiting writer.", e);
            return;
        }
    }
    if let Err(e) = writer.finalize() {
        log::error!("Couldn't finalize detection file: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Scenario, Target};
    use crate::{AngleMode, DssConfig};

    fn small_cfg() -> DssConfig {
        let mut cfg = DssConfig::with_antennas(1, 4);
        cfg.angle_mode = AngleMode::Azimuth;
        cfg.num_adc_samples = 64;
        cfg.num_range_bins = 64;
        cfg.peak_grouping.max_range_idx = 62;
        cfg
    }

    #[test]
    fn test_runner_forwards_frames_to_queue() {
        let cfg = small_cfg();
        let source = Scenario::new(&cfg, vec![Target::new(20.0, 3.0)])
            .with_noise(20.0, 1)
            .into_source(Some(3));
        let datapath = DataPath::new(cfg).unwrap();

        let (tx, rx) = bounded(10);
        let mut runner = FrameRunner::new(datapath, source);
        runner.subscribe(ObjectSink::Queue(tx));
        runner.start(false);

        let frames: Vec<FrameOutput> = (0..3).map(|_| rx.recv().unwrap()).collect();
        let summary = runner.stop();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.error, None);
        let indices: Vec<u64> = frames.iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(frames.iter().all(|f| f.metrics.chirps == 16));
    }

    #[test]
    fn test_runner_reports_halting_error() {
        let cfg = small_cfg();
        let (tx, rx) = bounded(4);
        tx.send(FrontEndEvent::Chirp(vec![Cplx16::new(0, 0); 3])).unwrap();
        drop(tx);

        let mut runner = FrameRunner::new(DataPath::new(cfg).unwrap(), rx);
        runner.start(false);
        while runner.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        let summary = runner.stop();
        assert_eq!(summary.frames, 0);
        assert!(matches!(summary.error, Some(PipelineError::ChirpLength { given: 3, .. })));
    }

    #[test]
    fn test_stop_with_idle_producer() {
        let (tx, rx) = bounded::<FrontEndEvent>(4);
        let mut runner = FrameRunner::new(DataPath::new(small_cfg()).unwrap(), rx);
        runner.start(false);
        thread::sleep(Duration::from_millis(20));

        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            let summary = runner.stop();
            done_tx.send(summary).unwrap();
        });
        let summary = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("runner did not stop while the producer was idle");
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.error, None);
        drop(tx);
    }

    #[test]
    fn test_closed_sink_is_reported() {
        let cfg = small_cfg();
        let source = Scenario::new(&cfg, vec![Target::new(20.0, 3.0)]).into_source(Some(3));
        let (tx, rx) = bounded(1);
        drop(rx);

        let mut runner = FrameRunner::new(DataPath::new(cfg).unwrap(), source);
        runner.subscribe(ObjectSink::Queue(tx));
        runner.start(false);
        while runner.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        let summary = runner.stop();
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.error, Some(PipelineError::SinkClosed { frame_index: 0 }));
    }
}
