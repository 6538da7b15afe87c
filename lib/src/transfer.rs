//! Transfer scheduler
//!
//! Block transfers between shared memory regions, executed by a transfer
//! controller running on its own thread so that compute and data movement
//! overlap. A channel is programmed once with [`TransferParams`], then
//! repeatedly re-targeted by offset and kicked with
//! [`TransferEngine::start_transfer`].
//!
//! Two completion disciplines are provided:
//!  - [`PollingDma`]: completion raises a per-channel flag, the waiter spins
//!  - [`CallbackDma`]: completion posts a per-channel semaphore, the waiter blocks
//!
//! Both behave identically from the caller's point of view.
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::config::TransferMode;
use crate::errors::TransferError;
use crate::fixed::Cplx16;

/// A memory region shared between compute and the transfer controller.
pub type SharedBuf<T> = Arc<Mutex<Vec<T>>>;

pub fn shared<T>(data: Vec<T>) -> SharedBuf<T> {
    Arc::new(Mutex::new(data))
}

/// Typed handle on a shared region.
#[derive(Debug, Clone)]
pub enum Region {
    Cplx16(SharedBuf<Cplx16>),
    Word(SharedBuf<u16>),
}

impl Region {
    fn same_type(&self, other: &Region) -> bool {
        matches!(
            (self, other),
            (Region::Cplx16(_), Region::Cplx16(_)) | (Region::Word(_), Region::Word(_))
        )
    }
}

/// Transfer channels used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    RangeInPing,
    RangeInPong,
    RangeOutPing,
    RangeOutPong,
    DopplerInPing,
    DopplerInPong,
    AngleInPing,
    AngleInPong,
    DetMatrixOut,
    DetMatrixInPing,
    DetMatrixInPong,
}

const NUM_CHANNELS: usize = 11;

impl Channel {
    pub const RANGE_IN: [Channel; 2] = [Channel::RangeInPing, Channel::RangeInPong];
    pub const RANGE_OUT: [Channel; 2] = [Channel::RangeOutPing, Channel::RangeOutPong];
    pub const DOPPLER_IN: [Channel; 2] = [Channel::DopplerInPing, Channel::DopplerInPong];
    pub const ANGLE_IN: [Channel; 2] = [Channel::AngleInPing, Channel::AngleInPong];
    pub const DET_MATRIX_IN: [Channel; 2] = [Channel::DetMatrixInPing, Channel::DetMatrixInPong];

    fn index(self) -> usize {
        self as usize
    }
}

/// Block transfer description.
///
/// Moves `num_blocks` blocks of `elems_per_block` elements. Block `b` is
/// read at `src_offset + b * src_block_stride` and written at
/// `dst_offset + b * dst_block_stride`. Offsets and strides count elements.
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub src: Region,
    pub src_offset: usize,
    pub dst: Region,
    pub dst_offset: usize,
    pub elems_per_block: usize,
    pub num_blocks: usize,
    pub src_block_stride: usize,
    pub dst_block_stride: usize,
}

impl TransferParams {
    /// Single contiguous block.
    pub fn contiguous(src: Region, src_offset: usize, dst: Region, dst_offset: usize, len: usize) -> Self {
        Self {
            src,
            src_offset,
            dst,
            dst_offset,
            elems_per_block: len,
            num_blocks: 1,
            src_block_stride: len,
            dst_block_stride: len,
        }
    }

    fn execute(&self, channel: Channel) -> Result<(), TransferError> {
        match (&self.src, &self.dst) {
            (Region::Cplx16(src), Region::Cplx16(dst)) => self.copy_blocks(channel, src, dst),
            (Region::Word(src), Region::Word(dst)) => self.copy_blocks(channel, src, dst),
            _ => Err(TransferError::TypeMismatch { channel }),
        }
    }

    fn copy_blocks<T: Copy>(
        &self,
        channel: Channel,
        src: &SharedBuf<T>,
        dst: &SharedBuf<T>,
    ) -> Result<(), TransferError> {
        if self.num_blocks == 0 || self.elems_per_block == 0 {
            return Ok(());
        }
        let last = self.num_blocks - 1;
        let src_end = self.src_offset + last * self.src_block_stride + self.elems_per_block;
        let dst_end = self.dst_offset + last * self.dst_block_stride + self.elems_per_block;
        let check = |end: usize, len: usize| {
            if end > len {
                Err(TransferError::OutOfBounds { channel, end, len })
            } else {
                Ok(())
            }
        };

        let n = self.elems_per_block;
        if Arc::ptr_eq(src, dst) {
            let mut buf = lock(src, channel)?;
            check(src_end, buf.len())?;
            check(dst_end, buf.len())?;
            for b in 0..self.num_blocks {
                let s = self.src_offset + b * self.src_block_stride;
                let d = self.dst_offset + b * self.dst_block_stride;
                buf.copy_within(s..s + n, d);
            }
        } else {
            let src = lock(src, channel)?;
            let mut dst = lock(dst, channel)?;
            check(src_end, src.len())?;
            check(dst_end, dst.len())?;
            for b in 0..self.num_blocks {
                let s = self.src_offset + b * self.src_block_stride;
                let d = self.dst_offset + b * self.dst_block_stride;
                dst[d..d + n].copy_from_slice(&src[s..s + n]);
            }
        }
        Ok(())
    }
}

fn lock<T>(buf: &SharedBuf<T>, channel: Channel) -> Result<MutexGuard<'_, Vec<T>>, TransferError> {
    buf.lock().map_err(|_| TransferError::Fault {
        channel,
        reason: "region lock poisoned",
    })
}

/// Operations offered by a transfer engine.
pub trait TransferEngine: Send {
    /// Programs `channel`. Source and destination must hold the same type.
    fn configure(&mut self, channel: Channel, params: TransferParams) -> Result<(), TransferError>;

    fn set_source_offset(&mut self, channel: Channel, offset: usize) -> Result<(), TransferError>;

    fn set_destination_offset(&mut self, channel: Channel, offset: usize) -> Result<(), TransferError>;

    /// Kicks the programmed transfer and returns without waiting.
    fn start_transfer(&mut self, channel: Channel) -> Result<(), TransferError>;

    /// Whether the last transfer on `channel` finished. Never blocks.
    fn is_complete(&self, channel: Channel) -> bool;

    /// Blocks until the last transfer on `channel` finished. Returns at once
    /// for an idle channel.
    fn wait_transfer(&mut self, channel: Channel) -> Result<(), TransferError>;
}

/// Completion notification between the controller and the waiter.
pub trait CompletionSignal: Send + Sync + 'static {
    fn create() -> Self;

    /// Called by the controller once a transfer on `channel` is done.
    fn post(&self, channel: Channel);

    fn is_posted(&self, channel: Channel) -> bool;

    /// Blocks until `channel` is posted and consumes the notification.
    fn wait(&self, channel: Channel);
}

/// One completion flag per channel, waited on by spinning.
pub struct PollFlags {
    flags: [AtomicBool; NUM_CHANNELS],
}

impl CompletionSignal for PollFlags {
    fn create() -> Self {
        Self {
            flags: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    fn post(&self, channel: Channel) {
        self.flags[channel.index()].store(true, Ordering::Release);
    }

    fn is_posted(&self, channel: Channel) -> bool {
        self.flags[channel.index()].load(Ordering::Acquire)
    }

    fn wait(&self, channel: Channel) {
        let flag = &self.flags[channel.index()];
        while flag
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
            thread::yield_now();
        }
    }
}

/// One counting semaphore per channel, posted by the completion callback.
pub struct Semaphores {
    slots: Vec<(Sender<()>, Receiver<()>)>,
}

impl CompletionSignal for Semaphores {
    fn create() -> Self {
        Self {
            slots: (0..NUM_CHANNELS).map(|_| unbounded()).collect(),
        }
    }

    fn post(&self, channel: Channel) {
        // The receiving half lives in `self`, so this cannot fail.
        let _ = self.slots[channel.index()].0.send(());
    }

    fn is_posted(&self, channel: Channel) -> bool {
        !self.slots[channel.index()].1.is_empty()
    }

    fn wait(&self, channel: Channel) {
        let _ = self.slots[channel.index()].1.recv();
    }
}

struct Job {
    channel: Channel,
    params: TransferParams,
}

/// Transfer engine with a controller thread and a pluggable completion
/// signal.
pub struct DmaEngine<S: CompletionSignal> {
    params: [Option<TransferParams>; NUM_CHANNELS],
    in_flight: [bool; NUM_CHANNELS],
    signal: Arc<S>,
    faults: Arc<Mutex<Vec<TransferError>>>,
    jobs: Option<Sender<Job>>,
    controller: Option<JoinHandle<()>>,
}

pub type PollingDma = DmaEngine<PollFlags>;
pub type CallbackDma = DmaEngine<Semaphores>;

impl<S: CompletionSignal> Default for DmaEngine<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: CompletionSignal> DmaEngine<S> {
    /// Creates the engine and spawns its transfer controller.
    pub fn new() -> Self {
        let signal = Arc::new(S::create());
        let faults = Arc::new(Mutex::new(Vec::new()));
        // At most one job per channel can be queued.
        let (tx, rx) = bounded(NUM_CHANNELS);

        log::trace!("Spawning transfer controller thread");
        let controller = {
            let signal = signal.clone();
            let faults = faults.clone();
            thread::spawn(move || {
                run_controller(rx, signal, move |channel, e| on_transfer_error(&faults, channel, e))
            })
        };

        Self {
            params: std::array::from_fn(|_| None),
            in_flight: [false; NUM_CHANNELS],
            signal,
            faults,
            jobs: Some(tx),
            controller: Some(controller),
        }
    }

    fn params_mut(&mut self, channel: Channel) -> Result<&mut TransferParams, TransferError> {
        self.params[channel.index()]
            .as_mut()
            .ok_or(TransferError::Unconfigured { channel })
    }

    /// Consumes the completion of `channel` and reports a fault raised by
    /// its transfer, if any.
    fn reap(&mut self, channel: Channel) -> Result<(), TransferError> {
        self.signal.wait(channel);
        self.in_flight[channel.index()] = false;

        let mut faults = self.faults.lock().map_err(|_| TransferError::ControllerStopped)?;
        let pos = faults.iter().position(|f| match f {
            TransferError::Fault { channel: c, .. } => *c == channel,
            _ => false,
        });
        match pos {
            Some(pos) => Err(faults.remove(pos)),
            None => Ok(()),
        }
    }
}

/// Error callback of the transfer controller.
fn on_transfer_error(faults: &Mutex<Vec<TransferError>>, channel: Channel, e: TransferError) {
    log::error!("Transfer on channel {:?} failed: {}", channel, e);
    let reason = match e {
        TransferError::OutOfBounds { .. } => "block out of bounds",
        TransferError::TypeMismatch { .. } => "element type mismatch",
        TransferError::Fault { reason, .. } => reason,
        _ => "transfer aborted",
    };
    if let Ok(mut faults) = faults.lock() {
        faults.push(TransferError::Fault { channel, reason });
    }
}

fn run_controller<S: CompletionSignal>(
    jobs: Receiver<Job>,
    signal: Arc<S>,
    on_error: impl Fn(Channel, TransferError),
) {
    while let Ok(job) = jobs.recv() {
        if let Err(e) = job.params.execute(job.channel) {
            on_error(job.channel, e);
        }
        signal.post(job.channel);
    }
    log::trace!("Transfer controller stopped");
}

impl<S: CompletionSignal> TransferEngine for DmaEngine<S> {
    fn configure(&mut self, channel: Channel, params: TransferParams) -> Result<(), TransferError> {
        if !params.src.same_type(&params.dst) {
            return Err(TransferError::TypeMismatch { channel });
        }
        if self.in_flight[channel.index()] && !self.signal.is_posted(channel) {
            return Err(TransferError::ChannelBusy { channel });
        }
        self.params[channel.index()] = Some(params);
        Ok(())
    }

    fn set_source_offset(&mut self, channel: Channel, offset: usize) -> Result<(), TransferError> {
        self.params_mut(channel)?.src_offset = offset;
        Ok(())
    }

    fn set_destination_offset(&mut self, channel: Channel, offset: usize) -> Result<(), TransferError> {
        self.params_mut(channel)?.dst_offset = offset;
        Ok(())
    }

    fn start_transfer(&mut self, channel: Channel) -> Result<(), TransferError> {
        let params = self.params[channel.index()]
            .clone()
            .ok_or(TransferError::Unconfigured { channel })?;

        if self.in_flight[channel.index()] {
            if !self.signal.is_posted(channel) {
                return Err(TransferError::ChannelBusy { channel });
            }
            // Finished but never waited on.
            self.reap(channel)?;
        }

        let jobs = self.jobs.as_ref().ok_or(TransferError::ControllerStopped)?;
        jobs.send(Job { channel, params })
            .map_err(|_| TransferError::ControllerStopped)?;
        self.in_flight[channel.index()] = true;
        Ok(())
    }

    fn is_complete(&self, channel: Channel) -> bool {
        !self.in_flight[channel.index()] || self.signal.is_posted(channel)
    }

    fn wait_transfer(&mut self, channel: Channel) -> Result<(), TransferError> {
        if !self.in_flight[channel.index()] {
            return Ok(());
        }
        self.reap(channel)
    }
}

impl<S: CompletionSignal> Drop for DmaEngine<S> {
    fn drop(&mut self) {
        // Closing the job queue lets the controller run dry and exit.
        self.jobs = None;
        if let Some(controller) = self.controller.take() {
            if let Err(e) = controller.join() {
                log::error!("Couldn't join transfer controller thread. Error: {:?}", e);
            }
        }
    }
}

/// Creates the engine for the configured completion discipline.
pub fn new_engine(mode: TransferMode) -> Box<dyn TransferEngine> {
    log::debug!("Creating {:?} transfer engine", mode);
    match mode {
        TransferMode::Polling => Box::new(PollingDma::new()),
        TransferMode::Callback => Box::new(CallbackDma::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn ramp(len: usize) -> SharedBuf<Cplx16> {
        shared((0..len).map(|i| Complex::new(i as i16, -(i as i16))).collect())
    }

    fn gather_columns(engine: &mut dyn TransferEngine) -> Vec<Cplx16> {
        // 4 rows of 8, gather column `c` into slot `c % 2`, then copy out
        let src = ramp(32);
        let slots = [shared(vec![Complex::new(0, 0); 4]), shared(vec![Complex::new(0, 0); 4])];
        for (ch, slot) in Channel::DOPPLER_IN.iter().zip(&slots) {
            engine
                .configure(
                    *ch,
                    TransferParams {
                        src: Region::Cplx16(src.clone()),
                        src_offset: 0,
                        dst: Region::Cplx16(slot.clone()),
                        dst_offset: 0,
                        elems_per_block: 1,
                        num_blocks: 4,
                        src_block_stride: 8,
                        dst_block_stride: 1,
                    },
                )
                .unwrap();
        }

        let mut out = Vec::new();
        engine.start_transfer(Channel::DOPPLER_IN[0]).unwrap();
        for col in 0..8 {
            let ping = col % 2;
            if col + 1 < 8 {
                let next = Channel::DOPPLER_IN[1 - ping];
                engine.set_source_offset(next, col + 1).unwrap();
                engine.start_transfer(next).unwrap();
            }
            engine.wait_transfer(Channel::DOPPLER_IN[ping]).unwrap();
            out.extend(slots[ping].lock().unwrap().iter().copied());
        }
        engine.wait_transfer(Channel::DOPPLER_IN[1]).unwrap();
        out
    }

    #[test]
    fn test_strided_gather_in_both_modes() {
        let expected: Vec<Cplx16> = (0..8)
            .flat_map(|c| (0..4).map(move |r| Complex::new((r * 8 + c) as i16, -((r * 8 + c) as i16))))
            .collect();

        let mut polling = new_engine(TransferMode::Polling);
        let mut callback = new_engine(TransferMode::Callback);
        assert_eq!(gather_columns(polling.as_mut()), expected);
        assert_eq!(gather_columns(callback.as_mut()), expected);
    }

    #[test]
    fn test_destination_offset_retargets() {
        let mut engine = CallbackDma::new();
        let src = ramp(4);
        let dst = shared(vec![Complex::new(0, 0); 12]);
        engine
            .configure(
                Channel::RangeOutPing,
                TransferParams::contiguous(Region::Cplx16(src), 0, Region::Cplx16(dst.clone()), 0, 4),
            )
            .unwrap();
        for row in [2, 0] {
            engine.set_destination_offset(Channel::RangeOutPing, row * 4).unwrap();
            engine.start_transfer(Channel::RangeOutPing).unwrap();
            engine.wait_transfer(Channel::RangeOutPing).unwrap();
        }
        let dst = dst.lock().unwrap();
        assert_eq!(dst[0], Complex::new(0, 0));
        assert_eq!(dst[3], Complex::new(3, -3));
        assert_eq!(dst[4], Complex::new(0, 0));
        assert_eq!(dst[4..8], [Complex::new(0, 0); 4]);
        assert_eq!(dst[11], Complex::new(3, -3));
    }

    #[test]
    fn test_start_while_in_flight_is_busy() {
        for mode in [TransferMode::Polling, TransferMode::Callback] {
            let mut engine = new_engine(mode);
            let src = shared(vec![1u16; 8]);
            let dst = shared(vec![0u16; 8]);
            engine
                .configure(
                    Channel::DetMatrixOut,
                    TransferParams::contiguous(Region::Word(src), 0, Region::Word(dst.clone()), 0, 8),
                )
                .unwrap();

            // Holding the destination stalls the controller mid-transfer.
            let guard = dst.lock().unwrap();
            engine.start_transfer(Channel::DetMatrixOut).unwrap();
            assert!(!engine.is_complete(Channel::DetMatrixOut));
            assert_eq!(
                engine.start_transfer(Channel::DetMatrixOut),
                Err(TransferError::ChannelBusy {
                    channel: Channel::DetMatrixOut
                })
            );
            drop(guard);

            engine.wait_transfer(Channel::DetMatrixOut).unwrap();
            assert!(engine.is_complete(Channel::DetMatrixOut));
            assert_eq!(*dst.lock().unwrap(), vec![1u16; 8]);
        }
    }

    #[test]
    fn test_out_of_bounds_faults_waiter() {
        for mode in [TransferMode::Polling, TransferMode::Callback] {
            let mut engine = new_engine(mode);
            engine
                .configure(
                    Channel::AngleInPing,
                    TransferParams::contiguous(
                        Region::Cplx16(ramp(8)),
                        4,
                        Region::Cplx16(ramp(8)),
                        0,
                        8,
                    ),
                )
                .unwrap();
            engine.start_transfer(Channel::AngleInPing).unwrap();
            assert_eq!(
                engine.wait_transfer(Channel::AngleInPing),
                Err(TransferError::Fault {
                    channel: Channel::AngleInPing,
                    reason: "block out of bounds"
                })
            );
            // The fault is consumed by the waiter
            assert_eq!(engine.wait_transfer(Channel::AngleInPing), Ok(()));
        }
    }

    #[test]
    fn test_idle_and_unconfigured_channels() {
        let mut engine = PollingDma::new();
        assert!(engine.is_complete(Channel::RangeInPong));
        assert_eq!(engine.wait_transfer(Channel::RangeInPong), Ok(()));
        assert_eq!(
            engine.start_transfer(Channel::RangeInPong),
            Err(TransferError::Unconfigured {
                channel: Channel::RangeInPong
            })
        );
        assert_eq!(
            engine.configure(
                Channel::RangeInPong,
                TransferParams::contiguous(Region::Cplx16(ramp(4)), 0, Region::Word(shared(vec![0; 4])), 0, 4),
            ),
            Err(TransferError::TypeMismatch {
                channel: Channel::RangeInPong
            })
        );
    }
}
