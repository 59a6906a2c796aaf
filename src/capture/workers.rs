//! Streaming workers.
//!
//! Two long-lived threads sit between the render thread and the encoder:
//!
//! - `frame-dispatch` receives retired slots in capture order. Slots already
//!   in the target layout are forwarded as-is; the rest get a conversion task
//!   on its own thread and the pending task is forwarded instead.
//! - `frame-writer` receives those items in the same order, waits for each
//!   conversion, writes the frame bytes to the encoder input and releases the
//!   slot back to the pool.
//!
//! Frames reach the encoder in capture order no matter when their conversions
//! finish. The first fatal error is recorded in a shared [`FailureCell`] and
//! aborts the pool; the writer keeps draining (without writing) so every slot
//! still makes it back.

use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use super::pool::{Slot, SlotPool, SlotState};
use crate::error::{PipelineError, PipelineResult};
use crate::format::{convert, ConversionPlan, PixelLayout};
use crate::gpu::ReadbackBuffer;

/// Shape of the frames flowing through the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    /// Layout of the bytes in a slot's readback region.
    pub capture: PixelLayout,
    /// Layout streamed to the encoder.
    pub target: PixelLayout,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, target: PixelLayout) -> Self {
        Self {
            width,
            height,
            capture: target.capture_layout(),
            target,
        }
    }

    pub fn conversion(&self) -> ConversionPlan {
        self.target.conversion()
    }

    /// Bytes per frame written to the encoder.
    pub fn frame_size(&self) -> usize {
        self.target.frame_size(self.width, self.height)
    }

    /// Size of the per-slot conversion buffer.
    pub fn conversion_buffer_size(&self) -> usize {
        match self.conversion() {
            ConversionPlan::Passthrough => 0,
            ConversionPlan::Offload => self.frame_size(),
        }
    }
}

/// First fatal error seen by any pipeline thread.
#[derive(Debug, Default)]
pub struct FailureCell {
    reason: Mutex<Option<String>>,
}

impl FailureCell {
    /// Record `error` unless an earlier one is already recorded.
    pub fn record(&self, error: &PipelineError) {
        let mut reason = self.reason.lock();
        if reason.is_none() {
            *reason = Some(error.to_string());
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn check(&self) -> PipelineResult<()> {
        match self.reason() {
            Some(reason) => Err(PipelineError::PipelineFailed(reason)),
            None => Ok(()),
        }
    }
}

/// Convert a slot's readback into its conversion buffer.
pub(crate) fn convert_slot<R: ReadbackBuffer>(
    slot: &mut Slot<R>,
    format: FrameFormat,
) -> PipelineResult<()> {
    let (readback, converted) = slot.buffers_mut();
    readback.with_bytes(|bytes| {
        convert(
            format.capture,
            bytes,
            format.target,
            converted,
            format.width,
            format.height,
        )
    })
}

fn write_slot<R: ReadbackBuffer>(
    slot: &Slot<R>,
    format: FrameFormat,
    output: &mut dyn Write,
) -> io::Result<()> {
    let size = format.frame_size();
    let write = |bytes: &[u8], output: &mut dyn Write| match bytes.get(..size) {
        Some(frame) => output.write_all(frame),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("slot {} holds {} of {} frame bytes", slot.id(), bytes.len(), size),
        )),
    };

    match format.conversion() {
        ConversionPlan::Passthrough => slot.readback().with_bytes(|bytes| write(bytes, output)),
        ConversionPlan::Offload => write(slot.converted(), output),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

type Converted<R> = (Slot<R>, PipelineResult<()>);

/// Conversion running on its own thread.
pub struct ConversionTask<R> {
    slot_id: usize,
    handle: JoinHandle<Option<Converted<R>>>,
}

impl<R: ReadbackBuffer> ConversionTask<R> {
    /// Run `job` over `slot` on a new thread.
    ///
    /// If the thread cannot be spawned the slot is handed back untouched.
    pub fn spawn<F>(slot: Slot<R>, job: F) -> Result<Self, (Slot<R>, io::Error)>
    where
        F: FnOnce(&mut Slot<R>) -> PipelineResult<()> + Send + 'static,
    {
        let slot_id = slot.id();
        // The slot only moves once the thread exists.
        let (handoff, incoming) = bounded::<Slot<R>>(1);

        let spawned = thread::Builder::new()
            .name(format!("frame-convert-{}", slot_id))
            .spawn(move || {
                let mut slot = incoming.recv().ok()?;
                // A panicking job must still hand its slot back to the writer.
                let result = panic::catch_unwind(AssertUnwindSafe(|| job(&mut slot)))
                    .unwrap_or_else(|payload| {
                        Err(PipelineError::WorkerPanicked(format!(
                            "conversion of slot {}: {}",
                            slot_id,
                            panic_message(payload)
                        )))
                    });
                Some((slot, result))
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err((slot, e)),
        };

        match handoff.send(slot) {
            Ok(()) => Ok(Self { slot_id, handle }),
            Err(returned) => Err((
                returned.into_inner(),
                io::Error::other("conversion thread exited before receiving its slot"),
            )),
        }
    }

    /// Block until the conversion finishes.
    pub fn wait(self) -> PipelineResult<Converted<R>> {
        match self.handle.join() {
            Ok(Some(done)) => Ok(done),
            Ok(None) => Err(PipelineError::Other(format!(
                "conversion task for slot {} lost its slot",
                self.slot_id
            ))),
            Err(payload) => Err(PipelineError::WorkerPanicked(format!(
                "conversion of slot {}: {}",
                self.slot_id,
                panic_message(payload)
            ))),
        }
    }
}

/// Item handed from the dispatch stage to the writer.
pub enum PendingFrame<R> {
    /// Bytes are ready (or conversion already failed inline).
    Ready(Slot<R>, PipelineResult<()>),
    Converting(ConversionTask<R>),
}

impl<R: ReadbackBuffer> PendingFrame<R> {
    fn resolve(self) -> PipelineResult<Converted<R>> {
        match self {
            PendingFrame::Ready(slot, result) => Ok((slot, result)),
            PendingFrame::Converting(task) => task.wait(),
        }
    }
}

fn dispatch_frames<R: ReadbackBuffer>(
    slots: Receiver<Slot<R>>,
    pending: Sender<PendingFrame<R>>,
    format: FrameFormat,
) {
    for slot in slots.iter() {
        let item = match format.conversion() {
            ConversionPlan::Passthrough => PendingFrame::Ready(slot, Ok(())),
            ConversionPlan::Offload => {
                slot.set_state(SlotState::Converting);
                match ConversionTask::spawn(slot, move |slot| convert_slot(slot, format)) {
                    Ok(task) => PendingFrame::Converting(task),
                    Err((mut slot, e)) => {
                        log::warn!(
                            "[DISPATCH] Could not spawn conversion thread ({}), converting inline",
                            e
                        );
                        let result = convert_slot(&mut slot, format);
                        PendingFrame::Ready(slot, result)
                    },
                }
            },
        };

        if pending.send(item).is_err() {
            log::error!("[DISPATCH] Writer is gone, dropping remaining frames");
            break;
        }
    }
    log::debug!("[DISPATCH] Input closed, exiting");
}

/// What the writer thread hands back when it exits.
pub struct WriterReport {
    /// The encoder input, returned so the owner decides when to close it.
    pub output: Box<dyn Write + Send>,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub error: Option<PipelineError>,
}

struct WriteStage<R> {
    pool: Arc<SlotPool<R>>,
    failure: Arc<FailureCell>,
    error: Option<PipelineError>,
}

impl<R: ReadbackBuffer> WriteStage<R> {
    fn fail(&mut self, error: PipelineError) {
        log::error!("[WRITER] {}", error);
        self.failure.record(&error);
        self.pool.abort(&error.to_string());
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

fn write_frames<R: ReadbackBuffer>(
    pending: Receiver<PendingFrame<R>>,
    mut output: Box<dyn Write + Send>,
    pool: Arc<SlotPool<R>>,
    format: FrameFormat,
    failure: Arc<FailureCell>,
) -> WriterReport {
    let frame_size = format.frame_size() as u64;
    let mut stage = WriteStage {
        pool,
        failure,
        error: None,
    };
    let mut frames_written = 0u64;

    for item in pending.iter() {
        let (mut slot, converted) = match item.resolve() {
            Ok(done) => done,
            Err(e) => {
                stage.fail(e);
                continue;
            },
        };

        slot.set_state(SlotState::Draining);
        if stage.error.is_none() {
            let result = converted.and_then(|()| {
                write_slot(&slot, format, output.as_mut()).map_err(|source| {
                    PipelineError::EncoderWrite {
                        frame: frames_written,
                        source,
                    }
                })
            });
            match result {
                Ok(()) => frames_written += 1,
                Err(e) => stage.fail(e),
            }
        }

        slot.readback_mut().recycle();
        stage.pool.release(slot);
    }

    if stage.error.is_none() {
        if let Err(source) = output.flush() {
            stage.fail(PipelineError::EncoderWrite {
                frame: frames_written,
                source,
            });
        }
    }

    log::debug!(
        "[WRITER] Input closed after {} frames ({} bytes)",
        frames_written,
        frames_written * frame_size
    );

    WriterReport {
        output,
        frames_written,
        bytes_written: frames_written * frame_size,
        error: stage.error,
    }
}

/// Handle to the dispatch and writer threads.
pub struct StreamWorkers<R: ReadbackBuffer> {
    input: Option<Sender<Slot<R>>>,
    dispatch: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<WriterReport>>,
}

impl<R: ReadbackBuffer> StreamWorkers<R> {
    /// Start both workers streaming into `output`.
    ///
    /// Channels are bounded by the pool capacity; since slots are the only
    /// thing flowing through them, sends never block for long.
    pub fn spawn(
        pool: Arc<SlotPool<R>>,
        format: FrameFormat,
        output: Box<dyn Write + Send>,
        failure: Arc<FailureCell>,
    ) -> PipelineResult<Self> {
        let depth = pool.capacity().max(1);
        let (slot_tx, slot_rx) = bounded::<Slot<R>>(depth);
        let (pending_tx, pending_rx) = bounded::<PendingFrame<R>>(depth);

        let writer = thread::Builder::new()
            .name("frame-writer".to_string())
            .spawn(move || write_frames(pending_rx, output, pool, format, failure))?;

        // The dispatch thread owns the writer's input; its exit closes it.
        let dispatch = match thread::Builder::new()
            .name("frame-dispatch".to_string())
            .spawn(move || dispatch_frames(slot_rx, pending_tx, format))
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = writer.join();
                return Err(e.into());
            },
        };

        log::debug!(
            "[CAPTURE] Streaming workers started ({}x{} {} -> {})",
            format.width,
            format.height,
            format.capture,
            format.target
        );

        Ok(Self {
            input: Some(slot_tx),
            dispatch: Some(dispatch),
            writer: Some(writer),
        })
    }

    /// Queue a retired slot for streaming.
    pub fn submit(&self, slot: Slot<R>) -> PipelineResult<()> {
        let input = self.input.as_ref().ok_or_else(|| {
            PipelineError::PipelineFailed("streaming workers already stopped".to_string())
        })?;
        input
            .send(slot)
            .map_err(|_| PipelineError::PipelineFailed("dispatch worker is gone".to_string()))
    }

    /// Close the dispatch input, join it, then join the writer.
    ///
    /// Every slot submitted before this call is written (or drained after a
    /// failure) before it returns.
    pub fn shutdown(mut self) -> PipelineResult<WriterReport> {
        self.stop()
    }

    fn stop(&mut self) -> PipelineResult<WriterReport> {
        drop(self.input.take());

        let mut panicked = None;
        if let Some(dispatch) = self.dispatch.take() {
            if let Err(payload) = dispatch.join() {
                panicked = Some(PipelineError::WorkerPanicked(format!(
                    "frame-dispatch: {}",
                    panic_message(payload)
                )));
            }
        }

        let writer = self.writer.take().ok_or_else(|| {
            PipelineError::PipelineFailed("streaming workers already stopped".to_string())
        })?;
        let report = writer.join().map_err(|payload| {
            PipelineError::WorkerPanicked(format!("frame-writer: {}", panic_message(payload)))
        })?;

        match panicked {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

impl<R: ReadbackBuffer> Drop for StreamWorkers<R> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            log::warn!("[CAPTURE] Streaming workers dropped while running, draining");
            if let Err(e) = self.stop() {
                log::error!("[CAPTURE] Worker shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Bytes(Vec<u8>);

    impl ReadbackBuffer for Bytes {
        fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
            f(&self.0)
        }

        fn recycle(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder exited"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// 2x2 frames; NV12 target so every frame is offloaded.
    fn offload_format() -> FrameFormat {
        FrameFormat::new(2, 2, PixelLayout::Nv12)
    }

    #[test]
    fn test_conversion_plan_follows_target_layout() {
        for target in [
            PixelLayout::Rgb24,
            PixelLayout::I420,
            PixelLayout::I444,
            PixelLayout::Nv12,
            PixelLayout::Nv21,
            PixelLayout::I422,
        ] {
            let format = FrameFormat::new(4, 2, target);
            assert_eq!(format.conversion(), target.conversion());
        }
        assert_eq!(offload_format().conversion(), ConversionPlan::Offload);
        assert_eq!(offload_format().conversion_buffer_size(), 6);
    }

    fn ready_slot(pool: &SlotPool<Bytes>) -> Slot<Bytes> {
        let slot = pool.acquire().unwrap();
        slot.set_state(SlotState::ReadyForConversion);
        slot
    }

    fn run_writer(
        items: Vec<PendingFrame<Bytes>>,
        output: Box<dyn Write + Send>,
        pool: Arc<SlotPool<Bytes>>,
        format: FrameFormat,
        failure: Arc<FailureCell>,
    ) -> WriterReport {
        let (tx, rx) = bounded(items.len().max(1));
        for item in items {
            tx.send(item).unwrap();
        }
        drop(tx);
        write_frames(rx, output, pool, format, failure)
    }

    #[test]
    fn test_writer_keeps_order_when_conversions_finish_out_of_order() {
        let format = offload_format();
        let size = format.frame_size();
        let pool = Arc::new(SlotPool::new(
            (0..4).map(|_| Bytes(vec![0; size])).collect(),
            format.conversion_buffer_size(),
        ));

        // Earlier frames take longer to convert
        let items = (0..4u8)
            .map(|i| {
                let slot = ready_slot(&pool);
                slot.set_state(SlotState::Converting);
                let task = ConversionTask::spawn(slot, move |slot| {
                    thread::sleep(Duration::from_millis(20 * (4 - i as u64)));
                    let (_, converted) = slot.buffers_mut();
                    converted.fill(i);
                    Ok(())
                })
                .map_err(|(_, e)| e)
                .unwrap();
                PendingFrame::Converting(task)
            })
            .collect();

        let sink = SharedSink::default();
        let report = run_writer(
            items,
            Box::new(sink.clone()),
            Arc::clone(&pool),
            format,
            Arc::new(FailureCell::default()),
        );

        assert!(report.error.is_none());
        assert_eq!(report.frames_written, 4);
        let expected: Vec<u8> = (0..4u8).flat_map(|i| vec![i; size]).collect();
        assert_eq!(*sink.0.lock(), expected);
        assert_eq!(pool.census().free, 4);
    }

    #[test]
    fn test_passthrough_writes_readback_bytes() {
        let format = FrameFormat::new(1, 1, PixelLayout::Rgb24);
        let pool = Arc::new(SlotPool::new(vec![Bytes(vec![7, 8, 9])], 0));
        let items = vec![PendingFrame::Ready(ready_slot(&pool), Ok(()))];

        let sink = SharedSink::default();
        let report = run_writer(
            items,
            Box::new(sink.clone()),
            Arc::clone(&pool),
            format,
            Arc::new(FailureCell::default()),
        );
        assert_eq!(report.bytes_written, 3);
        assert_eq!(*sink.0.lock(), vec![7, 8, 9]);
    }

    #[test]
    fn test_write_failure_is_fatal_but_drains() {
        let format = FrameFormat::new(1, 1, PixelLayout::Rgb24);
        let pool = Arc::new(SlotPool::new(
            (0..3).map(|_| Bytes(vec![1, 2, 3])).collect(),
            0,
        ));
        let items = (0..3)
            .map(|_| PendingFrame::Ready(ready_slot(&pool), Ok(())))
            .collect();
        let failure = Arc::new(FailureCell::default());

        let report = run_writer(
            items,
            Box::new(BrokenPipe),
            Arc::clone(&pool),
            format,
            Arc::clone(&failure),
        );

        assert!(matches!(
            report.error,
            Some(PipelineError::EncoderWrite { frame: 0, .. })
        ));
        assert_eq!(report.frames_written, 0);
        assert!(failure.check().is_err());
        // Every slot came back, but the pool refuses new captures
        assert_eq!(pool.census().free, 3);
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn test_conversion_panic_is_reported() {
        let format = offload_format();
        let pool = Arc::new(SlotPool::new(
            vec![Bytes(vec![0; format.frame_size()])],
            format.conversion_buffer_size(),
        ));
        let slot = ready_slot(&pool);
        slot.set_state(SlotState::Converting);
        let task = ConversionTask::spawn(slot, |_| panic!("bad frame"))
            .map_err(|(_, e)| e)
            .unwrap();
        let failure = Arc::new(FailureCell::default());

        let report = run_writer(
            vec![PendingFrame::Converting(task)],
            Box::new(SharedSink::default()),
            Arc::clone(&pool),
            format,
            Arc::clone(&failure),
        );

        assert!(matches!(report.error, Some(PipelineError::WorkerPanicked(_))));
        assert!(failure.reason().unwrap().contains("bad frame"));
        assert_eq!(report.frames_written, 0);
        // The panicked conversion still returned its slot
        assert_eq!(pool.census().free, 1);
    }

    #[test]
    fn test_workers_stream_and_shut_down() {
        let format = offload_format();
        let size = format.frame_size();
        let pool = Arc::new(SlotPool::new(
            (0..3u8).map(|i| Bytes(vec![i; size])).collect(),
            format.conversion_buffer_size(),
        ));
        let sink = SharedSink::default();
        let workers = StreamWorkers::spawn(
            Arc::clone(&pool),
            format,
            Box::new(sink.clone()),
            Arc::new(FailureCell::default()),
        )
        .unwrap();

        for _ in 0..3 {
            workers.submit(ready_slot(&pool)).unwrap();
        }
        let report = workers.shutdown().unwrap();

        assert_eq!(report.frames_written, 3);
        assert_eq!(sink.0.lock().len(), 3 * size);
        assert_eq!(pool.census().free, 3);
    }
}
