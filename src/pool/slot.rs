//! A single worker slot.
//!
//! Each slot is a Tokio task that exclusively owns one [`Recognizer`]. The
//! scheduler talks to it only through [`SlotRequest`]s, and the slot answers
//! with [`SlotEvent`]s. Slots share no mutable state with the scheduler or
//! with each other.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt as _, StreamExt as _, channel::mpsc};
use tokio::task::JoinHandle;

use crate::{
    prelude::*,
    recognizer::{PageImage, Recognizer, RecognizerFactory, Region, RegionText},
};

use super::{RegionProgress, TaskId, scheduler::Event};

/// Requests sent from the scheduler to a slot.
pub(super) enum SlotRequest {
    /// Create the slot's engine, then acknowledge with [`SlotEvent::Ready`].
    Init { lang: String },

    /// Recognize every region of a page, in order.
    Recognize {
        task_id: TaskId,
        page_number: u32,
        image: Arc<PageImage>,
        regions: Vec<Region>,
        progress: Option<RegionProgress>,
    },

    /// Shut down the engine and exit.
    Terminate,
}

/// Events sent from a slot back to the scheduler.
#[derive(Debug)]
pub(super) enum SlotEvent {
    /// The engine is ready to accept work.
    Ready,

    /// The engine could not be created.
    InitFailed(String),

    /// A task finished successfully.
    Recognized {
        task_id: TaskId,
        results: Vec<RegionText>,
    },

    /// A task failed, but the engine is still usable.
    Failed { task_id: TaskId, message: String },

    /// The engine died. The slot is going away.
    Fault(String),

    /// The slot task has exited.
    Terminated,
}

/// The scheduler's handle to a running slot.
pub(super) struct SlotHandle {
    tx: mpsc::UnboundedSender<SlotRequest>,
    join_handle: JoinHandle<()>,
}

impl SlotHandle {
    /// Spawn a new slot task. It does nothing until it receives
    /// [`SlotRequest::Init`].
    pub(super) fn spawn(
        index: usize,
        generation: u64,
        factory: Arc<dyn RecognizerFactory>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let slot = Slot {
            index,
            generation,
            factory,
            events,
            engine: None,
        };
        let join_handle = tokio::spawn(slot.run(rx));
        Self { tx, join_handle }
    }

    /// Send a request to the slot. Fails if the slot task has exited.
    pub(super) fn send(&self, request: SlotRequest) -> Result<()> {
        self.tx
            .unbounded_send(request)
            .map_err(|_| anyhow!("worker slot is no longer running"))
    }

    /// Ask the slot to terminate, then abort it. Both steps are best-effort.
    pub(super) fn destroy(self) {
        self.send(SlotRequest::Terminate).ok();
        self.join_handle.abort();
    }
}

/// State owned by a running slot task.
struct Slot {
    index: usize,
    generation: u64,
    factory: Arc<dyn RecognizerFactory>,
    events: mpsc::UnboundedSender<Event>,
    engine: Option<Box<dyn Recognizer>>,
}

impl Slot {
    /// Report an event to the scheduler. If the scheduler is gone, there is
    /// nobody left to tell.
    fn emit(&self, event: SlotEvent) {
        let message = Event::Slot {
            generation: self.generation,
            slot: self.index,
            event,
        };
        if self.events.unbounded_send(message).is_err() {
            trace!(slot = self.index, "scheduler is gone, dropping slot event");
        }
    }

    /// Process requests until we're told to stop or the engine dies.
    #[instrument(level = "debug", name = "slot", skip_all, fields(slot = self.index))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SlotRequest>) {
        while let Some(request) = rx.next().await {
            match request {
                SlotRequest::Init { lang } => {
                    if !self.init(&lang).await {
                        break;
                    }
                }
                SlotRequest::Recognize {
                    task_id,
                    page_number,
                    image,
                    regions,
                    progress,
                } => {
                    let progress = progress.as_deref();
                    if !self
                        .recognize(task_id, page_number, &image, &regions, progress)
                        .await
                    {
                        break;
                    }
                }
                SlotRequest::Terminate => {
                    self.shutdown().await;
                    break;
                }
            }
        }
        self.emit(SlotEvent::Terminated);
    }

    /// Create our engine. Returns `false` if the slot must exit.
    async fn init(&mut self, lang: &str) -> bool {
        if self.engine.is_none() {
            let created = AssertUnwindSafe(self.factory.create(lang))
                .catch_unwind()
                .await;
            match created {
                Ok(Ok(engine)) => self.engine = Some(engine),
                Ok(Err(err)) => {
                    warn!("failed to create OCR engine: {:#}", err);
                    self.emit(SlotEvent::InitFailed(format!("{:#}", err)));
                    return true;
                }
                Err(panic) => {
                    self.emit(SlotEvent::Fault(panic_message(panic.as_ref())));
                    return false;
                }
            }
        }
        debug!(lang, "OCR engine ready");
        self.emit(SlotEvent::Ready);
        true
    }

    /// Run one task. Returns `false` if the slot must exit.
    async fn recognize(
        &mut self,
        task_id: TaskId,
        page_number: u32,
        image: &PageImage,
        regions: &[Region],
        progress: Option<&(dyn Fn(usize) + Send + Sync)>,
    ) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            self.emit(SlotEvent::Failed {
                task_id,
                message: "OCR engine is not initialized".to_owned(),
            });
            return true;
        };

        debug!(%task_id, page_number, regions = regions.len(), "Starting OCR task");
        let outcome = AssertUnwindSafe(recognize_page(engine.as_mut(), image, regions, progress))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(results)) => {
                self.emit(SlotEvent::Recognized { task_id, results });
                true
            }
            Ok(Err(err)) => {
                self.emit(SlotEvent::Failed {
                    task_id,
                    message: format!("{:#}", err),
                });
                true
            }
            Err(panic) => {
                // We can't trust an engine that panicked mid-task.
                self.engine = None;
                self.emit(SlotEvent::Fault(panic_message(panic.as_ref())));
                false
            }
        }
    }

    /// Shut down our engine, if we have one.
    async fn shutdown(&mut self) {
        if let Some(mut engine) = self.engine.take()
            && let Err(err) = engine.shutdown().await
        {
            warn!("failed to shut down OCR engine: {:#}", err);
        }
    }
}

/// Recognize each region of `image` in turn.
///
/// A failure on a single region produces an empty placeholder result with a
/// confidence of -1; only a failure to load the page fails the task.
async fn recognize_page(
    engine: &mut dyn Recognizer,
    image: &PageImage,
    regions: &[Region],
    progress: Option<&(dyn Fn(usize) + Send + Sync)>,
) -> Result<Vec<RegionText>> {
    if regions.is_empty() {
        return Ok(vec![]);
    }
    engine
        .load_page(image)
        .await
        .context("failed to load page into OCR engine")?;

    let mut results = Vec::with_capacity(regions.len());
    for &region in regions {
        match engine.recognize_region(region).await {
            Ok(recognition) => results.push(RegionText {
                region,
                text: recognition.text.trim().to_owned(),
                confidence: recognition.confidence,
            }),
            Err(err) => {
                warn!(%region, "failed to recognize region: {:#}", err);
                results.push(RegionText::unrecognized(region));
            }
        }
        if let Some(progress) = progress {
            progress(results.len());
        }
    }
    Ok(results)
}

/// Extract a human-readable message from a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "OCR engine panicked".to_owned()
    }
}
