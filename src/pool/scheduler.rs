//! The scheduler task behind [`super::WorkerPool`].
//!
//! All scheduler state lives in a single Tokio task, and is only touched in
//! response to discrete messages: [`Command`]s from pool handles, and
//! [`Event`]s from worker slots and timers. Nothing here needs a lock.

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::Arc,
};

use futures::{
    StreamExt as _,
    channel::{mpsc, oneshot},
};

use crate::{
    prelude::*,
    recognizer::{PageImage, RecognizerFactory, Region, RegionText},
};

use super::{
    PoolConfig, PoolError, PoolStats, RegionProgress, TaskId,
    slot::{SlotEvent, SlotHandle, SlotRequest},
};

/// Requests from a [`super::WorkerPool`] handle.
pub(super) enum Command {
    Initialize {
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Submit(Task),
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

/// Things that happen to the pool asynchronously.
#[derive(Debug)]
pub(super) enum Event {
    /// A worker slot reported something.
    Slot {
        generation: u64,
        slot: usize,
        event: SlotEvent,
    },

    /// The initialization timeout for `generation` expired.
    InitDeadline { generation: u64 },
}

/// Where a caller is waiting for a task's outcome.
pub(super) struct Completion {
    tx: oneshot::Sender<Result<Vec<RegionText>, PoolError>>,
}

impl Completion {
    /// Settle the task. This consumes the completion, so it can only happen
    /// once.
    fn settle(self, task_id: TaskId, result: Result<Vec<RegionText>, PoolError>) {
        if let Err(err) = &result {
            debug!(%task_id, "OCR task rejected: {}", err);
        } else {
            debug!(%task_id, "OCR task completed");
        }
        if self.tx.send(result).is_err() {
            debug!(%task_id, "failed to send OCR task result because receiver was dropped");
        }
    }
}

/// A submitted task.
pub(super) struct Task {
    id: TaskId,
    page_number: u32,
    image: Arc<PageImage>,
    regions: Vec<Region>,
    progress: Option<RegionProgress>,
    completion: Completion,
}

impl Task {
    /// Create a new task.
    pub(super) fn new(
        id: TaskId,
        page_number: u32,
        image: Arc<PageImage>,
        regions: Vec<Region>,
        progress: Option<RegionProgress>,
        tx: oneshot::Sender<Result<Vec<RegionText>, PoolError>>,
    ) -> Self {
        Self {
            id,
            page_number,
            image,
            regions,
            progress,
            completion: Completion { tx },
        }
    }

    /// Reject this task.
    fn reject(self, err: PoolError) {
        self.completion.settle(self.id, Err(err));
    }
}

/// The lifecycle state of a worker slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SlotState {
    Initializing,
    Idle,
    Busy(TaskId),
    Errored,
    Terminated,
}

impl SlotState {
    /// Can this slot still do work, now or in the future?
    fn is_live(self) -> bool {
        matches!(
            self,
            SlotState::Initializing | SlotState::Idle | SlotState::Busy(_)
        )
    }
}

/// A slot, as seen by the scheduler.
struct Slot {
    handle: SlotHandle,
    state: SlotState,
}

/// Where we are in pool initialization.
enum InitState {
    /// Nobody has called `initialize` since creation or the last terminate.
    NotRequested,
    /// Slots exist, but not all of them have reported in.
    Pending(Vec<oneshot::Sender<Result<(), PoolError>>>),
    /// Initialization finished, for better or worse.
    Done(Result<(), PoolError>),
}

/// The scheduler's state.
pub(super) struct Scheduler {
    config: PoolConfig,
    factory: Arc<dyn RecognizerFactory>,
    events_tx: mpsc::UnboundedSender<Event>,
    slots: Vec<Slot>,
    queue: VecDeque<Task>,
    in_flight: HashMap<TaskId, Completion>,
    init: InitState,
    /// Incremented on every terminate, so we can ignore stale slot events.
    generation: u64,
}

impl Scheduler {
    /// Create a new, uninitialized scheduler.
    pub(super) fn new(
        config: PoolConfig,
        factory: Arc<dyn RecognizerFactory>,
        events_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            factory,
            events_tx,
            slots: vec![],
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            init: InitState::NotRequested,
            generation: 0,
        }
    }

    /// Process messages until every pool handle has been dropped.
    #[instrument(level = "debug", name = "scheduler", skip_all, fields(size = self.config.size))]
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.next() => self.handle_event(event),
            }
        }
        debug!("all pool handles dropped, shutting down");
        self.terminate();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => self.initialize(reply),
            Command::Submit(task) => self.submit(task),
            Command::Stats { reply } => {
                reply.send(self.stats()).ok();
            }
            Command::Terminate { reply } => {
                self.terminate();
                reply.send(()).ok();
            }
        }
    }

    /// Spawn our slots, unless we already have them.
    fn initialize(&mut self, reply: oneshot::Sender<Result<(), PoolError>>) {
        match &mut self.init {
            InitState::Pending(waiters) => {
                waiters.push(reply);
                return;
            }
            InitState::Done(result) => {
                reply.send(result.clone()).ok();
                return;
            }
            InitState::NotRequested => {}
        }

        debug!(size = self.config.size, lang = %self.config.lang, "Starting OCR workers");
        self.init = InitState::Pending(vec![reply]);
        for index in 0..self.config.size {
            let handle = SlotHandle::spawn(
                index,
                self.generation,
                self.factory.clone(),
                self.events_tx.clone(),
            );
            let state = match handle.send(SlotRequest::Init {
                lang: self.config.lang.clone(),
            }) {
                Ok(()) => SlotState::Initializing,
                Err(_) => SlotState::Terminated,
            };
            self.slots.push(Slot { handle, state });
        }
        if let Some(timeout) = self.config.init_timeout {
            let events_tx = self.events_tx.clone();
            let generation = self.generation;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                events_tx
                    .unbounded_send(Event::InitDeadline { generation })
                    .ok();
            });
        }
        self.check_init_complete();
    }

    /// Queue a task and try to dispatch it.
    fn submit(&mut self, task: Task) {
        if matches!(self.init, InitState::NotRequested) {
            task.reject(PoolError::NotInitialized);
            return;
        }
        debug!(task_id = %task.id, page_number = task.page_number, "Queued OCR task");
        self.queue.push_back(task);
        self.dispatch();
    }

    /// Bind pending tasks to idle slots, oldest task and lowest slot first.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(index) = self
                .slots
                .iter()
                .position(|slot| slot.state == SlotState::Idle)
            else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };

            let Task {
                id,
                page_number,
                image,
                regions,
                progress,
                completion,
            } = task;
            let slot = &mut self.slots[index];
            let request = SlotRequest::Recognize {
                task_id: id,
                page_number,
                image,
                regions,
                progress,
            };
            if slot.handle.send(request).is_err() {
                slot.state = SlotState::Terminated;
                completion.settle(id, Err(PoolError::UnexpectedTermination { slot: index }));
                continue;
            }
            trace!(task_id = %id, slot = index, "Dispatched OCR task");
            slot.state = SlotState::Busy(id);
            self.in_flight.insert(id, completion);
        }
        self.reject_if_no_live_workers();
    }

    /// If every slot has died, nothing in the queue will ever run.
    fn reject_if_no_live_workers(&mut self) {
        if self.queue.is_empty()
            || matches!(self.init, InitState::NotRequested)
            || self.slots.iter().any(|slot| slot.state.is_live())
        {
            return;
        }
        warn!(
            pending = self.queue.len(),
            "no OCR workers left, rejecting pending tasks"
        );
        for task in self.queue.drain(..) {
            task.reject(PoolError::NoLiveWorkers);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::InitDeadline { generation } => {
                if generation == self.generation {
                    self.init_deadline_expired();
                }
            }
            Event::Slot {
                generation,
                slot,
                event,
            } => {
                if generation != self.generation || slot >= self.slots.len() {
                    trace!(slot, ?event, "ignoring stale slot event");
                    return;
                }
                self.handle_slot_event(slot, event);
            }
        }
    }

    fn handle_slot_event(&mut self, index: usize, event: SlotEvent) {
        match event {
            SlotEvent::Ready => {
                let slot = &mut self.slots[index];
                if slot.state == SlotState::Initializing {
                    debug!(slot = index, "OCR worker ready");
                    slot.state = SlotState::Idle;
                }
                self.check_init_complete();
            }
            SlotEvent::InitFailed(message) => {
                let slot = &mut self.slots[index];
                if slot.state == SlotState::Initializing {
                    slot.state = SlotState::Errored;
                }
                self.finish_init(Err(PoolError::InitializationFault {
                    slot: index,
                    message,
                }));
            }
            SlotEvent::Recognized { task_id, results } => {
                self.complete(index, task_id, Ok(results));
            }
            SlotEvent::Failed { task_id, message } => {
                self.complete(index, task_id, Err(PoolError::Task { message }));
            }
            SlotEvent::Fault(message) => {
                error!(slot = index, "OCR worker fault: {}", message);
                let slot = &mut self.slots[index];
                let previous = mem::replace(&mut slot.state, SlotState::Errored);
                match previous {
                    SlotState::Busy(task_id) => {
                        if let Some(completion) = self.in_flight.remove(&task_id) {
                            completion.settle(
                                task_id,
                                Err(PoolError::WorkerFault {
                                    slot: index,
                                    message,
                                }),
                            );
                        }
                    }
                    SlotState::Initializing => {
                        self.finish_init(Err(PoolError::InitializationFault {
                            slot: index,
                            message,
                        }));
                    }
                    _ => {}
                }
            }
            SlotEvent::Terminated => {
                let slot = &mut self.slots[index];
                let previous = slot.state;
                if previous != SlotState::Errored {
                    slot.state = SlotState::Terminated;
                }
                match previous {
                    SlotState::Busy(task_id) => {
                        warn!(slot = index, %task_id, "OCR worker terminated mid-task");
                        if let Some(completion) = self.in_flight.remove(&task_id) {
                            completion.settle(
                                task_id,
                                Err(PoolError::UnexpectedTermination { slot: index }),
                            );
                        }
                    }
                    SlotState::Initializing => {
                        self.finish_init(Err(PoolError::InitializationFault {
                            slot: index,
                            message: "worker exited during initialization".to_owned(),
                        }));
                    }
                    _ => debug!(slot = index, "OCR worker exited"),
                }
            }
        }
        self.dispatch();
    }

    /// Settle the task bound to `index`, and free the slot.
    fn complete(
        &mut self,
        index: usize,
        task_id: TaskId,
        result: Result<Vec<RegionText>, PoolError>,
    ) {
        let Some(completion) = self.in_flight.remove(&task_id) else {
            debug!(%task_id, slot = index, "ignoring result for unknown OCR task");
            return;
        };
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Busy(task_id) {
            slot.state = SlotState::Idle;
        }
        completion.settle(task_id, result);
    }

    /// Resolve initialization once no slot is still starting up.
    fn check_init_complete(&mut self) {
        if matches!(self.init, InitState::Pending(_))
            && self
                .slots
                .iter()
                .all(|slot| slot.state != SlotState::Initializing)
        {
            info!(size = self.slots.len(), "OCR workers initialized");
            self.finish_init(Ok(()));
        }
    }

    /// Give up on any slots that have not reported in.
    fn init_deadline_expired(&mut self) {
        if !matches!(self.init, InitState::Pending(_)) {
            return;
        }
        let mut pending = 0;
        for slot in &mut self.slots {
            if slot.state == SlotState::Initializing {
                slot.state = SlotState::Errored;
                pending += 1;
            }
        }
        let timeout = self.config.init_timeout.unwrap_or_default();
        self.finish_init(Err(PoolError::InitializationTimeout { pending, timeout }));
        self.dispatch();
    }

    /// Record the outcome of initialization and wake up anybody waiting for
    /// it. Only the first outcome counts.
    fn finish_init(&mut self, result: Result<(), PoolError>) {
        let InitState::Pending(waiters) = &mut self.init else {
            return;
        };
        let waiters = mem::take(waiters);
        if let Err(err) = &result {
            error!("OCR worker initialization failed: {}", err);
        }
        for waiter in waiters {
            waiter.send(result.clone()).ok();
        }
        self.init = InitState::Done(result);
    }

    /// Reject everything, tear down every slot, and start over.
    fn terminate(&mut self) {
        if self.slots.is_empty()
            && self.queue.is_empty()
            && matches!(self.init, InitState::NotRequested)
        {
            return;
        }
        debug!(
            pending = self.queue.len(),
            in_flight = self.in_flight.len(),
            "Terminating OCR worker pool"
        );

        for task in self.queue.drain(..) {
            task.reject(PoolError::Terminated("before processing the task"));
        }
        for (task_id, completion) in self.in_flight.drain() {
            completion.settle(
                task_id,
                Err(PoolError::Terminated("while the task was running")),
            );
        }
        if let InitState::Pending(waiters) =
            mem::replace(&mut self.init, InitState::NotRequested)
        {
            for waiter in waiters {
                waiter
                    .send(Err(PoolError::Terminated("during initialization")))
                    .ok();
            }
        }
        for slot in self.slots.drain(..) {
            slot.handle.destroy();
        }
        self.generation += 1;
    }

    /// Take a snapshot of our state.
    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            slots: self.slots.len(),
            pending: self.queue.len(),
            in_flight: self.in_flight.len(),
            ..PoolStats::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Initializing => stats.initializing += 1,
                SlotState::Idle => stats.idle += 1,
                SlotState::Busy(_) => stats.busy += 1,
                SlotState::Errored => stats.errored += 1,
                SlotState::Terminated => stats.terminated += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::Recognizer;

    /// Engines that never finish starting, so slot tasks stay quiet and we
    /// can feed the scheduler events by hand.
    struct StalledFactory;

    #[async_trait]
    impl RecognizerFactory for StalledFactory {
        async fn create(&self, _lang: &str) -> Result<Box<dyn Recognizer>> {
            futures::future::pending().await
        }
    }

    type Outcome = oneshot::Receiver<Result<Vec<RegionText>, PoolError>>;

    /// Build an initialized scheduler with `size` idle slots.
    fn ready_scheduler(size: usize) -> (Scheduler, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded();
        let config = PoolConfig {
            size,
            ..PoolConfig::default()
        };
        let mut scheduler = Scheduler::new(config, Arc::new(StalledFactory), events_tx);
        let (reply, mut initialized) = oneshot::channel();
        scheduler.initialize(reply);
        for index in 0..size {
            scheduler.handle_slot_event(index, SlotEvent::Ready);
        }
        assert_eq!(initialized.try_recv(), Ok(Some(Ok(()))));
        (scheduler, events_rx)
    }

    fn submit(scheduler: &mut Scheduler, id: u64) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let image = PageImage::png(id.to_string().into_bytes());
        scheduler.submit(Task::new(TaskId(id), id as u32, image, vec![], None, tx));
        rx
    }

    fn recognized(id: u64) -> SlotEvent {
        SlotEvent::Recognized {
            task_id: TaskId(id),
            results: vec![],
        }
    }

    fn states(scheduler: &Scheduler) -> Vec<SlotState> {
        scheduler.slots.iter().map(|slot| slot.state).collect()
    }

    #[tokio::test]
    async fn busy_slot_exiting_rejects_only_its_task() {
        let (mut scheduler, _events) = ready_scheduler(2);
        let mut first = submit(&mut scheduler, 1);
        let mut second = submit(&mut scheduler, 2);
        let mut third = submit(&mut scheduler, 3);
        assert_eq!(
            states(&scheduler),
            [SlotState::Busy(TaskId(1)), SlotState::Busy(TaskId(2))]
        );

        scheduler.handle_slot_event(0, SlotEvent::Terminated);
        assert_eq!(
            first.try_recv(),
            Ok(Some(Err(PoolError::UnexpectedTermination { slot: 0 })))
        );
        assert_eq!(scheduler.slots[0].state, SlotState::Terminated);
        assert_eq!(scheduler.queue.len(), 1);
        assert_eq!(second.try_recv(), Ok(None));

        // The surviving slot picks up the queued task when it frees up.
        scheduler.handle_slot_event(1, recognized(2));
        assert!(matches!(second.try_recv(), Ok(Some(Ok(_)))));
        assert_eq!(
            states(&scheduler),
            [SlotState::Terminated, SlotState::Busy(TaskId(3))]
        );
        assert_eq!(third.try_recv(), Ok(None));
        scheduler.terminate();
    }

    #[tokio::test]
    async fn unknown_and_repeated_results_are_ignored() {
        let (mut scheduler, _events) = ready_scheduler(1);
        let mut first = submit(&mut scheduler, 1);
        let mut second = submit(&mut scheduler, 2);

        scheduler.handle_slot_event(0, recognized(1));
        assert!(matches!(first.try_recv(), Ok(Some(Ok(_)))));
        assert_eq!(states(&scheduler), [SlotState::Busy(TaskId(2))]);

        scheduler.handle_slot_event(0, recognized(1));
        scheduler.handle_slot_event(
            0,
            SlotEvent::Failed {
                task_id: TaskId(1),
                message: "late".to_owned(),
            },
        );
        scheduler.handle_slot_event(0, recognized(99));
        assert_eq!(states(&scheduler), [SlotState::Busy(TaskId(2))]);
        assert_eq!(second.try_recv(), Ok(None));
        assert_eq!(scheduler.in_flight.len(), 1);

        scheduler.handle_slot_event(0, recognized(2));
        assert!(matches!(second.try_recv(), Ok(Some(Ok(_)))));
        assert_eq!(states(&scheduler), [SlotState::Idle]);
        scheduler.terminate();
    }

    #[tokio::test]
    async fn slots_freed_together_take_tasks_oldest_first() {
        let (mut scheduler, _events) = ready_scheduler(2);
        let _outcomes = (1..=4)
            .map(|id| submit(&mut scheduler, id))
            .collect::<Vec<_>>();

        // Free both slots before dispatching, higher index first.
        scheduler.complete(1, TaskId(2), Ok(vec![]));
        scheduler.complete(0, TaskId(1), Ok(vec![]));
        assert_eq!(states(&scheduler), [SlotState::Idle, SlotState::Idle]);

        scheduler.dispatch();
        assert_eq!(
            states(&scheduler),
            [SlotState::Busy(TaskId(3)), SlotState::Busy(TaskId(4))]
        );
        assert!(scheduler.queue.is_empty());
        scheduler.terminate();
    }
}
