use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::driver::{EventDriver, EventOptions};
use super::sync::SyncRole;
use super::worker::WorkerContext;
use super::{VerifyTask, WorkerState};
use crate::config::EventWorkerConfig;
use crate::events::{CdEvent, EventBatch, Evt2Writer, FrameGenerator, TriggerCounter};

/// Worker for event cameras. Falling edges on the shared trigger line stand in
/// for frame boundaries, and frames are rendered from the buffered events.
pub struct EventWorker {
    ctx: WorkerContext,
    driver: EventDriver,
    config: EventWorkerConfig,
}

/// Samples wait in `pending` until an event later than their trigger arrives,
/// so events stamped exactly at the trigger time still make it into the frame.
struct Pipeline {
    role: SyncRole,
    triggers: TriggerCounter,
    generator: FrameGenerator,
    polarity_filter: Option<u8>,
    pending: VecDeque<(u64, u64)>,
    live_period: u64,
    next_live: Option<u64>,
}

impl EventWorker {
    pub fn new(ctx: WorkerContext, driver: EventDriver, config: EventWorkerConfig) -> Self {
        Self { ctx, driver, config }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn run(self) {
        let ctx = &self.ctx;
        let options = EventOptions { realtime: self.config.realtime };
        let Some(mut source) = ctx.open(self.driver.as_ref(), self.config.device_id.as_deref(), &options) else {
            return;
        };
        let description = source.description();
        info!(
            camera = ctx.index,
            "{} opened at {}x{}", description.name, description.width, description.height
        );
        let (width, height) = (description.width, description.height);
        ctx.state().set_description(description);

        let mut recorder = if self.config.save_event_file {
            let path = ctx.job_dir.join(format!("event_file_cam_{}.raw", ctx.index));
            match Evt2Writer::create(&path, width, height) {
                Ok(w) => {
                    info!(camera = ctx.index, "recording events to {}", path.display());
                    Some(w)
                }
                Err(e) => {
                    warn!(camera = ctx.index, "event recording disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut pipeline = Pipeline::new(ctx, &self.config, width, height);
        ctx.state().set_state(WorkerState::Running);
        pipeline.role.on_running();

        while !ctx.stop.stop_requested() {
            match source.next_batch() {
                Ok(Some(batch)) => {
                    if let Some(w) = recorder.as_mut() {
                        if let Err(e) = w.write_batch(&batch) {
                            warn!(camera = ctx.index, "event recording stopped: {:#}", e);
                            recorder = None;
                        }
                    }
                    if !pipeline.process(ctx, batch) {
                        break;
                    }
                }
                Ok(None) => {
                    info!(camera = ctx.index, triggers = pipeline.triggers.count(), "event stream exhausted");
                    pipeline.flush(ctx);
                    break;
                }
                Err(e) => {
                    ctx.fail(&e);
                    break;
                }
            }
        }

        if let Some(w) = recorder {
            if let Err(e) = w.finish() {
                warn!(camera = ctx.index, "{:#}", e);
            }
        }
        ctx.finish();
    }
}

impl Pipeline {
    fn new(ctx: &WorkerContext, config: &EventWorkerConfig, width: u32, height: u32) -> Self {
        Self {
            role: SyncRole::for_camera(&ctx.roster, ctx.index, ctx.params.frame_step()),
            triggers: TriggerCounter::new(config.falling_edge_polarity),
            generator: FrameGenerator::new(width, height, config.accumulation_time),
            polarity_filter: config.polarity_filter,
            pending: VecDeque::new(),
            live_period: 1_000_000 / u64::from(ctx.params.fps.max(1)),
            next_live: None,
        }
    }

    /// Feed one batch. Returns false once the session stopped.
    fn process(&mut self, ctx: &WorkerContext, batch: EventBatch) -> bool {
        let filter = self.polarity_filter;
        let mut cd = batch
            .cd
            .into_iter()
            .filter(|e| filter.map_or(true, |p| e.polarity == p))
            .peekable();

        for trigger in &batch.triggers {
            while let Some(e) = cd.next_if(|e| e.t <= trigger.t) {
                if !self.feed(ctx, e) {
                    return false;
                }
            }
            self.publish_live(ctx);

            let Some(count) = self.triggers.observe(trigger) else {
                continue;
            };
            if let Some(id) = self.role.fulfill(count) {
                self.pending.push_back((id, trigger.t));
            }
        }
        for e in cd {
            if !self.feed(ctx, e) {
                return false;
            }
        }
        self.publish_live(ctx);
        true
    }

    /// Render every pending sample whose trigger precedes `event`, then buffer it.
    fn feed(&mut self, ctx: &WorkerContext, event: CdEvent) -> bool {
        while let Some(&(id, t)) = self.pending.front() {
            if t >= event.t {
                break;
            }
            self.pending.pop_front();
            if !self.submit(ctx, id, t) {
                return false;
            }
        }
        self.generator.push(event);
        true
    }

    /// Render what is left once the stream ends.
    fn flush(&mut self, ctx: &WorkerContext) {
        while let Some((id, t)) = self.pending.pop_front() {
            if !self.submit(ctx, id, t) {
                return;
            }
        }
    }

    fn submit(&mut self, ctx: &WorkerContext, id: u64, t: u64) -> bool {
        debug!(camera = ctx.index, id, t, "sample rendered");
        let frame = Arc::new(self.generator.render(t));
        ctx.state().submit_verify(VerifyTask { id, frame }, &ctx.stop)
    }

    fn publish_live(&mut self, ctx: &WorkerContext) {
        let Some(latest) = self.generator.latest_timestamp() else {
            return;
        };
        let due = *self.next_live.get_or_insert(latest);
        if latest >= due {
            ctx.state().live().publish(Arc::new(self.generator.render(latest)));
            self.next_live = Some(latest + self.live_period);
        }
    }
}
