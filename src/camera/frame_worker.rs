use std::sync::Arc;

use tracing::{debug, info};

use super::driver::{Capture, FrameDriver, FrameOptions};
use super::sync::SyncRole;
use super::worker::WorkerContext;
use super::{VerifyTask, WorkerState};
use crate::config::FrameWorkerConfig;

/// Worker for cameras that deliver whole images with a hardware frame counter.
pub struct FrameWorker {
    ctx: WorkerContext,
    driver: FrameDriver,
    config: FrameWorkerConfig,
}

impl FrameWorker {
    pub fn new(ctx: WorkerContext, driver: FrameDriver, config: FrameWorkerConfig) -> Self {
        Self { ctx, driver, config }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn run(self) {
        let ctx = &self.ctx;
        let options = FrameOptions {
            width: self.config.width,
            height: self.config.height,
            fps: Some(ctx.params.fps),
        };
        let Some(mut source) = ctx.open(self.driver.as_ref(), self.config.device_id.as_deref(), &options) else {
            return;
        };
        let description = source.description();
        info!(
            camera = ctx.index,
            "{} opened at {}x{}", description.name, description.width, description.height
        );
        ctx.state().set_description(description);

        let mut role = SyncRole::for_camera(&ctx.roster, ctx.index, ctx.params.frame_step());
        ctx.state().set_state(WorkerState::Running);
        role.on_running();

        while !ctx.stop.stop_requested() {
            match source.grab() {
                Ok(Capture::Frame { counter, frame }) => {
                    let frame = Arc::new(frame);
                    ctx.state().live().publish(Arc::clone(&frame));
                    if let Some(id) = role.fulfill(counter) {
                        debug!(camera = ctx.index, id, counter, "sample captured");
                        if !ctx.state().submit_verify(VerifyTask { id, frame }, &ctx.stop) {
                            break;
                        }
                    }
                }
                Ok(Capture::Skipped) => debug!(camera = ctx.index, "unreadable frame skipped"),
                Ok(Capture::Exhausted) => {
                    info!(camera = ctx.index, "frame source exhausted");
                    break;
                }
                Err(e) => {
                    ctx.fail(&e);
                    break;
                }
            }
        }
        ctx.finish();
    }
}
