// src/pipeline/controller.rs
//
// Pipeline controller. Pure rendezvous, never data-bearing: broadcast
// INIT and await every INIT_FINISHED, broadcast START, block until the
// track worker reports stream completion, broadcast EXIT (which
// interrupts any worker still blocked on a receive), broadcast SHUTDOWN
// and await every SHUTDOWN_FINISHED, then join the threads.
//
// Workers never initiate shutdown on their own; the track worker alone
// signals completion when the declared last frame has been processed.

use super::message::{ControlMsg, ControlReply, StageId};
use super::stage::{spawn_worker, Stage};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

struct WorkerHandle {
    id: StageId,
    control_tx: Sender<ControlMsg>,
    join: JoinHandle<()>,
}

pub struct Controller {
    workers: Vec<WorkerHandle>,
    reply_tx: Sender<ControlReply>,
    reply_rx: Receiver<ControlReply>,
}

impl Controller {
    pub fn new() -> Self {
        let (reply_tx, reply_rx) = unbounded();
        Self {
            workers: Vec::new(),
            reply_tx,
            reply_rx,
        }
    }

    /// Reply channel handle for the stage that signals completion.
    pub fn reply_sender(&self) -> Sender<ControlReply> {
        self.reply_tx.clone()
    }

    /// Spawn a worker thread around `stage` and take ownership of it.
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        let (control_tx, control_rx) = unbounded();
        let id = stage.id();
        let join = spawn_worker(stage, control_rx, self.reply_tx.clone());
        self.workers.push(WorkerHandle {
            id,
            control_tx,
            join,
        });
    }

    fn broadcast(&self, msg: ControlMsg) {
        for worker in &self.workers {
            // a worker that already stopped just leaves a closed channel
            let _ = worker.control_tx.send(msg);
        }
    }

    /// Drive the whole run. Returns once every worker has acknowledged
    /// shutdown; a stage failure terminates the run and surfaces here.
    pub fn run(self) -> Result<()> {
        let stage_ids: Vec<StageId> = self.workers.iter().map(|w| w.id).collect();
        info!(
            stage = %StageId::Controller,
            workers = stage_ids.len(),
            "starting pipeline"
        );

        // INIT rendezvous
        self.broadcast(ControlMsg::Init);
        let mut pending: HashSet<StageId> = stage_ids.iter().copied().collect();
        while !pending.is_empty() {
            match self.reply_rx.recv().context("workers vanished during init")? {
                ControlReply::InitFinished(id) => {
                    debug!(stage = %id, "init finished");
                    pending.remove(&id);
                }
                ControlReply::Failed(id, msg) => {
                    self.teardown();
                    bail!("{} stage failed during init: {msg}", id.name());
                }
                other => debug!(?other, "ignoring reply during init"),
            }
        }

        // START, then block until the track worker reports completion
        self.broadcast(ControlMsg::Start);
        let mut failure: Option<(StageId, String)> = None;
        loop {
            match self.reply_rx.recv().context("workers vanished mid-run")? {
                ControlReply::StreamDone => {
                    info!("stream complete");
                    break;
                }
                ControlReply::Failed(id, msg) => {
                    warn!(stage = %id, %msg, "stage failed, terminating run");
                    failure = Some((id, msg));
                    break;
                }
                other => debug!(?other, "ignoring reply while running"),
            }
        }

        self.teardown();
        if let Some((id, msg)) = failure {
            bail!("run terminated: {} stage failed: {msg}", id.name());
        }
        Ok(())
    }

    /// EXIT then SHUTDOWN broadcast, await the acknowledgements, join.
    fn teardown(&self) {
        self.broadcast(ControlMsg::Exit);
        self.broadcast(ControlMsg::Shutdown);

        let mut pending: HashSet<StageId> = self.workers.iter().map(|w| w.id).collect();
        while !pending.is_empty() {
            // a worker that died without acknowledging must not hang the
            // whole teardown
            match self.reply_rx.recv_timeout(std::time::Duration::from_secs(5)) {
                Ok(ControlReply::ShutdownFinished(id)) => {
                    debug!(stage = %id, "shutdown finished");
                    pending.remove(&id);
                }
                Ok(other) => debug!(?other, "ignoring reply during shutdown"),
                Err(_) => {
                    warn!(?pending, "timed out waiting for shutdown acknowledgements");
                    break;
                }
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join.join().is_err() {
                warn!(stage = %worker.id, "worker thread panicked");
            }
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}
