// src/pipeline/stage.rs
//
// Worker harness. Every pipeline node is a Stage driven by one OS
// thread through the state machine Created -> Initialized -> Running ->
// ShuttingDown -> Stopped, reacting to the controller's INIT / START /
// EXIT / SHUTDOWN messages.
//
// Workers block only on receiving input or on a send into a full
// downstream channel (backpressure). Both blocking points select over
// the control channel so an EXIT broadcast always interrupts them.

use super::message::{ControlMsg, ControlReply, Envelope, StageId};
use anyhow::Result;
use crossbeam_channel::{select, Receiver, Sender};
use std::cell::Cell;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

/// Outcome of an interruptible receive.
pub enum Step<T> {
    Data(T),
    /// The controller asked this worker to stop looping.
    Exit,
    /// The upstream channel is gone (teardown in progress).
    Disconnected,
}

/// Per-worker channel context handed into `Stage::run`.
pub struct StageContext {
    pub control_rx: Receiver<ControlMsg>,
    /// A SHUTDOWN consumed while running is replayed by the harness.
    pending_shutdown: Cell<bool>,
}

impl StageContext {
    fn new(control_rx: Receiver<ControlMsg>) -> Self {
        Self {
            control_rx,
            pending_shutdown: Cell::new(false),
        }
    }

    /// Record a control message seen mid-run; returns whether the worker
    /// must stop its data loop.
    pub fn note_control(&self, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Exit => true,
            ControlMsg::Shutdown => {
                self.pending_shutdown.set(true);
                true
            }
            _ => false,
        }
    }

    /// Blocking receive that an EXIT can interrupt.
    pub fn recv(&self, rx: &Receiver<Envelope>) -> Step<Envelope> {
        loop {
            select! {
                recv(self.control_rx) -> msg => match msg {
                    Ok(msg) => {
                        if self.note_control(msg) {
                            return Step::Exit;
                        }
                    }
                    Err(_) => return Step::Exit,
                },
                recv(rx) -> env => match env {
                    Ok(env) => return Step::Data(env),
                    Err(_) => return Step::Disconnected,
                },
            }
        }
    }

    /// Blocking, backpressured send that an EXIT can interrupt. Returns
    /// `false` when the worker must stop instead of sending.
    pub fn send(&self, tx: &Sender<Envelope>, envelope: Envelope) -> bool {
        let mut slot = Some(envelope);
        loop {
            select! {
                recv(self.control_rx) -> msg => match msg {
                    Ok(msg) => {
                        if self.note_control(msg) {
                            return false;
                        }
                    }
                    Err(_) => return false,
                },
                // the message expression is evaluated only when this
                // operation fires, so the slot survives control wakeups
                send(tx, slot.take().expect("send slot consumed twice")) -> res => {
                    return res.is_ok();
                }
            }
        }
    }
}

pub trait Stage: Send {
    fn id(&self) -> StageId;

    /// One-time setup before the stream starts.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// The data loop. Returns when the stream is finished or an EXIT
    /// interrupted it; an `Err` is a fatal run failure.
    fn run(&mut self, ctx: &StageContext) -> Result<()>;

    /// Final cleanup before the thread stops.
    fn shutdown(&mut self) {}
}

/// Spawn a worker thread around a stage.
pub fn spawn_worker(
    mut stage: Box<dyn Stage>,
    control_rx: Receiver<ControlMsg>,
    reply_tx: Sender<ControlReply>,
) -> JoinHandle<()> {
    let id = stage.id();
    std::thread::Builder::new()
        .name(id.name().to_string())
        .spawn(move || {
            let ctx = StageContext::new(control_rx);
            let mut state = WorkerState::Created;
            debug!(stage = %id, "worker created");

            loop {
                if ctx.pending_shutdown.take() {
                    do_shutdown(&mut stage, &mut state, &reply_tx);
                    break;
                }
                let msg = match ctx.control_rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break, // controller gone
                };
                match msg {
                    ControlMsg::Init => {
                        match stage.init() {
                            Ok(()) => {
                                state = WorkerState::Initialized;
                                let _ = reply_tx.send(ControlReply::InitFinished(id));
                            }
                            Err(err) => {
                                error!(stage = %id, %err, "stage init failed");
                                let _ = reply_tx.send(ControlReply::Failed(id, err.to_string()));
                            }
                        }
                    }
                    ControlMsg::Start => {
                        state = WorkerState::Running;
                        info!(stage = %id, "running");
                        if let Err(err) = stage.run(&ctx) {
                            error!(stage = %id, %err, "stage failed");
                            let _ = reply_tx.send(ControlReply::Failed(id, format!("{err:#}")));
                        }
                        debug!(stage = %id, "returned from run");
                    }
                    ControlMsg::Exit => {
                        debug!(stage = %id, "exit acknowledged");
                    }
                    ControlMsg::Shutdown => {
                        do_shutdown(&mut stage, &mut state, &reply_tx);
                        break;
                    }
                }
            }
            debug!(stage = %id, ?state, "worker thread exiting");
        })
        .expect("spawning worker thread")
}

fn do_shutdown(stage: &mut Box<dyn Stage>, state: &mut WorkerState, reply_tx: &Sender<ControlReply>) {
    *state = WorkerState::ShuttingDown;
    stage.shutdown();
    *state = WorkerState::Stopped;
    let _ = reply_tx.send(ControlReply::ShutdownFinished(stage.id()));
}
