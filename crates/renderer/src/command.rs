use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::camera::CameraFeed;
use crate::error::PipelineError;
use crate::filter::{FilterGroup, FilterStage};
use crate::gpu::DisplayTarget;

/// Unit of work posted to the render thread.
pub enum Command {
    SurfaceCreated {
        target: DisplayTarget,
        width: u32,
        height: u32,
    },
    SurfaceChanged {
        width: u32,
        height: u32,
    },
    SurfaceDestroyed,
    /// A camera frame stamped on the shared clock is ready.
    DoFrame(u64),
    SetRecording(bool),
    SetFilterChain(FilterGroup),
    InsertFilter {
        index: usize,
        stage: Box<dyn FilterStage>,
    },
    RemoveFilter {
        index: usize,
    },
    BindCamera(Arc<dyn CameraFeed>),
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SurfaceCreated { .. } => "surface-created",
            Self::SurfaceChanged { .. } => "surface-changed",
            Self::SurfaceDestroyed => "surface-destroyed",
            Self::DoFrame(_) => "do-frame",
            Self::SetRecording(_) => "set-recording",
            Self::SetFilterChain(_) => "set-filter-chain",
            Self::InsertFilter { .. } => "insert-filter",
            Self::RemoveFilter { .. } => "remove-filter",
            Self::BindCamera(_) => "bind-camera",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SurfaceCreated {
                target,
                width,
                height,
            } => f
                .debug_struct("SurfaceCreated")
                .field("target", target)
                .field("width", width)
                .field("height", height)
                .finish(),
            Self::SurfaceChanged { width, height } => f
                .debug_struct("SurfaceChanged")
                .field("width", width)
                .field("height", height)
                .finish(),
            Self::DoFrame(timestamp) => f.debug_tuple("DoFrame").field(timestamp).finish(),
            Self::SetRecording(enabled) => f.debug_tuple("SetRecording").field(enabled).finish(),
            Self::InsertFilter { index, stage } => f
                .debug_struct("InsertFilter")
                .field("index", index)
                .field("stage", &stage.name())
                .finish(),
            Self::RemoveFilter { index } => {
                f.debug_struct("RemoveFilter").field("index", index).finish()
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Closed flag shared by both ends of the queue.
///
/// Posts enqueue while holding the read side, so closing (write side) can
/// never fall between a post's check and its enqueue. The queue is unbounded,
/// so the read side is only held for a non-blocking push.
#[derive(Debug, Default)]
struct Gate(RwLock<bool>);

impl Gate {
    fn read(&self) -> RwLockReadGuard<'_, bool> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, bool> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer handle for the render thread's queue. Cheap to clone and safe
/// to use from any thread; `send` never blocks on the consumer.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
    gate: Arc<Gate>,
}

impl CommandSender {
    /// Enqueues `command`. Fails once `Shutdown` has been posted or the
    /// render thread has exited.
    ///
    /// A post that returns `Ok` is ordered before the close: it is either
    /// handled by the render thread or counted among the commands discarded
    /// at shutdown.
    pub fn send(&self, command: Command) -> Result<(), PipelineError> {
        if matches!(command, Command::Shutdown) {
            let mut closed = self.gate.write();
            if *closed {
                return Err(PipelineError::Closed);
            }
            // Later posts fail fast even before the thread sees the request.
            *closed = true;
            return self.tx.send(command).map_err(|_| PipelineError::Closed);
        }
        let closed = self.gate.read();
        if *closed {
            return Err(PipelineError::Closed);
        }
        self.tx.send(command).map_err(|_| PipelineError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        *self.gate.read()
    }
}

impl fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSender")
            .field("closed", &self.is_closed())
            .field("queued", &self.tx.len())
            .finish()
    }
}

/// Consumer end owned by the render thread.
pub(crate) struct CommandReceiver {
    rx: Receiver<Command>,
    gate: Arc<Gate>,
}

impl CommandReceiver {
    pub fn recv(&self) -> Option<Command> {
        self.rx.recv().ok()
    }

    /// Closes the queue and discards whatever is still pending. Every post
    /// accepted before this call is included in the count.
    pub fn close(&self) -> usize {
        *self.gate.write() = true;
        self.rx.try_iter().count()
    }
}

pub(crate) fn channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = unbounded();
    let gate = Arc::new(Gate::default());
    (
        CommandSender {
            tx,
            gate: Arc::clone(&gate),
        },
        CommandReceiver { rx, gate },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;

    #[test]
    fn send_after_shutdown_is_rejected() {
        let (tx, rx) = channel();
        tx.send(Command::DoFrame(1)).unwrap();
        tx.send(Command::Shutdown).unwrap();
        assert!(matches!(
            tx.send(Command::DoFrame(2)),
            Err(PipelineError::Closed)
        ));
        assert!(matches!(rx.recv(), Some(Command::DoFrame(1))));
        assert!(matches!(rx.recv(), Some(Command::Shutdown)));
    }

    #[test]
    fn close_discards_pending_commands() {
        let (tx, rx) = channel();
        for ts in 0..3 {
            tx.send(Command::DoFrame(ts)).unwrap();
        }
        assert_eq!(rx.close(), 3);
        assert!(tx.is_closed());
    }

    #[test]
    fn only_the_first_shutdown_is_accepted() {
        let (tx, rx) = channel();
        tx.send(Command::Shutdown).unwrap();
        assert!(matches!(tx.send(Command::Shutdown), Err(PipelineError::Closed)));
        assert_eq!(rx.close(), 1);
    }

    #[test]
    fn accepted_posts_are_handled_or_discarded_at_close() {
        let (tx, rx) = channel();
        let producers: Vec<_> = (0..4u64)
            .map(|producer| {
                let tx = tx.clone();
                thread::spawn(move || {
                    (0..500u64)
                        .filter(|seq| tx.send(Command::DoFrame(producer * 1_000 + seq)).is_ok())
                        .count()
                })
            })
            .collect();
        let handled = 100;
        for _ in 0..handled {
            assert!(rx.recv().is_some());
        }
        let discarded = rx.close();
        let accepted: usize = producers
            .into_iter()
            .map(|producer| producer.join().unwrap())
            .sum();
        assert_eq!(accepted, handled + discarded);
        assert!(tx.is_closed());
        assert!(rx.rx.try_recv().is_err());
    }

    #[test]
    fn consumer_sees_global_enqueue_order() {
        let (tx, rx) = channel();
        // The lock makes "enqueue order" observable: each producer records the
        // value it sent while holding it.
        let order = Arc::new(Mutex::new(Vec::new()));
        let producers: Vec<_> = (0..4u64)
            .map(|producer| {
                let tx = tx.clone();
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    for seq in 0..250u64 {
                        let ts = producer * 1_000 + seq;
                        let mut order = order.lock().unwrap();
                        tx.send(Command::DoFrame(ts)).unwrap();
                        order.push(ts);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let received: Vec<u64> = std::iter::from_fn(|| rx.rx.try_recv().ok())
            .map(|command| match command {
                Command::DoFrame(ts) => ts,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(received, *order.lock().unwrap());
    }
}
