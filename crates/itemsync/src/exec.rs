use crossbeam_channel::{unbounded, Sender};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where completion callbacks run: editor shown or released, commit
/// finished, merge events, concurrent edit notices.
pub trait CallbackExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs callbacks in order on one dedicated thread.
pub struct ThreadExecutor {
    tx: Sender<Task>,
}

impl ThreadExecutor {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Task>();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Ok(task) = rx.recv() {
                task();
            }
        })?;
        Ok(Self { tx })
    }
}

impl CallbackExecutor for ThreadExecutor {
    fn execute(&self, task: Task) {
        if let Err(err) = self.tx.send(task) {
            tracing::warn!("callback thread gone, running callback inline");
            (err.0)();
        }
    }
}

/// Runs callbacks on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

impl CallbackExecutor for ImmediateExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}
