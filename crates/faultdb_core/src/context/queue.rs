//! A context confined to its own worker thread.
//!
//! Contexts and handles refuse calls from any thread but their owner. A
//! [`ContextQueue`] owns a dedicated thread with one context on it; other
//! threads submit closures that run there, in submission order.

use super::Context;
use crate::coordinator::StoreCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::types::ContextId;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce(&Context) + Send + 'static>;

/// A context running on a private thread.
///
/// Dropping the queue lets already submitted work finish, then stops the
/// thread.
#[derive(Debug)]
pub struct ContextQueue {
    id: ContextId,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

fn stopped() -> CoreError {
    CoreError::invalid_operation("context queue worker has stopped")
}

impl ContextQueue {
    /// Starts a worker thread and creates its context there.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(coordinator: Arc<StoreCoordinator>) -> CoreResult<Self> {
        let (sender, jobs) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = thread::Builder::new()
            .name("faultdb-context".to_string())
            .spawn(move || {
                let context = Context::new(coordinator);
                if ready_tx.send(context.id()).is_err() {
                    return;
                }
                while let Ok(job) = jobs.recv() {
                    job(&context);
                }
                tracing::debug!(context = context.id().0, "context queue stopped");
            })?;

        let id = ready_rx.recv().map_err(|_| stopped())?;
        Ok(Self {
            id,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Identity of the queue's context.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Submits `work` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the worker has stopped.
    pub fn perform<F>(&self, work: F) -> CoreResult<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.sender
            .as_ref()
            .ok_or_else(stopped)?
            .send(Box::new(work))
            .map_err(|_| stopped())
    }

    /// Runs `work` on the worker and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the worker has stopped or `work`
    /// panicked.
    pub fn perform_and_wait<F, R>(&self, work: F) -> CoreResult<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.perform(move |context| {
            let _ = tx.send(work(context));
        })?;
        rx.recv().map_err(|_| stopped())
    }
}

impl Drop for ContextQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(context = self.id.0, "context queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeDescription, AttributeType, EntityDescription, Model};
    use crate::query::FetchRequest;
    use faultdb_codec::Value;

    fn coordinator() -> Arc<StoreCoordinator> {
        let model = Model::new(1).entity(
            EntityDescription::new("Country")
                .attribute(AttributeDescription::new("name", AttributeType::Text)),
        );
        StoreCoordinator::open_in_memory(model).unwrap()
    }

    #[test]
    fn work_runs_on_the_queue_context() {
        let coordinator = coordinator();
        let queue = ContextQueue::spawn(Arc::clone(&coordinator)).unwrap();
        let expected = queue.id();

        let saved = queue
            .perform_and_wait(move |context| {
                assert_eq!(context.id(), expected);
                let france = context.insert("Country")?;
                france.set("name", "France")?;
                context.save()?;
                Ok::<_, CoreError>(france.id())
            })
            .unwrap()
            .unwrap();
        assert!(!saved.is_temporary());

        let names = queue
            .perform_and_wait(|context| {
                context
                    .fetch(&FetchRequest::new("Country"))
                    .and_then(|found| found.iter().map(|h| h.get("name")).collect::<CoreResult<Vec<_>>>())
            })
            .unwrap()
            .unwrap();
        assert_eq!(names, vec![Value::from("France")]);
    }

    #[test]
    fn fire_and_forget_runs_in_order() {
        let queue = ContextQueue::spawn(coordinator()).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            queue.perform(move |_| tx.send(i).unwrap()).unwrap();
        }
        drop(queue);
        let seen: Vec<i32> = rx.try_iter().collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
