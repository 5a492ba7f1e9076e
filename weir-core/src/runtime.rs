use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::errors::{CoreError, Result};

/// One-way mailbox handle for an addressable component. Round-trip calls
/// embed a `oneshot` reply channel inside the message, so the owning task
/// stays strictly single-threaded over its inbox.
#[derive(Debug)]
pub struct Mailbox<M> {
    sender: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M: Send + 'static> Mailbox<M> {
    /// Creates the mailbox and the receiving half its actor loop drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Sends a one-way message. Fails only when the component has stopped.
    pub fn send(&self, message: M) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| CoreError::Runtime("component mailbox is closed".into()))
    }

    /// Round-trip call: builds the message around a reply channel and waits
    /// for the response.
    pub async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> M) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| CoreError::Runtime("component dropped the reply channel".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Implemented by every component handle so the registry can shut it down.
/// `stop` must be idempotent.
#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self);
}

struct Entry {
    handle: Arc<dyn Any + Send + Sync>,
    stoppable: Arc<dyn Stoppable>,
}

/// Name-addressed registry of running components, providing the
/// spawn/lookup/stop primitives the control plane requires from its
/// hosting runtime.
#[derive(Default, Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component handle under a unique name. Re-registering a
    /// live name replaces the previous handle with a warning; the caller is
    /// expected to have stopped it first.
    pub fn register<H>(&self, name: impl Into<String>, handle: H)
    where
        H: Stoppable + Any + Send + Sync,
    {
        let name = name.into();
        let arc = Arc::new(handle);
        let entry = Entry {
            handle: arc.clone() as Arc<dyn Any + Send + Sync>,
            stoppable: arc,
        };
        let mut inner = self.inner.write();
        if inner.insert(name.clone(), entry).is_some() {
            warn!(component = %name, "replaced existing registry entry");
        }
    }

    /// Looks a component up by name, downcasting to its concrete handle
    /// type.
    pub fn lookup<H>(&self, name: &str) -> Option<H>
    where
        H: Clone + 'static,
    {
        let inner = self.inner.read();
        inner
            .get(name)
            .and_then(|entry| entry.handle.downcast_ref::<H>())
            .cloned()
    }

    /// Stops and removes a component. Returns false when the name was not
    /// registered.
    pub async fn stop(&self, name: &str) -> bool {
        let entry = {
            let mut inner = self.inner.write();
            inner.remove(name)
        };
        match entry {
            Some(entry) => {
                entry.stoppable.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stops every registered component.
    pub async fn stop_all(&self) {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.write();
            inner.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.stoppable.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct CountingHandle {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stoppable for CountingHandle {
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn lookup_returns_typed_handles() {
        let registry = Registry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        registry.register("hub:get_ops", CountingHandle { stops: stops.clone() });

        let handle: CountingHandle = registry.lookup("hub:get_ops").expect("registered");
        assert_eq!(handle.stops.load(Ordering::SeqCst), 0);
        assert!(registry.lookup::<CountingHandle>("hub:missing").is_none());

        assert!(registry.stop("hub:get_ops").await);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!registry.stop("hub:get_ops").await);
    }

    #[tokio::test]
    async fn ask_round_trips_through_the_mailbox() {
        enum Msg {
            Ping(oneshot::Sender<&'static str>),
        }

        let (mailbox, mut rx) = Mailbox::<Msg>::channel();
        tokio::spawn(async move {
            while let Some(Msg::Ping(reply)) = rx.recv().await {
                let _ = reply.send("pong");
            }
        });

        let answer = mailbox.ask(Msg::Ping).await.expect("reply");
        assert_eq!(answer, "pong");
    }
}
