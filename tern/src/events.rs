// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Ordered async dispatch of lifecycle events to registered observers.

use std::sync::Arc;

use codec::{PacketType, QoS};
use futures::future::BoxFuture;

use crate::error::Error;
use crate::session::ApplicationMessage;

/// Lifecycle events fired by broker and client cores.
///
/// Consumers of this interface include telemetry publishers and
/// persistence layers.
#[derive(Debug, Clone)]
pub enum Event {
    PreStart,
    PostStart,
    PreShutdown,
    PostShutdown,
    ClientConnected {
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
    },
    ClientSubscribed {
        client_id: String,
        topic: String,
        qos: QoS,
    },
    ClientUnsubscribed {
        client_id: String,
        topic: String,
    },
    MessageReceived {
        client_id: String,
        message: ApplicationMessage,
    },
    PacketReceived {
        client_id: String,
        packet_type: PacketType,
    },
    PacketSent {
        client_id: String,
        packet_type: PacketType,
    },
}

/// Async observer registered on an [`EventBus`].
///
/// Observer failures are logged and isolated; they never fail the
/// operation that fired the event.
pub trait Observer: Send + Sync {
    /// Name used in log messages when this observer fails.
    fn name(&self) -> &str;

    fn handle(&self, event: Event) -> BoxFuture<'static, Result<(), Error>>;
}

/// Dispatches events to registered observers in registration order.
///
/// Observers are registered at broker/client construction and fixed
/// afterwards, so dispatch needs no locking.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Arc<dyn Observer>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn register(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Fire an event without waiting for observers to complete.
    ///
    /// Observers still run in registration order relative to each other;
    /// only the caller does not wait.
    pub fn fire(self: &Arc<Self>, event: Event) {
        if self.observers.is_empty() {
            return;
        }
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            bus.dispatch(event).await;
        });
    }

    /// Fire an event and wait until every observer has completed.
    pub async fn fire_wait(&self, event: Event) {
        self.dispatch(event).await;
    }

    async fn dispatch(&self, event: Event) {
        for observer in &self.observers {
            if let Err(err) = observer.handle(event.clone()).await {
                log::error!(
                    "events: Observer {} failed on {:?}: {}",
                    observer.name(),
                    event,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::error::ErrorKind;

    struct Recorder {
        label: usize,
        order: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl Observer for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&self, _event: Event) -> BoxFuture<'static, Result<(), Error>> {
            let order = Arc::clone(&self.order);
            let label = self.label;
            let fail = self.fail;
            Box::pin(async move {
                order.lock().unwrap().push(label);
                if fail {
                    Err(Error::new(ErrorKind::PluginError, "observer broke"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_ordered_dispatch() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for label in 0..4 {
            bus.register(Arc::new(Recorder {
                label,
                order: Arc::clone(&order),
                fail: false,
            }));
        }
        bus.fire_wait(Event::PreStart).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failing_observer_is_isolated() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.register(Arc::new(Recorder {
            label: 0,
            order: Arc::clone(&order),
            fail: true,
        }));
        bus.register(Arc::new(Recorder {
            label: 1,
            order: Arc::clone(&order),
            fail: false,
        }));
        bus.fire_wait(Event::PostStart).await;
        // The failure of the first observer does not stop the second.
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_fire_without_wait() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);

        struct Counter;
        impl Observer for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn handle(&self, _event: Event) -> BoxFuture<'static, Result<(), Error>> {
                Box::pin(async {
                    COUNT.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }
        }

        let mut bus = EventBus::new();
        bus.register(Arc::new(Counter));
        let bus = Arc::new(bus);
        bus.fire(Event::PreShutdown);
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }
}
