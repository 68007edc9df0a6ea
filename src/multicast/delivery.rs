use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{error, trace};

use crate::multicast::multicast_message::MulticastMessage;


/// Application callback for delivered messages. It is called on the protocol's processing loop,
///  so non-trivial work should be handed off elsewhere.
pub trait DeliveryListener: Send + Sync + 'static {
    fn on_delivered(&self, message: &MulticastMessage) -> anyhow::Result<()>;
}

/// The set of registered [DeliveryListener]s.
///
/// The list is an immutable snapshot behind an [ArcSwap]: registration builds a new list and
///  publishes it atomically, while delivery loads the current snapshot without locking. This
///  allows listeners to be (de)registered from other threads while the protocol loop is
///  delivering.
#[derive(Default)]
pub struct DeliveryListeners {
    listeners: ArcSwap<Vec<Arc<dyn DeliveryListener>>>,
}

impl DeliveryListeners {
    pub fn new() -> DeliveryListeners {
        Default::default()
    }

    pub fn add(&self, listener: Arc<dyn DeliveryListener>) {
        self.listeners.rcu(|current| {
            let mut updated = Vec::clone(current);
            updated.push(listener.clone());
            updated
        });
    }

    pub fn remove(&self, listener: &Arc<dyn DeliveryListener>) {
        self.listeners.rcu(|current| {
            current.iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands a message to every listener. A listener that fails or panics is logged and does not
    ///  affect other listeners or the protocol loop.
    pub fn deliver(&self, message: &MulticastMessage) {
        trace!("delivering message #{} from {:?}", message.message_id, message.source);

        let snapshot = self.listeners.load();
        for listener in snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_delivered(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("delivery listener failed for message #{} from {:?}: {}", message.message_id, message.source, e);
                }
                Err(_) => {
                    error!("delivery listener panicked for message #{} from {:?}", message.message_id, message.source);
                }
            }
        }
    }
}
