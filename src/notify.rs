//! Change notification.
//!
//! Components publish typed [`Event`]s; listeners register with an
//! [`Interest`] and receive matching events on their own channel until they
//! unsubscribe or drop the receiver.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::JobBinding;
use crate::sequencer::{SequenceId, SequenceState};
use crate::types::{Category, InstanceId};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ServiceAttached {
        instance: InstanceId,
        category: Category,
    },
    ServiceDetached {
        instance: InstanceId,
        category: Category,
    },
    /// `value` is `None` when the topic's service went away.
    TopicChanged {
        instance: InstanceId,
        category: Category,
        topic: String,
        value: Option<Value>,
    },
    JobChanged {
        instance: InstanceId,
        job: Option<JobBinding>,
    },
    JobOutOfDate {
        instance: InstanceId,
        title: String,
        file_name: String,
    },
    ToolChangeRequested {
        instance: InstanceId,
        tool: i64,
    },
    SequenceFinished {
        instance: InstanceId,
        sequence: SequenceId,
        state: SequenceState,
    },
}

impl Event {
    pub fn instance(&self) -> &InstanceId {
        match self {
            Event::ServiceAttached { instance, .. }
            | Event::ServiceDetached { instance, .. }
            | Event::TopicChanged { instance, .. }
            | Event::JobChanged { instance, .. }
            | Event::JobOutOfDate { instance, .. }
            | Event::ToolChangeRequested { instance, .. }
            | Event::SequenceFinished { instance, .. } => instance,
        }
    }

    pub fn category(&self) -> Option<Category> {
        match self {
            Event::ServiceAttached { category, .. }
            | Event::ServiceDetached { category, .. }
            | Event::TopicChanged { category, .. } => Some(*category),
            Event::ToolChangeRequested { .. } => Some(Category::HalStatus),
            Event::SequenceFinished { .. } => Some(Category::Command),
            Event::JobChanged { .. } | Event::JobOutOfDate { .. } => None,
        }
    }
}

/// Which events a listener wants.  The default accepts everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interest {
    instance: Option<InstanceId>,
    category: Option<Category>,
}

impl Interest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(instance) = &self.instance {
            if event.instance() != instance {
                return false;
            }
        }
        match self.category {
            Some(category) => event.category() == Some(category),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered listener.
#[derive(Debug)]
pub struct Subscription {
    pub id: ListenerId,
    pub events: mpsc::UnboundedReceiver<Event>,
}

struct Listener {
    id: ListenerId,
    interest: Interest,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

#[derive(Default)]
pub struct Notifier {
    listeners: Mutex<Listeners>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, interest: Interest) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners();
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.entries.push(Listener { id, interest, tx });
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.entries.len();
        listeners.entries.retain(|l| l.id != id);
        listeners.entries.len() != before
    }

    /// Sends `event` to every interested listener.  Listeners whose receiver
    /// is gone are removed.
    pub fn publish(&self, event: Event) {
        self.listeners().entries.retain(|listener| {
            if !listener.interest.matches(&event) {
                return !listener.tx.is_closed();
            }
            listener.tx.send(event.clone()).is_ok()
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().entries.len()
    }
}
