//! Variable change notifications.
//!
//! The [`VariableManager`](crate::var::VariableManager) fires one
//! [`VariableEvent`] per mutation, synchronously, before the mutating call
//! returns.  Listeners come in two flavours:
//!
//! | Kind       | Registered with              | Delivery                      |
//! |------------|------------------------------|-------------------------------|
//! | observer   | [`Observers::add`]           | callback, inline              |
//! | subscriber | [`Observers::subscribe`]     | queued on an mpsc channel     |
//!
//! The evaluator is a subscriber: it drains its queue before every cache
//! lookup, so no cached result is served after its dependency changed.

use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::script::value::SexpResult;
use crate::var::Scope;

// ── ChangeKind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

impl ChangeKind {
    pub const ALL: &'static [ChangeKind] = &[ChangeKind::Added, ChangeKind::Changed, ChangeKind::Removed];

    pub fn name(self) -> &'static str {
        match self {
            ChangeKind::Added   => "added",
            ChangeKind::Changed => "changed",
            ChangeKind::Removed => "removed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChangeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        ChangeKind::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

// ── VariableEvent ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VariableEvent {
    pub kind: ChangeKind,
    pub scope: Scope,
    pub name: String,
    /// `None` for [`ChangeKind::Added`].
    pub old: Option<SexpResult>,
    /// `None` for [`ChangeKind::Removed`].
    pub new: Option<SexpResult>,
}

impl VariableEvent {
    pub fn added(scope: Scope, name: impl Into<String>, value: SexpResult) -> Self {
        VariableEvent { kind: ChangeKind::Added, scope, name: name.into(), old: None, new: Some(value) }
    }

    pub fn changed(scope: Scope, name: impl Into<String>, old: SexpResult, new: SexpResult) -> Self {
        VariableEvent { kind: ChangeKind::Changed, scope, name: name.into(), old: Some(old), new: Some(new) }
    }

    pub fn removed(scope: Scope, name: impl Into<String>, old: SexpResult) -> Self {
        VariableEvent { kind: ChangeKind::Removed, scope, name: name.into(), old: Some(old), new: None }
    }
}

impl fmt::Display for VariableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.scope, self.name)
    }
}

// ── Observers ─────────────────────────────────────────────────────────────────

/// Handle returned by [`Observers::add`], used to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&VariableEvent)>;

#[derive(Default)]
pub struct Observers {
    next_id: u64,
    callbacks: Vec<(ObserverId, Callback)>,
    subscribers: Vec<Sender<VariableEvent>>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("callbacks", &self.callbacks.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, callback: impl FnMut(&VariableEvent) + 'static) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cid, _)| *cid != id);
        self.callbacks.len() != before
    }

    /// A queue receiving every future event.  Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<VariableEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.callbacks.len() + self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&mut self, event: &VariableEvent) {
        for (_, cb) in &mut self.callbacks {
            cb(event);
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn callbacks_see_every_event() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut obs = Observers::new();
        let sink = Rc::clone(&seen);
        obs.add(move |e| sink.borrow_mut().push(e.kind));
        obs.notify(&VariableEvent::added(Scope::Local, "x", 1.0.into()));
        obs.notify(&VariableEvent::removed(Scope::Local, "x", 1.0.into()));
        assert_eq!(*seen.borrow(), vec![ChangeKind::Added, ChangeKind::Removed]);
    }

    #[test]
    fn removed_callbacks_stop_firing() {
        let count = Rc::new(RefCell::new(0));
        let mut obs = Observers::new();
        let c = Rc::clone(&count);
        let id = obs.add(move |_| *c.borrow_mut() += 1);
        obs.notify(&VariableEvent::added(Scope::Global, "a", true.into()));
        assert!(obs.remove(id));
        assert!(!obs.remove(id));
        obs.notify(&VariableEvent::added(Scope::Global, "b", true.into()));
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn subscribers_queue_events_and_drop_when_closed() {
        let mut obs = Observers::new();
        let rx = obs.subscribe();
        obs.notify(&VariableEvent::changed(Scope::Campaign, "n", 1.0.into(), 2.0.into()));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Changed);
        assert_eq!(event.name, "n");
        drop(rx);
        obs.notify(&VariableEvent::added(Scope::Campaign, "m", 1.0.into()));
        assert!(obs.is_empty());
    }

    #[test]
    fn kind_names_parse() {
        for &k in ChangeKind::ALL {
            assert_eq!(k.name().parse::<ChangeKind>(), Ok(k));
        }
        assert!("moved".parse::<ChangeKind>().is_err());
    }
}
