//! Process-wide `EventManager` (§6.4, §9 redesign note): the event
//! emitter inheritance pattern (`SessionPool extends EventEmitter`) is
//! replaced with an explicit `subscribe(event, callback)` API backed by a
//! `tokio::sync::broadcast` channel, instance-scoped rather than global.

use tokio::sync::broadcast;
use tracing::debug;

/// Events the core emits. `PersistState` fires periodically (default 60s)
/// and on shutdown; `SessionRetired` fires once per session retirement and
/// is how [`crate::session_pool::SessionPool`] learns to evict without an
/// inherited emitter.
#[derive(Debug, Clone)]
pub enum Event {
    PersistState,
    SessionRetired { session_id: String },
}

/// An instance-scoped pub/sub bus. No process-wide singleton: each
/// `CrawlerRuntime` owns one and threads it to its collaborators.
#[derive(Clone)]
pub struct EventManager {
    sender: broadcast::Sender<Event>,
}

impl Default for EventManager {
    fn default() -> Self {
        EventManager::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        EventManager { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        debug!(?event, "event emitted");
        // No active subscribers is not an error: emitting before anyone
        // has subscribed (or after everyone has dropped) is routine.
        let _ = self.sender.send(event);
    }

    /// Spawns the periodic `persistState` ticker (default every
    /// `interval`), cancelled when the returned handle is dropped/aborted.
    pub fn spawn_persist_ticker(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.emit(Event::PersistState);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let manager = EventManager::new();
        let mut rx = manager.subscribe();
        manager.emit(Event::SessionRetired {
            session_id: "s1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::SessionRetired { session_id } if session_id == "s1"));
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let manager = EventManager::new();
        manager.emit(Event::PersistState);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_the_event() {
        let manager = EventManager::new();
        let mut rx1 = manager.subscribe();
        let mut rx2 = manager.subscribe();
        manager.emit(Event::PersistState);
        assert!(matches!(rx1.recv().await.unwrap(), Event::PersistState));
        assert!(matches!(rx2.recv().await.unwrap(), Event::PersistState));
    }
}
