//! Broadcast Channel.
//!
//! Fire-and-forget events. The sender never receives its own event, nothing
//! is stored, and late joiners see nothing that happened before they joined.

use realmsync_doc::{ClientId, SessionEvent};

use crate::listeners::{Listeners, Subscription};

/// One event on its way to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: ClientId,
    pub recipient: ClientId,
    pub event: SessionEvent,
}

/// An event as seen by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub sender: ClientId,
    pub event: SessionEvent,
}

#[derive(Debug, Default)]
pub struct BroadcastChannel {
    handlers: Listeners<Received>,
}

impl BroadcastChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan `event` out to every member except `sender`.
    pub fn send<'a>(
        sender: &str,
        event: &SessionEvent,
        members: impl IntoIterator<Item = &'a ClientId>,
    ) -> Vec<Delivery> {
        members
            .into_iter()
            .filter(|member| member.as_str() != sender)
            .map(|member| Delivery {
                sender: sender.to_string(),
                recipient: member.clone(),
                event: event.clone(),
            })
            .collect()
    }

    /// Register a handler for incoming events.
    pub fn on_receive(&mut self, handler: impl FnMut(&Received) + 'static) -> Subscription {
        self.handlers.add(handler)
    }

    pub fn off(&mut self, subscription: Subscription) -> bool {
        self.handlers.remove(subscription)
    }

    /// Hand an incoming event to every handler.
    pub fn deliver(&mut self, sender: ClientId, event: SessionEvent) -> Received {
        let received = Received { sender, event };
        self.handlers.notify(&received);
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_sender_is_excluded() {
        let members: Vec<ClientId> = ["a2", "b7", "c9"].map(String::from).to_vec();
        let deliveries =
            BroadcastChannel::send("b7", &SessionEvent::SkillUsed { skill_index: 1 }, &members);

        let recipients: Vec<&str> = deliveries.iter().map(|d| d.recipient.as_str()).collect();
        assert_eq!(recipients, vec!["a2", "c9"]);
        assert!(deliveries.iter().all(|d| d.sender == "b7"));
    }

    #[test]
    fn test_lone_member_reaches_nobody() {
        let members = vec!["a2".to_string()];
        assert!(
            BroadcastChannel::send("a2", &SessionEvent::SkillUsed { skill_index: 0 }, &members)
                .is_empty()
        );
    }

    #[test]
    fn test_handlers_receive_sender_and_event() {
        let mut channel = BroadcastChannel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let sub = channel.on_receive(move |received| {
            sink.borrow_mut().push((received.sender.clone(), received.event.kind()));
        });

        channel.deliver("c9".to_string(), SessionEvent::SkillUsed { skill_index: 2 });
        assert!(channel.off(sub));
        channel.deliver("c9".to_string(), SessionEvent::SkillUsed { skill_index: 3 });

        assert_eq!(*log.borrow(), vec![("c9".to_string(), "skill-used")]);
    }
}
