use forge_core::{Channel, ConnectionId};

/// Authorization predicate consulted before a connection joins a channel.
pub trait SubscribePolicy: Send + Sync {
    fn can_subscribe(&self, id: &ConnectionId, channel: Channel) -> bool;
}

impl<F> SubscribePolicy for F
where
    F: Fn(&ConnectionId, Channel) -> bool + Send + Sync,
{
    fn can_subscribe(&self, id: &ConnectionId, channel: Channel) -> bool {
        self(id, channel)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SubscribePolicy for AllowAll {
    fn can_subscribe(&self, _id: &ConnectionId, _channel: Channel) -> bool {
        true
    }
}
