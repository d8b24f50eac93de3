//! Service proxies: object-shaped contracts over a channel.
//!
//! A service maps its member names onto channel traffic by convention:
//! `on<Uppercase>…` members are events, `onDynamic<Uppercase>…` members
//! are functions returning an event, everything else is a command.
//! Consumer-side payloads pass through a pluggable reviver that can
//! rehydrate well-known structured types.

use crate::cancel::CancelToken;
use crate::client::{ChannelProxy, RemoteEvent};
use crate::error::WiremuxError;
use crate::event::EventStream;
use std::sync::Arc;
use std::time::Duration;
use wiremux_codec::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Command,
    Event,
    DynamicEvent,
}

/// Classify a service member by its name.
pub fn member_kind(name: &str) -> MemberKind {
    fn upper_head(rest: &str) -> bool {
        rest.chars().next().map_or(false, |c| c.is_ascii_uppercase())
    }

    if let Some(rest) = name.strip_prefix("onDynamic") {
        if upper_head(rest) {
            return MemberKind::DynamicEvent;
        }
    }
    if let Some(rest) = name.strip_prefix("on") {
        if upper_head(rest) {
            return MemberKind::Event;
        }
    }

    MemberKind::Command
}

/// Post-decode rehydration hook, applied to command results and event
/// payloads on the consumer side.
pub type Reviver = Arc<dyn Fn(Value) -> Value + Send + Sync>;

pub struct ServiceProxy {
    channel: ChannelProxy,
    reviver: Option<Reviver>,
}

impl ServiceProxy {
    pub fn new(channel: ChannelProxy) -> ServiceProxy {
        ServiceProxy {
            channel,
            reviver: None,
        }
    }

    pub fn with_reviver(channel: ChannelProxy, reviver: Reviver) -> ServiceProxy {
        ServiceProxy {
            channel,
            reviver: Some(reviver),
        }
    }

    /// Drop the reviver for this proxy only.
    pub fn without_reviver(mut self) -> ServiceProxy {
        self.reviver = None;
        self
    }

    /// Invoke a command member.
    pub async fn invoke(&self, member: &str, arg: Value) -> Result<Value, WiremuxError> {
        self.invoke_with_token(member, arg, CancelToken::never()).await
    }

    pub async fn invoke_with_token(
        &self,
        member: &str,
        arg: Value,
        cancel: CancelToken,
    ) -> Result<Value, WiremuxError> {
        if member_kind(member) != MemberKind::Command {
            return Err(WiremuxError::Member(format!(
                "{member} is an event member, not a command"
            )));
        }

        let result = self.channel.call_with_token(member, arg, cancel).await?;

        Ok(self.revive(result))
    }

    /// An event member, carrying no argument.
    pub fn event(&self, member: &str) -> Result<ServiceEvent, WiremuxError> {
        if member_kind(member) != MemberKind::Event {
            return Err(WiremuxError::Member(format!("{member} is not an event member")));
        }

        Ok(ServiceEvent {
            remote: self.channel.listen(member, Value::Absent),
            reviver: self.reviver.clone(),
        })
    }

    /// A dynamic event member, parameterised by an argument.
    pub fn dynamic_event(&self, member: &str, arg: Value) -> Result<ServiceEvent, WiremuxError> {
        if member_kind(member) != MemberKind::DynamicEvent {
            return Err(WiremuxError::Member(format!(
                "{member} is not a dynamic event member"
            )));
        }

        Ok(ServiceEvent {
            remote: self.channel.listen(member, arg),
            reviver: self.reviver.clone(),
        })
    }

    fn revive(&self, value: Value) -> Value {
        match &self.reviver {
            Some(reviver) => reviver(value),
            None => value,
        }
    }
}

/// A service event; payloads are revived on the way out.
pub struct ServiceEvent {
    remote: RemoteEvent,
    reviver: Option<Reviver>,
}

impl ServiceEvent {
    pub fn subscribe(&self) -> RevivedStream {
        RevivedStream {
            inner: self.remote.subscribe(),
            reviver: self.reviver.clone(),
        }
    }
}

pub struct RevivedStream {
    inner: EventStream,
    reviver: Option<Reviver>,
}

impl RevivedStream {
    pub async fn recv(&mut self) -> Option<Value> {
        self.inner.recv().await.map(|value| match &self.reviver {
            Some(reviver) => reviver(value),
            None => value,
        })
    }

    pub async fn receive(&mut self, timeout: Duration) -> Option<Value> {
        self.inner.receive(timeout).await.map(|value| match &self.reviver {
            Some(reviver) => reviver(value),
            None => value,
        })
    }
}
