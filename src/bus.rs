//! Single-consumer command / event dispatcher.
//!
//! Handlers are plain `fn` items with an explicit dependency parameter `D`,
//! registered once at startup in a static wiring table (see
//! [`crate::gateway::build_bus`]).  A handler that wants to trigger further
//! work pushes follow-up messages into the [`Outbox`] it is given; the bus
//! drains those before [`MessageBus::handle`] returns, so one call processes
//! the whole cascade in FIFO order.

use std::collections::{HashMap, VecDeque};

use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::messages::{Command, CommandKind, Event, EventKind, Message};

/// Posting side of the bus for work running outside the bus consumer
/// (notify listeners, keepalive tasks).  The run loop drains the receiving end
/// one message at a time.
pub type Inbox = mpsc::UnboundedSender<Message>;

/// Follow-up messages produced while handling one message.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Message>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: Event) {
        self.queue.push_back(Message::Event(event));
    }

    pub fn post(&mut self, command: Command) {
        self.queue.push_back(Message::Command(command));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.queue.drain(..)
    }
}

pub type CommandHandler<D> =
    for<'a> fn(&'a mut D, Command, &'a mut Outbox) -> BoxFuture<'a, Result<()>>;

pub type EventHandler<D> =
    for<'a> fn(&'a mut D, &'a Event, &'a mut Outbox) -> BoxFuture<'a, Result<()>>;

pub struct MessageBus<D> {
    deps: D,
    command_handlers: HashMap<CommandKind, CommandHandler<D>>,
    event_handlers: HashMap<EventKind, Vec<EventHandler<D>>>,
}

impl<D: Send> MessageBus<D> {
    pub fn new(deps: D) -> Self {
        Self {
            deps,
            command_handlers: HashMap::new(),
            event_handlers: HashMap::new(),
        }
    }

    /// Register the handler for a command kind, replacing any previous one.
    pub fn on_command(mut self, kind: CommandKind, handler: CommandHandler<D>) -> Self {
        if self.command_handlers.insert(kind, handler).is_some() {
            warn!("bus: command handler for {kind:?} replaced");
        }
        self
    }

    /// Append a handler for an event kind; handlers run in registration order.
    pub fn on_event(mut self, kind: EventKind, handler: EventHandler<D>) -> Self {
        self.event_handlers.entry(kind).or_default().push(handler);
        self
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    pub fn deps_mut(&mut self) -> &mut D {
        &mut self.deps
    }

    /// Dispatch `message` and every follow-up it triggers.
    ///
    /// # Errors
    /// [`GatewayError::UnroutableMessage`] for a command kind with no handler,
    /// or the first error returned by a handler.  Messages still queued at
    /// that point are dropped.
    pub async fn handle(&mut self, message: Message) -> Result<()> {
        let mut queue = VecDeque::from([message]);
        while let Some(message) = queue.pop_front() {
            let mut outbox = Outbox::new();
            match message {
                Message::Event(event) => self.handle_event(&event, &mut outbox).await?,
                Message::Command(command) => self.handle_command(command, &mut outbox).await?,
            }
            queue.extend(outbox.drain());
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: &Event, outbox: &mut Outbox) -> Result<()> {
        let Some(handlers) = self.event_handlers.get(&event.kind()) else {
            debug!("bus: no handler for {:?}", event.kind());
            return Ok(());
        };
        for handler in handlers {
            handler(&mut self.deps, event, outbox).await?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command, outbox: &mut Outbox) -> Result<()> {
        let kind = command.kind();
        let handler = *self
            .command_handlers
            .get(&kind)
            .ok_or_else(|| GatewayError::UnroutableMessage(format!("{kind:?}")))?;
        debug!("bus: {kind:?}");
        handler(&mut self.deps, command, outbox).await
    }
}
