//! Applications and their message handlers.

use crate::context::RcvContext;
use hivemind_types::{AppName, CellKey, Message, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Application logic for one message kind.
///
/// `map` names the cells a message touches; the runtime routes the message
/// to the single bee owning all of them, creating one when none exists.
/// `receive` runs inside that bee, with transactional state access when the
/// app is transactional. A returned error (or a panic) aborts the
/// transaction.
pub trait Handler: Send + Sync + 'static {
    fn map(&self, msg: &Message) -> Vec<CellKey>;
    fn receive(&self, msg: &Message, ctx: &mut RcvContext<'_>) -> Result<()>;
}

/// An application registered on a hive. Handlers are registered before the
/// hive starts; apps are transactional unless opted out.
pub struct App {
    name: AppName,
    transactional: bool,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl App {
    pub(crate) fn new(name: impl Into<AppName>) -> Self {
        Self {
            name: name.into(),
            transactional: true,
            handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a handler for a message kind, replacing any previous one.
    pub fn handle(&mut self, kind: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    /// Turns transactional execution off: state changes apply immediately
    /// and emissions dispatch without commit gating.
    pub fn set_transactional(&mut self, on: bool) -> &mut Self {
        self.transactional = on;
        self
    }

    pub(crate) fn freeze(&self) -> Arc<AppSpec> {
        Arc::new(AppSpec {
            name: self.name.clone(),
            transactional: self.transactional,
            handlers: self.handlers.clone(),
        })
    }
}

/// Immutable view of an app handed to its qee and bees at start.
pub(crate) struct AppSpec {
    pub name: AppName,
    pub transactional: bool,
    pub handlers: HashMap<String, Arc<dyn Handler>>,
}

impl AppSpec {
    pub fn handler(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }
}

/// A message paired with the handler that will receive it.
#[derive(Clone)]
pub(crate) struct MsgAndHandler {
    pub msg: Message,
    pub handler: Arc<dyn Handler>,
}
