//! Command routing: which handler and which aggregate definition serve
//! each command name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::aggregate::{AggregateDefinition, AggregateResult, State};
use crate::error::{DispatchError, HandlerError};
use crate::message::Message;

/// Business logic for one command type.
///
/// Receives the reconstituted state and the command, and returns the new
/// state with the events it raised. Handlers must be pure: no I/O.
///
/// Any `Fn(State, &Message) -> Result<AggregateResult, HandlerError>`
/// implements this trait.
pub trait CommandHandler: Send + Sync {
    /// Decide the outcome of `command` against `state`.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] to reject the command.
    fn handle(&self, state: State, command: &Message) -> Result<AggregateResult, HandlerError>;
}

impl<F> CommandHandler for F
where
    F: Fn(State, &Message) -> Result<AggregateResult, HandlerError> + Send + Sync,
{
    fn handle(&self, state: State, command: &Message) -> Result<AggregateResult, HandlerError> {
        self(state, command)
    }
}

/// Builds the aggregate definition for a command type.
pub type DefinitionFactory = Arc<dyn Fn() -> Arc<dyn AggregateDefinition> + Send + Sync>;

/// Handler and definition factory registered for one command name.
#[derive(Clone)]
pub struct CommandRoute {
    handler: Arc<dyn CommandHandler>,
    definition: DefinitionFactory,
}

impl CommandRoute {
    pub fn new(handler: Arc<dyn CommandHandler>, definition: DefinitionFactory) -> Self {
        Self {
            handler,
            definition,
        }
    }

    pub fn handler(&self) -> &dyn CommandHandler {
        self.handler.as_ref()
    }

    /// Construct a fresh definition instance.
    pub fn build_definition(&self) -> Arc<dyn AggregateDefinition> {
        (self.definition)()
    }
}

// Handlers and factories are closures; print nothing but the type name.
impl fmt::Debug for CommandRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRoute").finish_non_exhaustive()
    }
}

/// Mapping from command name to its [`CommandRoute`].
///
/// Built once by the application and read-only after it is handed to the
/// dispatcher.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::{AggregateDefinition, AggregateResult, CommandMap, Message, State};
///
/// #[derive(Default)]
/// struct Counter;
///
/// impl AggregateDefinition for Counter {
///     fn aggregate_type(&self) -> &str {
///         "counter"
///     }
///     fn apply(&self, state: State, _event: &Message) -> State {
///         state
///     }
/// }
///
/// let map = CommandMap::new().register::<Counter, _>("Increment", |state, _cmd| {
///     Ok(AggregateResult::new(vec![], state))
/// });
/// assert!(map.contains("Increment"));
/// assert!(!map.contains("Decrement"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CommandMap {
    routes: HashMap<String, CommandRoute>,
}

impl CommandMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `command_name` to `handler`, with definitions built by
    /// `D::default()`.
    pub fn register<D, H>(self, command_name: impl Into<String>, handler: H) -> Self
    where
        D: AggregateDefinition + Default,
        H: Fn(State, &Message) -> Result<AggregateResult, HandlerError> + Send + Sync + 'static,
    {
        self.route(command_name, handler, || {
            Arc::new(D::default()) as Arc<dyn AggregateDefinition>
        })
    }

    /// Route `command_name` to `handler`, with definitions built by
    /// `definition`.
    pub fn route<H, F>(self, command_name: impl Into<String>, handler: H, definition: F) -> Self
    where
        H: Fn(State, &Message) -> Result<AggregateResult, HandlerError> + Send + Sync + 'static,
        F: Fn() -> Arc<dyn AggregateDefinition> + Send + Sync + 'static,
    {
        self.route_handler(command_name, Arc::new(handler), definition)
    }

    /// Route `command_name` to a handler object.
    pub fn route_handler<F>(
        mut self,
        command_name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        definition: F,
    ) -> Self
    where
        F: Fn() -> Arc<dyn AggregateDefinition> + Send + Sync + 'static,
    {
        self.routes.insert(
            command_name.into(),
            CommandRoute::new(handler, Arc::new(definition)),
        );
        self
    }

    pub fn get(&self, command_name: &str) -> Option<&CommandRoute> {
        self.routes.get(command_name)
    }

    pub fn contains(&self, command_name: &str) -> bool {
        self.routes.contains_key(command_name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Look up the route for `message`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownCommand`] if the message name is not routed.
    pub fn route_for(&self, message: &Message) -> Result<&CommandRoute, DispatchError> {
        self.get(message.message_name())
            .ok_or_else(|| DispatchError::UnknownCommand(message.message_name().to_owned()))
    }
}

/// Look up the handler registered for `message`.
///
/// # Errors
///
/// [`DispatchError::UnknownCommand`] if the message name is not routed.
pub fn get_handler<'m>(
    message: &Message,
    command_map: &'m CommandMap,
) -> Result<&'m dyn CommandHandler, DispatchError> {
    command_map.route_for(message).map(CommandRoute::handler)
}
