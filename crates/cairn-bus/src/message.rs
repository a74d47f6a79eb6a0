use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::Result;
use crate::task::TaskManager;

/// Marker for values that can be posted on the bus.
pub trait Message: Any + Send + Sync + fmt::Debug {}

/// Subscriber for messages of type `M`.
pub trait Handler<M: Message>: Send + Sync + 'static {
    /// Label used for the job that delivers a message to this handler.
    fn description(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    fn handle(&self, message: &M) -> anyhow::Result<()>;
}

/// [`Handler`] backed by a closure.
pub struct FnHandler<F> {
    description: String,
    f: F,
}

impl<M, F> Handler<M> for FnHandler<F>
where
    M: Message,
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn description(&self) -> String {
        self.description.clone()
    }

    fn handle(&self, message: &M) -> anyhow::Result<()> {
        (self.f)(message)
    }
}

/// Wrap a closure as a shareable handler for `M`.
pub fn handler_fn<M, F>(description: impl Into<String>, f: F) -> Arc<dyn Handler<M>>
where
    M: Message,
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        description: description.into(),
        f,
    })
}

type Handlers<M> = Vec<Arc<dyn Handler<M>>>;

/// Typed publish/subscribe over the [`TaskManager`].
///
/// Handlers are keyed by the exact message type; posting an `M` never reaches
/// a handler registered for another type. Each delivery is a separate pool
/// job, so `post` returns before any handler runs and a failing handler does
/// not affect its siblings.
pub struct MessageManager {
    tasks: Arc<TaskManager>,
    registry: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl MessageManager {
    pub fn new(tasks: Arc<TaskManager>) -> Self {
        Self {
            tasks,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe `handler` to messages of type `M`.
    ///
    /// Registering the same handler instance twice is a no-op. Returns
    /// `true` if the handler was added.
    pub fn register<M: Message>(&self, handler: Arc<dyn Handler<M>>) -> bool {
        let mut registry = self.registry.write().expect("handler registry poisoned");
        let handlers = registry
            .entry(TypeId::of::<M>())
            .or_insert_with(|| Box::new(Handlers::<M>::new()))
            .downcast_mut::<Handlers<M>>()
            .expect("registry slot keyed by its own message type");

        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        debug!(
            message = std::any::type_name::<M>(),
            handler = %handler.description(),
            "handler registered"
        );
        handlers.push(handler);
        true
    }

    /// Deliver `message` to every handler registered for `M`.
    ///
    /// Returns the number of delivery jobs submitted, or
    /// [`BusError::Stopped`](crate::BusError::Stopped) once the pool is shut
    /// down.
    pub fn post<M: Message>(&self, message: M) -> Result<usize> {
        let handlers = self.handlers::<M>();
        if handlers.is_empty() {
            debug!(?message, "no handlers for message");
            return Ok(0);
        }

        debug!(?message, handlers = handlers.len(), "message posted");
        let message = Arc::new(message);
        for handler in &handlers {
            let description = handler.description();
            let handler = Arc::clone(handler);
            let message = Arc::clone(&message);
            self.tasks
                .execute(description, move || handler.handle(&message))?;
        }
        Ok(handlers.len())
    }

    pub fn handler_count<M: Message>(&self) -> usize {
        self.handlers::<M>().len()
    }

    /// The pool deliveries run on.
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    fn handlers<M: Message>(&self) -> Handlers<M> {
        self.registry
            .read()
            .expect("handler registry poisoned")
            .get(&TypeId::of::<M>())
            .and_then(|slot| slot.downcast_ref::<Handlers<M>>())
            .cloned()
            .unwrap_or_default()
    }
}

impl fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = self.registry.read().expect("handler registry poisoned").len();
        f.debug_struct("MessageManager")
            .field("message_types", &types)
            .finish()
    }
}

fn same_handler<M: Message>(a: &Arc<dyn Handler<M>>, b: &Arc<dyn Handler<M>>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
