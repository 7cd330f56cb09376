//! Event Router
//!
//! Maps event kinds (and, for commands, command name plus actor) to handlers.
//! Dispatch is fire-and-collect: every matching handler runs in its own task
//! and the router returns one [`HandlerOutcome`] per handler instead of
//! failing fast. Wildcard handlers run after the type-specific ones.

use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventKind, InboundEvent};
use super::followup::HandlerContext;

/// A failure captured from a single handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("handler panicked")]
    Panicked,
}

/// Something that reacts to inbound events.
///
/// Implemented for any `Fn(Arc<InboundEvent>, HandlerContext) -> Future`, so
/// plain async closures can be registered directly.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(
        &self,
        event: Arc<InboundEvent>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<InboundEvent>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(
        &self,
        event: Arc<InboundEvent>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        self(event, ctx).boxed()
    }
}

/// Where a handler is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Every event of this kind.
    Event(EventKind),
    /// A named command, optionally restricted to a single actor.
    Command { name: String, actor: Option<String> },
    /// Every event, after the specific handlers.
    Wildcard,
}

impl Route {
    fn matches(&self, event: &InboundEvent) -> bool {
        match self {
            Self::Event(kind) => *kind == event.kind,
            Self::Command { name, actor } => {
                event.kind == EventKind::Command
                    && event.command.as_deref().map(normalize_command) == Some(normalize_command(name))
                    && actor
                        .as_deref()
                        .is_none_or(|a| event.actor_id.as_deref() == Some(a))
            }
            Self::Wildcard => false,
        }
    }
}

/// Commands are compared without their leading slash.
fn normalize_command(name: &str) -> &str {
    name.trim().trim_start_matches('/')
}

struct Registration {
    name: String,
    route: Route,
    handler: Arc<dyn EventHandler>,
}

/// Result of one handler invocation.
#[derive(Debug)]
pub struct HandlerOutcome {
    pub handler: String,
    pub result: Result<(), HandlerError>,
}

impl HandlerOutcome {
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Registry of handlers keyed by [`Route`].
pub struct EventRouter {
    routes: Vec<Registration>,
    shutdown: CancellationToken,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a handler for one event kind.
    pub fn register(
        &mut self,
        kind: EventKind,
        name: impl Into<String>,
        handler: impl EventHandler,
    ) -> &mut Self {
        self.add(Route::Event(kind), name, handler)
    }

    /// Register a handler for a command, optionally only for one actor.
    pub fn register_command(
        &mut self,
        command: impl Into<String>,
        actor: Option<String>,
        name: impl Into<String>,
        handler: impl EventHandler,
    ) -> &mut Self {
        let route = Route::Command {
            name: command.into(),
            actor,
        };
        self.add(route, name, handler)
    }

    /// Register a handler that receives every event.
    pub fn register_wildcard(
        &mut self,
        name: impl Into<String>,
        handler: impl EventHandler,
    ) -> &mut Self {
        self.add(Route::Wildcard, name, handler)
    }

    fn add(&mut self, route: Route, name: impl Into<String>, handler: impl EventHandler) -> &mut Self {
        let name = name.into();
        debug!(handler = %name, route = ?route, "Registered event handler");
        self.routes.push(Registration {
            name,
            route,
            handler: Arc::new(handler),
        });
        self
    }

    /// Cancel every outstanding follow-up.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of handlers that would receive `event`.
    pub fn handler_count(&self, event: &InboundEvent) -> usize {
        self.routes
            .iter()
            .filter(|r| r.route == Route::Wildcard || r.route.matches(event))
            .count()
    }

    /// Invoke every matching handler and collect per-handler outcomes.
    ///
    /// Specific handlers run concurrently; wildcard handlers run once they
    /// have all finished. Outcomes are returned in registration order within
    /// each group.
    pub async fn dispatch(&self, event: Arc<InboundEvent>) -> Vec<HandlerOutcome> {
        let ctx = HandlerContext::new(&event.delivery_id, &self.shutdown);

        let specific: Vec<&Registration> = self
            .routes
            .iter()
            .filter(|r| r.route.matches(&event))
            .collect();
        let wildcard: Vec<&Registration> = self
            .routes
            .iter()
            .filter(|r| r.route == Route::Wildcard)
            .collect();

        if specific.is_empty() {
            if event.kind.is_unknown() {
                warn!(
                    delivery_id = %event.delivery_id,
                    event_type = %event.kind,
                    "Unknown event type with no registered handler"
                );
            } else {
                debug!(
                    delivery_id = %event.delivery_id,
                    event_type = %event.kind,
                    "No type-specific handler registered"
                );
            }
        }

        let mut outcomes = run_group(&specific, &event, &ctx).await;
        outcomes.extend(run_group(&wildcard, &event, &ctx).await);

        for outcome in outcomes.iter().filter(|o| !o.is_success()) {
            if let Err(e) = &outcome.result {
                warn!(
                    delivery_id = %event.delivery_id,
                    event_type = %event.kind,
                    handler = %outcome.handler,
                    error = %e,
                    "Event handler failed"
                );
            }
        }

        outcomes
    }
}

/// Spawn each handler so a panic stays inside its own task.
async fn run_group(
    group: &[&Registration],
    event: &Arc<InboundEvent>,
    ctx: &HandlerContext,
) -> Vec<HandlerOutcome> {
    let tasks = group.iter().map(|registration| {
        let fut = registration.handler.handle(Arc::clone(event), ctx.clone());
        let name = registration.name.clone();
        async move {
            let result = match tokio::spawn(fut).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HandlerError::Failed(e)),
                Err(_) => Err(HandlerError::Panicked),
            };
            HandlerOutcome {
                handler: name,
                result,
            }
        }
    });
    join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use chrono::Utc;

    use super::*;

    fn event(kind: EventKind) -> Arc<InboundEvent> {
        Arc::new(InboundEvent {
            delivery_id: "d-1".into(),
            kind,
            received_at: Utc::now(),
            raw_body: Bytes::from_static(b"{}"),
            signature: String::new(),
            signature_timestamp: None,
            actor_id: None,
            command: None,
            provider: "test".into(),
        })
    }

    fn command(name: &str, actor: &str) -> Arc<InboundEvent> {
        let mut e = (*event(EventKind::Command)).clone();
        e.command = Some(name.into());
        e.actor_id = Some(actor.into());
        Arc::new(e)
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, label: &'static str) -> impl EventHandler {
        let log = Arc::clone(log);
        move |_event: Arc<InboundEvent>, _ctx: HandlerContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(label.to_string());
                anyhow::Ok(())
            }
        }
    }

    #[tokio::test]
    async fn specific_handler_then_wildcard() {
        let log: Log = Arc::default();
        let mut router = EventRouter::new();
        router
            .register_wildcard("audit", recorder(&log, "wildcard"))
            .register(EventKind::Push, "push", recorder(&log, "push"))
            .register(EventKind::Issue, "issue", recorder(&log, "issue"));

        let outcomes = router.dispatch(event(EventKind::Push)).await;

        assert_eq!(*log.lock().unwrap(), vec!["push", "wildcard"]);
        let names: Vec<_> = outcomes.iter().map(|o| o.handler.as_str()).collect();
        assert_eq!(names, vec!["push", "audit"]);
        assert!(outcomes.iter().all(HandlerOutcome::is_success));
    }

    async fn failing(_event: Arc<InboundEvent>, _ctx: HandlerContext) -> anyhow::Result<()> {
        anyhow::bail!("downstream unavailable")
    }

    async fn panicking(_event: Arc<InboundEvent>, _ctx: HandlerContext) -> anyhow::Result<()> {
        panic!("bug")
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_stop_siblings() {
        let log: Log = Arc::default();
        let mut router = EventRouter::new();
        router
            .register(EventKind::Message, "fails", failing)
            .register(EventKind::Message, "panics", panicking)
            .register(EventKind::Message, "works", recorder(&log, "works"))
            .register_wildcard("audit", recorder(&log, "wildcard"));

        let outcomes = router.dispatch(event(EventKind::Message)).await;

        assert_eq!(outcomes.len(), 4);
        assert!(matches!(outcomes[0].result, Err(HandlerError::Failed(_))));
        assert!(matches!(outcomes[1].result, Err(HandlerError::Panicked)));
        assert!(outcomes[2].is_success());
        assert!(outcomes[3].is_success());
        assert_eq!(*log.lock().unwrap(), vec!["works", "wildcard"]);
    }

    #[tokio::test]
    async fn commands_route_by_name_and_actor() {
        let log: Log = Arc::default();
        let mut router = EventRouter::new();
        router
            .register_command("/deploy", Some("U_ADMIN".into()), "deploy-admin", recorder(&log, "admin"))
            .register_command("deploy", None, "deploy-any", recorder(&log, "any"))
            .register_command("status", None, "status", recorder(&log, "status"));

        router.dispatch(command("/deploy", "U_OTHER")).await;
        assert_eq!(*log.lock().unwrap(), vec!["any"]);

        log.lock().unwrap().clear();
        let outcomes = router.dispatch(command("/deploy", "U_ADMIN")).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_kinds_reach_only_wildcards() {
        let log: Log = Arc::default();
        let mut router = EventRouter::new();
        router
            .register(EventKind::Push, "push", recorder(&log, "push"))
            .register_wildcard("audit", recorder(&log, "wildcard"));

        let e = event(EventKind::Unknown("team_join".into()));
        assert_eq!(router.handler_count(&e), 1);
        let outcomes = router.dispatch(e).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["wildcard"]);
    }

    #[tokio::test]
    async fn unknown_kinds_can_be_routed_explicitly() {
        let log: Log = Arc::default();
        let mut router = EventRouter::new();
        router.register(
            EventKind::Unknown("team_join".into()),
            "welcome",
            recorder(&log, "welcome"),
        );

        router
            .dispatch(event(EventKind::Unknown("team_join".into())))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["welcome"]);
    }

    #[tokio::test]
    async fn no_handlers_means_no_outcomes() {
        let router = EventRouter::new();
        assert!(router.dispatch(event(EventKind::Ping)).await.is_empty());
    }
}
