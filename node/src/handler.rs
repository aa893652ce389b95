//! Application trait seams (C14, ambient). `StageHandler` and `ApiHandler`
//! are the two traits application code implements; everything else in this
//! crate exists to drive them. Registration is by `stageType` / `msgId`
//! string, matching SPEC_FULL.md §9's "dynamic dispatch & handler
//! registration" note.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::Packet;

use crate::api::ApiLink;
use crate::contracts::{ActorLink, PacketView, StageLink};

/// Result of `OnCreate`: whether the stage creation is accepted, and an
/// optional reply packet handed back to the creator.
#[derive(Debug, Default)]
pub struct CreateOutcome {
    pub ok: bool,
    pub reply: Option<Packet>,
}

impl CreateOutcome {
    #[must_use]
    pub fn accept() -> Self {
        Self { ok: true, reply: None }
    }

    #[must_use]
    pub fn reject(reply: Option<Packet>) -> Self {
        Self { ok: false, reply }
    }
}

/// Result of `OnAuthenticate`. Per I5, `ok == true` is only meaningful if
/// the handler also called `ActorLink::set_account_id`.
#[derive(Debug, Default)]
pub struct AuthenticateOutcome {
    pub ok: bool,
    pub reply: Option<Packet>,
}

/// Outcome of one `OnDispatch` invocation. `handled == false` on a request
/// produces a `HandlerNotFound` reply; on a push it is logged and dropped.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub handled: bool,
    pub reply: Option<Packet>,
}

impl DispatchOutcome {
    #[must_use]
    pub fn ok(reply: Option<Packet>) -> Self {
        Self { handled: true, reply }
    }

    #[must_use]
    pub fn unhandled() -> Self {
        Self { handled: false, reply: None }
    }
}

/// Why an actor left a stage, passed to `OnLeaveRoom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Closed,
    Disconnected,
    Timeout,
    Kicked,
}

/// Application-defined Stage logic. One boxed instance lives per `(stage
/// type, stage id)`, owned exclusively by that stage's dispatcher — never
/// shared, never called from more than one thread.
#[async_trait]
pub trait StageHandler: Send {
    async fn on_create(&mut self, create_packet: PacketView, link: &StageLink) -> CreateOutcome {
        let _ = (create_packet, link);
        CreateOutcome::accept()
    }

    async fn on_post_create(&mut self, link: &StageLink) {
        let _ = link;
    }

    async fn on_authenticate(
        &mut self,
        auth_packet: PacketView,
        actor: &ActorLink,
        link: &StageLink,
    ) -> AuthenticateOutcome;

    async fn on_post_authenticate(&mut self, actor: &ActorLink, link: &StageLink) {
        let _ = (actor, link);
    }

    async fn on_join_stage(&mut self, actor: &ActorLink, link: &StageLink) -> bool {
        let _ = (actor, link);
        true
    }

    async fn on_post_join_stage(&mut self, actor: &ActorLink, link: &StageLink) {
        let _ = (actor, link);
    }

    async fn on_dispatch(
        &mut self,
        actor: Option<&ActorLink>,
        packet: PacketView,
        link: &StageLink,
    ) -> DispatchOutcome {
        let _ = (actor, packet, link);
        DispatchOutcome::unhandled()
    }

    async fn on_connection_changed(&mut self, actor: &ActorLink, connected: bool, link: &StageLink) {
        let _ = (actor, connected, link);
    }

    async fn on_leave_room(&mut self, actor: &ActorLink, reason: LeaveReason, link: &StageLink) {
        let _ = (actor, reason, link);
    }

    /// Per-actor teardown, run once for every actor still attached when the
    /// stage closes, after that actor's `on_leave_room` and before the
    /// stage-level `on_destroy`. Distinct from `on_leave_room`: this is
    /// where an actor's own resources (not the room's) are released.
    async fn on_actor_destroy(&mut self, actor: &ActorLink, link: &StageLink) {
        let _ = (actor, link);
    }

    async fn on_destroy(&mut self, link: &StageLink) {
        let _ = link;
    }
}

/// A `StageHandler` that never accepts an actor — used only as a neutral
/// receiver in tests that exercise the timer wheel / game loop in
/// isolation, where no real join flow occurs.
pub struct NoopStageHandler;

#[async_trait]
impl StageHandler for NoopStageHandler {
    async fn on_authenticate(
        &mut self,
        _auth_packet: PacketView,
        _actor: &ActorLink,
        _link: &StageLink,
    ) -> AuthenticateOutcome {
        AuthenticateOutcome { ok: false, reply: None }
    }
}

/// Application-defined API request logic (C9). Stateless: one instance is
/// shared across every inbound request for its `msgId`.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle(&self, packet: PacketView, link: ApiLink);
}

/// Factory used by the stage registry to construct a fresh `StageHandler`
/// for a newly created stage of a given `stageType`.
pub type StageHandlerFactory = Box<dyn Fn() -> Box<dyn StageHandler> + Send + Sync>;

/// Registration table for `StageHandler` factories, keyed by `stageType`.
#[derive(Default)]
pub struct StageHandlerRegistry {
    factories: HashMap<String, StageHandlerFactory>,
}

impl StageHandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage_type: impl Into<String>, factory: StageHandlerFactory) {
        self.factories.insert(stage_type.into(), factory);
    }

    #[must_use]
    pub fn create(&self, stage_type: &str) -> Option<Box<dyn StageHandler>> {
        self.factories.get(stage_type).map(|f| f())
    }

    #[must_use]
    pub fn contains(&self, stage_type: &str) -> bool {
        self.factories.contains_key(stage_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// The single registered `stageType`, if exactly one is registered.
    /// Used to resolve the client wire format's missing `stageType` field
    /// when a deployment hosts only one kind of stage.
    #[must_use]
    pub fn sole_registered_type(&self) -> Option<String> {
        if self.factories.len() == 1 {
            self.factories.keys().next().cloned()
        } else {
            None
        }
    }
}

/// Registration table for `ApiHandler`s, keyed by `msgId`. Handlers are
/// `Arc`-shared rather than boxed so a dispatch can clone one out and move
/// it into its own `tokio::spawn`'d task.
#[derive(Default)]
pub struct ApiHandlerRegistry {
    handlers: HashMap<String, Arc<dyn ApiHandler>>,
}

impl ApiHandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, msg_id: impl Into<String>, handler: Arc<dyn ApiHandler>) {
        self.handlers.insert(msg_id.into(), handler);
    }

    #[must_use]
    pub fn get(&self, msg_id: &str) -> Option<Arc<dyn ApiHandler>> {
        self.handlers.get(msg_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_registered_stage_type() {
        let mut registry = StageHandlerRegistry::new();
        registry.register("room", Box::new(|| Box::new(NoopStageHandler) as Box<dyn StageHandler>));
        assert!(registry.contains("room"));
        assert!(registry.create("room").is_some());
        assert!(registry.create("unknown").is_none());
    }
}
