//! Remote call gateway.
//!
//! Procedures are registered once in a table mapping a name to a
//! [`CallDescriptor`] (target scope, caller scope) and a handler. The table is
//! frozen when [`GatewayBuilder::build`] runs; there is no way to add or
//! change a procedure afterwards.
//!
//! Authorization happens in exactly one place, [`Gateway::dispatch`]. The
//! caller identity it checks is the [`Principal`] of the channel the call
//! arrived on, never a value carried in the call's arguments.
//!
//! # Usage
//! ```ignore
//! let gateway = Gateway::<Core>::builder()
//!     .register(procedures::READY_UP, CallDescriptor::new(Scope::Server, Scope::Everyone), on_ready_up)?
//!     .build();
//! gateway.invoke(&mut core, &call, Principal::Client(id), None)?;
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    ecs::EntityId,
    error::{SessionError, SessionResult},
    math::Vec3,
    net::ClientId,
    scope::{Principal, Scope},
};

/// Procedure names understood by the arena session.
pub mod procedures {
    // Client -> server requests.
    pub const READY_UP: &str = "ReadyUp";
    pub const SCENE_LOADED: &str = "SceneLoaded";
    pub const REQUEST_SHOOT: &str = "RequestShoot";
    pub const REQUEST_DESPAWN: &str = "RequestDespawn";
    pub const REQUEST_SPAWN_AVATAR: &str = "RequestSpawnAvatar";
    pub const RESPAWN: &str = "Respawn";
    pub const SET_APPEARANCE: &str = "SetAppearance";
    pub const REQUEST_MOVE: &str = "RequestMove";

    // Server -> everyone broadcasts.
    pub const SCENE_TRANSITION: &str = "SceneTransition";
    pub const START_GAMEPLAY: &str = "StartGameplay";
    pub const IMPACT_NOTIFICATION: &str = "ImpactNotification";
}

/// Addressing and authorization of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// Which processes receive the call.
    pub target: Scope,
    /// Who may invoke it.
    pub caller: Scope,
}

impl CallDescriptor {
    pub const fn new(target: Scope, caller: Scope) -> Self {
        Self { target, caller }
    }
}

/// Call arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcArgs {
    None,
    Shoot { origin: Vec3, direction: Vec3 },
    SpawnAvatar { client_id: ClientId, position: Vec3 },
    Appearance { index: i32 },
    Move { direction: Vec3 },
    Impact { position: Vec3 },
}

/// A remote call as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub procedure: String,
    /// Addressed entity, for calls made "on" an avatar or projectile.
    pub target: Option<EntityId>,
    pub args: RpcArgs,
}

impl RpcCall {
    pub fn new(procedure: &str, args: RpcArgs) -> Self {
        Self {
            procedure: procedure.to_string(),
            target: None,
            args,
        }
    }

    /// Addresses the call to an entity.
    pub fn on(mut self, entity: EntityId) -> Self {
        self.target = Some(entity);
        self
    }
}

/// A process a call is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliverySite {
    Server,
    Client(ClientId),
}

/// Verified facts about a call, available to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Principal,
    /// Owner of the addressed entity, if the call has one.
    pub owner: Option<ClientId>,
    pub target: Option<EntityId>,
}

/// Procedure handler.
pub type Handler<C> = Box<dyn Fn(&mut C, &CallContext, &RpcArgs) -> SessionResult<()> + Send + Sync>;

struct Registered<C> {
    descriptor: CallDescriptor,
    handler: Handler<C>,
}

/// Collects procedure registrations.
pub struct GatewayBuilder<C> {
    procedures: HashMap<String, Registered<C>>,
}

impl<C> GatewayBuilder<C> {
    /// Registers a procedure. A name can only be registered once.
    pub fn register<F>(mut self, name: &str, descriptor: CallDescriptor, handler: F) -> SessionResult<Self>
    where
        F: Fn(&mut C, &CallContext, &RpcArgs) -> SessionResult<()> + Send + Sync + 'static,
    {
        if self.procedures.contains_key(name) {
            return Err(SessionError::invalid_state(format!(
                "procedure '{}' already registered",
                name
            )));
        }
        self.procedures.insert(
            name.to_string(),
            Registered {
                descriptor,
                handler: Box::new(handler),
            },
        );
        Ok(self)
    }

    /// Freezes the table.
    pub fn build(self) -> Gateway<C> {
        Gateway {
            procedures: self.procedures,
        }
    }
}

/// Immutable procedure table with central authorization.
pub struct Gateway<C> {
    procedures: HashMap<String, Registered<C>>,
}

impl<C> Gateway<C> {
    pub fn builder() -> GatewayBuilder<C> {
        GatewayBuilder {
            procedures: HashMap::new(),
        }
    }

    /// Looks up a procedure's descriptor.
    pub fn descriptor(&self, name: &str) -> SessionResult<CallDescriptor> {
        self.procedures
            .get(name)
            .map(|r| r.descriptor)
            .ok_or_else(|| SessionError::UnknownProcedure(name.to_string()))
    }

    /// Computes the delivery sites of a call from its target scope.
    ///
    /// `owner` is the owner of the addressed entity; `connected` lists the
    /// currently connected clients.
    pub fn route(
        &self,
        name: &str,
        owner: Option<ClientId>,
        connected: &[ClientId],
    ) -> SessionResult<Vec<DeliverySite>> {
        let descriptor = self.descriptor(name)?;
        let sites = match descriptor.target {
            Scope::Server => vec![DeliverySite::Server],
            Scope::Owner => owner
                .filter(|o| connected.contains(o))
                .map(DeliverySite::Client)
                .into_iter()
                .collect(),
            Scope::Everyone => std::iter::once(DeliverySite::Server)
                .chain(connected.iter().copied().map(DeliverySite::Client))
                .collect(),
        };
        Ok(sites)
    }

    /// Checks whether `caller` may invoke `name` on an entity owned by `owner`.
    pub fn authorize(&self, name: &str, caller: Principal, owner: Option<ClientId>) -> SessionResult<()> {
        let descriptor = self.descriptor(name)?;
        if descriptor.caller.permits(caller, owner) {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied)
        }
    }

    /// Runs a call at the local delivery site.
    ///
    /// Unauthorized calls are dropped: the handler does not run and
    /// `PermissionDenied` is returned for the caller to log.
    pub fn dispatch(&self, ctx: &mut C, name: &str, call: &CallContext, args: &RpcArgs) -> SessionResult<()> {
        let registered = self
            .procedures
            .get(name)
            .ok_or_else(|| SessionError::UnknownProcedure(name.to_string()))?;
        if !registered.descriptor.caller.permits(call.caller, call.owner) {
            return Err(SessionError::PermissionDenied);
        }
        (registered.handler)(ctx, call, args)
    }

    /// Convenience for a call that arrived over the wire.
    pub fn invoke(
        &self,
        ctx: &mut C,
        call: &RpcCall,
        caller: Principal,
        owner: Option<ClientId>,
    ) -> SessionResult<()> {
        let call_ctx = CallContext {
            caller,
            owner,
            target: call.target,
        };
        self.dispatch(ctx, &call.procedure, &call_ctx, &call.args)
    }
}
