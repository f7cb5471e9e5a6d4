//! Health and death.
//!
//! [`Health`] is the authoritative component; only the server mutates it.
//! [`HealthReplica`] is the client-side projection, reconciled from snapshots
//! and torn down by the destruction payload.
//!
//! Health travels as a single byte, so both current and max live in `u8`.
//! Zero is the terminal dead state: once reached, damage and healing are
//! ignored.

use crate::{ecs::EntityId, event::Observers, net::DamageCause};

/// Authoritative health component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    current: u8,
    max: u8,
}

/// Result of [`Health::apply_damage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    /// Already dead; nothing changed.
    Ignored,
    /// Still alive with `remaining` health.
    Damaged { remaining: u8 },
    /// This hit brought health to zero.
    Died,
}

impl Health {
    /// Full health.
    pub fn new(max: u8) -> Self {
        Self { current: max, max }
    }

    /// Explicit current value, clamped to `max`.
    pub fn with_current(current: u8, max: u8) -> Self {
        Self {
            current: current.min(max),
            max,
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn max(&self) -> u8 {
        self.max
    }

    pub fn is_dead(&self) -> bool {
        self.current == 0
    }

    pub fn apply_damage(&mut self, amount: u32) -> DamageOutcome {
        if self.is_dead() {
            return DamageOutcome::Ignored;
        }
        let amount = amount.min(u8::MAX as u32) as u8;
        self.current = self.current.saturating_sub(amount);
        if self.current == 0 {
            DamageOutcome::Died
        } else {
            DamageOutcome::Damaged {
                remaining: self.current,
            }
        }
    }

    /// Returns the amount actually restored.
    pub fn heal(&mut self, amount: u32) -> u8 {
        if self.is_dead() {
            return 0;
        }
        let before = self.current;
        let raised = (self.current as u32).saturating_add(amount);
        self.current = raised.min(self.max as u32) as u8;
        self.current - before
    }

    /// Forces death. Returns false if already dead.
    pub fn kill(&mut self) -> bool {
        if self.is_dead() {
            return false;
        }
        self.current = 0;
        true
    }
}

/// Notifications raised by replicas on the observing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A snapshot lowered this entity's health.
    Hurt {
        entity: EntityId,
        previous: u8,
        current: u8,
    },
    /// Same as `Hurt`, raised only for the entity this client owns.
    LocalPlayerHurt { entity: EntityId },
    /// Server's targeted owner-only damage message.
    OwnerHurtSignal { entity: EntityId },
    /// The entity was destroyed.
    Died {
        entity: EntityId,
        cause: Option<DamageCause>,
    },
    /// Same as `Died`, raised only for the entity this client owns.
    LocalPlayerDied {
        entity: EntityId,
        cause: Option<DamageCause>,
    },
}

/// Read-only projection of an entity's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReplica {
    entity: EntityId,
    health: u8,
    max: u8,
    owned: bool,
}

impl HealthReplica {
    pub fn new(entity: EntityId, health: u8, max: u8, owned: bool) -> Self {
        Self {
            entity,
            health,
            max,
            owned,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn health(&self) -> u8 {
        self.health
    }

    pub fn max(&self) -> u8 {
        self.max
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Reconciles with a snapshot value, raising hurt notifications before
    /// the cached value is overwritten.
    pub fn apply_snapshot(&mut self, health: u8, events: &mut Observers<ReplicaEvent>) {
        if health < self.health {
            events.emit(&ReplicaEvent::Hurt {
                entity: self.entity,
                previous: self.health,
                current: health,
            });
            if self.owned {
                events.emit(&ReplicaEvent::LocalPlayerHurt {
                    entity: self.entity,
                });
            }
        }
        self.health = health;
    }

    /// Consumes the replica on receipt of the destruction payload.
    pub fn destroyed(self, cause: Option<DamageCause>, events: &mut Observers<ReplicaEvent>) {
        events.emit(&ReplicaEvent::Died {
            entity: self.entity,
            cause: cause.clone(),
        });
        if self.owned {
            events.emit(&ReplicaEvent::LocalPlayerDied {
                entity: self.entity,
                cause,
            });
        }
    }
}
