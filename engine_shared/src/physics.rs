//! Physics abstraction.
//!
//! The simulation calls the backend once per tick, after player commands have
//! been applied. Backends must be deterministic: no wall-clock reads, no
//! randomness, same input world and `dt` give the same output world.

use crate::ecs::World;

/// Physics stepper trait.
pub trait PhysicsBackend: Send {
    fn step(&mut self, world: &mut World, dt_sec: f32);
}

/// No-op physics.
#[derive(Debug, Default)]
pub struct NullPhysics;

impl PhysicsBackend for NullPhysics {
    fn step(&mut self, _world: &mut World, _dt_sec: f32) {}
}
