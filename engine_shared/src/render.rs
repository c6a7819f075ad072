//! Rendering abstraction.
//!
//! This crate does not depend on a graphics backend. The client hands the
//! renderer one [`RenderEntity`] per visible entity each frame.

use crate::{ecs::EntityId, math::Vec3};

/// Where to draw one entity this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderEntity {
    pub id: EntityId,
    pub origin: Vec3,
    pub angles: Vec3,
    /// Drawn from local prediction rather than server state.
    pub predicted: bool,
}

/// A minimal rendering API.
pub trait RenderBackend: Send {
    fn begin_frame(&mut self);
    fn draw_entity(&mut self, entity: &RenderEntity);
    fn end_frame(&mut self);
}

/// A no-op renderer useful for headless tests.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl RenderBackend for NullRenderer {
    fn begin_frame(&mut self) {}
    fn draw_entity(&mut self, _entity: &RenderEntity) {}
    fn end_frame(&mut self) {}
}
