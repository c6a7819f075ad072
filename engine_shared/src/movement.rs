//! Player movement step.
//!
//! Shared by the server simulation and client prediction so that replaying a
//! command on either side gives the same result. Depends only on the command
//! and the fixed tick duration.

use bitflags::bitflags;

use crate::{
    ecs::{Transform, Velocity},
    math::Vec3,
    net::PlayerCommand,
};

bitflags! {
    /// Buttons held during a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputButtons: u16 {
        const FORWARD    = 1 << 0;
        const BACK       = 1 << 1;
        const MOVE_LEFT  = 1 << 2;
        const MOVE_RIGHT = 1 << 3;
        const JUMP       = 1 << 4;
        const DUCK       = 1 << 5;
        const WALK       = 1 << 6;
        const ATTACK     = 1 << 7;
    }
}

/// Ground speed in units per second.
pub const RUN_SPEED: f32 = 250.0;
pub const WALK_SPEED: f32 = 130.0;
pub const DUCK_SPEED: f32 = 85.0;

/// Velocity requested by a command, before any physics.
pub fn wish_velocity(buttons: InputButtons, view_angles: Vec3) -> Vec3 {
    let (forward, right) = Vec3::yaw_basis(view_angles.y);
    let mut dir = Vec3::ZERO;
    if buttons.contains(InputButtons::FORWARD) {
        dir += forward;
    }
    if buttons.contains(InputButtons::BACK) {
        dir = dir - forward;
    }
    if buttons.contains(InputButtons::MOVE_RIGHT) {
        dir += right;
    }
    if buttons.contains(InputButtons::MOVE_LEFT) {
        dir = dir - right;
    }

    let speed = if buttons.contains(InputButtons::DUCK) {
        DUCK_SPEED
    } else if buttons.contains(InputButtons::WALK) {
        WALK_SPEED
    } else {
        RUN_SPEED
    };
    dir.normalized() * speed
}

/// Applies one command to a controlled entity over `dt` seconds.
pub fn apply_command(transform: &mut Transform, velocity: &mut Velocity, cmd: &PlayerCommand, dt: f32) {
    transform.angles = cmd.view_angles;
    velocity.0 = wish_velocity(cmd.input_bits, cmd.view_angles);
    transform.origin += velocity.0 * dt;
}
