//! Input handling.
//!
//! In a real engine this would integrate with windowing, raw mouse/keyboard
//! and action bindings. Here the frame loop samples an [`InputState`] and
//! turns it into one `PlayerCommand` per command interval.

use engine_shared::{
    math::Vec3,
    movement::InputButtons,
    net::{ClientId, PlayerCommand},
};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub buttons: InputButtons,
    /// Pitch, yaw, roll in degrees.
    pub view_angles: Vec3,
}

impl InputState {
    pub fn press(&mut self, buttons: InputButtons) {
        self.buttons.insert(buttons);
    }

    pub fn release(&mut self, buttons: InputButtons) {
        self.buttons.remove(buttons);
    }

    /// Turns the view; pitch is clamped, yaw wraps into `[0, 360)`.
    pub fn look(&mut self, pitch_delta: f32, yaw_delta: f32) {
        self.view_angles.x = (self.view_angles.x + pitch_delta).clamp(-89.0, 89.0);
        self.view_angles.y = (self.view_angles.y + yaw_delta).rem_euclid(360.0);
    }
}

/// Maps a `+forward`-style action name to its button.
pub fn action_button(action: &str) -> Option<InputButtons> {
    Some(match action {
        "forward" => InputButtons::FORWARD,
        "back" => InputButtons::BACK,
        "moveleft" => InputButtons::MOVE_LEFT,
        "moveright" => InputButtons::MOVE_RIGHT,
        "jump" => InputButtons::JUMP,
        "duck" => InputButtons::DUCK,
        "walk" => InputButtons::WALK,
        "attack" => InputButtons::ATTACK,
        _ => return None,
    })
}

/// Turns sampled input into a `PlayerCommand` for a client tick.
pub fn build_command(client_id: ClientId, client_tick: u32, input: InputState) -> PlayerCommand {
    PlayerCommand {
        client_id,
        client_tick,
        input_bits: input.buttons,
        view_angles: input.view_angles,
    }
}
