//! Client-side prediction and reconciliation.
//!
//! The own entity is drawn from a local overlay: the last confirmed server
//! state with every unacknowledged command replayed on top. The overlay is
//! never merged into the confirmed snapshot; each newer snapshot rebuilds it.

use std::collections::VecDeque;

use engine_shared::{
    ecs::{Transform, Velocity},
    movement,
    net::{ClientId, PlayerCommand, Snapshot},
};
use tracing::trace;

/// Unacknowledged commands kept for replay. Older ones are dropped first.
pub const MAX_PENDING_COMMANDS: usize = 256;

/// Predicted state of the own entity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PredictedState {
    pub transform: Transform,
    pub velocity: Velocity,
}

#[derive(Debug)]
pub struct Predictor {
    client: Option<ClientId>,
    dt_sec: f32,
    enabled: bool,
    confirmed: Option<Snapshot>,
    pending: VecDeque<PlayerCommand>,
    predicted: Option<PredictedState>,
}

impl Predictor {
    pub fn new(dt_sec: f32) -> Self {
        Self {
            client: None,
            dt_sec,
            enabled: true,
            confirmed: None,
            pending: VecDeque::new(),
            predicted: None,
        }
    }

    /// Binds the predictor to the id and tick duration from Welcome.
    pub fn set_client(&mut self, client: ClientId, dt_sec: f32) {
        self.client = Some(client);
        self.dt_sec = dt_sec;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.pending.clear();
        }
        self.rebuild();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Forgets all state, e.g. on map change.
    pub fn reset(&mut self) {
        self.confirmed = None;
        self.pending.clear();
        self.predicted = None;
    }

    pub fn confirmed(&self) -> Option<&Snapshot> {
        self.confirmed.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Own entity as last confirmed by the server.
    pub fn confirmed_state(&self) -> Option<PredictedState> {
        let client = self.client?;
        let own = self.confirmed.as_ref()?.controlled_by(client)?;
        Some(PredictedState {
            transform: own.bundle.transform?,
            velocity: own.bundle.velocity.unwrap_or_default(),
        })
    }

    /// Confirmed state plus replayed commands; `None` until the server has
    /// spawned the own entity.
    pub fn predicted(&self) -> Option<PredictedState> {
        if self.enabled {
            self.predicted
        } else {
            self.confirmed_state()
        }
    }

    /// Records a locally issued command and applies it to the overlay.
    pub fn push_command(&mut self, cmd: PlayerCommand) {
        if !self.enabled {
            return;
        }
        if let Some(state) = self.predicted.as_mut() {
            movement::apply_command(&mut state.transform, &mut state.velocity, &cmd, self.dt_sec);
        }
        self.pending.push_back(cmd);
        while self.pending.len() > MAX_PENDING_COMMANDS {
            self.pending.pop_front();
        }
    }

    /// Reconciles against a snapshot. Returns false if it is not newer than
    /// the confirmed one.
    pub fn on_snapshot(&mut self, snap: &Snapshot) -> bool {
        if self
            .confirmed
            .as_ref()
            .is_some_and(|c| snap.server_tick <= c.server_tick)
        {
            return false;
        }
        self.confirmed = Some(snap.clone());
        if let Some(acked) = snap.last_processed_client_tick {
            let before = self.pending.len();
            self.pending.retain(|c| c.client_tick > acked);
            trace!(acked, dropped = before - self.pending.len(), "commands acknowledged");
        }
        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        self.predicted = self.confirmed_state().map(|mut state| {
            for cmd in &self.pending {
                movement::apply_command(&mut state.transform, &mut state.velocity, cmd, self.dt_sec);
            }
            state
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::{
        ecs::{ComponentBundle, Controller, EntityId},
        math::Vec3,
        movement::InputButtons,
        net::EntityState,
    };

    const DT: f32 = 1.0 / 64.0;
    const ME: ClientId = ClientId(1);

    fn cmd(tick: u32, bits: InputButtons, yaw: f32) -> PlayerCommand {
        PlayerCommand {
            client_id: ME,
            client_tick: tick,
            input_bits: bits,
            view_angles: Vec3::new(0.0, yaw, 0.0),
        }
    }

    /// Minimal authoritative side: one entity, commands applied in order.
    struct Server {
        state: PredictedState,
        tick: u32,
        last_processed: Option<u32>,
    }

    impl Server {
        fn new() -> Self {
            Self {
                state: PredictedState::default(),
                tick: 0,
                last_processed: None,
            }
        }

        fn apply(&mut self, c: &PlayerCommand) -> Snapshot {
            movement::apply_command(&mut self.state.transform, &mut self.state.velocity, c, DT);
            self.last_processed = Some(c.client_tick);
            self.snapshot()
        }

        fn snapshot(&mut self) -> Snapshot {
            self.tick += 1;
            Snapshot {
                server_tick: self.tick,
                last_processed_client_tick: self.last_processed,
                entities: vec![EntityState {
                    id: EntityId {
                        index: 0,
                        generation: 0,
                    },
                    bundle: ComponentBundle {
                        transform: Some(self.state.transform),
                        velocity: Some(self.state.velocity),
                        controller: Some(Controller { client: ME }),
                        parent: None,
                    },
                }],
            }
        }
    }

    fn predictor() -> Predictor {
        let mut p = Predictor::new(DT);
        p.set_client(ME, DT);
        p
    }

    #[test]
    fn converges_once_commands_are_acknowledged() {
        let mut server = Server::new();
        let mut p = predictor();
        p.on_snapshot(&server.snapshot());

        let cmds: Vec<_> = (1..=40u32)
            .map(|t| cmd(t, InputButtons::FORWARD | InputButtons::MOVE_RIGHT, t as f32 * 3.0))
            .collect();

        // Client runs three commands ahead of the server.
        let mut snaps = Vec::new();
        for (i, c) in cmds.iter().enumerate() {
            p.push_command(c.clone());
            if i >= 3 {
                snaps.push(server.apply(&cmds[i - 3]));
                p.on_snapshot(snaps.last().unwrap());
                assert_eq!(p.pending(), 3);
            }
        }
        for c in &cmds[cmds.len() - 3..] {
            p.on_snapshot(&server.apply(c));
        }

        assert_eq!(p.pending(), 0);
        assert_eq!(p.predicted(), p.confirmed_state());
        assert_eq!(p.predicted().unwrap().transform, server.state.transform);
    }

    #[test]
    fn prediction_runs_ahead_of_confirmation() {
        let mut server = Server::new();
        let mut p = predictor();
        p.on_snapshot(&server.snapshot());

        for t in 1..=4 {
            p.push_command(cmd(t, InputButtons::FORWARD, 0.0));
        }
        let ahead = p.predicted().unwrap().transform.origin.x;
        assert!((ahead - 4.0 * movement::RUN_SPEED * DT).abs() < 1e-3);
        assert_eq!(p.confirmed_state().unwrap().transform.origin.x, 0.0);

        // Server processed the first two; replaying the rest lands in the same spot.
        server.apply(&cmd(1, InputButtons::FORWARD, 0.0));
        let snap = server.apply(&cmd(2, InputButtons::FORWARD, 0.0));
        assert!(p.on_snapshot(&snap));
        assert_eq!(p.pending(), 2);
        assert!((p.predicted().unwrap().transform.origin.x - ahead).abs() < 1e-3);
    }

    #[test]
    fn server_correction_replaces_misprediction() {
        let mut server = Server::new();
        let mut p = predictor();
        p.on_snapshot(&server.snapshot());
        p.push_command(cmd(1, InputButtons::FORWARD, 0.0));
        p.push_command(cmd(2, InputButtons::FORWARD, 0.0));

        // The server teleported the player and has seen command 1 only.
        server.state.transform.origin = Vec3::new(500.0, 0.0, 0.0);
        let snap = server.apply(&cmd(1, InputButtons::empty(), 0.0));
        p.on_snapshot(&snap);
        let x = p.predicted().unwrap().transform.origin.x;
        assert!((x - (500.0 + movement::RUN_SPEED * DT)).abs() < 1e-3);
    }

    #[test]
    fn stale_snapshots_are_ignored() {
        let mut server = Server::new();
        let mut p = predictor();
        let first = server.snapshot();
        let second = server.snapshot();
        assert!(p.on_snapshot(&second));
        assert!(!p.on_snapshot(&first));
        assert!(!p.on_snapshot(&second));
        assert_eq!(p.confirmed().map(|s| s.server_tick), Some(2));
    }

    #[test]
    fn disabled_prediction_shows_confirmed_state() {
        let mut server = Server::new();
        let mut p = predictor();
        p.on_snapshot(&server.snapshot());
        p.set_enabled(false);
        p.push_command(cmd(1, InputButtons::FORWARD, 0.0));
        assert_eq!(p.pending(), 0);
        assert_eq!(p.predicted(), p.confirmed_state());
    }

    #[test]
    fn nothing_predicted_before_spawn() {
        let mut p = predictor();
        p.push_command(cmd(1, InputButtons::FORWARD, 0.0));
        assert_eq!(p.predicted(), None);
        p.on_snapshot(&Snapshot {
            server_tick: 1,
            last_processed_client_tick: None,
            entities: Vec::new(),
        });
        assert_eq!(p.predicted(), None);
        assert_eq!(p.pending(), 1);
    }
}
