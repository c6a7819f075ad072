//! Deterministic world simulation.
//!
//! One [`Simulation::step`] is one server tick. The step reads nothing but the
//! commands it is handed and the fixed tick duration, so replaying the same
//! command sequence reproduces the world bit for bit.

use bytes::Bytes;
use engine_shared::{
    codec,
    ecs::{ComponentBundle, Controller, EntityId, Transform, Velocity, World},
    error::NetResult,
    map::LoadedMap,
    math::Vec3,
    movement,
    net::{ClientId, PlayerCommand},
    physics::{NullPhysics, PhysicsBackend},
};
use tracing::{debug, trace};

/// Authoritative world plus the fixed-step driver.
pub struct Simulation {
    world: World,
    tick: u32,
    dt_sec: f32,
    physics: Box<dyn PhysicsBackend>,
    spawn_points: Vec<(Vec3, Vec3)>,
    next_spawn: usize,
}

impl Simulation {
    pub fn new(tick_hz: u32) -> Self {
        Self::with_physics(tick_hz, Box::new(NullPhysics))
    }

    pub fn with_physics(tick_hz: u32, physics: Box<dyn PhysicsBackend>) -> Self {
        Self {
            world: World::new(),
            tick: 0,
            dt_sec: 1.0 / tick_hz.max(1) as f32,
            physics,
            spawn_points: Vec::new(),
            next_spawn: 0,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Number of the last completed tick. Zero before the first step.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn dt_sec(&self) -> f32 {
        self.dt_sec
    }

    /// Replaces the world with the entities of `map`. The tick counter keeps
    /// running so tick numbers stay unique for the whole process.
    pub fn load_map(&mut self, map: &LoadedMap) {
        self.world.clear();
        self.spawn_points = map.spawn_points();
        self.next_spawn = 0;

        for ent in &map.entities {
            if ent.classname == "worldspawn" || ent.is_spawn_point() {
                continue;
            }
            let Some(origin) = ent.origin() else {
                continue;
            };
            let id = self.world.spawn_with(ComponentBundle {
                transform: Some(Transform {
                    origin,
                    angles: ent.angles().unwrap_or_default(),
                }),
                ..Default::default()
            });
            trace!(entity = ?id, classname = %ent.classname, "spawned map entity");
        }
        debug!(
            map = %map.info.name,
            entities = self.world.len(),
            spawn_points = self.spawn_points.len(),
            "world populated"
        );
    }

    /// Spawns the entity `client` controls at the next spawn point.
    pub fn spawn_player(&mut self, client: ClientId) -> EntityId {
        if let Some(existing) = self.world.controlled_by(client) {
            return existing;
        }
        let (origin, angles) = if self.spawn_points.is_empty() {
            (Vec3::ZERO, Vec3::ZERO)
        } else {
            let p = self.spawn_points[self.next_spawn % self.spawn_points.len()];
            self.next_spawn += 1;
            p
        };
        self.world.spawn_with(ComponentBundle {
            transform: Some(Transform { origin, angles }),
            velocity: Some(Velocity::default()),
            controller: Some(Controller { client }),
            parent: None,
        })
    }

    pub fn remove_player(&mut self, client: ClientId) -> bool {
        match self.world.controlled_by(client) {
            Some(id) => self.world.despawn(id).is_some(),
            None => false,
        }
    }

    /// Advances the world by one tick and returns the new tick number.
    ///
    /// `commands` holds at most one command per client; they are applied in
    /// slice order.
    pub fn step(&mut self, commands: &[PlayerCommand]) -> u32 {
        for cmd in commands {
            let Some(id) = self.world.controlled_by(cmd.client_id) else {
                continue;
            };
            let Some(bundle) = self.world.bundle_mut(id) else {
                continue;
            };
            let mut transform = bundle.transform.unwrap_or_default();
            let mut velocity = bundle.velocity.unwrap_or_default();
            movement::apply_command(&mut transform, &mut velocity, cmd, self.dt_sec);
            bundle.transform = Some(transform);
            bundle.velocity = Some(velocity);
        }
        self.physics.step(&mut self.world, self.dt_sec);
        self.tick += 1;
        self.tick
    }

    /// Entity list of the current world, encoded once for every recipient.
    pub fn snapshot_body(&self) -> NetResult<Bytes> {
        codec::encode_snapshot_body(self.world.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::{
        map::{MapLoader, MemoryMapLoader},
        movement::InputButtons,
    };

    const LUMP: &str = r#"
{ "classname" "worldspawn" }
{ "classname" "info_player_start" "origin" "100 0 0" "angles" "0 90 0" }
{ "classname" "info_player_deathmatch" "origin" "-100 0 0" }
{ "classname" "light" "origin" "0 0 128" }
{ "classname" "func_detail" }
"#;

    fn loaded() -> LoadedMap {
        MemoryMapLoader::new()
            .with_map("dm_test", LUMP)
            .load("dm_test")
            .unwrap()
    }

    fn cmd(client: u16, tick: u32, bits: InputButtons, yaw: f32) -> PlayerCommand {
        PlayerCommand {
            client_id: ClientId(client),
            client_tick: tick,
            input_bits: bits,
            view_angles: Vec3::new(0.0, yaw, 0.0),
        }
    }

    fn run(script: &[Vec<PlayerCommand>]) -> Simulation {
        let mut sim = Simulation::new(64);
        sim.load_map(&loaded());
        sim.spawn_player(ClientId(1));
        sim.spawn_player(ClientId(2));
        for cmds in script {
            sim.step(cmds);
        }
        sim
    }

    fn script() -> Vec<Vec<PlayerCommand>> {
        (1..=200u32)
            .map(|t| {
                let mut cmds = vec![cmd(1, t, InputButtons::FORWARD, t as f32 * 1.7)];
                if t % 3 != 0 {
                    cmds.push(cmd(2, t, InputButtons::MOVE_LEFT | InputButtons::WALK, 45.0));
                }
                cmds
            })
            .collect()
    }

    #[test]
    fn replay_is_bit_identical() {
        let a = run(&script());
        let b = run(&script());
        assert_eq!(a.tick(), 200);
        assert_eq!(a.world().state_hash(), b.world().state_hash());
        assert_eq!(a.snapshot_body().unwrap(), b.snapshot_body().unwrap());

        let mut other = script();
        other[150][0].input_bits = InputButtons::BACK;
        assert_ne!(run(&other).world().state_hash(), a.world().state_hash());
    }

    #[test]
    fn map_entities_and_spawn_points() {
        let mut sim = Simulation::new(64);
        sim.load_map(&loaded());
        // Only the light has an origin and is not a spawn point.
        assert_eq!(sim.world().len(), 1);

        let p1 = sim.spawn_player(ClientId(1));
        let p2 = sim.spawn_player(ClientId(2));
        let p3 = sim.spawn_player(ClientId(3));
        let origin = |id| sim.world().get::<Transform>(id).unwrap().origin;
        assert_eq!(origin(p1), Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(origin(p2), Vec3::new(-100.0, 0.0, 0.0));
        assert_eq!(origin(p3), Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(sim.spawn_player(ClientId(1)), p1);

        assert!(sim.remove_player(ClientId(2)));
        assert!(!sim.world().contains(p2));
        assert!(!sim.remove_player(ClientId(2)));

        sim.load_map(&loaded());
        assert_eq!(sim.world().len(), 1);
        assert!(!sim.world().contains(p1));
    }

    #[test]
    fn step_moves_only_commanded_players() {
        let mut sim = Simulation::new(64);
        let a = sim.spawn_player(ClientId(1));
        let b = sim.spawn_player(ClientId(2));
        let tick = sim.step(&[cmd(1, 1, InputButtons::FORWARD, 0.0)]);
        assert_eq!(tick, 1);

        let ta = sim.world().get::<Transform>(a).unwrap();
        assert!((ta.origin.x - movement::RUN_SPEED / 64.0).abs() < 1e-4);
        assert_eq!(sim.world().get::<Transform>(b).unwrap().origin, Vec3::ZERO);

        // Commands for clients without an entity are ignored.
        sim.step(&[cmd(9, 1, InputButtons::FORWARD, 0.0)]);
        assert_eq!(sim.tick(), 2);
    }

    #[test]
    fn physics_runs_once_per_tick() {
        struct Counting(std::sync::Arc<std::sync::atomic::AtomicU32>);
        impl PhysicsBackend for Counting {
            fn step(&mut self, _world: &mut World, dt_sec: f32) {
                assert!((dt_sec - 1.0 / 32.0).abs() < f32::EPSILON);
                self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        let count = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut sim = Simulation::with_physics(32, Box::new(Counting(count.clone())));
        for _ in 0..5 {
            sim.step(&[]);
        }
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 5);
    }
}
