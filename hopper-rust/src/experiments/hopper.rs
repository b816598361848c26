//! CustomHopper: planar one-legged hopper, no MuJoCo needed.
//!
//! Reduced-order model of MuJoCo Hopper-v3:
//! - torso (point mass carrying the whole body's translational inertia)
//! - thigh, leg, foot chain driven by three torque motors (gear 200)
//! - spring/damper ground contact at heel and toe, with bounded friction
//! - contact forces act on every joint between the torso and the foot, so an
//!   unactuated hopper folds and tips over like Hopper-v3 does
//!
//! Observation (11): [z, pitch, thigh, leg, foot,
//!                    vx, vz, pitch_vel, thigh_vel, leg_vel, foot_vel]
//! Action (3): joint torques in [-1, 1]
//! Reward: forward_velocity + 1.0 (healthy) - 1e-3 * |a|^2
//!
//! Two registered variants share everything except link masses:
//! the source torso is 1 kg lighter than the target's.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::env::*;

// ─── Constants ────────────────────────────────────────────────────────
pub const SOURCE_ID: &str = "CustomHopper-source-v0";
pub const TARGET_ID: &str = "CustomHopper-target-v0";

const DT: f64 = 0.002;
const FRAME_SKIP: usize = 4; // 125 Hz control
const MAX_STEPS: usize = 1000;
const GRAVITY: f64 = 9.81;

const TORSO_HALF: f64 = 0.2;
const THIGH_LEN: f64 = 0.45;
const LEG_LEN: f64 = 0.5;
const HEEL_OFFSET: f64 = -0.13;
const TOE_OFFSET: f64 = 0.26;
const FOOT_RADIUS: f64 = 0.06;
const INIT_Z: f64 = 1.25;
const INIT_NOISE: f64 = 5e-3;

const GEAR: f64 = 200.0;
const ARMATURE: f64 = 1.0;
const JOINT_DAMPING: f64 = 1.0;
const PITCH_DAMPING: f64 = 1.0;
/// Fraction of the thigh motor torque felt by the torso.
const HIP_REACTION: f64 = 0.5;
/// Radius of gyration of the whole body about the torso.
const GYRATION_RADIUS: f64 = 0.3;

const CONTACT_STIFFNESS: f64 = 1.0e4;
const CONTACT_DAMPING: f64 = 500.0;
/// Viscous friction on contact slip. Kept below 2 / (DT * contact mobility)
/// with both contacts loaded so explicit integration does not chatter.
const FRICTION_DAMPING: f64 = 150.0;
const FRICTION_COEF: f64 = 0.9;

// Joint limits in radians: thigh, leg, foot.
const JOINT_LIMITS: [(f64, f64); 3] = [(-2.618, 0.0), (-2.618, 0.0), (-0.785, 0.785)];

const HEALTHY_REWARD: f64 = 1.0;
const CTRL_COST_WEIGHT: f64 = 1e-3;
const HEALTHY_Z_MIN: f64 = 0.7;
const HEALTHY_ANGLE: f64 = 0.2;
const HEALTHY_STATE: f64 = 100.0;
const OBS_VEL_CLIP: f64 = 10.0;

/// Link masses of the default MuJoCo hopper: torso, thigh, leg, foot.
pub const TARGET_MASSES: [f64; 4] = [3.53429174, 3.92699082, 2.71433605, 5.0893801];
/// The source domain shifts the torso mass by this amount.
pub const SOURCE_TORSO_SHIFT: f64 = -1.0;

/// Which hopper variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Domain {
    Source,
    Target,
}

impl Domain {
    pub fn env_id(self) -> &'static str {
        match self {
            Domain::Source => SOURCE_ID,
            Domain::Target => TARGET_ID,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Domain::Source => "source",
            Domain::Target => "target",
        }
    }

    pub fn masses(self) -> [f64; 4] {
        let mut masses = TARGET_MASSES;
        if self == Domain::Source {
            masses[0] += SOURCE_TORSO_SHIFT;
        }
        masses
    }
}

/// Register both hopper variants. Call once at process start.
pub fn register(registry: &mut EnvRegistry) -> Result<(), ConfigError> {
    registry.register(SOURCE_ID, make_source)?;
    registry.register(TARGET_ID, make_target)?;
    Ok(())
}

fn make_source(seed: Option<u64>) -> Box<dyn Environment> {
    Box::new(CustomHopper::new(Domain::Source, seed))
}

fn make_target(seed: Option<u64>) -> Box<dyn Environment> {
    Box::new(CustomHopper::new(Domain::Target, seed))
}

/// Inertial quantities derived once from the link masses.
#[derive(Debug, Clone)]
struct Inertia {
    total_mass: f64,
    pitch: f64,
    joints: [f64; 3],
}

impl Inertia {
    fn from_masses(m: &[f64; 4]) -> Self {
        let [torso, thigh, leg, foot] = *m;
        let total_mass = torso + thigh + leg + foot;
        let foot_len = TOE_OFFSET - HEEL_OFFSET;
        Inertia {
            total_mass,
            pitch: total_mass * GYRATION_RADIUS * GYRATION_RADIUS,
            joints: [
                ARMATURE + thigh * THIGH_LEN * THIGH_LEN / 3.0 + (leg + foot) * THIGH_LEN * THIGH_LEN,
                ARMATURE + leg * LEG_LEN * LEG_LEN / 3.0 + foot * LEG_LEN * LEG_LEN,
                ARMATURE + foot * foot_len * foot_len / 12.0,
            ],
        }
    }
}

/// Positions of the kinematic chain in world coordinates.
struct Kinematics {
    hip: [f64; 2],
    knee: [f64; 2],
    ankle: [f64; 2],
    contacts: [[f64; 2]; 2],
}

/// Unit vector of a limb hanging at absolute angle `a` (0 = straight down).
fn limb_dir(a: f64) -> [f64; 2] {
    [a.sin(), -a.cos()]
}

/// Unit vector of the foot at absolute angle `a` (0 = pointing forward).
fn foot_dir(a: f64) -> [f64; 2] {
    [a.cos(), a.sin()]
}

fn add_scaled(p: [f64; 2], d: [f64; 2], s: f64) -> [f64; 2] {
    [p[0] + s * d[0], p[1] + s * d[1]]
}

/// Velocity of point `p` rotating at `omega` about `center` (counter-clockwise positive).
fn rot_vel(omega: f64, p: [f64; 2], center: [f64; 2]) -> [f64; 2] {
    [-omega * (p[1] - center[1]), omega * (p[0] - center[0])]
}

/// Torque about `center` of force `f` applied at `p`.
fn moment(p: [f64; 2], center: [f64; 2], f: [f64; 2]) -> f64 {
    (p[0] - center[0]) * f[1] - (p[1] - center[1]) * f[0]
}

pub struct CustomHopper {
    config: EnvConfig,
    masses: [f64; 4],
    inertia: Inertia,
    // Generalized coordinates: x, z, pitch, joint angles
    x: f64,
    z: f64,
    pitch: f64,
    joints: [f64; 3],
    // Generalized velocities
    vx: f64,
    vz: f64,
    pitch_vel: f64,
    joint_vels: [f64; 3],
    step_count: usize,
    rng: ChaCha8Rng,
}

impl CustomHopper {
    pub fn new(domain: Domain, seed: Option<u64>) -> Self {
        let masses = domain.masses();
        let config = EnvConfig {
            id: domain.env_id().to_string(),
            observation_space: BoxSpace::uniform(11, f32::NEG_INFINITY, f32::INFINITY),
            action_space: BoxSpace::uniform(3, -1.0, 1.0),
            max_steps: MAX_STEPS,
        };
        let mut env = CustomHopper {
            config,
            masses,
            inertia: Inertia::from_masses(&masses),
            x: 0.0,
            z: INIT_Z,
            pitch: 0.0,
            joints: [0.0; 3],
            vx: 0.0,
            vz: 0.0,
            pitch_vel: 0.0,
            joint_vels: [0.0; 3],
            step_count: 0,
            rng: seeded_rng(seed.unwrap_or(0)),
        };
        env.do_reset();
        env
    }

    fn noise(&mut self) -> f64 {
        self.rng.gen_range(-INIT_NOISE..INIT_NOISE)
    }

    fn do_reset(&mut self) -> Vec<f32> {
        self.x = self.noise();
        self.z = INIT_Z + self.noise();
        self.pitch = self.noise();
        for i in 0..3 {
            self.joints[i] = self.noise();
        }
        self.vx = self.noise();
        self.vz = self.noise();
        self.pitch_vel = self.noise();
        for i in 0..3 {
            self.joint_vels[i] = self.noise();
        }
        self.step_count = 0;
        self.get_obs()
    }

    fn get_obs(&self) -> Vec<f32> {
        let clip = |v: f64| v.clamp(-OBS_VEL_CLIP, OBS_VEL_CLIP) as f32;
        vec![
            self.z as f32,
            self.pitch as f32,
            self.joints[0] as f32,
            self.joints[1] as f32,
            self.joints[2] as f32,
            clip(self.vx),
            clip(self.vz),
            clip(self.pitch_vel),
            clip(self.joint_vels[0]),
            clip(self.joint_vels[1]),
            clip(self.joint_vels[2]),
        ]
    }

    fn kinematics(&self) -> Kinematics {
        let com = [self.x, self.z];
        let a_thigh = self.pitch + self.joints[0];
        let a_leg = a_thigh + self.joints[1];
        let a_foot = a_leg + self.joints[2];

        let hip = add_scaled(com, limb_dir(self.pitch), TORSO_HALF);
        let knee = add_scaled(hip, limb_dir(a_thigh), THIGH_LEN);
        let ankle = add_scaled(knee, limb_dir(a_leg), LEG_LEN);
        let heel = add_scaled(ankle, foot_dir(a_foot), HEEL_OFFSET);
        let toe = add_scaled(ankle, foot_dir(a_foot), TOE_OFFSET);
        Kinematics { hip, knee, ankle, contacts: [heel, toe] }
    }

    /// Velocity of a point on the foot, summing the rotation of every
    /// frame between the torso and the foot.
    fn point_velocity(&self, kin: &Kinematics, p: [f64; 2]) -> [f64; 2] {
        let com = [self.x, self.z];
        let w_pitch = rot_vel(self.pitch_vel, p, com);
        let w_thigh = rot_vel(self.joint_vels[0], p, kin.hip);
        let w_leg = rot_vel(self.joint_vels[1], p, kin.knee);
        let w_foot = rot_vel(self.joint_vels[2], p, kin.ankle);
        [
            self.vx + w_pitch[0] + w_thigh[0] + w_leg[0] + w_foot[0],
            self.vz + w_pitch[1] + w_thigh[1] + w_leg[1] + w_foot[1],
        ]
    }

    fn physics_step(&mut self, action: &[f64; 3]) {
        let kin = self.kinematics();
        let com = [self.x, self.z];

        // ── Ground contact ──
        let mut force = [0.0f64; 2];
        let mut contact_torque = 0.0;
        // Generalized contact force on thigh, leg and foot joints.
        let mut joint_reaction = [0.0f64; 3];
        let pivots = [kin.hip, kin.knee, kin.ankle];
        for &p in &kin.contacts {
            let penetration = FOOT_RADIUS - p[1];
            if penetration <= 0.0 {
                continue;
            }
            let v = self.point_velocity(&kin, p);
            let normal = (CONTACT_STIFFNESS * penetration - CONTACT_DAMPING * v[1]).max(0.0);
            let limit = FRICTION_COEF * normal;
            let tangential = (-FRICTION_DAMPING * v[0]).clamp(-limit, limit);
            let f = [tangential, normal];
            force[0] += f[0];
            force[1] += f[1];
            contact_torque += moment(p, com, f);
            for (tau, &c) in joint_reaction.iter_mut().zip(&pivots) {
                *tau += moment(p, c, f);
            }
        }

        // ── Joint motors ──
        let torques: [f64; 3] = [GEAR * action[0], GEAR * action[1], GEAR * action[2]];
        for i in 0..3 {
            let tau = torques[i] + joint_reaction[i] - JOINT_DAMPING * self.joint_vels[i];
            let alpha = tau / self.inertia.joints[i];
            self.joint_vels[i] += alpha * DT;
            self.joints[i] += self.joint_vels[i] * DT;
            let (lo, hi) = JOINT_LIMITS[i];
            if self.joints[i] < lo || self.joints[i] > hi {
                self.joints[i] = self.joints[i].clamp(lo, hi);
                self.joint_vels[i] = 0.0;
            }
        }

        // ── Torso ──
        let m = self.inertia.total_mass;
        let ax = force[0] / m;
        let az = force[1] / m - GRAVITY;
        let pitch_torque = contact_torque - HIP_REACTION * torques[0] - PITCH_DAMPING * self.pitch_vel;
        let pitch_alpha = pitch_torque / self.inertia.pitch;

        // Semi-implicit Euler
        self.vx += ax * DT;
        self.vz += az * DT;
        self.pitch_vel += pitch_alpha * DT;
        self.x += self.vx * DT;
        self.z += self.vz * DT;
        self.pitch += self.pitch_vel * DT;
    }

    /// Hopper-v3 health check on (z, pitch, rest of the state vector).
    fn is_healthy(&self) -> bool {
        let rest = [
            self.joints[0], self.joints[1], self.joints[2],
            self.vx, self.vz, self.pitch_vel,
            self.joint_vels[0], self.joint_vels[1], self.joint_vels[2],
        ];
        let finite = self.z.is_finite() && self.pitch.is_finite() && rest.iter().all(|v| v.is_finite());
        finite
            && rest.iter().all(|v| v.abs() < HEALTHY_STATE)
            && self.z > HEALTHY_Z_MIN
            && self.pitch.abs() < HEALTHY_ANGLE
    }

    fn do_step(&mut self, action: &[f64; 3]) -> StepResult {
        let x_before = self.x;
        for _ in 0..FRAME_SKIP {
            self.physics_step(action);
        }
        let dt_ctrl = DT * FRAME_SKIP as f64;

        let forward_reward = (self.x - x_before) / dt_ctrl;
        let ctrl_cost = CTRL_COST_WEIGHT * action.iter().map(|a| a * a).sum::<f64>();
        let terminated = !self.is_healthy();
        let reward = forward_reward + HEALTHY_REWARD - ctrl_cost;

        self.step_count += 1;
        let truncated = !terminated && self.step_count >= MAX_STEPS;

        StepResult {
            observation: self.get_obs(),
            reward: if reward.is_finite() { reward } else { 0.0 },
            terminated,
            truncated,
        }
    }
}

impl Environment for CustomHopper {
    fn reset(&mut self, seed: Option<u64>) -> Vec<f32> {
        if let Some(s) = seed {
            self.rng = seeded_rng(s);
        }
        self.do_reset()
    }

    fn step(&mut self, action: &[f32]) -> StepResult {
        let mut a = [0.0f64; 3];
        for (i, v) in action.iter().take(3).enumerate() {
            a[i] = (*v as f64).clamp(-1.0, 1.0);
        }
        self.do_step(&a)
    }

    fn config(&self) -> &EnvConfig { &self.config }
    fn steps(&self) -> usize { self.step_count }

    fn parameters(&self) -> Vec<f64> {
        self.masses.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EnvRegistry {
        let mut registry = EnvRegistry::new();
        register(&mut registry).unwrap();
        registry
    }

    #[test]
    fn test_hopper_reset() {
        let mut env = CustomHopper::new(Domain::Target, Some(42));
        let obs = env.reset(Some(42));
        assert_eq!(obs.len(), 11);
        assert!((obs[0] as f64 - INIT_Z).abs() <= INIT_NOISE);
        for v in &obs[1..] {
            assert!(v.abs() <= INIT_NOISE as f32);
        }
    }

    #[test]
    fn test_reset_is_seeded() {
        let mut a = CustomHopper::new(Domain::Source, None);
        let mut b = CustomHopper::new(Domain::Source, None);
        assert_eq!(a.reset(Some(7)), b.reset(Some(7)));
        assert_ne!(a.reset(Some(7)), a.reset(Some(8)));
    }

    #[test]
    fn test_variants_differ_only_in_torso_mass() {
        let source = Domain::Source.masses();
        let target = Domain::Target.masses();
        assert!((target[0] - source[0] - 1.0).abs() < 1e-12);
        assert_eq!(&source[1..], &target[1..]);

        let registry = registry();
        let env = registry.make(SOURCE_ID, None).unwrap();
        assert_eq!(env.parameters(), source.to_vec());
        assert_eq!(env.config().obs_dim(), 11);
        assert_eq!(env.config().act_dim(), 3);
    }

    #[test]
    fn test_hopper_falls_and_terminates() {
        let mut env = CustomHopper::new(Domain::Target, Some(0));
        env.reset(Some(0));
        let mut terminated = false;
        for _ in 0..MAX_STEPS {
            let result = env.step(&[1.0, 1.0, 1.0]);
            assert_eq!(result.observation.len(), 11);
            assert!(result.reward.is_finite());
            if result.terminated {
                terminated = true;
                break;
            }
        }
        assert!(terminated, "saturated torques should tip the hopper over");
    }

    #[test]
    fn test_idle_hopper_tips_over() {
        for domain in [Domain::Source, Domain::Target] {
            for seed in 0..3 {
                let mut env = CustomHopper::new(domain, Some(seed));
                env.reset(Some(seed));
                let mut ended = None;
                for _ in 0..MAX_STEPS {
                    let result = env.step(&[0.0, 0.0, 0.0]);
                    if result.done() {
                        ended = Some(result);
                        break;
                    }
                    // Still upright while it lands and settles
                    if env.steps() <= 20 {
                        assert!(result.observation[0] > 0.9, "torso sank to {}", result.observation[0]);
                    }
                }
                let result = ended.unwrap_or_else(|| panic!("{domain:?} seed {seed} stood for a whole episode"));
                assert!(result.terminated, "{domain:?} seed {seed} was truncated, not terminated");
                assert!(env.steps() > 20 && env.steps() < MAX_STEPS);
            }
        }
    }

    #[test]
    fn test_contact_friction_stops_slip() {
        let mut env = CustomHopper::new(Domain::Target, Some(0));
        env.reset(Some(0));
        // Foot flat on the ground, sliding forward at 0.5 m/s.
        let mg = env.inertia.total_mass * GRAVITY;
        env.z = TORSO_HALF + THIGH_LEN + LEG_LEN + FOOT_RADIUS - mg / (2.0 * CONTACT_STIFFNESS);
        env.x = 0.0;
        env.pitch = 0.0;
        env.joints = [0.0; 3];
        env.vx = 0.5;
        env.vz = 0.0;
        env.pitch_vel = 0.0;
        env.joint_vels = [0.0; 3];

        for _ in 0..10 {
            env.step(&[0.0, 0.0, 0.0]);
        }
        let kin = env.kinematics();
        let mut touching = 0;
        for &p in &kin.contacts {
            if p[1] < FOOT_RADIUS {
                touching += 1;
                let slip = env.point_velocity(&kin, p)[0];
                assert!(slip.abs() < 0.1, "contact still slipping at {slip}");
            }
        }
        assert!(touching > 0);
    }

    #[test]
    fn test_observation_velocities_clipped() {
        let mut env = CustomHopper::new(Domain::Target, Some(1));
        env.reset(Some(1));
        env.joint_vels = [50.0, -50.0, 0.0];
        let obs = env.get_obs();
        assert_eq!(obs[8], 10.0);
        assert_eq!(obs[9], -10.0);
    }

    #[test]
    fn test_unhealthy_pitch_terminates() {
        let mut env = CustomHopper::new(Domain::Target, Some(1));
        env.reset(Some(1));
        env.pitch = 0.5;
        let result = env.step(&[0.0, 0.0, 0.0]);
        assert!(result.terminated);
        assert!(!result.truncated);
    }
}
