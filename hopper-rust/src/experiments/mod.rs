//! Hopper sim-to-sim transfer experiments in pure Rust.
//!
//! Architecture:
//! - `env`: Environment trait, spaces, id registry
//! - `hopper`: planar hopper with source/target mass variants
//! - `vec_env`: parallel environment copies with auto-reset
//! - `policy`: MLP actor/critic and the saved policy artifact
//! - `ppo`: PPO trainer
//! - `eval`: episode-based evaluation
//! - `optim`: CMA-ES
//! - `transfer`: source → target protocol
//! - `tuning`: trial-based hyperparameter search
//! - `replay`: deterministic rollout of a saved artifact

pub mod env;
pub mod eval;
pub mod hopper;
pub mod optim;
pub mod policy;
pub mod ppo;
pub mod replay;
pub mod transfer;
pub mod tuning;
pub mod vec_env;
