//! # ct-types
//!
//! Core data model for SysID+MPC pipeline tuning: configuration spaces,
//! trajectories, the model/controller/pipeline collaborator traits, the
//! closed-loop simulation primitive, cost distributions and the shared error
//! taxonomy.

pub mod control;
pub mod distribution;
pub mod errors;
pub mod float_serde;
pub mod model;
pub mod simulate;
pub mod space;
pub mod trajectory;

pub use control::*;
pub use distribution::*;
pub use errors::*;
pub use model::*;
pub use simulate::*;
pub use space::*;
pub use trajectory::*;
