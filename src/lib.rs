//! Space-filling-curve octrees and distributed domain decomposition for particle simulations.
//!
//! Particles are sorted along a Morton curve. A global cornerstone octree, identical on all
//! ranks, is built from the particle keys and its leaves are split into one contiguous range
//! per rank. A [domain::Domain] moves particles to their owning rank and keeps halo copies of
//! the neighbouring particles up to date.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod assignment;
pub mod constants;
pub mod cornerstone;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod geometry;
pub mod global;
pub mod halos;
pub mod layout;
pub mod morton;
pub mod octree;
pub mod tools;
pub mod vtk;
