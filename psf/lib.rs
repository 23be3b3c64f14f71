#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod amplitude;
pub mod basis;
pub mod chromatic;
pub mod data;
pub mod estimate;
pub mod fitter;
pub mod model;
pub mod shape;
pub mod synthetic;
pub mod transverse;
pub mod types;
pub mod workspace;
