#![deny(dead_code)]
#![deny(unused_imports)]

//! Two-class expression subtyping: a comparative study of feature-selection
//! strategies and classifier families evaluated on held-out samples.
//!
//! The pipeline threads immutable values from stage to stage:
//! `Dataset -> Split -> FeatureSet -> Selection -> FittedModel -> Evaluation`.

pub mod config;
pub mod data;
pub mod embed;
pub mod evaluate;
pub mod filter;
pub mod grid;
pub mod kernel;
pub mod linalg;
pub mod logistic;
pub mod model;
pub mod partition;
pub mod pipeline;
pub mod report;
pub mod select;
pub mod synthetic;
