#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod accumulate;
pub mod blocked;
pub mod collinear;
pub mod config;
pub mod factor;
pub mod layout;
pub mod matrix;
pub mod schedule;
pub mod solve;
pub mod types;

pub use accumulate::{GramRow, RowValues, WeightedGram, accumulate_gram};
pub use blocked::{BlockParams, InPlaceCholesky};
pub use collinear::{CollinearCholesky, qr_cholesky};
pub use config::{BacksolveStrategy, ConfigError, FactorConfig, SolveConfig};
pub use factor::{CholeskyFactor, RegularizedCholesky, cholesky, regularized_cholesky};
pub use layout::TriangularRows;
pub use matrix::SymmetricBlockMatrix;
pub use types::{GramError, GramShape};
