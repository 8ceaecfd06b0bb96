//! Linear mixed models fitted by REML, and the heritability screen built on them.

pub mod heritability;
pub mod reml;
