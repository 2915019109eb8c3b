//! Key material: generation of raw keys and their lookup hashes.

pub mod digest;
pub mod keygen;
