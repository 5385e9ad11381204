pub mod enrollment;
pub mod legacy;
