pub mod approval;
pub mod entity;
