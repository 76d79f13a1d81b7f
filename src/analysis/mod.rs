pub mod callsite;
pub mod dis;
pub mod functions;
pub mod prologue;
