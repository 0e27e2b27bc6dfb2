pub mod lstm;
