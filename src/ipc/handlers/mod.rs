pub mod accounts;
pub mod activity;
pub mod admin;
pub mod attendance;
pub mod consultations;
pub mod core;
pub mod exams;
pub mod expenses;
pub mod organizations;
pub mod realtime;
pub mod seats;
pub mod setup;
pub mod students;
pub mod teachers;
pub mod waitlists;
