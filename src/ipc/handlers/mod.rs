pub mod calc;
pub mod core;
pub mod courses;
pub mod marks;
pub mod regulations;
pub mod setup;
pub mod status_grades;
pub mod students;
