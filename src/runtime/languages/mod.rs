pub mod javascript;
pub mod python;
pub mod shell;
