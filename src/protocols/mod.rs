pub mod egts;
pub mod wialon;
