pub mod collection;
pub mod directory;
pub mod guardian;
pub mod meal;
pub mod notification;
pub mod selection;
pub mod staff;
pub mod student;
