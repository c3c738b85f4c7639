pub mod activity_log;
pub mod catalog;
pub mod collection;
pub mod dingtalk;
pub mod directory;
pub mod guardians;
pub mod identity;
pub mod mapping;
pub mod notifications;
pub mod scheduler;
pub mod selection;
pub mod staff;
pub mod students;
pub mod tasks;
pub mod token;
