pub mod catalog;
pub mod process_tree;
pub mod supervisor;
pub mod task_manager;
