pub mod ansi;
pub mod launcher;
pub mod poller;
pub mod relay;
pub mod worker;
