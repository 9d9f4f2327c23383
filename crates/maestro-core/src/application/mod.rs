/// Environment manager and event demultiplexer
pub mod manager;
