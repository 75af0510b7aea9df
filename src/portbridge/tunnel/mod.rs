pub mod client;
pub mod demux;
pub mod host;
pub mod listener;
pub mod multiplexer;
pub mod protocol;
pub mod rendezvous;
pub mod table;
pub mod transport;
