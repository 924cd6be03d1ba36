pub mod backend;
pub mod config;
pub mod connection;
pub mod demo_backend;
pub mod dispatcher;
pub mod drawing;
pub mod handshake;
pub mod instruction;
pub mod layer;
pub mod parser;
pub mod socket;
pub mod status;
pub mod stream;

pub use backend::{Backend, BackendFactory, BackendRegistry};
pub use config::GuacdConfig;
pub use connection::{run_connection, ConnectionState};
pub use handshake::{run_handshake, HandshakeOutcome};
pub use instruction::Instruction;
pub use status::{GuacError, GuacResult, Status};
