//! The Cosmos control protocol.
//!
//! The generated code in this crate is committed so that the protocol ships
//! with the library; regenerate it with the `genproto` example after changing
//! `proto/cosmos.proto`.

mod cosmos;

pub type AgentMessagePayload = cosmos::agent_message::Payload;
pub type ControllerMessagePayload = cosmos::controller_message::Payload;

pub use cosmos::cosmos_controller_client::CosmosControllerClient;
pub use cosmos::cosmos_controller_server::{CosmosController, CosmosControllerServer};
pub use cosmos::*;
