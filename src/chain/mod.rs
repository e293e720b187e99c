pub mod events;
pub mod reader;

pub use events::{DecodedEvent, EventArgs, UndecodedLog};
pub use reader::{ChainReader, CONDITIONAL_TOKENS_EVENTS, CTF_EXCHANGE_EVENTS};
