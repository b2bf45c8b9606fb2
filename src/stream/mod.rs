pub mod anthropic;
pub mod events;
pub mod parsers;
pub mod thinking;
pub mod tool_recovery;
