pub mod channel_meta;
pub mod participant;
