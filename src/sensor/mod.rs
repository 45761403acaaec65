pub mod decoder;

pub use decoder::{decode_df5, decode_hex_payload};
