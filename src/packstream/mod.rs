//! Partial PackStream codec.
//!
//! The proxy only inspects message payloads — it never materialises full
//! result sets — so this is deliberately not a complete codec. The decoder
//! covers the tags appearing in HELLO metadata, SUCCESS metadata and the
//! routing-query records; the encoder covers what the outbound query client
//! needs to build HELLO/RUN/PULL payloads. Grow the supported tag set only
//! when a concrete new inspection need arises.

pub mod decode;
pub mod encode;
pub mod marker;

pub use decode::{
    decode_value, parse_string, parse_tiny_array, parse_tiny_int, parse_tiny_map,
    parse_tiny_string, Value,
};
pub use encode::encode_value;
