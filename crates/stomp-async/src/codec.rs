//! `tokio_util` codec adapter over the incremental protocol parser.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use stomp_protocol::error::StompError;
use stomp_protocol::frame::Transmission;
use stomp_protocol::parser::Parser;
use stomp_protocol::spec::Version;

/// Frames the byte stream for the event-driven client.
///
/// Decoding hands every chunk to the [`Parser`]; encoding serializes a
/// [`Transmission`] (a heart-beat encodes to a single newline).
#[derive(Debug)]
pub struct ClientCodec {
    parser: Parser,
}

impl ClientCodec {
    pub fn new(version: Version) -> ClientCodec {
        ClientCodec {
            parser: Parser::new(version),
        }
    }

    /// Switch the parser grammar after version negotiation.
    pub fn set_version(&mut self, version: Version) {
        self.parser.set_version(version);
    }
}

impl Decoder for ClientCodec {
    type Item = Transmission;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Transmission>, StompError> {
        if !src.is_empty() {
            let bytes = src.split();
            self.parser.push(&bytes)?;
        }
        Ok(self.parser.get())
    }
}

impl Encoder<Transmission> for ClientCodec {
    type Error = StompError;

    fn encode(&mut self, item: Transmission, dst: &mut BytesMut) -> Result<(), StompError> {
        dst.extend_from_slice(&item.serialize()?);
        Ok(())
    }
}
